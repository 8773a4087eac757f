//! Control events and the thread safe handle control surfaces send them with.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use basedrop::{Handle, Shared};
use crossbeam_queue::ArrayQueue;

use crate::{
    sample_buffer::SampleBuffer,
    scheduler::GrainParameters,
    status::{EngineStats, StatusBoard},
    voice::{PlaybackMode, VoiceConfig},
    Error, VoiceId,
};

// -------------------------------------------------------------------------------------------------

/// Events which control the engine from other threads.
///
/// Events get applied by the render thread at the start of the next audio callback.
#[derive(Clone)]
pub enum ControlEvent {
    /// A tempo tap at the given time, relative to the sender's creation.
    TapTempo(Duration),
    /// Set the clock's tempo.
    SetBpm(f64),
    /// Start or retrigger a voice.
    TriggerVoice(VoiceId),
    StopVoice(VoiceId),
    MuteVoice(VoiceId),
    UnmuteVoice(VoiceId),
    /// Set a voice's pitch shift in semitones.
    SetPitch(VoiceId, f32),
    SetGrainParams(VoiceId, GrainParameters),
    /// Align a voice's grain spawns to the next beat or bar.
    ResyncVoice(VoiceId),
    SetVoiceGain(VoiceId, f32),
    SetVoicePan(VoiceId, f32),
    /// Move a voice to another output channel pair.
    SetVoiceRoute(VoiceId, usize),
    SetPlaybackMode(VoiceId, PlaybackMode),
    /// Replace a voice's loop buffer. Stops the voice.
    AssignBuffer {
        voice: VoiceId,
        buffer: Shared<SampleBuffer>,
        loop_bpm: f64,
    },
    /// Stop all voices when any voice is playing, else trigger all voices.
    TransportToggle,
    StopAll,
}

impl fmt::Debug for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TapTempo(timestamp) => f.debug_tuple("TapTempo").field(timestamp).finish(),
            Self::SetBpm(bpm) => f.debug_tuple("SetBpm").field(bpm).finish(),
            Self::TriggerVoice(id) => f.debug_tuple("TriggerVoice").field(id).finish(),
            Self::StopVoice(id) => f.debug_tuple("StopVoice").field(id).finish(),
            Self::MuteVoice(id) => f.debug_tuple("MuteVoice").field(id).finish(),
            Self::UnmuteVoice(id) => f.debug_tuple("UnmuteVoice").field(id).finish(),
            Self::SetPitch(id, semitones) => {
                f.debug_tuple("SetPitch").field(id).field(semitones).finish()
            }
            Self::SetGrainParams(id, parameters) => f
                .debug_tuple("SetGrainParams")
                .field(id)
                .field(parameters)
                .finish(),
            Self::ResyncVoice(id) => f.debug_tuple("ResyncVoice").field(id).finish(),
            Self::SetVoiceGain(id, gain) => {
                f.debug_tuple("SetVoiceGain").field(id).field(gain).finish()
            }
            Self::SetVoicePan(id, pan) => f.debug_tuple("SetVoicePan").field(id).field(pan).finish(),
            Self::SetVoiceRoute(id, route) => {
                f.debug_tuple("SetVoiceRoute").field(id).field(route).finish()
            }
            Self::SetPlaybackMode(id, mode) => {
                f.debug_tuple("SetPlaybackMode").field(id).field(mode).finish()
            }
            // buffers are summarized: their samples would flood the output
            Self::AssignBuffer {
                voice,
                buffer,
                loop_bpm,
            } => f
                .debug_struct("AssignBuffer")
                .field("voice", voice)
                .field("frame_count", &buffer.frame_count())
                .field("loop_bpm", loop_bpm)
                .finish(),
            Self::TransportToggle => f.write_str("TransportToggle"),
            Self::StopAll => f.write_str("StopAll"),
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Sends [`ControlEvent`]s to the engine.
///
/// Senders are `Send` and `Sync` and can be cloned for every control thread. Sending never
/// blocks: when the event queue is full, the oldest unread event gets dropped.
#[derive(Clone)]
pub struct ControlSender {
    queue: Arc<ArrayQueue<ControlEvent>>,
    status: Arc<StatusBoard>,
    collector_handle: Handle,
    epoch: Instant,
}

impl ControlSender {
    pub(crate) fn new(
        queue: Arc<ArrayQueue<ControlEvent>>,
        status: Arc<StatusBoard>,
        collector_handle: Handle,
    ) -> Self {
        Self {
            queue,
            status,
            collector_handle,
            epoch: Instant::now(),
        }
    }

    /// Time since the sender got created. Used to timestamp taps.
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Enqueue a raw event.
    pub fn send(&self, event: ControlEvent) {
        if self.queue.force_push(event).is_some() {
            EngineStats::increment(&self.status.stats().dropped_events, 1);
            log::warn!("Control event queue is full: dropped the oldest event");
        }
    }

    /// Enqueue a raw event, unless the event queue is full.
    pub fn try_send(&self, event: ControlEvent) -> Result<(), Error> {
        self.queue.push(event).map_err(|event| {
            Error::SendError(format!("Control event queue is full, can't send {event:?}"))
        })
    }

    /// Tap the tempo now.
    pub fn tap(&self) {
        self.tap_at(self.elapsed());
    }

    /// Tap the tempo at the given time, relative to [`Self::elapsed`].
    pub fn tap_at(&self, timestamp: Duration) {
        self.send(ControlEvent::TapTempo(timestamp));
    }

    pub fn set_bpm(&self, bpm: f64) -> Result<(), Error> {
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(Error::ConfigError(format!("Invalid tempo: {bpm}")));
        }
        self.send(ControlEvent::SetBpm(bpm));
        Ok(())
    }

    pub fn trigger(&self, voice: VoiceId) {
        self.send(ControlEvent::TriggerVoice(voice));
    }

    pub fn stop(&self, voice: VoiceId) {
        self.send(ControlEvent::StopVoice(voice));
    }

    pub fn mute(&self, voice: VoiceId) {
        self.send(ControlEvent::MuteVoice(voice));
    }

    pub fn unmute(&self, voice: VoiceId) {
        self.send(ControlEvent::UnmuteVoice(voice));
    }

    pub fn resync(&self, voice: VoiceId) {
        self.send(ControlEvent::ResyncVoice(voice));
    }

    pub fn set_pitch(&self, voice: VoiceId, semitones: f32) -> Result<(), Error> {
        GrainParameters::validate_pitch(semitones)?;
        self.send(ControlEvent::SetPitch(voice, semitones));
        Ok(())
    }

    /// Set new grain parameters. Invalid parameters are rejected and never reach the engine.
    pub fn set_grain_params(
        &self,
        voice: VoiceId,
        parameters: GrainParameters,
    ) -> Result<(), Error> {
        parameters.validate()?;
        self.send(ControlEvent::SetGrainParams(voice, parameters));
        Ok(())
    }

    pub fn set_gain(&self, voice: VoiceId, gain: f32) -> Result<(), Error> {
        VoiceConfig::validate_gain(gain)?;
        self.send(ControlEvent::SetVoiceGain(voice, gain));
        Ok(())
    }

    pub fn set_pan(&self, voice: VoiceId, pan: f32) -> Result<(), Error> {
        VoiceConfig::validate_pan(pan)?;
        self.send(ControlEvent::SetVoicePan(voice, pan));
        Ok(())
    }

    pub fn set_route(&self, voice: VoiceId, route: usize) {
        self.send(ControlEvent::SetVoiceRoute(voice, route));
    }

    pub fn set_playback_mode(&self, voice: VoiceId, mode: PlaybackMode) {
        self.send(ControlEvent::SetPlaybackMode(voice, mode));
    }

    /// Hand a decoded loop buffer to a voice.
    pub fn assign_buffer(
        &self,
        voice: VoiceId,
        buffer: SampleBuffer,
        loop_bpm: f64,
    ) -> Result<(), Error> {
        VoiceConfig::validate_loop_bpm(loop_bpm)?;
        let buffer = Shared::new(&self.collector_handle, buffer);
        self.send(ControlEvent::AssignBuffer {
            voice,
            buffer,
            loop_bpm,
        });
        Ok(())
    }

    pub fn transport_toggle(&self) {
        self.send(ControlEvent::TransportToggle);
    }

    pub fn stop_all(&self) {
        self.send(ControlEvent::StopAll);
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use basedrop::Collector;

    use super::*;

    fn sender(capacity: usize) -> (Collector, ControlSender, Arc<ArrayQueue<ControlEvent>>) {
        let collector = Collector::new();
        let queue = Arc::new(ArrayQueue::new(capacity));
        let status = Arc::new(StatusBoard::new(4, 16));
        let sender = ControlSender::new(Arc::clone(&queue), status, collector.handle());
        (collector, sender, queue)
    }

    #[test]
    fn overflow_drops_oldest() {
        let (_collector, sender, queue) = sender(2);
        sender.trigger(0);
        sender.trigger(1);
        sender.trigger(2);
        let dropped_events = &sender.status.stats().dropped_events;
        assert_eq!(dropped_events.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(matches!(queue.pop(), Some(ControlEvent::TriggerVoice(1))));
        assert!(matches!(queue.pop(), Some(ControlEvent::TriggerVoice(2))));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn try_send_keeps_queued_events() {
        let (_collector, sender, queue) = sender(1);
        assert!(sender.try_send(ControlEvent::StopAll).is_ok());
        assert!(matches!(
            sender.try_send(ControlEvent::TransportToggle),
            Err(Error::SendError(_))
        ));
        assert!(matches!(queue.pop(), Some(ControlEvent::StopAll)));
        let dropped_events = &sender.status.stats().dropped_events;
        assert_eq!(dropped_events.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn rejects_invalid_values() {
        let (_collector, sender, queue) = sender(8);
        let invalid = GrainParameters {
            overlap: 2.0,
            ..GrainParameters::default()
        };
        assert!(sender.set_grain_params(0, invalid).is_err());
        assert!(sender.set_pitch(0, 30.0).is_err());
        assert!(sender.set_pan(0, -2.0).is_err());
        assert!(sender.set_bpm(f64::NAN).is_err());
        let buffer = SampleBuffer::from_mono(vec![0.0; 16], 48000).unwrap();
        assert!(sender.assign_buffer(0, buffer, 0.0).is_err());
        assert!(queue.is_empty());

        assert!(sender.set_pitch(0, -12.0).is_ok());
        assert!(matches!(queue.pop(), Some(ControlEvent::SetPitch(0, p)) if p == -12.0));
    }

    #[test]
    fn taps_are_timestamped_when_sent() {
        let (_collector, sender, queue) = sender(8);
        sender.tap_at(Duration::from_millis(500));
        sender.tap();
        assert!(matches!(
            queue.pop(),
            Some(ControlEvent::TapTempo(t)) if t == Duration::from_millis(500)
        ));
        assert!(matches!(
            queue.pop(),
            Some(ControlEvent::TapTempo(t)) if t < Duration::from_secs(60)
        ));
    }
}
