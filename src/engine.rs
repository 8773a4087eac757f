//! The real-time render engine: owns clock, voices and grains and mixes them once per audio
//! callback.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use basedrop::{Collector, Shared, SharedCell};
use crossbeam_queue::ArrayQueue;

use crate::{
    clock::{Clock, TapOutcome, TapTempoConfig},
    controller::Controller,
    error::{EventRejection, RenderFault},
    event::{ControlEvent, ControlSender},
    grain::pool::GrainPool,
    sample_buffer::SampleBuffer,
    scheduler::{GrainParameters, GrainScheduler, SpawnList},
    settings::Settings,
    status::{EngineStats, StatusBoard},
    utils::{
        assert_no_alloc,
        buffer::{clear_buffer, sanitize_buffer},
        permit_alloc,
    },
    voice::{Voice, VoiceConfig, VoiceRenderContext},
    Error, VoiceId,
};

// -------------------------------------------------------------------------------------------------

/// Max number of grains a single voice may spawn within one scheduler tick.
const MAX_SPAWNS_PER_TICK: usize = 256;

// -------------------------------------------------------------------------------------------------

/// Construction time engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Output sample rate, as provided by the audio driver.
    pub sample_rate: u32,
    /// Number of interleaved output channels.
    pub channel_count: usize,
    /// Max number of frames the audio driver requests per callback.
    pub max_block_frames: usize,
    /// Max number of concurrently playing grains across all voices.
    pub grain_pool_capacity: usize,
    pub max_voices: usize,
    /// Capacity of the control event queue.
    pub event_queue_capacity: usize,
    pub initial_bpm: f64,
    pub beats_per_bar: u32,
    pub tap_tempo: TapTempoConfig,
    /// Initial live settings.
    pub settings: Settings,
    /// Seed for the voice's grain schedulers. Randomly seeded when `None`.
    pub random_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channel_count: 2,
            max_block_frames: 1024,
            grain_pool_capacity: 256,
            max_voices: 16,
            event_queue_capacity: 256,
            initial_bpm: 120.0,
            beats_per_bar: 4,
            tap_tempo: TapTempoConfig::default(),
            settings: Settings::default(),
            random_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.sample_rate == 0 {
            return Err(Error::ConfigError("Invalid sample rate".to_string()));
        }
        if self.channel_count == 0 {
            return Err(Error::ConfigError(
                "Engine needs at least one output channel".to_string(),
            ));
        }
        if self.max_block_frames == 0 {
            return Err(Error::ConfigError(
                "Max block frames must be > 0".to_string(),
            ));
        }
        if self.grain_pool_capacity == 0 || self.max_voices == 0 || self.event_queue_capacity == 0
        {
            return Err(Error::ConfigError(
                "Grain pool, voice and event queue capacities must be > 0".to_string(),
            ));
        }
        self.tap_tempo.validate()?;
        self.settings.validate()
    }
}

// -------------------------------------------------------------------------------------------------

/// Granular loop engine.
///
/// The engine gets created together with a [`Controller`], then moved into the audio driver's
/// callback, which calls [`Engine::process`] or [`Engine::render_callback`] once per audio
/// period. Rendering never allocates, locks or blocks: the engine talks to the rest of the
/// application via the controller's lock free event queue, settings snapshots and status board.
pub struct Engine {
    config: EngineConfig,
    clock: Clock,
    voices: Vec<Voice>,
    pool: GrainPool,
    spawns: SpawnList,
    event_queue: Arc<ArrayQueue<ControlEvent>>,
    settings: Arc<SharedCell<Settings>>,
    status: Arc<StatusBoard>,
    voice_buffer: Vec<f32>,
    output_buffer: Vec<f32>,
    reported_evictions: u64,
    // queued events which already got counted as deferred
    counted_deferred_events: usize,
}

impl Engine {
    /// Create a new engine and the controller to control it with.
    pub fn new(config: EngineConfig) -> Result<(Self, Controller), Error> {
        config.validate()?;
        let clock = Clock::new(
            config.sample_rate,
            config.initial_bpm,
            config.beats_per_bar,
            config.tap_tempo,
        )?;

        let collector = Collector::new();
        let settings = Arc::new(SharedCell::new(Shared::new(
            &collector.handle(),
            config.settings,
        )));
        let event_queue = Arc::new(ArrayQueue::new(config.event_queue_capacity));
        let status = Arc::new(StatusBoard::new(
            config.max_voices,
            config.grain_pool_capacity,
        ));
        status.publish_clock(
            clock.bpm(),
            clock.beat_position(),
            clock.beats_per_bar(),
            clock.total_frames(),
        );
        let sender = ControlSender::new(
            Arc::clone(&event_queue),
            Arc::clone(&status),
            collector.handle(),
        );
        let controller = Controller::new(
            collector,
            Arc::clone(&settings),
            config.settings,
            Arc::clone(&status),
            sender,
        );

        log::info!(
            "Created grain engine: {} Hz, {} channels, {} grains, {} voices",
            config.sample_rate,
            config.channel_count,
            config.grain_pool_capacity,
            config.max_voices
        );
        let engine = Self {
            clock,
            voices: Vec::with_capacity(config.max_voices),
            pool: GrainPool::new(config.grain_pool_capacity),
            spawns: SpawnList::with_capacity(MAX_SPAWNS_PER_TICK),
            event_queue,
            settings,
            status,
            voice_buffer: vec![0.0; config.max_block_frames * 2],
            output_buffer: vec![0.0; config.max_block_frames * config.channel_count],
            reported_evictions: 0,
            counted_deferred_events: 0,
            config,
        };
        Ok((engine, controller))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voice(&self, id: VoiceId) -> Result<&Voice, Error> {
        self.voices.get(id).ok_or(Error::VoiceNotFound(id))
    }

    /// Add a new voice. Use [`Controller::share_buffer`] to create shared buffers.
    ///
    /// Voices should be added before the engine gets moved to the audio thread. Voices without
    /// buffers can get one assigned later on via [`ControlSender::assign_buffer`].
    pub fn add_voice(
        &mut self,
        config: VoiceConfig,
        buffer: Option<Shared<SampleBuffer>>,
    ) -> Result<VoiceId, Error> {
        if self.voices.len() >= self.config.max_voices {
            return Err(Error::ResourceExhausted);
        }
        config.validate()?;
        VoiceConfig::validate_route(config.output_route, self.config.channel_count)?;
        let id = self.voices.len();
        let sample_rate = self.config.sample_rate;
        let scheduler = match self.config.random_seed {
            Some(seed) => GrainScheduler::with_seed(sample_rate, seed.wrapping_add(id as u64)),
            None => GrainScheduler::new(sample_rate),
        };
        log::debug!(
            "Adding voice {id} for loop '{}' ({} BPM)",
            config.loop_id,
            config.loop_bpm
        );
        self.voices
            .push(Voice::new(id, config, buffer, scheduler, sample_rate));
        self.status.set_voice_count(self.voices.len());
        Ok(id)
    }

    /// Render the given interleaved output buffer, which has the engine's channel layout.
    /// Buffers larger than the max block size get rendered in multiple blocks.
    ///
    /// Returns the number of rendered frames.
    pub fn process(&mut self, output: &mut [f32]) -> usize {
        let channel_count = self.config.channel_count;
        debug_assert!(
            output.len() % channel_count == 0,
            "Output buffer size must be a multiple of the channel count"
        );
        let block_len = self.config.max_block_frames * channel_count;
        for block in output.chunks_mut(block_len) {
            assert_no_alloc(|| self.process_block(block));
        }
        output.len() / channel_count
    }

    /// Render `frame_count` frames into the engine's internal output buffer and return it.
    ///
    /// `frame_count` gets clamped to the configured max block size.
    pub fn render_callback(&mut self, frame_count: usize) -> &[f32] {
        debug_assert!(
            frame_count <= self.config.max_block_frames,
            "Requested more frames than the configured max block size"
        );
        let len = frame_count.min(self.config.max_block_frames) * self.config.channel_count;
        let mut output = std::mem::take(&mut self.output_buffer);
        assert_no_alloc(|| self.process_block(&mut output[..len]));
        self.output_buffer = output;
        &self.output_buffer[..len]
    }

    fn process_block(&mut self, output: &mut [f32]) {
        let start_time = Instant::now();
        let channel_count = self.config.channel_count;
        let frame_count = output.len() / channel_count;

        // pick up the latest settings snapshot and apply pending control events
        let settings = self.settings.get();
        self.apply_events(&settings);

        let clock = self.clock.state();
        self.clock.advance(frame_count);

        clear_buffer(output);
        let Self {
            voices,
            pool,
            spawns,
            voice_buffer,
            status,
            ..
        } = self;
        let voice_buffer = &mut voice_buffer[..frame_count * 2];
        for voice in voices.iter_mut() {
            if voice.is_idle(pool) {
                status.publish_voice(voice, 0);
                continue;
            }
            clear_buffer(voice_buffer);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut context = VoiceRenderContext {
                    pool: &mut *pool,
                    spawns: &mut *spawns,
                    settings: &*settings,
                    clock: &clock,
                };
                voice.render(&mut context, voice_buffer)
            }));
            match result {
                Ok(Ok(())) => {
                    mix_voice(
                        output,
                        channel_count,
                        voice_buffer,
                        voice.config().output_route,
                    );
                }
                Ok(Err(fault)) => {
                    EngineStats::increment(&status.stats().render_faults, 1);
                    if fault == RenderFault::BufferUnavailable {
                        permit_alloc(|| {
                            log::warn!("Voice {} stopped: {fault}", voice.id());
                        });
                    }
                }
                Err(panic) => {
                    EngineStats::increment(&status.stats().render_faults, 1);
                    permit_alloc(|| {
                        log::error!(
                            "Voice {} stopped: {}: {}",
                            voice.id(),
                            RenderFault::Panicked,
                            panic_message::panic_message(&panic)
                        );
                        drop(panic);
                    });
                    pool.release_voice(voice.id());
                    voice.stop();
                }
            }
            status.publish_voice(voice, pool.active_count_of(voice.id()));
        }
        pool.release_finished();

        if sanitize_buffer(output) {
            EngineStats::increment(&self.status.stats().render_faults, 1);
        }

        let evictions = self.pool.evictions();
        EngineStats::increment(
            &self.status.stats().evicted_grains,
            evictions - self.reported_evictions,
        );
        self.reported_evictions = evictions;

        self.status.publish_clock(
            self.clock.bpm(),
            self.clock.beat_position(),
            self.clock.beats_per_bar(),
            self.clock.total_frames(),
        );
        self.status
            .publish_grains(self.pool.active_count(), settings.density_scale);
        self.status
            .load()
            .record(start_time.elapsed(), frame_count, self.config.sample_rate);
    }

    fn apply_events(&mut self, settings: &Settings) {
        let budget = settings.max_events_per_callback;
        let mut applied = 0;
        while applied < budget {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            applied += 1;
            if let Err(rejection) = self.apply_event(event) {
                EngineStats::increment(&self.status.stats().rejected_events, 1);
                permit_alloc(|| log::warn!("Rejected control event: {rejection}"));
            }
        }
        // deferred events stay at the front of the queue: count each of them only once
        let still_counted = self.counted_deferred_events.saturating_sub(applied);
        let remaining = if applied < budget {
            0
        } else {
            self.event_queue.len()
        };
        if remaining > still_counted {
            EngineStats::increment(
                &self.status.stats().deferred_events,
                (remaining - still_counted) as u64,
            );
        }
        self.counted_deferred_events = remaining;
    }

    fn apply_event(&mut self, event: ControlEvent) -> Result<(), EventRejection> {
        use EventRejection::InvalidValue;
        match event {
            ControlEvent::TapTempo(timestamp) => {
                if self.clock.on_tap(timestamp) == TapOutcome::Trigger {
                    self.toggle_transport();
                }
            }
            ControlEvent::SetBpm(bpm) => {
                if !self.clock.is_valid_bpm(bpm) {
                    return Err(InvalidValue("Tempo out of range"));
                }
                self.clock.apply_bpm(bpm);
            }
            ControlEvent::TriggerVoice(id) => {
                let voice = self
                    .voices
                    .get_mut(id)
                    .ok_or(EventRejection::VoiceNotFound(id))?;
                voice
                    .trigger(&self.clock)
                    .map_err(|_| EventRejection::BufferUnavailable(id))?;
            }
            ControlEvent::StopVoice(id) => self.voice_mut(id)?.stop(),
            ControlEvent::MuteVoice(id) => self.voice_mut(id)?.mute(),
            ControlEvent::UnmuteVoice(id) => self.voice_mut(id)?.unmute(),
            ControlEvent::SetPitch(id, semitones) => {
                let voice = self.voice_mut(id)?;
                if !GrainParameters::is_valid_pitch(semitones) {
                    return Err(InvalidValue("Pitch shift out of range"));
                }
                voice.set_pitch(semitones);
            }
            ControlEvent::SetGrainParams(id, parameters) => {
                let voice = self.voice_mut(id)?;
                if let Some(reason) = parameters.invalid_reason() {
                    return Err(InvalidValue(reason));
                }
                voice.set_grain_parameters(parameters);
            }
            ControlEvent::ResyncVoice(id) => {
                let voice = self
                    .voices
                    .get_mut(id)
                    .ok_or(EventRejection::VoiceNotFound(id))?;
                voice.resync(&self.clock);
            }
            ControlEvent::SetVoiceGain(id, gain) => {
                let voice = self.voice_mut(id)?;
                if !VoiceConfig::is_valid_gain(gain) {
                    return Err(InvalidValue("Voice gain out of range"));
                }
                voice.set_gain(gain);
            }
            ControlEvent::SetVoicePan(id, pan) => {
                let voice = self.voice_mut(id)?;
                if !VoiceConfig::is_valid_pan(pan) {
                    return Err(InvalidValue("Voice panning out of range"));
                }
                voice.set_pan(pan);
            }
            ControlEvent::SetVoiceRoute(id, route) => {
                let channel_count = self.config.channel_count;
                let voice = self.voice_mut(id)?;
                if !VoiceConfig::is_valid_route(route, channel_count) {
                    return Err(InvalidValue("Output route does not exist"));
                }
                voice.set_route(route);
            }
            ControlEvent::SetPlaybackMode(id, mode) => self.voice_mut(id)?.set_playback_mode(mode),
            ControlEvent::AssignBuffer {
                voice: id,
                buffer,
                loop_bpm,
            } => {
                let voice = self
                    .voices
                    .get_mut(id)
                    .ok_or(EventRejection::VoiceNotFound(id))?;
                if !VoiceConfig::is_valid_loop_bpm(loop_bpm) {
                    return Err(InvalidValue("Loop tempo must be > 0 BPM"));
                }
                // grains read the voice's current buffer: they can't outlive it
                self.pool.release_voice(id);
                // the previous buffer gets freed by the controller's collector
                voice.assign_buffer(buffer, loop_bpm);
            }
            ControlEvent::TransportToggle => self.toggle_transport(),
            ControlEvent::StopAll => self.voices.iter_mut().for_each(Voice::stop),
        }
        Ok(())
    }

    fn voice_mut(&mut self, id: VoiceId) -> Result<&mut Voice, EventRejection> {
        self.voices
            .get_mut(id)
            .ok_or(EventRejection::VoiceNotFound(id))
    }

    /// Stop all voices when any voice is playing, else trigger all voices which have a buffer.
    fn toggle_transport(&mut self) {
        if self.voices.iter().any(Voice::is_active) {
            self.voices.iter_mut().for_each(Voice::stop);
        } else {
            for voice in &mut self.voices {
                if voice.buffer().is_some() {
                    // can't fail with a buffer
                    let _ = voice.trigger(&self.clock);
                }
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Add a stereo voice buffer to the given output channel pair of an interleaved output buffer.
/// Mono outputs get a downmix.
fn mix_voice(output: &mut [f32], channel_count: usize, voice_buffer: &[f32], route: usize) {
    if channel_count == 1 {
        for (o, frame) in output.iter_mut().zip(voice_buffer.chunks_exact(2)) {
            *o += (frame[0] + frame[1]) * 0.5;
        }
    } else {
        let offset = route * 2;
        debug_assert!(offset + 1 < channel_count, "Invalid output route");
        for (o, frame) in output
            .chunks_exact_mut(channel_count)
            .zip(voice_buffer.chunks_exact(2))
        {
            o[offset] += frame[0];
            o[offset + 1] += frame[1];
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        alloc::{GlobalAlloc, Layout, System},
        cell::Cell,
        time::Duration,
    };

    use super::*;
    use crate::{
        grain::pool::OverflowPolicy, scheduler::GrainMode, voice::VoiceState, StatusReader,
    };

    fn engine(config: EngineConfig) -> (Engine, Controller) {
        Engine::new(EngineConfig {
            random_seed: Some(0),
            ..config
        })
        .unwrap()
    }

    fn unsynced_voice() -> VoiceConfig {
        VoiceConfig {
            tempo_sync: false,
            ..VoiceConfig::default()
        }
    }

    fn sine_buffer(frame_count: usize) -> SampleBuffer {
        let samples = (0..frame_count)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 48000.0).sin())
            .collect();
        SampleBuffer::from_mono(samples, 48000).unwrap()
    }

    fn render(engine: &mut Engine, frame_count: usize) -> Vec<f32> {
        let mut output = vec![0.0; frame_count * engine.config().channel_count];
        assert_eq!(engine.process(&mut output), frame_count);
        output
    }

    #[test]
    fn render_callback_totality() {
        let (mut engine, controller) = engine(EngineConfig::default());
        let buffer = controller.share_buffer(sine_buffer(48000));
        engine.add_voice(unsynced_voice(), Some(buffer)).unwrap();
        engine.add_voice(unsynced_voice(), None).unwrap();
        let nan_buffer = controller.share_buffer(SampleBuffer::from_mono(vec![f32::NAN; 4800], 48000).unwrap());
        engine.add_voice(unsynced_voice(), Some(nan_buffer)).unwrap();

        let sender = controller.sender();
        // unknown voice, missing buffer, out of range values and zero length grains
        sender.trigger(0);
        sender.trigger(1);
        sender.trigger(2);
        sender.trigger(42);
        sender.send(ControlEvent::SetPitch(0, 100.0));
        sender.send(ControlEvent::SetGrainParams(
            0,
            GrainParameters {
                grain_rate_hz: f32::NAN,
                ..GrainParameters::default()
            },
        ));
        sender.send(ControlEvent::SetGrainParams(
            0,
            GrainParameters {
                overlap: -1.0,
                ..GrainParameters::default()
            },
        ));
        sender.send(ControlEvent::SetVoiceRoute(0, 3));
        sender.send(ControlEvent::SetBpm(-1.0));

        for frame_count in [1, 64, 1024, 3000] {
            let output = render(&mut engine, frame_count);
            assert_eq!(output.len(), frame_count * 2);
            assert!(output.iter().all(|s| s.is_finite()));
        }
        assert!(engine.render_callback(512).iter().all(|s| s.is_finite()));
        assert_eq!(engine.render_callback(512).len(), 1024);

        let status = controller.status_reader().snapshot();
        // trigger 1, trigger 42, pitch, two grain parameters, route and bpm
        assert_eq!(status.rejected_events, 7);
        assert!(status.render_faults >= 1);
        assert_eq!(status.voices[0].state, VoiceState::Playing);
        assert_eq!(status.voices[1].state, VoiceState::Stopped);
        assert_eq!(status.bpm, 120.0);
        assert_eq!(engine.voice(0).unwrap().config().grain, GrainParameters::default());
        assert!(engine.voice(42).is_err());
    }

    #[test]
    fn grain_count_bound() {
        let settings = Settings {
            max_density_hz: 1000.0,
            overflow_policy: OverflowPolicy::DropOldest,
            ..Settings::default()
        };
        let (mut engine, controller) = engine(EngineConfig {
            grain_pool_capacity: 8,
            settings,
            ..EngineConfig::default()
        });
        let buffer = controller.share_buffer(sine_buffer(48000));
        let config = VoiceConfig {
            grain: GrainParameters {
                grain_rate_hz: 800.0,
                overlap: 0.9,
                ..GrainParameters::default()
            },
            ..unsynced_voice()
        };
        engine.add_voice(config, Some(buffer)).unwrap();
        controller.sender().trigger(0);

        for _ in 0..20 {
            render(&mut engine, 512);
            assert!(engine.pool.active_count() <= 8);
        }
        let status = controller.status_reader().snapshot();
        assert!(status.evicted_grains > 0);
        assert!(status.active_grains <= 8);
        assert_eq!(status.grain_capacity, 8);
    }

    #[test]
    fn density_clamp_via_event() {
        let (mut engine, controller) = engine(EngineConfig::default());
        let buffer = controller.share_buffer(sine_buffer(48000));
        engine.add_voice(unsynced_voice(), Some(buffer)).unwrap();
        let sender = controller.sender();
        sender
            .set_grain_params(
                0,
                GrainParameters {
                    mode: GrainMode::PitchShifted,
                    grain_rate_hz: 500.0,
                    overlap: 0.8,
                    ..GrainParameters::default()
                },
            )
            .unwrap();
        sender.trigger(0);
        render(&mut engine, 1000);

        let mut spawn_frames = engine
            .pool
            .active_handles()
            .map(|handle| engine.pool.get(handle).spawn_frame())
            .collect::<Vec<_>>();
        spawn_frames.sort();
        // max density is 100 Hz: a spawn every 480 frames, each lasting 2400 frames
        assert_eq!(spawn_frames, vec![0, 480, 960]);
    }

    #[test]
    fn grain_rates_above_max_density_get_clamped() {
        let (mut engine, controller) = engine(EngineConfig::default());
        let buffer = controller.share_buffer(sine_buffer(48000));
        engine.add_voice(unsynced_voice(), Some(buffer)).unwrap();
        let sender = controller.sender();
        sender.send(ControlEvent::SetGrainParams(
            0,
            GrainParameters {
                mode: GrainMode::PitchShifted,
                grain_rate_hz: 2000.0,
                overlap: 0.8,
                ..GrainParameters::default()
            },
        ));
        sender.trigger(0);
        render(&mut engine, 1000);

        let mut spawn_frames = engine
            .pool
            .active_handles()
            .map(|handle| engine.pool.get(handle).spawn_frame())
            .collect::<Vec<_>>();
        spawn_frames.sort();
        assert_eq!(spawn_frames, vec![0, 480, 960]);
        let status = controller.status_reader().snapshot();
        assert_eq!(status.rejected_events, 0);
        assert_eq!(
            engine.voice(0).unwrap().config().grain.grain_rate_hz,
            2000.0
        );
    }

    #[test]
    fn tap_tempo_and_double_tap() {
        let (mut engine, controller) = engine(EngineConfig::default());
        let buffer = controller.share_buffer(sine_buffer(48000));
        engine.add_voice(unsynced_voice(), Some(buffer)).unwrap();
        let sender = controller.sender();
        let reader: StatusReader = controller.status_reader();

        for i in 0..5 {
            sender.tap_at(Duration::from_millis(1000 + i * 600));
        }
        render(&mut engine, 64);
        assert!((reader.snapshot().bpm - 100.0).abs() < 0.5);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Stopped);

        // double tap toggles the transport without touching the tempo
        sender.tap_at(Duration::from_millis(10000));
        sender.tap_at(Duration::from_millis(10080));
        render(&mut engine, 64);
        assert!((reader.snapshot().bpm - 100.0).abs() < 0.5);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Playing);

        sender.transport_toggle();
        render(&mut engine, 64);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Stopped);
    }

    #[test]
    fn event_budget_defers_events() {
        let settings = Settings {
            max_events_per_callback: 2,
            ..Settings::default()
        };
        let (mut engine, controller) = engine(EngineConfig {
            settings,
            ..EngineConfig::default()
        });
        let buffer = controller.share_buffer(sine_buffer(48000));
        engine.add_voice(unsynced_voice(), Some(buffer)).unwrap();
        let sender = controller.sender();
        sender.set_gain(0, 0.5).unwrap();
        sender.set_pan(0, 0.5).unwrap();
        sender.trigger(0);
        render(&mut engine, 64);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Stopped);
        assert_eq!(controller.status_reader().snapshot().deferred_events, 1);
        render(&mut engine, 64);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Playing);
        assert_eq!(engine.voice(0).unwrap().config().gain, 0.5);
    }

    #[test]
    fn deferred_events_are_counted_once() {
        let settings = Settings {
            max_events_per_callback: 1,
            ..Settings::default()
        };
        let (mut engine, controller) = engine(EngineConfig {
            settings,
            ..EngineConfig::default()
        });
        let buffer = controller.share_buffer(sine_buffer(48000));
        engine.add_voice(unsynced_voice(), Some(buffer)).unwrap();
        let sender = controller.sender();
        sender.set_gain(0, 0.5).unwrap();
        sender.set_pan(0, 0.5).unwrap();
        sender.trigger(0);
        let reader = controller.status_reader();
        render(&mut engine, 64);
        assert_eq!(reader.snapshot().deferred_events, 2);
        render(&mut engine, 64);
        assert_eq!(reader.snapshot().deferred_events, 2);
        render(&mut engine, 64);
        assert_eq!(reader.snapshot().deferred_events, 2);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Playing);

        // new events queued behind still deferred ones are counted as they get deferred
        sender.stop(0);
        sender.trigger(0);
        render(&mut engine, 64);
        assert_eq!(reader.snapshot().deferred_events, 3);
        render(&mut engine, 64);
        assert_eq!(reader.snapshot().deferred_events, 3);
    }

    #[test]
    fn routes_voices_to_channel_pairs() {
        let (mut engine, controller) = engine(EngineConfig {
            channel_count: 4,
            ..EngineConfig::default()
        });
        let buffer = controller.share_buffer(SampleBuffer::from_mono(vec![1.0; 48000], 48000).unwrap());
        let config = VoiceConfig {
            output_route: 1,
            ..unsynced_voice()
        };
        engine.add_voice(config, Some(buffer)).unwrap();
        assert!(engine
            .add_voice(
                VoiceConfig {
                    output_route: 2,
                    ..unsynced_voice()
                },
                None
            )
            .is_err());
        controller.sender().trigger(0);
        let output = render(&mut engine, 4800);
        for frame in output.chunks_exact(4) {
            assert_eq!(frame[0], 0.0);
            assert_eq!(frame[1], 0.0);
        }
        assert!(output.chunks_exact(4).any(|frame| frame[2] > 0.5 && frame[3] > 0.5));
    }

    #[test]
    fn assign_buffer_at_runtime() {
        let (mut engine, controller) = engine(EngineConfig::default());
        engine.add_voice(unsynced_voice(), None).unwrap();
        let sender = controller.sender();
        sender.trigger(0);
        render(&mut engine, 64);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Stopped);

        sender.assign_buffer(0, sine_buffer(4800), 90.0).unwrap();
        sender.trigger(0);
        let output = render(&mut engine, 4800);
        assert_eq!(engine.voice(0).unwrap().state(), VoiceState::Playing);
        assert_eq!(engine.voice(0).unwrap().config().loop_bpm, 90.0);
        assert!(output.iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn voice_limit() {
        let (mut engine, _controller) = engine(EngineConfig {
            max_voices: 1,
            ..EngineConfig::default()
        });
        engine.add_voice(VoiceConfig::default(), None).unwrap();
        assert_eq!(
            engine.add_voice(VoiceConfig::default(), None),
            Err(Error::ResourceExhausted)
        );
    }

    struct CountingAllocator;

    thread_local! {
        static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
    }

    unsafe impl GlobalAlloc for CountingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    #[global_allocator]
    static ALLOCATOR: CountingAllocator = CountingAllocator;

    fn count_allocations<T>(func: impl FnOnce() -> T) -> (T, usize) {
        let before = ALLOCATIONS.with(Cell::get);
        let result = func();
        (result, ALLOCATIONS.with(Cell::get) - before)
    }

    #[test]
    fn rejects_events_without_allocating() {
        let (mut engine, _controller) = engine(EngineConfig::default());
        engine.add_voice(unsynced_voice(), None).unwrap();
        let events = vec![
            ControlEvent::SetPitch(0, 100.0),
            ControlEvent::SetGrainParams(
                0,
                GrainParameters {
                    grain_rate_hz: f32::NAN,
                    ..GrainParameters::default()
                },
            ),
            ControlEvent::SetBpm(-1.0),
            ControlEvent::SetVoiceGain(0, 9.0),
            ControlEvent::SetVoicePan(0, 2.0),
            ControlEvent::SetVoiceRoute(0, 3),
            ControlEvent::TriggerVoice(0),
            ControlEvent::TriggerVoice(42),
            ControlEvent::MuteVoice(42),
        ];
        let mut rejections = Vec::with_capacity(events.len());
        for event in events {
            let (result, allocations) = count_allocations(|| engine.apply_event(event));
            assert_eq!(allocations, 0);
            rejections.push(result.unwrap_err());
        }
        assert!(matches!(rejections[0], EventRejection::InvalidValue(_)));
        assert!(matches!(rejections[1], EventRejection::InvalidValue(_)));
        assert_eq!(rejections[6], EventRejection::BufferUnavailable(0));
        assert_eq!(rejections[7], EventRejection::VoiceNotFound(42));
        assert_eq!(rejections[8], EventRejection::VoiceNotFound(42));
        assert_eq!(engine.clock().bpm(), EngineConfig::default().initial_bpm);
    }
}
