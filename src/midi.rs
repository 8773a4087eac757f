//! Translation of raw MIDI channel messages into control events.
//!
//! Binding MIDI devices is up to the application: feed the raw messages of any MIDI input into
//! a [`MidiMapping`] and send the resulting events with a
//! [`ControlSender`](crate::ControlSender).

use std::time::Duration;

use crate::{event::ControlEvent, Error, VoiceId};

// -------------------------------------------------------------------------------------------------

/// Maps MIDI notes to tap tempo, transport and voice control events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMapping {
    /// Zero based MIDI channel to listen to, or `None` to listen to all channels.
    pub channel: Option<u8>,
    /// Note which taps the tempo (soft) or toggles the transport (hard).
    pub tap_note: u8,
    /// Note of the first voice. Voice `i` is mapped to note `first_voice_note + i`.
    pub first_voice_note: u8,
    /// Number of voices notes are mapped to.
    pub voice_count: usize,
    /// Note on velocities at or above the threshold express a trigger intent. Lower ones
    /// tap the tempo on the tap note and toggle mute on voice notes.
    pub velocity_threshold: u8,
}

impl Default for MidiMapping {
    fn default() -> Self {
        Self {
            channel: None,
            tap_note: 48,
            first_voice_note: 60,
            voice_count: 16,
            velocity_threshold: 80,
        }
    }
}

impl MidiMapping {
    pub fn validate(&self) -> Result<(), Error> {
        if self.channel.is_some_and(|channel| channel > 15) {
            return Err(Error::ConfigError(
                "MIDI channel must be between 0 and 15".to_string(),
            ));
        }
        if self.tap_note > 127 || self.first_voice_note > 127 || self.velocity_threshold > 127 {
            return Err(Error::ConfigError(
                "MIDI notes and velocities must be between 0 and 127".to_string(),
            ));
        }
        let first_voice_note = self.first_voice_note as usize;
        let voice_notes = first_voice_note..first_voice_note + self.voice_count;
        if voice_notes.contains(&(self.tap_note as usize)) {
            return Err(Error::ConfigError(
                "MIDI tap note must not overlap the voice notes".to_string(),
            ));
        }
        Ok(())
    }

    /// Voice the given note is mapped to.
    pub fn voice_for_note(&self, note: u8) -> Option<VoiceId> {
        let voice = (note as usize).checked_sub(self.first_voice_note as usize)?;
        (voice < self.voice_count).then_some(voice)
    }

    /// Translate a raw MIDI message, received at the given time, into a control event.
    ///
    /// `timestamp` must use the same time base as the [`ControlSender`](crate::ControlSender)
    /// the event gets sent with, see [`ControlSender::elapsed`](crate::ControlSender::elapsed).
    /// `voice_is_muted` tells if the given voice currently is muted, to toggle mute states.
    ///
    /// Returns `None` for messages which are not mapped.
    pub fn translate(
        &self,
        message: &[u8],
        timestamp: Duration,
        voice_is_muted: impl Fn(VoiceId) -> bool,
    ) -> Option<ControlEvent> {
        let [status, note, velocity, ..] = *message else {
            return None;
        };
        // only note ons: note offs and note ons with velocity 0 are ignored
        if status & 0xF0 != 0x90 || velocity == 0 {
            return None;
        }
        if self.channel.is_some_and(|channel| channel != status & 0x0F) {
            return None;
        }
        let hard = velocity >= self.velocity_threshold;
        if note == self.tap_note {
            return Some(if hard {
                ControlEvent::TransportToggle
            } else {
                ControlEvent::TapTempo(timestamp)
            });
        }
        let voice = self.voice_for_note(note)?;
        Some(if hard {
            ControlEvent::TriggerVoice(voice)
        } else if voice_is_muted(voice) {
            ControlEvent::UnmuteVoice(voice)
        } else {
            ControlEvent::MuteVoice(voice)
        })
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(mapping: &MidiMapping, message: &[u8]) -> Option<ControlEvent> {
        mapping.translate(message, Duration::from_millis(10), |voice| voice == 1)
    }

    #[test]
    fn tap_note() {
        let mapping = MidiMapping::default();
        assert!(matches!(
            translate(&mapping, &[0x90, 48, 40]),
            Some(ControlEvent::TapTempo(t)) if t == Duration::from_millis(10)
        ));
        assert!(matches!(
            translate(&mapping, &[0x93, 48, 80]),
            Some(ControlEvent::TransportToggle)
        ));
    }

    #[test]
    fn voice_notes() {
        let mapping = MidiMapping::default();
        assert!(matches!(
            translate(&mapping, &[0x90, 60, 127]),
            Some(ControlEvent::TriggerVoice(0))
        ));
        assert!(matches!(
            translate(&mapping, &[0x90, 62, 20]),
            Some(ControlEvent::MuteVoice(2))
        ));
        assert!(matches!(
            translate(&mapping, &[0x90, 61, 20]),
            Some(ControlEvent::UnmuteVoice(1))
        ));
        assert!(translate(&mapping, &[0x90, 76, 100]).is_none());
        assert!(translate(&mapping, &[0x90, 59, 100]).is_none());
    }

    #[test]
    fn ignored_messages() {
        let mapping = MidiMapping {
            channel: Some(2),
            ..MidiMapping::default()
        };
        // note off, note on with velocity 0, wrong channel, controller, truncated
        assert!(translate(&mapping, &[0x82, 60, 100]).is_none());
        assert!(translate(&mapping, &[0x92, 60, 0]).is_none());
        assert!(translate(&mapping, &[0x91, 60, 100]).is_none());
        assert!(translate(&mapping, &[0xB2, 60, 100]).is_none());
        assert!(translate(&mapping, &[0x92, 60]).is_none());
        assert!(translate(&mapping, &[0x92, 60, 100]).is_some());
    }

    #[test]
    fn validation() {
        assert!(MidiMapping::default().validate().is_ok());
        assert!(MidiMapping {
            tap_note: 62,
            ..MidiMapping::default()
        }
        .validate()
        .is_err());
        assert!(MidiMapping {
            channel: Some(16),
            ..MidiMapping::default()
        }
        .validate()
        .is_err());
    }
}
