//! Low frequency oscillator for grain parameter modulation.

use std::f64::consts::PI;

// -------------------------------------------------------------------------------------------------

/// Waveform types for LFO oscillators.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, strum::Display, strum::EnumString, strum::VariantNames,
)]
pub enum LfoWaveform {
    #[default]
    Sine,
    Triangle,
    Sawtooth,
    Square,
}

// -------------------------------------------------------------------------------------------------

/// Simple non bandlimited oscillator which gets sampled sparsely, e.g. once per spawned grain.
///
/// The phase advances with the audio clock via [`Lfo::advance`], so the modulation stays
/// continuous no matter how seldom it is sampled.
#[derive(Debug, Default, Clone)]
pub struct Lfo {
    phase: f64,
    phase_inc: f64,
    waveform: LfoWaveform,
}

impl Lfo {
    pub fn new(sample_rate: u32, rate: f64, waveform: LfoWaveform) -> Self {
        let phase_inc = 2.0 * PI * rate / sample_rate as f64;
        Self {
            phase: 0.0,
            phase_inc,
            waveform,
        }
    }

    /// Set a new rate in Hz with the given sampling rate.
    pub fn set_rate(&mut self, sample_rate: u32, rate: f64) {
        self.phase_inc = 2.0 * PI * rate / sample_rate as f64;
    }

    /// Set a new waveform. Keeps the current phase.
    pub fn set_waveform(&mut self, waveform: LfoWaveform) {
        self.waveform = waveform;
    }

    /// Set or reset the LFO's phase in radians.
    pub fn set_phase(&mut self, phase: f64) {
        self.phase = phase.rem_euclid(2.0 * PI);
    }

    /// Move the phase forward by the given number of sample frames.
    pub fn advance(&mut self, frames: u64) {
        self.phase = (self.phase + self.phase_inc * frames as f64).rem_euclid(2.0 * PI);
    }

    /// Current value in range `-1.0..=1.0` without advancing the phase.
    pub fn value(&self) -> f64 {
        match self.waveform {
            LfoWaveform::Sine => self.phase.sin(),
            LfoWaveform::Triangle => {
                let normalized_phase = self.phase / (2.0 * PI);
                if normalized_phase < 0.5 {
                    4.0 * normalized_phase - 1.0
                } else {
                    -4.0 * normalized_phase + 3.0
                }
            }
            LfoWaveform::Sawtooth => {
                let normalized_phase = self.phase / (2.0 * PI);
                2.0 * normalized_phase - 1.0
            }
            LfoWaveform::Square => {
                if self.phase < PI {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
