//! Single grain playback: an enveloped, pitched read cursor over a shared sample buffer.

use std::sync::LazyLock;

use strum::EnumCount;

use crate::{
    sample_buffer::SampleBuffer,
    utils::{panning_factors, time::SampleTime},
    VoiceId,
};

// -------------------------------------------------------------------------------------------------

pub mod pool;

// -------------------------------------------------------------------------------------------------

/// Grain envelope window function.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::Display,
    strum::VariantNames,
    strum::EnumCount,
)]
#[repr(u8)]
pub enum GrainWindowMode {
    /// Raised cosine. Sums to a constant at 50% overlap.
    #[default]
    Hann = 0,
    /// Raised cosine on a pedestal. Sums to a constant (1.08) at 50% overlap.
    Hamming = 1,
    /// Three term cosine window with a steep spectral rolloff.
    Blackman = 2,
}

// -------------------------------------------------------------------------------------------------

/// Precomputed, periodic grain windows.
/// `N` must be a pow2 value.
pub(crate) struct GrainWindow<const N: usize> {
    luts: [[f32; N]; GrainWindowMode::COUNT],
}

impl<const N: usize> GrainWindow<N> {
    const _VERIFY_N: () = assert!(
        N.is_power_of_two(),
        "Grain window size must be a pow2 value"
    );
    const MASK: usize = N - 1;

    /// Precompute all window LUTs
    pub fn new() -> Self {
        let mut luts = [[0.0; N]; GrainWindowMode::COUNT];

        #[allow(clippy::needless_range_loop)]
        for i in 0..N {
            let phase = i as f64 / N as f64; // [0.0, 1.0)
            let cos1 = (2.0 * std::f64::consts::PI * phase).cos();
            let cos2 = (4.0 * std::f64::consts::PI * phase).cos();

            luts[GrainWindowMode::Hann as usize][i] = (0.5 - 0.5 * cos1) as f32;
            luts[GrainWindowMode::Hamming as usize][i] = (0.54 - 0.46 * cos1) as f32;
            luts[GrainWindowMode::Blackman as usize][i] = (0.42 - 0.5 * cos1 + 0.08 * cos2) as f32;
        }

        Self { luts }
    }

    /// Evaluate a window at normalized phase [0.0, 1.0).
    /// Uses linear interpolation between LUT samples. Windows are periodic, so the
    /// interpolation wraps into the first LUT entry at the window end.
    #[inline]
    pub fn sample(&self, mode: GrainWindowMode, phase: f64) -> f32 {
        debug_assert!((0.0..1.0).contains(&phase), "Invalid window phase {phase}");

        let index_float = phase * N as f64;
        let index = (index_float as usize) & Self::MASK;
        let fraction = index_float.fract() as f32;
        let next_index = (index + 1) & Self::MASK;

        let lut = &self.luts[mode as usize];
        lut[index] * (1.0 - fraction) + lut[next_index] * fraction
    }
}

/// Static, shared lookup table for the envelope window modes
pub(crate) static GRAIN_WINDOW_LUT: LazyLock<GrainWindow<2048>> = LazyLock::new(GrainWindow::new);

// -------------------------------------------------------------------------------------------------

/// A request to start a new grain, as emitted by a [`GrainScheduler`](crate::GrainScheduler).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainSpawn {
    /// Frame offset within the current render block at which the grain starts playing.
    pub frame_offset: usize,
    /// First source frame of the grain's window.
    pub start_frame: f64,
    /// Window length in source frames. Always > 0.
    pub length_frames: usize,
    /// Source frames to advance per output frame. Always > 0.
    pub playback_rate: f64,
    /// Linear grain gain.
    pub gain: f32,
    /// Stereo panning of the grain (-1.0..=1.0).
    pub panning: f32,
    /// Envelope window.
    pub window: GrainWindowMode,
}

impl GrainSpawn {
    /// Check the spawn request's invariants before activating a grain with it.
    pub fn is_valid(&self) -> bool {
        self.length_frames > 0
            && self.playback_rate.is_finite()
            && self.playback_rate > 0.0
            && self.start_frame.is_finite()
            && self.gain.is_finite()
            && self.panning.is_finite()
    }
}

// -------------------------------------------------------------------------------------------------

/// Lifecycle state of a grain slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrainState {
    /// The slot is unused and can be acquired.
    #[default]
    Free,
    /// The grain is playing.
    Active,
    /// The grain's cursor left its window: it no longer produces output and can be released.
    Finishing,
}

// -------------------------------------------------------------------------------------------------

/// A single grain of audio.
///
/// A grain reads `length_frames` source frames starting at `start_frame`, advancing its
/// cursor by `playback_rate` frames per output frame. A grain with a rate of 2.0 thus covers
/// its window in half the output frames: raising the pitch shortens the grain.
#[derive(Debug, Clone, Copy)]
pub struct Grain {
    state: GrainState,
    voice: VoiceId,
    spawn_frame: SampleTime,
    start_frame: f64,
    length_frames: usize,
    playback_rate: f64,
    position: f64,
    gain: f32,
    panning: f32,
    window: GrainWindowMode,
}

impl Default for Grain {
    fn default() -> Self {
        Self::new()
    }
}

impl Grain {
    /// Create a new free grain.
    pub const fn new() -> Self {
        Self {
            state: GrainState::Free,
            voice: 0,
            spawn_frame: 0,
            start_frame: 0.0,
            length_frames: 1,
            playback_rate: 1.0,
            position: 0.0,
            gain: 1.0,
            panning: 0.0,
            window: GrainWindowMode::Hann,
        }
    }

    #[inline]
    pub fn state(&self) -> GrainState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == GrainState::Active
    }

    /// The voice this grain plays for.
    #[inline]
    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    /// Absolute engine frame at which this grain got spawned.
    #[inline]
    pub fn spawn_frame(&self) -> SampleTime {
        self.spawn_frame
    }

    #[inline]
    pub fn start_frame(&self) -> f64 {
        self.start_frame
    }

    #[inline]
    pub fn length_frames(&self) -> usize {
        self.length_frames
    }

    #[inline]
    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    /// Current cursor position in source frames.
    #[inline]
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Grain progress within its window (0.0..1.0).
    #[inline]
    pub fn window_phase(&self) -> f64 {
        ((self.position - self.start_frame) / self.length_frames as f64).clamp(0.0, 1.0)
    }

    /// Number of output frames this grain still renders.
    pub fn remaining_output_frames(&self) -> usize {
        if self.state != GrainState::Active {
            return 0;
        }
        let end = self.start_frame + self.length_frames as f64;
        ((end - self.position) / self.playback_rate).ceil().max(0.0) as usize
    }

    /// Remaining audible contribution of this grain. Used to pick grains to steal.
    pub fn remaining_impact(&self) -> f32 {
        self.remaining_output_frames() as f32 * self.gain
    }

    /// Start playing the grain with the given spawn request.
    pub fn activate(&mut self, voice: VoiceId, spawn_frame: SampleTime, spawn: &GrainSpawn) {
        debug_assert!(spawn.is_valid(), "Invalid grain spawn request: {spawn:?}");
        self.state = GrainState::Active;
        self.voice = voice;
        self.spawn_frame = spawn_frame;
        self.start_frame = spawn.start_frame;
        self.length_frames = spawn.length_frames.max(1);
        self.playback_rate = spawn.playback_rate;
        self.position = spawn.start_frame;
        self.gain = spawn.gain;
        self.panning = spawn.panning.clamp(-1.0, 1.0);
        self.window = spawn.window;
    }

    /// Mark a playing grain as finished, so it gets released at the end of the block.
    pub fn finish(&mut self) {
        if self.state == GrainState::Active {
            self.state = GrainState::Finishing;
        }
    }

    /// Reset the grain into the free state.
    pub fn deactivate(&mut self) {
        self.state = GrainState::Free;
    }

    /// Mix the grain into the given interleaved stereo `output` buffer, starting at its first
    /// frame, until either the output is filled or the cursor leaves the grain's window.
    ///
    /// Returns the number of frames written.
    pub fn render_into(&mut self, output: &mut [f32], source: &SampleBuffer, looping: bool) -> usize {
        if self.state != GrainState::Active {
            return 0;
        }
        let grain_window = &*GRAIN_WINDOW_LUT;
        let end = self.start_frame + self.length_frames as f64;
        let inv_length = 1.0 / self.length_frames as f64;
        let (pan_l, pan_r) = panning_factors(self.panning);
        let (gain_l, gain_r) = (self.gain * pan_l, self.gain * pan_r);

        let mut frames_written = 0;
        for frame in output.chunks_exact_mut(2) {
            if self.position >= end {
                break;
            }
            let phase = (self.position - self.start_frame) * inv_length;
            let envelope = grain_window.sample(self.window, phase);
            let (left, right) = source.sample_at(self.position, looping);
            frame[0] += left * envelope * gain_l;
            frame[1] += right * envelope * gain_r;
            self.position += self.playback_rate;
            frames_written += 1;
        }
        if self.position >= end {
            self.state = GrainState::Finishing;
        }
        frames_written
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(length_frames: usize, playback_rate: f64) -> GrainSpawn {
        GrainSpawn {
            frame_offset: 0,
            start_frame: 0.0,
            length_frames,
            playback_rate,
            gain: 1.0,
            panning: 0.0,
            window: GrainWindowMode::Hann,
        }
    }

    fn render_until_finished(grain: &mut Grain, source: &SampleBuffer) -> usize {
        let mut output = vec![0.0; 2 * 1024];
        let mut total = 0;
        while grain.is_active() {
            output.fill(0.0);
            total += grain.render_into(&mut output, source, true);
        }
        total
    }

    #[test]
    fn windows() {
        let window = GrainWindow::<2048>::new();
        assert!(window.sample(GrainWindowMode::Hann, 0.0).abs() < 1e-6);
        assert!((window.sample(GrainWindowMode::Hann, 0.5) - 1.0).abs() < 1e-6);
        assert!((window.sample(GrainWindowMode::Hamming, 0.0) - 0.08).abs() < 1e-6);
        assert!((window.sample(GrainWindowMode::Blackman, 0.5) - 1.0).abs() < 1e-6);
        // periodic windows: 50% shifted hann windows sum up to one
        for i in 0..100 {
            let phase = i as f64 / 200.0;
            let sum = window.sample(GrainWindowMode::Hann, phase)
                + window.sample(GrainWindowMode::Hann, phase + 0.5);
            assert!((sum - 1.0).abs() < 1e-5, "sum at {phase} is {sum}");
        }
    }

    #[test]
    fn rate_scales_duration() {
        let source = SampleBuffer::from_mono(vec![1.0; 10000], 44100).unwrap();

        let mut grain = Grain::new();
        grain.activate(0, 0, &spawn(4000, 2.0));
        assert_eq!(grain.remaining_output_frames(), 2000);
        assert_eq!(render_until_finished(&mut grain, &source), 2000);
        assert_eq!(grain.state(), GrainState::Finishing);

        let mut grain = Grain::new();
        grain.activate(0, 0, &spawn(4000, 0.5));
        assert_eq!(grain.remaining_output_frames(), 8000);
        assert_eq!(render_until_finished(&mut grain, &source), 8000);

        let mut grain = Grain::new();
        grain.activate(0, 0, &spawn(4000, 1.0));
        assert_eq!(render_until_finished(&mut grain, &source), 4000);
    }

    #[test]
    fn cursor_stays_in_window() {
        let source = SampleBuffer::from_mono(vec![1.0; 100], 44100).unwrap();
        let mut grain = Grain::new();
        grain.activate(0, 0, &spawn(64, 1.5));
        let mut output = vec![0.0; 2];
        while grain.is_active() {
            let position = grain.position();
            assert!(position >= 0.0 && position < 64.0);
            grain.render_into(&mut output, &source, true);
        }
        assert_eq!(grain.remaining_output_frames(), 0);
    }

    #[test]
    fn pans_and_applies_gain() {
        let source = SampleBuffer::from_mono(vec![1.0; 100], 44100).unwrap();
        let mut grain = Grain::new();
        grain.activate(
            0,
            0,
            &GrainSpawn {
                gain: 0.5,
                panning: 1.0,
                ..spawn(16, 1.0)
            },
        );
        let mut output = vec![0.0; 2 * 16];
        assert_eq!(grain.render_into(&mut output, &source, true), 16);
        // peak of the hann window is at frame 8
        assert_eq!(output[16], 0.0);
        assert!((output[17] - 0.5).abs() < 1e-5);
        assert!(output.chunks(2).all(|f| f[0] == 0.0));
    }

    #[test]
    fn spawn_validation() {
        assert!(spawn(10, 1.0).is_valid());
        assert!(!spawn(0, 1.0).is_valid());
        assert!(!spawn(10, 0.0).is_valid());
        assert!(!spawn(10, f64::NAN).is_valid());
    }
}
