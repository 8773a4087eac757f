//! Per voice grain spawning policies.

use std::ops::Range;

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    clock::ClockState,
    grain::{GrainSpawn, GrainWindowMode},
    settings::Settings,
    utils::{
        lfo::{Lfo, LfoWaveform},
        pitch_to_speed,
        time::SampleTime,
    },
    Error,
};

// -------------------------------------------------------------------------------------------------

/// How a scheduler perturbs the parameters of the grains it spawns.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::VariantNames,
)]
#[repr(u8)]
pub enum GrainMode {
    /// Grains play at the voice's native rate. Pitch settings are ignored.
    #[default]
    Classic,
    /// Grains play at a rate derived from the voice's pitch shift in semitones.
    PitchShifted,
    /// Pitched grains with randomized source positions and spawn times.
    Scatter,
    /// Pitched grains with gain and/or rate modulated by an LFO.
    Modulated,
}

/// Which grain parameter the LFO of a [`GrainMode::Modulated`] scheduler modulates.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::VariantNames,
)]
#[repr(u8)]
pub enum ModulationTarget {
    #[default]
    Gain,
    Rate,
    GainAndRate,
}

// -------------------------------------------------------------------------------------------------

/// Parameters controlling how a voice spawns its grains.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GrainParameters {
    /// Grain spawn policy.
    pub mode: GrainMode,
    /// Grain envelope window.
    pub window: GrainWindowMode,
    /// Number of grains spawned per second. Any positive rate is accepted: the engine's
    /// density range clamps it when spawning.
    pub grain_rate_hz: f32,
    /// Fraction of a grain's duration which overlaps with the next grain (0.0 - 0.95).
    pub overlap: f32,
    /// Pitch shift in semitones (-24.0 - 24.0).
    pub pitch_semitones: f32,
    /// Scatter amount (0.0 - 1.0). At 1.0 start positions vary by ± one grain length and
    /// spawn times by ± half a spawn interval.
    pub scatter: f32,
    /// Random stereo spread per grain (0.0 - 1.0).
    pub pan_spread: f32,
    /// Rate of the modulation LFO in Hz (0.0 - 20.0).
    pub lfo_rate_hz: f32,
    /// Depth of the modulation LFO (0.0 - 1.0). At 1.0, gain swings between 0 and 1 and
    /// rate by ± one octave.
    pub lfo_depth: f32,
    /// Waveform of the modulation LFO.
    pub lfo_waveform: LfoWaveform,
    /// What the modulation LFO modulates.
    pub lfo_target: ModulationTarget,
}

impl Default for GrainParameters {
    fn default() -> Self {
        Self {
            mode: GrainMode::Classic,
            window: GrainWindowMode::Hann,
            grain_rate_hz: 25.0,
            overlap: 0.5,
            pitch_semitones: 0.0,
            scatter: 0.0,
            pan_spread: 0.0,
            lfo_rate_hz: 1.0,
            lfo_depth: 0.0,
            lfo_waveform: LfoWaveform::Sine,
            lfo_target: ModulationTarget::Gain,
        }
    }
}

impl GrainParameters {
    pub const MIN_PITCH_SEMITONES: f32 = -24.0;
    pub const MAX_PITCH_SEMITONES: f32 = 24.0;
    pub const MAX_OVERLAP: f32 = 0.95;

    pub fn new() -> Self {
        Self::default()
    }

    /// Validate all parameters.
    pub fn validate(&self) -> Result<(), Error> {
        Self::validate_pitch(self.pitch_semitones)?;
        match self.invalid_reason() {
            Some(reason) => Err(Error::ConfigError(reason.to_string())),
            None => Ok(()),
        }
    }

    /// Non allocating variant of [`Self::validate`], usable in the render path.
    /// Returns a static description of the first invalid parameter.
    pub fn invalid_reason(&self) -> Option<&'static str> {
        if !(self.grain_rate_hz.is_finite() && self.grain_rate_hz > 0.0) {
            return Some("Grain rate must be a positive number");
        }
        if !(0.0..=Self::MAX_OVERLAP).contains(&self.overlap) {
            return Some("Grain overlap must be between 0.0 and 0.95");
        }
        if !Self::is_valid_pitch(self.pitch_semitones) {
            return Some("Pitch shift must be between -24 and 24 semitones");
        }
        if !(0.0..=1.0).contains(&self.scatter) {
            return Some("Grain scatter must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.pan_spread) {
            return Some("Grain pan spread must be between 0.0 and 1.0");
        }
        if !(0.0..=20.0).contains(&self.lfo_rate_hz) {
            return Some("LFO rate must be between 0.0 and 20.0 Hz");
        }
        if !(0.0..=1.0).contains(&self.lfo_depth) {
            return Some("LFO depth must be between 0.0 and 1.0");
        }
        None
    }

    pub fn is_valid_pitch(semitones: f32) -> bool {
        (Self::MIN_PITCH_SEMITONES..=Self::MAX_PITCH_SEMITONES).contains(&semitones)
    }

    /// Validate a pitch shift value.
    pub fn validate_pitch(semitones: f32) -> Result<(), Error> {
        if !Self::is_valid_pitch(semitones) {
            return Err(Error::ConfigError(format!(
                "Pitch shift must be between {} and {} semitones, but is {semitones}",
                Self::MIN_PITCH_SEMITONES,
                Self::MAX_PITCH_SEMITONES
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Preallocated list of grain spawn requests, filled by [`GrainScheduler::tick`].
///
/// Never grows beyond its initial capacity: requests which don't fit get dropped.
pub struct SpawnList {
    spawns: Vec<GrainSpawn>,
}

impl SpawnList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            spawns: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.spawns.clear();
    }

    /// Add a new request. Returns false when the list is full.
    pub fn push(&mut self, spawn: GrainSpawn) -> bool {
        if self.spawns.len() < self.spawns.capacity() {
            self.spawns.push(spawn);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.spawns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spawns.is_empty()
    }

    pub fn as_slice(&self) -> &[GrainSpawn] {
        &self.spawns
    }
}

// -------------------------------------------------------------------------------------------------

/// Voice state a scheduler needs to decide about spawns.
#[derive(Clone, Copy)]
pub struct TickContext<'a> {
    pub params: &'a GrainParameters,
    pub settings: &'a Settings,
    /// Snap the spawn interval to an integer division of a beat.
    pub tempo_sync: bool,
    /// Source frames the read head moves per output frame.
    pub read_speed: f64,
    /// Source to output sample rate ratio.
    pub rate_factor: f64,
    /// Length of the voice's source buffer in frames.
    pub source_frames: usize,
    /// Wrap the read head around the source buffer end.
    pub looping: bool,
}

// -------------------------------------------------------------------------------------------------

/// Decides when, where and how a voice spawns its grains.
///
/// Spawns happen on a grid of `sample_rate / grain_rate_hz` frames, which is tracked in
/// absolute engine frames, so spawn times do not depend on the audio block layout. Spawned
/// grains read the voice's source buffer at the scheduler's read head, which moves through the
/// buffer with the voice's read speed (time-stretch) independently of the grains' playback
/// rate (pitch).
pub struct GrainScheduler {
    sample_rate: u32,
    /// Next spawn time without scatter jitter applied.
    grid_frame: f64,
    /// Next spawn time.
    next_spawn_frame: f64,
    /// Read head position in source frames at `playhead_frame`.
    playhead: f64,
    playhead_frame: SampleTime,
    /// Modulation LFO with its phase at `lfo_frame`.
    lfo: Lfo,
    lfo_frame: SampleTime,
    rng: SmallRng,
}

impl GrainScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_rng(sample_rate, SmallRng::from_os_rng())
    }

    /// Create a scheduler with a deterministic random number generator.
    pub fn with_seed(sample_rate: u32, seed: u64) -> Self {
        Self::with_rng(sample_rate, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(sample_rate: u32, rng: SmallRng) -> Self {
        assert!(sample_rate > 0, "Invalid sample rate");
        Self {
            sample_rate,
            grid_frame: 0.0,
            next_spawn_frame: 0.0,
            playhead: 0.0,
            playhead_frame: 0,
            lfo: Lfo::new(sample_rate, 1.0, LfoWaveform::Sine),
            lfo_frame: 0,
            rng,
        }
    }

    /// Absolute frame of the next spawn.
    pub fn next_spawn_frame(&self) -> f64 {
        self.next_spawn_frame
    }

    /// Read head position in source frames at the given absolute frame.
    pub fn playhead_at(&self, frame: SampleTime, read_speed: f64) -> f64 {
        self.playhead + frame.saturating_sub(self.playhead_frame) as f64 * read_speed
    }

    /// Start spawning at the given frame, reading from the given source position.
    pub fn start(&mut self, frame: SampleTime, playhead: f64) {
        self.grid_frame = frame as f64;
        self.next_spawn_frame = frame as f64;
        self.playhead = playhead;
        self.playhead_frame = frame;
        self.lfo.set_phase(0.0);
        self.lfo_frame = frame;
    }

    /// Move the read head to the given source position and restart the spawn grid there.
    /// Unlike [`Self::start`], keeps the modulation LFO running.
    pub fn restart(&mut self, frame: SampleTime, playhead: f64) {
        self.grid_frame = frame as f64;
        self.next_spawn_frame = frame as f64;
        self.playhead = playhead;
        self.playhead_frame = frame;
    }

    /// Align the spawn grid to the given frame, keeping the read head.
    pub fn resync(&mut self, frame: SampleTime) {
        self.grid_frame = frame as f64;
        self.next_spawn_frame = frame as f64;
    }

    /// True when a non looping voice's read head moved past the end of its source.
    pub fn is_exhausted(&self, context: &TickContext) -> bool {
        !context.looping && self.playhead >= context.source_frames as f64
    }

    /// Effective spawn rate in Hz after applying the engine's density range and scale.
    pub fn effective_density(params: &GrainParameters, settings: &Settings) -> f32 {
        params
            .grain_rate_hz
            .clamp(settings.min_density_hz, settings.max_density_hz)
            * settings.density_scale
    }

    /// Spawn interval in output frames.
    pub fn interval_frames(&self, context: &TickContext, clock: &ClockState) -> f64 {
        let density = Self::effective_density(context.params, context.settings) as f64;
        let interval = self.sample_rate as f64 / density;
        if context.tempo_sync && clock.frames_per_beat > 0.0 {
            let grains_per_beat = (clock.frames_per_beat / interval).round().max(1.0);
            (clock.frames_per_beat / grains_per_beat).round().max(1.0)
        } else {
            interval
        }
    }

    /// Grain window length in source frames for the given spawn interval.
    pub fn grain_length(context: &TickContext, interval: f64) -> usize {
        let overlap = context.params.overlap.clamp(0.0, GrainParameters::MAX_OVERLAP) as f64;
        ((interval / (1.0 - overlap) * context.rate_factor).round() as usize).max(1)
    }

    /// Emit spawn requests for all grains due within `frames`. Frame offsets of the spawned
    /// grains are relative to `block_start`. Moves the read head to the end of `frames`.
    pub fn tick(
        &mut self,
        context: &TickContext,
        clock: &ClockState,
        block_start: SampleTime,
        frames: Range<SampleTime>,
        spawns: &mut SpawnList,
    ) {
        debug_assert!(frames.start >= block_start, "Invalid tick frame range");
        if frames.is_empty() {
            return;
        }
        let params = context.params;
        self.lfo.set_rate(self.sample_rate, params.lfo_rate_hz as f64);
        self.lfo.set_waveform(params.lfo_waveform);

        let interval = self.interval_frames(context, clock);
        let (start, end) = (frames.start as f64, frames.end as f64);

        // don't catch up with spawns which got missed, e.g. while the voice was paused
        if self.next_spawn_frame < start - interval {
            self.grid_frame = start;
            self.next_spawn_frame = start;
        }

        while self.next_spawn_frame < end {
            let frame = (self.next_spawn_frame.ceil() as SampleTime)
                .clamp(frames.start, frames.end - 1);
            let playhead = self.playhead_at(frame, context.read_speed);
            if context.looping || playhead < context.source_frames as f64 {
                let spawn = self.make_spawn(context, frame - block_start, frame, playhead, interval);
                if spawn.is_valid() {
                    spawns.push(spawn);
                }
            }
            self.grid_frame += interval;
            self.next_spawn_frame = self.grid_frame + self.spawn_jitter(params, interval);
        }

        let mut playhead = self.playhead_at(frames.end, context.read_speed);
        if context.looping && context.source_frames > 0 {
            playhead = playhead.rem_euclid(context.source_frames as f64);
        }
        self.playhead = playhead;
        self.playhead_frame = frames.end;

        self.lfo.advance(frames.end.saturating_sub(self.lfo_frame));
        self.lfo_frame = frames.end;
    }

    fn spawn_jitter(&mut self, params: &GrainParameters, interval: f64) -> f64 {
        if params.mode == GrainMode::Scatter && params.scatter > 0.0 {
            let amount = params.scatter as f64 * interval * 0.5;
            self.rng.random_range(-amount..=amount)
        } else {
            0.0
        }
    }

    fn lfo_value_at(&self, frame: SampleTime) -> f64 {
        let mut lfo = self.lfo.clone();
        lfo.advance(frame.saturating_sub(self.lfo_frame));
        lfo.value()
    }

    fn make_spawn(
        &mut self,
        context: &TickContext,
        frame_offset: SampleTime,
        frame: SampleTime,
        playhead: f64,
        interval: f64,
    ) -> GrainSpawn {
        let params = context.params;
        let length_frames = Self::grain_length(context, interval);

        let mut start_frame = playhead;
        let mut playback_rate = context.rate_factor;
        let mut gain = 1.0_f32;
        match params.mode {
            GrainMode::Classic => {}
            GrainMode::PitchShifted => {
                playback_rate *= pitch_to_speed(params.pitch_semitones);
            }
            GrainMode::Scatter => {
                playback_rate *= pitch_to_speed(params.pitch_semitones);
                if params.scatter > 0.0 {
                    let amount = params.scatter as f64 * length_frames as f64;
                    start_frame += self.rng.random_range(-amount..=amount);
                }
            }
            GrainMode::Modulated => {
                playback_rate *= pitch_to_speed(params.pitch_semitones);
                let value = self.lfo_value_at(frame);
                let depth = params.lfo_depth as f64;
                if matches!(
                    params.lfo_target,
                    ModulationTarget::Gain | ModulationTarget::GainAndRate
                ) {
                    gain = (1.0 - depth * (1.0 - value) * 0.5) as f32;
                }
                if matches!(
                    params.lfo_target,
                    ModulationTarget::Rate | ModulationTarget::GainAndRate
                ) {
                    playback_rate *= 2.0_f64.powf(depth * value);
                }
            }
        }

        if context.looping && context.source_frames > 0 {
            start_frame = start_frame.rem_euclid(context.source_frames as f64);
        } else {
            start_frame = start_frame.max(0.0);
        }

        let panning = if params.pan_spread > 0.0 {
            params.pan_spread * self.rng.random_range(-1.0..=1.0_f32)
        } else {
            0.0
        };

        GrainSpawn {
            frame_offset: frame_offset as usize,
            start_frame,
            length_frames,
            playback_rate,
            gain,
            panning,
            window: params.window,
        }
    }
}

// -------------------------------------------------------------------------------------------------
