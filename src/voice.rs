//! A single loop player: playback state machine, grain scheduling and voice level mixing.

use basedrop::Shared;

use crate::{
    clock::{Clock, ClockState},
    error::RenderFault,
    grain::pool::GrainPool,
    sample_buffer::SampleBuffer,
    scheduler::{GrainParameters, GrainScheduler, SpawnList, TickContext},
    settings::Settings,
    utils::{
        buffer::sanitize_buffer, panning_factors, smoothed::LinearSmoothedValue, time::SampleTime,
    },
    Error, VoiceId,
};

// -------------------------------------------------------------------------------------------------

/// How a voice plays its loop.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::VariantNames,
)]
#[repr(u8)]
pub enum PlaybackMode {
    /// Loop endlessly. Triggers while playing are ignored.
    #[default]
    Loop,
    /// Play the loop once, then stop.
    OneShot,
    /// Loop endlessly. Triggers while playing restart the loop.
    Retrigger,
}

impl PlaybackMode {
    /// True when the voice's read head wraps around at the end of its buffer.
    pub fn is_looping(self) -> bool {
        !matches!(self, Self::OneShot)
    }
}

// -------------------------------------------------------------------------------------------------

/// Playback state of a voice.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::VariantNames,
)]
#[repr(u8)]
pub enum VoiceState {
    #[default]
    Stopped = 0,
    Playing = 1,
    /// Playing, but faded out.
    Muted = 2,
}

impl VoiceState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Playing,
            2 => Self::Muted,
            _ => Self::Stopped,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Musical boundary tempo synced triggers and resyncs wait for.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::VariantNames,
)]
pub enum Quantize {
    Beat,
    #[default]
    Bar,
}

impl Quantize {
    /// Boundary length in beats.
    pub fn beats(self, beats_per_bar: u32) -> f64 {
        match self {
            Self::Beat => 1.0,
            Self::Bar => beats_per_bar as f64,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Load time configuration of a voice, as provided by the loop metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    /// Identifier of the loop in the metadata storage. Informative only.
    pub loop_id: String,
    /// Native tempo of the loop.
    pub loop_bpm: f64,
    pub playback_mode: PlaybackMode,
    /// Start on musical boundaries and lock the loop's speed to the clock's tempo.
    pub tempo_sync: bool,
    /// Position in the loop, in loop beats, playback starts from.
    pub start_beat_offset: f64,
    pub quantize: Quantize,
    pub grain: GrainParameters,
    /// Linear voice gain (0.0 - 4.0).
    pub gain: f32,
    /// Voice panning (-1.0 - 1.0).
    pub pan: f32,
    /// Index of the stereo output channel pair the voice plays on.
    pub output_route: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            loop_id: String::new(),
            loop_bpm: 120.0,
            playback_mode: PlaybackMode::Loop,
            tempo_sync: true,
            start_beat_offset: 0.0,
            quantize: Quantize::Bar,
            grain: GrainParameters::default(),
            gain: 1.0,
            pan: 0.0,
            output_route: 0,
        }
    }
}

impl VoiceConfig {
    pub const MAX_GAIN: f32 = 4.0;

    /// Validate all parameters.
    pub fn validate(&self) -> Result<(), Error> {
        Self::validate_loop_bpm(self.loop_bpm)?;
        if !(self.start_beat_offset.is_finite() && self.start_beat_offset >= 0.0) {
            return Err(Error::ConfigError(format!(
                "Start beat offset must be >= 0, but is {}",
                self.start_beat_offset
            )));
        }
        Self::validate_gain(self.gain)?;
        Self::validate_pan(self.pan)?;
        self.grain.validate()
    }

    pub fn is_valid_loop_bpm(bpm: f64) -> bool {
        bpm.is_finite() && bpm > 0.0
    }

    pub fn is_valid_gain(gain: f32) -> bool {
        (0.0..=Self::MAX_GAIN).contains(&gain)
    }

    pub fn is_valid_pan(pan: f32) -> bool {
        (-1.0..=1.0).contains(&pan)
    }

    pub fn is_valid_route(route: usize, channel_count: usize) -> bool {
        if channel_count == 1 {
            route == 0
        } else {
            route * 2 + 1 < channel_count
        }
    }

    pub fn validate_loop_bpm(bpm: f64) -> Result<(), Error> {
        if !Self::is_valid_loop_bpm(bpm) {
            return Err(Error::ConfigError(format!(
                "Loop tempo must be > 0 BPM, but is {bpm}"
            )));
        }
        Ok(())
    }

    pub fn validate_gain(gain: f32) -> Result<(), Error> {
        if !Self::is_valid_gain(gain) {
            return Err(Error::ConfigError(format!(
                "Voice gain must be between 0.0 and {}, but is {gain}",
                Self::MAX_GAIN
            )));
        }
        Ok(())
    }

    pub fn validate_pan(pan: f32) -> Result<(), Error> {
        if !Self::is_valid_pan(pan) {
            return Err(Error::ConfigError(format!(
                "Voice panning must be between -1.0 and 1.0, but is {pan}"
            )));
        }
        Ok(())
    }

    /// Validate an output route against the engine's output channel layout.
    pub fn validate_route(route: usize, channel_count: usize) -> Result<(), Error> {
        if !Self::is_valid_route(route, channel_count) {
            return Err(Error::ConfigError(format!(
                "Output route {route} does not exist with {channel_count} output channels"
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Voice state changes which wait for a specific frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    Start,
    Restart,
    Resync,
}

/// Shared render state, passed to [`Voice::render`].
pub(crate) struct VoiceRenderContext<'a> {
    pub pool: &'a mut GrainPool,
    pub spawns: &'a mut SpawnList,
    pub settings: &'a Settings,
    /// Clock state at the start of the block.
    pub clock: &'a ClockState,
}

// -------------------------------------------------------------------------------------------------

/// Plays one loop buffer as a stream of grains.
///
/// Voices are owned and mutated by the engine's render thread only. All methods which change
/// the voice's state expect already validated values.
pub struct Voice {
    id: VoiceId,
    sample_rate: u32,
    config: VoiceConfig,
    buffer: Option<Shared<SampleBuffer>>,
    state: VoiceState,
    pending: Option<(SampleTime, PendingAction)>,
    scheduler: GrainScheduler,
    gain: LinearSmoothedValue,
}

impl Voice {
    pub(crate) fn new(
        id: VoiceId,
        config: VoiceConfig,
        buffer: Option<Shared<SampleBuffer>>,
        scheduler: GrainScheduler,
        sample_rate: u32,
    ) -> Self {
        let gain = LinearSmoothedValue::new(config.gain, sample_rate);
        Self {
            id,
            sample_rate,
            config,
            buffer,
            state: VoiceState::Stopped,
            pending: None,
            scheduler,
            gain,
        }
    }

    #[inline]
    pub fn id(&self) -> VoiceId {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> VoiceState {
        self.state
    }

    /// True when the voice waits for a quantized start, restart or resync.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// True when the voice is playing or about to start.
    pub fn is_active(&self) -> bool {
        self.state != VoiceState::Stopped || matches!(self.pending, Some((_, PendingAction::Start)))
    }

    pub fn buffer(&self) -> Option<&Shared<SampleBuffer>> {
        self.buffer.as_ref()
    }

    /// Start playing or, in retrigger mode, restart the loop. Tempo synced voices wait for the
    /// next quantization boundary.
    pub fn trigger(&mut self, clock: &Clock) -> Result<(), Error> {
        if self.buffer.is_none() {
            return Err(Error::BufferUnavailable(self.id));
        }
        let frame = if self.config.tempo_sync {
            clock.next_boundary(self.config.quantize.beats(clock.beats_per_bar()))
        } else {
            clock.total_frames()
        };
        match self.state {
            VoiceState::Stopped => self.pending = Some((frame, PendingAction::Start)),
            VoiceState::Playing | VoiceState::Muted => {
                if self.config.playback_mode == PlaybackMode::Retrigger {
                    self.pending = Some((frame, PendingAction::Restart));
                }
            }
        }
        Ok(())
    }

    /// Stop spawning grains. Grains which are already playing play out.
    pub fn stop(&mut self) {
        self.state = VoiceState::Stopped;
        self.pending = None;
    }

    pub fn mute(&mut self) {
        if self.state == VoiceState::Playing {
            self.state = VoiceState::Muted;
            self.gain.set_target(0.0);
        }
    }

    pub fn unmute(&mut self) {
        if self.state == VoiceState::Muted {
            self.state = VoiceState::Playing;
            self.gain.set_target(self.config.gain);
        }
    }

    /// Align the grain spawn grid to the next beat or bar boundary.
    pub fn resync(&mut self, clock: &Clock) {
        if self.state == VoiceState::Stopped {
            return;
        }
        if matches!(self.pending, None | Some((_, PendingAction::Resync))) {
            let frame = clock.next_boundary(self.config.quantize.beats(clock.beats_per_bar()));
            self.pending = Some((frame, PendingAction::Resync));
        }
    }

    pub fn set_pitch(&mut self, semitones: f32) {
        self.config.grain.pitch_semitones = semitones;
    }

    pub fn set_grain_parameters(&mut self, parameters: GrainParameters) {
        self.config.grain = parameters;
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.config.gain = gain;
        if self.state != VoiceState::Muted {
            self.gain.set_target(gain);
        }
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.config.pan = pan;
    }

    pub fn set_route(&mut self, route: usize) {
        self.config.output_route = route;
    }

    pub fn set_playback_mode(&mut self, mode: PlaybackMode) {
        self.config.playback_mode = mode;
    }

    /// Replace the voice's loop buffer. Stops the voice and returns the previous buffer.
    pub fn assign_buffer(
        &mut self,
        buffer: Shared<SampleBuffer>,
        loop_bpm: f64,
    ) -> Option<Shared<SampleBuffer>> {
        self.stop();
        self.config.loop_bpm = loop_bpm;
        self.buffer.replace(buffer)
    }

    /// True when the voice neither plays nor waits for a start nor has grains in flight.
    pub(crate) fn is_idle(&self, pool: &GrainPool) -> bool {
        self.state == VoiceState::Stopped
            && self.pending.is_none()
            && pool.active_count_of(self.id) == 0
    }

    /// True when muted and faded out completely.
    fn is_fully_muted(&self) -> bool {
        self.state == VoiceState::Muted && !self.gain.need_ramp() && self.gain.current() == 0.0
    }

    /// Source to output sample rate ratio.
    fn rate_factor(&self, buffer: &SampleBuffer) -> f64 {
        buffer.sample_rate() as f64 / self.sample_rate as f64
    }

    /// Source frames the read head moves per output frame. Tempo synced voices stretch their
    /// loop to the clock's tempo.
    fn read_speed(&self, buffer: &SampleBuffer, clock_bpm: f64) -> f64 {
        let rate_factor = self.rate_factor(buffer);
        if self.config.tempo_sync && self.config.loop_bpm > 0.0 {
            rate_factor * clock_bpm / self.config.loop_bpm
        } else {
            rate_factor
        }
    }

    /// Read head position playback (re)starts from.
    fn start_position(&self, buffer: &SampleBuffer) -> f64 {
        let frames_per_loop_beat = 60.0 / self.config.loop_bpm * buffer.sample_rate() as f64;
        let position = self.config.start_beat_offset * frames_per_loop_beat;
        if self.config.playback_mode.is_looping() && buffer.frame_count() > 0 {
            position.rem_euclid(buffer.frame_count() as f64)
        } else {
            position
        }
    }

    /// Render the voice into the given interleaved stereo buffer, which must be cleared.
    ///
    /// Continues all grains spawned in previous blocks, spawns and renders new grains, applies
    /// pending state changes at their frames and finally applies the voice's gain and panning.
    pub(crate) fn render(
        &mut self,
        context: &mut VoiceRenderContext,
        output: &mut [f32],
    ) -> Result<(), RenderFault> {
        let Some(buffer) = self.buffer.clone() else {
            self.stop();
            context.pool.release_voice(self.id);
            return Err(RenderFault::BufferUnavailable);
        };
        let looping = self.config.playback_mode.is_looping();

        context.pool.for_each_active_of(self.id, |grain| {
            grain.render_into(output, &buffer, looping);
        });

        let block_start = context.clock.total_frames;
        let block_end = block_start + (output.len() / 2) as SampleTime;
        let mut frame = block_start;
        while frame < block_end {
            let segment_end = match self.pending {
                Some((at, _)) if at < block_end => at.max(frame),
                _ => block_end,
            };
            if segment_end > frame {
                self.tick(context, &buffer, frame..segment_end, output);
                frame = segment_end;
            }
            if let Some((at, action)) = self.pending {
                if at <= frame {
                    self.pending = None;
                    self.apply_pending(action, frame, &buffer);
                }
            }
        }

        if self.is_fully_muted() {
            context.pool.release_voice(self.id);
            output.fill(0.0);
            return Ok(());
        }

        self.gain.apply(output, 2);
        if self.config.pan != 0.0 {
            let (pan_l, pan_r) = panning_factors(self.config.pan);
            for frame in output.chunks_exact_mut(2) {
                frame[0] *= pan_l;
                frame[1] *= pan_r;
            }
        }

        if sanitize_buffer(output) {
            return Err(RenderFault::NonFiniteOutput);
        }
        Ok(())
    }

    fn apply_pending(&mut self, action: PendingAction, frame: SampleTime, buffer: &SampleBuffer) {
        match action {
            PendingAction::Start => {
                self.state = VoiceState::Playing;
                self.gain.init(self.config.gain);
                self.scheduler.start(frame, self.start_position(buffer));
            }
            PendingAction::Restart => {
                self.scheduler.restart(frame, self.start_position(buffer));
            }
            PendingAction::Resync => {
                self.scheduler.resync(frame);
            }
        }
    }

    fn tick(
        &mut self,
        context: &mut VoiceRenderContext,
        buffer: &SampleBuffer,
        frames: std::ops::Range<SampleTime>,
        output: &mut [f32],
    ) {
        if self.state == VoiceState::Stopped {
            return;
        }
        let block_start = context.clock.total_frames;
        let tick_context = TickContext {
            params: &self.config.grain,
            settings: context.settings,
            tempo_sync: self.config.tempo_sync,
            read_speed: self.read_speed(buffer, context.clock.bpm),
            rate_factor: self.rate_factor(buffer),
            source_frames: buffer.frame_count(),
            looping: self.config.playback_mode.is_looping(),
        };
        context.spawns.clear();
        self.scheduler
            .tick(&tick_context, context.clock, block_start, frames, context.spawns);

        // fully muted voices keep their read head moving, but spawn nothing
        if !self.is_fully_muted() {
            for spawn in context.spawns.as_slice() {
                let handle = context.pool.spawn(
                    context.settings.overflow_policy,
                    self.id,
                    block_start + spawn.frame_offset as SampleTime,
                    spawn,
                );
                let offset = spawn.frame_offset * 2;
                context.pool.get_mut(handle).render_into(
                    &mut output[offset..],
                    buffer,
                    tick_context.looping,
                );
            }
        }

        if !tick_context.looping && self.scheduler.is_exhausted(&tick_context) {
            self.state = VoiceState::Stopped;
        }
    }
}

// -------------------------------------------------------------------------------------------------
