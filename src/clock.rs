//! Musical time: tempo, beat position and tap tempo detection.

use std::time::Duration;

use crate::{
    utils::time::{frames_per_beat, SampleTime},
    Error,
};

// -------------------------------------------------------------------------------------------------

/// Max number of tap intervals a clock can keep in its history.
pub const MAX_TAP_HISTORY: usize = 16;

// -------------------------------------------------------------------------------------------------

/// Tap tempo detection settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TapTempoConfig {
    /// Number of recent tap intervals the tempo gets estimated from (2 - 16).
    pub history_len: usize,
    /// Max relative deviation of an interval from the median interval. Intervals beyond are
    /// ignored as mis-taps.
    pub outlier_tolerance: f64,
    /// Two taps within this window are a trigger gesture, not a tempo sample.
    pub double_tap_window: Duration,
    /// Taps after a longer pause start a new tap sequence.
    pub max_tap_interval: Duration,
    pub min_bpm: f64,
    pub max_bpm: f64,
}

impl Default for TapTempoConfig {
    fn default() -> Self {
        Self {
            history_len: 8,
            outlier_tolerance: 0.25,
            double_tap_window: Duration::from_millis(125),
            max_tap_interval: Duration::from_secs(3),
            min_bpm: 20.0,
            max_bpm: 300.0,
        }
    }
}

impl TapTempoConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(2..=MAX_TAP_HISTORY).contains(&self.history_len) {
            return Err(Error::ConfigError(format!(
                "Tap history length must be between 2 and {MAX_TAP_HISTORY}"
            )));
        }
        if !(0.0..=1.0).contains(&self.outlier_tolerance) || self.outlier_tolerance == 0.0 {
            return Err(Error::ConfigError(
                "Tap outlier tolerance must be > 0.0 and <= 1.0".to_string(),
            ));
        }
        if self.double_tap_window >= self.max_tap_interval {
            return Err(Error::ConfigError(
                "Double tap window must be shorter than the max tap interval".to_string(),
            ));
        }
        if !(self.min_bpm > 0.0 && self.min_bpm < self.max_bpm && self.max_bpm.is_finite()) {
            return Err(Error::ConfigError(format!(
                "Invalid tempo range: {} - {}",
                self.min_bpm, self.max_bpm
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Result of a single tap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TapOutcome {
    /// First tap of a sequence. No tempo change.
    Recorded,
    /// The tempo got updated to the given BPM.
    Tempo(f64),
    /// The tap interval deviates too much from the recent ones and got ignored.
    Outlier,
    /// The tap completed a double tap: a start/stop gesture.
    Trigger,
}

// -------------------------------------------------------------------------------------------------

/// Copyable view of a clock's state at the start of a render block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    pub bpm: f64,
    pub frames_per_beat: f64,
    /// Beats elapsed since the clock started.
    pub beat_position: f64,
    pub total_frames: SampleTime,
}

// -------------------------------------------------------------------------------------------------

/// What to restore when the tap which just got recorded turns out to be a double tap.
#[derive(Debug, Clone, Copy)]
struct TapUndo {
    bpm: f64,
    pushed: bool,
    replaced: Option<f64>,
}

/// Fixed size ring of tap intervals in seconds.
#[derive(Debug, Clone, Copy)]
struct TapHistory {
    intervals: [f64; MAX_TAP_HISTORY],
    capacity: usize,
    len: usize,
    write_pos: usize,
}

impl TapHistory {
    fn new(capacity: usize) -> Self {
        debug_assert!((1..=MAX_TAP_HISTORY).contains(&capacity));
        Self {
            intervals: [0.0; MAX_TAP_HISTORY],
            capacity,
            len: 0,
            write_pos: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
        self.write_pos = 0;
    }

    /// Add an interval. Returns the interval which got overwritten, if any.
    fn push(&mut self, interval: f64) -> Option<f64> {
        let replaced = if self.len == self.capacity {
            Some(self.intervals[self.write_pos])
        } else {
            self.len += 1;
            None
        };
        self.intervals[self.write_pos] = interval;
        self.write_pos = (self.write_pos + 1) % self.capacity;
        replaced
    }

    /// Undo the last push.
    fn pop(&mut self, replaced: Option<f64>) {
        if self.len == 0 {
            return;
        }
        self.write_pos = (self.write_pos + self.capacity - 1) % self.capacity;
        if let Some(interval) = replaced {
            self.intervals[self.write_pos] = interval;
        } else {
            self.len -= 1;
        }
    }

    fn as_slice(&self) -> &[f64] {
        // when not full, all entries are stored in front of the write position
        &self.intervals[..self.len]
    }
}

// -------------------------------------------------------------------------------------------------

/// Sample accurate musical clock, advanced once per render block.
///
/// The tempo changes via tap tempo or explicit overrides only, both applied between render
/// blocks. Tempo changes keep the current beat phase.
#[derive(Debug, Clone)]
pub struct Clock {
    sample_rate: u32,
    bpm: f64,
    beats_per_bar: u32,
    total_frames: SampleTime,
    beat_position: f64,
    tap_config: TapTempoConfig,
    tap_history: TapHistory,
    last_tap: Option<Duration>,
    tap_undo: Option<TapUndo>,
}

impl Clock {
    pub fn new(
        sample_rate: u32,
        bpm: f64,
        beats_per_bar: u32,
        tap_config: TapTempoConfig,
    ) -> Result<Self, Error> {
        if sample_rate == 0 {
            return Err(Error::ConfigError("Invalid sample rate".to_string()));
        }
        if beats_per_bar == 0 {
            return Err(Error::ConfigError(
                "Beats per bar must be > 0".to_string(),
            ));
        }
        tap_config.validate()?;
        let mut clock = Self {
            sample_rate,
            bpm: tap_config.min_bpm,
            beats_per_bar,
            total_frames: 0,
            beat_position: 0.0,
            tap_config,
            tap_history: TapHistory::new(tap_config.history_len),
            last_tap: None,
            tap_undo: None,
        };
        clock.set_bpm(bpm)?;
        Ok(clock)
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    #[inline]
    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    #[inline]
    pub fn frames_per_beat(&self) -> f64 {
        frames_per_beat(self.bpm, self.sample_rate)
    }

    /// Total number of frames the clock advanced since it got created.
    #[inline]
    pub fn total_frames(&self) -> SampleTime {
        self.total_frames
    }

    /// Beats elapsed since the clock got created.
    #[inline]
    pub fn beat_position(&self) -> f64 {
        self.beat_position
    }

    pub fn state(&self) -> ClockState {
        ClockState {
            bpm: self.bpm,
            frames_per_beat: self.frames_per_beat(),
            beat_position: self.beat_position,
            total_frames: self.total_frames,
        }
    }

    /// Explicitly set a new tempo. Resets the tap sequence.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), Error> {
        if !self.is_valid_bpm(bpm) {
            let (min, max) = (self.tap_config.min_bpm, self.tap_config.max_bpm);
            return Err(Error::ConfigError(format!(
                "Tempo must be between {min} and {max} BPM, but is {bpm}"
            )));
        }
        self.apply_bpm(bpm);
        Ok(())
    }

    /// Is the given tempo within the clock's configured tempo range?
    pub fn is_valid_bpm(&self, bpm: f64) -> bool {
        (self.tap_config.min_bpm..=self.tap_config.max_bpm).contains(&bpm)
    }

    /// Set an already validated tempo. Resets the tap sequence.
    pub(crate) fn apply_bpm(&mut self, bpm: f64) {
        debug_assert!(self.is_valid_bpm(bpm), "Tempo out of range");
        self.bpm = bpm;
        self.reset_taps();
    }

    /// Forget all recorded taps.
    pub fn reset_taps(&mut self) {
        self.tap_history.clear();
        self.last_tap = None;
        self.tap_undo = None;
    }

    /// Move time forward by the given number of frames.
    pub fn advance(&mut self, frame_count: usize) {
        self.total_frames += frame_count as SampleTime;
        self.beat_position += frame_count as f64 / self.frames_per_beat();
    }

    /// Absolute frame of the next multiple of `subdivision` beats. Returns the current frame
    /// when the clock is exactly on such a boundary.
    pub fn next_boundary(&self, subdivision: f64) -> SampleTime {
        debug_assert!(subdivision > 0.0, "Invalid beat subdivision");
        let subdivision = subdivision.max(f64::EPSILON);
        let position = self.beat_position / subdivision;
        if (position - position.round()).abs() < 1e-9 {
            return self.total_frames;
        }
        let beats_until = position.ceil() * subdivision - self.beat_position;
        self.total_frames + (beats_until * self.frames_per_beat()).round() as SampleTime
    }

    /// Absolute frame of the next beat.
    pub fn next_beat(&self) -> SampleTime {
        self.next_boundary(1.0)
    }

    /// Absolute frame of the next bar.
    pub fn next_bar(&self) -> SampleTime {
        self.next_boundary(self.beats_per_bar as f64)
    }

    /// Feed a tap at the given monotonic timestamp.
    ///
    /// The tempo gets estimated from the mean of all recent intervals which are close to their
    /// median. A tap which follows the previous one within the double tap window is a trigger
    /// gesture: it is not recorded, and the previous tap gets undone as well.
    pub fn on_tap(&mut self, timestamp: Duration) -> TapOutcome {
        let Some(last_tap) = self.last_tap else {
            self.last_tap = Some(timestamp);
            self.tap_undo = Some(TapUndo {
                bpm: self.bpm,
                pushed: false,
                replaced: None,
            });
            return TapOutcome::Recorded;
        };

        let interval = timestamp.saturating_sub(last_tap);
        if interval < self.tap_config.double_tap_window {
            if let Some(undo) = self.tap_undo.take() {
                if undo.pushed {
                    self.tap_history.pop(undo.replaced);
                }
                self.bpm = undo.bpm;
            }
            self.last_tap = None;
            return TapOutcome::Trigger;
        }

        self.last_tap = Some(timestamp);
        if interval > self.tap_config.max_tap_interval {
            self.tap_history.clear();
            self.tap_undo = Some(TapUndo {
                bpm: self.bpm,
                pushed: false,
                replaced: None,
            });
            return TapOutcome::Recorded;
        }

        let interval = interval.as_secs_f64();
        let bpm = self.bpm;
        let replaced = self.tap_history.push(interval);
        self.tap_undo = Some(TapUndo {
            bpm,
            pushed: true,
            replaced,
        });

        let (mean_interval, accepted) = self.estimate_interval(interval);
        if let Some(mean_interval) = mean_interval {
            self.bpm = (60.0 / mean_interval)
                .clamp(self.tap_config.min_bpm, self.tap_config.max_bpm);
        }
        if accepted {
            TapOutcome::Tempo(self.bpm)
        } else {
            TapOutcome::Outlier
        }
    }

    /// Mean of all intervals within the outlier tolerance of the median interval, and whether
    /// the given latest interval is among them.
    fn estimate_interval(&self, latest: f64) -> (Option<f64>, bool) {
        let intervals = self.tap_history.as_slice();
        if intervals.is_empty() {
            return (None, false);
        }
        let mut sorted = [0.0; MAX_TAP_HISTORY];
        let sorted = &mut sorted[..intervals.len()];
        sorted.copy_from_slice(intervals);
        sorted.sort_unstable_by(f64::total_cmp);
        // lower median for even counts
        let median = sorted[(sorted.len() - 1) / 2];
        let tolerance = median * self.tap_config.outlier_tolerance;
        let is_inlier = |interval: f64| (interval - median).abs() <= tolerance;

        let (sum, count) = sorted
            .iter()
            .filter(|&&interval| is_inlier(interval))
            .fold((0.0, 0), |(sum, count), interval| (sum + interval, count + 1));
        if count == 0 || sum <= 0.0 {
            return (None, false);
        }
        (Some(sum / count as f64), is_inlier(latest))
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> Clock {
        Clock::new(48000, 100.0, 4, TapTempoConfig::default()).unwrap()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn tap_tempo_convergence() {
        let mut clock = clock();
        assert_eq!(clock.on_tap(ms(1000)), TapOutcome::Recorded);
        assert_eq!(clock.bpm(), 100.0);
        let mut time = 1000;
        for _ in 0..4 {
            time += 500;
            match clock.on_tap(ms(time)) {
                TapOutcome::Tempo(bpm) => assert!((bpm - 120.0).abs() < 0.5),
                outcome => panic!("unexpected tap outcome {outcome:?}"),
            }
        }
        assert!((clock.bpm() - 120.0).abs() < 0.5);
    }

    #[test]
    fn tap_outlier_rejection() {
        let mut clock = clock();
        let mut time = 0;
        clock.on_tap(ms(time));
        for _ in 0..3 {
            time += 500;
            clock.on_tap(ms(time));
        }
        time += 2000;
        assert_eq!(clock.on_tap(ms(time)), TapOutcome::Outlier);
        assert!((clock.bpm() - 120.0).abs() < 0.5);
        time += 500;
        assert!(matches!(clock.on_tap(ms(time)), TapOutcome::Tempo(_)));
        assert!((clock.bpm() - 120.0).abs() < 0.5);

        // a single outlier after the very first interval does not move the tempo either
        let mut clock = self::clock();
        clock.on_tap(ms(0));
        clock.on_tap(ms(500));
        assert_eq!(clock.on_tap(ms(2500)), TapOutcome::Outlier);
        assert!((clock.bpm() - 120.0).abs() < 0.5);
    }

    #[test]
    fn tap_tempo_follows_tempo_changes() {
        let mut clock = clock();
        let mut time = 0;
        clock.on_tap(ms(time));
        for _ in 0..8 {
            time += 500;
            clock.on_tap(ms(time));
        }
        for _ in 0..8 {
            time += 400;
            clock.on_tap(ms(time));
        }
        assert!((clock.bpm() - 150.0).abs() < 0.5);
    }

    #[test]
    fn double_tap_is_a_trigger() {
        let mut clock = clock();
        assert_eq!(clock.on_tap(ms(1000)), TapOutcome::Recorded);
        assert_eq!(clock.on_tap(ms(1080)), TapOutcome::Trigger);
        assert_eq!(clock.bpm(), 100.0);
        assert!(clock.tap_history.as_slice().is_empty());

        // double tap after a running sequence undoes the first tap of the pair
        let mut clock = self::clock();
        clock.on_tap(ms(0));
        clock.on_tap(ms(500));
        clock.on_tap(ms(1000));
        assert_eq!(clock.tap_history.as_slice().len(), 2);
        let bpm = clock.bpm();
        assert!(matches!(clock.on_tap(ms(1300)), TapOutcome::Outlier));
        assert_eq!(clock.on_tap(ms(1350)), TapOutcome::Trigger);
        assert_eq!(clock.tap_history.as_slice(), &[0.5, 0.5]);
        assert_eq!(clock.bpm(), bpm);
        // next tap starts a new sequence
        assert_eq!(clock.on_tap(ms(3000)), TapOutcome::Recorded);
    }

    #[test]
    fn long_pauses_restart_tap_sequence() {
        let mut clock = clock();
        clock.on_tap(ms(0));
        clock.on_tap(ms(500));
        assert_eq!(clock.on_tap(ms(10000)), TapOutcome::Recorded);
        assert!(clock.tap_history.as_slice().is_empty());
        assert!((clock.bpm() - 120.0).abs() < 0.5);
        assert!(matches!(clock.on_tap(ms(10600)), TapOutcome::Tempo(_)));
        assert!((clock.bpm() - 100.0).abs() < 0.5);
    }

    #[test]
    fn tap_history_ring() {
        let mut history = TapHistory::new(3);
        assert_eq!(history.push(1.0), None);
        assert_eq!(history.push(2.0), None);
        assert_eq!(history.push(3.0), None);
        assert_eq!(history.push(4.0), Some(1.0));
        assert_eq!(history.as_slice(), &[4.0, 2.0, 3.0]);
        history.pop(Some(1.0));
        assert_eq!(history.as_slice(), &[1.0, 2.0, 3.0]);
        history.pop(None);
        assert_eq!(history.as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn advance_and_boundaries() {
        let mut clock = Clock::new(48000, 120.0, 4, TapTempoConfig::default()).unwrap();
        assert_eq!(clock.frames_per_beat(), 24000.0);
        assert_eq!(clock.next_beat(), 0);
        clock.advance(1000);
        assert_eq!(clock.total_frames(), 1000);
        assert_eq!(clock.next_beat(), 24000);
        assert_eq!(clock.next_bar(), 96000);
        assert_eq!(clock.next_boundary(0.5), 12000);
        clock.advance(23000);
        assert!((clock.beat_position() - 1.0).abs() < 1e-9);
        assert_eq!(clock.next_beat(), 24000);

        // tempo changes keep the beat phase
        clock.advance(12000);
        clock.set_bpm(60.0).unwrap();
        assert_eq!(clock.next_beat(), 36000 + 24000);
    }

    #[test]
    fn validation() {
        let mut clock = clock();
        assert!(clock.set_bpm(0.0).is_err());
        assert!(clock.set_bpm(f64::NAN).is_err());
        assert!(!clock.is_valid_bpm(301.0));
        assert!(clock.is_valid_bpm(300.0));
        assert_eq!(clock.bpm(), 100.0);
        assert!(Clock::new(0, 120.0, 4, TapTempoConfig::default()).is_err());
        assert!(Clock::new(48000, 120.0, 0, TapTempoConfig::default()).is_err());
        let config = TapTempoConfig {
            history_len: 1,
            ..TapTempoConfig::default()
        };
        assert!(Clock::new(48000, 120.0, 4, config).is_err());
    }
}
