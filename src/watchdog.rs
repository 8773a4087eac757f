//! CPU load measurement of the render callback and grain density throttling.

use std::{
    fmt::Display,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use crate::{
    settings::Settings,
    utils::time::{sample_time_to_duration, SampleTime},
    Error,
};

// -------------------------------------------------------------------------------------------------

/// Number of callbacks the load meter averages over.
pub const LOAD_WINDOW: usize = 32;

// -------------------------------------------------------------------------------------------------

/// CPU load of the render callback.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct CpuLoad {
    /// Average CPU load over the measurement window.
    /// A value of 1.0 means the callback took as much time as the duration of the audio it
    /// produced.
    pub average: f32,
    /// Peak CPU load within the measurement window.
    pub peak: f32,
}

impl Display for CpuLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{:.2}% ({:.2}%)",
            self.average * 100.0,
            self.peak * 100.0
        ))
    }
}

// -------------------------------------------------------------------------------------------------

/// Lock free ring of the most recent callback loads.
///
/// Written by the render thread only, read by any other thread.
#[derive(Debug)]
pub struct LoadMeter {
    loads: [AtomicU32; LOAD_WINDOW],
    record_count: AtomicU64,
}

impl Default for LoadMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadMeter {
    pub fn new() -> Self {
        Self {
            loads: std::array::from_fn(|_| AtomicU32::new(0)),
            record_count: AtomicU64::new(0),
        }
    }

    /// Record the processing time of a callback which rendered `frame_count` frames.
    pub fn record(&self, processing_time: Duration, frame_count: usize, sample_rate: u32) {
        if frame_count == 0 || sample_rate == 0 {
            return;
        }
        let audio_time = sample_time_to_duration(frame_count as SampleTime, sample_rate);
        let load = (processing_time.as_secs_f64() / audio_time.as_secs_f64()) as f32;
        let count = self.record_count.load(Ordering::Relaxed);
        self.loads[(count % LOAD_WINDOW as u64) as usize].store(load.to_bits(), Ordering::Relaxed);
        self.record_count.store(count + 1, Ordering::Release);
    }

    /// Total number of recorded callbacks.
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    /// Average and peak load of the recent callbacks.
    pub fn cpu_load(&self) -> CpuLoad {
        let count = (self.record_count() as usize).min(LOAD_WINDOW);
        if count == 0 {
            return CpuLoad::default();
        }
        let (sum, peak) = self.loads[..count]
            .iter()
            .map(|load| f32::from_bits(load.load(Ordering::Relaxed)))
            .fold((0.0, 0.0_f32), |(sum, peak), load| (sum + load, peak.max(load)));
        CpuLoad {
            average: sum / count as f32,
            peak,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Grain density throttling settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogSettings {
    pub enabled: bool,
    /// Average load, relative to the callback deadline, above which grain density gets
    /// lowered.
    pub throttle_threshold: f32,
    /// Average load below which grain density gets raised again.
    pub recover_threshold: f32,
    /// Density scale change per watchdog update.
    pub throttle_step: f32,
    /// Lowest density scale the watchdog throttles to.
    pub min_density_scale: f32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            throttle_threshold: 0.7,
            recover_threshold: 0.4,
            throttle_step: 0.1,
            min_density_scale: 0.25,
        }
    }
}

impl WatchdogSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.recover_threshold > 0.0 && self.recover_threshold < self.throttle_threshold)
            || !self.throttle_threshold.is_finite()
        {
            return Err(Error::ConfigError(format!(
                "Invalid watchdog thresholds: recover {} must be > 0 and below throttle {}",
                self.recover_threshold, self.throttle_threshold
            )));
        }
        if !(self.throttle_step > 0.0 && self.throttle_step <= 1.0) {
            return Err(Error::ConfigError(
                "Watchdog throttle step must be > 0.0 and <= 1.0".to_string(),
            ));
        }
        if !(self.min_density_scale > 0.0 && self.min_density_scale <= 1.0) {
            return Err(Error::ConfigError(
                "Watchdog min density scale must be > 0.0 and <= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Derives new grain density scales from the render callback's recent load.
///
/// Runs on a non real-time thread. See [`Controller::maintain`](crate::Controller::maintain).
#[derive(Debug, Default)]
pub struct Watchdog {
    last_record_count: u64,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new density scale when the current one should change.
    ///
    /// Only acts when new callbacks got recorded since the last update, so a stalled render
    /// thread never gets throttled any further.
    pub fn update(&mut self, meter: &LoadMeter, settings: &Settings) -> Option<f32> {
        let watchdog = &settings.watchdog;
        let scale = settings.density_scale;
        if !watchdog.enabled {
            return (scale < 1.0).then_some(1.0);
        }
        let record_count = meter.record_count();
        if record_count == self.last_record_count {
            return None;
        }
        self.last_record_count = record_count;

        let load = meter.cpu_load().average;
        if load > watchdog.throttle_threshold && scale > watchdog.min_density_scale {
            let new_scale = (scale - watchdog.throttle_step).max(watchdog.min_density_scale);
            log::warn!(
                "Render load {:.1}% exceeds {:.1}%: lowering grain density to {:.0}%",
                load * 100.0,
                watchdog.throttle_threshold * 100.0,
                new_scale * 100.0
            );
            Some(new_scale)
        } else if load < watchdog.recover_threshold && scale < 1.0 {
            let new_scale = (scale + watchdog.throttle_step).min(1.0);
            log::info!(
                "Render load recovered: raising grain density to {:.0}%",
                new_scale * 100.0
            );
            Some(new_scale)
        } else {
            None
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record_load(meter: &LoadMeter, load: f64, count: usize) {
        // 480 frames at 48kHz are 10ms of audio
        for _ in 0..count {
            meter.record(Duration::from_secs_f64(0.01 * load), 480, 48000);
        }
    }

    #[test]
    fn load_meter() {
        let meter = LoadMeter::new();
        assert_eq!(meter.cpu_load(), CpuLoad::default());
        record_load(&meter, 0.5, 2);
        record_load(&meter, 1.0, 2);
        let load = meter.cpu_load();
        assert!((load.average - 0.75).abs() < 1e-4);
        assert!((load.peak - 1.0).abs() < 1e-4);

        // trailing window only
        record_load(&meter, 0.2, LOAD_WINDOW);
        let load = meter.cpu_load();
        assert!((load.average - 0.2).abs() < 1e-4);
        assert_eq!(meter.record_count(), 4 + LOAD_WINDOW as u64);
        assert_eq!(format!("{}", CpuLoad { average: 0.5, peak: 1.0 }), "50.00% (100.00%)");
    }

    #[test]
    fn throttles_and_recovers() {
        let meter = LoadMeter::new();
        let mut watchdog = Watchdog::new();
        let mut settings = Settings::default();

        assert_eq!(watchdog.update(&meter, &settings), None);

        record_load(&meter, 0.9, LOAD_WINDOW);
        let mut scales = vec![];
        for _ in 0..20 {
            if let Some(scale) = watchdog.update(&meter, &settings) {
                settings.density_scale = scale;
                scales.push(scale);
            }
            // no new measurements: no changes
            assert_eq!(watchdog.update(&meter, &settings), None);
            record_load(&meter, 0.9, 1);
        }
        assert!((settings.density_scale - 0.25).abs() < 1e-6);
        assert!(scales.windows(2).all(|w| w[1] < w[0]));

        record_load(&meter, 0.1, LOAD_WINDOW);
        for _ in 0..20 {
            if let Some(scale) = watchdog.update(&meter, &settings) {
                settings.density_scale = scale;
            }
            record_load(&meter, 0.1, 1);
        }
        assert_eq!(settings.density_scale, 1.0);

        // disabling restores the full density
        settings.density_scale = 0.5;
        settings.watchdog.enabled = false;
        assert_eq!(watchdog.update(&meter, &settings), Some(1.0));
    }

    #[test]
    fn validation() {
        assert!(WatchdogSettings::default().validate().is_ok());
        let invalid = WatchdogSettings {
            recover_threshold: 0.8,
            ..WatchdogSettings::default()
        };
        assert!(invalid.validate().is_err());
    }
}
