use std::time::Duration;

// -------------------------------------------------------------------------------------------------

/// Absolute time in sample frames since the engine started rendering.
pub type SampleTime = u64;

// -------------------------------------------------------------------------------------------------

/// Convert a duration to sample frames with the given sample rate.
pub fn duration_to_sample_time(duration: Duration, sample_rate: u32) -> SampleTime {
    debug_assert!(sample_rate > 0, "Invalid sample rate");
    (duration.as_secs_f64() * sample_rate as f64) as SampleTime
}

/// Convert sample frames to a duration with the given sample rate.
pub fn sample_time_to_duration(sample_time: SampleTime, sample_rate: u32) -> Duration {
    debug_assert!(sample_rate > 0, "Invalid sample rate");
    Duration::from_secs_f64(sample_time as f64 / sample_rate as f64)
}

/// Number of sample frames a single beat lasts at the given tempo.
pub fn frames_per_beat(bpm: f64, sample_rate: u32) -> f64 {
    debug_assert!(bpm > 0.0, "Invalid tempo");
    sample_rate as f64 * 60.0 / bpm
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(duration_to_sample_time(Duration::from_millis(500), 48000), 24000);
        assert_eq!(
            sample_time_to_duration(22050, 44100),
            Duration::from_millis(500)
        );
        assert_eq!(frames_per_beat(120.0, 48000), 24000.0);
    }
}
