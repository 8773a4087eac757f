use crate::{grain::pool::OverflowPolicy, watchdog::WatchdogSettings, Error};

// -------------------------------------------------------------------------------------------------

/// Live engine settings.
///
/// Settings are published as immutable snapshots from the control side and picked up by the
/// render thread at the start of the next audio callback. See
/// [`Controller::publish_settings`](crate::Controller::publish_settings).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    /// Lower bound of a voice's grain rate in Hz.
    pub min_density_hz: f32,
    /// Upper bound of a voice's grain rate in Hz.
    pub max_density_hz: f32,
    /// How to make room for new grains when the grain pool is full.
    pub overflow_policy: OverflowPolicy,
    /// Scales all voice's grain rates (0.0 < scale <= 1.0). Lowered by the watchdog under load.
    pub density_scale: f32,
    /// Max number of control events applied in a single callback. Remaining events are
    /// applied in the following callbacks.
    pub max_events_per_callback: usize,
    pub watchdog: WatchdogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_density_hz: 1.0,
            max_density_hz: 100.0,
            overflow_policy: OverflowPolicy::DropOldest,
            density_scale: 1.0,
            max_events_per_callback: 64,
            watchdog: WatchdogSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.min_density_hz > 0.0
            && self.min_density_hz <= self.max_density_hz
            && self.max_density_hz.is_finite())
        {
            return Err(Error::ConfigError(format!(
                "Invalid grain density range: {} - {} Hz",
                self.min_density_hz, self.max_density_hz
            )));
        }
        if !(self.density_scale > 0.0 && self.density_scale <= 1.0) {
            return Err(Error::ConfigError(format!(
                "Density scale must be > 0.0 and <= 1.0, but is {}",
                self.density_scale
            )));
        }
        if self.max_events_per_callback == 0 {
            return Err(Error::ConfigError(
                "Max events per callback must be > 0".to_string(),
            ));
        }
        self.watchdog.validate()
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(Settings::default().validate().is_ok());
        let invalid = [
            Settings {
                min_density_hz: 0.0,
                ..Settings::default()
            },
            Settings {
                min_density_hz: 200.0,
                ..Settings::default()
            },
            Settings {
                density_scale: 0.0,
                ..Settings::default()
            },
            Settings {
                density_scale: 1.5,
                ..Settings::default()
            },
            Settings {
                max_events_per_callback: 0,
                ..Settings::default()
            },
        ];
        for settings in invalid {
            assert!(settings.validate().is_err(), "{settings:?} should be invalid");
        }
    }
}
