//! Non real-time side of the engine: settings, shared buffers, status and housekeeping.

use std::sync::Arc;

use basedrop::{Collector, Shared, SharedCell};

use crate::{
    event::ControlSender,
    sample_buffer::SampleBuffer,
    settings::Settings,
    status::{StatusBoard, StatusReader},
    watchdog::Watchdog,
    Error,
};

// -------------------------------------------------------------------------------------------------

/// Controls an [`Engine`](crate::Engine) from a non real-time thread.
///
/// Owns the garbage collector of all shared resources the engine uses. Call
/// [`Controller::maintain`] periodically, e.g. from the application's main or UI loop, so the
/// load watchdog can act and resources the engine released get freed.
pub struct Controller {
    collector: Collector,
    settings_cell: Arc<SharedCell<Settings>>,
    settings: Settings,
    status: Arc<StatusBoard>,
    sender: ControlSender,
    watchdog: Watchdog,
}

impl Controller {
    pub(crate) fn new(
        collector: Collector,
        settings_cell: Arc<SharedCell<Settings>>,
        settings: Settings,
        status: Arc<StatusBoard>,
        sender: ControlSender,
    ) -> Self {
        Self {
            collector,
            settings_cell,
            settings,
            status,
            sender,
            watchdog: Watchdog::new(),
        }
    }

    /// A new event sender. Senders can be moved to any other thread.
    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    /// A new status reader. Readers can be moved to any other thread.
    pub fn status_reader(&self) -> StatusReader {
        StatusReader::new(Arc::clone(&self.status))
    }

    /// Last published settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Validate and publish new settings. The engine picks them up at the start of its next
    /// callback.
    pub fn publish_settings(&mut self, settings: Settings) -> Result<(), Error> {
        settings.validate()?;
        self.settings_cell
            .set(Shared::new(&self.collector.handle(), settings));
        self.settings = settings;
        Ok(())
    }

    /// Wrap a decoded sample buffer, so it can be handed to the engine's voices.
    pub fn share_buffer(&self, buffer: SampleBuffer) -> Shared<SampleBuffer> {
        Shared::new(&self.collector.handle(), buffer)
    }

    /// Run periodic housekeeping: let the watchdog adjust the grain density to the engine's
    /// recent load and free resources the engine no longer uses.
    pub fn maintain(&mut self) {
        if let Some(density_scale) = self.watchdog.update(self.status.load(), &self.settings) {
            let settings = Settings {
                density_scale,
                ..self.settings
            };
            if let Err(err) = self.publish_settings(settings) {
                log::error!("Failed to publish throttled settings: {err}");
            }
        }
        self.collector.collect();
    }
}

// -------------------------------------------------------------------------------------------------
