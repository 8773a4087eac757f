#![doc = include_str!("../README.md")]

// private mods (will be partly re-exported)
mod clock;
mod controller;
mod engine;
mod error;
mod event;
mod grain;
mod midi;
mod sample_buffer;
mod scheduler;
mod settings;
mod status;
mod voice;
mod watchdog;

/// Index of a voice within its [`Engine`].
pub type VoiceId = usize;

// public, flat re-exports
pub use error::{Error, EventRejection, RenderFault};

pub use engine::{Engine, EngineConfig};

pub use controller::Controller;
pub use event::{ControlEvent, ControlSender};
pub use midi::MidiMapping;

pub use clock::{Clock, ClockState, TapOutcome, TapTempoConfig, MAX_TAP_HISTORY};

pub use grain::{
    pool::{GrainHandle, GrainPool, OverflowPolicy},
    Grain, GrainSpawn, GrainState, GrainWindowMode,
};
pub use scheduler::{
    GrainMode, GrainParameters, GrainScheduler, ModulationTarget, SpawnList, TickContext,
};

pub use sample_buffer::SampleBuffer;
pub use settings::Settings;
pub use voice::{PlaybackMode, Quantize, Voice, VoiceConfig, VoiceState};

pub use status::{EngineStats, EngineStatus, StatusBoard, StatusReader, VoiceStatus};
pub use watchdog::{CpuLoad, LoadMeter, Watchdog, WatchdogSettings, LOAD_WINDOW};

pub use utils::lfo::LfoWaveform;

// public mods
pub mod utils;
