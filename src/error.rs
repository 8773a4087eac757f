use std::{error, fmt};

use crate::VoiceId;

// -------------------------------------------------------------------------------------------------

/// Provides an enumeration of all possible errors reported by grainloop.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    ConfigError(String),
    VoiceNotFound(VoiceId),
    BufferUnavailable(VoiceId),
    ResourceExhausted,
    SendError(String),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError(str) => write!(f, "Invalid configuration: {str}"),
            Self::VoiceNotFound(voice_id) => write!(f, "Voice with id {voice_id} not found"),
            Self::BufferUnavailable(voice_id) => {
                write!(f, "Voice with id {voice_id} has no sample buffer loaded")
            }
            Self::ResourceExhausted => write!(f, "Resource capacity exhausted"),
            Self::SendError(str) => write!(f, "Failed to send control event: {str}"),
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Reason why the engine refused to apply a control event.
///
/// Raised in the render callback, so unlike [`Error`] it carries no owned strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRejection {
    VoiceNotFound(VoiceId),
    BufferUnavailable(VoiceId),
    InvalidValue(&'static str),
}

impl fmt::Display for EventRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VoiceNotFound(voice_id) => write!(f, "Voice with id {voice_id} not found"),
            Self::BufferUnavailable(voice_id) => {
                write!(f, "Voice with id {voice_id} has no sample buffer loaded")
            }
            Self::InvalidValue(reason) => write!(f, "Invalid value: {reason}"),
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Failure of a single render unit (grain or voice) within one audio callback.
///
/// Faults never leave the render callback: the engine substitutes silence for the failing unit
/// and counts the fault in its stats. Kept `Copy` so raising one never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFault {
    /// The voice references a sample buffer which is not (or no longer) loaded.
    BufferUnavailable,
    /// A grain or voice produced a non finite sample value.
    NonFiniteOutput,
    /// A voice's render code panicked.
    Panicked,
}

impl fmt::Display for RenderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferUnavailable => write!(f, "sample buffer unavailable"),
            Self::NonFiniteOutput => write!(f, "non finite output"),
            Self::Panicked => write!(f, "render panic"),
        }
    }
}
