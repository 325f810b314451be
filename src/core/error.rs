//! Fleet error taxonomy

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the supervision system.
///
/// Only [`FleetError::Configuration`] ever escapes [`super::FleetManager::start`];
/// every other variant is per-instance and is recorded on the instance record
/// instead of being propagated.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Impossible allocation, zero GPUs, invalid counts. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The external process could not be spawned.
    #[error("instance {ordinal}: launch failed: {reason}")]
    LaunchFailure { ordinal: usize, reason: String },

    /// The external process exited with a code other than the clean one.
    #[error("instance {ordinal}: crashed ({outcome})")]
    CrashExit { ordinal: usize, outcome: String },

    /// Too many crashes inside the observation window.
    #[error("instance {ordinal}: {crashes} crashes within {window:?}, giving up")]
    RestartBudgetExhausted {
        ordinal: usize,
        crashes: usize,
        window: Duration,
    },

    /// Log directory or file could not be created.
    #[error("instance {ordinal}: logging unavailable: {reason}")]
    Logging { ordinal: usize, reason: String },

    /// Graceful stop did not finish inside the grace period.
    #[error("instance {ordinal}: did not exit within {grace:?}, killed")]
    ShutdownTimeout { ordinal: usize, grace: Duration },
}

impl FleetError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;
