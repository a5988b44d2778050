//! Crate-wide error taxonomy.
//!
//! Each layer of the engine (commands, devices, experiments) defines its own
//! narrow error enum close to where it's raised; this module holds only the
//! aggregate that the binary and control API deal in, plus the shared
//! `AppResult` alias. Mirrors the single centralized `DaqError` the teacher
//! kept, but as a thin aggregator over per-layer `#[from]` sources instead of
//! one flat enum.

use thiserror::Error;

use crate::device::DeviceError;
use crate::experiment::ExperimentError;
use crate::result::CommandError;

/// Convenience alias for results using the crate's aggregate error type.
pub type AppResult<T> = std::result::Result<T, OrchError>;

#[derive(Error, Debug)]
pub enum OrchError {
    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("experiment error: {0}")]
    Experiment(#[from] ExperimentError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{n} of {total} devices failed to shut down cleanly")]
    ShutdownIncomplete { n: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_message() {
        let err = OrchError::Config("missing listen_port".into());
        assert_eq!(err.to_string(), "configuration error: missing listen_port");
    }

    #[test]
    fn shutdown_incomplete_displays_counts() {
        let err = OrchError::ShutdownIncomplete { n: 2, total: 5 };
        assert_eq!(
            err.to_string(),
            "2 of 5 devices failed to shut down cleanly"
        );
    }
}
