//! Component B — value objects for device replies and typed failures.
//!
//! Grounded on the teacher's `src/error.rs` enum-of-named-failures shape,
//! re-expressed over command replies instead of application-wide errors.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A framed reply, captured the moment bytes become a complete line
/// (spec.md §4.B: "`Result(line)` captures `now()` at construction").
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub line: String,
    pub time: DateTime<Utc>,
    pub parameters: HashMap<String, String>,
    /// Identity of the command this result belongs to, back-linked by
    /// whoever stores the result (spec.md §3).
    pub command_id: Option<u64>,
}

impl CommandResult {
    #[must_use]
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            time: Utc::now(),
            parameters: HashMap::new(),
            command_id: None,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn for_command(mut self, command_id: u64) -> Self {
        self.command_id = Some(command_id);
        self
    }
}

/// The command-layer failure taxonomy from spec.md §3/§7. Each variant
/// carries the originating reply (when one exists), a fixed error-code
/// text, and whatever regex captures the parser pulled out.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    /// Reply didn't match the expected pattern, or an expected capture was
    /// absent. Default disposition: retry.
    #[error("response error ({code}): {message}")]
    Response {
        code: String,
        message: String,
        result: Option<CommandResult>,
        captures: HashMap<String, String>,
    },

    /// The device replied with a framed error. Default: retry, unless the
    /// command's `on_error` policy is `Fail`.
    #[error("device error ({code}): {message}")]
    DeviceError {
        code: String,
        message: String,
        result: Option<CommandResult>,
    },

    /// No reply arrived within the command's timeout. Default: retry,
    /// unless `on_timeout` is `Fail`.
    #[error("timed out waiting for reply")]
    Timeout,

    /// Retries exhausted; always fatal for the command.
    #[error("retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// A series' child failed; fatal for the series.
    #[error("series child failed: {0}")]
    SeriesError(Box<CommandError>),

    /// A capability the spec leaves unsupported by design (Open Question
    /// (b): `RepeatedCommand::cancel`).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The owning device is in a terminal state and rejects new work.
    #[error("device is {0} and rejects new commands")]
    DeviceTerminal(String),
}

impl CommandError {
    /// True for the two retryable-by-default kinds that a command's
    /// `on_error`/`on_timeout` policy can override to `Fail`.
    #[must_use]
    pub fn is_overridable(&self) -> bool {
        matches!(self, CommandError::DeviceError { .. } | CommandError::Timeout)
    }
}
