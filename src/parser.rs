//! Component C — turns a raw framed reply into a `(CommandResult or
//! CommandError, NextState)` pair.
//!
//! Grounded on the response-slicing style the teacher's driver code uses
//! when pulling values out of an instrument's reply line, generalized into
//! three reusable parser kinds instead of one-off per-driver code. `regex`
//! is already an ambient teacher dependency used for event/error pattern
//! scanning (component J).

use std::collections::HashMap;

use regex::Regex;

use crate::command::NextState;
use crate::result::{CommandError, CommandResult};

/// Outcome of parsing one reply.
pub type ParseOutcome = (Result<CommandResult, CommandError>, NextState);

/// Contract shared by every reply parser (spec.md §4.C).
pub trait Parser: Send + Sync {
    fn parse(&self, reply: &str) -> ParseOutcome;
}

/// Matches the full reply against a pattern; capture groups populate
/// `parameters`. If `expected` names a capture group and a required value
/// for it, a mismatch downgrades the parse to `(ResponseError, Retry)`.
pub struct RegexParser {
    pattern: Regex,
    expected: HashMap<String, String>,
}

impl RegexParser {
    #[must_use]
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            expected: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_expected(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.expected.insert(key.into(), value.into());
        self
    }
}

impl Parser for RegexParser {
    fn parse(&self, reply: &str) -> ParseOutcome {
        let Some(captures) = self.pattern.captures(reply) else {
            return (
                Err(CommandError::Response {
                    code: "NO_MATCH".into(),
                    message: format!("reply '{reply}' did not match expected pattern"),
                    result: Some(CommandResult::new(reply)),
                    captures: HashMap::new(),
                }),
                NextState::Retry,
            );
        };

        let mut parameters = HashMap::new();
        for name in self.pattern.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                parameters.insert(name.to_string(), m.as_str().to_string());
            }
        }

        for (key, expected_value) in &self.expected {
            match parameters.get(key) {
                Some(actual) if actual == expected_value => {}
                _ => {
                    return (
                        Err(CommandError::Response {
                            code: "UNEXPECTED_VALUE".into(),
                            message: format!(
                                "expected '{key}'='{expected_value}', got {:?}",
                                parameters.get(key)
                            ),
                            result: Some(CommandResult::new(reply)),
                            captures: parameters,
                        }),
                        NextState::Retry,
                    );
                }
            }
        }

        (
            Ok(CommandResult::new(reply).with_parameters(parameters)),
            NextState::Success,
        )
    }
}

/// Consults a per-device map from exact reply text to the next command
/// state (spec.md §4.C). Unknown replies retry as a response error; a
/// reply explicitly mapped to `Retry` is treated as a device error instead.
pub struct ReplyToStateParser {
    table: HashMap<String, NextState>,
}

impl ReplyToStateParser {
    #[must_use]
    pub fn new(table: HashMap<String, NextState>) -> Self {
        Self { table }
    }
}

impl Parser for ReplyToStateParser {
    fn parse(&self, reply: &str) -> ParseOutcome {
        match self.table.get(reply) {
            None => (
                Err(CommandError::Response {
                    code: "UNKNOWN_REPLY".into(),
                    message: format!("reply '{reply}' is not in the reply-to-state map"),
                    result: Some(CommandResult::new(reply)),
                    captures: HashMap::new(),
                }),
                NextState::Retry,
            ),
            Some(NextState::Success) => (Ok(CommandResult::new(reply)), NextState::Success),
            Some(NextState::Retry) => (
                Err(CommandError::DeviceError {
                    code: "MAPPED_RETRY".into(),
                    message: format!("reply '{reply}' is mapped to retry"),
                    result: Some(CommandResult::new(reply)),
                }),
                NextState::Retry,
            ),
            Some(other) => (
                Err(CommandError::Response {
                    code: "MAPPED_STATE".into(),
                    message: format!("reply '{reply}' mapped to {other:?}"),
                    result: Some(CommandResult::new(reply)),
                    captures: HashMap::new(),
                }),
                *other,
            ),
        }
    }
}

/// Always succeeds; for devices that do not respond meaningfully to a
/// command (spec.md §4.C).
#[derive(Default)]
pub struct SuccessParser;

impl Parser for SuccessParser {
    fn parse(&self, reply: &str) -> ParseOutcome {
        (Ok(CommandResult::new(reply)), NextState::Success)
    }
}
