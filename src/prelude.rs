//! Convenience re-exports.
//!
//! ```rust,ignore
//! use labrig::prelude::*;
//! ```

// =============================================================================
// Error handling
// =============================================================================

pub use crate::error::{AppResult, OrchError};

// =============================================================================
// Observable substrate
// =============================================================================

pub use crate::observable::{ObservableBus, Sample, Subscriber, Value};

// =============================================================================
// Command pipeline
// =============================================================================

pub use crate::command::{Command, CommandNode, CommandSpec, CommandState};
pub use crate::result::{CommandError, CommandResult};

// =============================================================================
// Device state machine
// =============================================================================

pub use crate::device::{Device, DeviceActor, DeviceError, DeviceStateKind};

// =============================================================================
// Conditions
// =============================================================================

pub use crate::condition::{Condition, ConditionId, ConditionKind, ObservationSource};
pub use crate::condition_handler::ConditionHandler;

// =============================================================================
// Derived observables
// =============================================================================

pub use crate::derived::{MathExpr, MathExpression, TimeIntegral};

// =============================================================================
// Experiment orchestration
// =============================================================================

pub use crate::experiment::{DeviceCall, DeviceDispatch, Experiment, ExperimentError, ExperimentId, Scheduler};
pub use crate::metadata::{Metadata, MetadataBuilder};

// =============================================================================
// Ambient stack
// =============================================================================

pub use crate::config::Settings;
pub use crate::storage::{JsonTextWriter, StorageWriter};
