//! Component G — latching predicates over the observable substrate.
//!
//! Grounded on `src/data/trigger.rs`'s `TriggerMode`/`TriggerState` edge/
//! level/window state machine, recast as threshold/interval/ongoing
//! conditions over component A's observable substrate instead of a
//! `DataProcessor` pipeline. The composite variants (`Ongoing`, `Combined`)
//! hold their operands by `ConditionId` rather than owning them directly —
//! arena-style back-references per Design Note §9 — so the registry that
//! resolves those ids lives in `condition_handler.rs` (component H).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::device::DeviceStateKind;
use crate::observable::{Sample, Value};

static NEXT_CONDITION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionId(u64);

impl ConditionId {
    pub fn new() -> Self {
        Self(NEXT_CONDITION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConditionId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a condition asks about, decoupled from the registry that actually
/// owns conditions (spec.md §4.G).
#[derive(Debug, Clone)]
pub enum ConditionKind {
    ObservableEquals {
        producer: String,
        name: String,
        value: Value,
    },
    GreaterOrEqual {
        producer: String,
        name: String,
        threshold: f64,
    },
    LessOrEqual {
        producer: String,
        name: String,
        threshold: f64,
    },
    InsideInterval {
        producer: String,
        name: String,
        lower: f64,
        upper: f64,
    },
    /// `inner` must hold continuously for at least `duration`; any false
    /// observation resets the stopwatch. Resolved recursively by the
    /// handler, which owns the `inner` condition.
    Ongoing { duration: Duration, inner: ConditionId },
    /// Logical AND over children, resolved recursively by the handler.
    Combined { children: Vec<ConditionId> },
    /// True iff every named device is in `target` and none has its
    /// `triggered_condition` flag set; single-shot gate on success.
    DevicesStateEquals {
        devices: Vec<String>,
        target: DeviceStateKind,
    },
    /// Schedules a timer at creation; true once it fires. Also an
    /// observable in its own right, emitting `"waited time"` on
    /// completion (spec.md §4.G).
    Time { duration: Duration },
}

/// What a `Condition` needs to read from (and, for `DevicesStateEquals`,
/// write to) the rest of the system. Implemented by whatever owns the
/// observable buses for every producer — typically a small facade over
/// the device fleet.
pub trait ObservationSource {
    fn latest(&self, producer: &str, name: &str) -> Option<Sample>;
    fn device_state_kind(&self, producer: &str) -> Option<DeviceStateKind>;
    fn triggered_condition(&self, producer: &str) -> bool;
    fn set_triggered_condition(&mut self, producer: &str, value: bool);
    /// Records a new sample for `producer`/`name`, the way a `Time`
    /// condition publishes its own `"waited time"` observable once it fires
    /// (spec.md §4.G).
    fn publish(&mut self, producer: &str, name: &str, value: Value, timestamp: DateTime<Utc>);
}

/// A single condition's persistent state: its kind, its latch, and
/// whatever bookkeeping the kind needs (the `Ongoing` stopwatch, the
/// `Time` deadline).
pub struct Condition {
    pub id: ConditionId,
    pub kind: ConditionKind,
    pub start_time: DateTime<Utc>,
    latched: bool,
    ongoing_since: Option<DateTime<Utc>>,
    fires_at: Option<DateTime<Utc>>,
}

impl Condition {
    #[must_use]
    pub fn new(kind: ConditionKind, now: DateTime<Utc>) -> Self {
        let fires_at = match &kind {
            ConditionKind::Time { duration } => {
                Some(now + chrono::Duration::from_std(*duration).unwrap_or_default())
            }
            _ => None,
        };
        Self {
            id: ConditionId::new(),
            kind,
            start_time: now,
            latched: false,
            ongoing_since: None,
            fires_at,
        }
    }

    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.latched
    }

    #[must_use]
    pub fn fires_at(&self) -> Option<DateTime<Utc>> {
        self.fires_at
    }

    /// Once `check_condition` returns true it stays true until
    /// `reset_status` (spec.md §4.G).
    pub fn reset_status(&mut self) {
        self.latched = false;
        self.ongoing_since = None;
    }

    /// The producers whose updates should trigger re-evaluation of this
    /// condition (spec.md §4.G). Composite kinds report no producers of
    /// their own — the handler resolves their operands' producers instead.
    #[must_use]
    pub fn observable_objects(&self) -> Vec<String> {
        match &self.kind {
            ConditionKind::ObservableEquals { producer, .. }
            | ConditionKind::GreaterOrEqual { producer, .. }
            | ConditionKind::LessOrEqual { producer, .. }
            | ConditionKind::InsideInterval { producer, .. } => vec![producer.clone()],
            ConditionKind::DevicesStateEquals { devices, .. } => devices.clone(),
            ConditionKind::Time { .. } => vec![format!("condition:{}", self.id.0)],
            ConditionKind::Ongoing { .. } | ConditionKind::Combined { .. } => Vec::new(),
        }
    }

    /// Evaluates the leaf kinds directly; `Ongoing`/`Combined` are resolved
    /// by the handler, which has access to the operand conditions, and
    /// should call `evaluate_leaf` only for the kinds this method handles.
    fn evaluate_leaf(&mut self, now: DateTime<Utc>, source: &mut dyn ObservationSource) -> bool {
        match &self.kind {
            ConditionKind::ObservableEquals { producer, name, value } => {
                source
                    .latest(producer, name)
                    .is_some_and(|s| s.timestamp >= self.start_time && &s.value == value)
            }
            ConditionKind::GreaterOrEqual { producer, name, threshold } => source
                .latest(producer, name)
                .is_some_and(|s| s.timestamp >= self.start_time && s.value.as_f64().is_some_and(|v| v >= *threshold)),
            ConditionKind::LessOrEqual { producer, name, threshold } => source
                .latest(producer, name)
                .is_some_and(|s| s.timestamp >= self.start_time && s.value.as_f64().is_some_and(|v| v <= *threshold)),
            ConditionKind::InsideInterval { producer, name, lower, upper } => source
                .latest(producer, name)
                .is_some_and(|s| {
                    s.timestamp >= self.start_time
                        && s.value.as_f64().is_some_and(|v| v >= *lower && v <= *upper)
                }),
            ConditionKind::DevicesStateEquals { devices, target } => {
                let all_match = devices.iter().all(|d| {
                    source.device_state_kind(d) == Some(*target) && !source.triggered_condition(d)
                });
                if all_match {
                    for d in devices {
                        source.set_triggered_condition(d, true);
                    }
                }
                all_match
            }
            ConditionKind::Time { .. } => {
                let fired = self.fires_at.is_some_and(|deadline| now >= deadline);
                if fired {
                    let producer = format!("condition:{}", self.id.0);
                    source.publish(&producer, "waited time", Value::Number(0.0), now);
                }
                fired
            }
            ConditionKind::Ongoing { .. } | ConditionKind::Combined { .. } => false,
        }
    }

    /// Entry point for leaf conditions only; composite kinds must be
    /// evaluated through the handler's recursive resolver.
    pub fn check_leaf(&mut self, now: DateTime<Utc>, source: &mut dyn ObservationSource) -> bool {
        if self.latched {
            return true;
        }
        if self.evaluate_leaf(now, source) {
            self.latched = true;
        }
        self.latched
    }

    /// Drives the `Ongoing` stopwatch given the inner condition's current
    /// truth value. Any false observation resets the timer (spec.md §4.G,
    /// tested by the seed "ongoing condition" scenario).
    pub fn advance_ongoing(&mut self, now: DateTime<Utc>, inner_true: bool, duration: Duration) -> bool {
        if self.latched {
            return true;
        }
        if inner_true {
            let since = *self.ongoing_since.get_or_insert(now);
            let elapsed = now.signed_duration_since(since);
            if elapsed >= chrono::Duration::from_std(duration).unwrap_or_default() {
                self.latched = true;
            }
        } else {
            self.ongoing_since = None;
        }
        self.latched
    }

    pub fn latch_combined(&mut self, all_true: bool) -> bool {
        if self.latched {
            return true;
        }
        if all_true {
            self.latched = true;
        }
        self.latched
    }
}
