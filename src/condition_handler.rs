//! Component H — the central condition dispatcher.
//!
//! Owns every registered `Condition`, the map from condition to its
//! waiting continuations, and a producer→candidate index built at
//! registration time. Re-entrancy is forbidden during its own fan-out
//! (spec.md §4.H, §8): an update arriving while an evaluation pass is
//! already running is simply dropped, mirroring the observable substrate's
//! own guard in component A.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::condition::{Condition, ConditionId, ConditionKind, ObservationSource};

static NEXT_CONTINUATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationId(u64);

impl ContinuationId {
    fn new() -> Self {
        Self(NEXT_CONTINUATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Default)]
pub struct ConditionHandler {
    conditions: HashMap<ConditionId, Condition>,
    continuations: HashMap<ConditionId, Vec<(ContinuationId, oneshot::Sender<()>)>>,
    producer_index: HashMap<String, Vec<ConditionId>>,
    in_progress: bool,
}

impl ConditionHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a condition and indexes it under every producer whose
    /// updates should cause re-evaluation (resolved transitively for
    /// `Ongoing`/`Combined`, whose own `observable_objects()` is empty).
    pub fn register(&mut self, condition: Condition) -> ConditionId {
        let id = condition.id;
        self.conditions.insert(id, condition);
        for producer in self.resolve_objects(id) {
            self.producer_index.entry(producer).or_default().push(id);
        }
        id
    }

    pub fn deregister(&mut self, id: ConditionId) {
        self.conditions.remove(&id);
        self.continuations.remove(&id);
        for list in self.producer_index.values_mut() {
            list.retain(|c| *c != id);
        }
    }

    /// Attaches a continuation to a condition; fires once the condition
    /// becomes true. Returns a token usable with `detach`.
    pub fn attach(&mut self, id: ConditionId) -> (ContinuationId, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let cont_id = ContinuationId::new();
        self.continuations.entry(id).or_default().push((cont_id, tx));
        (cont_id, rx)
    }

    /// Deregisters `(condition, continuation)`; a missing entry is
    /// tolerated (spec.md §4.H).
    pub fn detach(&mut self, id: ConditionId, cont_id: ContinuationId) {
        if let Some(list) = self.continuations.get_mut(&id) {
            list.retain(|(c, _)| *c != cont_id);
        }
    }

    #[must_use]
    pub fn is_latched(&self, id: ConditionId) -> bool {
        self.conditions.get(&id).is_some_and(Condition::is_latched)
    }

    /// Drives one observable update through the dispatcher (spec.md §4.H).
    pub fn on_update(&mut self, producer: &str, now: DateTime<Utc>, source: &mut dyn ObservationSource) {
        if self.in_progress {
            return;
        }
        self.in_progress = true;

        let mut candidates = self.producer_index.get(producer).cloned().unwrap_or_default();
        loop {
            let mut changed = false;
            for id in &candidates {
                if !self.continuations.contains_key(id) {
                    continue;
                }
                if self.evaluate_recursive(*id, now, source) {
                    self.fire(*id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            // Fixpoint: a firing may have satisfied a `Combined`/`Ongoing`
            // parent that wasn't in the initial candidate set.
            candidates = self.conditions.keys().copied().collect();
        }

        self.in_progress = false;
    }

    /// Re-evaluates every condition with an attached continuation, independent
    /// of any producer update. Drives conditions whose truth depends purely
    /// on elapsed time (`Time`, an `Ongoing` whose inner hasn't changed) —
    /// the "Reactor + callLater" timer service of Design Note §9, called
    /// periodically by whatever owns the wall clock.
    pub fn tick(&mut self, now: DateTime<Utc>, source: &mut dyn ObservationSource) {
        if self.in_progress {
            return;
        }
        self.in_progress = true;
        loop {
            let mut changed = false;
            let candidates: Vec<ConditionId> = self.continuations.keys().copied().collect();
            for id in candidates {
                if self.evaluate_recursive(id, now, source) {
                    self.fire(id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.in_progress = false;
    }

    /// The earliest `fires_at` among every registered condition (not just
    /// ones with a continuation attached directly — a `Time` condition
    /// nested under a `Combined`/`Ongoing` parent still needs `tick` to run
    /// at its deadline for that parent to ever become true), if any — lets
    /// the owning scheduler sleep until there's actually something to
    /// re-check instead of polling blindly.
    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.conditions.values().filter_map(Condition::fires_at).min()
    }

    fn fire(&mut self, id: ConditionId) {
        // Removed from the map before continuations run: at-most-once
        // delivery (spec.md §3 invariant).
        if let Some(list) = self.continuations.remove(&id) {
            for (_, tx) in list {
                let _ = tx.send(());
            }
        }
    }

    fn resolve_objects(&self, id: ConditionId) -> Vec<String> {
        let Some(cond) = self.conditions.get(&id) else {
            return Vec::new();
        };
        match &cond.kind {
            ConditionKind::Ongoing { inner, .. } => self.resolve_objects(*inner),
            ConditionKind::Combined { children } => {
                children.iter().flat_map(|c| self.resolve_objects(*c)).collect()
            }
            _ => cond.observable_objects(),
        }
    }

    fn evaluate_recursive(
        &mut self,
        id: ConditionId,
        now: DateTime<Utc>,
        source: &mut dyn ObservationSource,
    ) -> bool {
        if !self.conditions.contains_key(&id) {
            return false;
        }

        enum Shape {
            Leaf,
            Ongoing(std::time::Duration, ConditionId),
            Combined(Vec<ConditionId>),
        }

        let shape = {
            let cond = self.conditions.get(&id).expect("checked above");
            if cond.is_latched() {
                return true;
            }
            match &cond.kind {
                ConditionKind::Ongoing { duration, inner } => Shape::Ongoing(*duration, *inner),
                ConditionKind::Combined { children } => Shape::Combined(children.clone()),
                _ => Shape::Leaf,
            }
        };

        match shape {
            Shape::Leaf => self
                .conditions
                .get_mut(&id)
                .expect("checked above")
                .check_leaf(now, source),
            Shape::Ongoing(duration, inner) => {
                let inner_true = self.evaluate_recursive(inner, now, source);
                self.conditions
                    .get_mut(&id)
                    .expect("checked above")
                    .advance_ongoing(now, inner_true, duration)
            }
            Shape::Combined(children) => {
                let all_true = children
                    .iter()
                    .map(|c| self.evaluate_recursive(*c, now, source))
                    .collect::<Vec<_>>()
                    .into_iter()
                    .all(|t| t);
                self.conditions
                    .get_mut(&id)
                    .expect("checked above")
                    .latch_combined(all_true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStateKind;
    use crate::observable::{Sample, Value};
    use std::collections::HashMap as Map;
    use std::time::Duration;

    struct FakeSource {
        samples: Map<(String, String), Sample>,
        states: Map<String, DeviceStateKind>,
        triggered: Map<String, bool>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                samples: Map::new(),
                states: Map::new(),
                triggered: Map::new(),
            }
        }

        fn set(&mut self, producer: &str, name: &str, value: Value, timestamp: DateTime<Utc>) {
            self.samples
                .insert((producer.to_string(), name.to_string()), Sample { timestamp, value });
        }
    }

    impl ObservationSource for FakeSource {
        fn latest(&self, producer: &str, name: &str) -> Option<Sample> {
            self.samples.get(&(producer.to_string(), name.to_string())).cloned()
        }
        fn device_state_kind(&self, producer: &str) -> Option<DeviceStateKind> {
            self.states.get(producer).copied()
        }
        fn triggered_condition(&self, producer: &str) -> bool {
            *self.triggered.get(producer).unwrap_or(&false)
        }
        fn set_triggered_condition(&mut self, producer: &str, value: bool) {
            self.triggered.insert(producer.to_string(), value);
        }
        fn publish(&mut self, producer: &str, name: &str, value: Value, timestamp: DateTime<Utc>) {
            self.set(producer, name, value, timestamp);
        }
    }

    #[test]
    fn fires_continuation_once_condition_becomes_true() {
        let now = Utc::now();
        let mut handler = ConditionHandler::new();
        let mut source = FakeSource::new();
        let cond = Condition::new(
            crate::condition::ConditionKind::GreaterOrEqual {
                producer: "nmr".into(),
                name: "temp".into(),
                threshold: 10.0,
            },
            now,
        );
        let id = handler.register(cond);
        let (_token, rx) = handler.attach(id);

        source.set("nmr", "temp", Value::Number(5.0), now);
        handler.on_update("nmr", now, &mut source);
        assert!(rx.try_recv().is_err(), "should not fire below threshold");

        source.set("nmr", "temp", Value::Number(11.0), now);
        handler.on_update("nmr", now, &mut source);
        assert!(rx.try_recv().is_ok(), "should fire once threshold met");
    }

    #[test]
    fn combined_condition_fires_only_when_all_children_true() {
        let now = Utc::now();
        let mut handler = ConditionHandler::new();
        let mut source = FakeSource::new();

        let c1 = handler.register(Condition::new(
            crate::condition::ConditionKind::GreaterOrEqual {
                producer: "a".into(),
                name: "x".into(),
                threshold: 1.0,
            },
            now,
        ));
        let c2 = handler.register(Condition::new(
            crate::condition::ConditionKind::GreaterOrEqual {
                producer: "b".into(),
                name: "x".into(),
                threshold: 1.0,
            },
            now,
        ));
        let combined = handler.register(Condition::new(
            crate::condition::ConditionKind::Combined { children: vec![c1, c2] },
            now,
        ));
        let (_token, rx) = handler.attach(combined);

        source.set("a", "x", Value::Number(2.0), now);
        handler.on_update("a", now, &mut source);
        assert!(rx.try_recv().is_err());

        source.set("b", "x", Value::Number(2.0), now);
        handler.on_update("b", now, &mut source);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn ongoing_condition_fires_at_seed_scenario_timestamps() {
        // spec.md §8 seed scenario 5: samples 0:5,1:5,2:11,3:11,4:5;
        // OngoingCondition(1.0, value>=10) fires exactly at t=3.
        let t0 = Utc::now();
        let at = |secs: i64| t0 + chrono::Duration::seconds(secs);

        let mut handler = ConditionHandler::new();
        let mut source = FakeSource::new();
        let inner = handler.register(Condition::new(
            crate::condition::ConditionKind::GreaterOrEqual {
                producer: "sensor".into(),
                name: "value".into(),
                threshold: 10.0,
            },
            t0,
        ));
        let ongoing = handler.register(Condition::new(
            crate::condition::ConditionKind::Ongoing {
                duration: Duration::from_secs(1),
                inner,
            },
            t0,
        ));
        let (_token, rx) = handler.attach(ongoing);

        let samples = [(0, 5.0), (1, 5.0), (2, 11.0), (3, 11.0), (4, 5.0)];
        let mut fired_at = None;
        for (t, v) in samples {
            source.set("sensor", "value", Value::Number(v), at(t));
            handler.on_update("sensor", at(t), &mut source);
            if rx.try_recv().is_ok() && fired_at.is_none() {
                fired_at = Some(t);
            }
        }
        assert_eq!(fired_at, Some(3));
    }

    #[test]
    fn reentrant_update_during_evaluation_is_dropped() {
        let now = Utc::now();
        let mut handler = ConditionHandler::new();
        handler.in_progress = true;
        let mut source = FakeSource::new();
        // Should return immediately without touching candidates/panicking.
        handler.on_update("anything", now, &mut source);
        assert!(handler.in_progress, "guard only cleared by the owning pass");
    }

    #[test]
    fn tick_fires_a_time_condition_once_its_deadline_passes() {
        let t0 = Utc::now();
        let mut handler = ConditionHandler::new();
        let mut source = FakeSource::new();
        let id = handler.register(Condition::new(
            crate::condition::ConditionKind::Time { duration: Duration::from_secs(1) },
            t0,
        ));
        let (_token, rx) = handler.attach(id);

        handler.tick(t0, &mut source);
        assert!(rx.try_recv().is_err(), "deadline not yet reached");

        handler.tick(t0 + chrono::Duration::seconds(2), &mut source);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn next_deadline_reports_the_earliest_pending_time_condition() {
        let t0 = Utc::now();
        let mut handler = ConditionHandler::new();
        assert!(handler.next_deadline().is_none(), "nothing registered yet");

        handler.register(Condition::new(
            crate::condition::ConditionKind::Time { duration: Duration::from_secs(5) },
            t0,
        ));
        let sooner = handler.register(Condition::new(
            crate::condition::ConditionKind::Time { duration: Duration::from_secs(1) },
            t0,
        ));
        let sooner_deadline = handler.conditions.get(&sooner).unwrap().fires_at().unwrap();
        assert_eq!(handler.next_deadline(), Some(sooner_deadline));
    }

    #[test]
    fn detach_missing_continuation_is_tolerated() {
        let now = Utc::now();
        let mut handler = ConditionHandler::new();
        let id = handler.register(Condition::new(
            crate::condition::ConditionKind::Time { duration: Duration::from_secs(1) },
            now,
        ));
        handler.detach(id, ContinuationId::new());
    }
}
