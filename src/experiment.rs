//! Component K — the experiment scheduler.
//!
//! An `Experiment` holds an ordered list of device calls and nested
//! sub-experiments, runs them to completion against a fleet of devices, and
//! tears itself down (stop-conditions, subscriptions, device `stop()`)
//! whichever way it ends. The `Scheduler` is a queue of these, advancing one
//! at a time. Dispatching a named device method is left to a
//! `DeviceDispatch` implementor: per spec.md's scope notes, a concrete
//! per-instrument method catalog is an interface, not something this crate
//! invents. Grounded on the teacher's `Metadata`-per-run pattern
//! (`src/metadata.rs`); persistence itself is delegated to
//! `crate::storage::StorageWriter`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::poll_fn;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::CommandNode;
use crate::condition::{Condition, ConditionId, ConditionKind, ObservationSource};
use crate::condition_handler::{ConditionHandler, ContinuationId};
use crate::device::{DeviceError, DeviceStateKind};
use crate::metadata::Metadata;
use crate::observable::{Sample, Subscriber, Value};
use crate::storage::{JsonTextWriter, StorageError, StorageWriter};

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("experiment id {0} is already queued or running")]
    NonUniqueId(ExperimentId),
    #[error("invalid experiment ordering")]
    ExperimentOrder,
    #[error("setup rejects mutation in its current state")]
    SetupState,
    #[error("device '{0}' failed")]
    DeviceFailed(String),
    #[error("sub-experiment '{0}' failed")]
    SubExperimentFailed(String),
    #[error("a stop-condition fired")]
    StopConditionTriggered,
    #[error("failed to persist run artifacts: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExperimentId(Uuid);

impl ExperimentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ExperimentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Waiting -> Running -> {Finished, Failed}` (spec.md §3 lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    Waiting,
    Running,
    Finished,
    Failed,
}

/// One `(device, method, args, kwargs)` entry (spec.md §4.K).
#[derive(Debug, Clone)]
pub struct DeviceCall {
    pub device: String,
    pub method: String,
    pub args: Vec<JsonValue>,
    pub kwargs: HashMap<String, JsonValue>,
}

pub enum ExperimentStep {
    Call(DeviceCall),
    Sub(Experiment),
    /// Submits a pre-built `CommandNode` (a `Series`/`Repeated`/`Wait`, the
    /// constructs a bare `DeviceCall` can't express) directly to a device.
    /// `CommandNode` isn't `Clone` and carries live oneshot senders, so the
    /// node is taken out of its `Option` slot the one time this step runs.
    Submit(String, Option<CommandNode>),
}

/// The seam between the scheduler's ordering/teardown logic and the actual
/// device fleet. A concrete per-instrument method catalog is out of scope
/// (spec.md §1) — whatever owns the `DeviceActor`s implements this.
#[async_trait]
pub trait DeviceDispatch: Send + Sync {
    async fn call(&self, call: &DeviceCall) -> Result<(), DeviceError>;
    /// Submits a pre-built `CommandNode` directly, bypassing the named
    /// method catalog `call` goes through — the entry point `Series`/
    /// `Repeated`/`Wait` steps use.
    async fn submit(&self, device: &str, node: CommandNode) -> Result<(), DeviceError>;
    fn device_state_kind(&self, device: &str) -> Option<DeviceStateKind>;
    fn subscribe(&self, device: &str, subscriber: Arc<dyn Subscriber>);
    fn unsubscribe(&self, device: &str, subscriber: &Arc<dyn Subscriber>);
    async fn stop(&self, device: &str);
}

/// Buffers every observable update seen while an experiment runs, keyed
/// `device -> variable -> [(timestamp, value)]` (spec.md §6 `values.json`).
#[derive(Default)]
struct ObservationRecorder {
    buffer: Mutex<HashMap<String, HashMap<String, Vec<(DateTime<Utc>, Value)>>>>,
}

impl Subscriber for ObservationRecorder {
    fn notify(&self, producer: &str, name: &str, sample: &Sample) {
        let mut buffer = self.buffer.lock().expect("observation recorder mutex poisoned");
        buffer
            .entry(producer.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push((sample.timestamp, sample.value.clone()));
    }
}

/// A scripted run: device calls and sub-experiments, stop-conditions, a
/// per-run log directory (spec.md §4.K).
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub metadata: Metadata,
    steps: Vec<ExperimentStep>,
    devices: Vec<String>,
    stop_condition_kinds: Vec<ConditionKind>,
    stop_condition_ids: Vec<ConditionId>,
    cursor: usize,
    pub state: ExperimentState,
    log_dir: PathBuf,
    start_time: Option<DateTime<Utc>>,
    recorder: Arc<ObservationRecorder>,
    writer: Arc<dyn StorageWriter>,
}

impl Experiment {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        steps: Vec<ExperimentStep>,
        devices: Vec<String>,
        stop_conditions: Vec<ConditionKind>,
    ) -> Self {
        let name = name.into();
        Self {
            id: ExperimentId::new(),
            metadata: Metadata {
                experiment_name: name.clone(),
                ..Metadata::default()
            },
            name,
            steps,
            devices,
            stop_condition_kinds: stop_conditions,
            stop_condition_ids: Vec::new(),
            cursor: 0,
            state: ExperimentState::Waiting,
            log_dir: PathBuf::new(),
            start_time: None,
            recorder: Arc::new(ObservationRecorder::default()),
            writer: Arc::new(JsonTextWriter),
        }
    }

    /// Runs to a terminal state under `log_root`, tearing down regardless of
    /// outcome (spec.md §4.K "Teardown"). Sub-experiments share the parent's
    /// directory under a subfolder named after them.
    pub async fn run(
        &mut self,
        dispatch: &dyn DeviceDispatch,
        conditions: &mut ConditionHandler,
        source: &mut dyn ObservationSource,
        log_root: &Path,
    ) -> Result<(), ExperimentError> {
        self.state = ExperimentState::Running;
        let start = Utc::now();
        self.start_time = Some(start);
        self.log_dir = log_root
            .join(start.format("%Y").to_string())
            .join(start.format("%m").to_string())
            .join(start.format("%d").to_string())
            .join(self.id.to_string());

        for device in &self.devices {
            dispatch.subscribe(device, self.recorder.clone());
        }

        let mut fail_rxs: Vec<(ConditionId, ContinuationId, oneshot::Receiver<()>)> = Vec::new();
        for kind in self.stop_condition_kinds.drain(..) {
            let id = conditions.register(Condition::new(kind, start));
            let (token, rx) = conditions.attach(id);
            self.stop_condition_ids.push(id);
            fail_rxs.push((id, token, rx));
        }

        let outcome = self.drive(dispatch, conditions, source, &mut fail_rxs).await;

        for (id, token, _rx) in fail_rxs {
            conditions.detach(id, token);
        }
        for id in self.stop_condition_ids.drain(..) {
            conditions.deregister(id);
        }
        let recorder: Arc<dyn Subscriber> = self.recorder.clone();
        for device in &self.devices {
            dispatch.unsubscribe(device, &recorder);
        }
        if let Err(e) = self.persist(outcome.is_ok()) {
            warn!(experiment = %self.name, error = %e, "failed to persist run artifacts");
        }
        for device in &self.devices {
            dispatch.stop(device).await;
        }

        self.state = if outcome.is_ok() {
            ExperimentState::Finished
        } else {
            ExperimentState::Failed
        };
        info!(experiment = %self.name, id = %self.id, state = ?self.state, "experiment reached terminal state");
        outcome
    }

    async fn drive(
        &mut self,
        dispatch: &dyn DeviceDispatch,
        conditions: &mut ConditionHandler,
        source: &mut dyn ObservationSource,
        fail_rxs: &mut Vec<(ConditionId, ContinuationId, oneshot::Receiver<()>)>,
    ) -> Result<(), ExperimentError> {
        while self.cursor < self.steps.len() {
            let step_fut = self.execute_step(self.cursor, dispatch, conditions, source);
            tokio::pin!(step_fut);

            loop {
                let stop_fut = any_condition_fired(fail_rxs);
                tokio::pin!(stop_fut);

                // Sleep exactly until whichever registered condition's
                // deadline comes first, instead of polling on a fixed
                // interval: a condition with no `Time`-kind operand has no
                // deadline at all, so there is nothing to re-check until a
                // producer update or the stop-condition itself fires.
                let now = Utc::now();
                let tick_fut: std::pin::Pin<Box<dyn Future<Output = ()> + Send>> =
                    match conditions.next_deadline() {
                        Some(deadline) => {
                            let wait = (deadline - now).to_std().unwrap_or_default();
                            Box::pin(tokio::time::sleep(wait))
                        }
                        None => Box::pin(std::future::pending()),
                    };

                tokio::select! {
                    res = &mut step_fut => {
                        res?;
                        self.cursor += 1;
                        break;
                    }
                    Some(_id) = &mut stop_fut => {
                        return Err(ExperimentError::StopConditionTriggered);
                    }
                    () = tick_fut => {
                        conditions.tick(Utc::now(), source);
                    }
                }
            }
        }
        self.wait_for_devices_idle(dispatch).await;
        Ok(())
    }

    async fn execute_step(
        &mut self,
        idx: usize,
        dispatch: &dyn DeviceDispatch,
        conditions: &mut ConditionHandler,
        source: &mut dyn ObservationSource,
    ) -> Result<(), ExperimentError> {
        match &mut self.steps[idx] {
            ExperimentStep::Sub(_) => {
                let sub_log_root = self.log_dir.clone();
                let ExperimentStep::Sub(sub) = &mut self.steps[idx] else {
                    unreachable!("checked above")
                };
                let name = sub.name.clone();
                sub.run(dispatch, conditions, source, &sub_log_root)
                    .await
                    .map_err(|_| ExperimentError::SubExperimentFailed(name))
            }
            ExperimentStep::Submit(device, node_slot) => {
                let device = device.clone();
                let node = node_slot
                    .take()
                    .expect("a Submit step's node is only taken once, by its own execution");
                dispatch
                    .submit(&device, node)
                    .await
                    .map_err(|e| ExperimentError::DeviceFailed(format!("{device}: {e}")))?;
                if dispatch.device_state_kind(&device) == Some(DeviceStateKind::Error) {
                    return Err(ExperimentError::DeviceFailed(device));
                }
                Ok(())
            }
            ExperimentStep::Call(call) => {
                let call = call.clone();
                dispatch
                    .call(&call)
                    .await
                    .map_err(|e| ExperimentError::DeviceFailed(format!("{}: {e}", call.device)))?;
                if dispatch.device_state_kind(&call.device) == Some(DeviceStateKind::Error) {
                    return Err(ExperimentError::DeviceFailed(call.device));
                }
                Ok(())
            }
        }
    }

    /// Once the command list is exhausted, success is only declared once
    /// every touched device has settled into `Waiting` (spec.md §4.K).
    async fn wait_for_devices_idle(&self, dispatch: &dyn DeviceDispatch) {
        loop {
            let all_idle = self
                .devices
                .iter()
                .all(|d| dispatch.device_state_kind(d) == Some(DeviceStateKind::Waiting));
            if all_idle || self.devices.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn persist(&self, succeeded: bool) -> Result<(), ExperimentError> {
        let buffer = self.recorder.buffer.lock().expect("observation recorder mutex poisoned");
        self.writer.write_run(
            &self.log_dir,
            &self.id.to_string(),
            &self.metadata,
            if succeeded { "finished" } else { "failed" },
            self.start_time,
            Utc::now(),
            &buffer,
        )?;
        Ok(())
    }
}

async fn any_condition_fired(
    rxs: &mut [(ConditionId, ContinuationId, oneshot::Receiver<()>)],
) -> Option<ConditionId> {
    poll_fn(move |cx| {
        for (id, _, rx) in rxs.iter_mut() {
            if std::pin::Pin::new(rx).poll(cx).is_ready() {
                return std::task::Poll::Ready(Some(*id));
            }
        }
        std::task::Poll::Pending
    })
    .await
}

/// A queue of experiments, run one at a time (spec.md §4.K "Scheduler
/// queue"). `pause()` is accepted but a no-op per spec.md §9 Open Question
/// (c).
#[derive(Default)]
pub struct Scheduler {
    queue: VecDeque<Experiment>,
    running_id: Option<ExperimentId>,
    pub history: Vec<Experiment>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_experiment(&mut self, experiment: Experiment) -> Result<ExperimentId, ExperimentError> {
        if self.is_known(experiment.id) {
            return Err(ExperimentError::NonUniqueId(experiment.id));
        }
        let id = experiment.id;
        self.queue.push_back(experiment);
        Ok(id)
    }

    /// Inserts after `after`. If `after` is the currently-running
    /// experiment, the new entry becomes the next one to run — there is no
    /// way to insert *before* it, since it is no longer in the queue.
    /// An `after` that names neither the running experiment nor a queued one
    /// is rejected (spec.md §4.K).
    pub fn insert_experiment_after(
        &mut self,
        after: ExperimentId,
        experiment: Experiment,
    ) -> Result<ExperimentId, ExperimentError> {
        if self.is_known(experiment.id) {
            return Err(ExperimentError::NonUniqueId(experiment.id));
        }
        let id = experiment.id;
        if Some(after) == self.running_id {
            self.queue.push_front(experiment);
            return Ok(id);
        }
        let pos = self
            .queue
            .iter()
            .position(|e| e.id == after)
            .ok_or(ExperimentError::ExperimentOrder)?;
        self.queue.insert(pos + 1, experiment);
        Ok(id)
    }

    fn is_known(&self, id: ExperimentId) -> bool {
        self.running_id == Some(id) || self.queue.iter().any(|e| e.id == id)
    }

    /// Runs every queued experiment to completion, advancing on each
    /// terminal state.
    pub async fn run_to_completion(
        &mut self,
        dispatch: &dyn DeviceDispatch,
        conditions: &mut ConditionHandler,
        source: &mut dyn ObservationSource,
        log_root: &Path,
    ) {
        while let Some(mut experiment) = self.queue.pop_front() {
            self.running_id = Some(experiment.id);
            if let Err(e) = experiment.run(dispatch, conditions, source, log_root).await {
                warn!(experiment = %experiment.name, error = %e, "experiment ended in failure");
            }
            self.running_id = None;
            self.history.push(experiment);
        }
    }

    /// Accepted but a no-op (spec.md §9 Open Question (c)).
    pub fn pause(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStateKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource;
    impl ObservationSource for FakeSource {
        fn latest(&self, _producer: &str, _name: &str) -> Option<Sample> {
            None
        }
        fn device_state_kind(&self, _producer: &str) -> Option<DeviceStateKind> {
            None
        }
        fn triggered_condition(&self, _producer: &str) -> bool {
            false
        }
        fn set_triggered_condition(&mut self, _producer: &str, _value: bool) {}
        fn publish(&mut self, _producer: &str, _name: &str, _value: Value, _timestamp: DateTime<Utc>) {}
    }

    struct FakeDispatch {
        calls: AtomicUsize,
        stops: AtomicUsize,
    }

    impl FakeDispatch {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceDispatch for FakeDispatch {
        async fn call(&self, _call: &DeviceCall) -> Result<(), DeviceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn submit(&self, _device: &str, _node: CommandNode) -> Result<(), DeviceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn device_state_kind(&self, _device: &str) -> Option<DeviceStateKind> {
            Some(DeviceStateKind::Waiting)
        }
        fn subscribe(&self, _device: &str, _subscriber: Arc<dyn Subscriber>) {}
        fn unsubscribe(&self, _device: &str, _subscriber: &Arc<dyn Subscriber>) {}
        async fn stop(&self, _device: &str) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn call(device: &str) -> ExperimentStep {
        ExperimentStep::Call(DeviceCall {
            device: device.to_string(),
            method: "noop".into(),
            args: Vec::new(),
            kwargs: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn experiment_runs_every_step_and_stops_devices_on_success() {
        let dispatch = FakeDispatch::new();
        let mut conditions = ConditionHandler::new();
        let mut source = FakeSource;
        let dir = tempfile::tempdir().unwrap();

        let mut experiment = Experiment::new(
            "titration",
            vec![call("pump1"), call("pump1")],
            vec!["pump1".into()],
            Vec::new(),
        );
        let result = experiment
            .run(&dispatch, &mut conditions, &mut source, dir.path())
            .await;

        assert!(result.is_ok());
        assert_eq!(experiment.state, ExperimentState::Finished);
        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatch.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_step_hands_its_node_to_dispatch_exactly_once() {
        let dispatch = FakeDispatch::new();
        let mut conditions = ConditionHandler::new();
        let mut source = FakeSource;
        let dir = tempfile::tempdir().unwrap();

        let condition = ConditionId::new();
        let (wait, _exec_rx, _result_rx) = crate::command::WaitCommand::new(condition);
        let node = CommandNode::Wait(wait);

        let mut experiment = Experiment::new(
            "submit-wait",
            vec![ExperimentStep::Submit("pump1".into(), Some(node))],
            vec!["pump1".into()],
            Vec::new(),
        );
        let result = experiment
            .run(&dispatch, &mut conditions, &mut source, dir.path())
            .await;

        assert!(result.is_ok());
        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_condition_firing_fails_the_experiment() {
        let dispatch = FakeDispatch::new();
        let mut conditions = ConditionHandler::new();
        let mut source = FakeSource;
        let dir = tempfile::tempdir().unwrap();

        let mut experiment = Experiment::new(
            "guarded",
            vec![call("pump1")],
            vec!["pump1".into()],
            vec![ConditionKind::Time {
                duration: std::time::Duration::from_millis(0),
            }],
        );
        let result = experiment
            .run(&dispatch, &mut conditions, &mut source, dir.path())
            .await;

        assert!(result.is_err());
        assert_eq!(experiment.state, ExperimentState::Failed);
    }

    #[test]
    fn scheduler_rejects_duplicate_ids() {
        let mut scheduler = Scheduler::new();
        let experiment = Experiment::new("a", Vec::new(), Vec::new(), Vec::new());
        let id = experiment.id;
        scheduler.add_experiment(experiment).unwrap();

        let mut dup = Experiment::new("a-again", Vec::new(), Vec::new(), Vec::new());
        dup.id = id;
        assert!(matches!(
            scheduler.add_experiment(dup),
            Err(ExperimentError::NonUniqueId(_))
        ));
    }

    #[test]
    fn insert_after_running_goes_to_front_of_queue() {
        let mut scheduler = Scheduler::new();
        let running = ExperimentId::new();
        scheduler.running_id = Some(running);
        scheduler
            .add_experiment(Experiment::new("tail", Vec::new(), Vec::new(), Vec::new()))
            .unwrap();

        scheduler
            .insert_experiment_after(running, Experiment::new("next", Vec::new(), Vec::new(), Vec::new()))
            .unwrap();

        assert_eq!(scheduler.queue.front().unwrap().name, "next");
    }

    #[test]
    fn insert_after_unknown_id_is_rejected() {
        let mut scheduler = Scheduler::new();
        let result = scheduler.insert_experiment_after(
            ExperimentId::new(),
            Experiment::new("orphan", Vec::new(), Vec::new(), Vec::new()),
        );
        assert!(matches!(result, Err(ExperimentError::ExperimentOrder)));
    }
}
