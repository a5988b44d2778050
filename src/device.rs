//! Component F — device state machine, queue discipline, and the
//! multi-channel `ChannelProxy`.
//!
//! The state machine itself (this module's `Device` type) is a pure,
//! synchronous core: it decides where a command goes and what state
//! follows a success or failure, but never sleeps or touches a socket.
//! `DeviceActor` is the thin async wrapper that owns the transport
//! (component J) and a timer, and drives the core loop — grounded on the
//! teacher's `DaqManagerActor::run` single-`mpsc::Receiver` select loop in
//! `src/app_actor.rs`, generalized from "one actor for the whole app" to
//! "one actor per device".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandId, CommandNode, CommandState};
use crate::condition::ConditionId;
use crate::observable::{ObservableBus, Subscriber, Value};
use crate::protocol::Transport;

/// Tag-only view of a device state, used by `CommandSpec::devicestate_while_executing`
/// and `next_devicestate` — a command only ever names which *kind* of state
/// it wants, never the condition/command payload that `Busy`/`Waiting`
/// carry at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceStateKind {
    NotReady,
    Initializing,
    Ready,
    CollectingCommands,
    Busy,
    Waiting,
    Stopped,
    Error,
    Shutdown,
}

impl DeviceStateKind {
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            0 => Self::NotReady,
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::CollectingCommands,
            4 => Self::Busy,
            5 => Self::Waiting,
            6 => Self::Stopped,
            7 => Self::Error,
            _ => Self::Shutdown,
        }
    }
}

/// Payload carried by `Busy`/`Waiting`: which command put the device there,
/// and — for wait commands — which condition it's waiting on.
#[derive(Debug, Clone, Copy)]
pub struct WaitInfo {
    pub command: CommandId,
    pub condition: Option<ConditionId>,
}

/// The full runtime device state (spec.md §4.F).
#[derive(Debug, Clone, Copy)]
pub enum DeviceState {
    NotReady,
    Initializing,
    Ready,
    CollectingCommands,
    Busy(WaitInfo),
    Waiting(WaitInfo),
    Stopped,
    Error,
    Shutdown,
}

impl DeviceState {
    #[must_use]
    pub fn kind(&self) -> DeviceStateKind {
        match self {
            DeviceState::NotReady => DeviceStateKind::NotReady,
            DeviceState::Initializing => DeviceStateKind::Initializing,
            DeviceState::Ready => DeviceStateKind::Ready,
            DeviceState::CollectingCommands => DeviceStateKind::CollectingCommands,
            DeviceState::Busy(_) => DeviceStateKind::Busy,
            DeviceState::Waiting(_) => DeviceStateKind::Waiting,
            DeviceState::Stopped => DeviceStateKind::Stopped,
            DeviceState::Error => DeviceStateKind::Error,
            DeviceState::Shutdown => DeviceStateKind::Shutdown,
        }
    }

    #[must_use]
    pub fn is_terminal_for_dispatch(&self) -> bool {
        matches!(self, DeviceState::Stopped | DeviceState::Error | DeviceState::Shutdown)
    }
}

#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("unknown connection type for address '{0}'")]
    UnknownConnectionType(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device rejects new commands while {0:?}")]
    Terminal(DeviceStateKind),
}

/// Inserts `node` respecting the urgent/non-urgent priority classes
/// (spec.md §4.F, tested directly by the seed "urgent preemption"
/// scenario): scan from the head, insert after the last urgent command;
/// otherwise append.
pub fn insert_respecting_priority(queue: &mut VecDeque<CommandNode>, node: CommandNode) {
    if !node.urgent() {
        queue.push_back(node);
        return;
    }
    let insert_at = queue
        .iter()
        .rposition(CommandNode::urgent)
        .map_or(0, |pos| pos + 1);
    queue.insert(insert_at, node);
}

/// A lightweight proxy bound to a multi-channel device (spec.md §3/§4.F).
/// It owns its own queue and state but has no transport of its own —
/// physical transmission is always forwarded to the parent device.
pub struct ChannelProxy {
    pub id: u32,
    pub queue: VecDeque<CommandNode>,
    pub state: DeviceState,
    pub observable: ObservableBus,
}

impl ChannelProxy {
    #[must_use]
    pub fn new(id: u32, parent_name: &str) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
            state: DeviceState::Ready,
            observable: ObservableBus::new(format!("{parent_name}/ch{id}")),
        }
    }
}

/// Per-device persistent state: queue, current outstanding command, the
/// multi-channel map, the active series builder for `CollectingCommands`,
/// and the observable history.
pub struct Device {
    pub name: String,
    pub connection: Transport,
    pub state: DeviceState,
    pub queue: VecDeque<CommandNode>,
    pub current: Option<CommandNode>,
    pub channels: HashMap<u32, ChannelProxy>,
    /// Which channel is "acting" — the parent's `send_cmd`/`wait` entry
    /// points redirect there for the call's duration (Design Note §9: no
    /// attribute-hijacking, just an explicit optional identifier).
    pub acting_channel: Option<u32>,
    /// Scoped command-series builder consulted by `send_cmd` while the
    /// device is `CollectingCommands` (Design Note §9).
    pub active_builder: Option<CommandNode>,
    pub observable: ObservableBus,
    ready_for_urgent: bool,
    /// Set when a wait command's condition fires while a non-wait command
    /// is still outstanding; applied by `handle_success` once that command
    /// clears (spec.md §4.F).
    pending_wait_transition: Option<DeviceStateKind>,
    /// Single-shot gate set by `DevicesStateEqualsCondition` (spec.md
    /// §4.G) once it has fired for this device.
    pub triggered_condition: bool,
}

impl Device {
    #[must_use]
    pub fn new(name: impl Into<String>, connection: Transport) -> Self {
        let name = name.into();
        Self {
            observable: ObservableBus::new(name.clone()),
            name,
            connection,
            state: DeviceState::NotReady,
            queue: VecDeque::new(),
            current: None,
            channels: HashMap::new(),
            acting_channel: None,
            active_builder: None,
            ready_for_urgent: true,
            pending_wait_transition: None,
            triggered_condition: false,
        }
    }

    pub fn add_channel(&mut self, id: u32) {
        let proxy = ChannelProxy::new(id, &self.name);
        self.channels.insert(id, proxy);
    }

    /// Transitions out of `NotReady`/`Initializing` once the transport is
    /// connected.
    pub fn mark_ready(&mut self) {
        self.state = DeviceState::Ready;
    }

    /// Opens a scoped command series: the device enters `CollectingCommands`
    /// and subsequent `send_cmd` calls append to the builder instead of the
    /// device queue (spec.md §4.E "scoped acquisition pattern").
    pub fn begin_series(&mut self) {
        let (series, _rx) = crate::command::CommandSeries::new(Vec::new());
        self.active_builder = Some(CommandNode::Series(series));
        self.state = DeviceState::CollectingCommands;
    }

    /// Closes the scoped series and submits it as a single unit, reverting
    /// to the state held before `begin_series` was called.
    pub fn end_series(&mut self, prior_state: DeviceState) -> Option<CommandNode> {
        self.state = prior_state;
        self.active_builder.take()
    }

    /// `send_cmd(cmd)` (spec.md §4.F): routes a new command per the current
    /// state's policy. Returns the node back if it was dispatched
    /// immediately so the caller (the actor) can arm a timer for it.
    pub fn send_cmd(&mut self, node: CommandNode) -> Result<Option<CommandNode>, DeviceError> {
        if self.state.is_terminal_for_dispatch() {
            return Err(DeviceError::Terminal(self.state.kind()));
        }

        if let DeviceState::CollectingCommands = self.state {
            if let Some(CommandNode::Series(series)) = &mut self.active_builder {
                series.children.push(node);
            }
            return Ok(None);
        }

        match self.state {
            DeviceState::NotReady | DeviceState::Initializing | DeviceState::Ready => {
                if self.current.is_none() {
                    Ok(Some(node))
                } else {
                    self.queue.push_back(node);
                    Ok(None)
                }
            }
            DeviceState::Busy(_) | DeviceState::Waiting(_) => {
                if (node.urgent() || node.run_while_device_busy()) && self.ready_for_urgent {
                    self.ready_for_urgent = false;
                    Ok(Some(node))
                } else {
                    insert_respecting_priority(&mut self.queue, node);
                    Ok(None)
                }
            }
            DeviceState::Stopped | DeviceState::Error | DeviceState::Shutdown => {
                unreachable!("handled by is_terminal_for_dispatch above")
            }
            DeviceState::CollectingCommands => unreachable!("handled above"),
        }
    }

    /// Pops the next queued command, if any, following FIFO-within-priority
    /// (the queue itself is already ordered by `insert_respecting_priority`).
    pub fn pop_next(&mut self) -> Option<CommandNode> {
        self.queue.pop_front()
    }

    /// Called by the actor once a dispatched command's result is known and
    /// any `inter_command_time` delay has elapsed. Applies `next_devicestate`
    /// (spec.md §4.D/§4.F) and restores urgent-dispatch eligibility.
    pub fn handle_success(&mut self, next_state: DeviceStateKind) {
        self.ready_for_urgent = true;
        self.current = None;
        if let Some(deferred) = self.pending_wait_transition.take() {
            self.state = kind_to_resting_state(deferred);
            return;
        }
        self.state = kind_to_resting_state(next_state);
    }

    /// A command's parser produced a terminal `Fail`: the device moves to
    /// `Error` and the failure is expected to propagate to the owning
    /// experiment (spec.md §4.F/§7).
    pub fn handle_fail(&mut self) {
        self.current = None;
        self.state = DeviceState::Error;
    }

    /// A transport-level failure: publishes `errorcode` and moves to
    /// `Shutdown` (spec.md §4.F "Failure semantics").
    pub fn handle_transport_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.observable.update_one("errorcode", Value::Text(reason.clone()));
        self.state = DeviceState::Shutdown;
        error!(device = %self.name, %reason, "transport error, device shut down");
    }

    /// A wait command's condition fired: transition to its declared next
    /// state, unless a non-wait command is still outstanding, in which case
    /// the transition is deferred until that command succeeds (spec.md
    /// §4.F).
    pub fn on_wait_condition_fired(&mut self, next_state: DeviceStateKind) {
        if self.current.is_some() {
            self.pending_wait_transition = Some(next_state);
            return;
        }
        self.state = kind_to_resting_state(next_state);
    }

    /// Two-mode `stop()` (spec.md §4.F): with no channel acting, stop every
    /// channel in parallel (caller drives that); with one acting, run the
    /// final commands on the parent as if it were that channel.
    pub fn stop_target(&self) -> StopTarget {
        match self.acting_channel {
            Some(id) => StopTarget::ActingChannel(id),
            None => StopTarget::AllChannelsParallel,
        }
    }
}

fn kind_to_resting_state(kind: DeviceStateKind) -> DeviceState {
    match kind {
        DeviceStateKind::NotReady => DeviceState::NotReady,
        DeviceStateKind::Initializing => DeviceState::Initializing,
        DeviceStateKind::Ready => DeviceState::Ready,
        DeviceStateKind::CollectingCommands => DeviceState::CollectingCommands,
        DeviceStateKind::Stopped => DeviceState::Stopped,
        DeviceStateKind::Error => DeviceState::Error,
        DeviceStateKind::Shutdown => DeviceState::Shutdown,
        // Busy/Waiting without an explicit WaitInfo only arise from plain
        // commands (not WaitCommand); the actor supplies the real WaitInfo
        // when dispatching a wait command directly.
        DeviceStateKind::Busy => DeviceState::Ready,
        DeviceStateKind::Waiting => DeviceState::Ready,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTarget {
    AllChannelsParallel,
    ActingChannel(u32),
}

/// Commands the async actor loop accepts over its `mpsc` channel, mirroring
/// the teacher's `DaqCommand` oneshot-response style.
pub enum DeviceCommand {
    Enqueue {
        node: CommandNode,
        ack: oneshot::Sender<Result<(), DeviceError>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
    /// Lets an external caller (component K's `DeviceDispatch`) read the
    /// current state kind without sharing `Device` across tasks.
    QueryState {
        ack: oneshot::Sender<DeviceStateKind>,
    },
    Subscribe {
        subscriber: Arc<dyn Subscriber>,
    },
    Unsubscribe {
        subscriber: Arc<dyn Subscriber>,
    },
    /// Sent by whatever owns the condition handler (component K) once a
    /// dispatched `Wait`'s condition, or a `Repeated`'s stop-condition,
    /// becomes true.
    ConditionFired {
        condition: ConditionId,
    },
    /// Self-sent after a `Repeated` command's `period` elapses, to spawn
    /// and dispatch its next child.
    RepeatedTick,
}

/// What `run_to_next_rest`'s dispatch loop should do next, decided from a
/// short-lived shared borrow of `device.current` that is dropped before any
/// `.await` (owned, no lifetime, so it can be computed and then acted on
/// across awaits without fighting the borrow checker).
enum DispatchStep {
    Single,
    SeriesEmpty,
    SeriesChild { child_is_single: bool, inter_time: Duration },
    Repeated,
    Wait,
}

/// Finds the one `Single` `Command` that `drive_single` should write to the
/// wire next: `current` itself if it's a `Single`, a series' current child,
/// or a repeated command's most recently spawned child. Re-run after every
/// `.await` rather than held across one.
fn locate_single(device: &mut Device) -> Option<&mut Command> {
    match device.current.as_mut()? {
        CommandNode::Single(cmd) => Some(cmd),
        CommandNode::Series(series) => match series.current_child_mut()? {
            CommandNode::Single(cmd) => Some(cmd),
            _ => None,
        },
        CommandNode::Repeated(repeated) => repeated.last_child.as_mut(),
        CommandNode::Wait(_) => None,
    }
}

/// Thin async wrapper driving a `Device`'s transport and timers. Owns the
/// single `mpsc::Receiver` select loop (grounded on
/// `DaqManagerActor::run`), translating wall-clock events (bytes arrived,
/// timer fired, control message) into calls on the synchronous `Device`
/// core.
pub struct DeviceActor {
    pub device: Device,
    pub inbox: mpsc::Receiver<DeviceCommand>,
    /// Kept in sync with `device.state.kind()` after every processed
    /// message, so a dispatcher outside this task can read current state
    /// without an async round trip (component K's `DeviceDispatch` is a
    /// sync method). The `Device` core itself never touches this.
    state_mirror: Arc<AtomicU8>,
    /// Lets the actor queue a message to its own mailbox from a spawned
    /// timer task — used to re-arm `RepeatedCommand`'s next dispatch
    /// without blocking this task's whole select loop for `period`.
    self_tx: mpsc::Sender<DeviceCommand>,
}

impl DeviceActor {
    #[must_use]
    pub fn new(device: Device) -> (Self, mpsc::Sender<DeviceCommand>) {
        let (tx, rx) = mpsc::channel(32);
        let state_mirror = Arc::new(AtomicU8::new(device.state.kind() as u8));
        (
            Self {
                device,
                inbox: rx,
                state_mirror,
                self_tx: tx.clone(),
            },
            tx,
        )
    }

    /// A cheap, lock-free snapshot handle a dispatcher can poll from
    /// outside this actor's task.
    #[must_use]
    pub fn state_mirror(&self) -> Arc<AtomicU8> {
        self.state_mirror.clone()
    }

    /// Drives whatever is now `current` to its next rest: a `Single` runs
    /// one wire round-trip; a `Series` drives its `Single` children one at a
    /// time to a fixpoint (spec.md §4.E); a `Repeated` dispatches its first
    /// child and arms the next one `period` later; a `Wait` parks the
    /// device in its declared state until `apply_condition_fired` resolves
    /// it. Runs under `tokio::time::pause`/`advance` in tests for
    /// determinism (Design Note §9 "Reactor + callLater").
    pub async fn run_to_next_rest(&mut self) -> Result<(), DeviceError> {
        let Some(node) = self.device.current.take().or_else(|| self.device.pop_next()) else {
            return Ok(());
        };
        self.device.current = Some(node);

        loop {
            let step = match self.device.current.as_ref() {
                None => return Ok(()),
                Some(CommandNode::Single(_)) => DispatchStep::Single,
                Some(CommandNode::Series(series)) if series.children.is_empty() => DispatchStep::SeriesEmpty,
                Some(CommandNode::Series(series)) => match series.current_child() {
                    Some(CommandNode::Single(cmd)) => DispatchStep::SeriesChild {
                        child_is_single: true,
                        inter_time: cmd.spec.inter_command_time,
                    },
                    _ => DispatchStep::SeriesChild {
                        child_is_single: false,
                        inter_time: Duration::from_millis(0),
                    },
                },
                Some(CommandNode::Repeated(_)) => DispatchStep::Repeated,
                Some(CommandNode::Wait(_)) => DispatchStep::Wait,
            };

            match step {
                DispatchStep::Single => {
                    let state = self.drive_single().await?;
                    self.settle_single(state).await;
                    return Ok(());
                }
                DispatchStep::SeriesEmpty => {
                    let Some(CommandNode::Series(series)) = self.device.current.as_ref() else {
                        unreachable!("checked above")
                    };
                    let next_kind = series.next_devicestate;
                    self.device.current = None;
                    self.device.handle_success(next_kind);
                    return Ok(());
                }
                DispatchStep::SeriesChild { child_is_single, inter_time } => {
                    let child_state = if child_is_single {
                        self.drive_single().await?
                    } else {
                        // A Repeated/Wait/nested Series child has no
                        // dispatch path of its own inside a series:
                        // CommandSeries::force_success/force_fail already
                        // only mutates Single children, so a mixed series
                        // settles non-Single leaves as immediate successes.
                        CommandState::Success
                    };
                    if child_state == CommandState::Success {
                        sleep(inter_time).await;
                    }
                    let Some(CommandNode::Series(series)) = self.device.current.as_mut() else {
                        unreachable!("series remained current across its own child dispatch")
                    };
                    series.advance(child_state);
                    if series.state.is_terminal() {
                        let (state, next_kind) = (series.state, series.next_devicestate);
                        self.settle_series(state, next_kind);
                        return Ok(());
                    }
                    // Not terminal: either the cursor moved to the next
                    // child or a retry reset it to 0. Loop back around.
                }
                DispatchStep::Repeated => {
                    {
                        let Some(CommandNode::Repeated(repeated)) = self.device.current.as_mut() else {
                            unreachable!("checked above")
                        };
                        if !repeated.running {
                            let child = repeated.start();
                            repeated.last_child = Some(child);
                        }
                    }
                    self.dispatch_repeated_child().await?;
                    return Ok(());
                }
                DispatchStep::Wait => {
                    self.start_wait();
                    return Ok(());
                }
            }
        }
    }

    /// Writes whatever `Single` command `locate_single` finds (the
    /// top-level `current`, or a series' current child) and drives it to a
    /// terminal or retry state. Re-locates the command after every `await`
    /// rather than holding a borrow across it.
    async fn drive_single(&mut self) -> Result<CommandState, DeviceError> {
        let timeout = {
            let Some(cmd) = locate_single(&mut self.device) else {
                unreachable!("caller only calls this while a Single is current")
            };
            cmd.mark_sent(Utc::now())
        };
        let bytestring = locate_single(&mut self.device)
            .expect("just marked sent")
            .spec
            .bytestring
            .clone();
        match self.device.connection.write_line(&bytestring).await {
            Ok(()) => {}
            Err(e) => {
                self.device.handle_transport_error(e.to_string());
                return Err(DeviceError::Transport(e.to_string()));
            }
        }
        let reply = tokio::select! {
            line = self.device.connection.read_line() => line.ok(),
            _ = sleep(timeout) => None,
        };
        let cmd = locate_single(&mut self.device).expect("command outlives its own dispatch");
        match reply {
            Some(line) => {
                let outcome = cmd.parser.parse(&line);
                cmd.on_reply(outcome);
            }
            None => cmd.on_timeout_fired(),
        }
        Ok(locate_single(&mut self.device).expect("just settled").state)
    }

    async fn settle_single(&mut self, state: CommandState) {
        let Some(CommandNode::Single(cmd)) = &self.device.current else {
            unreachable!("drive_single only returns while a Single is current")
        };
        let next_kind = cmd.spec.next_devicestate;
        match state {
            CommandState::Success => {
                sleep(self.inter_command_time()).await;
                self.device.handle_success(next_kind);
            }
            CommandState::Fail => self.device.handle_fail(),
            _ => {
                // Retry re-armed the command back to NotSent; requeue
                // at the front so it is the very next thing dispatched.
                if let Some(requeued) = self.device.current.take() {
                    self.device.queue.push_front(requeued);
                }
            }
        }
    }

    fn settle_series(&mut self, state: CommandState, next_kind: DeviceStateKind) {
        self.device.current = None;
        match state {
            CommandState::Success => self.device.handle_success(next_kind),
            CommandState::Fail | CommandState::Cancelled => self.device.handle_fail(),
            CommandState::NotSent | CommandState::Sent => {}
        }
    }

    /// Dispatches whatever `RepeatedCommand::last_child` holds, looping
    /// internally past any transient retry (a per-child `NotSent` re-arm
    /// isn't a `result-available` event) until the child reaches a terminal
    /// state, then arms or ends the periodic cycle.
    async fn dispatch_repeated_child(&mut self) -> Result<(), DeviceError> {
        loop {
            let state = self.drive_single().await?;
            if state.is_terminal() {
                break;
            }
        }
        self.reschedule_or_finish_repeated();
        Ok(())
    }

    fn reschedule_or_finish_repeated(&mut self) {
        let Some(CommandNode::Repeated(repeated)) = self.device.current.as_mut() else {
            unreachable!("caller only calls this while a Repeated command is current")
        };
        if repeated.running {
            let period = repeated.period;
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                sleep(period).await;
                let _ = tx.send(DeviceCommand::RepeatedTick).await;
            });
        } else {
            let next_kind = repeated.next_devicestate;
            self.device.current = None;
            self.device.handle_success(next_kind);
        }
    }

    /// `WaitCommand::execute()` fulfills execution-complete immediately and
    /// parks the device in its declared state (spec.md §4.E); resolution
    /// comes later via `apply_condition_fired`.
    fn start_wait(&mut self) {
        let Some(CommandNode::Wait(wait)) = self.device.current.as_mut() else {
            unreachable!("caller only calls this while a Wait is current")
        };
        wait.execute();
        let wait_info = WaitInfo {
            command: wait.id,
            condition: Some(wait.condition),
        };
        self.device.state = match wait.devicestate_while_executing {
            DeviceStateKind::Busy => DeviceState::Busy(wait_info),
            _ => DeviceState::Waiting(wait_info),
        };
    }

    /// The condition handler (component K/H) reported that `condition`
    /// became true: resolve whichever outstanding `Wait`/`Repeated` was
    /// watching it, if any (a stray notification for a condition nothing is
    /// currently waiting on is simply ignored).
    async fn apply_condition_fired(&mut self, condition: ConditionId) {
        match self.device.current.as_mut() {
            Some(CommandNode::Wait(wait)) if wait.condition == condition => {
                wait.fire();
                let next_kind = wait.next_devicestate;
                self.device.current = None;
                self.device.on_wait_condition_fired(next_kind);
                if let Err(e) = self.run_to_next_rest().await {
                    warn!(device = %self.device.name, error = %e, "device run loop error");
                }
            }
            Some(CommandNode::Repeated(repeated)) if repeated.stop_condition == Some(condition) => {
                repeated.stop();
            }
            _ => {}
        }
    }

    fn inter_command_time(&self) -> Duration {
        match &self.device.current {
            Some(CommandNode::Single(cmd)) => cmd.spec.inter_command_time,
            _ => Duration::from_millis(0),
        }
    }

    pub async fn serve(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                DeviceCommand::Enqueue { node, ack } => {
                    let result = self.device.send_cmd(node);
                    let ack_result = match &result {
                        Ok(_) => Ok(()),
                        Err(e) => Err(e.clone()),
                    };
                    if let Ok(Some(dispatched)) = result {
                        self.device.current = Some(dispatched);
                    }
                    let _ = ack.send(ack_result);
                    if let Err(e) = self.run_to_next_rest().await {
                        warn!(device = %self.device.name, error = %e, "device run loop error");
                    }
                }
                DeviceCommand::Stop { ack } => {
                    self.device.state = DeviceState::Stopped;
                    let _ = ack.send(());
                }
                DeviceCommand::Shutdown { ack } => {
                    self.device.state = DeviceState::Shutdown;
                    self.state_mirror.store(self.device.state.kind() as u8, Ordering::Relaxed);
                    let _ = ack.send(());
                    break;
                }
                DeviceCommand::QueryState { ack } => {
                    let _ = ack.send(self.device.state.kind());
                }
                DeviceCommand::Subscribe { subscriber } => {
                    self.device.observable.subscribe(subscriber);
                }
                DeviceCommand::Unsubscribe { subscriber } => {
                    self.device.observable.unsubscribe(&subscriber);
                }
                DeviceCommand::ConditionFired { condition } => {
                    self.apply_condition_fired(condition).await;
                }
                DeviceCommand::RepeatedTick => {
                    // A tick arriving after `stop()` already settled and
                    // cleared `current` (via `reschedule_or_finish_repeated`)
                    // is stale and simply ignored.
                    let still_running = matches!(
                        self.device.current.as_ref(),
                        Some(CommandNode::Repeated(r)) if r.running
                    );
                    if still_running {
                        let Some(CommandNode::Repeated(repeated)) = self.device.current.as_mut() else {
                            unreachable!("checked above")
                        };
                        let child = repeated.spawn_child();
                        repeated.last_child = Some(child);
                        if let Err(e) = self.dispatch_repeated_child().await {
                            warn!(device = %self.device.name, error = %e, "device run loop error");
                        }
                    }
                }
            }
            self.state_mirror.store(self.device.state.kind() as u8, Ordering::Relaxed);
        }
        debug!(device = %self.device.name, "device actor exited");
        info!(device = %self.device.name, "shutdown complete");
    }
}
