//! Components D and E — the command state machine and its variants
//! (`CommandSeries`, `RepeatedCommand`, `WaitCommand`).
//!
//! Grounded on the teacher's continuation-by-oneshot pattern (`DaqCommand`
//! variants carrying `oneshot::Sender<_>` response channels in the
//! teacher's message-passing layer) and its retry-policy shape
//! (`RetryPolicy { max_attempts, backoff_delay }`), recast here as the
//! per-command `retries`/`on_error`/`on_timeout` parameters spec.md §3
//! calls for. Dynamic dispatch across command kinds is a tagged enum
//! (`CommandNode`) per Design Note §9, not a trait-object hierarchy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::device::DeviceStateKind;
use crate::parser::Parser;
use crate::result::{CommandError, CommandResult};

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Arena-style identifier. Commands never hold owning references to each
/// other (Design Note §9): a series holds its children by id and looks
/// them up in whatever arena owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    pub fn new() -> Self {
        Self(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

/// The state a single parse produces (spec.md §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Success,
    Retry,
    Fail,
}

/// The resting states of a command (spec.md §4.D). `Retry` is a pseudo-state
/// that never lingers — it is resolved synchronously into `Sent` or `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    NotSent,
    Sent,
    Success,
    Fail,
    Cancelled,
}

impl CommandState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Success | CommandState::Fail | CommandState::Cancelled)
    }
}

/// What to do when a retryable failure kind occurs (spec.md §4.D / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Retry,
    Fail,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Retry
    }
}

/// A one-shot continuation, settled at most once. Mirrors the teacher's
/// `oneshot::Sender<T>` response-channel pattern used throughout its
/// message-passing layer.
pub struct Continuation<T> {
    sender: Option<oneshot::Sender<T>>,
}

impl<T> Continuation<T> {
    #[must_use]
    pub fn pair() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { sender: Some(tx) }, rx)
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.sender.is_some()
    }

    /// Settles the continuation. A second call is a silent no-op, matching
    /// "result-available fires exactly once" (spec.md §8).
    pub fn fulfill(&mut self, value: T) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(value);
        }
    }
}

/// Per-command configuration (spec.md §3).
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub bytestring: Vec<u8>,
    pub retries: u32,
    pub inter_command_time: Duration,
    pub timeout: Duration,
    pub on_error: ErrorPolicy,
    pub on_timeout: ErrorPolicy,
    pub urgent: bool,
    pub run_while_device_busy: bool,
    pub channel: Option<u32>,
    pub devicestate_while_executing: DeviceStateKind,
    pub next_devicestate: DeviceStateKind,
    pub query: bool,
}

impl CommandSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, bytestring: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytestring: bytestring.into(),
            retries: 0,
            inter_command_time: Duration::from_millis(0),
            timeout: Duration::from_secs(5),
            on_error: ErrorPolicy::Retry,
            on_timeout: ErrorPolicy::Retry,
            urgent: false,
            run_while_device_busy: false,
            channel: None,
            devicestate_while_executing: DeviceStateKind::Busy,
            next_devicestate: DeviceStateKind::Ready,
            query: false,
        }
    }

    #[must_use]
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    #[must_use]
    pub fn with_on_timeout(mut self, policy: ErrorPolicy) -> Self {
        self.on_timeout = policy;
        self
    }
}

/// A single unit of work addressed to a device (spec.md §3/§4.D).
pub struct Command {
    pub id: CommandId,
    pub spec: CommandSpec,
    pub parser: Arc<dyn Parser>,
    pub state: CommandState,
    pub fail_count: u32,
    pub last_result: Option<CommandResult>,
    pub last_error: Option<CommandError>,
    pub sent_at: Option<DateTime<Utc>>,
    execution_complete: Continuation<()>,
    result_available: Continuation<Result<CommandResult, CommandError>>,
}

impl Command {
    #[must_use]
    pub fn new(
        spec: CommandSpec,
        parser: Arc<dyn Parser>,
    ) -> (Self, oneshot::Receiver<()>, oneshot::Receiver<Result<CommandResult, CommandError>>) {
        let (execution_complete, exec_rx) = Continuation::pair();
        let (result_available, result_rx) = Continuation::pair();
        let cmd = Self {
            id: CommandId::new(),
            spec,
            parser,
            state: CommandState::NotSent,
            fail_count: 0,
            last_result: None,
            last_error: None,
            sent_at: None,
            execution_complete,
            result_available,
        };
        (cmd, exec_rx, result_rx)
    }

    /// Dispatch onto the wire: `NotSent -> Sent`. Returns the timeout
    /// duration the caller (the owning device) must arm a timer for.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> Duration {
        debug_assert_eq!(self.state, CommandState::NotSent);
        self.state = CommandState::Sent;
        self.sent_at = Some(now);
        self.execution_complete.fulfill(());
        self.spec.timeout
    }

    /// Applies a parsed reply. Only has an effect while `Sent` — a late
    /// reply arriving after the device already timed this command out is
    /// silently discarded (spec.md §4.D).
    pub fn on_reply(&mut self, outcome: (Result<CommandResult, CommandError>, NextState)) {
        if self.state != CommandState::Sent {
            return;
        }
        let (parsed, next) = outcome;
        match (parsed, next) {
            (Ok(result), NextState::Success) => {
                self.last_result = Some(result.clone());
                self.state = CommandState::Success;
                self.result_available.fulfill(Ok(result));
            }
            (Err(err), NextState::Fail) => {
                self.fail_now(err);
            }
            (Err(err), NextState::Retry) => {
                self.last_error = Some(err.clone());
                self.retry(err);
            }
            (Err(_), NextState::Success) => {
                unreachable!("no Parser impl pairs an Err result with NextState::Success")
            }
            (Ok(result), next) => {
                // A reply-to-state parser mapped a successful-looking reply
                // to a non-success state; treat the result as informational
                // and still drive the state machine from `next`.
                self.last_result = Some(result);
                match next {
                    NextState::Retry => self.retry(CommandError::Response {
                        code: "MAPPED_STATE".into(),
                        message: "mapped to retry with an Ok result".into(),
                        result: self.last_result.clone(),
                        captures: Default::default(),
                    }),
                    NextState::Fail => self.fail_now(CommandError::Response {
                        code: "MAPPED_STATE".into(),
                        message: "mapped to fail with an Ok result".into(),
                        result: self.last_result.clone(),
                        captures: Default::default(),
                    }),
                    NextState::Success => unreachable!("handled above"),
                }
            }
        }
    }

    /// The timer fired while this command was still `Sent`. Only applies
    /// if still sent, matching the "late result after timer already fired
    /// is discarded" rule applied symmetrically: a timeout that arrives
    /// after the command already resolved is likewise a no-op.
    pub fn on_timeout_fired(&mut self) {
        if self.state != CommandState::Sent {
            return;
        }
        self.last_error = Some(CommandError::Timeout);
        self.retry(CommandError::Timeout);
    }

    /// Implements the `Retry` pseudo-state (spec.md §4.D): bump fail count,
    /// check exhaustion and fail-override policies, otherwise re-dispatch.
    fn retry(&mut self, err: CommandError) {
        self.fail_count += 1;
        if self.fail_count > self.spec.retries {
            self.fail_now(CommandError::RetryExhausted {
                attempts: self.fail_count,
            });
            return;
        }
        let overridden = match &err {
            CommandError::DeviceError { .. } => self.spec.on_error == ErrorPolicy::Fail,
            CommandError::Timeout => self.spec.on_timeout == ErrorPolicy::Fail,
            _ => false,
        };
        if overridden {
            self.fail_now(err);
            return;
        }
        // Re-execute: back to NotSent so the device's dispatch logic sends
        // it again; callers observe this via `state()`.
        self.state = CommandState::NotSent;
    }

    fn fail_now(&mut self, err: CommandError) {
        self.last_error = Some(err.clone());
        self.state = CommandState::Fail;
        self.result_available.fulfill(Err(err));
    }

    /// `Command.cancel()` (spec.md §5): cancels `result-available` and
    /// moves to the terminal `Cancelled` state. No-op if already terminal.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = CommandState::Cancelled;
        self.result_available
            .fulfill(Err(CommandError::Response {
                code: "CANCELLED".into(),
                message: "command was cancelled".into(),
                result: None,
                captures: Default::default(),
            }));
    }

    #[must_use]
    pub fn is_pending_result(&self) -> bool {
        self.result_available.is_pending()
    }
}

/// A nestable transactional sequence of commands (spec.md §3/§4.E).
pub struct CommandSeries {
    pub id: CommandId,
    pub children: Vec<CommandNode>,
    pub cursor: usize,
    pub retries: u32,
    pub fail_count: u32,
    pub state: CommandState,
    pub parent: Option<CommandId>,
    pub next_devicestate: DeviceStateKind,
    result_available: Continuation<Result<(), CommandError>>,
}

impl CommandSeries {
    #[must_use]
    pub fn new(children: Vec<CommandNode>) -> (Self, oneshot::Receiver<Result<(), CommandError>>) {
        let (result_available, rx) = Continuation::pair();
        (
            Self {
                id: CommandId::new(),
                children,
                cursor: 0,
                retries: 0,
                fail_count: 0,
                state: CommandState::NotSent,
                parent: None,
                next_devicestate: DeviceStateKind::Ready,
                result_available,
            },
            rx,
        )
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_next_devicestate(mut self, kind: DeviceStateKind) -> Self {
        self.next_devicestate = kind;
        self
    }

    /// Urgency is the disjunction of children's urgency (spec.md §3).
    #[must_use]
    pub fn urgent(&self) -> bool {
        self.children.iter().any(CommandNode::urgent)
    }

    #[must_use]
    pub fn current_child(&self) -> Option<&CommandNode> {
        self.children.get(self.cursor)
    }

    #[must_use]
    pub fn current_child_mut(&mut self) -> Option<&mut CommandNode> {
        self.children.get_mut(self.cursor)
    }

    /// Drives the series from a state transition observed on its current
    /// child (spec.md §4.E).
    pub fn advance(&mut self, child_state: CommandState) {
        match child_state {
            CommandState::Success => {
                self.cursor += 1;
                if self.cursor >= self.children.len() {
                    self.succeed();
                }
            }
            CommandState::Fail => {
                self.fail_count += 1;
                if self.fail_count > self.retries {
                    self.fail();
                } else {
                    self.cursor = 0;
                    self.state = CommandState::NotSent;
                }
            }
            CommandState::Cancelled => {
                self.cancel();
            }
            CommandState::NotSent | CommandState::Sent => {}
        }
    }

    fn succeed(&mut self) {
        self.state = CommandState::Success;
        for child in &mut self.children {
            child.force_success();
        }
        self.result_available.fulfill(Ok(()));
    }

    fn fail(&mut self) {
        self.state = CommandState::Fail;
        for child in self.children.iter_mut().take(self.cursor) {
            child.force_success();
        }
        if let Some(current) = self.children.get_mut(self.cursor) {
            current.force_fail();
        }
        self.result_available
            .fulfill(Err(CommandError::SeriesError(Box::new(
                CommandError::RetryExhausted {
                    attempts: self.fail_count,
                },
            ))));
    }

    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        for child in &mut self.children {
            child.cancel();
        }
        self.state = CommandState::Cancelled;
        self.result_available.fulfill(Err(CommandError::Response {
            code: "CANCELLED".into(),
            message: "series was cancelled".into(),
            result: None,
            captures: Default::default(),
        }));
    }
}

/// A periodically re-dispatched command; `run_while_device_busy` is
/// implicitly true (spec.md §3).
pub struct RepeatedCommand {
    pub id: CommandId,
    pub period: Duration,
    pub running: bool,
    pub stop_condition: Option<crate::condition::ConditionId>,
    pub last_child: Option<Command>,
    pub next_devicestate: DeviceStateKind,
    factory: Arc<dyn Fn() -> (CommandSpec, Arc<dyn Parser>) + Send + Sync>,
}

impl RepeatedCommand {
    pub fn new(
        period: Duration,
        stop_condition: Option<crate::condition::ConditionId>,
        factory: Arc<dyn Fn() -> (CommandSpec, Arc<dyn Parser>) + Send + Sync>,
    ) -> Self {
        Self {
            id: CommandId::new(),
            period,
            running: false,
            stop_condition,
            last_child: None,
            next_devicestate: DeviceStateKind::Ready,
            factory,
        }
    }

    #[must_use]
    pub fn with_next_devicestate(mut self, kind: DeviceStateKind) -> Self {
        self.next_devicestate = kind;
        self
    }

    /// Marks running and produces the first child to dispatch immediately.
    pub fn start(&mut self) -> Command {
        self.running = true;
        self.spawn_child()
    }

    /// Called when the stop-condition fires: flips the running flag so the
    /// owner stops scheduling the next dispatch.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn spawn_child(&self) -> Command {
        let (spec, parser) = (self.factory)();
        let (cmd, _exec_rx, _result_rx) = Command::new(spec, parser);
        cmd
    }

    /// Cancellation is unsupported by design (Open Question (b)); use the
    /// stop-condition instead.
    pub fn cancel(&self) -> Result<(), CommandError> {
        Err(CommandError::Unsupported("RepeatedCommand::cancel"))
    }
}

/// A command whose "execution" is waiting for a condition (spec.md §3/§4.E).
pub struct WaitCommand {
    pub id: CommandId,
    pub condition: crate::condition::ConditionId,
    pub devicestate_while_executing: DeviceStateKind,
    pub next_devicestate: DeviceStateKind,
    pub state: CommandState,
    execution_complete: Continuation<()>,
    result_available: Continuation<Result<(), CommandError>>,
}

impl WaitCommand {
    #[must_use]
    pub fn new(
        condition: crate::condition::ConditionId,
    ) -> (Self, oneshot::Receiver<()>, oneshot::Receiver<Result<(), CommandError>>) {
        let (execution_complete, exec_rx) = Continuation::pair();
        let (result_available, result_rx) = Continuation::pair();
        (
            Self {
                id: CommandId::new(),
                condition,
                devicestate_while_executing: DeviceStateKind::Waiting,
                next_devicestate: DeviceStateKind::Ready,
                state: CommandState::NotSent,
                execution_complete,
                result_available,
            },
            exec_rx,
            result_rx,
        )
    }

    /// `busy()` variant: device state while executing is `Busy` instead of
    /// the default `Waiting` (spec.md §3).
    #[must_use]
    pub fn busy(mut self) -> Self {
        self.devicestate_while_executing = DeviceStateKind::Busy;
        self
    }

    #[must_use]
    pub fn with_next_devicestate(mut self, kind: DeviceStateKind) -> Self {
        self.next_devicestate = kind;
        self
    }

    /// Immediately fulfills `execution-complete`; `result-available` is
    /// settled later, externally, by the condition handler.
    pub fn execute(&mut self) {
        self.state = CommandState::Sent;
        self.execution_complete.fulfill(());
    }

    pub fn fire(&mut self) {
        if self.state != CommandState::Sent {
            return;
        }
        self.state = CommandState::Success;
        self.result_available.fulfill(Ok(()));
    }

    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = CommandState::Cancelled;
        self.result_available.fulfill(Err(CommandError::Response {
            code: "CANCELLED".into(),
            message: "wait command was cancelled".into(),
            result: None,
            captures: Default::default(),
        }));
    }
}

/// Unifies the four command kinds so a `CommandSeries` (or a device queue)
/// can hold a mix of them without trait objects (Design Note §9).
pub enum CommandNode {
    Single(Command),
    Series(CommandSeries),
    Repeated(RepeatedCommand),
    Wait(WaitCommand),
}

impl CommandNode {
    #[must_use]
    pub fn id(&self) -> CommandId {
        match self {
            CommandNode::Single(c) => c.id,
            CommandNode::Series(s) => s.id,
            CommandNode::Repeated(r) => r.id,
            CommandNode::Wait(w) => w.id,
        }
    }

    #[must_use]
    pub fn urgent(&self) -> bool {
        match self {
            CommandNode::Single(c) => c.spec.urgent,
            CommandNode::Series(s) => s.urgent(),
            CommandNode::Repeated(_) => false,
            CommandNode::Wait(_) => false,
        }
    }

    #[must_use]
    pub fn run_while_device_busy(&self) -> bool {
        match self {
            CommandNode::Single(c) => c.spec.run_while_device_busy,
            CommandNode::Series(s) => s
                .children
                .first()
                .map(CommandNode::run_while_device_busy)
                .unwrap_or(false),
            CommandNode::Repeated(_) => true,
            CommandNode::Wait(_) => false,
        }
    }

    #[must_use]
    pub fn state(&self) -> CommandState {
        match self {
            CommandNode::Single(c) => c.state,
            CommandNode::Series(s) => s.state,
            CommandNode::Repeated(r) => {
                if r.running {
                    CommandState::Sent
                } else {
                    CommandState::NotSent
                }
            }
            CommandNode::Wait(w) => w.state,
        }
    }

    pub fn cancel(&mut self) {
        match self {
            CommandNode::Single(c) => c.cancel(),
            CommandNode::Series(s) => s.cancel(),
            CommandNode::Repeated(_) => {}
            CommandNode::Wait(w) => w.cancel(),
        }
    }

    fn force_success(&mut self) {
        if let CommandNode::Single(c) = self {
            c.state = CommandState::Success;
        }
    }

    fn force_fail(&mut self) {
        if let CommandNode::Single(c) = self {
            c.state = CommandState::Fail;
        }
    }
}
