//! `labrigd` — loads a station config, builds the device fleet, and drives
//! the experiment scheduler to completion on a single-threaded runtime
//! (spec.md §5's single cooperative event loop). Pure wiring: the actual
//! per-instrument wire formatting is a driver catalog this binary does not
//! ship (spec.md §1).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser as ClapParser;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use labrig::command::{Command, CommandNode, CommandSpec};
use labrig::condition::ObservationSource;
use labrig::condition_handler::ConditionHandler;
use labrig::config::Settings;
use labrig::device::{Device, DeviceActor, DeviceCommand, DeviceError, DeviceStateKind};
use labrig::experiment::{DeviceCall, DeviceDispatch, Scheduler};
use labrig::logging::init_logging;
use labrig::observable::{Sample, Subscriber, Value};
use labrig::parser::Parser as ReplyParser;
use labrig::protocol::{parse_address, ConnectionKind, Transport};

const DEFAULT_INSTRUMENT_PORT: u16 = 5025;

#[derive(ClapParser)]
#[command(name = "labrigd")]
#[command(about = "Laboratory instrument orchestration daemon", long_about = None)]
struct Cli {
    /// Path to the station's YAML config file.
    #[arg(long, default_value = "station.yaml")]
    config: PathBuf,

    /// Directory experiment run logs are written under.
    #[arg(long, default_value = "runs")]
    log_root: PathBuf,
}

/// The per-instrument wire catalog: building a `CommandSpec` from a named
/// method is an external collaborator's job (spec.md §1 scope note). This
/// binary ships no concrete driver, so every call reports that plainly
/// rather than guessing at a wire format.
trait DriverCatalog: Send + Sync {
    fn build_command(
        &self,
        method: &str,
        args: &[JsonValue],
        kwargs: &HashMap<String, JsonValue>,
    ) -> Result<(CommandSpec, Arc<dyn ReplyParser>), DeviceError>;
}

struct NullCatalog;

impl DriverCatalog for NullCatalog {
    fn build_command(
        &self,
        method: &str,
        _args: &[JsonValue],
        _kwargs: &HashMap<String, JsonValue>,
    ) -> Result<(CommandSpec, Arc<dyn ReplyParser>), DeviceError> {
        Err(DeviceError::Transport(format!(
            "no driver catalog configured; cannot build wire command for method '{method}'"
        )))
    }
}

/// One configured device's live handle: an actor mailbox plus the cheap
/// state snapshot it keeps updated (see `DeviceActor::state_mirror`).
struct DeviceHandle {
    tx: mpsc::Sender<DeviceCommand>,
    state_mirror: Arc<AtomicU8>,
}

/// Bridges component K's `DeviceDispatch` seam onto live `DeviceActor`
/// mailboxes, one per configured device.
struct ActorDispatch {
    handles: HashMap<String, DeviceHandle>,
    catalog: Arc<dyn DriverCatalog>,
}

#[async_trait]
impl DeviceDispatch for ActorDispatch {
    async fn call(&self, call: &DeviceCall) -> Result<(), DeviceError> {
        let handle = &self
            .handles
            .get(&call.device)
            .ok_or_else(|| DeviceError::UnknownConnectionType(call.device.clone()))?
            .tx;
        let (spec, parser) = self.catalog.build_command(&call.method, &call.args, &call.kwargs)?;
        let (cmd, _exec_rx, result_rx) = Command::new(spec, parser);
        let node = labrig::command::CommandNode::Single(cmd);

        let (ack_tx, ack_rx) = oneshot::channel();
        handle
            .send(DeviceCommand::Enqueue { node, ack: ack_tx })
            .await
            .map_err(|_| DeviceError::Transport(format!("device '{}' actor is gone", call.device)))?;
        ack_rx
            .await
            .map_err(|_| DeviceError::Transport(format!("device '{}' dropped the enqueue ack", call.device)))??;

        result_rx
            .await
            .map_err(|_| DeviceError::Transport(format!("device '{}' dropped the result", call.device)))?
            .map(|_| ())
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }

    async fn submit(&self, device: &str, node: CommandNode) -> Result<(), DeviceError> {
        let handle = &self
            .handles
            .get(device)
            .ok_or_else(|| DeviceError::UnknownConnectionType(device.to_string()))?
            .tx;

        let (ack_tx, ack_rx) = oneshot::channel();
        handle
            .send(DeviceCommand::Enqueue { node, ack: ack_tx })
            .await
            .map_err(|_| DeviceError::Transport(format!("device '{device}' actor is gone")))?;
        ack_rx
            .await
            .map_err(|_| DeviceError::Transport(format!("device '{device}' dropped the enqueue ack")))?
    }

    fn device_state_kind(&self, device: &str) -> Option<DeviceStateKind> {
        let handle = self.handles.get(device)?;
        Some(DeviceStateKind::from_u8(handle.state_mirror.load(Ordering::Relaxed)))
    }

    fn subscribe(&self, device: &str, subscriber: Arc<dyn Subscriber>) {
        if let Some(handle) = self.handles.get(device) {
            if handle.tx.try_send(DeviceCommand::Subscribe { subscriber }).is_err() {
                warn!(device, "failed to enqueue subscribe request");
            }
        }
    }

    fn unsubscribe(&self, device: &str, subscriber: &Arc<dyn Subscriber>) {
        if let Some(handle) = self.handles.get(device) {
            if handle
                .tx
                .try_send(DeviceCommand::Unsubscribe {
                    subscriber: subscriber.clone(),
                })
                .is_err()
            {
                warn!(device, "failed to enqueue unsubscribe request");
            }
        }
    }

    async fn stop(&self, device: &str) {
        let Some(handle) = self.handles.get(device) else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.tx.send(DeviceCommand::Stop { ack: ack_tx }).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// No condition currently needs live observable lookups outside of what
/// `ConditionHandler` already tracks internally for registered conditions;
/// this is the minimal `ObservationSource` a standalone binary needs until
/// a richer station-wide index is wired in.
struct NullSource;

impl ObservationSource for NullSource {
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
    fn publish(&mut self, _producer: &str, _name: &str, _value: Value, _timestamp: chrono::DateTime<chrono::Utc>) {}
}

async fn connect_device(name: &str, address: &str) -> Result<Device> {
    let kind = parse_address(address, DEFAULT_INSTRUMENT_PORT).context("unrecognized device address")?;
    let transport = match kind {
        ConnectionKind::Tcp { host, port } => Transport::connect_tcp(&host, port, b"\n".to_vec())
            .await
            .with_context(|| format!("connecting to {name} at {host}:{port}"))?,
        #[cfg(feature = "instrument_serial")]
        ConnectionKind::Serial { port } => {
            Transport::connect_serial(&port, 9600, b"\n".to_vec()).with_context(|| format!("opening {name} on {port}"))?
        }
        #[cfg(not(feature = "instrument_serial"))]
        ConnectionKind::Serial { .. } => {
            anyhow::bail!("device '{name}' needs serial support; rebuild with --features instrument_serial")
        }
    };
    let mut device = Device::new(name, transport);
    device.mark_ready();
    Ok(device)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_file(&cli.config).context("loading station config")?;
    init_logging(&settings.log_level);
    info!(config = %cli.config.display(), devices = settings.devices.len(), "starting labrigd");

    let mut handles = HashMap::new();
    for (name, device_settings) in &settings.devices {
        let device = connect_device(name, &device_settings.address).await?;
        let (actor, tx) = DeviceActor::new(device);
        let state_mirror = actor.state_mirror();
        tokio::spawn(actor.serve());
        handles.insert(name.clone(), DeviceHandle { tx, state_mirror });
    }

    let dispatch = ActorDispatch {
        handles,
        catalog: Arc::new(NullCatalog),
    };
    let mut conditions = ConditionHandler::new();
    let mut source = NullSource;
    let mut scheduler = Scheduler::new();

    scheduler
        .run_to_completion(&dispatch, &mut conditions, &mut source, &cli.log_root)
        .await;

    info!(runs = scheduler.history.len(), "all queued experiments reached a terminal state");
    Ok(())
}
