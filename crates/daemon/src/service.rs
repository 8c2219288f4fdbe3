//! Daemon RPC service.
//!
//! The thin, cloneable front of the control plane: it owns the command
//! channel into the lifecycle supervisor and the broadcast channel out of
//! it. The control server calls [`DaemonService::handle`] for every
//! request; tests drive it directly.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use botlink_core::proto::{Broadcast, Reply, Request, RPC_VERSION};
use botlink_core::Status;

use crate::device::DongleIo;
use crate::lifecycle::{ControlCommand, DongleState, Supervisor};

/// Capacity of the event fan-out; slow subscribers lag rather than block
/// the producer.
const EVENT_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct DaemonService {
    cmd_tx: mpsc::Sender<ControlCommand>,
    events: broadcast::Sender<Broadcast>,
    state: watch::Receiver<DongleState>,
}

impl DaemonService {
    /// Spawn the lifecycle supervisor over the given dongle access and
    /// return the service handle.
    pub fn start(io: Arc<dyn DongleIo>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(DongleState::Idle);
        let supervisor = Supervisor::new(io, cmd_rx, events.clone(), state_tx);
        tokio::spawn(supervisor.run());
        Self { cmd_tx, events, state }
    }

    /// Dispatch one control-plane request. Every reply carries a status;
    /// errors never escape as panics or hangs.
    pub async fn handle(&self, request: Request) -> Reply {
        debug!(?request, "handling control request");
        match request {
            Request::Connect { version } => {
                let status = if version.compatible_with(&RPC_VERSION) {
                    Status::Ok
                } else {
                    Status::RpcVersionMismatch
                };
                Reply::Connect { status, version: RPC_VERSION }
            }
            Request::ResolveSerialId { serial_id } => {
                let aborted =
                    || Reply::ResolveSerialId { status: Status::OperationAborted, endpoint: None };
                let (reply_tx, reply_rx) = oneshot::channel();
                let command = ControlCommand::ResolveSerialId { serial_id, reply: reply_tx };
                if self.cmd_tx.send(command).await.is_err() {
                    return aborted();
                }
                reply_rx.await.unwrap_or_else(|_| aborted())
            }
            Request::SendRobotPing { destinations } => {
                let aborted = || Reply::SendRobotPing { status: Status::OperationAborted };
                let (reply_tx, reply_rx) = oneshot::channel();
                let command =
                    ControlCommand::SendRobotPing { destinations, reply: reply_tx };
                if self.cmd_tx.send(command).await.is_err() {
                    return aborted();
                }
                reply_rx.await.unwrap_or_else(|_| aborted())
            }
            Request::CycleDongle { seconds } => {
                let aborted = || Reply::CycleDongle { status: Status::OperationAborted };
                let (reply_tx, reply_rx) = oneshot::channel();
                let command = ControlCommand::CycleDongle { seconds, reply: reply_tx };
                if self.cmd_tx.send(command).await.is_err() {
                    return aborted();
                }
                reply_rx.await.unwrap_or_else(|_| aborted())
            }
        }
    }

    /// Subscribe to `dongleEvent`/`robotEvent` broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.events.subscribe()
    }

    /// Current lifecycle state of the dongle.
    pub fn dongle_state(&self) -> DongleState {
        *self.state.borrow()
    }

    /// Stop the supervisor: drain proxies, close the dongle, then return.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ControlCommand::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}
