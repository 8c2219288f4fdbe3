//! Robot proxy server.
//!
//! One task per resolved robot. It owns a TCP listener on a local
//! ephemeral port and a logical port on the radio link, and bridges one
//! client RPC session at a time onto the router: client frames go out as
//! addressed packets, inbound packets for this robot are written back
//! verbatim.
//!
//! When the task finishes, for whatever reason, it unregisters its route
//! and reports `(serial, generation)` on the completion channel; the
//! supervisor erases the map entry on its own strand, so completion never
//! races a concurrent `resolveSerialId`.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use botlink_core::proto::{Body, Envelope, Reply, Request, RecordCodec, RPC_VERSION};
use botlink_core::{AddressedPacket, SerialId, Status};
use botlink_framing::FramingError;

use crate::router::Router;
use crate::DaemonError;

/// Where a proxy is in its life. `Dead` entries never stay in the
/// supervisor's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Listener up, no client session.
    Listening,
    /// A client session is being bridged.
    Active,
    /// Tearing down; no longer routable.
    Draining,
    /// Finished; completion has been reported.
    Dead,
}

enum SessionEnd {
    ClientGone,
    ShuttingDown,
}

pub(crate) struct ProxyTask {
    pub(crate) serial_id: SerialId,
    pub(crate) link_port: u8,
    pub(crate) generation: u64,
    pub(crate) listener: TcpListener,
    pub(crate) router: Arc<Router>,
    pub(crate) inbound: mpsc::Receiver<AddressedPacket>,
    pub(crate) shutdown: oneshot::Receiver<()>,
    pub(crate) state: watch::Sender<ProxyState>,
    pub(crate) done: mpsc::Sender<(SerialId, u64)>,
}

pub(crate) async fn run(mut task: ProxyTask) {
    let serial_id = task.serial_id;
    let generation = task.generation;

    match task.serve().await {
        Ok(()) => debug!(serial = %serial_id, "proxy closed"),
        Err(e) => warn!(serial = %serial_id, error = %e, "proxy failed"),
    }

    task.state.send_replace(ProxyState::Draining);
    task.router.unregister(serial_id);
    task.state.send_replace(ProxyState::Dead);
    let _ = task.done.send((serial_id, generation)).await;
}

impl ProxyTask {
    async fn serve(&mut self) -> Result<(), DaemonError> {
        loop {
            tokio::select! {
                _ = &mut self.shutdown => return Ok(()),

                packet = self.inbound.recv() => match packet {
                    None => return Ok(()),
                    Some(_) => trace!(serial = %self.serial_id, "no client session, dropping inbound packet"),
                },

                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(serial = %self.serial_id, %peer, "robot client connected");
                    self.state.send_replace(ProxyState::Active);
                    let end = self.session(stream).await?;
                    self.state.send_replace(ProxyState::Listening);
                    match end {
                        SessionEnd::ShuttingDown => return Ok(()),
                        SessionEnd::ClientGone => {
                            info!(serial = %self.serial_id, "robot client disconnected");
                        }
                    }
                }
            }
        }
    }

    /// Bridge one client session. `Err` means the shared link failed and
    /// the proxy must die; `ClientGone` just returns us to listening.
    async fn session(&mut self, stream: TcpStream) -> Result<SessionEnd, DaemonError> {
        let _ = stream.set_nodelay(true);
        let (mut sink, mut frames) = Framed::new(stream, RecordCodec).split();

        // RPC connect handshake: the first record must be a connect
        // request, answered by the proxy itself.
        let first = tokio::select! {
            _ = &mut self.shutdown => return Ok(SessionEnd::ShuttingDown),
            record = frames.next() => record,
        };
        let Some(Ok(first)) = first else {
            return Ok(SessionEnd::ClientGone);
        };
        match bincode::deserialize::<Envelope>(&first) {
            Ok(Envelope { id, body: Body::Request(Request::Connect { version }), .. }) => {
                let status = if version.compatible_with(&RPC_VERSION) {
                    Status::Ok
                } else {
                    Status::RpcVersionMismatch
                };
                let reply =
                    Envelope::reply(id, Reply::Connect { status, version: RPC_VERSION });
                let bytes =
                    bincode::serialize(&reply).expect("envelope serialization should not fail");
                if sink.send(Bytes::from(bytes)).await.is_err() || status != Status::Ok {
                    return Ok(SessionEnd::ClientGone);
                }
            }
            _ => {
                debug!(serial = %self.serial_id, "client did not open with a connect request");
                return Ok(SessionEnd::ClientGone);
            }
        }

        loop {
            tokio::select! {
                _ = &mut self.shutdown => return Ok(SessionEnd::ShuttingDown),

                record = frames.next() => match record {
                    None | Some(Err(_)) => return Ok(SessionEnd::ClientGone),
                    Some(Ok(bytes)) => {
                        let packet = match AddressedPacket::new(
                            self.serial_id,
                            self.link_port,
                            bytes.to_vec(),
                        ) {
                            Ok(packet) => packet,
                            Err(e) => {
                                warn!(serial = %self.serial_id, error = %e, "dropping oversized client frame");
                                continue;
                            }
                        };
                        match self.router.send(&packet).await {
                            Ok(()) => {}
                            Err(FramingError::OperationAborted) => {
                                return Ok(SessionEnd::ShuttingDown)
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                },

                packet = self.inbound.recv() => match packet {
                    None => return Ok(SessionEnd::ShuttingDown),
                    Some(packet) => {
                        if sink.send(Bytes::from(packet.payload)).await.is_err() {
                            return Ok(SessionEnd::ClientGone);
                        }
                    }
                },
            }
        }
    }
}
