//! Control-plane TCP server.
//!
//! Listens on the well-known endpoint and speaks length-delimited bincode
//! envelopes. Each connection runs a request loop and, concurrently, a
//! broadcast-forwarding loop; both share the write half behind a mutex.
//! Failure to bind at startup is fatal for the daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use botlink_core::proto::{Body, Envelope, EnvelopeCodec, Reply, Request, RPC_VERSION};
use botlink_core::Status;

use crate::service::DaemonService;
use crate::Result;

type EnvelopeSink = SplitSink<Framed<TcpStream, EnvelopeCodec>, Envelope>;

pub struct ControlServer {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl ControlServer {
    /// Bind the control endpoint and start accepting clients.
    pub async fn bind(addr: SocketAddr, service: DaemonService) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "control server listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "control client connected");
                            let service = service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, service).await {
                                    debug!(%peer, error = %e, "control connection ended");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "control accept failed"),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("control server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { local_addr, shutdown_tx })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Established connections wind down as
    /// their clients disconnect or the service aborts their requests.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(stream: TcpStream, service: DaemonService) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (sink, mut requests) = Framed::new(stream, EnvelopeCodec::default()).split();
    let sink = Arc::new(Mutex::new(sink));

    // Forward daemon broadcasts for as long as the client is connected.
    let events = service.subscribe();
    let forwarder = tokio::spawn(forward_broadcasts(events, Arc::clone(&sink)));

    while let Some(next) = requests.next().await {
        let envelope = match next {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "dropping malformed control message");
                break;
            }
        };
        let Envelope { version, id, body } = envelope;
        let Body::Request(request) = body else {
            debug!("ignoring non-request envelope from client");
            continue;
        };

        let reply = if version.compatible_with(&RPC_VERSION) {
            service.handle(request).await
        } else {
            refused_reply(&request)
        };

        let mut sink = sink.lock().await;
        if sink.send(Envelope::reply(id, reply)).await.is_err() {
            break;
        }
    }

    forwarder.abort();
    Ok(())
}

/// The client's envelope major does not match ours; refuse without
/// touching the service.
fn refused_reply(request: &Request) -> Reply {
    let status = Status::RpcVersionMismatch;
    match request {
        Request::Connect { .. } => Reply::Connect { status, version: RPC_VERSION },
        Request::ResolveSerialId { .. } => Reply::ResolveSerialId { status, endpoint: None },
        Request::SendRobotPing { .. } => Reply::SendRobotPing { status },
        Request::CycleDongle { .. } => Reply::CycleDongle { status },
    }
}

async fn forward_broadcasts(
    mut events: broadcast::Receiver<botlink_core::proto::Broadcast>,
    sink: Arc<Mutex<EnvelopeSink>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let mut sink = sink.lock().await;
                if sink.send(Envelope::broadcast(event)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "client event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
