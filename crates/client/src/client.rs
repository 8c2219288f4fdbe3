//! Daemon control-plane client.
//!
//! One connection per request, like the daemon's own clients have always
//! done: connect, send the envelope, read frames until the matching reply
//! arrives (skipping interleaved broadcasts), disconnect. Event watching
//! uses a dedicated long-lived connection instead.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use botlink_core::proto::{
    Body, Broadcast, Endpoint, Envelope, EnvelopeCodec, Reply, Request,
};
use botlink_core::CONTROL_ADDR;

use crate::{ClientError, Result};

pub struct DaemonClient {
    addr: SocketAddr,
    request_id: AtomicU32,
}

impl DaemonClient {
    /// A client for a daemon at a specific address (tests bind ephemeral
    /// control endpoints).
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, request_id: AtomicU32::new(1) }
    }

    /// A client for the local daemon on the well-known endpoint.
    pub fn local() -> Self {
        Self::new(CONTROL_ADDR)
    }

    fn next_id(&self) -> u32 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<Framed<TcpStream, EnvelopeCodec>> {
        let stream = TcpStream::connect(self.addr).await.map_err(|e| {
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) {
                ClientError::DaemonUnavailable
            } else {
                ClientError::Io(e)
            }
        })?;
        let _ = stream.set_nodelay(true);
        Ok(Framed::new(stream, EnvelopeCodec::default()))
    }

    /// Send one request and wait for its reply.
    pub async fn call(&self, request: Request) -> Result<Reply> {
        let mut framed = self.connect().await?;
        let id = self.next_id();
        debug!(id, ?request, "sending control request");
        framed.send(Envelope::request(id, request)).await?;

        while let Some(next) = framed.next().await {
            let envelope = next?;
            match envelope.body {
                Body::Reply(reply) if envelope.id == id => return Ok(reply),
                Body::Broadcast(_) => continue,
                other => debug!(?other, "ignoring unexpected envelope"),
            }
        }
        Err(ClientError::ConnectionClosed)
    }

    /// Resolve the local TCP endpoint proxying the given robot.
    pub async fn resolve_serial_id(&self, serial_id: &str) -> Result<Endpoint> {
        let request = Request::ResolveSerialId { serial_id: serial_id.to_owned() };
        match self.call(request).await? {
            Reply::ResolveSerialId { status, endpoint } if status.is_ok() => {
                endpoint.ok_or(ClientError::NoRobotEndpoint)
            }
            Reply::ResolveSerialId { status, .. } => Err(ClientError::Status(status)),
            _ => Err(ClientError::ConnectionClosed),
        }
    }

    /// Ask the dongle to radio-ping the given robots.
    pub async fn send_robot_ping(&self, serial_ids: &[String]) -> Result<()> {
        let request = Request::SendRobotPing { destinations: serial_ids.to_vec() };
        match self.call(request).await? {
            Reply::SendRobotPing { status } if status.is_ok() => Ok(()),
            Reply::SendRobotPing { status } => Err(ClientError::Status(status)),
            _ => Err(ClientError::ConnectionClosed),
        }
    }

    /// Force the daemon to drop the dongle and reacquire it after the
    /// given number of seconds.
    pub async fn cycle_dongle(&self, seconds: u32) -> Result<()> {
        match self.call(Request::CycleDongle { seconds }).await? {
            Reply::CycleDongle { status } if status.is_ok() => Ok(()),
            Reply::CycleDongle { status } => Err(ClientError::Status(status)),
            _ => Err(ClientError::ConnectionClosed),
        }
    }

    /// Open a dedicated connection that yields `dongleEvent`/`robotEvent`
    /// broadcasts as they happen.
    pub async fn subscribe(&self) -> Result<EventStream> {
        let framed = self.connect().await?;
        Ok(EventStream { framed })
    }
}

/// A stream of daemon broadcasts over a dedicated connection.
pub struct EventStream {
    framed: Framed<TcpStream, EnvelopeCodec>,
}

impl EventStream {
    /// The next broadcast, or `None` when the daemon goes away.
    pub async fn next(&mut self) -> Option<Result<Broadcast>> {
        while let Some(next) = self.framed.next().await {
            match next {
                Ok(envelope) => {
                    if let Body::Broadcast(broadcast) = envelope.body {
                        return Some(Ok(broadcast));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}
