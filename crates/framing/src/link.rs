use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::frame::{Frame, FrameCodec, FRAMING_VERSION, MAX_FRAME_PAYLOAD};

/// Delay before an unacknowledged data frame is sent again.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Retransmissions before the link is declared dead.
const MAX_RETRANSMITS: u8 = 8;

/// While handshaking, resend our greeting this often.
const SYN_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The peer never completed the handshake, or answered it wrongly.
    #[error("framing handshake failed")]
    HandshakeFailed,
    /// The link was closed deliberately; callers treat this as benign.
    #[error("operation aborted")]
    OperationAborted,
    /// The message does not fit in a single frame.
    #[error("message of {0} bytes exceeds the {MAX_FRAME_PAYLOAD} byte frame limit")]
    MessageSize(usize),
    /// The peer stopped acknowledging our frames.
    #[error("peer stopped acknowledging")]
    PeerUnresponsive,
    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<io::Error> for FramingError {
    fn from(err: io::Error) -> Self {
        FramingError::Transport(err.to_string())
    }
}

enum LinkCommand {
    Send { payload: Bytes, done: oneshot::Sender<Result<(), FramingError>> },
    Keepalive { done: oneshot::Sender<Result<(), FramingError>> },
    Close,
}

/// Submits messages and keepalives to a connected link. Cheaply cloneable.
#[derive(Clone)]
pub struct LinkSender {
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl LinkSender {
    /// Queue one message; resolves once the peer acknowledged it. FIFO per
    /// direction.
    pub async fn send(&self, payload: Bytes) -> Result<(), FramingError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCommand::Send { payload, done })
            .await
            .map_err(|_| FramingError::OperationAborted)?;
        rx.await.map_err(|_| FramingError::OperationAborted)?
    }

    /// Resolves on the next keepalive round trip. A periodic caller turns
    /// this into a write trap: on dead serial devices the write side fails
    /// even when reads stay silent.
    pub async fn keepalive(&self) -> Result<(), FramingError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCommand::Keepalive { done })
            .await
            .map_err(|_| FramingError::OperationAborted)?;
        rx.await.map_err(|_| FramingError::OperationAborted)?
    }

    /// Close the link. Idempotent; outstanding operations fail with
    /// [`FramingError::OperationAborted`].
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(LinkCommand::Close).await;
    }
}

/// Receives inbound messages from a connected link.
pub struct LinkReceiver {
    rx: mpsc::Receiver<Result<Bytes, FramingError>>,
}

impl LinkReceiver {
    /// Next complete inbound message, in arrival order with duplicates
    /// suppressed. Ends with [`FramingError::OperationAborted`] after a
    /// deliberate close, or with the transport error that killed the link.
    pub async fn recv(&mut self) -> Result<Bytes, FramingError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(FramingError::OperationAborted),
        }
    }
}

/// The reliable framing transport.
pub struct ReliableLink;

impl ReliableLink {
    /// Handshake over `stream` and spawn the link driver.
    ///
    /// The handshake is symmetric: both sides greet, answer the peer's
    /// greeting, and are connected once their own greeting is answered.
    pub async fn connect<S>(
        stream: S,
        timeout: Duration,
    ) -> Result<(LinkSender, LinkReceiver), FramingError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, FrameCodec);
        tokio::time::timeout(timeout, handshake(&mut framed))
            .await
            .map_err(|_| FramingError::HandshakeFailed)??;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(32);
        let (sink, stream) = framed.split();
        tokio::spawn(drive(sink, stream, cmd_rx, in_tx));

        Ok((LinkSender { cmd_tx }, LinkReceiver { rx: in_rx }))
    }
}

async fn handshake<S>(framed: &mut Framed<S, FrameCodec>) -> Result<(), FramingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Frame::Syn { version: FRAMING_VERSION }).await?;
    loop {
        match tokio::time::timeout(SYN_INTERVAL, framed.next()).await {
            // Quiet line; greet again in case the first syn was lost.
            Err(_) => framed.send(Frame::Syn { version: FRAMING_VERSION }).await?,
            Ok(Some(Ok(Frame::Syn { version }))) => {
                if !version.compatible_with(&FRAMING_VERSION) {
                    return Err(FramingError::HandshakeFailed);
                }
                framed.send(Frame::SynAck { version: FRAMING_VERSION }).await?;
            }
            Ok(Some(Ok(Frame::SynAck { version }))) => {
                if !version.compatible_with(&FRAMING_VERSION) {
                    return Err(FramingError::HandshakeFailed);
                }
                return Ok(());
            }
            // Stale frames from a previous incarnation of the peer.
            Ok(Some(Ok(other))) => trace!(?other, "ignoring frame during handshake"),
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(FramingError::HandshakeFailed),
        }
    }
}

struct Inflight {
    seq: u8,
    payload: Bytes,
    done: oneshot::Sender<Result<(), FramingError>>,
    retransmits: u8,
    deadline: Instant,
}

/// Per-link transmit/receive state. Lives on the driver task; everything
/// else talks to it through channels.
struct LinkState {
    send_queue: VecDeque<(Bytes, oneshot::Sender<Result<(), FramingError>>)>,
    inflight: Option<Inflight>,
    next_seq: u8,
    expect_seq: u8,
    keepalive_waiters: Vec<oneshot::Sender<Result<(), FramingError>>>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            send_queue: VecDeque::new(),
            inflight: None,
            next_seq: 0,
            expect_seq: 0,
            keepalive_waiters: Vec::new(),
        }
    }

    fn fail_all(&mut self, error: FramingError) {
        if let Some(inflight) = self.inflight.take() {
            let _ = inflight.done.send(Err(error.clone()));
        }
        for (_, done) in self.send_queue.drain(..) {
            let _ = done.send(Err(error.clone()));
        }
        for done in self.keepalive_waiters.drain(..) {
            let _ = done.send(Err(error.clone()));
        }
    }
}

async fn drive<S>(
    mut sink: SplitSink<Framed<S, FrameCodec>, Frame>,
    mut stream: SplitStream<Framed<S, FrameCodec>>,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    in_tx: mpsc::Sender<Result<Bytes, FramingError>>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut state = LinkState::new();
    let error = loop {
        // Start the next transmission whenever the line is idle.
        if state.inflight.is_none() {
            if let Some((payload, done)) = state.send_queue.pop_front() {
                let seq = state.next_seq;
                if let Err(e) = sink.send(Frame::Data { seq, payload: payload.clone() }).await {
                    let _ = done.send(Err(e.clone()));
                    break e;
                }
                state.inflight = Some(Inflight {
                    seq,
                    payload,
                    done,
                    retransmits: 0,
                    deadline: Instant::now() + RETRANSMIT_INTERVAL,
                });
            }
        }

        let retransmit_at = state
            .inflight
            .as_ref()
            .map(|i| i.deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(LinkCommand::Send { payload, done }) => {
                    if payload.len() > MAX_FRAME_PAYLOAD {
                        let _ = done.send(Err(FramingError::MessageSize(payload.len())));
                    } else {
                        state.send_queue.push_back((payload, done));
                    }
                }
                Some(LinkCommand::Keepalive { done }) => {
                    if let Err(e) = sink.send(Frame::Keepalive).await {
                        let _ = done.send(Err(e.clone()));
                        break e;
                    }
                    state.keepalive_waiters.push(done);
                }
                Some(LinkCommand::Close) | None => break FramingError::OperationAborted,
            },

            frame = stream.next() => match frame {
                Some(Ok(Frame::Data { seq, payload })) => {
                    if let Err(e) = sink.send(Frame::Ack { seq }).await {
                        break e;
                    }
                    if seq == state.expect_seq {
                        state.expect_seq = state.expect_seq.wrapping_add(1);
                        if in_tx.send(Ok(payload)).await.is_err() {
                            // Receiver gone; keep acking so the peer's
                            // sender does not stall, but stop buffering.
                            trace!("inbound receiver dropped");
                        }
                    } else {
                        trace!(seq, expected = state.expect_seq, "suppressing duplicate frame");
                    }
                }
                Some(Ok(Frame::Ack { seq })) => {
                    match state.inflight.take() {
                        Some(inflight) if inflight.seq == seq => {
                            state.next_seq = state.next_seq.wrapping_add(1);
                            let _ = inflight.done.send(Ok(()));
                        }
                        other => {
                            trace!(seq, "ignoring unexpected ack");
                            state.inflight = other;
                        }
                    }
                }
                Some(Ok(Frame::Keepalive)) => {
                    if let Err(e) = sink.send(Frame::KeepaliveAck).await {
                        break e;
                    }
                }
                Some(Ok(Frame::KeepaliveAck)) => {
                    for done in state.keepalive_waiters.drain(..) {
                        let _ = done.send(Ok(()));
                    }
                }
                Some(Ok(Frame::Syn { .. })) | Some(Ok(Frame::SynAck { .. })) => {
                    trace!("ignoring handshake frame on a connected link");
                }
                Some(Err(e)) => break e,
                None => break FramingError::Transport("stream closed by peer".into()),
            },

            _ = tokio::time::sleep_until(retransmit_at), if state.inflight.is_some() => {
                let give_up = {
                    let inflight = state.inflight.as_mut().expect("guarded by select condition");
                    inflight.retransmits += 1;
                    inflight.retransmits > MAX_RETRANSMITS
                };
                if give_up {
                    break FramingError::PeerUnresponsive;
                }
                let (seq, payload) = {
                    let inflight = state.inflight.as_mut().expect("guarded by select condition");
                    inflight.deadline = Instant::now() + RETRANSMIT_INTERVAL;
                    (inflight.seq, inflight.payload.clone())
                };
                trace!(seq, "retransmitting unacknowledged frame");
                if let Err(e) = sink.send(Frame::Data { seq, payload }).await {
                    break e;
                }
            }
        }
    };

    debug!(%error, "link driver stopping");
    state.fail_all(error.clone());
    let _ = in_tx.send(Err(error)).await;
    // Dropping sink and stream closes the underlying byte stream.
}
