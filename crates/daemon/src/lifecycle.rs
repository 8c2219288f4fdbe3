//! Dongle lifecycle supervisor.
//!
//! One task owns everything mutable in the daemon: the acquisition state
//! machine, the generation counter, the proxy map and the currently
//! installed router. Every other component reaches it through the command
//! channel, so map mutation, lifecycle transitions and proxy completion
//! are all serialised here, on the daemon's control strand.
//!
//! Acquisition walks Opening → Settling → Handshaking → Connecting →
//! Live; any failure drops into Cooldown and retries. While live, two
//! traps watch the dongle: the router's inbound pump (fast notice of read
//! errors) and a periodic keepalive write, because on some OS serial
//! drivers only the write side of a removed USB device fails. A trap error
//! other than a deliberate abort tears the generation down and schedules
//! reacquisition.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use botlink_core::proto::{
    Broadcast, DongleReply, DongleRequest, Endpoint, Reply, RPC_VERSION,
};
use botlink_core::{
    AddressedPacket, SerialId, Status, CONNECT_TIMEOUT, CONTROL_CHANNEL, ERROR_DOWNTIME,
    HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, POLL_INTERVAL, SETTLE_DELAY,
};
use botlink_framing::{FramingError, LinkReceiver, LinkSender, ReliableLink};

use crate::device::DongleIo;
use crate::proxy::{self, ProxyState, ProxyTask};
use crate::router::Router;

/// Where the dongle currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DongleState {
    Idle,
    Opening,
    Settling,
    Handshaking,
    Connecting,
    Live(u64),
    Cooldown,
}

/// Requests arriving from the daemon RPC service.
pub(crate) enum ControlCommand {
    ResolveSerialId { serial_id: String, reply: oneshot::Sender<Reply> },
    SendRobotPing { destinations: Vec<String>, reply: oneshot::Sender<Reply> },
    CycleDongle { seconds: u32, reply: oneshot::Sender<Reply> },
    Shutdown { done: oneshot::Sender<()> },
}

struct ProxyEntry {
    endpoint: Endpoint,
    generation: u64,
    link_port: u8,
    task: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ProxyState>,
}

impl ProxyEntry {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && *self.state.borrow() != ProxyState::Dead
    }

    fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Everything that exists only while a generation is live.
struct LiveDongle {
    router: Arc<Router>,
    generation: u64,
    fault_tx: mpsc::Sender<FramingError>,
    fault_rx: mpsc::Receiver<FramingError>,
    pump: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

enum Interrupt {
    Cycle(Duration),
    Shutdown(Option<oneshot::Sender<()>>),
}

enum Acquired {
    Live(LiveDongle),
    Retry(Duration),
    Interrupted(Interrupt),
}

enum LiveExit {
    Fault,
    Cycle(Duration),
    Shutdown(Option<oneshot::Sender<()>>),
}

enum IdleOutcome {
    Elapsed,
    Shutdown(Option<oneshot::Sender<()>>),
}

pub(crate) struct Supervisor {
    io: Arc<dyn DongleIo>,
    cmd_rx: mpsc::Receiver<ControlCommand>,
    events: broadcast::Sender<Broadcast>,
    state_tx: watch::Sender<DongleState>,
    proxy_done_tx: mpsc::Sender<(SerialId, u64)>,
    proxy_done_rx: mpsc::Receiver<(SerialId, u64)>,
    proxies: HashMap<SerialId, ProxyEntry>,
    generation: u64,
    next_link_port: u8,
}

impl Supervisor {
    pub(crate) fn new(
        io: Arc<dyn DongleIo>,
        cmd_rx: mpsc::Receiver<ControlCommand>,
        events: broadcast::Sender<Broadcast>,
        state_tx: watch::Sender<DongleState>,
    ) -> Self {
        let (proxy_done_tx, proxy_done_rx) = mpsc::channel(64);
        Self {
            io,
            cmd_rx,
            events,
            state_tx,
            proxy_done_tx,
            proxy_done_rx,
            proxies: HashMap::new(),
            generation: 0,
            next_link_port: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("waiting for dongle");
        let mut deadline = Instant::now();
        let done = loop {
            match self.idle_until(deadline).await {
                IdleOutcome::Shutdown(done) => break done,
                IdleOutcome::Elapsed => {}
            }
            match self.acquire().await {
                Acquired::Live(live) => match self.run_live(live).await {
                    LiveExit::Fault => deadline = Instant::now() + ERROR_DOWNTIME,
                    LiveExit::Cycle(downtime) => deadline = Instant::now() + downtime,
                    LiveExit::Shutdown(done) => break done,
                },
                Acquired::Retry(delay) => deadline = Instant::now() + delay,
                Acquired::Interrupted(Interrupt::Cycle(downtime)) => {
                    deadline = Instant::now() + downtime
                }
                Acquired::Interrupted(Interrupt::Shutdown(done)) => break done,
            }
        };
        self.enter(DongleState::Idle);
        info!("dongle supervisor stopped");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn enter(&self, state: DongleState) {
        debug!(?state, "dongle state");
        self.state_tx.send_replace(state);
    }

    fn dongle_event(&self, status: Status) {
        info!(%status, "dongle event");
        let _ = self.events.send(Broadcast::DongleEvent { status });
    }

    /// Cooldown: answer commands until the retry deadline passes.
    async fn idle_until(&mut self, mut deadline: Instant) -> IdleOutcome {
        self.enter(DongleState::Cooldown);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return IdleOutcome::Elapsed,

                finished = self.proxy_done_rx.recv() => {
                    if let Some((serial_id, generation)) = finished {
                        self.finish_proxy(serial_id, generation);
                    }
                }

                command = self.cmd_rx.recv() => match command {
                    None => return IdleOutcome::Shutdown(None),
                    Some(ControlCommand::Shutdown { done }) => {
                        return IdleOutcome::Shutdown(Some(done))
                    }
                    Some(ControlCommand::CycleDongle { seconds, reply }) => {
                        deadline = Instant::now() + Duration::from_secs(seconds.into());
                        let _ = reply.send(Reply::CycleDongle { status: Status::Ok });
                    }
                    Some(command) => Self::refuse_while_down(command),
                },
            }
        }
    }

    /// A dongle-dependent command arriving while no dongle is live is
    /// answered immediately, never queued.
    fn refuse_while_down(command: ControlCommand) {
        match command {
            ControlCommand::ResolveSerialId { reply, .. } => {
                let _ = reply.send(Reply::ResolveSerialId {
                    status: Status::DongleNotFound,
                    endpoint: None,
                });
            }
            ControlCommand::SendRobotPing { reply, .. } => {
                let _ = reply.send(Reply::SendRobotPing { status: Status::DongleNotFound });
            }
            ControlCommand::CycleDongle { .. } | ControlCommand::Shutdown { .. } => {
                unreachable!("handled by the caller")
            }
        }
    }

    /// Drive `fut` while still answering commands; acquisition must never
    /// make the control plane unresponsive.
    async fn race<F: Future>(&mut self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Ok(output),

                finished = self.proxy_done_rx.recv() => {
                    if let Some((serial_id, generation)) = finished {
                        self.finish_proxy(serial_id, generation);
                    }
                }

                command = self.cmd_rx.recv() => match command {
                    None => return Err(Interrupt::Shutdown(None)),
                    Some(ControlCommand::Shutdown { done }) => {
                        return Err(Interrupt::Shutdown(Some(done)))
                    }
                    Some(ControlCommand::CycleDongle { seconds, reply }) => {
                        let _ = reply.send(Reply::CycleDongle { status: Status::Ok });
                        return Err(Interrupt::Cycle(Duration::from_secs(seconds.into())));
                    }
                    Some(command) => Self::refuse_while_down(command),
                },
            }
        }
    }

    async fn acquire(&mut self) -> Acquired {
        self.enter(DongleState::Opening);
        let Some(path) = self.io.find_dongle_path() else {
            debug!("no dongle device present");
            return Acquired::Retry(POLL_INTERVAL);
        };
        info!(path = %path, "dongle detected");
        let stream = match self.io.open(&path) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(path = %path, error = %e, "cannot open dongle");
                self.dongle_event(Status::CannotOpenDongle);
                return Acquired::Retry(POLL_INTERVAL);
            }
        };

        self.enter(DongleState::Settling);
        if let Err(interrupt) = self.race(tokio::time::sleep(SETTLE_DELAY)).await {
            return Acquired::Interrupted(interrupt);
        }

        self.enter(DongleState::Handshaking);
        let link = match self.race(ReliableLink::connect(stream, HANDSHAKE_TIMEOUT)).await {
            Err(interrupt) => return Acquired::Interrupted(interrupt),
            Ok(Err(e)) => {
                warn!(error = %e, "cannot shake hands with the dongle");
                self.dongle_event(Status::StrangeDongle);
                return Acquired::Retry(POLL_INTERVAL);
            }
            Ok(Ok(link)) => link,
        };
        let (sender, mut receiver) = link;

        self.enter(DongleState::Connecting);
        let connect = dongle_connect(&sender, &mut receiver);
        match self.race(connect).await {
            Err(interrupt) => Acquired::Interrupted(interrupt),
            Ok(Err(e)) => {
                warn!(error = %e, "cannot rpc-connect to the dongle");
                match e {
                    ConnectError::VersionMismatch(_) => {
                        self.dongle_event(Status::DongleVersionMismatch)
                    }
                    ConnectError::Link(FramingError::Transport(_)) => {
                        self.dongle_event(Status::CannotOpenDongle)
                    }
                    ConnectError::Link(FramingError::OperationAborted) => {}
                    _ => self.dongle_event(Status::StrangeDongle),
                }
                Acquired::Retry(POLL_INTERVAL)
            }
            Ok(Ok(dongle_version)) => {
                self.generation += 1;
                let generation = self.generation;
                info!(generation, version = %dongle_version, "dongle live");
                self.enter(DongleState::Live(generation));

                let router =
                    Arc::new(Router::new(sender.clone(), generation, self.events.clone()));
                let (fault_tx, fault_rx) = mpsc::channel(4);
                let pump =
                    tokio::spawn(pump_inbound(receiver, router.clone(), fault_tx.clone()));
                let keepalive =
                    tokio::spawn(keepalive_trap(sender, fault_tx.clone()));

                self.dongle_event(Status::Ok);
                Acquired::Live(LiveDongle {
                    router,
                    generation,
                    fault_tx,
                    fault_rx,
                    pump,
                    keepalive,
                })
            }
        }
    }

    async fn run_live(&mut self, mut live: LiveDongle) -> LiveExit {
        let exit = loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    None => break LiveExit::Shutdown(None),
                    Some(ControlCommand::Shutdown { done }) => {
                        break LiveExit::Shutdown(Some(done))
                    }
                    Some(ControlCommand::CycleDongle { seconds, reply }) => {
                        info!(seconds, "cycling dongle on request");
                        let _ = reply.send(Reply::CycleDongle { status: Status::Ok });
                        break LiveExit::Cycle(Duration::from_secs(seconds.into()));
                    }
                    Some(ControlCommand::ResolveSerialId { serial_id, reply }) => {
                        let result = self.resolve(&live, &serial_id).await;
                        let _ = reply.send(match result {
                            Ok(endpoint) => Reply::ResolveSerialId {
                                status: Status::Ok,
                                endpoint: Some(endpoint),
                            },
                            Err(status) => {
                                Reply::ResolveSerialId { status, endpoint: None }
                            }
                        });
                    }
                    Some(ControlCommand::SendRobotPing { destinations, reply }) => {
                        let _ = reply.send(self.ping(&live, destinations));
                    }
                },

                finished = self.proxy_done_rx.recv() => {
                    if let Some((serial_id, generation)) = finished {
                        self.finish_proxy(serial_id, generation);
                    }
                }

                fault = live.fault_rx.recv() => {
                    let error = fault.unwrap_or(FramingError::OperationAborted);
                    if matches!(error, FramingError::OperationAborted) {
                        // Deliberate close, e.g. shutdown already under way;
                        // never recycle on it.
                        debug!("trap reported deliberate close");
                    } else {
                        warn!(error = %error, "dongle i/o trap fired, resetting dongle");
                        break LiveExit::Fault;
                    }
                }
            }
        };

        let emit = matches!(exit, LiveExit::Fault | LiveExit::Cycle(_));
        self.teardown(live, emit).await;
        exit
    }

    /// End the current generation: broadcast, drain every proxy born under
    /// it, close the link. The proxy tasks finish on their own; their
    /// completions carry a stale generation and are ignored.
    async fn teardown(&mut self, live: LiveDongle, emit_event: bool) {
        if emit_event {
            self.dongle_event(Status::DongleNotFound);
        }
        for (_, entry) in self.proxies.drain() {
            entry.close();
        }
        live.router.close().await;
        live.keepalive.abort();
        live.pump.abort();
    }

    async fn resolve(
        &mut self,
        live: &LiveDongle,
        serial_id: &str,
    ) -> Result<Endpoint, Status> {
        let serial: SerialId = serial_id.parse().map_err(|_| Status::InvalidSerialId)?;

        if let Some(entry) = self.proxies.get(&serial) {
            if entry.is_alive() {
                debug!(serial = %serial, endpoint = %entry.endpoint, "reusing proxy");
                return Ok(entry.endpoint.clone());
            }
            // The listener died underneath us; erase the undead entry and
            // fall through to a fresh one.
            warn!(serial = %serial, "terminating undead proxy");
            let entry = self.proxies.remove(&serial).expect("entry just observed");
            live.router.unregister(serial);
            entry.close();
        }

        let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| {
                warn!(error = %e, "cannot bind proxy listener");
                Status::OtherError
            })?;
        let addr = listener.local_addr().map_err(|_| Status::OtherError)?;
        let endpoint =
            Endpoint::new(addr.ip().to_string(), u32::from(addr.port())).map_err(Status::from)?;

        let link_port = self.alloc_link_port();
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        live.router.register(serial, inbound_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ProxyState::Listening);
        let task = tokio::spawn(proxy::run(ProxyTask {
            serial_id: serial,
            link_port,
            generation: live.generation,
            listener,
            router: live.router.clone(),
            inbound: inbound_rx,
            shutdown: shutdown_rx,
            state: state_tx,
            done: self.proxy_done_tx.clone(),
        }));

        info!(serial = %serial, endpoint = %endpoint, link_port, "started robot proxy");
        self.proxies.insert(
            serial,
            ProxyEntry {
                endpoint: endpoint.clone(),
                generation: live.generation,
                link_port,
                task,
                shutdown: Some(shutdown_tx),
                state: state_rx,
            },
        );
        Ok(endpoint)
    }

    fn ping(&self, live: &LiveDongle, destinations: Vec<String>) -> Reply {
        let mut serials = Vec::with_capacity(destinations.len());
        for destination in &destinations {
            match destination.parse::<SerialId>() {
                Ok(serial) => serials.push(serial),
                Err(_) => {
                    return Reply::SendRobotPing { status: Status::InvalidSerialId }
                }
            }
        }
        info!(?destinations, "pinging robots");

        let payload = bincode::serialize(&DongleRequest::Ping { destinations: serials })
            .expect("dongle request serialization should not fail");
        let packet = match AddressedPacket::new(SerialId::DONGLE, CONTROL_CHANNEL, payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "robot ping does not fit a packet");
                return Reply::SendRobotPing { status: Status::OtherError };
            }
        };

        // Fire and forget; an I/O error feeds the fault channel, which
        // recycles the dongle after the usual downtime.
        let router = live.router.clone();
        let fault_tx = live.fault_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = router.send(&packet).await {
                if !matches!(e, FramingError::OperationAborted) {
                    warn!(error = %e, "error sending robot ping, resetting dongle");
                    let _ = fault_tx.send(e).await;
                }
            }
        });
        Reply::SendRobotPing { status: Status::Ok }
    }

    fn finish_proxy(&mut self, serial_id: SerialId, generation: u64) {
        match self.proxies.get(&serial_id) {
            Some(entry) if entry.generation == generation => {
                self.proxies.remove(&serial_id);
                info!(
                    serial = %serial_id,
                    remaining = self.proxies.len(),
                    "proxy finished"
                );
            }
            _ => debug!(serial = %serial_id, generation, "stale proxy completion"),
        }
    }

    fn alloc_link_port(&mut self) -> u8 {
        loop {
            self.next_link_port = self.next_link_port.wrapping_add(1);
            let candidate = self.next_link_port;
            if candidate == CONTROL_CHANNEL {
                continue;
            }
            if !self.proxies.values().any(|entry| entry.link_port == candidate) {
                return candidate;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("dongle speaks rpc version {0}")]
    VersionMismatch(botlink_core::Version),
    #[error("dongle refused the connection: {0}")]
    Refused(Status),
    #[error("timed out waiting for the connect reply")]
    Timeout,
    #[error(transparent)]
    Link(#[from] FramingError),
}

/// The RPC connect exchange with the dongle itself, on the control channel.
async fn dongle_connect(
    sender: &LinkSender,
    receiver: &mut LinkReceiver,
) -> Result<botlink_core::Version, ConnectError> {
    let payload = bincode::serialize(&DongleRequest::Connect { version: RPC_VERSION })
        .expect("dongle request serialization should not fail");
    let request = AddressedPacket::new(SerialId::DONGLE, CONTROL_CHANNEL, payload)
        .expect("connect request fits a packet");
    sender.send(request.encode().into()).await.map_err(ConnectError::Link)?;

    let reply = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            let message = receiver.recv().await.map_err(ConnectError::Link)?;
            let Ok(packet) = AddressedPacket::decode(&message) else {
                continue;
            };
            if packet.port != CONTROL_CHANNEL || packet.serial_id != SerialId::DONGLE {
                continue;
            }
            let Ok(reply) = bincode::deserialize::<DongleReply>(&packet.payload) else {
                continue;
            };
            if let DongleReply::Connect { status, version } = reply {
                return Ok::<_, ConnectError>((status, version));
            }
        }
    })
    .await
    .map_err(|_| ConnectError::Timeout)??;

    let (status, version) = reply;
    if !version.compatible_with(&RPC_VERSION) {
        return Err(ConnectError::VersionMismatch(version));
    }
    if !status.is_ok() {
        return Err(ConnectError::Refused(status));
    }
    Ok(version)
}

async fn pump_inbound(
    mut receiver: LinkReceiver,
    router: Arc<Router>,
    fault_tx: mpsc::Sender<FramingError>,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => router.dispatch(&message),
            Err(e) => {
                let _ = fault_tx.send(e).await;
                return;
            }
        }
    }
}

async fn keepalive_trap(sender: LinkSender, fault_tx: mpsc::Sender<FramingError>) {
    let mut ticks = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        if let Err(e) = sender.keepalive().await {
            let _ = fault_tx.send(e).await;
            return;
        }
    }
}
