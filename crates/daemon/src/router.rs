//! Addressed packet router.
//!
//! Sits directly on the framing link of one dongle generation. Outbound,
//! it encodes [`AddressedPacket`]s onto the link; inbound, it demultiplexes
//! by source serial and hands port-0 traffic to the robot-event broadcast.
//!
//! The routing table is guarded by a plain mutex held only for map
//! operations. Entries are inserted and removed exclusively on the control
//! strand (resolve and proxy completion); the inbound pump only reads.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

use botlink_core::proto::{Broadcast, RobotAnnounce, RobotEvent};
use botlink_core::{AddressedPacket, SerialId, CONTROL_CHANNEL};
use botlink_framing::{FramingError, LinkSender};

pub struct Router {
    link: LinkSender,
    generation: u64,
    routes: Mutex<HashMap<SerialId, mpsc::Sender<AddressedPacket>>>,
    events: broadcast::Sender<Broadcast>,
}

impl Router {
    pub(crate) fn new(
        link: LinkSender,
        generation: u64,
        events: broadcast::Sender<Broadcast>,
    ) -> Self {
        Self { link, generation, routes: Mutex::new(HashMap::new()), events }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write one packet to the shared link; resolves when acknowledged.
    pub(crate) async fn send(&self, packet: &AddressedPacket) -> Result<(), FramingError> {
        self.link.send(Bytes::from(packet.encode())).await
    }

    pub(crate) fn register(&self, serial_id: SerialId, inbound: mpsc::Sender<AddressedPacket>) {
        let mut routes = self.routes.lock().expect("route table mutex poisoned");
        routes.insert(serial_id, inbound);
    }

    pub(crate) fn unregister(&self, serial_id: SerialId) {
        let mut routes = self.routes.lock().expect("route table mutex poisoned");
        routes.remove(&serial_id);
    }

    /// Dispatch one raw link message. Malformed or unroutable packets are
    /// logged and dropped; nothing inbound is ever fatal here.
    pub(crate) fn dispatch(&self, message: &[u8]) {
        let packet = match AddressedPacket::decode(message) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "dropping undecodable link message");
                return;
            }
        };

        if packet.port == CONTROL_CHANNEL {
            if packet.serial_id == SerialId::DONGLE {
                // Control replies from the dongle itself (e.g. ping acks)
                // need no routing.
                trace!("dongle control reply");
                return;
            }
            self.announce(packet);
            return;
        }

        let target = {
            let routes = self.routes.lock().expect("route table mutex poisoned");
            routes.get(&packet.serial_id).cloned()
        };
        match target {
            Some(inbound) => {
                let serial_id = packet.serial_id;
                if let Err(e) = inbound.try_send(packet) {
                    debug!(serial = %serial_id, error = %e, "dropping packet for stalled proxy");
                }
            }
            None => {
                debug!(serial = %packet.serial_id, port = packet.port, "dropping packet for unknown serial");
            }
        }
    }

    fn announce(&self, packet: AddressedPacket) {
        match bincode::deserialize::<RobotAnnounce>(&packet.payload) {
            Ok(announce) => {
                let event = RobotEvent {
                    serial_id: packet.serial_id,
                    firmware_version: announce.firmware_version,
                    rpc_version: announce.rpc_version,
                    interface_version: announce.interface_version,
                };
                info!(
                    serial = %event.serial_id,
                    firmware = %event.firmware_version,
                    rpc = %event.rpc_version,
                    interface = %event.interface_version,
                    "robot powered on"
                );
                let _ = self.events.send(Broadcast::RobotEvent(event));
            }
            Err(e) => debug!(serial = %packet.serial_id, error = %e, "dropping malformed robot event"),
        }
    }

    /// Close the underlying link; outstanding operations abort.
    pub(crate) async fn close(&self) {
        self.link.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use botlink_core::proto::RPC_VERSION;
    use botlink_framing::ReliableLink;

    struct TestRig {
        router: Router,
        events: broadcast::Receiver<Broadcast>,
        // Held so the peer half of the link stays up for the test.
        _peer: (botlink_framing::LinkSender, botlink_framing::LinkReceiver),
    }

    async fn test_router() -> TestRig {
        let (a, b) = tokio::io::duplex(4096);
        let (left, right) = tokio::join!(
            ReliableLink::connect(a, Duration::from_secs(1)),
            ReliableLink::connect(b, Duration::from_secs(1)),
        );
        let (link, _local_rx) = left.unwrap();
        let (events, events_rx) = broadcast::channel(16);
        TestRig {
            router: Router::new(link, 1, events),
            events: events_rx,
            _peer: right.unwrap(),
        }
    }

    fn announce_packet(serial: &str) -> Vec<u8> {
        let announce = RobotAnnounce {
            firmware_version: RPC_VERSION,
            rpc_version: RPC_VERSION,
            interface_version: RPC_VERSION,
        };
        AddressedPacket::new(
            serial.parse().unwrap(),
            CONTROL_CHANNEL,
            bincode::serialize(&announce).unwrap(),
        )
        .unwrap()
        .encode()
    }

    #[tokio::test]
    async fn routes_inbound_packets_to_registered_proxy() {
        let rig = test_router().await;
        let serial: SerialId = "ABCD".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        rig.router.register(serial, tx);

        let packet = AddressedPacket::new(serial, 3, b"frame".to_vec()).unwrap();
        rig.router.dispatch(&packet.encode());
        assert_eq!(rx.recv().await.unwrap(), packet);
    }

    #[tokio::test]
    async fn drops_packets_for_unknown_serials() {
        let rig = test_router().await;
        let packet = AddressedPacket::new("ZZZZ".parse().unwrap(), 3, vec![1]).unwrap();
        // Must not panic or create a route implicitly.
        rig.router.dispatch(&packet.encode());
    }

    #[tokio::test]
    async fn unregistered_proxy_no_longer_receives() {
        let rig = test_router().await;
        let serial: SerialId = "ABCD".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        rig.router.register(serial, tx);
        rig.router.unregister(serial);

        let packet = AddressedPacket::new(serial, 3, vec![1]).unwrap();
        rig.router.dispatch(&packet.encode());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn port_zero_traffic_becomes_robot_events() {
        let mut rig = test_router().await;
        rig.router.dispatch(&announce_packet("WXYZ"));

        match rig.events.recv().await.unwrap() {
            Broadcast::RobotEvent(event) => {
                assert_eq!(event.serial_id, "WXYZ".parse().unwrap());
                assert_eq!(event.firmware_version, RPC_VERSION);
            }
            other => panic!("expected robot event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_messages_are_dropped() {
        let rig = test_router().await;
        rig.router.dispatch(b"...");
        rig.router.dispatch(&[]);
    }
}
