use std::collections::HashMap;

use log::{debug, error, info, warn};

use super::{
    Advertisement, Attribute, ConnectionHandle, DiscoveryCursor, GattStack, GattTargets,
    NotificationRelay, StackError, StackEvent, Step, SubscribeRequest,
};
use crate::hex_dump;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub value_handle: u16,
    pub ccc_handle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting(ConnectionHandle),
    /// Connected without a discovery in flight or a subscription.
    Connected(ConnectionHandle),
    Discovering {
        conn: ConnectionHandle,
        cursor: DiscoveryCursor,
    },
    Subscribed {
        conn: ConnectionHandle,
        subscription: SubscriptionHandle,
    },
}

impl LinkState {
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match *self {
            LinkState::Idle | LinkState::Scanning => None,
            LinkState::Connecting(conn) | LinkState::Connected(conn) => Some(conn),
            LinkState::Discovering { conn, .. } | LinkState::Subscribed { conn, .. } => Some(conn),
        }
    }
}

/// Owns the single peer connection and everything hanging off it.
///
/// All stack events are funneled through [`CentralSession::handle`] from one
/// task, so the session never needs to lock its state.
pub struct CentralSession<S> {
    stack: S,
    peers: HashMap<String, String>,
    targets: GattTargets,
    relay: NotificationRelay,
    state: LinkState,
    peer: Option<String>,
}

impl<S: GattStack> CentralSession<S> {
    pub fn new(
        stack: S,
        peers: HashMap<String, String>,
        targets: GattTargets,
        relay: NotificationRelay,
    ) -> Self {
        CentralSession {
            stack,
            peers,
            targets,
            relay,
            state: LinkState::Idle,
            peer: None,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    pub fn start(&mut self) {
        if self.state != LinkState::Idle {
            warn!("central already started");
            return;
        }
        self.start_scan();
    }

    /// Retry scanning after a failed start, does nothing in any other state.
    pub fn resume(&mut self) {
        if self.state == LinkState::Idle {
            debug!("retrying scan start");
            self.start_scan();
        }
    }

    pub fn handle(&mut self, event: StackEvent) {
        match event {
            StackEvent::Advertisement(adv) => self.on_advertisement(adv),
            StackEvent::Connected { conn, status } => self.on_connected(conn, status),
            StackEvent::Disconnected { conn, reason } => self.on_disconnected(conn, &reason),
            StackEvent::Discovered { conn, attribute } => self.on_discovered(conn, attribute),
            StackEvent::Notification {
                conn,
                value_handle,
                data,
            } => self.on_notification(conn, value_handle, data),
        }
    }

    fn start_scan(&mut self) {
        match self.stack.start_scan() {
            Ok(()) => {
                info!("scanning successfully started");
                self.state = LinkState::Scanning;
            }
            Err(e) => {
                error!("scanning failed to start: {e}");
                self.state = LinkState::Idle;
            }
        }
    }

    fn on_advertisement(&mut self, adv: Advertisement) {
        if self.state != LinkState::Scanning {
            return;
        }
        let label = match self.peers.get(&adv.address) {
            Some(x) => x,
            None => return,
        };

        info!(
            "[DEVICE]: {} ({}), AD data len {}, RSSI {}",
            adv.address,
            label,
            adv.data.len(),
            adv.rssi
        );
        info!("[DATA]: {}", hex_dump(&adv.data));

        if let Err(e) = self.stack.stop_scan() {
            error!("stop LE scan failed: {e}");
        }

        match self.stack.connect(&adv.address) {
            Ok(conn) => {
                debug!("connecting to {} as {}", adv.address, conn);
                self.peer = Some(adv.address);
                self.state = LinkState::Connecting(conn);
            }
            Err(e) => {
                error!("create conn to {} failed: {e}", adv.address);
                self.start_scan();
            }
        }
    }

    fn on_connected(&mut self, conn: ConnectionHandle, status: Result<(), StackError>) {
        if self.state != LinkState::Connecting(conn) {
            debug!("ignoring connect result for untracked {conn}");
            return;
        }
        let peer = self.peer.clone().unwrap_or_default();

        if let Err(e) = status {
            error!("failed to connect to {peer}: {e}");
            self.release(conn);
            self.start_scan();
            return;
        }

        info!("connected: {peer}");
        self.state = LinkState::Connected(conn);
        self.issue_discover(conn, DiscoveryCursor::new());
    }

    fn on_disconnected(&mut self, conn: ConnectionHandle, reason: &str) {
        info!("disconnected: {conn} ({reason})");

        if self.state.connection() != Some(conn) {
            return;
        }

        self.release(conn);
        self.start_scan();
    }

    fn on_discovered(&mut self, conn: ConnectionHandle, attribute: Option<Attribute>) {
        let cursor = match self.state {
            LinkState::Discovering { conn: c, cursor } if c == conn => cursor,
            _ => {
                debug!("ignoring discovery result for {conn}");
                return;
            }
        };

        let attr = match attribute {
            Some(x) => x,
            None => {
                info!("discover complete");
                warn!(
                    "no attribute found during {:?} discovery, staying connected without subscription",
                    cursor.phase()
                );
                self.state = LinkState::Connected(conn);
                return;
            }
        };

        info!(
            "discovered attribute handle: {}, UUID: {:#06x}",
            attr.handle, attr.uuid
        );

        match cursor.advance(attr) {
            Step::Discover(next) => self.issue_discover(conn, next),
            Step::Subscribe(req) => self.issue_subscribe(conn, req),
            Step::Exhausted => {
                warn!("attribute handle range exhausted after {:?}", cursor.phase());
                self.state = LinkState::Connected(conn);
            }
        }
    }

    fn on_notification(&mut self, conn: ConnectionHandle, value_handle: u16, data: Option<Vec<u8>>) {
        match self.state {
            LinkState::Subscribed { conn: c, subscription }
                if c == conn && subscription.value_handle == value_handle => {}
            _ => {
                debug!("ignoring notification for handle {value_handle:#06x} on {conn}");
                return;
            }
        }

        let data = match data {
            Some(x) => x,
            None => {
                info!("[UNSUBSCRIBED]");
                self.state = LinkState::Connected(conn);
                return;
            }
        };

        match self.relay.forward(&data) {
            Ok(len) => debug!("queued {len} bytes for the uplink"),
            Err(e) => warn!("dropped notification: {e}"),
        }
    }

    fn issue_discover(&mut self, conn: ConnectionHandle, cursor: DiscoveryCursor) {
        let req = cursor.request(&self.targets);
        match self.stack.discover(conn, req) {
            Ok(()) => {
                self.state = LinkState::Discovering { conn, cursor };
            }
            Err(e) => {
                error!("discover failed during {:?}: {e}", cursor.phase());
                self.state = LinkState::Connected(conn);
            }
        }
    }

    fn issue_subscribe(&mut self, conn: ConnectionHandle, req: SubscribeRequest) {
        match self.stack.subscribe(conn, req) {
            Ok(()) | Err(StackError::AlreadySubscribed) => {
                info!("[SUBSCRIBED]");
                self.state = LinkState::Subscribed {
                    conn,
                    subscription: SubscriptionHandle {
                        value_handle: req.value_handle,
                        ccc_handle: req.ccc_handle,
                    },
                };
            }
            Err(e) => {
                error!("subscribe failed: {e}");
                self.state = LinkState::Connected(conn);
            }
        }
    }

    fn release(&mut self, conn: ConnectionHandle) {
        self.stack.release(conn);
        self.peer = None;
        self.state = LinkState::Idle;
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::*;
    use crate::central::{
        discovery::CCC_NOTIFY,
        mock::{Call, MockStack},
        DiscoverKind, DiscoverRequest, CCC_UUID,
    };

    const PEER: &str = "AB:2B:00:02:C7:9D (public)";

    fn session() -> (CentralSession<MockStack>, mpsc::Receiver<Vec<u8>>) {
        let (send, recv) = mpsc::channel(8);
        let mut peers = HashMap::new();
        peers.insert(PEER.to_string(), "scanner".to_string());
        let session = CentralSession::new(
            MockStack::new(),
            peers,
            GattTargets {
                service: 0xff00,
                characteristic: 0xff01,
            },
            NotificationRelay::new(send),
        );
        (session, recv)
    }

    fn advertisement(address: &str) -> StackEvent {
        StackEvent::Advertisement(Advertisement {
            address: address.to_string(),
            rssi: -60,
            data: vec![0x02, 0x01, 0x06],
        })
    }

    fn connected(conn: u32) -> StackEvent {
        StackEvent::Connected {
            conn: ConnectionHandle(conn),
            status: Ok(()),
        }
    }

    fn discovered(conn: u32, handle: u16, uuid: u16) -> StackEvent {
        StackEvent::Discovered {
            conn: ConnectionHandle(conn),
            attribute: Some(Attribute { handle, uuid }),
        }
    }

    fn disconnected(conn: u32) -> StackEvent {
        StackEvent::Disconnected {
            conn: ConnectionHandle(conn),
            reason: "remote user terminated".to_string(),
        }
    }

    /// Drive a fresh session up to a live subscription on conn#1.
    fn subscribed() -> (CentralSession<MockStack>, mpsc::Receiver<Vec<u8>>) {
        let (mut s, recv) = session();
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));
        s.handle(discovered(1, 0x0010, 0xff00));
        s.handle(discovered(1, 0x0011, 0xff01));
        s.handle(discovered(1, 0x0013, CCC_UUID));
        (s, recv)
    }

    #[test]
    fn matching_advertisement_connects() {
        let (mut s, _recv) = session();
        s.start();
        assert_eq!(*s.state(), LinkState::Scanning);

        s.handle(advertisement("11:22:33:44:55:66 (random)"));
        assert_eq!(*s.state(), LinkState::Scanning);
        assert_eq!(s.stack().calls, vec![Call::StartScan]);

        s.handle(advertisement(PEER));
        assert_eq!(
            s.stack().calls,
            vec![
                Call::StartScan,
                Call::StopScan,
                Call::Connect(PEER.to_string())
            ]
        );
        assert_eq!(*s.state(), LinkState::Connecting(ConnectionHandle(1)));

        // Late advertisements must not start a second connection.
        s.handle(advertisement(PEER));
        assert_eq!(s.stack().count(&Call::Connect(PEER.to_string())), 1);
    }

    #[test]
    fn stop_scan_failure_is_not_fatal() {
        let (mut s, _recv) = session();
        s.stack_mut().fail_stop_scan = true;
        s.start();
        s.handle(advertisement(PEER));
        assert_eq!(*s.state(), LinkState::Connecting(ConnectionHandle(1)));
    }

    #[test]
    fn connect_initiation_failure_rescans() {
        let (mut s, _recv) = session();
        s.stack_mut().fail_connect = true;
        s.start();
        s.handle(advertisement(PEER));
        assert_eq!(s.stack().count(&Call::StartScan), 2);
        assert_eq!(*s.state(), LinkState::Scanning);
    }

    #[test]
    fn connect_failure_releases_and_rescans() {
        let (mut s, _recv) = session();
        s.start();
        s.handle(advertisement(PEER));
        s.handle(StackEvent::Connected {
            conn: ConnectionHandle(1),
            status: Err(StackError::Other("timeout".to_string())),
        });
        assert!(s.stack().calls.ends_with(&[
            Call::Release(ConnectionHandle(1)),
            Call::StartScan
        ]));
        assert_eq!(*s.state(), LinkState::Scanning);
    }

    #[test]
    fn discovery_is_sequential() {
        let (mut s, _recv) = session();
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));

        assert_eq!(
            s.stack().last_discover(),
            Some(DiscoverRequest {
                kind: DiscoverKind::Primary,
                uuid: 0xff00,
                start_handle: 0x0001,
                end_handle: 0xffff,
            })
        );

        s.handle(discovered(1, 0x0010, 0xff00));
        let req = s.stack().last_discover().unwrap();
        assert_eq!(req.kind, DiscoverKind::Characteristic);
        assert_eq!(req.uuid, 0xff01);
        assert_eq!(req.start_handle, 0x0011);

        s.handle(discovered(1, 0x0011, 0xff01));
        let req = s.stack().last_discover().unwrap();
        assert_eq!(req.kind, DiscoverKind::Descriptor);
        assert_eq!(req.uuid, CCC_UUID);
        assert_eq!(req.start_handle, 0x0013);
        assert!(!s
            .stack()
            .calls
            .iter()
            .any(|x| matches!(x, Call::Subscribe(..))));

        s.handle(discovered(1, 0x0013, CCC_UUID));
        assert_eq!(
            s.stack().calls.last(),
            Some(&Call::Subscribe(
                ConnectionHandle(1),
                SubscribeRequest {
                    value_handle: 0x0012,
                    ccc_handle: 0x0013,
                    value: CCC_NOTIFY,
                }
            ))
        );
        assert_eq!(
            *s.state(),
            LinkState::Subscribed {
                conn: ConnectionHandle(1),
                subscription: SubscriptionHandle {
                    value_handle: 0x0012,
                    ccc_handle: 0x0013,
                }
            }
        );
    }

    #[test]
    fn discovery_results_for_other_connections_are_ignored() {
        let (mut s, _recv) = session();
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));
        let before = s.stack().calls.len();

        s.handle(discovered(7, 0x0010, 0xff00));
        assert_eq!(s.stack().calls.len(), before);
    }

    #[test]
    fn failed_discover_leaves_connection_degraded() {
        let (mut s, _recv) = session();
        s.stack_mut().fail_discover = true;
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));
        assert_eq!(*s.state(), LinkState::Connected(ConnectionHandle(1)));
        assert_eq!(s.stack().count(&Call::StartScan), 1);
    }

    #[test]
    fn missing_attribute_ends_walk() {
        let (mut s, _recv) = session();
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));
        s.handle(StackEvent::Discovered {
            conn: ConnectionHandle(1),
            attribute: None,
        });
        assert_eq!(*s.state(), LinkState::Connected(ConnectionHandle(1)));

        // A late result after completion does not restart the walk.
        let before = s.stack().calls.len();
        s.handle(discovered(1, 0x0010, 0xff00));
        assert_eq!(s.stack().calls.len(), before);
    }

    #[test]
    fn already_subscribed_counts_as_success() {
        let (mut s, _recv) = session();
        s.stack_mut().already_subscribed = true;
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));
        s.handle(discovered(1, 0x0010, 0xff00));
        s.handle(discovered(1, 0x0011, 0xff01));
        s.handle(discovered(1, 0x0013, CCC_UUID));
        assert!(matches!(*s.state(), LinkState::Subscribed { .. }));
    }

    #[test]
    fn subscribe_failure_is_not_retried() {
        let (mut s, _recv) = session();
        s.stack_mut().fail_subscribe = true;
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));
        s.handle(discovered(1, 0x0010, 0xff00));
        s.handle(discovered(1, 0x0011, 0xff01));
        s.handle(discovered(1, 0x0013, CCC_UUID));
        assert_eq!(*s.state(), LinkState::Connected(ConnectionHandle(1)));
        assert_eq!(
            s.stack()
                .calls
                .iter()
                .filter(|x| matches!(x, Call::Subscribe(..)))
                .count(),
            1
        );
    }

    #[test]
    fn notification_is_forwarded() {
        let (mut s, mut recv) = subscribed();
        let raw: Vec<u8> = vec![0xa0, 0xa1, b'1', b'2', b'3', b'4', b'5', b'6', 0xb0, 0xb1];
        s.handle(StackEvent::Notification {
            conn: ConnectionHandle(1),
            value_handle: 0x0012,
            data: Some(raw.clone()),
        });
        assert_eq!(recv.try_recv().unwrap(), raw[2..8].to_vec());
    }

    #[test]
    fn oversized_notification_is_dropped() {
        let (mut s, mut recv) = subscribed();
        s.handle(StackEvent::Notification {
            conn: ConnectionHandle(1),
            value_handle: 0x0012,
            data: Some(vec![0x30; 257]),
        });
        assert!(recv.try_recv().is_err());
        assert!(matches!(*s.state(), LinkState::Subscribed { .. }));
    }

    #[test]
    fn unsubscribe_signal_clears_subscription() {
        let (mut s, mut recv) = subscribed();
        s.handle(StackEvent::Notification {
            conn: ConnectionHandle(1),
            value_handle: 0x0012,
            data: None,
        });
        assert_eq!(*s.state(), LinkState::Connected(ConnectionHandle(1)));

        s.handle(StackEvent::Notification {
            conn: ConnectionHandle(1),
            value_handle: 0x0012,
            data: Some(vec![0, 0, b'9', 0, 0]),
        });
        assert!(recv.try_recv().is_err());
    }

    #[test]
    fn disconnect_rescans_exactly_once() {
        let (mut s, _recv) = subscribed();
        assert_eq!(s.stack().count(&Call::StartScan), 1);

        s.handle(disconnected(1));
        assert_eq!(s.stack().count(&Call::Release(ConnectionHandle(1))), 1);
        assert_eq!(s.stack().count(&Call::StartScan), 2);
        assert_eq!(*s.state(), LinkState::Scanning);

        // Duplicate disconnects for a handle no longer tracked.
        s.handle(disconnected(1));
        assert_eq!(s.stack().count(&Call::StartScan), 2);

        // The session reconnects on the next advertisement.
        s.handle(advertisement(PEER));
        assert_eq!(*s.state(), LinkState::Connecting(ConnectionHandle(2)));
    }

    #[test]
    fn disconnect_during_discovery_rescans() {
        let (mut s, _recv) = session();
        s.start();
        s.handle(advertisement(PEER));
        s.handle(connected(1));
        s.handle(discovered(1, 0x0010, 0xff00));
        s.handle(disconnected(1));
        assert_eq!(*s.state(), LinkState::Scanning);
        assert_eq!(s.stack().count(&Call::StartScan), 2);

        // The stale cursor is gone.
        s.handle(discovered(1, 0x0011, 0xff01));
        assert_eq!(*s.state(), LinkState::Scanning);
    }

    #[test]
    fn disconnect_while_connecting_rescans_once() {
        let (mut s, _recv) = session();
        s.start();
        s.handle(advertisement(PEER));
        assert_eq!(*s.state(), LinkState::Connecting(ConnectionHandle(1)));

        s.handle(disconnected(1));
        assert_eq!(s.stack().count(&Call::Release(ConnectionHandle(1))), 1);
        assert_eq!(s.stack().count(&Call::StartScan), 2);
        assert_eq!(*s.state(), LinkState::Scanning);

        // A late connect completion for the released handle changes nothing.
        s.handle(connected(1));
        assert_eq!(*s.state(), LinkState::Scanning);
        assert_eq!(s.stack().count(&Call::StartScan), 2);
        assert_eq!(s.stack().count(&Call::Release(ConnectionHandle(1))), 1);
    }

    #[test]
    fn untracked_disconnect_is_ignored() {
        let (mut s, _recv) = subscribed();
        s.handle(disconnected(9));
        assert!(matches!(*s.state(), LinkState::Subscribed { .. }));
        assert_eq!(s.stack().count(&Call::StartScan), 1);
    }

    #[test]
    fn failed_scan_start_is_resumed() {
        let (mut s, _recv) = session();
        s.stack_mut().fail_start_scan = true;
        s.start();
        assert_eq!(*s.state(), LinkState::Idle);

        s.stack_mut().fail_start_scan = false;
        s.resume();
        assert_eq!(*s.state(), LinkState::Scanning);

        s.resume();
        assert_eq!(s.stack().count(&Call::StartScan), 2);
    }
}
