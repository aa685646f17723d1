//! Client peer: server discovery, announcement handshake, liveness tracking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use super::engine::{CONNECTION_TIMEOUT, Dispatch, Node, NodeClass, NodeCore, NodeState};
use super::error::{Error, Result};
use super::state::StateCell;
use crate::protocol::{CLIENT_BROADCAST_TOPIC_ID, DataList, Message, MessageKind, command};

/// Connection states of a client, driving the announcement handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectionState {
    /// No server adopted; heartbeats are ignored
    Disconnected = 0,
    /// `connect` in progress, waiting for a server heartbeat
    TryingToConnect = 1,
    /// Server adopted and announcement sent, waiting for ACK/NACK
    HeartbeatReceived = 2,
    /// Registration acknowledged by the server
    Connected = 3,
}

impl ConnectionState {
    pub(crate) const fn value(self) -> u32 {
        self as u32
    }

    fn from_value(value: u32) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::TryingToConnect,
            2 => Self::HeartbeatReceived,
            3 => Self::Connected,
            _ => unreachable!("connection state cell holds only known values"),
        }
    }
}

/// Application callbacks of a client.
///
/// All methods run on the client's reception thread. Calling `send`-family
/// operations from a callback is safe; lifecycle operations (`connect`,
/// drop) are not supported from callbacks.
pub trait ClientCallbacks: Send {
    /// Application data arrived from the connected server.
    fn on_message(&mut self, command_id: u16, parameters: &DataList<'_>) {
        let _ = (command_id, parameters);
    }
}

struct NoCallbacks;

impl ClientCallbacks for NoCallbacks {}

/// State shared between the owner handle and the reception-side dispatch.
struct ClientShared {
    connection: StateCell,
    /// Adopted server id; the client-broadcast topic id marks "none" (it is
    /// odd and therefore never a server id).
    server_id: AtomicU16,
    /// Nonce of the announcement in flight.
    nonce: AtomicU64,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            connection: StateCell::new(ConnectionState::Disconnected.value()),
            server_id: AtomicU16::new(CLIENT_BROADCAST_TOPIC_ID),
            nonce: AtomicU64::new(0),
        }
    }

    fn server_id(&self) -> Option<u16> {
        match self.server_id.load(Ordering::Acquire) {
            CLIENT_BROADCAST_TOPIC_ID => None,
            id => Some(id),
        }
    }
}

/// CMCP client peer.
///
/// A client connects its endpoints to a server's addresses, adopts the
/// first server heartbeat it observes, registers through the nonce
/// handshake, and considers the server lost when its heartbeats stay away
/// past the connection timeout.
pub struct Client {
    node: Node,
    shared: Arc<ClientShared>,
    callbacks: Option<Box<dyn ClientCallbacks>>,
}

impl Client {
    /// Create an unconnected client with a fresh odd node id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: Node::new(NodeClass::Client),
            shared: Arc::new(ClientShared::new()),
            callbacks: None,
        }
    }

    /// Install application callbacks. Fails once the client is connected.
    pub fn set_callbacks(&mut self, callbacks: impl ClientCallbacks + 'static) -> Result<()> {
        if self.node.core().state.get() != NodeState::Uninitialized.value() {
            return Err(Error::AlreadyInitialized);
        }
        self.callbacks = Some(Box::new(callbacks));
        Ok(())
    }

    /// Connect to a server and block until the handshake completes.
    ///
    /// The first call opens both endpoints and starts the reception thread.
    /// Later calls (after a handshake failure or a lost connection) skip
    /// endpoint setup and only re-arm the handshake. Fails with
    /// [`Error::NotConnected`] when no server acknowledges the registration
    /// within the connection timeout.
    pub fn connect(&mut self, publish_addr: &str, subscribe_addr: &str) -> Result<()> {
        if self.node.core().state.get() == NodeState::Uninitialized.value() {
            self.node.core().connect(publish_addr, subscribe_addr)?;
            let dispatch = ClientDispatch {
                shared: Arc::clone(&self.shared),
                callbacks: self
                    .callbacks
                    .take()
                    .unwrap_or_else(|| Box::new(NoCallbacks)),
                next_connection_timeout: Instant::now() + CONNECTION_TIMEOUT,
            };
            self.node.start(Box::new(dispatch))?;
        }
        self.establish_connection()
    }

    fn establish_connection(&self) -> Result<()> {
        let deadline = Instant::now() + CONNECTION_TIMEOUT;
        // gate the message pass: only now may a server heartbeat be adopted
        self.shared.connection.transition(
            ConnectionState::Disconnected.value(),
            ConnectionState::TryingToConnect.value(),
        );
        self.shared
            .connection
            .await_value(ConnectionState::Connected.value(), Some(deadline))
            .map_err(|_| Error::NotConnected)
    }

    /// Publish an application data message to the connected server.
    pub fn send(&self, command_id: u16, parameters: &DataList<'_>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.node
            .core()
            .send(MessageKind::Data, self.node.id(), command_id, parameters)
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_value(self.shared.connection.get())
    }

    /// Whether the handshake completed and the server is still alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// This client's node id (always odd).
    #[must_use]
    pub fn id(&self) -> u16 {
        self.node.id()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.is_connected() {
            if let Some(server_id) = self.shared.server_id() {
                let goodbye = DataList::new();
                if let Err(error) = self.node.core().send(
                    MessageKind::Control,
                    server_id,
                    command::CLIENT_DISCONNECT,
                    &goodbye,
                ) {
                    debug!(%error, "disconnect notice send failed");
                }
            }
        }
        // dropping the node stops and joins the reception thread
    }
}

struct ClientDispatch {
    shared: Arc<ClientShared>,
    callbacks: Box<dyn ClientCallbacks>,
    next_connection_timeout: Instant,
}

impl ClientDispatch {
    fn send_announcement(&mut self, node: &NodeCore, server_id: u16) {
        let nonce = fresh_nonce();
        self.shared.nonce.store(nonce, Ordering::Release);

        let nonce_bytes = nonce.to_ne_bytes();
        let mut parameters = DataList::new();
        parameters
            .add(command::PARAMETER_NONCE, &nonce_bytes)
            .expect("fresh list accepts one parameter");
        if let Err(error) = node.send(
            MessageKind::Control,
            server_id,
            command::CLIENT_ANNOUNCE,
            &parameters,
        ) {
            debug!(server_id, %error, "announcement send failed");
        }
    }

    fn nonce_matches(&self, message: &Message<'_>) -> bool {
        let Ok(bytes) = message
            .parameters()
            .find(command::PARAMETER_NONCE, command::NONCE_LEN)
        else {
            return false;
        };
        let received = u64::from_ne_bytes(bytes.try_into().expect("length asserted by find"));
        received == self.shared.nonce.load(Ordering::Acquire)
    }
}

impl Dispatch for ClientDispatch {
    fn regular(&mut self, _node: &NodeCore) {
        let connected = self.shared.connection.get() == ConnectionState::Connected.value();
        if connected && Instant::now() >= self.next_connection_timeout {
            debug!("server heartbeats stopped; connection lost");
            self.shared.connection.transition(
                ConnectionState::Connected.value(),
                ConnectionState::Disconnected.value(),
            );
        }
    }

    fn message(&mut self, node: &NodeCore, message: &Message<'_>) {
        let sender_id = message.sender_id();
        if sender_id & 1 == 1 {
            // only servers are listened to
            return;
        }

        let state = ConnectionState::from_value(self.shared.connection.get());
        let adopted = self.shared.server_id();

        if state == ConnectionState::Connected && adopted == Some(sender_id) {
            self.next_connection_timeout = Instant::now() + CONNECTION_TIMEOUT;
        }

        match message.kind() {
            MessageKind::Control => match (state, message.command_id()) {
                (ConnectionState::TryingToConnect, command::SERVER_HEARTBEAT) => {
                    self.shared.server_id.store(sender_id, Ordering::Release);
                    self.shared
                        .connection
                        .set(ConnectionState::HeartbeatReceived.value());
                    debug!(server_id = sender_id, "adopted server, announcing");
                    self.send_announcement(node, sender_id);
                }
                (ConnectionState::HeartbeatReceived, command::SERVER_ACK_CLIENT)
                    if adopted == Some(sender_id) && self.nonce_matches(message) =>
                {
                    self.next_connection_timeout = Instant::now() + CONNECTION_TIMEOUT;
                    self.shared
                        .connection
                        .set(ConnectionState::Connected.value());
                    debug!(server_id = sender_id, "registration acknowledged");
                }
                (ConnectionState::HeartbeatReceived, command::SERVER_NACK_CLIENT)
                    if adopted == Some(sender_id) && self.nonce_matches(message) =>
                {
                    self.shared
                        .connection
                        .set(ConnectionState::Disconnected.value());
                    // the server rejected this id; retries must announce a
                    // fresh one
                    node.regenerate_id();
                    debug!(server_id = sender_id, "registration rejected");
                }
                _ => {}
            },
            MessageKind::Data => {
                if message.topic_id() == node.id() {
                    self.callbacks
                        .on_message(message.command_id(), message.parameters());
                }
            }
        }
    }
}

fn fresh_nonce() -> u64 {
    let uuid = Uuid::new_v4();
    let bytes = uuid.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn connected_node(tag: &str) -> Node {
        let node = Node::new(NodeClass::Client);
        node.core()
            .connect(
                &format!("inproc://client-test-{tag}-pub"),
                &format!("inproc://client-test-{tag}-sub"),
            )
            .unwrap();
        node
    }

    fn dispatch_for() -> (ClientDispatch, Arc<ClientShared>) {
        let shared = Arc::new(ClientShared::new());
        let dispatch = ClientDispatch {
            shared: Arc::clone(&shared),
            callbacks: Box::new(NoCallbacks),
            next_connection_timeout: Instant::now() + CONNECTION_TIMEOUT,
        };
        (dispatch, shared)
    }

    fn control(topic: u16, sender: u16, command_id: u16, parameters: DataList<'_>) -> Vec<u8> {
        let message =
            Message::build(MessageKind::Control, topic, sender, command_id, parameters).unwrap();
        let mut buf = vec![0u8; message.encoded_len()];
        message.encode_into(&mut buf).unwrap();
        buf
    }

    fn feed(dispatch: &mut ClientDispatch, node: &NodeCore, datagram: &[u8]) {
        let message = Message::parse(datagram).unwrap();
        dispatch.message(node, &message);
    }

    #[test]
    fn heartbeat_is_ignored_unless_trying_to_connect() {
        let node = connected_node("idle-heartbeat");
        let (mut dispatch, shared) = dispatch_for();

        let datagram = control(
            CLIENT_BROADCAST_TOPIC_ID,
            6,
            command::SERVER_HEARTBEAT,
            DataList::new(),
        );
        feed(&mut dispatch, node.core(), &datagram);

        assert_eq!(shared.connection.get(), ConnectionState::Disconnected.value());
        assert_eq!(shared.server_id(), None);
    }

    #[test]
    fn heartbeat_adopts_server_and_announces() {
        let node = connected_node("adopt");
        let (mut dispatch, shared) = dispatch_for();
        shared.connection.set(ConnectionState::TryingToConnect.value());

        let datagram = control(
            CLIENT_BROADCAST_TOPIC_ID,
            6,
            command::SERVER_HEARTBEAT,
            DataList::new(),
        );
        feed(&mut dispatch, node.core(), &datagram);

        assert_eq!(
            shared.connection.get(),
            ConnectionState::HeartbeatReceived.value()
        );
        assert_eq!(shared.server_id(), Some(6));
        assert_ne!(shared.nonce.load(Ordering::Acquire), 0);
    }

    #[test]
    fn ack_with_wrong_nonce_is_ignored() {
        let node = connected_node("wrong-nonce");
        let (mut dispatch, shared) = dispatch_for();
        shared.connection.set(ConnectionState::TryingToConnect.value());

        let heartbeat = control(
            CLIENT_BROADCAST_TOPIC_ID,
            6,
            command::SERVER_HEARTBEAT,
            DataList::new(),
        );
        feed(&mut dispatch, node.core(), &heartbeat);

        let wrong = (shared.nonce.load(Ordering::Acquire) ^ 1).to_ne_bytes();
        let mut parameters = DataList::new();
        parameters.add(command::PARAMETER_NONCE, &wrong).unwrap();
        let ack = control(node.id(), 6, command::SERVER_ACK_CLIENT, parameters);
        feed(&mut dispatch, node.core(), &ack);

        assert_eq!(
            shared.connection.get(),
            ConnectionState::HeartbeatReceived.value()
        );
    }

    #[test]
    fn matching_ack_connects() {
        let node = connected_node("ack");
        let (mut dispatch, shared) = dispatch_for();
        shared.connection.set(ConnectionState::TryingToConnect.value());

        let heartbeat = control(
            CLIENT_BROADCAST_TOPIC_ID,
            6,
            command::SERVER_HEARTBEAT,
            DataList::new(),
        );
        feed(&mut dispatch, node.core(), &heartbeat);

        let nonce = shared.nonce.load(Ordering::Acquire).to_ne_bytes();
        let mut parameters = DataList::new();
        parameters.add(command::PARAMETER_NONCE, &nonce).unwrap();
        let ack = control(node.id(), 6, command::SERVER_ACK_CLIENT, parameters);
        feed(&mut dispatch, node.core(), &ack);

        assert_eq!(shared.connection.get(), ConnectionState::Connected.value());
    }

    #[test]
    fn nack_disconnects_and_regenerates_id() {
        let node = connected_node("nack");
        let (mut dispatch, shared) = dispatch_for();
        shared.connection.set(ConnectionState::TryingToConnect.value());

        let heartbeat = control(
            CLIENT_BROADCAST_TOPIC_ID,
            6,
            command::SERVER_HEARTBEAT,
            DataList::new(),
        );
        feed(&mut dispatch, node.core(), &heartbeat);
        let old_id = node.id();

        let nonce = shared.nonce.load(Ordering::Acquire).to_ne_bytes();
        let mut parameters = DataList::new();
        parameters.add(command::PARAMETER_NONCE, &nonce).unwrap();
        let nack = control(old_id, 6, command::SERVER_NACK_CLIENT, parameters);
        feed(&mut dispatch, node.core(), &nack);

        assert_eq!(
            shared.connection.get(),
            ConnectionState::Disconnected.value()
        );
        assert_ne!(node.id(), old_id);
        assert_eq!(node.id() & 1, 1);
    }

    #[test]
    fn data_is_delivered_only_on_own_topic() {
        struct CountMessages(Arc<AtomicUsize>);
        impl ClientCallbacks for CountMessages {
            fn on_message(&mut self, _command_id: u16, _parameters: &DataList<'_>) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let node = connected_node("data-topic");
        let deliveries = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(ClientShared::new());
        let mut dispatch = ClientDispatch {
            shared,
            callbacks: Box::new(CountMessages(Arc::clone(&deliveries))),
            next_connection_timeout: Instant::now() + CONNECTION_TIMEOUT,
        };

        let own = Message::build(MessageKind::Data, node.id(), 6, 42, DataList::new()).unwrap();
        let mut buf = vec![0u8; own.encoded_len()];
        own.encode_into(&mut buf).unwrap();
        feed(&mut dispatch, node.core(), &buf);
        assert_eq!(deliveries.load(Ordering::Relaxed), 1);

        let foreign =
            Message::build(MessageKind::Data, node.id() ^ 2, 6, 42, DataList::new()).unwrap();
        let mut buf = vec![0u8; foreign.encoded_len()];
        foreign.encode_into(&mut buf).unwrap();
        feed(&mut dispatch, node.core(), &buf);
        assert_eq!(deliveries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn regular_pass_drops_silent_connection() {
        let node = connected_node("silent");
        let (mut dispatch, shared) = dispatch_for();
        shared.connection.set(ConnectionState::Connected.value());
        dispatch.next_connection_timeout = Instant::now();

        dispatch.regular(node.core());
        assert_eq!(
            shared.connection.get(),
            ConnectionState::Disconnected.value()
        );
    }
}
