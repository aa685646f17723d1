//! Server peer: client registry and announcement handshake responder.

use std::time::Instant;

use tracing::debug;

use super::engine::{CONNECTION_TIMEOUT, Dispatch, Node, NodeClass, NodeCore, NodeState};
use super::error::{Error, Result};
use crate::protocol::{DataList, Message, MessageKind, SERVER_BROADCAST_TOPIC_ID, command};

/// Maximum number of clients a server registers at once.
pub const MAX_PEERS: usize = 64;

/// Application callbacks of a server.
///
/// All methods run on the server's reception thread. Calling `send`-family
/// operations from a callback is safe; lifecycle operations (`bind`, drop)
/// are not supported from callbacks.
pub trait ServerCallbacks: Send {
    /// Decide whether to accept an announcing client. Default: accept.
    fn on_announcement(&mut self, client_id: u16) -> bool {
        let _ = client_id;
        true
    }

    /// A client left the registry (explicit disconnect or timeout).
    fn on_disconnect(&mut self, client_id: u16) {
        let _ = client_id;
    }

    /// Application data arrived from a registered client.
    fn on_message(&mut self, client_id: u16, command_id: u16, parameters: &DataList<'_>) {
        let _ = (client_id, command_id, parameters);
    }
}

struct NoCallbacks;

impl ServerCallbacks for NoCallbacks {}

/// CMCP server peer.
///
/// A server binds one publishing and one subscribing endpoint, announces
/// itself with periodic heartbeats, registers announcing clients after the
/// nonce handshake, and drops clients that stay silent past the connection
/// timeout.
pub struct Server {
    node: Node,
    callbacks: Option<Box<dyn ServerCallbacks>>,
}

impl Server {
    /// Create an unbound server with a fresh even node id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: Node::new(NodeClass::Server),
            callbacks: None,
        }
    }

    /// Install application callbacks. Fails once the server is bound.
    pub fn set_callbacks(&mut self, callbacks: impl ServerCallbacks + 'static) -> Result<()> {
        if self.node.core().state.get() != NodeState::Uninitialized.value() {
            return Err(Error::AlreadyInitialized);
        }
        self.callbacks = Some(Box::new(callbacks));
        Ok(())
    }

    /// Bind both endpoints and start the reception thread.
    pub fn bind(&mut self, publish_addr: &str, subscribe_addr: &str) -> Result<()> {
        self.node.core().connect(publish_addr, subscribe_addr)?;
        let dispatch = ServerDispatch {
            registry: Vec::new(),
            callbacks: self
                .callbacks
                .take()
                .unwrap_or_else(|| Box::new(NoCallbacks)),
        };
        self.node.start(Box::new(dispatch))
    }

    /// Publish an application data message to one client.
    pub fn send(&self, client_id: u16, command_id: u16, parameters: &DataList<'_>) -> Result<()> {
        self.node
            .core()
            .send(MessageKind::Data, client_id, command_id, parameters)
    }

    /// This server's node id (always even).
    #[must_use]
    pub fn id(&self) -> u16 {
        self.node.id()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientRecord {
    id: u16,
    next_timeout: Instant,
}

struct ServerDispatch {
    registry: Vec<ClientRecord>,
    callbacks: Box<dyn ServerCallbacks>,
}

impl ServerDispatch {
    fn position(&self, client_id: u16) -> Option<usize> {
        self.registry.iter().position(|record| record.id == client_id)
    }

    fn register(&mut self, node: &NodeCore, client_id: u16, nonce: &[u8]) {
        let accept = self.position(client_id).is_none()
            && self.registry.len() < MAX_PEERS
            && self.callbacks.on_announcement(client_id);

        if accept {
            self.registry.push(ClientRecord {
                id: client_id,
                next_timeout: Instant::now() + CONNECTION_TIMEOUT,
            });
            if let Err(error) = node.subscribe(client_id) {
                debug!(client_id, %error, "subscribing to client topic failed");
            }
            debug!(client_id, "registered client");
        } else {
            debug!(client_id, "rejected client announcement");
        }

        // the answer always echoes the announcement nonce so the client can
        // correlate it with its pending attempt
        let mut parameters = DataList::new();
        parameters
            .add(command::PARAMETER_NONCE, nonce)
            .expect("fresh list accepts one parameter");
        let answer = if accept {
            command::SERVER_ACK_CLIENT
        } else {
            command::SERVER_NACK_CLIENT
        };
        if let Err(error) = node.send(MessageKind::Control, client_id, answer, &parameters) {
            debug!(client_id, %error, "handshake answer send failed");
        }
    }

    fn deregister(&mut self, node: &NodeCore, client_id: u16) {
        let Some(index) = self.position(client_id) else {
            return;
        };
        self.registry.swap_remove(index);
        if let Err(error) = node.unsubscribe(client_id) {
            debug!(client_id, %error, "unsubscribing client topic failed");
        }
        debug!(client_id, "deregistered client");
        self.callbacks.on_disconnect(client_id);
    }
}

impl Dispatch for ServerDispatch {
    fn regular(&mut self, node: &NodeCore) {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .registry
            .iter()
            .filter(|record| now >= record.next_timeout)
            .map(|record| record.id)
            .collect();
        for client_id in expired {
            debug!(client_id, "client connection timed out");
            self.deregister(node, client_id);
        }
    }

    fn message(&mut self, node: &NodeCore, message: &Message<'_>) {
        let sender_id = message.sender_id();
        if sender_id & 1 == 0 {
            // server-to-server traffic is out of scope
            return;
        }

        // any message from a registered client counts as liveness
        if let Some(index) = self.position(sender_id) {
            self.registry[index].next_timeout = Instant::now() + CONNECTION_TIMEOUT;
        }

        let topic_id = message.topic_id();
        match message.kind() {
            MessageKind::Control => {
                if topic_id != SERVER_BROADCAST_TOPIC_ID && topic_id != node.id() {
                    return;
                }
                match message.command_id() {
                    command::CLIENT_ANNOUNCE => {
                        if let Ok(nonce) = message
                            .parameters()
                            .find(command::PARAMETER_NONCE, command::NONCE_LEN)
                        {
                            self.register(node, sender_id, nonce);
                        }
                    }
                    command::CLIENT_DISCONNECT => self.deregister(node, sender_id),
                    // heartbeats carry no payload; the refresh above is all
                    _ => {}
                }
            }
            MessageKind::Data => {
                if topic_id != SERVER_BROADCAST_TOPIC_ID && topic_id & 1 == 0 {
                    return;
                }
                if self.position(sender_id).is_none() {
                    return;
                }
                self.callbacks
                    .on_message(sender_id, message.command_id(), message.parameters());
            }
        }
    }
}
