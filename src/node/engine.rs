//! Node engine shared by server and client peers.
//!
//! A node owns one publishing and one subscribing endpoint plus a single
//! reception thread. The thread emits heartbeats on a timer, runs the
//! owner's regular pass, and dispatches parsed messages to the owner's
//! message pass. All owner callbacks fire on the reception thread.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use super::error::{Error, Result};
use super::state::StateCell;
use crate::protocol::{
    CLIENT_BROADCAST_TOPIC_ID, DataList, Message, MessageKind, SERVER_BROADCAST_TOPIC_ID, command,
    is_broadcast_topic,
};
use crate::transport::{self, PubSocket, Role, SubSocket, TransportError};

/// Period of the heartbeat signal; also the bound on a single blocking
/// receive in the reception loop.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Silence span after which a peer is considered lost.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer class of a node. Servers bind their endpoints and carry even ids,
/// clients connect and carry odd ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeClass {
    /// Server peer
    Server,
    /// Client peer
    Client,
}

impl NodeClass {
    /// Broadcast topic every node of this class subscribes to.
    pub(crate) const fn broadcast_topic(self) -> u16 {
        match self {
            Self::Server => SERVER_BROADCAST_TOPIC_ID,
            Self::Client => CLIENT_BROADCAST_TOPIC_ID,
        }
    }

    /// Broadcast topic of the opposite class; heartbeats are published here.
    pub(crate) const fn peer_broadcast_topic(self) -> u16 {
        match self {
            Self::Server => CLIENT_BROADCAST_TOPIC_ID,
            Self::Client => SERVER_BROADCAST_TOPIC_ID,
        }
    }

    /// Heartbeat control command of this class.
    pub(crate) const fn heartbeat_command(self) -> u16 {
        match self {
            Self::Server => command::SERVER_HEARTBEAT,
            Self::Client => command::CLIENT_HEARTBEAT,
        }
    }

    /// Endpoint attachment role of this class.
    pub(crate) const fn endpoint_role(self) -> Role {
        match self {
            Self::Server => Role::Bind,
            Self::Client => Role::Connect,
        }
    }

    const fn id_parity(self) -> u16 {
        match self {
            Self::Server => 0,
            Self::Client => 1,
        }
    }
}

/// Node lifecycle states. Only the transitions listed on each variant are
/// legal; they are enforced through [`StateCell::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum NodeState {
    /// Endpoints not opened yet → `Initialized`
    Uninitialized = 0,
    /// Endpoints open, thread idle → `Starting`
    Initialized = 1,
    /// Thread spawned, not yet running → `Running` (set by the thread)
    Starting = 2,
    /// Reception loop active → `Stopping`
    Running = 3,
    /// Stop requested → `Initialized` (set by the exiting thread)
    Stopping = 4,
}

impl NodeState {
    pub(crate) const fn value(self) -> u32 {
        self as u32
    }
}

struct Endpoints {
    publish: Arc<dyn PubSocket>,
    subscribe: Arc<dyn SubSocket>,
}

/// Thread-shared part of a node.
pub(crate) struct NodeCore {
    class: NodeClass,
    id: AtomicU16,
    rng: Mutex<SmallRng>,
    pub(crate) state: StateCell,
    endpoints: OnceLock<Endpoints>,
}

impl NodeCore {
    fn new(class: NodeClass) -> Self {
        let mut rng = SmallRng::from_os_rng();
        let id = draw_id(class, &mut rng);
        Self {
            class,
            id: AtomicU16::new(id),
            rng: Mutex::new(rng),
            state: StateCell::new(NodeState::Uninitialized.value()),
            endpoints: OnceLock::new(),
        }
    }

    /// Current node id.
    pub(crate) fn id(&self) -> u16 {
        self.id.load(Ordering::Acquire)
    }

    /// Redraw the node id and move the own-id subscription over.
    ///
    /// Used after a server rejected the current id; the next handshake
    /// attempt must announce (and listen on) a fresh one.
    pub(crate) fn regenerate_id(&self) {
        let new_id = {
            let mut rng = self.rng.lock().expect("node rng mutex poisoned");
            draw_id(self.class, &mut rng)
        };
        let old_id = self.id.swap(new_id, Ordering::AcqRel);
        if let Some(endpoints) = self.endpoints.get() {
            let _ = endpoints.subscribe.unsubscribe(old_id.to_ne_bytes());
            let _ = endpoints.subscribe.subscribe(new_id.to_ne_bytes());
        }
        debug!(old_id, new_id, "regenerated node id");
    }

    /// Open and attach both endpoints, register the standing subscriptions,
    /// and transition to `Initialized`.
    ///
    /// On any failure the already-opened endpoints are dropped and the node
    /// stays `Uninitialized`.
    pub(crate) fn connect(&self, publish_addr: &str, subscribe_addr: &str) -> Result<()> {
        if publish_addr.is_empty() || subscribe_addr.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "empty endpoint address",
            });
        }
        if self.state.get() != NodeState::Uninitialized.value() {
            return Err(Error::AlreadyInitialized);
        }

        let role = self.class.endpoint_role();
        let publish = transport::open_pub(publish_addr, role)?;
        let subscribe = transport::open_sub(subscribe_addr, role)?;

        subscribe.set_recv_timeout(HEARTBEAT_INTERVAL)?;
        subscribe.subscribe(self.class.broadcast_topic().to_ne_bytes())?;
        subscribe.subscribe(self.id().to_ne_bytes())?;

        if self
            .endpoints
            .set(Endpoints { publish, subscribe })
            .is_err()
        {
            return Err(Error::AlreadyInitialized);
        }
        self.state.set(NodeState::Initialized.value());
        Ok(())
    }

    /// Start receiving datagrams published to `topic`.
    pub(crate) fn subscribe(&self, topic: u16) -> Result<()> {
        let endpoints = self.endpoints.get().ok_or(Error::NotInitialized)?;
        endpoints.subscribe.subscribe(topic.to_ne_bytes())?;
        Ok(())
    }

    /// Stop receiving datagrams published to `topic`.
    pub(crate) fn unsubscribe(&self, topic: u16) -> Result<()> {
        let endpoints = self.endpoints.get().ok_or(Error::NotInitialized)?;
        endpoints.subscribe.unsubscribe(topic.to_ne_bytes())?;
        Ok(())
    }

    /// Build a message, encode it into an exact-size transport buffer, and
    /// transfer the buffer to the publish endpoint.
    pub(crate) fn send(
        &self,
        kind: MessageKind,
        topic_id: u16,
        command_id: u16,
        parameters: &DataList<'_>,
    ) -> Result<()> {
        let endpoints = self.endpoints.get().ok_or(Error::NotInitialized)?;
        let message = Message::build(kind, topic_id, self.id(), command_id, parameters.clone())?;
        let mut buffer = endpoints.publish.alloc_msg(message.encoded_len());
        message.encode_into(buffer.as_mut_slice())?;
        endpoints.publish.send(buffer)?;
        Ok(())
    }
}

fn draw_id(class: NodeClass, rng: &mut SmallRng) -> u16 {
    loop {
        let candidate = match class {
            NodeClass::Server => rng.random::<u16>() << 1,
            NodeClass::Client => rng.random::<u16>() | 1,
        };
        debug_assert_eq!(candidate & 1, class.id_parity());
        if candidate != class.broadcast_topic() {
            return candidate;
        }
    }
}

/// Per-class message and regular passes, supplied by the server and client
/// layers. The dispatch object moves into the reception thread; it reaches
/// back into the node only through the `NodeCore` reference it is handed.
pub(crate) trait Dispatch: Send {
    /// Runs once per loop iteration, before the blocking receive.
    fn regular(&mut self, node: &NodeCore);

    /// Runs for every received, parsed message that passed the
    /// broadcast-sender filter.
    fn message(&mut self, node: &NodeCore, message: &Message<'_>);
}

/// A node: the thread-shared core plus the reception thread handle.
pub(crate) struct Node {
    core: Arc<NodeCore>,
    thread: Option<JoinHandle<()>>,
}

impl Node {
    pub(crate) fn new(class: NodeClass) -> Self {
        Self {
            core: Arc::new(NodeCore::new(class)),
            thread: None,
        }
    }

    /// Thread-shared core.
    pub(crate) fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    /// Current node id.
    pub(crate) fn id(&self) -> u16 {
        self.core.id()
    }

    /// Spawn the reception thread and block until it is running.
    pub(crate) fn start(&mut self, dispatch: Box<dyn Dispatch>) -> Result<()> {
        if !self
            .core
            .state
            .transition(NodeState::Initialized.value(), NodeState::Starting.value())
        {
            return match self.core.state.get() {
                value if value == NodeState::Uninitialized.value() => Err(Error::NotInitialized),
                _ => Err(Error::AlreadyInitialized),
            };
        }

        let core = Arc::clone(&self.core);
        let mut dispatch = dispatch;
        let handle = thread::Builder::new()
            .name("cmcp-reception".to_owned())
            .spawn(move || run(&core, dispatch.as_mut()))
            .expect("failed to spawn reception thread");
        self.thread = Some(handle);

        self.core
            .state
            .await_value(NodeState::Running.value(), None)
            .expect("unbounded await cannot time out");
        Ok(())
    }

    /// Request the reception thread to stop and join it.
    ///
    /// Post-condition: the node is back in the `Initialized` state.
    pub(crate) fn stop(&mut self) -> Result<()> {
        if !self
            .core
            .state
            .transition(NodeState::Running.value(), NodeState::Stopping.value())
        {
            return Err(Error::NotRunning);
        }
        let handle = self.thread.take().ok_or(Error::NotRunning)?;
        handle.join().expect("reception thread panicked");
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.core.state.get() == NodeState::Running.value() {
            let _ = self.stop();
        }
    }
}

/// Reception loop. Runs on the spawned thread until the state leaves
/// `Running`; transient receive and parse failures are swallowed.
fn run(core: &NodeCore, dispatch: &mut dyn Dispatch) {
    core.state.set(NodeState::Running.value());
    let endpoints = core
        .endpoints
        .get()
        .expect("endpoints are set before the thread starts");

    let mut next_heartbeat = Instant::now();
    while core.state.get() == NodeState::Running.value() {
        let now = Instant::now();
        if now >= next_heartbeat {
            let heartbeat = DataList::new();
            if let Err(error) = core.send(
                MessageKind::Control,
                core.class.peer_broadcast_topic(),
                core.class.heartbeat_command(),
                &heartbeat,
            ) {
                debug!(%error, "heartbeat send failed");
            }
            next_heartbeat = now + HEARTBEAT_INTERVAL;
        }

        dispatch.regular(core);

        let buffer = match endpoints.subscribe.recv() {
            Ok(buffer) => buffer,
            Err(TransportError::Timeout) => continue,
            Err(error) => {
                trace!(%error, "receive failed");
                continue;
            }
        };
        match Message::parse(buffer.as_slice()) {
            Ok(message) => {
                if is_broadcast_topic(message.sender_id()) {
                    trace!(
                        sender_id = message.sender_id(),
                        "dropping message claiming a broadcast sender"
                    );
                } else {
                    dispatch.message(core, &message);
                }
            }
            Err(error) => trace!(%error, "dropping unparseable datagram"),
        }
    }

    core.state.set(NodeState::Initialized.value());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ids_carry_class_parity_and_avoid_broadcast_topics() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..512 {
            let server_id = draw_id(NodeClass::Server, &mut rng);
            assert_eq!(server_id & 1, 0);
            assert_ne!(server_id, SERVER_BROADCAST_TOPIC_ID);

            let client_id = draw_id(NodeClass::Client, &mut rng);
            assert_eq!(client_id & 1, 1);
            assert_ne!(client_id, CLIENT_BROADCAST_TOPIC_ID);
        }
    }

    #[test]
    fn connect_rejects_second_call() {
        let node = Node::new(NodeClass::Server);
        node.core()
            .connect("inproc://engine-reconnect-pub", "inproc://engine-reconnect-sub")
            .unwrap();
        let err = node
            .core()
            .connect("inproc://engine-reconnect-pub2", "inproc://engine-reconnect-sub2")
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized));
    }

    #[test]
    fn connect_rejects_empty_address() {
        let node = Node::new(NodeClass::Client);
        let err = node.core().connect("", "inproc://engine-empty").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(node.core().state.get(), NodeState::Uninitialized.value());
    }

    #[test]
    fn start_requires_initialized_state() {
        struct Noop;
        impl Dispatch for Noop {
            fn regular(&mut self, _node: &NodeCore) {}
            fn message(&mut self, _node: &NodeCore, _message: &Message<'_>) {}
        }

        let mut node = Node::new(NodeClass::Server);
        let err = node.start(Box::new(Noop)).unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[test]
    fn start_stop_restores_initialized_state() {
        static REGULAR_CALLS: AtomicUsize = AtomicUsize::new(0);

        struct Counting;
        impl Dispatch for Counting {
            fn regular(&mut self, _node: &NodeCore) {
                REGULAR_CALLS.fetch_add(1, Ordering::Relaxed);
            }
            fn message(&mut self, _node: &NodeCore, _message: &Message<'_>) {}
        }

        let mut node = Node::new(NodeClass::Server);
        node.core()
            .connect("inproc://engine-lifecycle-pub", "inproc://engine-lifecycle-sub")
            .unwrap();
        node.start(Box::new(Counting)).unwrap();
        assert_eq!(node.core().state.get(), NodeState::Running.value());

        node.stop().unwrap();
        assert_eq!(node.core().state.get(), NodeState::Initialized.value());
        assert!(REGULAR_CALLS.load(Ordering::Relaxed) >= 1);

        let err = node.stop().unwrap_err();
        assert!(matches!(err, Error::NotRunning));
    }

    #[test]
    fn broadcast_senders_are_filtered_before_dispatch() {
        static MESSAGES: AtomicUsize = AtomicUsize::new(0);

        struct CountMessages;
        impl Dispatch for CountMessages {
            fn regular(&mut self, _node: &NodeCore) {}
            fn message(&mut self, _node: &NodeCore, _message: &Message<'_>) {
                MESSAGES.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut node = Node::new(NodeClass::Server);
        node.core()
            .connect("inproc://engine-filter-pub", "inproc://engine-filter-sub")
            .unwrap();
        node.start(Box::new(CountMessages)).unwrap();

        let publisher = transport::open_pub("inproc://engine-filter-sub", Role::Connect).unwrap();
        let publish = |message: &Message<'_>| {
            let mut buffer = publisher.alloc_msg(message.encoded_len());
            message.encode_into(buffer.as_mut_slice()).unwrap();
            publisher.send(buffer).unwrap();
        };

        // a message claiming a broadcast sender, addressed straight at the node
        let spoofed = Message::build(
            MessageKind::Data,
            node.id(),
            CLIENT_BROADCAST_TOPIC_ID,
            9,
            DataList::new(),
        )
        .unwrap();
        publish(&spoofed);

        // a legitimate message behind it, so delivery itself is proven
        let legit = Message::build(MessageKind::Data, node.id(), 11, 9, DataList::new()).unwrap();
        publish(&legit);

        let deadline = Instant::now() + HEARTBEAT_INTERVAL * 4;
        while MESSAGES.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        node.stop().unwrap();

        // the queue is FIFO: once the legitimate message arrived, the spoofed
        // one has already been seen and discarded
        assert_eq!(MESSAGES.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn send_requires_open_endpoints() {
        let node = Node::new(NodeClass::Client);
        let err = node
            .core()
            .send(MessageKind::Data, 5, 1, &DataList::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }
}
