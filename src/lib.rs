//! CMCP (Client/Messaging Communication Protocol) - topic-filtered pub/sub
//! messaging with heartbeat discovery and a nonce-based registration handshake
//!
//! This library provides symmetric server and client peers on top of a
//! message-oriented pub/sub transport. Peers discover each other through
//! periodic heartbeats, register through a nonce handshake, exchange framed
//! command messages carrying typed parameter lists, and detect peer loss
//! through heartbeat timeouts.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cmcp::{Client, DataList, Server};
//!
//! // Bind a server
//! let mut server = Server::new();
//! server.bind("inproc://pub", "inproc://sub")?;
//!
//! // Connect a client; blocks until the handshake completes
//! let mut client = Client::new();
//! client.connect("inproc://sub", "inproc://pub")?;
//!
//! // Exchange a typed parameter
//! let mut params = DataList::new();
//! params.add(42, b"Hello\0")?;
//! client.send(100, &params)?;
//! # Ok::<(), cmcp::Error>(())
//! ```
//!
//! # Concurrency
//!
//! Each peer owns exactly one background reception thread. All application
//! callbacks fire on that thread; `send`-family calls are safe from
//! callbacks, lifecycle calls are not.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod node;
pub mod protocol;
pub mod transport;

pub use node::{
    CONNECTION_TIMEOUT, Client, ClientCallbacks, ConnectionState, Error, HEARTBEAT_INTERVAL,
    MAX_PEERS, Result, Server, ServerCallbacks,
};
pub use protocol::{DataList, Message, MessageKind};

/// CMCP protocol version
pub const VERSION: &str = "1.0.0";
