//! CMCP peers
//!
//! The node engine drives a background reception loop shared by both peer
//! classes; [`Server`] and [`Client`] layer the registration handshake and
//! liveness tracking on top of it.

mod client;
mod engine;
mod error;
mod server;
mod state;

pub use client::{Client, ClientCallbacks, ConnectionState};
pub use engine::{CONNECTION_TIMEOUT, HEARTBEAT_INTERVAL};
pub use error::{Error, Result};
pub use server::{MAX_PEERS, Server, ServerCallbacks};
