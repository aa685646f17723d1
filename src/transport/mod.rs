//! CMCP transport contract
//!
//! A node owns one publishing endpoint and one subscribing endpoint. The
//! subscribe side filters datagrams by a two-byte prefix, which by wire
//! layout is exactly the encoded topic id. Buffers are zero-copy leases:
//! `send` transfers ownership to the endpoint, dropping a received buffer
//! releases it.

mod buffer;
mod error;
mod inproc;

use std::sync::Arc;
use std::time::Duration;

pub use buffer::{Buffer, BufferPool};
pub use error::{Result, TransportError};

/// How an endpoint attaches to its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Claim the address (server side); fails if already claimed.
    Bind,
    /// Attach to the address (client side); the binder may arrive later.
    Connect,
}

/// Publishing endpoint.
pub trait PubSocket: Send + Sync {
    /// Allocate a zero-copy send buffer of exactly `len` bytes.
    fn alloc_msg(&self, len: usize) -> Buffer;

    /// Publish a datagram, taking ownership of the buffer.
    ///
    /// Delivery is best-effort: subscribers with full queues miss the
    /// datagram and no failure is reported for absent subscribers.
    fn send(&self, buffer: Buffer) -> Result<()>;
}

/// Subscribing endpoint.
pub trait SubSocket: Send + Sync + std::fmt::Debug {
    /// Set the deadline for subsequent `recv` calls.
    fn set_recv_timeout(&self, timeout: Duration) -> Result<()>;

    /// Start receiving datagrams whose first two bytes equal `prefix`.
    /// Idempotent.
    fn subscribe(&self, prefix: [u8; 2]) -> Result<()>;

    /// Stop receiving datagrams whose first two bytes equal `prefix`.
    /// Idempotent.
    fn unsubscribe(&self, prefix: [u8; 2]) -> Result<()>;

    /// Block for the next matching datagram.
    ///
    /// Returns [`TransportError::Timeout`] once the receive deadline passes
    /// without a datagram.
    fn recv(&self) -> Result<Buffer>;
}

/// Open a publishing endpoint on `addr`.
pub fn open_pub(addr: &str, role: Role) -> Result<Arc<dyn PubSocket>> {
    match parse_addr(addr)? {
        ("inproc", name) => inproc::open_pub(name, role),
        (scheme, _) => Err(TransportError::UnsupportedScheme {
            scheme: scheme.to_owned(),
        }),
    }
}

/// Open a subscribing endpoint on `addr`.
pub fn open_sub(addr: &str, role: Role) -> Result<Arc<dyn SubSocket>> {
    match parse_addr(addr)? {
        ("inproc", name) => inproc::open_sub(name, role),
        (scheme, _) => Err(TransportError::UnsupportedScheme {
            scheme: scheme.to_owned(),
        }),
    }
}

fn parse_addr(addr: &str) -> Result<(&str, &str)> {
    let invalid = || TransportError::InvalidAddress {
        addr: addr.to_owned(),
    };
    let (scheme, name) = addr.split_once("://").ok_or_else(invalid)?;
    if scheme.is_empty() || name.is_empty() {
        return Err(invalid());
    }
    Ok((scheme, name))
}
