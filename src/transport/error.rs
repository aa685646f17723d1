//! Transport error types

use thiserror::Error;

/// Errors produced by transport endpoints
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint address is empty or malformed
    #[error("invalid endpoint address: {addr:?}")]
    InvalidAddress {
        /// Offending address string
        addr: String,
    },

    /// Address scheme is not supported by this build
    #[error("unsupported transport scheme: {scheme:?}")]
    UnsupportedScheme {
        /// Offending scheme prefix
        scheme: String,
    },

    /// Another endpoint is already bound to this address
    #[error("address already bound: {addr:?}")]
    AddressInUse {
        /// Contested address string
        addr: String,
    },

    /// Receive deadline reached without a datagram
    #[error("receive timed out")]
    Timeout,

    /// Endpoint has been closed
    #[error("endpoint closed")]
    Closed,
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
