//! Node-level error types

use thiserror::Error;

use crate::protocol;
use crate::transport::TransportError;

/// Errors surfaced by the public CMCP API
#[derive(Error, Debug)]
pub enum Error {
    /// An endpoint address or callback argument is unusable
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Short description of the rejected argument
        reason: &'static str,
    },

    /// `bind`/`connect` was called on a node whose endpoints are already open
    #[error("node already initialized")]
    AlreadyInitialized,

    /// The operation requires open endpoints
    #[error("node not initialized")]
    NotInitialized,

    /// The operation requires a running reception thread
    #[error("node not running")]
    NotRunning,

    /// The client is not connected to a server
    #[error("not connected")]
    NotConnected,

    /// Wire-format failure
    #[error(transparent)]
    Protocol(#[from] protocol::Error),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type alias for the public CMCP API
pub type Result<T> = std::result::Result<T, Error>;
