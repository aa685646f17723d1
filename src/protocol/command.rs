//! Reserved control commands and parameters
//!
//! Control commands drive the handshake and connection maintenance. Server
//! and client commands are separate numeric sequences; the receiver tells
//! them apart by the parity of the sender id.

/// Server heartbeat signal. No parameters.
pub const SERVER_HEARTBEAT: u16 = 0;

/// Acknowledge registration of a new client. Parameters: [`PARAMETER_NONCE`].
pub const SERVER_ACK_CLIENT: u16 = 1;

/// Reject registration of a new client. Parameters: [`PARAMETER_NONCE`].
pub const SERVER_NACK_CLIENT: u16 = 2;

/// Announce a client connection to a server. Parameters: [`PARAMETER_NONCE`].
pub const CLIENT_ANNOUNCE: u16 = 0;

/// Client heartbeat signal. No parameters.
pub const CLIENT_HEARTBEAT: u16 = 1;

/// Client disconnection notice. No parameters.
pub const CLIENT_DISCONNECT: u16 = 2;

/// Randomly generated nonce correlating an announcement with its ACK/NACK.
/// Type: `u64`, encoded in [`NONCE_LEN`] bytes.
pub const PARAMETER_NONCE: u16 = 0;

/// Encoded length of [`PARAMETER_NONCE`] in bytes
pub const NONCE_LEN: usize = 8;
