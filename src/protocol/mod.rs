//! CMCP wire format
//!
//! This module provides the message framing, the typed parameter list, and
//! the reserved control-command table for CMCP.

pub mod command;
mod datalist;
mod error;
mod message;

pub use datalist::DataList;
pub use error::{Error, Result};
pub use message::{Message, MessageKind};

/// Message header size in bytes: topic id, sender id, command field
pub const MESSAGE_HEADER_LEN: usize = 6;

/// Maximum user-visible command id (15 bits; the low wire bit is the kind tag)
pub const MAX_COMMAND_ID: u16 = 0x7FFF;

/// Maximum number of items per parameter list
pub const MAX_PARAMETERS: usize = 16;

/// Maximum total parameter payload per list (64 KiB)
pub const MAX_PARAMETER_PAYLOAD: usize = 64 * 1024;

/// Reserved topic id every server subscribes to (even, nonzero)
pub const SERVER_BROADCAST_TOPIC_ID: u16 = 0xFFFE;

/// Reserved topic id every client subscribes to (odd)
pub const CLIENT_BROADCAST_TOPIC_ID: u16 = 0xFFFF;

/// Check whether an id is one of the reserved class-broadcast topic ids.
#[must_use]
pub const fn is_broadcast_topic(id: u16) -> bool {
    id == SERVER_BROADCAST_TOPIC_ID || id == CLIENT_BROADCAST_TOPIC_ID
}
