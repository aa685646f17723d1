//! CMCP message framing
//!
//! A message is a 6-byte header followed by the encoded parameter list. The
//! header carries topic id, sender id, and the command field, whose low bit
//! tags the message kind and whose remaining 15 bits carry the user command.

use super::{DataList, Error, MAX_COMMAND_ID, MESSAGE_HEADER_LEN, Result};

/// Message kind, carried in the low bit of the wire command field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// Internal control message (handshake, heartbeat, disconnect)
    Control = 0,
    /// Application data message
    Data = 1,
}

impl MessageKind {
    /// Derive the kind from a wire command field
    #[must_use]
    pub const fn from_wire(command_field: u16) -> Self {
        if command_field & 1 == 0 {
            Self::Control
        } else {
            Self::Data
        }
    }

    /// Kind tag bit
    #[must_use]
    pub const fn tag(self) -> u16 {
        self as u16
    }
}

/// CMCP message
///
/// The parameter list borrows its payload bytes: for a built message they
/// belong to the caller, for a parsed message they point into the receive
/// buffer, which must outlive the message.
#[derive(Debug, Clone)]
pub struct Message<'a> {
    kind: MessageKind,
    topic_id: u16,
    sender_id: u16,
    command_id: u16,
    parameters: DataList<'a>,
}

impl<'a> Message<'a> {
    /// Build a message for sending
    ///
    /// Fails if the command id does not fit the 15-bit wire field.
    pub fn build(
        kind: MessageKind,
        topic_id: u16,
        sender_id: u16,
        command_id: u16,
        parameters: DataList<'a>,
    ) -> Result<Self> {
        if command_id > MAX_COMMAND_ID {
            return Err(Error::CommandOutOfRange {
                command: command_id,
            });
        }
        Ok(Self {
            kind,
            topic_id,
            sender_id,
            command_id,
            parameters,
        })
    }

    /// Parse a message from a received datagram
    ///
    /// Requires at least the 6-byte header; exactly 6 bytes yields an empty
    /// parameter list. The parameter list borrows `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < MESSAGE_HEADER_LEN {
            return Err(Error::BufferTooSmall {
                needed: MESSAGE_HEADER_LEN,
                got: bytes.len(),
            });
        }

        let topic_id = u16::from_ne_bytes([bytes[0], bytes[1]]);
        let sender_id = u16::from_ne_bytes([bytes[2], bytes[3]]);
        let command_field = u16::from_ne_bytes([bytes[4], bytes[5]]);

        Ok(Self {
            kind: MessageKind::from_wire(command_field),
            topic_id,
            sender_id,
            command_id: command_field >> 1,
            parameters: DataList::parse(&bytes[MESSAGE_HEADER_LEN..]),
        })
    }

    /// Message kind
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Topic (receiver) id; doubles as the subscription filter key
    #[must_use]
    pub const fn topic_id(&self) -> u16 {
        self.topic_id
    }

    /// Sender id
    #[must_use]
    pub const fn sender_id(&self) -> u16 {
        self.sender_id
    }

    /// User-visible command id (15 bits)
    #[must_use]
    pub const fn command_id(&self) -> u16 {
        self.command_id
    }

    /// Parameter list
    #[must_use]
    pub const fn parameters(&self) -> &DataList<'a> {
        &self.parameters
    }

    /// Encoded length in bytes: header plus parameter records
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.parameters.encoded_len()
    }

    /// Encode the message into `buf`, which must be exactly `encoded_len()`
    /// bytes long
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        let needed = self.encoded_len();
        if buf.len() != needed {
            return Err(Error::BufferTooSmall {
                needed,
                got: buf.len(),
            });
        }

        let command_field = (self.command_id << 1) | self.kind.tag();
        buf[0..2].copy_from_slice(&self.topic_id.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.sender_id.to_ne_bytes());
        buf[4..6].copy_from_slice(&command_field.to_ne_bytes());
        self.parameters.encode_into(&mut buf[MESSAGE_HEADER_LEN..])
    }
}
