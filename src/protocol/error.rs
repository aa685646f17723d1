//! CMCP wire-format error types

use thiserror::Error;

/// CMCP wire-format errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A parameter with this id is already present in the list
    #[error("duplicate parameter id {id}")]
    DuplicateParameter {
        /// Offending parameter id
        id: u16,
    },

    /// The parameter list holds its maximum number of items
    #[error("parameter list full: {max} items")]
    TooManyParameters {
        /// Maximum number of items per list
        max: usize,
    },

    /// Adding the item would exceed the total payload budget
    #[error("parameter payload budget exceeded: {requested} bytes (max {max})")]
    PayloadBudgetExceeded {
        /// Total payload bytes after the attempted add
        requested: usize,
        /// Maximum total payload bytes per list
        max: usize,
    },

    /// A single parameter payload does not fit the 16-bit length field
    #[error("parameter {id} too long: {len} bytes (max {max})")]
    ParameterTooLong {
        /// Offending parameter id
        id: u16,
        /// Attempted payload length
        len: usize,
        /// Maximum encodable payload length
        max: usize,
    },

    /// Parameter lookup failed: id absent or stored length differs
    #[error("parameter {id} not found with length {expected_len}")]
    ParameterLookup {
        /// Requested parameter id
        id: u16,
        /// Length the caller asserted
        expected_len: usize,
    },

    /// Command id does not fit the 15-bit wire field
    #[error("command id {command:#x} out of range")]
    CommandOutOfRange {
        /// Offending command id
        command: u16,
    },

    /// Buffer too small
    #[error("buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        /// Needed size
        needed: usize,
        /// Actual size
        got: usize,
    },
}

/// Result type alias for wire-format operations
pub type Result<T> = std::result::Result<T, Error>;
