//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Reserved flag bits set in the frame header
    #[error("reserved flag bits set: {0:#04x}")]
    Reserved(u8),

    /// Frame body does not match the length implied by the header
    #[error("frame body is {got} bytes, header implies {expected}")]
    BodyLength {
        /// Bytes actually present
        got: usize,
        /// Bytes implied by the header
        expected: usize,
    },

    /// Message without a type identifier
    #[error("empty message")]
    EmptyMessage,

    /// Message body has the wrong size for its type
    #[error("message {id:#04x} body is {got} bytes, expected {expected}")]
    MessageSize {
        /// Message type identifier
        id: u8,
        /// Bytes actually present
        got: usize,
        /// Bytes required by the message layout
        expected: usize,
    },

    /// Unknown MAC key destination
    #[error("unknown mac key destination {0}")]
    Destination(u8),
}
