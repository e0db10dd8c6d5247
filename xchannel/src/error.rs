//! Error types for channel operations.

use thiserror::Error;

/// Errors produced by channel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying resource reached end-of-stream while more data was
    /// required. Read loops use this to terminate; the `_opt` read variants
    /// convert it into an absent value instead.
    #[error("end of input")]
    EndOfInput,

    /// The channel (or the main channel behind an atomic block) was aborted.
    /// Every in-flight and future operation on the channel fails with this.
    #[error("channel is closed")]
    Closed,

    /// A temporary channel handle created by `atomic` was used after its
    /// atomic block completed.
    #[error("temporary channel is no longer valid")]
    InvalidChannel,

    /// An out-of-range size or length was rejected before any I/O took place.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The transport reported a transferred byte count outside the requested
    /// range. This indicates a broken transport implementation and is never
    /// retried.
    #[error("transport returned {returned} bytes for a request of {requested}")]
    TransportViolation {
        /// Number of bytes the channel asked the transport to move.
        requested: usize,
        /// Number of bytes the transport claimed to have moved.
        returned: usize,
    },

    /// A `direct_access` callback left the channel cursor outside the
    /// buffer bounds.
    #[error("direct access callback left the channel cursor out of bounds")]
    DirectAccessViolation,

    /// The operation has no meaning for this channel, e.g. flushing a
    /// channel backed by a fixed in-memory buffer.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// An I/O error reported by the underlying resource.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A structured value failed to serialize or deserialize.
    #[error("value codec error: {0}")]
    Value(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true for the expected end-of-stream condition.
    pub fn is_end_of_input(&self) -> bool {
        matches!(self, Error::EndOfInput)
    }

    /// Returns true if the error was caused by channel closure.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}
