//! Error types for the capture engine.
//!
//! Variants that can be produced on the write path carry no heap data, so
//! returning one from inside a signal handler never allocates.

use thiserror::Error;

/// Result type alias using the engine's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for capture engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Every handle slot of the registry is in use.
    #[error("no free data handle slots")]
    NoHandleSlots,

    /// Stream name is not in the stream catalog.
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// Target path exceeds the platform path limit.
    #[error("path too long: {len} bytes (limit {limit})")]
    PathTooLong {
        /// Length of the rejected path.
        len: usize,
        /// Maximum accepted length.
        limit: usize,
    },

    /// Arena could not map memory for an allocation.
    #[error("arena allocation failed: {0}")]
    AllocationFailed(&'static str),

    /// The text buffer pool has no free buffer left.
    #[error("text buffer pool exhausted")]
    PoolExhausted,

    /// All block slots of a lane are held by other writers.
    #[error("lane {lane} overloaded: all block slots busy")]
    Overloaded {
        /// Lane that had no claimable slot.
        lane: usize,
    },

    /// Handle was deactivated (deleted or failed); the write was dropped.
    #[error("data handle is inactive")]
    Inactive,

    /// Capture is paused; the write was dropped.
    #[error("capture is paused")]
    Paused,

    /// Operation does not match the handle's I/O discipline.
    #[error("operation not supported by {0} stream")]
    WrongDiscipline(&'static str),

    /// Record or string cannot fit in the stream's unit of allocation.
    #[error("payload of {len} bytes exceeds capacity of {capacity} bytes")]
    TooLarge {
        /// Requested length.
        len: usize,
        /// Largest length the stream accepts.
        capacity: usize,
    },

    /// Packet header disagrees with the packet bytes.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The experiment size limit has been reached.
    #[error("experiment size limit exceeded")]
    SizeLimitExceeded,

    /// A bounded wait ran out of time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Offline scan found an impossible packet size.
    #[error("corrupt block {block} at offset {offset}")]
    CorruptBlock {
        /// Block index within the file.
        block: usize,
        /// Byte offset within the block.
        offset: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Per-call failures that leave the handle usable.
    ///
    /// Everything else is either fatal for the handle or a lifecycle error.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::Overloaded { .. }
                | Error::Inactive
                | Error::Paused
                | Error::WrongDiscipline(_)
                | Error::TooLarge { .. }
                | Error::MalformedPacket(_)
                | Error::PoolExhausted
                | Error::SizeLimitExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_errors() {
        assert!(Error::Overloaded { lane: 3 }.is_soft());
        assert!(Error::Inactive.is_soft());
        assert!(!Error::Timeout("drain").is_soft());
        assert!(!Error::System(rustix::io::Errno::NOSPC).is_soft());
    }

    #[test]
    fn test_display() {
        let err = Error::TooLarge {
            len: 5000,
            capacity: 4096,
        };
        assert_eq!(
            err.to_string(),
            "payload of 5000 bytes exceeds capacity of 4096 bytes"
        );
        assert_eq!(
            Error::Overloaded { lane: 2 }.to_string(),
            "lane 2 overloaded: all block slots busy"
        );
    }
}
