//! Structured event log.
//!
//! Every reportable condition of the engine goes through one function here,
//! which emits a `tracing` event with structured fields and a stable numeric
//! [`EventCode`]. Offline tooling matches on `code`, not on message text.
//!
//! These functions run on slow paths only (handle lifetime, mapping failures,
//! governor trips). Producers hitting per-call failures such as overload get
//! an `Err` back and a counter bump instead; nothing is logged from the fast
//! path.

use crate::error::Error;
use tracing::{span, Level, Span};

/// Stable codes attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventCode {
    /// A data handle was created.
    HandleCreated = 1,
    /// Handle creation failed.
    HandleCreateFailed = 2,
    /// A handle was deactivated by an I/O or resource failure.
    HandleDeactivated = 3,
    /// A handle was deleted.
    HandleDeleted = 4,
    /// Deletion gave up waiting for in-flight writers.
    DrainTimedOut = 5,
    /// The arena could not map a chunk.
    ArenaMapFailed = 6,
    /// The arena could not unmap a chunk.
    ArenaUnmapFailed = 7,
    /// The experiment size limit was reached.
    SizeLimitReached = 8,
    /// A text writer gave up waiting for the cursor.
    CursorTimedOut = 9,
    /// Unmapping stream memory failed.
    UnmapFailed = 10,
    /// Handles were abandoned in a forked child.
    ForkAbandoned = 11,
    /// A text stream could not be cut to its logical length.
    TruncateFailed = 12,
}

impl EventCode {
    /// Numeric value.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Create a span covering one handle lifetime operation.
#[inline]
pub fn span_handle(stream: &str, operation: &'static str) -> Span {
    span!(Level::DEBUG, "data_handle", stream = %stream, operation = operation)
}

/// A handle was created.
pub fn handle_created(stream: &str, path: &std::path::Path, discipline: &str) {
    tracing::info!(
        code = EventCode::HandleCreated.code(),
        stream = %stream,
        path = %path.display(),
        discipline = discipline,
        "data handle created"
    );
}

/// Handle creation failed.
pub fn handle_create_failed(stream: &str, error: &Error) {
    tracing::error!(
        code = EventCode::HandleCreateFailed.code(),
        stream = %stream,
        error = %error,
        "cannot create data handle"
    );
}

/// A handle was deactivated by a failure on one of its lifetime operations.
pub fn handle_deactivated(stream: &str, error: &Error) {
    tracing::error!(
        code = EventCode::HandleDeactivated.code(),
        stream = %stream,
        error = %error,
        "data handle deactivated"
    );
}

/// A handle was deleted.
pub fn handle_deleted(stream: &str, records: u64, bytes: u64) {
    tracing::info!(
        code = EventCode::HandleDeleted.code(),
        stream = %stream,
        records = records,
        bytes = bytes,
        "data handle deleted"
    );
}

/// Deletion gave up waiting for in-flight writers; their memory leaks.
pub fn drain_timed_out(stream: &str, pending: usize) {
    tracing::error!(
        code = EventCode::DrainTimedOut.code(),
        stream = %stream,
        pending = pending,
        "timed out draining data handle"
    );
}

/// The arena could not map a new chunk.
pub fn arena_map_failed(len: usize, error: &Error) {
    tracing::error!(
        code = EventCode::ArenaMapFailed.code(),
        len = len,
        error = %error,
        "arena cannot map chunk"
    );
}

/// The arena could not unmap a chunk.
pub fn arena_unmap_failed(len: usize, error: &Error) {
    tracing::warn!(
        code = EventCode::ArenaUnmapFailed.code(),
        len = len,
        error = %error,
        "arena cannot unmap chunk"
    );
}

/// Stream memory could not be unmapped.
pub fn unmap_failed(stream: &str, len: usize, error: &Error) {
    tracing::warn!(
        code = EventCode::UnmapFailed.code(),
        stream = %stream,
        len = len,
        error = %error,
        "cannot unmap stream memory"
    );
}

/// The experiment size limit was reached; capture pauses and the experiment ends.
pub fn size_limit_reached(limit_blocks: u64, charged_blocks: u64) {
    tracing::warn!(
        code = EventCode::SizeLimitReached.code(),
        limit_blocks = limit_blocks,
        charged_blocks = charged_blocks,
        "experiment size limit reached; terminating experiment"
    );
}

/// A text writer gave up waiting for the busy cursor.
pub fn cursor_timed_out(stream: &str) {
    tracing::error!(
        code = EventCode::CursorTimedOut.code(),
        stream = %stream,
        "timed out waiting for text cursor"
    );
}

/// A text stream could not be cut to its logical length.
pub fn truncate_failed(stream: &str, len: u64, error: &Error) {
    tracing::warn!(
        code = EventCode::TruncateFailed.code(),
        stream = %stream,
        len = len,
        error = %error,
        "cannot truncate text stream"
    );
}

/// Inherited handles were abandoned in a forked child.
pub fn fork_abandoned(handles: usize) {
    tracing::debug!(
        code = EventCode::ForkAbandoned.code(),
        handles = handles,
        "abandoned inherited data handles after fork"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EventCode::HandleCreated.code(), 1);
        assert_eq!(EventCode::SizeLimitReached.code(), 8);
        assert_eq!(EventCode::ForkAbandoned.code(), 11);
    }

    #[test]
    fn test_event_functions() {
        // These should not panic even without a subscriber
        let _span = span_handle("profile", "create").entered();
        handle_created("profile", std::path::Path::new("/tmp/x/profile"), "block");
        handle_create_failed("bogus", &Error::UnknownStream("bogus".into()));
        handle_deactivated("profile", &Error::System(rustix::io::Errno::NOSPC));
        drain_timed_out("log.xml", 2);
        size_limit_reached(256, 257);
        cursor_timed_out("log.xml");
    }
}
