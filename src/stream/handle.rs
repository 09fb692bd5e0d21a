//! The data handle: one output stream and its engine.

use super::block::BlockEngine;
use super::text::TextEngine;
use super::{IoDiscipline, StreamKind};
use crate::clock;
use crate::config::EngineConfig;
use crate::defaults::FORMAT_BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::governor::SizeGovernor;
use crate::memory::{mapping, Arena};
use crate::observability::events;
use crate::packet::{CommonHeader, PacketHeader, COMMON_HEADER_SIZE};
use crate::signal::SignalsBlocked;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::fmt;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Write counters of one handle.
///
/// Plain atomics, so producers in a signal handler can bump them.
#[derive(Debug, Default)]
pub struct HandleStats {
    records: AtomicU64,
    bytes: AtomicU64,
    mapped: AtomicU64,
    overloads: AtomicU64,
    dropped: AtomicU64,
}

impl HandleStats {
    #[inline]
    fn record_write(&self, bytes: usize) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_mapped(&self) {
        self.mapped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_overload(&self) {
        self.overloads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> HandleStatsSnapshot {
        HandleStatsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            mapped: self.mapped.load(Ordering::Relaxed),
            overloads: self.overloads.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`HandleStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleStatsSnapshot {
    /// Successful writes.
    pub records: u64,
    /// Bytes written by successful writes.
    pub bytes: u64,
    /// Blocks or buffers mapped to the file.
    pub mapped: u64,
    /// Writes refused because every slot of the lane was busy.
    pub overloads: u64,
    /// Writes that failed for any reason other than an inactive handle.
    pub dropped: u64,
}

/// What an engine needs from its handle while writing.
pub(crate) struct StreamIo<'a> {
    pub name: &'static str,
    pub fd: BorrowedFd<'a>,
    pub active: &'a AtomicBool,
    pub governor: &'a SizeGovernor,
    pub stats: &'a HandleStats,
}

impl StreamIo<'_> {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Turn the handle off after a failed lifetime operation.
    ///
    /// Only the first failure is reported.
    pub fn deactivate(&self, error: &Error) {
        if self.active.swap(false, Ordering::AcqRel) {
            events::handle_deactivated(self.name, error);
        }
    }
}

enum StreamEngine {
    Block(BlockEngine),
    Text(TextEngine),
}

/// One output stream of an experiment.
///
/// Handles are shared as `Arc<DataHandle>`. Every write method may be called
/// concurrently, including from a signal handler once the stream is warm.
pub struct DataHandle {
    slot: usize,
    kind: StreamKind,
    path: PathBuf,
    fd: OwnedFd,
    active: AtomicBool,
    deleted: AtomicBool,
    stats: HandleStats,
    engine: ManuallyDrop<StreamEngine>,
    governor: Arc<SizeGovernor>,
    arena: Arc<Arena>,
}

impl DataHandle {
    /// Create the stream file and its engine.
    pub(crate) fn create(
        slot: usize,
        kind: StreamKind,
        path: PathBuf,
        config: &EngineConfig,
        arena: &Arc<Arena>,
        governor: &Arc<SizeGovernor>,
    ) -> Result<Self> {
        let fd = mapping::create_exclusive(&path)?;
        let active = AtomicBool::new(true);
        let stats = HandleStats::default();
        let sig = SignalsBlocked::enter();

        let engine = match kind.discipline() {
            IoDiscipline::Block | IoDiscipline::Sequential => {
                let lanes = if kind.discipline() == IoDiscipline::Sequential {
                    1
                } else {
                    config.lanes
                };
                StreamEngine::Block(BlockEngine::new(
                    arena,
                    lanes,
                    config.chunk_slots,
                    config.block_size,
                    config.retry,
                    &sig,
                )?)
            }
            IoDiscipline::Text => {
                let io = StreamIo {
                    name: kind.name(),
                    fd: fd.as_fd(),
                    active: &active,
                    governor,
                    stats: &stats,
                };
                StreamEngine::Text(TextEngine::new(arena, &io, config, &sig)?)
            }
        };

        Ok(Self {
            slot,
            kind,
            path,
            fd,
            active,
            deleted: AtomicBool::new(false),
            stats,
            engine: ManuallyDrop::new(engine),
            governor: Arc::clone(governor),
            arena: Arc::clone(arena),
        })
    }

    fn io(&self) -> StreamIo<'_> {
        StreamIo {
            name: self.kind.name(),
            fd: self.fd.as_fd(),
            active: &self.active,
            governor: &self.governor,
            stats: &self.stats,
        }
    }

    /// Registry slot.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Stream kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Stream name.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// I/O discipline.
    pub fn discipline(&self) -> IoDiscipline {
        self.kind.discipline()
    }

    /// Path of the stream file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes are accepted.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the handle has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Write counters.
    pub fn stats(&self) -> HandleStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of producer lanes (1 for text streams).
    pub fn lanes(&self) -> usize {
        match &*self.engine {
            StreamEngine::Block(engine) => engine.lanes(),
            StreamEngine::Text(_) => 1,
        }
    }

    /// Block engine of a binary stream.
    pub fn block_engine(&self) -> Option<&BlockEngine> {
        match &*self.engine {
            StreamEngine::Block(engine) => Some(engine),
            StreamEngine::Text(_) => None,
        }
    }

    /// Text engine of a text stream.
    pub fn text_engine(&self) -> Option<&TextEngine> {
        match &*self.engine {
            StreamEngine::Text(engine) => Some(engine),
            StreamEngine::Block(_) => None,
        }
    }

    #[inline]
    fn check_writable(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Inactive);
        }
        if self.governor.is_paused() {
            return Err(Error::Paused);
        }
        Ok(())
    }

    #[inline]
    fn block(&self) -> Result<&BlockEngine> {
        self.block_engine()
            .ok_or(Error::WrongDiscipline(IoDiscipline::Text.as_str()))
    }

    #[inline]
    fn account(&self, result: Result<()>, len: usize) -> Result<()> {
        match &result {
            Ok(()) => self.stats.record_write(len),
            Err(Error::Inactive) => {}
            Err(_) => self.stats.record_dropped(),
        }
        result
    }

    /// Write a record on the calling thread's lane.
    ///
    /// The engine prepends a [`CommonHeader`] carrying `kind`, the lane, the
    /// CPU, the thread id and a timestamp.
    pub fn write_record(&self, kind: u32, payload: &[u8]) -> Result<()> {
        self.write_record_on(self.current_lane(), kind, payload)
    }

    /// Write a record on an explicit lane.
    pub fn write_record_on(&self, lane: usize, kind: u32, payload: &[u8]) -> Result<()> {
        self.check_writable()?;
        let engine = self.block()?;
        let len = COMMON_HEADER_SIZE + payload.len();
        let result = if PacketHeader::new(kind, 0).is_sentinel() {
            Err(Error::MalformedPacket("reserved packet kind"))
        } else {
            let lane = lane % engine.lanes();
            engine.write(&self.io(), lane, len, |dst| {
                let header = CommonHeader {
                    packet: PacketHeader::new(kind, len as u32),
                    lane_id: lane as u32,
                    cpu_id: clock::current_cpu(),
                    thread_id: clock::thread_id(),
                    tstamp: clock::hrtime(),
                };
                let (head, body) = dst.split_at_mut(COMMON_HEADER_SIZE);
                // SAFETY: `head` is exactly one common header long.
                unsafe { header.write_to(head.as_mut_ptr()) };
                body.copy_from_slice(payload);
            })
        };
        self.account(result, len)
    }

    /// Write a complete packet, header included, on the calling thread's lane.
    pub fn write_packet(&self, packet: &[u8]) -> Result<()> {
        self.write_packet_on(self.current_lane(), packet)
    }

    /// Write a complete packet on an explicit lane.
    pub fn write_packet_on(&self, lane: usize, packet: &[u8]) -> Result<()> {
        self.check_writable()?;
        let engine = self.block()?;
        let result = PacketHeader::validate(packet).and_then(|_| {
            engine.write(&self.io(), lane, packet.len(), |dst| dst.copy_from_slice(packet))
        });
        self.account(result, packet.len())
    }

    /// Append bytes to a text stream.
    pub fn write_string(&self, bytes: &[u8]) -> Result<()> {
        self.check_writable()?;
        let StreamEngine::Text(engine) = &*self.engine else {
            return Err(Error::WrongDiscipline(self.discipline().as_str()));
        };
        let result = engine.write(&self.io(), bytes);
        self.account(result, bytes.len())
    }

    /// Format and append text without allocating.
    ///
    /// The output is staged in a [`FixedBuf`]; longer output fails with
    /// [`Error::TooLarge`]. This makes `write!(handle, ...)` work.
    pub fn write_fmt(&self, args: fmt::Arguments<'_>) -> Result<()> {
        let mut buf = FixedBuf::<FORMAT_BUFFER_SIZE>::new();
        // FixedBuf never fails; overflow is checked below.
        let _ = fmt::write(&mut buf, args);
        if buf.overflowed() {
            self.stats.record_dropped();
            return Err(Error::TooLarge {
                len: buf.wanted(),
                capacity: FORMAT_BUFFER_SIZE,
            });
        }
        self.write_string(buf.as_bytes())
    }

    /// Lane of the calling thread.
    #[inline]
    pub fn current_lane(&self) -> usize {
        clock::lane_for_thread(self.lanes())
    }

    /// Deactivate and drain the handle.
    ///
    /// Returns `None` if the handle was already deleted or abandoned.
    pub(crate) fn delete(&self) -> Option<Result<()>> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return None;
        }
        let _span = events::span_handle(self.name(), "delete").entered();
        self.active.store(false, Ordering::SeqCst);
        let io = self.io();
        let result = match &*self.engine {
            StreamEngine::Block(engine) => engine.drain(&io),
            StreamEngine::Text(engine) => engine.drain(&io),
        };
        let stats = self.stats.snapshot();
        events::handle_deleted(self.name(), stats.records, stats.bytes);
        Some(result)
    }

    /// Give up the handle in a forked child without touching its mappings.
    pub(crate) fn abandon(&self) {
        self.deleted.store(true, Ordering::Release);
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for DataHandle {
    fn drop(&mut self) {
        let sig = SignalsBlocked::enter();
        // SAFETY: `engine` is taken exactly once, here.
        let engine = unsafe { ManuallyDrop::take(&mut self.engine) };
        // SAFETY: the engine's metadata came from `self.arena`.
        unsafe {
            match engine {
                StreamEngine::Block(engine) => engine.release_memory(&self.arena, &sig),
                StreamEngine::Text(engine) => engine.release_memory(&self.arena, &sig),
            }
        }
    }
}

impl fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHandle")
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Fixed-capacity stack buffer implementing [`fmt::Write`].
///
/// Output past the capacity is counted but not stored.
pub struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    wanted: usize,
}

impl<const N: usize> FixedBuf<N> {
    /// Empty buffer.
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            wanted: 0,
        }
    }

    /// Stored bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Total bytes written to the buffer, stored or not.
    pub fn wanted(&self) -> usize {
        self.wanted
    }

    /// Whether some output did not fit.
    pub fn overflowed(&self) -> bool {
        self.wanted > N
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.wanted += s.len();
        let take = s.len().min(N - self.len);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_fixed_buf() {
        let mut buf = FixedBuf::<8>::new();
        write!(buf, "{}-{}", 12, "ab").unwrap();
        assert_eq!(buf.as_bytes(), b"12-ab");
        assert!(!buf.overflowed());

        write!(buf, "xyzw").unwrap();
        assert_eq!(buf.as_bytes(), b"12-abxyz");
        assert_eq!(buf.wanted(), 9);
        assert!(buf.overflowed());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = HandleStats::default();
        stats.record_write(40);
        stats.record_write(2);
        stats.record_overload();
        stats.record_mapped();
        let snap = stats.snapshot();
        assert_eq!(snap.records, 2);
        assert_eq!(snap.bytes, 42);
        assert_eq!(snap.overloads, 1);
        assert_eq!(snap.mapped, 1);
        assert_eq!(snap.dropped, 0);
    }
}
