//! Packet layout of binary streams.
//!
//! A binary stream file is a sequence of fixed-size blocks. Each block holds
//! variable-length packets, each starting with an 8-byte [`PacketHeader`].
//! Two reserved kinds let a reader walk a block without an index:
//!
//! - [`EMPTY_PACKET`]: padding; skip `tsize` bytes.
//! - [`CLOSED_PACKET`]: the rest of the block is unused.
//!
//! Records written through `write_record` carry the 32-byte
//! [`CommonHeader`], which the engine fills in for the caller.
//!
//! Headers are stored in native byte order and may be unaligned inside a
//! block.

use crate::error::{Error, Result};
use std::mem::size_of;

/// Packet kind of padding.
pub const EMPTY_PACKET: u32 = 0;

/// Packet kind marking the unused remainder of a block.
pub const CLOSED_PACKET: u32 = 0xFFFF;

/// Header at the start of every packet and sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct PacketHeader {
    /// Total packet size in bytes, header included.
    pub tsize: u32,
    /// Packet kind.
    pub kind: u32,
}

/// Size of [`PacketHeader`] in bytes.
pub const PACKET_HEADER_SIZE: usize = size_of::<PacketHeader>();

impl PacketHeader {
    /// Create a header.
    #[inline]
    pub const fn new(kind: u32, tsize: u32) -> Self {
        Self { tsize, kind }
    }

    /// Padding sentinel covering `len` bytes.
    #[inline]
    pub const fn empty(len: u32) -> Self {
        Self::new(EMPTY_PACKET, len)
    }

    /// End-of-block sentinel covering `len` bytes.
    #[inline]
    pub const fn closed(len: u32) -> Self {
        Self::new(CLOSED_PACKET, len)
    }

    /// Whether `kind` is one of the two sentinels.
    #[inline]
    pub const fn is_sentinel(&self) -> bool {
        self.kind == EMPTY_PACKET || self.kind == CLOSED_PACKET
    }

    /// Read a header from the start of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return None;
        }
        // SAFETY: length checked; `PacketHeader` is plain old data.
        Some(unsafe { bytes.as_ptr().cast::<PacketHeader>().read_unaligned() })
    }

    /// Store the header at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of [`PACKET_HEADER_SIZE`] bytes.
    #[inline]
    pub unsafe fn write_to(self, dst: *mut u8) {
        // SAFETY: guaranteed by the caller.
        unsafe { dst.cast::<PacketHeader>().write_unaligned(self) };
    }

    /// Check a caller-supplied packet: the header must describe exactly
    /// `bytes` and must not claim a reserved kind.
    pub fn validate(bytes: &[u8]) -> Result<Self> {
        let header =
            Self::read_from(bytes).ok_or(Error::MalformedPacket("shorter than a packet header"))?;
        if header.tsize as usize != bytes.len() {
            return Err(Error::MalformedPacket("size field disagrees with packet length"));
        }
        if header.is_sentinel() {
            return Err(Error::MalformedPacket("reserved packet kind"));
        }
        Ok(header)
    }
}

/// Header that `write_record` puts in front of every record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct CommonHeader {
    /// Size and kind.
    pub packet: PacketHeader,
    /// Producer lane the record was written on.
    pub lane_id: u32,
    /// CPU the producer ran on.
    pub cpu_id: u32,
    /// Kernel thread id of the producer.
    pub thread_id: u64,
    /// Monotonic timestamp in nanoseconds.
    pub tstamp: i64,
}

/// Size of [`CommonHeader`] in bytes.
pub const COMMON_HEADER_SIZE: usize = size_of::<CommonHeader>();

impl CommonHeader {
    /// Read a common header from the start of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return None;
        }
        // SAFETY: length checked; `CommonHeader` is plain old data.
        Some(unsafe { bytes.as_ptr().cast::<CommonHeader>().read_unaligned() })
    }

    /// Store the header at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of [`COMMON_HEADER_SIZE`] bytes.
    #[inline]
    pub unsafe fn write_to(self, dst: *mut u8) {
        // SAFETY: guaranteed by the caller.
        unsafe { dst.cast::<CommonHeader>().write_unaligned(self) };
    }
}

/// Kinds of records the profiler writes.
///
/// The engine itself is payload-agnostic; this catalog only gives the
/// numeric kinds a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordKind {
    /// Clock-profiling sample.
    Profile = 1,
    /// Synchronization wait event.
    Sync = 2,
    /// Hardware counter overflow.
    HwCounter = 3,
    /// Extended hardware counter overflow.
    XhwCounter = 4,
    /// Heap allocation event.
    Heap = 5,
    /// MPI event.
    Mpi = 6,
    /// Multi-counter hardware overflow.
    MhwCounter = 7,
    /// Legacy profiling sample.
    Oprof = 8,
    /// OpenMP event.
    Omp = 9,
    /// Data race event.
    Race = 10,
    /// I/O trace event.
    IoTrace = 11,
    /// OpenMP event, second format.
    Omp2 = 12,
    /// OpenMP event, third format.
    Omp3 = 13,
    /// OpenMP event, fourth format.
    Omp4 = 14,
    /// OpenMP event, fifth format.
    Omp5 = 15,
    /// Call stack identity.
    Uid = 16,
    /// Call stack frame information.
    Frame = 17,
    /// Kind not known to this catalog.
    Unknown = 18,
}

impl RecordKind {
    /// Numeric kind stored in the packet header.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Look up a numeric kind.
    pub fn from_u32(kind: u32) -> Option<Self> {
        use RecordKind::*;
        const ALL: [RecordKind; 18] = [
            Profile, Sync, HwCounter, XhwCounter, Heap, Mpi, MhwCounter, Oprof, Omp, Race,
            IoTrace, Omp2, Omp3, Omp4, Omp5, Uid, Frame, Unknown,
        ];
        ALL.iter().copied().find(|k| k.as_u32() == kind)
    }
}

/// Whether a `len`-byte packet may be placed at `offset` of a `block_size`
/// block.
///
/// The packet must end exactly at the block end or leave room for at least
/// one header, so the trailing gap can always hold a sentinel.
#[inline]
pub const fn fits(offset: usize, len: usize, block_size: usize) -> bool {
    let room = block_size - offset;
    len == room || len + PACKET_HEADER_SIZE <= room
}
