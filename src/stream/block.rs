//! Block engine for binary streams.
//!
//! A handle with `L` lanes and `S` chunk slots owns an `L x S` matrix of
//! blocks. Chunk slot `s` is one reservation of `L` blocks, so the block of
//! lane `l` lives at `chunk[s] + l * block_size`. Each block is a window onto
//! one block of the file, remapped to a fresh file block whenever it fills.
//!
//! Per-block state machine:
//!
//! ```text
//! INIT --claim--> BUSY --release--> FREE --claim--> BUSY ...
//!   \                \                 \
//!    +-- drain -->    +-- inactive -->  +-- drain --> DRAINED
//! ```
//!
//! Only the writer that wins the `FREE|INIT -> BUSY` compare-exchange may
//! touch the block until it stores `FREE` again. `DRAINED` is terminal and is
//! only entered once the handle is inactive.
//!
//! The fast path (a `FREE` block with room) performs one compare-exchange,
//! a copy and one store. It takes no lock and makes no system call, so it is
//! safe inside a signal handler.

use super::handle::StreamIo;
use crate::error::{Error, Result};
use crate::memory::{mapping, Arena, ArenaArray};
use crate::observability::events;
use crate::packet::{fits, PacketHeader};
use crate::retry::RetryPolicy;
use crate::signal::SignalsBlocked;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

const ST_INIT: u32 = 0;
const ST_FREE: u32 = 1;
const ST_BUSY: u32 = 2;
const ST_DRAINED: u32 = 3;

const CHUNK_UNMAPPED: usize = 0;
const CHUNK_RESERVING: usize = 1;

/// Decoded state of one block slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Never used; the block may not be mapped.
    Init,
    /// Mapped and available.
    Free,
    /// Held by one writer.
    Busy,
    /// Retired by deletion.
    Drained,
}

impl BlockState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            ST_INIT => BlockState::Init,
            ST_FREE => BlockState::Free,
            ST_BUSY => BlockState::Busy,
            _ => BlockState::Drained,
        }
    }
}

/// A slot won by [`SlotTable::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClaim {
    /// Chunk slot within the lane.
    pub slot: usize,
    /// The slot was in `INIT`.
    pub fresh: bool,
}

/// The `lane x slot` matrix of block states.
pub struct SlotTable {
    lanes: usize,
    slots: usize,
    states: ArenaArray<AtomicU32>,
}

impl SlotTable {
    /// Allocate a table with every slot in `INIT`.
    pub fn new(arena: &Arena, lanes: usize, slots: usize, sig: &SignalsBlocked) -> Result<Self> {
        let states = ArenaArray::new_with(arena, lanes * slots, sig, |_| AtomicU32::new(ST_INIT))?;
        Ok(Self {
            lanes,
            slots,
            states,
        })
    }

    /// Number of lanes.
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Chunk slots per lane.
    pub fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    fn cell(&self, lane: usize, slot: usize) -> &AtomicU32 {
        &self.states[lane * self.slots + slot]
    }

    /// Claim a slot of `lane`, preferring `FREE` slots over `INIT` ones.
    ///
    /// Never waits: `None` means every slot is busy (or drained).
    pub fn claim(&self, lane: usize) -> Option<SlotClaim> {
        for want in [ST_FREE, ST_INIT] {
            for slot in 0..self.slots {
                let cell = self.cell(lane, slot);
                if cell.load(Ordering::Relaxed) == want
                    && cell
                        .compare_exchange(want, ST_BUSY, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    return Some(SlotClaim {
                        slot,
                        fresh: want == ST_INIT,
                    });
                }
            }
        }
        None
    }

    /// Return a claimed slot as `FREE`.
    #[inline]
    pub fn release(&self, lane: usize, slot: usize) {
        self.cell(lane, slot).store(ST_FREE, Ordering::Release);
    }

    /// Retire a claimed slot.
    #[inline]
    pub fn retire(&self, lane: usize, slot: usize) {
        self.cell(lane, slot).store(ST_DRAINED, Ordering::Release);
    }

    /// Move an unclaimed slot to `DRAINED`.
    ///
    /// Returns `false` while a writer holds the slot.
    pub fn try_drain(&self, lane: usize, slot: usize) -> bool {
        let cell = self.cell(lane, slot);
        let mut current = cell.load(Ordering::Acquire);
        loop {
            match current {
                ST_DRAINED => return true,
                ST_BUSY => return false,
                _ => match cell.compare_exchange(
                    current,
                    ST_DRAINED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(actual) => current = actual,
                },
            }
        }
    }

    /// Snapshot of a slot's state.
    pub fn state(&self, lane: usize, slot: usize) -> BlockState {
        BlockState::from_raw(self.cell(lane, slot).load(Ordering::Acquire))
    }

    /// Return the table's memory to `arena`.
    ///
    /// # Safety
    ///
    /// `arena` must be the arena the table was created from.
    pub unsafe fn release_memory(self, arena: &Arena, sig: &SignalsBlocked) {
        // SAFETY: forwarded from the caller.
        unsafe { self.states.release(arena, sig) };
    }
}

/// Engine state of a block or sequential handle.
pub struct BlockEngine {
    block_size: usize,
    table: SlotTable,
    /// Write offset of each block; `block_size` means "full, remap first".
    offsets: ArenaArray<AtomicUsize>,
    /// Chunk reservation bases, indexed by slot.
    chunks: ArenaArray<AtomicUsize>,
    blocks_mapped: AtomicU64,
    retry: RetryPolicy,
}

impl BlockEngine {
    /// Allocate the metadata of a handle. No file block is mapped yet.
    pub fn new(
        arena: &Arena,
        lanes: usize,
        slots: usize,
        block_size: usize,
        retry: RetryPolicy,
        sig: &SignalsBlocked,
    ) -> Result<Self> {
        let table = SlotTable::new(arena, lanes, slots, sig)?;
        let offsets =
            match ArenaArray::new_with(arena, lanes * slots, sig, |_| AtomicUsize::new(block_size)) {
                Ok(offsets) => offsets,
                Err(e) => {
                    // SAFETY: allocated from `arena` above.
                    unsafe { table.release_memory(arena, sig) };
                    return Err(e);
                }
            };
        let chunks =
            match ArenaArray::new_with(arena, slots, sig, |_| AtomicUsize::new(CHUNK_UNMAPPED)) {
                Ok(chunks) => chunks,
                Err(e) => {
                    // SAFETY: allocated from `arena` above.
                    unsafe {
                        table.release_memory(arena, sig);
                        offsets.release(arena, sig);
                    }
                    return Err(e);
                }
            };
        Ok(Self {
            block_size,
            table,
            offsets,
            chunks,
            blocks_mapped: AtomicU64::new(0),
            retry,
        })
    }

    /// Number of producer lanes.
    pub fn lanes(&self) -> usize {
        self.table.lanes()
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// File blocks mapped so far.
    pub fn blocks_mapped(&self) -> u64 {
        self.blocks_mapped.load(Ordering::Acquire)
    }

    /// Slot state table.
    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    fn chunk_len(&self) -> usize {
        self.lanes() * self.block_size
    }

    /// Place one `len`-byte packet on `lane`; `fill` writes its bytes.
    ///
    /// A packet must fit an empty block: either exactly `block_size` bytes
    /// or short enough to leave room for the trailing `EMPTY` header.
    pub(crate) fn write(
        &self,
        io: &StreamIo<'_>,
        lane: usize,
        len: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        if !fits(0, len, self.block_size) {
            return Err(Error::TooLarge {
                len,
                capacity: self.block_size,
            });
        }
        let lane = lane % self.lanes();
        let Some(claim) = self.table.claim(lane) else {
            if !io.is_active() {
                return Err(Error::Inactive);
            }
            io.stats.record_overload();
            return Err(Error::Overloaded { lane });
        };

        let result = self.fill_block(io, lane, claim.slot, len, fill);
        self.release(io, lane, claim.slot);
        result
    }

    fn fill_block(
        &self,
        io: &StreamIo<'_>,
        lane: usize,
        slot: usize,
        len: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        let bs = self.block_size;
        let cell = &self.offsets[lane * self.table.slots() + slot];
        let mut offset = cell.load(Ordering::Relaxed);

        if !fits(offset, len, bs) {
            let sig = SignalsBlocked::enter();
            let block = self.reserve_chunk(io, slot, &sig)?.as_ptr().wrapping_add(lane * bs);
            if offset < bs {
                // SAFETY: the slot is ours and its block is mapped, since
                // only a mapped block has an offset below `bs`.
                unsafe { PacketHeader::closed((bs - offset) as u32).write_to(block.add(offset)) };
                cell.store(bs, Ordering::Relaxed);
            }
            self.remap(io, block, &sig)?;
            offset = 0;
        }
        debug_assert!(fits(offset, len, bs));

        let base = self.chunks[slot].load(Ordering::Acquire) as *mut u8;
        // SAFETY: the block is mapped and exclusively ours while BUSY, and
        // the fit rule keeps `offset + len` inside it.
        unsafe {
            let block = base.add(lane * bs);
            fill(std::slice::from_raw_parts_mut(block.add(offset), len));
            let end = offset + len;
            if end < bs {
                PacketHeader::empty((bs - end) as u32).write_to(block.add(end));
            }
        }
        cell.store(offset + len, Ordering::Relaxed);
        Ok(())
    }

    /// Point `block` at the next file block.
    fn remap(&self, io: &StreamIo<'_>, block: *mut u8, sig: &SignalsBlocked) -> Result<()> {
        if io.governor.charge(1) {
            return Err(Error::SizeLimitExceeded);
        }
        let n = self.blocks_mapped.fetch_add(1, Ordering::AcqRel);
        let file_offset = n * self.block_size as u64;
        let addr = NonNull::new(block).ok_or(Error::AllocationFailed("null block address"))?;
        // SAFETY: `block` lies in this engine's chunk reservation and the
        // slot is held exclusively.
        if let Err(e) = unsafe { mapping::map_file_window(io.fd, addr, self.block_size, file_offset, sig) }
        {
            io.deactivate(&e);
            return Err(e);
        }
        io.stats.record_mapped();
        Ok(())
    }

    /// Base of chunk `slot`, reserving it on first use.
    fn reserve_chunk(
        &self,
        io: &StreamIo<'_>,
        slot: usize,
        sig: &SignalsBlocked,
    ) -> Result<NonNull<u8>> {
        let cell = &self.chunks[slot];
        let mut retry = self.retry.start();
        loop {
            match cell.load(Ordering::Acquire) {
                CHUNK_UNMAPPED => {
                    if cell
                        .compare_exchange(
                            CHUNK_UNMAPPED,
                            CHUNK_RESERVING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    match mapping::reserve(self.chunk_len(), sig) {
                        Ok(base) => {
                            cell.store(base.as_ptr() as usize, Ordering::Release);
                            return Ok(base);
                        }
                        Err(e) => {
                            cell.store(CHUNK_UNMAPPED, Ordering::Release);
                            io.deactivate(&e);
                            return Err(e);
                        }
                    }
                }
                CHUNK_RESERVING => {
                    if !retry.wait() {
                        return Err(Error::Timeout("chunk reservation"));
                    }
                }
                base => {
                    return NonNull::new(base as *mut u8)
                        .ok_or(Error::AllocationFailed("null chunk base"))
                }
            }
        }
    }

    fn release(&self, io: &StreamIo<'_>, lane: usize, slot: usize) {
        if io.is_active() {
            self.table.release(lane, slot);
            return;
        }

        // Deleted while we held the block: detach it from the file.
        let base = self.chunks[slot].load(Ordering::Acquire);
        if base > CHUNK_RESERVING {
            let sig = SignalsBlocked::enter();
            let block = (base + lane * self.block_size) as *mut u8;
            if let Some(block) = NonNull::new(block) {
                // SAFETY: the block is ours and nobody else can claim it now.
                if let Err(e) = unsafe { mapping::release_window(block, self.block_size, &sig) } {
                    events::unmap_failed(io.name, self.block_size, &e);
                }
            }
        }
        self.table.retire(lane, slot);
    }

    /// Retire every slot and unmap the chunks.
    ///
    /// Slots still held by writers are polled until `retry` runs out. On
    /// timeout the chunks stay mapped and the error is returned.
    pub(crate) fn drain(&self, io: &StreamIo<'_>) -> Result<()> {
        let mut retry = self.retry.start();
        let mut pending = 0;
        for lane in 0..self.lanes() {
            for slot in 0..self.table.slots() {
                while !self.table.try_drain(lane, slot) {
                    if !retry.wait() {
                        pending += 1;
                        break;
                    }
                }
            }
        }
        if pending > 0 {
            events::drain_timed_out(io.name, pending);
            return Err(Error::Timeout("block drain"));
        }

        for chunk in self.chunks.iter() {
            let base = chunk.swap(CHUNK_UNMAPPED, Ordering::AcqRel);
            if let Some(addr) = NonNull::new(base as *mut u8).filter(|_| base > CHUNK_RESERVING) {
                // SAFETY: every slot is drained, so no writer can touch it.
                if let Err(e) = unsafe { mapping::unmap(addr, self.chunk_len()) } {
                    events::unmap_failed(io.name, self.chunk_len(), &e);
                }
            }
        }
        Ok(())
    }

    /// Return the engine's metadata to `arena`.
    ///
    /// # Safety
    ///
    /// `arena` must be the arena the engine was created from.
    pub(crate) unsafe fn release_memory(self, arena: &Arena, sig: &SignalsBlocked) {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.table.release_memory(arena, sig);
            self.offsets.release(arena, sig);
            self.chunks.release(arena, sig);
        }
    }
}
