//! Slab arena usable from signal handlers.
//!
//! The arena hands out memory from anonymous mappings ("chunks") without ever
//! calling the global allocator, so the engine can allocate its metadata on
//! paths that a signal handler may reach.
//!
//! # Chunk Layout
//!
//! ```text
//! base                                                     base + size
//! ┌──────────────────┬───────────────────┬──────────┬──────┬────────┐
//! │ resizable object │     free span     │ fixed N  │ ...  │ header │
//! └──────────────────┴───────────────────┴──────────┴──────┴────────┘
//!                    ^ lo                ^ hi
//!   grows upward ->                        <- fixed objects grow down
//! ```
//!
//! - At most one resizable ("V-size") object per chunk, at `base`.
//! - Fixed-size ("C-size") objects are carved downward from below the chunk
//!   header. Their sizes are powers of two, at least [`ARENA_MIN_ALIGN`].
//! - Freed fixed objects go to a per-size-class free list threaded through
//!   their first word. Nothing is unmapped until [`Arena::destroy`]; a chunk
//!   is only ever unmapped as a whole.
//!
//! Every operation takes the master lock, which requires a
//! [`SignalsBlocked`] token.
//!
//! # Example
//!
//! ```rust
//! use collector_io::memory::Arena;
//! use collector_io::signal::SignalsBlocked;
//!
//! let arena = Arena::new(64 * 1024);
//! let sig = SignalsBlocked::enter();
//!
//! let obj = arena.alloc_fixed(40, &sig).expect("mapping failed");
//! // 40 bytes round up to the 64-byte size class.
//! unsafe { arena.free_fixed(obj, 40, &sig) };
//! ```

use super::lock::MasterLock;
use super::mapping;
use crate::defaults::ARENA_MIN_ALIGN;
use crate::error::{Error, Result};
use crate::observability::events;
use crate::signal::SignalsBlocked;
use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::ptr::{self, NonNull};

/// Number of power-of-two size classes tracked.
const NUM_CLASSES: usize = usize::BITS as usize;

/// Descriptor stored at the top of every chunk.
#[repr(C)]
struct ChunkHeader {
    base: *mut u8,
    size: usize,
    /// End of the resizable object (`base` when there is none).
    lo: *mut u8,
    /// Lowest fixed-size object; the free span is `lo..hi`.
    hi: *mut u8,
    has_resizable: bool,
    next: *mut ChunkHeader,
}

impl ChunkHeader {
    fn free_span(&self) -> usize {
        self.hi as usize - self.lo as usize
    }

    /// Room available to a resizable object starting at `base`.
    fn resizable_room(&self) -> usize {
        self.hi as usize - self.base as usize
    }
}

/// Link threaded through a free fixed-size object.
#[repr(C)]
struct FreeObject {
    next: *mut FreeObject,
}

struct ArenaState {
    chunks: *mut ChunkHeader,
    free_lists: [*mut FreeObject; NUM_CLASSES],
    chunk_count: usize,
    mapped_bytes: usize,
    fixed_bytes: usize,
    resizable_bytes: usize,
}

// SAFETY: the raw pointers refer to the arena's own mappings and are only
// dereferenced under the master lock.
unsafe impl Send for ArenaState {}

/// Snapshot of arena usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of chunks currently mapped.
    pub chunks: usize,
    /// Total bytes of all chunk mappings.
    pub mapped_bytes: usize,
    /// Bytes handed out as fixed-size objects (by size class).
    pub fixed_bytes: usize,
    /// Bytes held by resizable objects.
    pub resizable_bytes: usize,
}

/// Slab heap backed by anonymous mappings.
pub struct Arena {
    chunk_size: usize,
    page_size: usize,
    state: MasterLock<ArenaState>,
}

// SAFETY: all shared state sits behind the master lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

/// Round a request up to its size class. `None` for zero-sized requests.
#[inline]
fn class_size(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    size.max(ARENA_MIN_ALIGN).checked_next_power_of_two()
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl Arena {
    /// Create an empty arena whose chunks are at least `chunk_size` bytes.
    ///
    /// No memory is mapped until the first allocation.
    pub fn new(chunk_size: usize) -> Self {
        let page_size = mapping::page_size();
        Self {
            chunk_size: align_up(chunk_size.max(page_size), page_size),
            page_size,
            state: MasterLock::new(ArenaState {
                chunks: ptr::null_mut(),
                free_lists: [ptr::null_mut(); NUM_CLASSES],
                chunk_count: 0,
                mapped_bytes: 0,
                fixed_bytes: 0,
                resizable_bytes: 0,
            }),
        }
    }

    /// Minimum chunk size in bytes.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Allocate a fixed-size object of at least `size` bytes.
    ///
    /// The object is 16-byte aligned and its contents are unspecified.
    /// Returns `None` for a zero-sized request or when a new chunk cannot
    /// be mapped; mapping failures are reported to the event log.
    pub fn alloc_fixed(&self, size: usize, sig: &SignalsBlocked) -> Option<NonNull<u8>> {
        let size = class_size(size)?;
        let class = size.trailing_zeros() as usize;
        let mut state = self.state.lock(sig);

        if let Some(head) = NonNull::new(state.free_lists[class]) {
            // SAFETY: free list entries are unused objects of this class.
            state.free_lists[class] = unsafe { (*head.as_ptr()).next };
            state.fixed_bytes += size;
            return Some(head.cast());
        }

        let chunk = match Self::find_chunk(&state, |c| c.free_span() >= size) {
            Some(chunk) => chunk,
            None => self.new_chunk(&mut state, size, sig)?,
        };
        // SAFETY: `chunk` is a live header and the span check guarantees room.
        unsafe {
            (*chunk).hi = (*chunk).hi.sub(size);
            state.fixed_bytes += size;
            NonNull::new((*chunk).hi)
        }
    }

    /// Return a fixed-size object to its size-class free list.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc_fixed`](Self::alloc_fixed) on this arena
    /// with a `size` of the same class, and must not be used afterwards.
    pub unsafe fn free_fixed(&self, ptr: NonNull<u8>, size: usize, sig: &SignalsBlocked) {
        let Some(size) = class_size(size) else {
            return;
        };
        let class = size.trailing_zeros() as usize;
        let mut state = self.state.lock(sig);
        let obj = ptr.cast::<FreeObject>().as_ptr();
        // SAFETY: the object is at least 16 bytes and owned by the arena again.
        unsafe { obj.write(FreeObject { next: state.free_lists[class] }) };
        state.free_lists[class] = obj;
        state.fixed_bytes -= size;
    }

    /// Allocate a resizable object of at least `size` bytes.
    ///
    /// The object sits at the base of a chunk, so it is page aligned.
    pub fn alloc_resizable(&self, size: usize, sig: &SignalsBlocked) -> Option<NonNull<u8>> {
        let mut state = self.state.lock(sig);
        self.alloc_resizable_locked(&mut state, align_up(size.max(1), ARENA_MIN_ALIGN), sig)
    }

    /// Resize a resizable object.
    ///
    /// Shrinking, or growing within the chunk's free span, happens in place.
    /// Otherwise the object moves to another chunk and its contents are
    /// copied; the old region is released.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc_resizable`](Self::alloc_resizable) on
    /// this arena. After a move the old pointer must not be used.
    pub unsafe fn realloc_resizable(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
        sig: &SignalsBlocked,
    ) -> Option<NonNull<u8>> {
        let new_size = align_up(new_size.max(1), ARENA_MIN_ALIGN);
        let mut state = self.state.lock(sig);
        let chunk = Self::find_chunk(&state, |c| c.has_resizable && c.base == ptr.as_ptr())?;

        // SAFETY: `chunk` is a live header of this arena.
        unsafe {
            let old_size = (*chunk).lo as usize - (*chunk).base as usize;
            if new_size <= (*chunk).resizable_room() {
                (*chunk).lo = (*chunk).base.add(new_size);
                state.resizable_bytes = state.resizable_bytes - old_size + new_size;
                return Some(ptr);
            }

            let moved = self.alloc_resizable_locked(&mut state, new_size, sig)?;
            ptr::copy_nonoverlapping((*chunk).base, moved.as_ptr(), old_size.min(new_size));
            (*chunk).lo = (*chunk).base;
            (*chunk).has_resizable = false;
            state.resizable_bytes -= old_size;
            Some(moved)
        }
    }

    /// Release a resizable object.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this arena's resizable allocations and must not
    /// be used afterwards.
    pub unsafe fn free_resizable(&self, ptr: NonNull<u8>, sig: &SignalsBlocked) {
        let mut state = self.state.lock(sig);
        if let Some(chunk) =
            Self::find_chunk(&state, |c| c.has_resizable && c.base == ptr.as_ptr())
        {
            // SAFETY: live header.
            unsafe {
                state.resizable_bytes -= (*chunk).lo as usize - (*chunk).base as usize;
                (*chunk).lo = (*chunk).base;
                (*chunk).has_resizable = false;
            }
        }
    }

    /// Unmap every chunk and reset the arena to empty.
    ///
    /// # Safety
    ///
    /// Every pointer handed out by this arena becomes dangling.
    pub unsafe fn destroy(&self, sig: &SignalsBlocked) {
        let mut state = self.state.lock(sig);
        // SAFETY: forwarded from the caller.
        unsafe { Self::unmap_all(&mut state) };
    }

    /// Usage snapshot.
    pub fn stats(&self, sig: &SignalsBlocked) -> ArenaStats {
        let state = self.state.lock(sig);
        ArenaStats {
            chunks: state.chunk_count,
            mapped_bytes: state.mapped_bytes,
            fixed_bytes: state.fixed_bytes,
            resizable_bytes: state.resizable_bytes,
        }
    }

    /// Reinitialize the master lock in a forked child.
    ///
    /// The interrupted parent thread may have held the lock at `fork()` time;
    /// in the child that owner no longer exists.
    ///
    /// # Safety
    ///
    /// Must only be called in the child right after `fork()`, before any
    /// other arena call.
    pub unsafe fn post_fork_child(&self) {
        // SAFETY: forwarded from the caller.
        unsafe { self.state.reset_after_fork() };
    }

    fn find_chunk(
        state: &ArenaState,
        mut pred: impl FnMut(&ChunkHeader) -> bool,
    ) -> Option<*mut ChunkHeader> {
        let mut cur = state.chunks;
        while !cur.is_null() {
            // SAFETY: every node of the chunk list is a live header.
            let header = unsafe { &*cur };
            if pred(header) {
                return Some(cur);
            }
            cur = header.next;
        }
        None
    }

    fn alloc_resizable_locked(
        &self,
        state: &mut ArenaState,
        size: usize,
        sig: &SignalsBlocked,
    ) -> Option<NonNull<u8>> {
        let chunk = match Self::find_chunk(state, |c| !c.has_resizable && c.resizable_room() >= size)
        {
            Some(chunk) => chunk,
            None => self.new_chunk(state, size, sig)?,
        };
        // SAFETY: live header with enough room at its base.
        unsafe {
            (*chunk).has_resizable = true;
            (*chunk).lo = (*chunk).base.add(size);
            state.resizable_bytes += size;
            NonNull::new((*chunk).base)
        }
    }

    /// Map a chunk with room for at least `need` bytes and link it in.
    fn new_chunk(
        &self,
        state: &mut ArenaState,
        need: usize,
        sig: &SignalsBlocked,
    ) -> Option<*mut ChunkHeader> {
        let header_size = align_up(size_of::<ChunkHeader>(), ARENA_MIN_ALIGN);
        let len = self
            .chunk_size
            .max(align_up(need.checked_add(header_size)?, self.page_size));

        let base = match mapping::map_anonymous(len, sig) {
            Ok(base) => base.as_ptr(),
            Err(err) => {
                events::arena_map_failed(len, &err);
                return None;
            }
        };

        // SAFETY: `base..base + len` is a fresh mapping; the header sits in
        // its last `header_size` bytes, which are suitably aligned.
        unsafe {
            let header = base.add(len - header_size).cast::<ChunkHeader>();
            debug_assert_eq!(header as usize % align_of::<ChunkHeader>(), 0);
            header.write(ChunkHeader {
                base,
                size: len,
                lo: base,
                hi: header.cast(),
                has_resizable: false,
                next: state.chunks,
            });
            state.chunks = header;
            state.chunk_count += 1;
            state.mapped_bytes += len;
            Some(header)
        }
    }

    /// # Safety
    ///
    /// Invalidates every object of the arena.
    unsafe fn unmap_all(state: &mut ArenaState) {
        let mut cur = state.chunks;
        while !cur.is_null() {
            // SAFETY: live header; read everything before the unmap.
            let (base, size, next) = unsafe { ((*cur).base, (*cur).size, (*cur).next) };
            if let Some(base) = NonNull::new(base) {
                // SAFETY: the chunk was mapped by `new_chunk` with this size.
                if let Err(err) = unsafe { mapping::unmap(base, size) } {
                    events::arena_unmap_failed(size, &err);
                }
            }
            cur = next;
        }
        state.chunks = ptr::null_mut();
        state.free_lists = [ptr::null_mut(); NUM_CLASSES];
        state.chunk_count = 0;
        state.mapped_bytes = 0;
        state.fixed_bytes = 0;
        state.resizable_bytes = 0;
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        // SAFETY: `&mut self` proves no object borrowed from the arena is
        // still reachable through it.
        unsafe { Self::unmap_all(state) };
    }
}

/// A typed array carved from an arena's fixed-size objects.
///
/// Used for all per-handle engine metadata. The array does not free itself:
/// its owner hands it back with [`ArenaArray::release`], using the arena it
/// came from.
pub struct ArenaArray<T> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: the array owns its elements like a `Box<[T]>` would.
unsafe impl<T: Send> Send for ArenaArray<T> {}
unsafe impl<T: Sync> Sync for ArenaArray<T> {}

impl<T> ArenaArray<T> {
    /// Allocate `len` elements from `arena`, initializing each with `init(i)`.
    pub fn new_with(
        arena: &Arena,
        len: usize,
        sig: &SignalsBlocked,
        mut init: impl FnMut(usize) -> T,
    ) -> Result<Self> {
        const { assert!(align_of::<T>() <= ARENA_MIN_ALIGN, "element over-aligned") };
        let bytes = len
            .checked_mul(size_of::<T>())
            .filter(|&b| b > 0)
            .ok_or(Error::AllocationFailed("invalid array size"))?;
        let ptr = arena
            .alloc_fixed(bytes, sig)
            .ok_or(Error::AllocationFailed("arena could not map a chunk"))?
            .cast::<T>();
        for i in 0..len {
            // SAFETY: in bounds of a fresh allocation of `len` elements.
            unsafe { ptr.as_ptr().add(i).write(init(i)) };
        }
        Ok(Self { ptr, len })
    }

    /// Drop the elements and return the memory to `arena`.
    ///
    /// # Safety
    ///
    /// `arena` must be the arena the array was allocated from.
    pub unsafe fn release(self, arena: &Arena, sig: &SignalsBlocked) {
        let bytes = self.len * size_of::<T>();
        // SAFETY: elements were initialized in `new_with` and are dropped once.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
            arena.free_fixed(self.ptr.cast(), bytes, sig);
        }
    }
}

impl<T> Deref for ArenaArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` initialized elements live at `ptr`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}
