//! Memory management for the capture engine.
//!
//! All engine metadata lives in an [`Arena`] built on anonymous mappings, so
//! nothing on the capture path ever calls the general-purpose allocator.
//! Stream data lives in file-backed windows mapped over address-space
//! reservations (see [`mapping`]).
//!
//! # Architecture
//!
//! - [`Arena`]: chunked slab heap with power-of-two free lists and one
//!   resizable object per chunk
//! - [`ArenaArray`]: typed array carved from the arena, used for per-handle
//!   state tables
//! - [`MasterLock`]: the arena's spin lock, resettable after `fork()`
//! - [`mapping`]: mmap, reservation and file-window system calls
//!
//! # Example
//!
//! ```rust
//! use collector_io::memory::Arena;
//! use collector_io::signal::SignalsBlocked;
//!
//! let arena = Arena::new(64 * 1024);
//! let sig = SignalsBlocked::enter();
//! let ptr = arena.alloc_fixed(48, &sig).expect("arena mapping failed");
//! unsafe { arena.free_fixed(ptr, 48, &sig) };
//! ```

mod arena;
mod lock;
pub mod mapping;

pub use arena::{Arena, ArenaArray, ArenaStats};
pub use lock::{MasterGuard, MasterLock};
