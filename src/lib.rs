//! # collector-io
//!
//! Signal-safe, concurrent data capture for sampling profilers.
//!
//! Producers, including code running inside a profiling signal handler,
//! append records to per-experiment stream files through memory-mapped
//! windows. The hot path takes no lock, makes no system call and never
//! touches the general-purpose allocator.
//!
//! ## Features
//!
//! - **Block streams**: per-lane file blocks, claimed with a CAS, refilled
//!   by remapping the next block of the file
//! - **Text streams**: a packed atomic cursor over a ring of mapped buffers
//! - **Arena**: mmap-backed metadata heap behind a signal-masked spin lock
//! - **Size governor**: a block budget that ends the experiment exactly once
//! - **Fork support**: a child can drop every inherited handle cleanly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use collector_io::prelude::*;
//!
//! # fn main() -> collector_io::Result<()> {
//! let engine = CaptureEngine::new(EngineConfig::new("/tmp/test.1.er"))?;
//! let heap = engine.create_handle("heaptrace")?;
//! heap.write_record(RecordKind::Heap.as_u32(), &64u64.to_ne_bytes())?;
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod governor;
pub mod memory;
pub mod observability;
pub mod packet;
pub mod reader;
pub mod retry;
pub mod signal;
pub mod stream;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::CaptureEngine;
    pub use crate::error::{Error, Result};
    pub use crate::governor::{ExperimentControl, TerminateReason};
    pub use crate::packet::RecordKind;
    pub use crate::retry::RetryPolicy;
    pub use crate::stream::{DataHandle, IoDiscipline, StreamKind};
}

pub use error::{Error, Result};
