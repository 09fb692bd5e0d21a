//! Observability: the structured event log and metrics.
//!
//! - **Events**: every reportable condition is a `tracing` event with a
//!   stable [`EventCode`] (see [`events`]).
//! - **Metrics**: per-handle counters are published to `metrics-rs` on demand.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `collector_handles_active` | Gauge | Live data handles |
//! | `collector_records_written` | Counter | Writes per stream |
//! | `collector_bytes_written` | Counter | Bytes per stream |
//! | `collector_regions_mapped` | Counter | Blocks/buffers mapped per stream |
//! | `collector_lane_overloads` | Counter | Writes refused for a full lane |
//! | `collector_writes_dropped` | Counter | Failed writes per stream |
//! | `collector_arena_chunks` | Gauge | Arena chunks |
//! | `collector_arena_mapped_bytes` | Gauge | Arena bytes mapped |
//! | `collector_size_charged_blocks` | Gauge | Blocks charged to the size limit |
//! | `collector_capture_paused` | Gauge | 1 while paused |
//!
//! ## Signal context
//!
//! Events are emitted from slow paths only, but some of those (a failed
//! remap, a governor trip) can run inside the sampling handler. The
//! subscriber installed by the host must therefore not allocate or lock when
//! it receives one, or must be installed only in tools that do not sample.
//!
//! ## Example
//!
//! ```rust,ignore
//! use collector_io::observability::{init_metrics, publish_metrics};
//!
//! init_metrics();
//! // ... from a sampler thread:
//! publish_metrics(&engine);
//! ```

pub mod events;
mod metrics;

pub use events::EventCode;
pub use metrics::{init_metrics, publish_metrics};
