//! Metrics publishing using metrics-rs.
//!
//! Producers only touch plain atomics ([`HandleStats`]); nothing on the
//! capture path calls into a metrics recorder. [`publish_metrics`] copies
//! those counters into `metrics` from normal thread context, typically from
//! a periodic sampler thread.
//!
//! [`HandleStats`]: crate::stream::HandleStats

use crate::engine::CaptureEngine;
use metrics::{counter, gauge, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const HANDLES_ACTIVE: &str = "collector_handles_active";
const RECORDS_WRITTEN: &str = "collector_records_written";
const BYTES_WRITTEN: &str = "collector_bytes_written";
const REGIONS_MAPPED: &str = "collector_regions_mapped";
const LANE_OVERLOADS: &str = "collector_lane_overloads";
const WRITES_DROPPED: &str = "collector_writes_dropped";
const ARENA_CHUNKS: &str = "collector_arena_chunks";
const ARENA_MAPPED_BYTES: &str = "collector_arena_mapped_bytes";
const SIZE_CHARGED_BLOCKS: &str = "collector_size_charged_blocks";
const CAPTURE_PAUSED: &str = "collector_capture_paused";

/// Initialize metrics descriptions.
///
/// Call this once at startup before publishing. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_gauge!(HANDLES_ACTIVE, Unit::Count, "Live data handles");
    metrics::describe_counter!(
        RECORDS_WRITTEN,
        Unit::Count,
        "Records, packets and strings written per stream"
    );
    metrics::describe_counter!(BYTES_WRITTEN, Unit::Bytes, "Bytes written per stream");
    metrics::describe_counter!(
        REGIONS_MAPPED,
        Unit::Count,
        "Blocks or text buffers mapped to the stream file"
    );
    metrics::describe_counter!(
        LANE_OVERLOADS,
        Unit::Count,
        "Writes refused because every slot of the lane was busy"
    );
    metrics::describe_counter!(
        WRITES_DROPPED,
        Unit::Count,
        "Writes that failed on an active handle"
    );
    metrics::describe_gauge!(ARENA_CHUNKS, Unit::Count, "Chunks mapped by the arena");
    metrics::describe_gauge!(
        ARENA_MAPPED_BYTES,
        Unit::Bytes,
        "Bytes mapped by the arena"
    );
    metrics::describe_gauge!(
        SIZE_CHARGED_BLOCKS,
        Unit::Count,
        "Blocks charged against the experiment size limit"
    );
    metrics::describe_gauge!(CAPTURE_PAUSED, Unit::Count, "1 while capture is paused");
}

/// Copy the engine's counters into the installed metrics recorder.
pub fn publish_metrics(engine: &CaptureEngine) {
    let handles = engine.handles();
    gauge!(HANDLES_ACTIVE).set(handles.len() as f64);

    for handle in &handles {
        let stats = handle.stats();
        let stream = handle.name();
        counter!(RECORDS_WRITTEN, "stream" => stream).absolute(stats.records);
        counter!(BYTES_WRITTEN, "stream" => stream).absolute(stats.bytes);
        counter!(REGIONS_MAPPED, "stream" => stream).absolute(stats.mapped);
        counter!(LANE_OVERLOADS, "stream" => stream).absolute(stats.overloads);
        counter!(WRITES_DROPPED, "stream" => stream).absolute(stats.dropped);
    }

    let arena = engine.arena_stats();
    gauge!(ARENA_CHUNKS).set(arena.chunks as f64);
    gauge!(ARENA_MAPPED_BYTES).set(arena.mapped_bytes as f64);

    let governor = engine.governor();
    gauge!(SIZE_CHARGED_BLOCKS).set(governor.charged_blocks() as f64);
    gauge!(CAPTURE_PAUSED).set(if governor.is_paused() { 1.0 } else { 0.0 });
}
