//! Data handles and the engines behind them.
//!
//! A [`DataHandle`] is one output stream of an experiment. Its stream kind
//! fixes the file name and the I/O discipline:
//!
//! | Discipline | Producers | Engine |
//! |------------|-----------|--------|
//! | [`IoDiscipline::Block`] | many, any order | [`BlockEngine`], one lane per CPU |
//! | [`IoDiscipline::Sequential`] | one, ordered | [`BlockEngine`], a single lane |
//! | [`IoDiscipline::Text`] | many, one global order | [`TextEngine`] |
//!
//! Handles are created and deleted through the [`Registry`].

mod block;
mod cursor;
mod handle;
mod registry;
mod slots;
mod text;

pub use block::{BlockEngine, BlockState, SlotClaim, SlotTable};
pub use cursor::{window_end, AtomicCursor, Cursor, MAX_INDEX, MAX_OFFSET};
pub use handle::{DataHandle, FixedBuf, HandleStats, HandleStatsSnapshot};
pub use registry::Registry;
pub use slots::SlotBitmap;
pub use text::{BufferState, TextEngine};

use std::fmt;

/// How a stream's file is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDiscipline {
    /// Concurrent binary records, ordered within a lane only.
    Block,
    /// Binary records from a single ordered producer.
    Sequential,
    /// Ordered text appended through one cursor.
    Text,
}

impl IoDiscipline {
    /// Short name used in events and errors.
    pub const fn as_str(self) -> &'static str {
        match self {
            IoDiscipline::Block => "block",
            IoDiscipline::Sequential => "sequential",
            IoDiscipline::Text => "text",
        }
    }

    /// Whether the stream holds binary packets.
    pub const fn is_binary(self) -> bool {
        !matches!(self, IoDiscipline::Text)
    }
}

impl fmt::Display for IoDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog of the streams an experiment can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Clock-profiling samples.
    Profile,
    /// Heap tracing events.
    HeapTrace,
    /// Synchronization tracing events.
    SyncTrace,
    /// I/O tracing events.
    IoTrace,
    /// Hardware counter overflows.
    HwCounters,
    /// Call stack frame information.
    FrameInfo,
    /// Data race events.
    DataRaces,
    /// Deadlock events.
    Deadlocks,
    /// OpenMP tracing events.
    OmpTrace,
    /// Loaded Java classes.
    JavaClasses,
    /// Experiment log.
    Log,
    /// Address space map.
    Map,
}

impl StreamKind {
    /// Every known stream.
    pub const ALL: [StreamKind; 12] = [
        StreamKind::Profile,
        StreamKind::HeapTrace,
        StreamKind::SyncTrace,
        StreamKind::IoTrace,
        StreamKind::HwCounters,
        StreamKind::FrameInfo,
        StreamKind::DataRaces,
        StreamKind::Deadlocks,
        StreamKind::OmpTrace,
        StreamKind::JavaClasses,
        StreamKind::Log,
        StreamKind::Map,
    ];

    /// Stream name, which is also its file name in the experiment directory.
    pub const fn name(self) -> &'static str {
        match self {
            StreamKind::Profile => "profile",
            StreamKind::HeapTrace => "heaptrace",
            StreamKind::SyncTrace => "synctrace",
            StreamKind::IoTrace => "iotrace",
            StreamKind::HwCounters => "hwcounters",
            StreamKind::FrameInfo => "frameinfo",
            StreamKind::DataRaces => "dataraces",
            StreamKind::Deadlocks => "deadlocks",
            StreamKind::OmpTrace => "omptrace",
            StreamKind::JavaClasses => "jclasses",
            StreamKind::Log => "log.xml",
            StreamKind::Map => "map.xml",
        }
    }

    /// I/O discipline of the stream.
    pub const fn discipline(self) -> IoDiscipline {
        match self {
            StreamKind::JavaClasses => IoDiscipline::Sequential,
            StreamKind::Log | StreamKind::Map => IoDiscipline::Text,
            _ => IoDiscipline::Block,
        }
    }

    /// Look up a stream by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        assert_eq!(StreamKind::from_name("profile"), Some(StreamKind::Profile));
        assert_eq!(StreamKind::from_name("log.xml"), Some(StreamKind::Log));
        assert_eq!(StreamKind::from_name("profile.xml"), None);
        assert_eq!(StreamKind::from_name(""), None);
    }

    #[test]
    fn test_disciplines() {
        assert_eq!(StreamKind::IoTrace.discipline(), IoDiscipline::Block);
        assert_eq!(StreamKind::JavaClasses.discipline(), IoDiscipline::Sequential);
        assert_eq!(StreamKind::Map.discipline(), IoDiscipline::Text);
        assert!(IoDiscipline::Sequential.is_binary());
        assert!(!IoDiscipline::Text.is_binary());
    }

    #[test]
    fn test_names_are_unique() {
        for (i, a) in StreamKind::ALL.iter().enumerate() {
            for b in &StreamKind::ALL[i + 1..] {
                assert_ne!(a.name(), b.name());
            }
        }
    }
}
