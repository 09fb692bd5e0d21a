//! The capture engine: one per process and experiment.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::governor::{ExperimentControl, NoopControl, SizeGovernor};
use crate::memory::{Arena, ArenaStats};
use crate::observability::events;
use crate::signal::SignalsBlocked;
use crate::stream::{DataHandle, Registry};
use std::sync::Arc;

/// Owner of the arena, the size governor and the handle registry.
///
/// # Example
///
/// ```rust,no_run
/// use collector_io::prelude::*;
///
/// # fn main() -> collector_io::Result<()> {
/// let engine = CaptureEngine::new(EngineConfig::new("/tmp/test.1.er"))?;
/// let profile = engine.create_handle("profile")?;
/// profile.write_record(RecordKind::Profile.as_u32(), &[1, 2, 3, 4])?;
///
/// let log = engine.create_handle("log.xml")?;
/// writeln!(log, "<event kind=\"start\" tstamp=\"{}\"/>", 0)?;
///
/// engine.close()?;
/// # Ok(())
/// # }
/// ```
pub struct CaptureEngine {
    config: EngineConfig,
    arena: Arc<Arena>,
    governor: Arc<SizeGovernor>,
    registry: Registry,
}

impl CaptureEngine {
    /// Create an engine with no session owner to notify.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_control(config, Arc::new(NoopControl))
    }

    /// Create an engine that calls `control` when the size limit ends the
    /// experiment.
    pub fn with_control(config: EngineConfig, control: Arc<dyn ExperimentControl>) -> Result<Self> {
        config.validate()?;
        let governor = Arc::new(SizeGovernor::new(config.block_size, control));
        governor.set_size_limit(config.size_limit_mb);
        tracing::debug!(
            dir = %config.experiment_dir.display(),
            block_size = config.block_size,
            lanes = config.lanes,
            size_limit_mb = config.size_limit_mb,
            "capture engine created"
        );
        Ok(Self {
            arena: Arc::new(Arena::new(config.arena_chunk_size)),
            registry: Registry::new(config.experiment_dir.clone(), config.max_handles),
            governor,
            config,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The metadata arena.
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// The size governor.
    pub fn governor(&self) -> &Arc<SizeGovernor> {
        &self.governor
    }

    /// The handle registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Live handles.
    pub fn handles(&self) -> Vec<Arc<DataHandle>> {
        self.registry.handles()
    }

    /// Arena usage.
    pub fn arena_stats(&self) -> ArenaStats {
        let sig = SignalsBlocked::enter();
        self.arena.stats(&sig)
    }

    /// Create the handle for stream `name` and its file.
    pub fn create_handle(&self, name: &str) -> Result<Arc<DataHandle>> {
        self.registry
            .create(name, &self.config, &self.arena, &self.governor)
    }

    /// Delete a handle. A second call is a no-op.
    pub fn delete_handle(&self, handle: &DataHandle) -> Result<()> {
        self.registry.delete(handle)
    }

    /// Write a record with a common header on the caller's lane.
    #[inline]
    pub fn write_record(&self, handle: &DataHandle, kind: u32, payload: &[u8]) -> Result<()> {
        handle.write_record(kind, payload)
    }

    /// Write a caller-built packet on the caller's lane.
    #[inline]
    pub fn write_packet(&self, handle: &DataHandle, packet: &[u8]) -> Result<()> {
        handle.write_packet(packet)
    }

    /// Append text to a text stream.
    #[inline]
    pub fn write_string(&self, handle: &DataHandle, bytes: &[u8]) -> Result<()> {
        handle.write_string(bytes)
    }

    /// Set the experiment size limit in megabytes (0 = unlimited).
    pub fn set_size_limit(&self, megabytes: u64) {
        self.governor.set_size_limit(megabytes);
    }

    /// Pause capture; writes fail with [`Error::Paused`](crate::Error::Paused).
    pub fn pause(&self) {
        self.governor.pause();
    }

    /// Resume capture. Returns `false` once the size limit has ended the
    /// experiment.
    pub fn resume(&self) -> bool {
        self.governor.resume()
    }

    /// Whether capture is paused.
    pub fn is_paused(&self) -> bool {
        self.governor.is_paused()
    }

    /// End the experiment: delete every live handle.
    pub fn close(&self) -> Result<()> {
        self.registry.close()
    }

    /// Reset the engine in a forked child.
    ///
    /// The arena lock is reinitialized and every inherited handle is
    /// abandoned without draining. The child starts with an empty registry.
    ///
    /// # Safety
    ///
    /// Must be called in the child right after `fork()`, before any other
    /// thread is started or any other engine call is made.
    pub unsafe fn post_fork_child(&self) {
        // SAFETY: forwarded from the caller.
        let abandoned = unsafe {
            self.arena.post_fork_child();
            self.registry.post_fork_child()
        };
        events::fork_abandoned(abandoned);
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        // Failures were already reported as events.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::packet::RecordKind;

    fn engine(dir: &tempfile::TempDir) -> CaptureEngine {
        CaptureEngine::new(EngineConfig::new(dir.path()).with_lanes(2).with_chunk_slots(2)).unwrap()
    }

    #[test]
    fn test_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);

        let profile = engine.create_handle("profile").unwrap();
        assert_eq!(profile.path(), dir.path().join("profile"));
        assert!(profile.is_active());
        assert_eq!(engine.registry().len(), 1);

        engine.delete_handle(&profile).unwrap();
        assert!(!profile.is_active());
        assert!(profile.is_deleted());
        assert_eq!(engine.registry().len(), 0);
        assert!(dir.path().join("profile").exists());
    }

    #[test]
    fn test_unknown_stream() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        assert!(matches!(
            engine.create_handle("nosuchstream"),
            Err(Error::UnknownStream(name)) if name == "nosuchstream"
        ));
        assert_eq!(engine.registry().len(), 0);
    }

    #[test]
    fn test_wrong_discipline() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let profile = engine.create_handle("profile").unwrap();
        let log = engine.create_handle("log.xml").unwrap();

        assert!(matches!(
            engine.write_string(&profile, b"text"),
            Err(Error::WrongDiscipline("block"))
        ));
        assert!(matches!(
            engine.write_record(&log, RecordKind::Profile.as_u32(), &[0]),
            Err(Error::WrongDiscipline("text"))
        ));
    }

    #[test]
    fn test_paused_writes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let profile = engine.create_handle("profile").unwrap();

        engine.pause();
        assert!(engine.is_paused());
        assert!(matches!(
            engine.write_record(&profile, RecordKind::Profile.as_u32(), &[1]),
            Err(Error::Paused)
        ));
        assert!(engine.resume());
        engine
            .write_record(&profile, RecordKind::Profile.as_u32(), &[1])
            .unwrap();
        assert_eq!(profile.stats().records, 1);
        assert_eq!(profile.stats().dropped, 0);
    }

    #[test]
    fn test_close_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir);
        let a = engine.create_handle("heaptrace").unwrap();
        let b = engine.create_handle("map.xml").unwrap();
        engine.close().unwrap();
        assert!(!a.is_active());
        assert!(!b.is_active());
        assert!(engine.registry().is_empty());
    }
}
