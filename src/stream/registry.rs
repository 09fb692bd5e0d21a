//! Registry of live data handles.

use super::handle::DataHandle;
use super::slots::SlotBitmap;
use super::StreamKind;
use crate::config::EngineConfig;
use crate::defaults::MAX_PATH_LEN;
use crate::error::{Error, Result};
use crate::governor::SizeGovernor;
use crate::memory::{Arena, MasterLock};
use crate::observability::events;
use crate::signal::SignalsBlocked;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bounded table of the handles of one engine.
///
/// A slot is claimed when a handle is created and released only once the
/// handle's deletion has finished, so slots are never reused while a
/// deletion is still draining.
pub struct Registry {
    experiment_dir: PathBuf,
    claimed: SlotBitmap,
    slots: Box<[MasterLock<Option<Arc<DataHandle>>>]>,
}

impl Registry {
    /// Create a registry with `capacity` slots for streams in `experiment_dir`.
    pub fn new(experiment_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            experiment_dir: experiment_dir.into(),
            claimed: SlotBitmap::new(capacity),
            slots: (0..capacity).map(|_| MasterLock::new(None)).collect(),
        }
    }

    /// Directory stream files are created in.
    pub fn experiment_dir(&self) -> &Path {
        &self.experiment_dir
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.claimed.capacity()
    }

    /// Number of claimed slots.
    pub fn len(&self) -> usize {
        self.claimed.count_claimed()
    }

    /// Whether no slot is claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create the handle for stream `name`.
    ///
    /// Every failure is reported as an event before it is returned.
    pub fn create(
        &self,
        name: &str,
        config: &EngineConfig,
        arena: &Arc<Arena>,
        governor: &Arc<SizeGovernor>,
    ) -> Result<Arc<DataHandle>> {
        let _span = events::span_handle(name, "create").entered();
        let result = self.try_create(name, config, arena, governor);
        match &result {
            Ok(handle) => events::handle_created(name, handle.path(), handle.discipline().as_str()),
            Err(e) => events::handle_create_failed(name, e),
        }
        result
    }

    fn try_create(
        &self,
        name: &str,
        config: &EngineConfig,
        arena: &Arc<Arena>,
        governor: &Arc<SizeGovernor>,
    ) -> Result<Arc<DataHandle>> {
        let kind = StreamKind::from_name(name).ok_or_else(|| Error::UnknownStream(name.into()))?;
        let path = self.experiment_dir.join(kind.name());
        let len = path.as_os_str().len();
        if len >= MAX_PATH_LEN {
            return Err(Error::PathTooLong {
                len,
                limit: MAX_PATH_LEN,
            });
        }

        let slot = self.claimed.claim().ok_or(Error::NoHandleSlots)?;
        match DataHandle::create(slot, kind, path, config, arena, governor) {
            Ok(handle) => {
                let handle = Arc::new(handle);
                let sig = SignalsBlocked::enter();
                *self.slots[slot].lock(&sig) = Some(Arc::clone(&handle));
                Ok(handle)
            }
            Err(e) => {
                self.claimed.release(slot);
                Err(e)
            }
        }
    }

    /// Delete a handle. Deleting it again is a no-op.
    ///
    /// The stream file is kept. A drain timeout is returned, but the slot is
    /// released all the same.
    pub fn delete(&self, handle: &DataHandle) -> Result<()> {
        let Some(result) = handle.delete() else {
            return Ok(());
        };
        let slot = handle.slot();
        let removed = {
            let sig = SignalsBlocked::enter();
            let mut entry = self.slots[slot].lock(&sig);
            let ours = matches!(entry.as_ref(), Some(live) if std::ptr::eq(Arc::as_ptr(live), handle));
            if ours {
                entry.take()
            } else {
                None
            }
        };
        if removed.is_some() {
            self.claimed.release(slot);
        }
        // The registry's reference may be the last one.
        drop(removed);
        result
    }

    /// Live handles.
    pub fn handles(&self) -> Vec<Arc<DataHandle>> {
        let sig = SignalsBlocked::enter();
        self.slots
            .iter()
            .filter_map(|slot| slot.lock(&sig).clone())
            .collect()
    }

    /// Delete every live handle, returning the first failure.
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles() {
            if let Err(e) = self.delete(&handle) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forget every handle in a forked child.
    ///
    /// Handles are deactivated without draining: their mappings and files
    /// belong to the parent. Returns the number of handles abandoned.
    ///
    /// # Safety
    ///
    /// Must be called in the child right after `fork()`, before any other
    /// thread exists.
    pub unsafe fn post_fork_child(&self) -> usize {
        let sig = SignalsBlocked::enter();
        let mut abandoned = 0;
        for slot in self.slots.iter() {
            // SAFETY: the forking thread is the only thread; a lock held by a
            // vanished thread is stale.
            unsafe { slot.reset_after_fork() };
            if let Some(handle) = slot.lock(&sig).take() {
                handle.abandon();
                abandoned += 1;
            }
        }
        self.claimed.clear();
        abandoned
    }
}
