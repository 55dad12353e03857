//! Volatile store for tests and embedded use.

use super::{sanitize_module_dir, KernelState, KernelStorage, StorageError};
use crate::types::ModuleId;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keeps the state record in memory. Module directories are computed under
/// `home` but never created.
#[derive(Debug)]
pub struct MemoryKernelStorage {
    home: PathBuf,
    read_only: bool,
    state: Mutex<Option<KernelState>>,
    saves: AtomicUsize,
}

impl MemoryKernelStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::with_home(std::env::temp_dir().join("strata-memory"), false)
    }

    #[must_use]
    pub fn with_home(home: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            home: home.into(),
            read_only,
            state: Mutex::new(None),
            saves: AtomicUsize::new(0),
        }
    }

    /// Store pre-seeded with `state`.
    #[must_use]
    pub fn with_state(state: KernelState) -> Self {
        let storage = Self::new();
        *storage.state.lock() = Some(state);
        storage
    }

    /// Number of accepted writes.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Default for MemoryKernelStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelStorage for MemoryKernelStorage {
    fn load_state(&self) -> Result<KernelState, StorageError> {
        Ok(self.state.lock().clone().unwrap_or_default())
    }

    fn save_state(&self, state: &KernelState) -> Result<(), StorageError> {
        if self.read_only {
            return Ok(());
        }
        let mut stamped = state.clone();
        stamped.updated_at = Utc::now();
        *self.state.lock() = Some(stamped);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn module_data_dir(&self, module_id: &ModuleId) -> Result<PathBuf, StorageError> {
        Ok(self.home.join("modules").join(sanitize_module_dir(module_id)))
    }

    fn home_dir(&self) -> &Path {
        &self.home
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
