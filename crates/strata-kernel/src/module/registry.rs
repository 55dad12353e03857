//! Registration-ordered module store.

use super::Module;
use crate::types::ModuleId;
use indexmap::map::Entry;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ModuleRegistryError {
    #[error("duplicate module id: {0}")]
    Duplicate(ModuleId),
}

/// All modules known to the kernel, in registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<IndexMap<ModuleId, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module.
    ///
    /// Registering the same instance twice is a no-op.
    ///
    /// # Errors
    /// [`ModuleRegistryError::Duplicate`] when a different module already
    /// uses the id.
    pub fn register(&self, module: Arc<dyn Module>) -> Result<(), ModuleRegistryError> {
        let id = module.descriptor().id().clone();
        let mut modules = self.modules.write();
        match modules.entry(id) {
            Entry::Occupied(existing) => {
                if same_instance(existing.get(), &module) {
                    Ok(())
                } else {
                    Err(ModuleRegistryError::Duplicate(existing.key().clone()))
                }
            }
            Entry::Vacant(slot) => {
                debug!(module = %slot.key(), "module registered");
                slot.insert(module);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn find(&self, id: &ModuleId) -> Option<Arc<dyn Module>> {
        self.modules.read().get(id).cloned()
    }

    /// Snapshot of every module in registration order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Module>> {
        self.modules.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn same_instance(a: &Arc<dyn Module>, b: &Arc<dyn Module>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}
