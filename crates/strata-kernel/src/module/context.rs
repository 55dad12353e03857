//! Per-module view of the kernel.

use crate::config::ConfigSnapshot;
use crate::events::EventBus;
use crate::services::{ServiceError, ServiceRegistry};
use crate::types::ModuleId;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a module sees while starting or stopping.
///
/// Service lookups are made on behalf of the owning module, so scoped
/// providers hand it its own instance.
#[derive(Clone)]
pub struct ModuleContext {
    module_id: ModuleId,
    services: Arc<ServiceRegistry>,
    events: Arc<dyn EventBus>,
    config: Arc<ConfigSnapshot>,
    data_dir: PathBuf,
}

impl ModuleContext {
    #[must_use]
    pub fn new(
        module_id: ModuleId,
        services: Arc<ServiceRegistry>,
        events: Arc<dyn EventBus>,
        config: Arc<ConfigSnapshot>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            module_id,
            services,
            events,
            config,
            data_dir,
        }
    }

    #[inline]
    #[must_use]
    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    /// First provider of `T`, resolved for this module.
    ///
    /// # Errors
    /// Propagates registry errors, including resolution cycles.
    pub fn service<T>(&self) -> Result<Option<Arc<T>>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services.get_for::<T>(Some(&self.module_id))
    }

    /// Every provider of `T`, resolved for this module.
    ///
    /// # Errors
    /// Propagates registry errors, including resolution cycles.
    pub fn services<T>(&self) -> Result<Vec<Arc<T>>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services.get_all_for::<T>(Some(&self.module_id))
    }

    /// The shared registry, for modules that register their own providers.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.events
    }

    #[must_use]
    pub fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    /// Private directory for the module's files.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_id", &self.module_id)
            .field("config_version", &self.config.version())
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}
