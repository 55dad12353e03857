//! Adapter for plugins that predate the module contract.

use super::{Module, ModuleContext, ModuleDescriptor, ModuleError};

/// Plugin exposing only start/stop without a context.
pub trait LegacyPlugin: Send + Sync {
    /// # Errors
    /// Reported as a module start failure.
    fn start_plugin(&self) -> anyhow::Result<()>;

    /// # Errors
    /// Reported as a module stop failure.
    fn stop_plugin(&self) -> anyhow::Result<()>;
}

/// Runs a [`LegacyPlugin`] as a [`Module`] under a caller-supplied descriptor.
pub struct LegacyPluginModule<P> {
    descriptor: ModuleDescriptor,
    plugin: P,
}

impl<P: LegacyPlugin> LegacyPluginModule<P> {
    #[must_use]
    pub fn new(descriptor: ModuleDescriptor, plugin: P) -> Self {
        Self { descriptor, plugin }
    }

    #[must_use]
    pub fn plugin(&self) -> &P {
        &self.plugin
    }
}

impl<P: LegacyPlugin> Module for LegacyPluginModule<P> {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn start(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.plugin.start_plugin().map_err(ModuleError::Other)
    }

    fn stop(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        self.plugin.stop_plugin().map_err(ModuleError::Other)
    }
}

impl<P> std::fmt::Debug for LegacyPluginModule<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyPluginModule")
            .field("id", self.descriptor.id())
            .finish_non_exhaustive()
    }
}
