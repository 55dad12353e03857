//! Modules and their descriptors.
//!
//! A module declares what it needs ([`Requirement`]) and what it offers
//! ([`Provision`]) in an immutable [`ModuleDescriptor`]. The kernel plans and
//! drives activation from those declarations; the module itself only
//! implements [`Module::start`] and [`Module::stop`].

mod context;
mod legacy;
mod registry;

pub use context::ModuleContext;
pub use legacy::{LegacyPlugin, LegacyPluginModule};
pub use registry::{ModuleRegistry, ModuleRegistryError};

use crate::services::{Capability, ServiceError};
use crate::types::{ModuleId, ServiceMode};
use std::time::Duration;

/// A dependency declared by a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// Another module must be present.
    Module { module_id: ModuleId },
    /// Some module must provide `capability`, unless `optional`.
    Service { capability: Capability, optional: bool },
}

impl Requirement {
    #[must_use]
    pub fn module(module_id: ModuleId) -> Self {
        Requirement::Module { module_id }
    }

    /// Mandatory dependency on capability `T`.
    #[must_use]
    pub fn service<T: ?Sized + 'static>() -> Self {
        Requirement::Service {
            capability: Capability::of::<T>(),
            optional: false,
        }
    }

    #[must_use]
    pub fn optional_service<T: ?Sized + 'static>() -> Self {
        Requirement::Service {
            capability: Capability::of::<T>(),
            optional: true,
        }
    }
}

/// A capability a module supplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Provision {
    pub capability: Capability,
    /// At most one provider may exist platform-wide.
    pub exclusive: bool,
}

impl Provision {
    #[must_use]
    pub fn shared<T: ?Sized + 'static>() -> Self {
        Self {
            capability: Capability::of::<T>(),
            exclusive: false,
        }
    }

    #[must_use]
    pub fn exclusive<T: ?Sized + 'static>() -> Self {
        Self {
            capability: Capability::of::<T>(),
            exclusive: true,
        }
    }
}

/// Invalid descriptor input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("start level must be > 0 for module {module_id}")]
    InvalidStartLevel { module_id: ModuleId },
}

/// Immutable declaration of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    id: ModuleId,
    display_name: String,
    service_mode: ServiceMode,
    start_level: u32,
    requirements: Vec<Requirement>,
    provisions: Vec<Provision>,
}

impl ModuleDescriptor {
    /// Start building a descriptor for `id`.
    #[must_use]
    pub fn builder(id: ModuleId) -> ModuleDescriptorBuilder {
        ModuleDescriptorBuilder {
            id,
            display_name: None,
            service_mode: ServiceMode::default(),
            start_level: 1,
            requirements: Vec::new(),
            provisions: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    #[inline]
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[inline]
    #[must_use]
    pub fn service_mode(&self) -> ServiceMode {
        self.service_mode
    }

    #[inline]
    #[must_use]
    pub fn start_level(&self) -> u32 {
        self.start_level
    }

    #[inline]
    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    #[inline]
    #[must_use]
    pub fn provisions(&self) -> &[Provision] {
        &self.provisions
    }
}

/// Builder for [`ModuleDescriptor`].
///
/// Display name defaults to the id, service mode to static, start level to 1.
#[derive(Debug, Clone)]
#[must_use]
pub struct ModuleDescriptorBuilder {
    id: ModuleId,
    display_name: Option<String>,
    service_mode: ServiceMode,
    start_level: u32,
    requirements: Vec<Requirement>,
    provisions: Vec<Provision>,
}

impl ModuleDescriptorBuilder {
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn service_mode(mut self, mode: ServiceMode) -> Self {
        self.service_mode = mode;
        self
    }

    pub fn start_level(mut self, level: u32) -> Self {
        self.start_level = level;
        self
    }

    pub fn requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn requires_module(self, module_id: ModuleId) -> Self {
        self.requirement(Requirement::module(module_id))
    }

    pub fn requires<T: ?Sized + 'static>(self) -> Self {
        self.requirement(Requirement::service::<T>())
    }

    pub fn optionally_requires<T: ?Sized + 'static>(self) -> Self {
        self.requirement(Requirement::optional_service::<T>())
    }

    pub fn provision(mut self, provision: Provision) -> Self {
        self.provisions.push(provision);
        self
    }

    pub fn provides<T: ?Sized + 'static>(self) -> Self {
        self.provision(Provision::shared::<T>())
    }

    pub fn provides_exclusive<T: ?Sized + 'static>(self) -> Self {
        self.provision(Provision::exclusive::<T>())
    }

    /// Finish the descriptor.
    ///
    /// # Errors
    /// [`DescriptorError::InvalidStartLevel`] when the start level is 0.
    pub fn build(self) -> Result<ModuleDescriptor, DescriptorError> {
        if self.start_level == 0 {
            return Err(DescriptorError::InvalidStartLevel { module_id: self.id });
        }
        let display_name = self
            .display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.id.to_string());
        Ok(ModuleDescriptor {
            id: self.id,
            display_name,
            service_mode: self.service_mode,
            start_level: self.start_level,
            requirements: self.requirements,
            provisions: self.provisions,
        })
    }
}

/// Failure raised by a module's start or stop, or by the kernel on its behalf.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A mandatory service had no provider when the module was about to start.
    #[error("Missing required service: {capability} for module {module_id}")]
    MissingService {
        module_id: ModuleId,
        capability: Capability,
    },

    /// The module call did not return within the configured timeout.
    #[error("module {module_id} did not finish {operation} within {timeout:?}")]
    Timeout {
        module_id: ModuleId,
        operation: &'static str,
        timeout: Duration,
    },

    /// The module call panicked.
    #[error("module {module_id} panicked during {operation}")]
    Panicked {
        module_id: ModuleId,
        operation: &'static str,
    },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModuleError {
    /// Plain failure with a message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        ModuleError::Failed(message.into())
    }

    /// Short classification used in failure chains.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ModuleError::MissingService { .. } => "MissingService",
            ModuleError::Timeout { .. } => "Timeout",
            ModuleError::Panicked { .. } => "Panicked",
            ModuleError::Failed(_) => "ModuleError",
            ModuleError::Service(_) => "ServiceError",
            ModuleError::Other(_) => "Error",
        }
    }
}

/// An independently activatable unit.
///
/// `start` and `stop` may block; they run on the caller's thread (or on a
/// helper thread when a module timeout is configured).
pub trait Module: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    /// Activate the module.
    ///
    /// # Errors
    /// Any failure aborts the current start pass and triggers rollback.
    fn start(&self, ctx: &ModuleContext) -> Result<(), ModuleError>;

    /// Deactivate the module.
    ///
    /// # Errors
    /// Failures mark the module failed; the stop sweep continues.
    fn stop(&self, ctx: &ModuleContext) -> Result<(), ModuleError>;
}
