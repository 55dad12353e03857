//! Kernel error types.
//!
//! Subsystems define their own error enums next to the code that raises
//! them; [`KernelError`] gathers them for callers that drive the whole
//! kernel.

use crate::config::ConfigError;
use crate::module::{DescriptorError, ModuleError, ModuleRegistryError};
use crate::services::ServiceError;
use crate::startlevel::StartLevelError;
use crate::storage::StorageError;
use crate::telemetry::TelemetryError;
use crate::types::ModuleId;

/// A start pass was aborted.
///
/// Raised either by planning (module id `kernel`, chain = the diagnostics
/// findings) or by a module whose start failed after rollback of the modules
/// started in the same pass (chain names the module first).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StartFailure {
    module_id: ModuleId,
    message: String,
    chain: Vec<String>,
    #[source]
    source: Option<ModuleError>,
}

impl StartFailure {
    #[must_use]
    pub fn new(
        module_id: ModuleId,
        message: impl Into<String>,
        chain: Vec<String>,
        source: Option<ModuleError>,
    ) -> Self {
        Self {
            module_id,
            message: message.into(),
            chain,
            source,
        }
    }

    /// Module that failed, or `kernel` for planning failures.
    #[inline]
    #[must_use]
    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Human-readable cause chain, outermost first.
    #[inline]
    #[must_use]
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// Whether planning, not a module, refused the pass.
    #[must_use]
    pub fn is_planning_failure(&self) -> bool {
        self.source.is_none() && self.module_id.as_str() == crate::types::KERNEL_MODULE_ID
    }
}

/// Umbrella error for kernel-level operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("module registry error: {0}")]
    ModuleRegistry(#[from] ModuleRegistryError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("start failed: {0}")]
    Start(#[from] StartFailure),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("start-level controller error: {0}")]
    StartLevel(#[from] StartLevelError),

    #[error("invalid start level: {0}")]
    InvalidLevel(String),
}

impl KernelError {
    /// Whether the kernel can keep running after this error.
    ///
    /// Failed start passes and service lookups leave the kernel consistent
    /// at the last good level; wiring and configuration errors do not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            KernelError::Start(_)
            | KernelError::Service(_)
            | KernelError::Storage(_)
            | KernelError::InvalidLevel(_) => true,
            KernelError::Descriptor(_)
            | KernelError::ModuleRegistry(_)
            | KernelError::Config(_)
            | KernelError::Telemetry(_)
            | KernelError::StartLevel(_) => false,
        }
    }
}
