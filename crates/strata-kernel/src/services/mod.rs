//! Service Registry
//!
//! Capability-keyed dependency injection between modules:
//! - singleton and factory-backed providers, resolved per consumer module
//! - exclusive/shared registration, checked atomically per capability
//! - per-thread guard against a factory re-resolving its own capability
//!
//! A capability is any Rust type, usually a trait object:
//!
//! ```rust,ignore
//! trait Clock: Send + Sync { fn now(&self) -> u64; }
//!
//! registry.register::<dyn Clock>(&owner, Arc::new(SystemClock), false)?;
//! let clock = registry.get_for::<dyn Clock>(Some(&consumer))?;
//! ```

mod guard;
mod provider;
mod registry;

pub use provider::{providers, ServiceProvider};
pub use registry::ServiceRegistry;

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Runtime key of a capability type.
///
/// Equality and hashing use the [`TypeId`] only; the name is kept for
/// diagnostics and error messages.
#[derive(Clone, Copy)]
pub struct Capability {
    id: TypeId,
    name: &'static str,
}

impl Capability {
    /// Capability key for `T`.
    #[inline]
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    #[inline]
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name of the capability.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Capability {}

impl Hash for Capability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Capability").field(&self.name).finish()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Errors raised synchronously by the service registry.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// An exclusive provider blocks the registration, or an exclusive
    /// registration was attempted while providers already exist.
    #[error("exclusive service already registered: {capability}")]
    ExclusivityViolation { capability: Capability },

    /// A provider re-entered resolution of its own `(capability, consumer)`
    /// pair on the same thread.
    #[error("recursive service resolution detected: {capability} for consumer={consumer}")]
    ResolutionCycle {
        capability: Capability,
        consumer: String,
    },

    /// The stored instance could not be viewed as the requested type.
    #[error("service provider for {capability} produced an instance of another type")]
    TypeMismatch { capability: Capability },

    /// A module-authored factory failed.
    #[error("service factory failed: {0}")]
    Factory(#[from] anyhow::Error),
}

impl ServiceError {
    /// Whether this error is a resolution cycle, directly or through a factory.
    #[must_use]
    pub fn is_resolution_cycle(&self) -> bool {
        match self {
            ServiceError::ResolutionCycle { .. } => true,
            ServiceError::Factory(inner) => inner
                .downcast_ref::<ServiceError>()
                .is_some_and(ServiceError::is_resolution_cycle),
            _ => false,
        }
    }
}
