//! Capability-keyed provider table.

use super::guard::ResolveGuard;
use super::provider::{providers, ServiceProvider};
use super::{Capability, ServiceError};
use crate::types::ModuleId;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

type AnyInstance = Arc<dyn Any + Send + Sync>;

/// Type-erased view of a `ServiceProvider<T>`.
trait ErasedProvider: Send + Sync {
    fn get_any(
        &self,
        registry: &ServiceRegistry,
        consumer: Option<&ModuleId>,
    ) -> Result<AnyInstance, ServiceError>;

    fn close(&self) -> anyhow::Result<()>;
}

struct Typed<T: ?Sized, P> {
    provider: P,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T, P> ErasedProvider for Typed<T, P>
where
    T: ?Sized + Send + Sync + 'static,
    P: ServiceProvider<T>,
{
    fn get_any(
        &self,
        registry: &ServiceRegistry,
        consumer: Option<&ModuleId>,
    ) -> Result<AnyInstance, ServiceError> {
        let instance: Arc<T> = self.provider.get(registry, consumer)?;
        Ok(Arc::new(instance))
    }

    fn close(&self) -> anyhow::Result<()> {
        self.provider.close()
    }
}

struct Entry {
    owner: ModuleId,
    capability: Capability,
    provider: Box<dyn ErasedProvider>,
    exclusive: bool,
}

/// Registry of capability providers.
///
/// Entries for a capability are kept in registration order; the first entry
/// wins for single lookups. Safe to share across threads: mutations are
/// atomic per capability and resolution never holds a table lock while a
/// provider runs.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<TypeId, Vec<Arc<Entry>>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-built instance of `T` owned by `owner`.
    ///
    /// # Errors
    /// [`ServiceError::ExclusivityViolation`] when an exclusive entry exists
    /// for `T`, or when `exclusive` is set and any entry exists.
    pub fn register<T>(
        &self,
        owner: &ModuleId,
        instance: Arc<T>,
        exclusive: bool,
    ) -> Result<(), ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register_provider::<T, _>(owner, providers::singleton(instance), exclusive)
    }

    /// Register a provider (factory) for `T` owned by `owner`.
    ///
    /// # Errors
    /// Same exclusivity rules as [`ServiceRegistry::register`].
    pub fn register_provider<T, P>(
        &self,
        owner: &ModuleId,
        provider: P,
        exclusive: bool,
    ) -> Result<(), ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
        P: ServiceProvider<T> + 'static,
    {
        let capability = Capability::of::<T>();
        let entry = Arc::new(Entry {
            owner: owner.clone(),
            capability,
            provider: Box::new(Typed::<T, P> {
                provider,
                _marker: PhantomData,
            }),
            exclusive,
        });

        match self.services.entry(capability.type_id()) {
            MapEntry::Occupied(mut slot) => {
                let existing = slot.get();
                if (exclusive && !existing.is_empty()) || existing.iter().any(|e| e.exclusive) {
                    return Err(ServiceError::ExclusivityViolation { capability });
                }
                slot.get_mut().push(entry);
            }
            MapEntry::Vacant(slot) => {
                slot.insert(vec![entry]);
            }
        }

        debug!(owner = %owner, capability = %capability, exclusive, "service registered");
        Ok(())
    }

    /// Register a factory closure for `T`; shorthand for
    /// [`ServiceRegistry::register_provider`] that lets the closure's
    /// signature be inferred.
    ///
    /// # Errors
    /// Same exclusivity rules as [`ServiceRegistry::register`].
    pub fn register_factory<T, F>(
        &self,
        owner: &ModuleId,
        factory: F,
        exclusive: bool,
    ) -> Result<(), ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&ServiceRegistry, Option<&ModuleId>) -> Result<Arc<T>, ServiceError>
            + Send
            + Sync
            + 'static,
    {
        self.register_provider::<T, F>(owner, factory, exclusive)
    }

    /// Remove every entry for `T` owned by `owner`, running release hooks.
    pub fn unregister<T: ?Sized + 'static>(&self, owner: &ModuleId) {
        self.unregister_capability(owner, Capability::of::<T>());
    }

    /// Untyped form of [`ServiceRegistry::unregister`].
    pub fn unregister_capability(&self, owner: &ModuleId, capability: Capability) {
        let removed = match self.services.entry(capability.type_id()) {
            MapEntry::Occupied(mut slot) => {
                let (removed, kept): (Vec<_>, Vec<_>) = slot
                    .get_mut()
                    .drain(..)
                    .partition(|e| &e.owner == owner);
                if kept.is_empty() {
                    slot.remove();
                } else {
                    *slot.get_mut() = kept;
                }
                removed
            }
            MapEntry::Vacant(_) => Vec::new(),
        };

        for entry in removed {
            if let Err(err) = entry.provider.close() {
                warn!(
                    owner = %owner,
                    capability = %entry.capability,
                    error = %err,
                    "service release hook failed"
                );
            }
        }
    }

    /// Resolve the first provider of `T` for `consumer`.
    ///
    /// # Errors
    /// [`ServiceError::ResolutionCycle`] on re-entrant resolution of the same
    /// pair on this thread; provider errors are propagated unchanged.
    pub fn get_for<T>(&self, consumer: Option<&ModuleId>) -> Result<Option<Arc<T>>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let capability = Capability::of::<T>();
        let first = self
            .services
            .get(&capability.type_id())
            .and_then(|list| list.first().cloned());

        match first {
            Some(entry) => self.resolve::<T>(&entry, consumer).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve every provider of `T` for `consumer`, in registration order.
    ///
    /// # Errors
    /// As for [`ServiceRegistry::get_for`]; the first failure aborts.
    pub fn get_all_for<T>(&self, consumer: Option<&ModuleId>) -> Result<Vec<Arc<T>>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entries: Vec<Arc<Entry>> = self
            .services
            .get(&Capability::of::<T>().type_id())
            .map(|list| list.value().clone())
            .unwrap_or_default();

        entries
            .iter()
            .map(|entry| self.resolve::<T>(entry, consumer))
            .collect()
    }

    /// Kernel-level lookup (no consumer module).
    ///
    /// # Errors
    /// As for [`ServiceRegistry::get_for`].
    pub fn get<T>(&self) -> Result<Option<Arc<T>>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get_for::<T>(None)
    }

    /// Kernel-level lookup of all providers.
    ///
    /// # Errors
    /// As for [`ServiceRegistry::get_all_for`].
    pub fn get_all<T>(&self) -> Result<Vec<Arc<T>>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get_all_for::<T>(None)
    }

    /// Whether at least one provider of `T` is registered.
    #[must_use]
    pub fn has<T: ?Sized + 'static>(&self) -> bool {
        self.has_capability(Capability::of::<T>())
    }

    /// Untyped form of [`ServiceRegistry::has`].
    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.services
            .get(&capability.type_id())
            .is_some_and(|list| !list.is_empty())
    }

    fn resolve<T>(&self, entry: &Entry, consumer: Option<&ModuleId>) -> Result<Arc<T>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let capability = entry.capability;
        let Some(_guard) = ResolveGuard::acquire(capability.type_id(), consumer) else {
            return Err(ServiceError::ResolutionCycle {
                capability,
                consumer: consumer.map_or_else(|| "<kernel>".to_string(), ToString::to_string),
            });
        };

        let instance = entry.provider.get_any(self, consumer)?;
        instance
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(ServiceError::TypeMismatch { capability })
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("capabilities", &self.services.len())
            .finish()
    }
}
