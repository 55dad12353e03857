//! Service providers: how an entry produces instances.

use super::{ServiceError, ServiceRegistry};
use crate::types::ModuleId;
use std::sync::Arc;

/// Source of instances for one capability registration.
///
/// Closures `Fn(&ServiceRegistry, Option<&ModuleId>) -> Result<Arc<T>, ServiceError>`
/// are providers; the registry is handed in so a factory can resolve its
/// own dependencies.
pub trait ServiceProvider<T: ?Sized>: Send + Sync {
    /// Produce an instance for `consumer` (`None` means the kernel).
    ///
    /// # Errors
    /// Whatever the factory reports; the registry propagates it unchanged.
    fn get(
        &self,
        registry: &ServiceRegistry,
        consumer: Option<&ModuleId>,
    ) -> Result<Arc<T>, ServiceError>;

    /// Release hook invoked when the registration is removed.
    ///
    /// # Errors
    /// Failures are logged and ignored by the registry.
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T, F> ServiceProvider<T> for F
where
    T: ?Sized,
    F: Fn(&ServiceRegistry, Option<&ModuleId>) -> Result<Arc<T>, ServiceError> + Send + Sync,
{
    fn get(
        &self,
        registry: &ServiceRegistry,
        consumer: Option<&ModuleId>,
    ) -> Result<Arc<T>, ServiceError> {
        self(registry, consumer)
    }
}

/// Stock provider implementations.
pub mod providers {
    use super::{ServiceError, ServiceProvider, ServiceRegistry};
    use crate::types::ModuleId;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// Provider that hands out one pre-built instance.
    #[derive(Debug)]
    pub struct Singleton<T: ?Sized>(Arc<T>);

    /// Wrap a pre-built instance.
    #[must_use]
    pub fn singleton<T: ?Sized + Send + Sync>(instance: Arc<T>) -> Singleton<T> {
        Singleton(instance)
    }

    impl<T: ?Sized + Send + Sync> ServiceProvider<T> for Singleton<T> {
        fn get(
            &self,
            _registry: &ServiceRegistry,
            _consumer: Option<&ModuleId>,
        ) -> Result<Arc<T>, ServiceError> {
            Ok(Arc::clone(&self.0))
        }
    }

    /// Provider that builds one instance per consumer module and caches it.
    ///
    /// Kernel-level lookups (`consumer == None`) are never cached.
    pub struct Scoped<T: ?Sized, F> {
        factory: F,
        cache: DashMap<ModuleId, Arc<T>>,
    }

    /// Per-consumer provider backed by `factory`.
    pub fn scoped<T, F>(factory: F) -> Scoped<T, F>
    where
        T: ?Sized + Send + Sync,
        F: Fn(&ServiceRegistry, Option<&ModuleId>) -> Result<Arc<T>, ServiceError> + Send + Sync,
    {
        Scoped {
            factory,
            cache: DashMap::new(),
        }
    }

    impl<T, F> ServiceProvider<T> for Scoped<T, F>
    where
        T: ?Sized + Send + Sync,
        F: Fn(&ServiceRegistry, Option<&ModuleId>) -> Result<Arc<T>, ServiceError> + Send + Sync,
    {
        fn get(
            &self,
            registry: &ServiceRegistry,
            consumer: Option<&ModuleId>,
        ) -> Result<Arc<T>, ServiceError> {
            let Some(consumer) = consumer else {
                return (self.factory)(registry, None);
            };
            if let Some(cached) = self.cache.get(consumer) {
                return Ok(Arc::clone(cached.value()));
            }
            // built outside the shard lock so the factory may resolve freely
            let built = (self.factory)(registry, Some(consumer))?;
            Ok(Arc::clone(
                self.cache.entry(consumer.clone()).or_insert(built).value(),
            ))
        }

        fn close(&self) -> anyhow::Result<()> {
            self.cache.clear();
            Ok(())
        }
    }
}
