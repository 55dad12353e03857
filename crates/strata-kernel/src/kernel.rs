//! Kernel facade: wires the subsystems and owns their shutdown order.

use crate::config::{ConfigService, DebugFlags, EnvConfigService, KernelProps};
use crate::diagnostics::{self, DiagnosticsReport};
use crate::error::KernelError;
use crate::events::{EventBus, LocalEventBus};
use crate::lifecycle::{LevelControl, LifecycleManager, LifecycleOptions};
use crate::module::{Module, ModuleRegistry};
use crate::services::ServiceRegistry;
use crate::startlevel::StartLevelController;
use crate::storage::{FileKernelStorage, KernelStorage};
use crate::types::ModuleId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period for in-flight events on close.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for [`Kernel`]. Anything not supplied is derived from the
/// kernel properties.
#[derive(Default)]
#[must_use]
pub struct KernelBuilder {
    props: Option<KernelProps>,
    storage: Option<Arc<dyn KernelStorage>>,
    config: Option<Arc<dyn ConfigService>>,
    events: Option<Arc<dyn EventBus>>,
    module_timeout: Option<Duration>,
    modules: Vec<Arc<dyn Module>>,
}

impl KernelBuilder {
    pub fn props(mut self, props: KernelProps) -> Self {
        self.props = Some(props);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn KernelStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config_service(mut self, config: Arc<dyn ConfigService>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Bound every module start/stop call.
    pub fn module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = Some(timeout);
        self
    }

    pub fn module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    /// Assemble the kernel. No module is started.
    ///
    /// # Errors
    /// Duplicate module ids, or the start-level worker cannot be spawned.
    pub fn build(self) -> Result<Kernel, KernelError> {
        let props = Arc::new(
            self.props
                .unwrap_or_else(|| KernelProps::load(&BTreeMap::new())),
        );
        let debug = props.debug_flags();
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(FileKernelStorage::new(props.home_dir(), props.read_only()))
        });
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(EnvConfigService::new()));
        let events = self
            .events
            .unwrap_or_else(|| {
                Arc::new(
                    LocalEventBus::new(props.events_capacity()).with_publish_logging(debug.events),
                )
            });

        let modules = Arc::new(ModuleRegistry::new());
        for module in self.modules {
            modules.register(module)?;
        }
        let services = Arc::new(ServiceRegistry::new());

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&modules),
            Arc::clone(&services),
            Arc::clone(&events),
            config,
            Arc::clone(&storage),
            LifecycleOptions {
                module_timeout: self.module_timeout,
                debug,
            },
        ));
        let start_levels = Arc::new(StartLevelController::new(
            Arc::clone(&lifecycle) as Arc<dyn LevelControl>,
            Arc::clone(&storage),
            Arc::clone(&modules),
            debug,
        )?);

        let kernel_id = ModuleId::kernel();
        services.register::<KernelProps>(&kernel_id, Arc::clone(&props), true)?;
        services.register::<DebugFlags>(&kernel_id, Arc::new(debug), true)?;
        services.register::<dyn KernelStorage>(&kernel_id, Arc::clone(&storage), true)?;
        services.register::<StartLevelController>(&kernel_id, Arc::clone(&start_levels), true)?;

        info!(
            modules = modules.len(),
            home = %storage.home_dir().display(),
            read_only = storage.is_read_only(),
            "kernel assembled"
        );

        Ok(Kernel {
            props,
            modules,
            services,
            events,
            storage,
            lifecycle,
            start_levels,
            closed: AtomicBool::new(false),
        })
    }
}

/// A running orchestration kernel.
pub struct Kernel {
    props: Arc<KernelProps>,
    modules: Arc<ModuleRegistry>,
    services: Arc<ServiceRegistry>,
    events: Arc<dyn EventBus>,
    storage: Arc<dyn KernelStorage>,
    lifecycle: Arc<LifecycleManager>,
    start_levels: Arc<StartLevelController>,
    closed: AtomicBool,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    #[inline]
    #[must_use]
    pub fn props(&self) -> &KernelProps {
        &self.props
    }

    #[inline]
    #[must_use]
    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    #[inline]
    #[must_use]
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    #[inline]
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.events
    }

    #[inline]
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn KernelStorage> {
        &self.storage
    }

    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    #[inline]
    #[must_use]
    pub fn start_levels(&self) -> &Arc<StartLevelController> {
        &self.start_levels
    }

    /// Register a module after construction. Takes effect from the next
    /// start pass.
    ///
    /// # Errors
    /// The id is already taken by another module.
    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<(), KernelError> {
        self.modules.register(module).map_err(KernelError::from)
    }

    /// Fresh dependency analysis of the registered modules.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsReport {
        diagnostics::build_report(&self.modules)
    }

    /// Ask the start-level controller to move to `level`.
    ///
    /// # Errors
    /// The kernel has been closed.
    pub fn set_target_level(&self, level: u32) -> Result<(), KernelError> {
        self.start_levels
            .set_target_level(level)
            .map_err(KernelError::from)
    }

    /// Shut down: start levels first, then any module still running, then
    /// the event bus. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing kernel");

        self.start_levels.shutdown();
        self.lifecycle.stop_all();
        if !self.events.shutdown(EVENT_DRAIN_TIMEOUT) {
            warn!("event bus closed before all events were delivered");
        }

        // the registry holds the controller; release it so nothing outlives the kernel
        self.services
            .unregister::<StartLevelController>(&ModuleId::kernel());
        info!("kernel closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("modules", &self.modules)
            .field("start_levels", &self.start_levels)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
