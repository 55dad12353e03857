//! Transactional Lifecycle Manager
//!
//! Drives module start/stop from the diagnostics plan:
//! - a start pass is all-or-nothing: on failure every module started in the
//!   same pass is stopped again in reverse order
//! - stop sweeps are best-effort and never raise
//! - progress (order, failure chain, module states) is persisted after
//!   every pass
//!
//! Not reentrant: callers serialize passes (the start-level controller's
//! worker, or a single caller during boot).

mod hooks;

pub use hooks::{BuildPlanContext, KernelHook, Plan};

use crate::config::{ConfigService, DebugFlags};
use crate::diagnostics;
use crate::error::StartFailure;
use crate::events::EventBus;
use crate::module::{Module, ModuleContext, ModuleError, ModuleRegistry, Requirement};
use crate::services::ServiceRegistry;
use crate::storage::{self, sanitize_module_dir, KernelStorage};
use crate::types::{ModuleId, ModuleState, ServiceMode};
use hooks::Hooks;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{error, info, warn};

/// Level-driven start/stop, as used by the start-level controller.
pub trait LevelControl: Send + Sync {
    /// Start every module with start level ≤ `target` that is not active.
    ///
    /// # Errors
    /// [`StartFailure`] when planning is blocked or a module fails; in the
    /// latter case the pass has been rolled back.
    fn start_to_level(&self, target: u32) -> Result<(), StartFailure>;

    /// Stop every running module with start level > `target`.
    fn stop_to_level(&self, target: u32);
}

/// Tuning of the lifecycle manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleOptions {
    /// Upper bound for a single module start or stop call. `None` waits
    /// indefinitely.
    pub module_timeout: Option<Duration>,
    pub debug: DebugFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Start,
    Stop,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
        }
    }
}

/// Owns module states and runs start/stop passes.
pub struct LifecycleManager {
    modules: Arc<ModuleRegistry>,
    services: Arc<ServiceRegistry>,
    events: Arc<dyn EventBus>,
    config: Arc<dyn ConfigService>,
    storage: Arc<dyn KernelStorage>,
    options: LifecycleOptions,
    states: RwLock<HashMap<ModuleId, ModuleState>>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        modules: Arc<ModuleRegistry>,
        services: Arc<ServiceRegistry>,
        events: Arc<dyn EventBus>,
        config: Arc<dyn ConfigService>,
        storage: Arc<dyn KernelStorage>,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            modules,
            services,
            events,
            config,
            storage,
            options,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Start every module regardless of level.
    ///
    /// # Errors
    /// As for [`LevelControl::start_to_level`].
    pub fn start_all(&self) -> Result<(), StartFailure> {
        self.start_to_level(u32::MAX)
    }

    /// Stop every running module.
    pub fn stop_all(&self) {
        self.stop_to_level(0);
    }

    /// State of `module_id`; modules never touched are [`ModuleState::Resolved`].
    #[must_use]
    pub fn state(&self, module_id: &ModuleId) -> ModuleState {
        self.states
            .read()
            .get(module_id)
            .copied()
            .unwrap_or(ModuleState::Resolved)
    }

    #[must_use]
    pub fn states_snapshot(&self) -> HashMap<ModuleId, ModuleState> {
        self.states.read().clone()
    }

    fn set_state(&self, module_id: &ModuleId, state: ModuleState) {
        let previous = self.states.write().insert(module_id.clone(), state);
        if self.options.debug.modules {
            info!(module = %module_id, from = ?previous, to = %state, "module state changed");
        }
    }

    fn context_for(&self, module_id: &ModuleId) -> ModuleContext {
        let data_dir = self.storage.module_data_dir(module_id).unwrap_or_else(|err| {
            warn!(module = %module_id, error = %err, "module data directory unavailable");
            self.storage
                .home_dir()
                .join("modules")
                .join(sanitize_module_dir(module_id))
        });
        ModuleContext::new(
            module_id.clone(),
            Arc::clone(&self.services),
            Arc::clone(&self.events),
            self.config.snapshot(),
            data_dir,
        )
    }

    /// Static-mode modules need a provider for every mandatory service.
    fn check_service_requirements(&self, module: &dyn Module) -> Result<(), ModuleError> {
        let descriptor = module.descriptor();
        if descriptor.service_mode() == ServiceMode::Dynamic {
            return Ok(());
        }
        for requirement in descriptor.requirements() {
            if let Requirement::Service {
                capability,
                optional: false,
            } = requirement
            {
                let present = self.services.has_capability(*capability);
                if self.options.debug.services {
                    info!(
                        module = %descriptor.id(),
                        capability = %capability,
                        present,
                        "service requirement checked"
                    );
                }
                if !present {
                    return Err(ModuleError::MissingService {
                        module_id: descriptor.id().clone(),
                        capability: *capability,
                    });
                }
            }
        }
        Ok(())
    }

    fn invoke(
        &self,
        module: &Arc<dyn Module>,
        ctx: &ModuleContext,
        operation: Operation,
    ) -> Result<(), ModuleError> {
        // a panicking module is a failed call, never an unwind through the pass
        let call = move |module: &dyn Module, ctx: &ModuleContext| {
            panic::catch_unwind(AssertUnwindSafe(|| match operation {
                Operation::Start => module.start(ctx),
                Operation::Stop => module.stop(ctx),
            }))
            .unwrap_or_else(|_| {
                Err(ModuleError::Panicked {
                    module_id: ctx.module_id().clone(),
                    operation: operation.as_str(),
                })
            })
        };

        let Some(timeout) = self.options.module_timeout else {
            return call(module.as_ref(), ctx);
        };

        let module_id = ctx.module_id().clone();
        let (tx, rx) = mpsc::channel();
        let worker_module = Arc::clone(module);
        let worker_ctx = ctx.clone();
        std::thread::Builder::new()
            .name(format!("strata-{}-{}", operation.as_str(), module_id))
            .spawn(move || {
                // receiver is gone after a timeout; the late outcome is dropped
                let _ = tx.send(call(worker_module.as_ref(), &worker_ctx));
            })
            .map_err(|err| ModuleError::Other(err.into()))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ModuleError::Timeout {
                module_id,
                operation: operation.as_str(),
                timeout,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ModuleError::Panicked {
                module_id,
                operation: operation.as_str(),
            }),
        }
    }

    /// Stop one module; failures mark it failed and are not raised.
    fn stop_module(&self, module: &Arc<dyn Module>) {
        let id = module.descriptor().id();
        self.set_state(id, ModuleState::Stopping);
        let ctx = self.context_for(id);
        match self.invoke(module, &ctx, Operation::Stop) {
            Ok(()) => {
                self.set_state(id, ModuleState::Resolved);
                info!(module = %id, "module stopped");
            }
            Err(err) => {
                self.set_state(id, ModuleState::Failed);
                warn!(module = %id, error = %err, "module stop failed");
            }
        }
    }

    fn fail_pass(
        &self,
        module_id: &ModuleId,
        err: ModuleError,
        started: &[Arc<dyn Module>],
        hooks: &Hooks,
        order: &[ModuleId],
    ) -> StartFailure {
        hooks.each("on_failure", |h| h.on_failure(module_id, &err));

        if !started.is_empty() {
            warn!(
                module = %module_id,
                rollback = started.len(),
                "start failed, rolling back this pass"
            );
        }
        for module in started.iter().rev() {
            self.stop_module(module);
        }
        self.set_state(module_id, ModuleState::Failed);

        let chain = failure_chain(module_id, &err);
        self.persist(Some(order), Some(chain.as_slice()));

        error!(module = %module_id, error = %err, "module start failed");
        if self.options.debug.lifecycle {
            for line in &chain {
                info!(module = %module_id, "  {line}");
            }
        }

        StartFailure::new(
            module_id.clone(),
            format!("Module start failed: {module_id}"),
            chain,
            Some(err),
        )
    }

    /// Read-modify-write the persisted record. `None` keeps the stored value;
    /// a successful pass stores an empty chain.
    fn persist(&self, order: Option<&[ModuleId]>, chain: Option<&[String]>) {
        let module_states: std::collections::BTreeMap<String, String> = self
            .states
            .read()
            .iter()
            .map(|(id, state)| (id.to_string(), state.as_str().to_string()))
            .collect();
        storage::update_state(self.storage.as_ref(), |state| {
            if let Some(order) = order {
                state.last_start_order = order.iter().map(ToString::to_string).collect();
            }
            if let Some(chain) = chain {
                state.last_failure_chain = chain.to_vec();
            }
            state.module_states = module_states;
        });
    }
}

impl LevelControl for LifecycleManager {
    fn start_to_level(&self, target: u32) -> Result<(), StartFailure> {
        let hooks = Hooks::resolve(&self.services);
        let config = self.config.snapshot();

        let build_ctx = BuildPlanContext {
            modules: &self.modules,
            services: &self.services,
            events: &self.events,
            config: &config,
            target_level: target,
        };
        hooks.each("before_plan", |h| h.before_plan(&build_ctx));

        let report = diagnostics::build_report(&self.modules);
        let plan = Plan {
            start_order: report.start_order().to_vec(),
            report,
            target_level: target,
        };
        hooks.each("after_plan", |h| h.after_plan(&plan));

        if !plan.report.is_clean() {
            let chain: Vec<String> = plan
                .report
                .missing_requirements()
                .iter()
                .chain(plan.report.conflicts())
                .cloned()
                .collect();
            error!(
                level = target,
                missing = plan.report.missing_requirements().len(),
                conflicts = plan.report.conflicts().len(),
                "start pass blocked by diagnostics"
            );
            return Err(StartFailure::new(
                ModuleId::kernel(),
                format!(
                    "Kernel cannot start due to missing requirements/conflicts:\n{}",
                    plan.report
                ),
                chain,
                None,
            ));
        }

        let mut started: Vec<Arc<dyn Module>> = Vec::new();
        for id in &plan.start_order {
            let Some(module) = self.modules.find(id) else {
                continue;
            };
            if module.descriptor().start_level() > target || self.state(id) == ModuleState::Active {
                continue;
            }

            self.set_state(id, ModuleState::Starting);
            hooks.each("before_start", |h| h.before_start(id));

            let outcome = self
                .check_service_requirements(module.as_ref())
                .and_then(|()| self.invoke(&module, &self.context_for(id), Operation::Start));
            if let Err(err) = outcome {
                return Err(self.fail_pass(id, err, &started, &hooks, &plan.start_order));
            }

            self.set_state(id, ModuleState::Active);
            info!(module = %id, level = module.descriptor().start_level(), "module started");
            started.push(module);
            hooks.each("after_start", |h| h.after_start(id));
        }

        self.persist(Some(plan.start_order.as_slice()), Some(&[][..]));
        Ok(())
    }

    fn stop_to_level(&self, target: u32) {
        let report = diagnostics::build_report(&self.modules);
        let mut stopped = 0_usize;
        for id in report.start_order().iter().rev() {
            let Some(module) = self.modules.find(id) else {
                continue;
            };
            if module.descriptor().start_level() <= target || !self.state(id).is_running() {
                continue;
            }
            self.stop_module(&module);
            stopped += 1;
        }
        if stopped > 0 {
            self.persist(None, None);
        }
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("modules", &self.modules.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// `module=<id>` followed by the error and its sources.
fn failure_chain(module_id: &ModuleId, err: &ModuleError) -> Vec<String> {
    let mut chain = vec![format!("module={module_id}"), format!("{}: {err}", err.kind())];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_chain_names_module_first() {
        let err = ModuleError::Other(anyhow::anyhow!("disk full").context("opening journal"));
        let chain = failure_chain(&ModuleId::new("f").unwrap(), &err);
        assert_eq!(chain[0], "module=f");
        assert_eq!(chain[1], "Error: opening journal");
        assert_eq!(chain[2], "caused by: disk full");
    }
}
