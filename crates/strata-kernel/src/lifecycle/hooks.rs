//! Orchestration hooks.
//!
//! Hooks are registered as providers of `dyn KernelHook` in the service
//! registry and looked up afresh on every start pass. Every method defaults
//! to a no-op; a failing hook is logged and skipped.

use crate::config::ConfigSnapshot;
use crate::diagnostics::DiagnosticsReport;
use crate::events::EventBus;
use crate::module::{ModuleError, ModuleRegistry};
use crate::services::ServiceRegistry;
use crate::types::ModuleId;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

/// Inputs available before a plan is built.
pub struct BuildPlanContext<'a> {
    pub modules: &'a ModuleRegistry,
    pub services: &'a ServiceRegistry,
    pub events: &'a Arc<dyn EventBus>,
    pub config: &'a ConfigSnapshot,
    pub target_level: u32,
}

/// A built plan, before any module is started.
#[derive(Debug, Clone)]
pub struct Plan {
    pub report: DiagnosticsReport,
    pub start_order: Vec<ModuleId>,
    pub target_level: u32,
}

/// Observer of start passes.
#[allow(unused_variables)]
pub trait KernelHook: Send + Sync {
    /// # Errors
    /// Logged and ignored.
    fn before_plan(&self, ctx: &BuildPlanContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Logged and ignored.
    fn after_plan(&self, plan: &Plan) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Logged and ignored.
    fn before_start(&self, module_id: &ModuleId) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Logged and ignored.
    fn after_start(&self, module_id: &ModuleId) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    /// Logged and ignored.
    fn on_failure(&self, module_id: &ModuleId, error: &ModuleError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The hooks of one start pass.
pub(crate) struct Hooks(Vec<Arc<dyn KernelHook>>);

impl Hooks {
    pub(crate) fn resolve(services: &ServiceRegistry) -> Self {
        match services.get_all::<dyn KernelHook>() {
            Ok(hooks) => Self(hooks),
            Err(err) => {
                debug!(error = %err, "kernel hooks unavailable");
                Self(Vec::new())
            }
        }
    }

    pub(crate) fn each(&self, stage: &'static str, call: impl Fn(&dyn KernelHook) -> anyhow::Result<()>) {
        for hook in &self.0 {
            match panic::catch_unwind(AssertUnwindSafe(|| call(hook.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(stage, error = %err, "kernel hook failed"),
                Err(_) => debug!(stage, "kernel hook panicked"),
            }
        }
    }
}
