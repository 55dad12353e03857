//! Strata Kernel (strata-kernel)
//!
//! In-process module orchestration with three layers:
//! 1. **Planning**: dependency analysis and a deterministic start order
//! 2. **Lifecycle**: transactional start passes with rollback
//! 3. **Start levels**: staged boot toward a persisted target level
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use strata_kernel::prelude::*;
//!
//! let kernel = Kernel::builder()
//!     .props(KernelProps::load(&Default::default()))
//!     .module(Arc::new(MyModule::new()))
//!     .build()?;
//!
//! println!("{}", kernel.diagnostics());
//! kernel.set_target_level(10)?;
//! kernel.start_levels().sync()?;
//! // ...
//! kernel.close();
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod kernel;
pub mod lifecycle;
pub mod module;
pub mod services;
pub mod startlevel;
pub mod storage;
pub mod telemetry;
pub mod types;

// Re-exports
pub use error::*;
pub use kernel::{Kernel, KernelBuilder};
pub use types::*;

/// Common imports for module authors.
pub mod prelude {
    pub use crate::config::{ConfigSnapshot, DebugFlags, KernelProps};
    pub use crate::diagnostics::DiagnosticsReport;
    pub use crate::error::{KernelError, StartFailure};
    pub use crate::events::{Event, EventBus, Subscription};
    pub use crate::kernel::{Kernel, KernelBuilder};
    pub use crate::lifecycle::{KernelHook, Plan};
    pub use crate::module::{
        Module, ModuleContext, ModuleDescriptor, ModuleError, Provision, Requirement,
    };
    pub use crate::services::{Capability, ServiceError, ServiceRegistry};
    pub use crate::startlevel::StartLevelController;
    pub use crate::types::{ModuleId, ModuleState, ServiceMode};
    pub use std::sync::Arc;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
