//! Testing utilities for the Strata workspace
//!
//! Scriptable modules, descriptor shortcuts and throwaway stores.

#![allow(missing_docs)]

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_kernel::config::{keys, KernelProps};
use strata_kernel::module::{Module, ModuleContext, ModuleDescriptor, ModuleError};
use strata_kernel::storage::{FileKernelStorage, MemoryKernelStorage};
use strata_kernel::{Kernel, KernelBuilder, ModuleId};
use tempfile::TempDir;

/// Ordered record of module calls shared by every module of a test.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entries starting with `prefix`, e.g. `"stop:"`.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

type StartAction = Box<dyn Fn(&ModuleContext) -> Result<(), ModuleError> + Send + Sync>;

/// Module whose behavior is set up by the test.
///
/// Records `start:<id>` after a successful start, `fail:<id>` after a refused
/// one and `stop:<id>` on every stop.
pub struct TestModule {
    descriptor: ModuleDescriptor,
    journal: Journal,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    start_delay: Option<Duration>,
    on_start: Option<StartAction>,
    starts: AtomicUsize,
}

impl TestModule {
    pub fn new(descriptor: ModuleDescriptor, journal: &Journal) -> Self {
        Self {
            descriptor,
            journal: journal.clone(),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            start_delay: None,
            on_start: None,
            starts: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing_start(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Run `action` after the module's own start bookkeeping.
    #[must_use]
    pub fn on_start<F>(mut self, action: F) -> Self
    where
        F: Fn(&ModuleContext) -> Result<(), ModuleError> + Send + Sync + 'static,
    {
        self.on_start = Some(Box::new(action));
        self
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Successful starts so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Module for TestModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn start(&self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        if let Some(delay) = self.start_delay {
            std::thread::sleep(delay);
        }
        let id = self.descriptor.id();
        if self.fail_start.load(Ordering::SeqCst) {
            self.journal.record(format!("fail:{id}"));
            return Err(ModuleError::failed(format!("{id} refused to start")));
        }
        if let Some(action) = &self.on_start {
            action(ctx)?;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("start:{id}"));
        Ok(())
    }

    fn stop(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        let id = self.descriptor.id();
        self.journal.record(format!("stop:{id}"));
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ModuleError::failed(format!("{id} refused to stop")));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TestModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestModule")
            .field("id", self.descriptor.id())
            .finish_non_exhaustive()
    }
}

pub fn id(value: &str) -> ModuleId {
    ModuleId::new(value).unwrap()
}

/// Descriptor with no requirements at `level`.
pub fn descriptor(module_id: &str, level: u32) -> ModuleDescriptor {
    ModuleDescriptor::builder(id(module_id))
        .start_level(level)
        .build()
        .unwrap()
}

/// Descriptor at `level` requiring each module in `deps`.
pub fn descriptor_requiring(module_id: &str, level: u32, deps: &[&str]) -> ModuleDescriptor {
    deps.iter()
        .fold(
            ModuleDescriptor::builder(id(module_id)).start_level(level),
            |builder, dep| builder.requires_module(id(dep)),
        )
        .build()
        .unwrap()
}

/// Props isolated from the process environment, rooted at `home`.
pub fn props_for(home: &Path) -> KernelProps {
    let mut overrides = BTreeMap::new();
    overrides.insert(keys::HOME.to_string(), home.display().to_string());
    KernelProps::from_sources(std::iter::empty(), &overrides)
}

/// File store in a fresh temporary directory. Keep the `TempDir` alive for
/// the duration of the test.
pub fn temp_storage() -> (TempDir, Arc<FileKernelStorage>) {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FileKernelStorage::new(dir.path(), false));
    (dir, storage)
}

pub fn memory_storage() -> Arc<MemoryKernelStorage> {
    Arc::new(MemoryKernelStorage::new())
}

/// Builder with isolated props and an in-memory store.
pub fn test_kernel_builder(storage: Arc<MemoryKernelStorage>) -> KernelBuilder {
    Kernel::builder()
        .props(props_for(&std::env::temp_dir().join("strata-test")))
        .storage(storage)
}
