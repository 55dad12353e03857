//! Start-Level Controller
//!
//! Two numbers: the achieved `current` level (0 at boot) and the desired
//! `target` level (restored from the store). Changing the target enqueues a
//! reconciliation on a single worker thread, so start and stop passes never
//! overlap:
//! - climbing starts one level at a time and persists each level reached
//! - a failed level stops back to the last good level and ends the pass;
//!   the target is kept so a later reconciliation retries
//! - descending is one stop sweep straight to the target

use crate::config::DebugFlags;
use crate::error::StartFailure;
use crate::lifecycle::LevelControl;
use crate::module::ModuleRegistry;
use crate::storage::{self, KernelStorage};
use crate::types::ModuleId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const WORKER_NAME: &str = "strata-startlevel";

/// Widest climb that visits every level on the way up.
const STEPWISE_CLIMB_SPAN: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StartLevelError {
    #[error("start-level controller is shut down")]
    ShutDown,

    #[error("failed to spawn start-level worker: {0}")]
    Spawn(#[source] std::io::Error),
}

enum Job {
    Reconcile,
    /// Acknowledged once every earlier job has run.
    Barrier(oneshot::Sender<()>),
}

struct Inner {
    lifecycle: Arc<dyn LevelControl>,
    storage: Arc<dyn KernelStorage>,
    modules: Arc<ModuleRegistry>,
    debug: DebugFlags,
    current: AtomicU32,
    target: AtomicU32,
    running: AtomicBool,
}

/// Drives the kernel toward a target start level.
pub struct StartLevelController {
    inner: Arc<Inner>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl StartLevelController {
    /// Create the controller and start its worker. The target level is read
    /// from `storage`; nothing is reconciled until [`Self::set_target_level`].
    ///
    /// # Errors
    /// [`StartLevelError::Spawn`] when the worker thread cannot be created.
    pub fn new(
        lifecycle: Arc<dyn LevelControl>,
        storage: Arc<dyn KernelStorage>,
        modules: Arc<ModuleRegistry>,
        debug: DebugFlags,
    ) -> Result<Self, StartLevelError> {
        let persisted = storage::load_or_default(storage.as_ref());
        let inner = Arc::new(Inner {
            lifecycle,
            storage,
            modules,
            debug,
            current: AtomicU32::new(0),
            target: AtomicU32::new(persisted.target_level),
            running: AtomicBool::new(true),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || worker_inner.run(rx))
            .map_err(StartLevelError::Spawn)?;

        Ok(Self {
            inner,
            sender: Mutex::new(Some(tx)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    #[must_use]
    pub fn current_level(&self) -> u32 {
        self.inner.current.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn target_level(&self) -> u32 {
        self.inner.target.load(Ordering::SeqCst)
    }

    /// Start level of a registered module.
    #[must_use]
    pub fn module_level(&self, module_id: &ModuleId) -> Option<u32> {
        self.inner
            .modules
            .find(module_id)
            .map(|m| m.descriptor().start_level())
    }

    /// Record a new target and enqueue a reconciliation. Returns before the
    /// reconciliation runs.
    ///
    /// # Errors
    /// [`StartLevelError::ShutDown`] after [`Self::shutdown`].
    pub fn set_target_level(&self, level: u32) -> Result<(), StartLevelError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(StartLevelError::ShutDown);
        }
        self.inner.target.store(level, Ordering::SeqCst);
        storage::update_state(self.inner.storage.as_ref(), |state| {
            state.target_level = level;
        });
        info!(level, current = self.current_level(), "target start level set");
        self.enqueue(Job::Reconcile)
    }

    /// Block until every job enqueued before this call has been processed.
    ///
    /// Returns at once when called from the worker itself. Must not be
    /// called from inside an async task.
    ///
    /// # Errors
    /// [`StartLevelError::ShutDown`] if the controller shut down first.
    pub fn sync(&self) -> Result<(), StartLevelError> {
        if std::thread::current().id() == self.worker_id {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(Job::Barrier(tx))?;
        rx.blocking_recv().map_err(|_| StartLevelError::ShutDown)
    }

    /// Stop accepting jobs, discard pending ones, wait for the running job,
    /// then stop everything and persist level 0. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        drop(self.sender.lock().take());

        if std::thread::current().id() != self.worker_id {
            if let Some(worker) = self.worker.lock().take() {
                if worker.join().is_err() {
                    warn!("start-level worker panicked");
                }
            }
        }

        self.inner.lifecycle.stop_to_level(0);
        self.inner.current.store(0, Ordering::SeqCst);
        storage::update_state(self.inner.storage.as_ref(), |state| {
            state.current_level = 0;
        });
        info!("start-level controller shut down");
    }

    fn enqueue(&self, job: Job) -> Result<(), StartLevelError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(StartLevelError::ShutDown);
        };
        sender.send(job).map_err(|_| StartLevelError::ShutDown)
    }
}

impl std::fmt::Debug for StartLevelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartLevelController")
            .field("current", &self.current_level())
            .field("target", &self.target_level())
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Inner {
    fn run(&self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.blocking_recv() {
            match job {
                Job::Reconcile if self.running.load(Ordering::SeqCst) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| self.reconcile())).is_err() {
                        error!(
                            current = self.current.load(Ordering::SeqCst),
                            "start-level reconciliation panicked"
                        );
                    }
                }
                Job::Reconcile => {}
                Job::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("start-level worker exited");
    }

    fn reconcile(&self) {
        let target = self.target.load(Ordering::SeqCst);
        let current = self.current.load(Ordering::SeqCst);

        if target == current {
            debug!(level = current, "start level already reached");
            return;
        }

        if target < current {
            info!(from = current, to = target, "descending start level");
            self.lifecycle.stop_to_level(target);
            self.set_current(target);
            return;
        }

        info!(from = current, to = target, "climbing start level");
        let levels = climb_levels(&self.modules, current, target);

        for level in levels {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            match self.lifecycle.start_to_level(level) {
                Ok(()) => self.set_current(level),
                Err(failure) => {
                    self.abort_climb(level, &failure);
                    return;
                }
            }
        }
    }

    fn abort_climb(&self, level: u32, failure: &StartFailure) {
        let current = self.current.load(Ordering::SeqCst);
        warn!(
            level,
            current,
            module = %failure.module_id(),
            error = %failure,
            "start level not reached, returning to last good level"
        );
        if self.debug.lifecycle {
            for line in failure.chain() {
                info!("  - {line}");
            }
        }

        let head = format!("module={}", failure.module_id());
        let mut chain = failure.chain().to_vec();
        if chain.first() != Some(&head) {
            chain.insert(0, head);
        }
        storage::update_state(self.storage.as_ref(), |state| {
            state.last_failure_chain = chain;
        });

        self.lifecycle.stop_to_level(current);
    }

    fn set_current(&self, level: u32) {
        self.current.store(level, Ordering::SeqCst);
        storage::update_state(self.storage.as_ref(), |state| {
            state.current_level = level;
        });
        if self.debug.lifecycle {
            info!(level, "start level reached");
        } else {
            debug!(level, "start level reached");
        }
    }
}

/// Levels a climb from `current` to `target` passes through, in order.
///
/// Within [`STEPWISE_CLIMB_SPAN`] every level gets its own pass, so hooks
/// see each one and each is persisted as reached. Wider climbs visit only
/// the levels that hold modules, plus the target.
fn climb_levels(modules: &ModuleRegistry, current: u32, target: u32) -> BTreeSet<u32> {
    if target - current <= STEPWISE_CLIMB_SPAN {
        return (current + 1..=target).collect();
    }
    let mut levels: BTreeSet<u32> = modules
        .all()
        .iter()
        .map(|m| m.descriptor().start_level())
        .filter(|level| *level > current && *level < target)
        .collect();
    levels.insert(target);
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleContext, ModuleDescriptor, ModuleError};

    struct Idle(ModuleDescriptor);

    impl Module for Idle {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.0
        }

        fn start(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }

        fn stop(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    fn registry(levels: &[u32]) -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        for (i, level) in levels.iter().enumerate() {
            let descriptor = ModuleDescriptor::builder(ModuleId::new(format!("m{i}")).unwrap())
                .start_level(*level)
                .build()
                .unwrap();
            registry.register(Arc::new(Idle(descriptor))).unwrap();
        }
        registry
    }

    #[test]
    fn test_short_climb_visits_every_level() {
        let levels = climb_levels(&registry(&[3]), 1, 5);
        assert_eq!(levels.into_iter().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_wide_climb_visits_populated_levels() {
        let levels = climb_levels(&registry(&[0, 3, 70_000, u32::MAX]), 1, u32::MAX);
        assert_eq!(
            levels.into_iter().collect::<Vec<_>>(),
            vec![3, 70_000, u32::MAX]
        );
    }
}
