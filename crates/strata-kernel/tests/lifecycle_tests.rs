use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_kernel::lifecycle::{KernelHook, LevelControl, Plan};
use strata_kernel::module::{LegacyPlugin, LegacyPluginModule, ModuleDescriptor, ModuleError};
use strata_kernel::storage::{KernelStorage, MemoryKernelStorage};
use strata_kernel::{Kernel, ModuleId, ModuleState, ServiceMode};
use strata_test_utils::{
    descriptor, descriptor_requiring, id, memory_storage, test_kernel_builder, Journal,
    TestModule,
};

trait Storage: Send + Sync {}
trait Telemetry: Send + Sync {}

struct Disk;
impl Storage for Disk {}

fn kernel(storage: &Arc<MemoryKernelStorage>, modules: Vec<Arc<TestModule>>) -> Kernel {
    modules
        .into_iter()
        .fold(test_kernel_builder(Arc::clone(storage)), |builder, m| builder.module(m))
        .build()
        .unwrap()
}

fn storage_provider(level: u32, journal: &Journal, registers: bool) -> Arc<TestModule> {
    let module = TestModule::new(
        ModuleDescriptor::builder(id("c"))
            .start_level(level)
            .provides_exclusive::<dyn Storage>()
            .build()
            .unwrap(),
        journal,
    );
    if !registers {
        return module.into_arc();
    }
    module
        .on_start(|ctx| {
            ctx.registry()
                .register::<dyn Storage>(ctx.module_id(), Arc::new(Disk), true)?;
            Ok(())
        })
        .into_arc()
}

fn storage_consumer(mode: ServiceMode, journal: &Journal) -> Arc<TestModule> {
    TestModule::new(
        ModuleDescriptor::builder(id("d"))
            .start_level(2)
            .service_mode(mode)
            .requires::<dyn Storage>()
            .build()
            .unwrap(),
        journal,
    )
    .on_start(|ctx| {
        ctx.service::<dyn Storage>()?;
        Ok(())
    })
    .into_arc()
}

#[test]
fn test_start_to_level_activates_in_dependency_order() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            storage_consumer(ServiceMode::Static, &journal),
            TestModule::new(descriptor_requiring("b", 2, &["a"]), &journal).into_arc(),
            storage_provider(2, &journal, true),
            TestModule::new(descriptor("a", 1), &journal).into_arc(),
        ],
    );

    let report = kernel.diagnostics();
    assert!(report.missing_requirements().is_empty());
    assert!(report.conflicts().is_empty());

    kernel.lifecycle().start_to_level(2).unwrap();

    assert_eq!(
        journal.entries(),
        vec!["start:a", "start:b", "start:c", "start:d"]
    );
    for name in ["a", "b", "c", "d"] {
        assert_eq!(kernel.lifecycle().state(&id(name)), ModuleState::Active);
    }

    let persisted = storage.load_state().unwrap();
    assert_eq!(persisted.last_start_order, vec!["a", "b", "c", "d"]);
    assert!(persisted.last_failure_chain.is_empty());
    assert_eq!(persisted.module_states["d"], "ACTIVE");
}

#[test]
fn test_start_to_level_respects_levels_and_is_repeatable() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            TestModule::new(descriptor("a", 1), &journal).into_arc(),
            TestModule::new(descriptor("late", 5), &journal).into_arc(),
        ],
    );

    kernel.lifecycle().start_to_level(1).unwrap();
    kernel.lifecycle().start_to_level(1).unwrap();

    assert_eq!(journal.entries(), vec!["start:a"]);
    assert_eq!(kernel.lifecycle().state(&id("late")), ModuleState::Resolved);
}

#[test]
fn test_missing_service_blocks_pass_before_any_start() {
    let journal = Journal::new();
    let storage = memory_storage();
    let e = TestModule::new(
        ModuleDescriptor::builder(id("e"))
            .start_level(1)
            .requires::<dyn Telemetry>()
            .build()
            .unwrap(),
        &journal,
    )
    .into_arc();
    let kernel = kernel(&storage, vec![Arc::clone(&e)]);

    let failure = kernel.lifecycle().start_to_level(1).unwrap_err();

    assert!(failure.is_planning_failure());
    assert_eq!(failure.module_id(), &ModuleId::kernel());
    assert!(failure
        .message()
        .starts_with("Kernel cannot start due to missing requirements/conflicts:\n"));
    assert!(failure.chain()[0].starts_with("e requires missing service"));
    assert_eq!(kernel.lifecycle().state(&id("e")), ModuleState::Resolved);
    assert!(kernel.lifecycle().states_snapshot().is_empty());
    assert!(journal.entries().is_empty());
    assert_eq!(e.starts(), 0);
}

#[test]
fn test_optional_service_does_not_block() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![TestModule::new(
            ModuleDescriptor::builder(id("e"))
                .start_level(1)
                .optionally_requires::<dyn Telemetry>()
                .build()
                .unwrap(),
            &journal,
        )
        .into_arc()],
    );

    kernel.lifecycle().start_to_level(1).unwrap();
    assert_eq!(kernel.lifecycle().state(&id("e")), ModuleState::Active);
}

#[test]
fn test_failed_start_rolls_back_in_reverse_order() {
    let journal = Journal::new();
    let storage = memory_storage();
    let f = TestModule::new(descriptor_requiring("f", 1, &["b"]), &journal)
        .failing_start()
        .into_arc();
    let kernel = kernel(
        &storage,
        vec![
            TestModule::new(descriptor("a", 1), &journal).into_arc(),
            TestModule::new(descriptor_requiring("b", 1, &["a"]), &journal).into_arc(),
            Arc::clone(&f),
        ],
    );

    let failure = kernel.lifecycle().start_to_level(1).unwrap_err();

    assert_eq!(
        journal.entries(),
        vec!["start:a", "start:b", "fail:f", "stop:b", "stop:a"]
    );
    assert_eq!(kernel.lifecycle().state(&id("a")), ModuleState::Resolved);
    assert_eq!(kernel.lifecycle().state(&id("b")), ModuleState::Resolved);
    assert_eq!(kernel.lifecycle().state(&id("f")), ModuleState::Failed);

    assert_eq!(failure.module_id(), &id("f"));
    assert_eq!(failure.message(), "Module start failed: f");
    assert_eq!(failure.chain()[0], "module=f");
    assert_eq!(failure.chain()[1], "ModuleError: f refused to start");
    assert!(!failure.is_planning_failure());

    let persisted = storage.load_state().unwrap();
    assert_eq!(persisted.last_failure_chain[0], "module=f");
    assert_eq!(persisted.module_states["f"], "FAILED");
    assert_eq!(persisted.module_states["a"], "RESOLVED");

    // a later pass retries the failed module
    journal.clear();
    f.set_fail_start(false);
    kernel.lifecycle().start_to_level(1).unwrap();
    assert_eq!(journal.entries(), vec!["start:a", "start:b", "start:f"]);
    assert!(storage.load_state().unwrap().last_failure_chain.is_empty());
}

#[test]
fn test_panicking_start_rolls_back_like_a_failure() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            TestModule::new(descriptor("a", 1), &journal).into_arc(),
            TestModule::new(descriptor_requiring("p", 1, &["a"]), &journal)
                .on_start(|_| panic!("p exploded"))
                .into_arc(),
        ],
    );

    let failure = kernel.lifecycle().start_to_level(1).unwrap_err();

    assert_eq!(journal.entries(), vec!["start:a", "stop:a"]);
    assert_eq!(kernel.lifecycle().state(&id("a")), ModuleState::Resolved);
    assert_eq!(kernel.lifecycle().state(&id("p")), ModuleState::Failed);
    assert_eq!(failure.module_id(), &id("p"));
    assert_eq!(failure.chain()[1], "Panicked: module p panicked during start");
}

#[test]
fn test_rollback_only_touches_modules_of_the_failed_pass() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            TestModule::new(descriptor("base", 1), &journal).into_arc(),
            TestModule::new(descriptor("web", 2), &journal).into_arc(),
            TestModule::new(descriptor("worker", 2), &journal)
                .failing_start()
                .into_arc(),
        ],
    );

    kernel.lifecycle().start_to_level(1).unwrap();
    journal.clear();

    assert!(kernel.lifecycle().start_to_level(2).is_err());
    assert_eq!(journal.entries(), vec!["start:web", "fail:worker", "stop:web"]);
    assert_eq!(kernel.lifecycle().state(&id("base")), ModuleState::Active);
}

#[test]
fn test_static_mode_requires_registered_service() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            storage_provider(1, &journal, false),
            storage_consumer(ServiceMode::Static, &journal),
        ],
    );

    let failure = kernel.lifecycle().start_to_level(2).unwrap_err();

    assert_eq!(failure.module_id(), &id("d"));
    assert!(failure.chain()[1].starts_with("MissingService: Missing required service:"));
    assert!(failure.chain()[1].ends_with("for module d"));
    assert_eq!(journal.entries(), vec!["start:c", "stop:c"]);
}

#[test]
fn test_dynamic_mode_skips_service_check() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            storage_provider(1, &journal, false),
            storage_consumer(ServiceMode::Dynamic, &journal),
        ],
    );

    kernel.lifecycle().start_to_level(2).unwrap();
    assert_eq!(kernel.lifecycle().state(&id("d")), ModuleState::Active);
}

#[test]
fn test_stop_to_level_stops_higher_levels_in_reverse() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            TestModule::new(descriptor("a", 1), &journal).into_arc(),
            TestModule::new(descriptor_requiring("b", 2, &["a"]), &journal).into_arc(),
            TestModule::new(descriptor_requiring("c", 2, &["b"]), &journal).into_arc(),
        ],
    );
    kernel.lifecycle().start_to_level(2).unwrap();
    journal.clear();

    kernel.lifecycle().stop_to_level(1);
    assert_eq!(journal.entries(), vec!["stop:c", "stop:b"]);
    assert_eq!(kernel.lifecycle().state(&id("a")), ModuleState::Active);

    kernel.lifecycle().stop_all();
    assert_eq!(journal.entries(), vec!["stop:c", "stop:b", "stop:a"]);
}

#[test]
fn test_stop_failures_are_absorbed() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            TestModule::new(descriptor("a", 1), &journal).into_arc(),
            TestModule::new(descriptor("stubborn", 2), &journal)
                .failing_stop()
                .into_arc(),
        ],
    );
    kernel.lifecycle().start_all().unwrap();

    kernel.lifecycle().stop_all();

    assert_eq!(kernel.lifecycle().state(&id("stubborn")), ModuleState::Failed);
    assert_eq!(kernel.lifecycle().state(&id("a")), ModuleState::Resolved);
    assert_eq!(journal.with_prefix("stop:"), vec!["stop:stubborn", "stop:a"]);
}

#[test]
fn test_module_timeout_fails_the_pass() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = test_kernel_builder(Arc::clone(&storage))
        .module_timeout(Duration::from_millis(50))
        .module(
            TestModule::new(descriptor("slow", 1), &journal)
                .with_start_delay(Duration::from_millis(500))
                .into_arc(),
        )
        .build()
        .unwrap();

    let failure = kernel.lifecycle().start_to_level(1).unwrap_err();

    assert_eq!(failure.module_id(), &id("slow"));
    assert!(failure.chain()[1].starts_with("Timeout:"));
    assert!(matches!(
        std::error::Error::source(&failure)
            .and_then(|e| e.downcast_ref::<ModuleError>()),
        Some(ModuleError::Timeout { .. })
    ));
    assert_eq!(kernel.lifecycle().state(&id("slow")), ModuleState::Failed);
}

#[derive(Default)]
struct HookRecorder {
    journal: Journal,
}

impl KernelHook for HookRecorder {
    fn after_plan(&self, plan: &Plan) -> anyhow::Result<()> {
        self.journal
            .record(format!("plan:{}", plan.start_order.len()));
        Ok(())
    }

    fn before_start(&self, module_id: &ModuleId) -> anyhow::Result<()> {
        self.journal.record(format!("before:{module_id}"));
        anyhow::bail!("observer failures are ignored")
    }

    fn after_start(&self, module_id: &ModuleId) -> anyhow::Result<()> {
        self.journal.record(format!("after:{module_id}"));
        Ok(())
    }

    fn on_failure(&self, module_id: &ModuleId, error: &ModuleError) -> anyhow::Result<()> {
        self.journal.record(format!("failure:{module_id}:{}", error.kind()));
        Ok(())
    }
}

#[test]
fn test_hooks_observe_every_stage() {
    let journal = Journal::new();
    let storage = memory_storage();
    let kernel = kernel(
        &storage,
        vec![
            TestModule::new(descriptor("a", 1), &journal).into_arc(),
            TestModule::new(descriptor("z", 1), &journal)
                .failing_start()
                .into_arc(),
        ],
    );
    kernel
        .services()
        .register::<dyn KernelHook>(
            &id("observer"),
            Arc::new(HookRecorder {
                journal: journal.clone(),
            }),
            false,
        )
        .unwrap();

    assert!(kernel.lifecycle().start_to_level(1).is_err());

    assert_eq!(
        journal.entries(),
        vec![
            "plan:2",
            "before:a",
            "start:a",
            "after:a",
            "before:z",
            "fail:z",
            "failure:z:ModuleError",
            "stop:a",
        ]
    );
}

struct Plugin {
    started: AtomicBool,
    broken: bool,
}

impl LegacyPlugin for Plugin {
    fn start_plugin(&self) -> anyhow::Result<()> {
        if self.broken {
            anyhow::bail!("plugin jar missing");
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_plugin(&self) -> anyhow::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_legacy_plugin_runs_as_module() {
    let storage = memory_storage();
    let legacy = Arc::new(LegacyPluginModule::new(
        descriptor("legacy", 1),
        Plugin {
            started: AtomicBool::new(false),
            broken: false,
        },
    ));
    let kernel = test_kernel_builder(Arc::clone(&storage))
        .module(Arc::clone(&legacy) as Arc<dyn strata_kernel::module::Module>)
        .build()
        .unwrap();

    kernel.lifecycle().start_to_level(1).unwrap();
    assert!(legacy.plugin().started.load(Ordering::SeqCst));

    kernel.lifecycle().stop_all();
    assert!(!legacy.plugin().started.load(Ordering::SeqCst));
}

#[test]
fn test_legacy_plugin_failure_is_reported() {
    let storage = memory_storage();
    let kernel = test_kernel_builder(Arc::clone(&storage))
        .module(Arc::new(LegacyPluginModule::new(
            descriptor("legacy", 1),
            Plugin {
                started: AtomicBool::new(false),
                broken: true,
            },
        )))
        .build()
        .unwrap();

    let failure = kernel.lifecycle().start_to_level(1).unwrap_err();
    assert_eq!(failure.chain()[1], "Error: plugin jar missing");
}

#[test]
fn test_context_exposes_kernel_services() {
    let journal = Journal::new();
    let storage = memory_storage();
    let seen = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&seen);
    let kernel = kernel(
        &storage,
        vec![TestModule::new(descriptor("scout", 1), &journal)
            .on_start(move |ctx| {
                let store = ctx.service::<dyn KernelStorage>()?;
                let props = ctx.service::<strata_kernel::config::KernelProps>()?;
                flag.store(store.is_some() && props.is_some(), Ordering::SeqCst);
                assert!(ctx.data_dir().ends_with("modules/scout"));
                Ok(())
            })
            .into_arc()],
    );

    kernel.lifecycle().start_to_level(1).unwrap();
    assert!(seen.load(Ordering::SeqCst));
}
