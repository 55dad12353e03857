use std::sync::Arc;
use std::time::Duration;
use strata_kernel::config::{DebugFlags, KernelProps};
use strata_kernel::events::EventBus;
use strata_kernel::services::ServiceError;
use strata_kernel::startlevel::StartLevelController;
use strata_kernel::storage::KernelStorage;
use strata_kernel::{KernelError, ModuleId};
use strata_test_utils::{
    descriptor, descriptor_requiring, id, memory_storage, test_kernel_builder, Journal,
    TestModule,
};

#[test]
fn test_duplicate_module_ids_are_rejected() {
    let journal = Journal::new();
    let result = test_kernel_builder(memory_storage())
        .module(TestModule::new(descriptor("a", 1), &journal).into_arc())
        .module(TestModule::new(descriptor("a", 2), &journal).into_arc())
        .build();

    assert!(matches!(result, Err(KernelError::ModuleRegistry(_))));
}

#[test]
fn test_kernel_services_are_exclusive() {
    let kernel = test_kernel_builder(memory_storage()).build().unwrap();
    let services = kernel.services();

    assert!(services.has::<KernelProps>());
    assert!(services.has::<DebugFlags>());
    assert!(services.has::<dyn KernelStorage>());
    assert!(services.has::<StartLevelController>());

    let clash = services.register::<KernelProps>(&id("rogue"), Arc::new(KernelProps::default()), false);
    assert!(matches!(clash, Err(ServiceError::ExclusivityViolation { .. })));
}

#[test]
fn test_close_releases_controller_registration() {
    let kernel = test_kernel_builder(memory_storage()).build().unwrap();
    kernel.close();

    assert!(!kernel.services().has::<StartLevelController>());
    assert!(kernel.services().has::<KernelProps>());
}

#[test]
fn test_late_registration_is_planned_on_next_pass() {
    let journal = Journal::new();
    let kernel = test_kernel_builder(memory_storage())
        .module(TestModule::new(descriptor("a", 1), &journal).into_arc())
        .build()
        .unwrap();
    kernel.set_target_level(1).unwrap();
    kernel.start_levels().sync().unwrap();

    kernel
        .register_module(TestModule::new(descriptor_requiring("b", 2, &["a"]), &journal).into_arc())
        .unwrap();
    assert_eq!(kernel.diagnostics().start_order().len(), 2);

    kernel.set_target_level(2).unwrap();
    kernel.start_levels().sync().unwrap();
    assert_eq!(journal.entries(), vec!["start:a", "start:b"]);
}

#[test]
fn test_diagnostics_text_lists_findings() {
    let journal = Journal::new();
    let kernel = test_kernel_builder(memory_storage())
        .module(TestModule::new(descriptor_requiring("low", 1, &["high"]), &journal).into_arc())
        .module(TestModule::new(descriptor("high", 3), &journal).into_arc())
        .build()
        .unwrap();

    let text = kernel.diagnostics().to_string();
    assert!(text.contains("Conflicts:\n - StartLevel conflict: low(level 1) requires high(level 3)\n"));
}

#[tokio::test]
async fn test_modules_publish_through_the_bus() {
    let journal = Journal::new();
    let kernel = test_kernel_builder(memory_storage())
        .module(
            TestModule::new(descriptor("publisher", 1), &journal)
                .on_start(|ctx| {
                    ctx.events()
                        .publish("modules.started", serde_json::json!({ "id": ctx.module_id().as_str() }));
                    Ok(())
                })
                .into_arc(),
        )
        .build()
        .unwrap();
    let kernel = Arc::new(kernel);
    let mut subscription = kernel.events().subscribe("modules.started");

    let driver = Arc::clone(&kernel);
    tokio::task::spawn_blocking(move || {
        driver.set_target_level(1).unwrap();
        driver.start_levels().sync().unwrap();
    })
    .await
    .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.payload["id"], "publisher");

    let closing = Arc::clone(&kernel);
    tokio::task::spawn_blocking(move || closing.close()).await.unwrap();
    assert_eq!(kernel.events().publish("modules.started", serde_json::Value::Null), 0);
    assert_eq!(kernel.start_levels().module_level(&ModuleId::kernel()), None);
}
