use pretty_assertions::assert_eq;
use std::fs;
use std::sync::Arc;
use strata_kernel::storage::{
    FileKernelStorage, KernelState, KernelStorage, MemoryKernelStorage, StorageError,
};
use strata_kernel::Kernel;
use strata_test_utils::{descriptor, id, props_for, temp_storage, Journal, TestModule};
use tempfile::TempDir;

#[test]
fn test_missing_file_loads_default_state() {
    let (_dir, storage) = temp_storage();
    let state = storage.load_state().unwrap();
    assert_eq!(state.current_level, 0);
    assert!(state.last_start_order.is_empty());
    assert!(!storage.state_file().exists());
}

#[test]
fn test_file_round_trip_stamps_update_time() {
    let (_dir, storage) = temp_storage();
    let mut state = KernelState {
        current_level: 3,
        target_level: 7,
        last_start_order: vec!["a".into(), "b".into()],
        last_failure_chain: vec!["module=b".into()],
        ..KernelState::default()
    };
    state.module_states.insert("a".into(), "ACTIVE".into());
    let before = state.updated_at;

    storage.save_state(&state).unwrap();
    let loaded = storage.load_state().unwrap();

    assert!(loaded.updated_at >= before);
    assert_eq!(loaded.current_level, 3);
    assert_eq!(loaded.target_level, 7);
    assert_eq!(loaded.last_start_order, state.last_start_order);
    assert_eq!(loaded.last_failure_chain, state.last_failure_chain);
    assert_eq!(loaded.module_states, state.module_states);

    let raw = fs::read_to_string(storage.state_file()).unwrap();
    assert!(raw.contains("\"targetLevel\": 7"));
}

#[test]
fn test_read_only_store_discards_writes() {
    let dir = TempDir::new().unwrap();
    let home = dir.path().join("home");
    let storage = FileKernelStorage::new(&home, true);

    storage
        .save_state(&KernelState {
            target_level: 9,
            ..KernelState::default()
        })
        .unwrap();
    let data_dir = storage.module_data_dir(&id("web")).unwrap();

    assert!(!home.exists());
    assert_eq!(data_dir, home.join("modules").join("web"));
    assert_eq!(storage.load_state().unwrap().target_level, 0);
}

#[test]
fn test_module_dirs_are_created_and_sanitized() {
    let (dir, storage) = temp_storage();
    let data_dir = storage.module_data_dir(&id("acme/web app")).unwrap();

    assert_eq!(data_dir, dir.path().join("modules").join("acme_web_app"));
    assert!(data_dir.is_dir());
}

#[test]
fn test_corrupt_file_is_an_error_and_empty_file_is_default() {
    let (_dir, storage) = temp_storage();

    fs::write(storage.state_file(), "{ not json").unwrap();
    assert!(matches!(storage.load_state(), Err(StorageError::Json { .. })));

    fs::write(storage.state_file(), "  \n").unwrap();
    assert_eq!(storage.load_state().unwrap().target_level, 0);
}

#[test]
fn test_unknown_fields_and_negative_levels_are_tolerated() {
    let (_dir, storage) = temp_storage();
    fs::write(
        storage.state_file(),
        r#"{"currentLevel": -1, "targetLevel": 4, "extra": true, "moduleStates": {"a": "ACTIVE"}}"#,
    )
    .unwrap();

    let state = storage.load_state().unwrap();
    assert_eq!(state.current_level, 0);
    assert_eq!(state.target_level, 4);
    assert_eq!(state.module_states["a"], "ACTIVE");
}

#[test]
fn test_memory_store_counts_accepted_writes() {
    let writable = MemoryKernelStorage::new();
    writable.save_state(&KernelState::default()).unwrap();
    assert_eq!(writable.saves(), 1);

    let read_only = MemoryKernelStorage::with_home("/nonexistent", true);
    read_only.save_state(&KernelState::default()).unwrap();
    assert_eq!(read_only.saves(), 0);
    assert!(read_only.is_read_only());
}

#[test]
fn test_kernel_persists_through_file_store() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::new();

    {
        let kernel = Kernel::builder()
            .props(props_for(dir.path()))
            .module(Arc::new(TestModule::new(descriptor("a", 1), &journal)))
            .build()
            .unwrap();
        kernel.set_target_level(1).unwrap();
        kernel.start_levels().sync().unwrap();
        assert_eq!(kernel.start_levels().current_level(), 1);
        kernel.close();
    }

    let storage = FileKernelStorage::new(dir.path(), false);
    let state = storage.load_state().unwrap();
    assert_eq!(state.target_level, 1);
    assert_eq!(state.current_level, 0);
    assert_eq!(state.last_start_order, vec!["a"]);
    assert_eq!(state.module_states["a"], "RESOLVED");
    assert!(dir.path().join("modules").join("a").is_dir());
}
