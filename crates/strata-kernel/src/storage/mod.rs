//! Durable kernel state.
//!
//! The kernel persists one small record ([`KernelState`]) as a whole and
//! hands each module a private directory. Stores are owned by exactly one
//! kernel process; writes are last-writer-wins.

mod file;
mod memory;

pub use file::FileKernelStorage;
pub use memory::MemoryKernelStorage;

use crate::types::ModuleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Errors from a state store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt kernel state at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted orchestration checkpoint.
///
/// Serialized as a flat JSON object with camelCase field names. Negative
/// levels found on disk are clamped to 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelState {
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "clamped_level")]
    pub current_level: u32,
    #[serde(default, deserialize_with = "clamped_level")]
    pub target_level: u32,
    #[serde(default)]
    pub last_start_order: Vec<String>,
    #[serde(default)]
    pub last_failure_chain: Vec<String>,
    #[serde(default)]
    pub module_states: BTreeMap<String, String>,
}

impl Default for KernelState {
    fn default() -> Self {
        Self {
            updated_at: Utc::now(),
            current_level: 0,
            target_level: 0,
            last_start_order: Vec::new(),
            last_failure_chain: Vec::new(),
            module_states: BTreeMap::new(),
        }
    }
}

fn clamped_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let raw = Option::<i64>::deserialize(deserializer)?.unwrap_or(0);
    Ok(u32::try_from(raw.max(0)).unwrap_or(u32::MAX))
}

/// Contract of a kernel state store.
pub trait KernelStorage: Send + Sync {
    /// Read the state record. A missing record is the default state.
    ///
    /// # Errors
    /// The record exists but cannot be read or parsed.
    fn load_state(&self) -> Result<KernelState, StorageError>;

    /// Replace the state record, stamping `updated_at`. A read-only store
    /// accepts and discards the write.
    ///
    /// # Errors
    /// The record cannot be written.
    fn save_state(&self, state: &KernelState) -> Result<(), StorageError>;

    /// Private directory of `module_id`, created unless the store is
    /// read-only.
    ///
    /// # Errors
    /// The directory cannot be created.
    fn module_data_dir(&self, module_id: &ModuleId) -> Result<PathBuf, StorageError>;

    fn home_dir(&self) -> &Path;

    fn is_read_only(&self) -> bool;
}

/// Load the record, treating an unreadable one as the default state.
pub(crate) fn load_or_default(storage: &dyn KernelStorage) -> KernelState {
    storage.load_state().unwrap_or_else(|err| {
        warn!(error = %err, "kernel state unreadable, starting from defaults");
        KernelState::default()
    })
}

/// Read-modify-write the whole record; failures are logged.
pub(crate) fn update_state(storage: &dyn KernelStorage, mutate: impl FnOnce(&mut KernelState)) {
    let mut state = load_or_default(storage);
    mutate(&mut state);
    if let Err(err) = storage.save_state(&state) {
        warn!(error = %err, "kernel state not persisted");
    }
}

/// Directory-safe form of a module id: letters, digits, `.`, `-` and `_`
/// are kept, anything else becomes `_`.
#[must_use]
pub fn sanitize_module_dir(module_id: &ModuleId) -> String {
    module_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flat_camel_case_shape() {
        let mut state = KernelState {
            current_level: 2,
            target_level: 5,
            last_start_order: vec!["a".into(), "b".into()],
            ..KernelState::default()
        };
        state.module_states.insert("a".into(), "ACTIVE".into());

        let json: serde_json::Value = serde_json::to_value(&state).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "currentLevel",
                "lastFailureChain",
                "lastStartOrder",
                "moduleStates",
                "targetLevel",
                "updatedAt",
            ]
        );
        assert_eq!(json["moduleStates"]["a"], "ACTIVE");
    }

    #[test]
    fn test_negative_and_missing_levels_clamp() {
        let state: KernelState =
            serde_json::from_str(r#"{"currentLevel": -4, "lastStartOrder": ["x"]}"#).unwrap();
        assert_eq!(state.current_level, 0);
        assert_eq!(state.target_level, 0);
        assert_eq!(state.last_start_order, vec!["x".to_string()]);
        assert!(state.last_failure_chain.is_empty());
    }

    #[test]
    fn test_sanitize_module_dir() {
        let id = ModuleId::new("acme/web app:v2").unwrap();
        assert_eq!(sanitize_module_dir(&id), "acme_web_app_v2");
        let id = ModuleId::new("core.net-io_1").unwrap();
        assert_eq!(sanitize_module_dir(&id), "core.net-io_1");
    }
}
