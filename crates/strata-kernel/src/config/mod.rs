//! Configuration surfaces.
//!
//! Two layers with different audiences:
//! - [`ConfigService`] / [`ConfigSnapshot`]: read-only key/value view handed
//!   to modules through their context.
//! - [`KernelProps`]: the kernel's own layered properties (home directory,
//!   read-only mode, target level, debug flags) with provenance.

mod props;

pub use props::{keys, DebugFlags, KernelProps, KernelPropsReport, PropSource};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Errors reading configuration sources.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{layer} properties unavailable: {source}")]
    Layer {
        layer: PropSource,
        #[source]
        source: ::config::ConfigError,
    },
}

/// Immutable view of configuration values at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    values: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    #[must_use]
    pub fn new(version: u64, loaded_at: DateTime<Utc>, values: BTreeMap<String, String>) -> Self {
        Self {
            version,
            loaded_at,
            values,
        }
    }

    /// Snapshot with no values, version 0.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, DateTime::<Utc>::UNIX_EPOCH, BTreeMap::new())
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    #[inline]
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Source of configuration snapshots.
pub trait ConfigService: Send + Sync {
    /// Latest loaded snapshot.
    fn snapshot(&self) -> Arc<ConfigSnapshot>;

    /// Re-read the underlying source and publish a new snapshot.
    fn reload(&self) -> Arc<ConfigSnapshot>;
}

/// Configuration from process environment variables plus explicit overrides.
///
/// Each variable is visible under its own name and under a lower-cased
/// dotted alias (`APP_HTTP_PORT` → `app.http.port`). Overrides win over both.
#[derive(Debug)]
pub struct EnvConfigService {
    overrides: BTreeMap<String, String>,
    version: AtomicU64,
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl EnvConfigService {
    /// Create the service and load the first snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::with_overrides(BTreeMap::new())
    }

    #[must_use]
    pub fn with_overrides(overrides: BTreeMap<String, String>) -> Self {
        let service = Self {
            overrides,
            version: AtomicU64::new(0),
            current: RwLock::new(Arc::new(ConfigSnapshot::empty())),
        };
        service.reload();
        service
    }
}

impl Default for EnvConfigService {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigService for EnvConfigService {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.read())
    }

    fn reload(&self) -> Arc<ConfigSnapshot> {
        let mut values = self.overrides.clone();
        for (key, value) in std::env::vars() {
            let dotted = key.to_lowercase().replace('_', ".");
            values.entry(key).or_insert_with(|| value.clone());
            values.entry(dotted).or_insert(value);
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(ConfigSnapshot::new(version, Utc::now(), values));
        *self.current.write() = Arc::clone(&snapshot);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_win_and_reload_bumps_version() {
        let mut overrides = BTreeMap::new();
        overrides.insert("path".to_string(), "overridden".to_string());
        let service = EnvConfigService::with_overrides(overrides);

        let first = service.snapshot();
        assert_eq!(first.version(), 1);
        assert_eq!(first.get("path"), Some("overridden"));

        let second = service.reload();
        assert_eq!(second.version(), 2);
        assert_eq!(service.snapshot().version(), 2);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ConfigSnapshot::empty();
        assert_eq!(snapshot.version(), 0);
        assert!(snapshot.values().is_empty());
        assert_eq!(snapshot.get("anything"), None);
    }
}
