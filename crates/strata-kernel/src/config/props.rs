//! Layered kernel properties.
//!
//! Precedence, lowest first: built-in defaults, environment, properties
//! file, explicit overrides. Every value remembers where it came from so the
//! startup report can show it.

use super::ConfigError;
use ::config::{Config, Environment, File, FileFormat, Source, Value, ValueKind};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Well-known property keys.
pub mod keys {
    pub const HOME: &str = "strata.kernel.home";
    pub const READ_ONLY: &str = "strata.kernel.readOnly";
    pub const TARGET_LEVEL: &str = "strata.kernel.targetLevel";
    pub const PROPS_FILE: &str = "strata.kernel.propsFile";
    pub const EVENTS_CAPACITY: &str = "strata.kernel.events.capacity";

    pub const DEBUG_LIFECYCLE: &str = "debug.lifecycle";
    pub const DEBUG_MODULES: &str = "debug.modules";
    pub const DEBUG_EVENTS: &str = "debug.events";
    pub const DEBUG_SERVICES: &str = "debug.services";

    /// Prefix of every kernel property.
    pub const KERNEL_PREFIX: &str = "strata.kernel.";
    /// Prefix of debug flags.
    pub const DEBUG_PREFIX: &str = "debug.";
}

const DEFAULT_TARGET_LEVEL: u32 = 10;
const DEFAULT_EVENTS_CAPACITY: u64 = 1024;

/// Environment prefixes and the key prefix each one maps to.
const ENV_LAYERS: [(&str, &str); 2] = [("STRATA", "strata"), ("DEBUG", "debug")];

/// Layered keys matching one of these ignoring case and separators are
/// stored under the listed spelling.
const KNOWN_KEYS: [&str; 9] = [
    keys::HOME,
    keys::READ_ONLY,
    keys::TARGET_LEVEL,
    keys::PROPS_FILE,
    keys::EVENTS_CAPACITY,
    keys::DEBUG_LIFECYCLE,
    keys::DEBUG_MODULES,
    keys::DEBUG_EVENTS,
    keys::DEBUG_SERVICES,
];

/// Where a property value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropSource {
    Default,
    Env,
    File,
    Override,
}

impl PropSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PropSource::Default => "DEFAULT",
            PropSource::Env => "ENV",
            PropSource::File => "FILE",
            PropSource::Override => "OVERRIDE",
        }
    }
}

impl fmt::Display for PropSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PropValue {
    value: String,
    source: PropSource,
}

/// Resolved kernel properties with provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelProps {
    values: BTreeMap<String, PropValue>,
}

impl KernelProps {
    /// Load from the process environment, the configured properties file and
    /// `overrides`.
    #[must_use]
    pub fn load(overrides: &BTreeMap<String, String>) -> Self {
        Self::from_sources(std::env::vars(), overrides)
    }

    /// Load from an explicit environment.
    ///
    /// Each source is read as its own layer; a layer that cannot be read or
    /// parsed is logged and skipped.
    #[must_use]
    pub fn from_sources<I>(env: I, overrides: &BTreeMap<String, String>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut props = Self::default();
        props.apply(PropSource::Default, "", defaults_layer());

        let env: Vec<(String, String)> = env.into_iter().collect();
        for (env_prefix, key_prefix) in ENV_LAYERS {
            props.apply(PropSource::Env, key_prefix, env_layer(&env, env_prefix));
        }

        let file = overrides
            .get(keys::PROPS_FILE)
            .map(String::as_str)
            .or_else(|| props.get_string(keys::PROPS_FILE))
            .map(PathBuf::from);
        if let Some(path) = file {
            props.apply(PropSource::File, "", file_layer(&path));
        }

        props.apply(PropSource::Override, "", override_layer(overrides));
        props
    }

    fn apply(
        &mut self,
        source: PropSource,
        prefix: &str,
        layer: Result<Config, ::config::ConfigError>,
    ) {
        let table = layer.and_then(|config| config.collect()).map_err(|err| ConfigError::Layer {
            layer: source,
            source: err,
        });
        match table {
            Ok(table) => {
                let mut entries = Vec::new();
                for (key, value) in &table {
                    flatten(&join(prefix, key), value, &mut entries);
                }
                for (key, value) in entries {
                    self.set(canonical_key(&key), value, source);
                }
            }
            Err(err) => warn!(error = %err, "properties layer ignored"),
        }
    }

    fn set(&mut self, key: impl Into<String>, value: impl Into<String>, source: PropSource) {
        self.values.insert(
            key.into(),
            PropValue {
                value: value.into(),
                source,
            },
        );
    }

    /// Raw value of `key`.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.value.as_str())
    }

    /// Where the value of `key` came from.
    #[must_use]
    pub fn source(&self, key: &str) -> Option<PropSource> {
        self.values.get(key).map(|v| v.source)
    }

    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_string(key).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => false,
            _ => default,
        }
    }

    #[must_use]
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.parse_or(key, default)
    }

    #[must_use]
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.parse_or(key, default)
    }

    #[must_use]
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get_string(key)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    }

    fn parse_or<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + Copy + fmt::Display,
    {
        let Some(raw) = self.get_string(key) else {
            return default;
        };
        raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = raw, fallback = %default, "invalid property value");
            default
        })
    }

    /// Kernel home directory.
    #[must_use]
    pub fn home_dir(&self) -> PathBuf {
        self.get_path(keys::HOME)
            .unwrap_or_else(|| PathBuf::from(".strata/kernel"))
    }

    #[must_use]
    pub fn read_only(&self) -> bool {
        self.get_bool(keys::READ_ONLY, false)
    }

    /// Start level the launcher aims for when no level is given explicitly.
    #[must_use]
    pub fn target_level(&self) -> u32 {
        self.get_u32(keys::TARGET_LEVEL, DEFAULT_TARGET_LEVEL)
    }

    /// Per-topic buffer of the local event bus.
    #[must_use]
    pub fn events_capacity(&self) -> usize {
        usize::try_from(self.get_u64(keys::EVENTS_CAPACITY, DEFAULT_EVENTS_CAPACITY))
            .unwrap_or(usize::MAX)
            .max(1)
    }

    #[must_use]
    pub fn debug_flags(&self) -> DebugFlags {
        DebugFlags {
            lifecycle: self.get_bool(keys::DEBUG_LIFECYCLE, false),
            modules: self.get_bool(keys::DEBUG_MODULES, false),
            events: self.get_bool(keys::DEBUG_EVENTS, false),
            services: self.get_bool(keys::DEBUG_SERVICES, false),
        }
    }

    /// Printable listing of the kernel and debug properties.
    #[must_use]
    pub fn report(&self) -> KernelPropsReport<'_> {
        KernelPropsReport(self)
    }
}

/// Startup listing of `strata.kernel.*` and `debug.*` properties with their
/// sources.
#[derive(Debug, Clone, Copy)]
pub struct KernelPropsReport<'a>(&'a KernelProps);

impl fmt::Display for KernelPropsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Kernel properties:")?;
        for (key, prop) in &self.0.values {
            if key.starts_with(keys::KERNEL_PREFIX) || key.starts_with(keys::DEBUG_PREFIX) {
                writeln!(f, " - {key}={} [{}]", prop.value, prop.source)?;
            }
        }
        Ok(())
    }
}

/// Opt-in diagnostic verbosity switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags {
    pub lifecycle: bool,
    pub modules: bool,
    pub events: bool,
    pub services: bool,
}

fn defaults_layer() -> Result<Config, ::config::ConfigError> {
    let home = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
        .join("kernel");

    let mut builder = Config::builder()
        .set_default(keys::HOME, home.display().to_string())?
        .set_default(keys::READ_ONLY, "false")?
        .set_default(keys::TARGET_LEVEL, DEFAULT_TARGET_LEVEL.to_string())?
        .set_default(keys::EVENTS_CAPACITY, DEFAULT_EVENTS_CAPACITY.to_string())?;
    for flag in [
        keys::DEBUG_LIFECYCLE,
        keys::DEBUG_MODULES,
        keys::DEBUG_EVENTS,
        keys::DEBUG_SERVICES,
    ] {
        builder = builder.set_default(flag, "false")?;
    }
    builder.build()
}

/// `PREFIX_A_B` variables become `a.b` under the prefix. Names with empty
/// segments are not addressable and are left out.
fn env_layer(env: &[(String, String)], prefix: &str) -> Result<Config, ::config::ConfigError> {
    let vars: ::config::Map<String, String> = env
        .iter()
        .filter(|(name, _)| {
            name.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|rest| rest.split('_').all(|part| !part.is_empty()))
        })
        .cloned()
        .collect();

    Config::builder()
        .add_source(
            Environment::with_prefix(prefix)
                .separator("_")
                .source(Some(vars)),
        )
        .build()
}

fn file_layer(path: &Path) -> Result<Config, ::config::ConfigError> {
    Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(true))
        .build()
}

fn override_layer(overrides: &BTreeMap<String, String>) -> Result<Config, ::config::ConfigError> {
    let mut builder = Config::builder();
    for (key, value) in overrides {
        builder = builder.set_override(key.as_str(), value.as_str())?;
    }
    builder.build()
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn flatten(key: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match &value.kind {
        ValueKind::Table(table) => {
            for (child_key, child) in table {
                flatten(&join(key, child_key), child, out);
            }
        }
        ValueKind::Array(items) => {
            let joined = items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.push((key.to_string(), joined));
        }
        ValueKind::Nil => {}
        _ => out.push((key.to_string(), value.to_string())),
    }
}

fn canonical_key(key: &str) -> String {
    let folded = fold(key);
    KNOWN_KEYS
        .iter()
        .find(|known| fold(known) == folded)
        .map_or_else(|| key.to_string(), |known| (*known).to_string())
}

fn fold(key: &str) -> String {
    key.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
