//! Identity and state types shared by every subsystem.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Reserved owner id for services registered by the kernel itself.
pub const KERNEL_MODULE_ID: &str = "kernel";

/// Identity of a module.
///
/// Always trimmed and never empty. Equality, hashing and ordering are by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

impl ModuleId {
    /// Create a module id, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns [`InvalidModuleId`] if the value is empty after trimming.
    pub fn new(value: impl AsRef<str>) -> Result<Self, InvalidModuleId> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(InvalidModuleId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Id used for kernel-owned registrations and planning failures.
    #[must_use]
    pub fn kernel() -> Self {
        Self(KERNEL_MODULE_ID.to_string())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ModuleId {
    type Err = InvalidModuleId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ModuleId {
    type Error = InvalidModuleId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModuleId> for String {
    fn from(value: ModuleId) -> Self {
        value.0
    }
}

impl Borrow<str> for ModuleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A module id was blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("module id is empty")]
pub struct InvalidModuleId;

/// Lifecycle state of a module, owned by the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    Resolved,
    Starting,
    Active,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl ModuleState {
    /// Name used in the persisted `moduleStates` map.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Degraded => "DEGRADED",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Stopped => "STOPPED",
            ModuleState::Failed => "FAILED",
        }
    }

    /// Whether a stop sweep should act on a module in this state.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, ModuleState::Active | ModuleState::Starting)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How strictly a module's capability requirements are checked before start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceMode {
    /// Every non-optional capability must resolve before `start` is called.
    #[default]
    Static,
    /// The module probes for capabilities itself at runtime.
    Dynamic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_id_is_trimmed() {
        let id = ModuleId::new("  core.http ").unwrap();
        assert_eq!(id.as_str(), "core.http");
        assert_eq!(id, ModuleId::new("core.http").unwrap());
    }

    #[test]
    fn test_blank_module_id_is_rejected() {
        assert_eq!(ModuleId::new("   "), Err(InvalidModuleId));
        assert!("".parse::<ModuleId>().is_err());
    }

    #[test]
    fn test_module_id_serializes_as_plain_string() {
        let id = ModuleId::new("alpha").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alpha\"");
        assert!(serde_json::from_str::<ModuleId>("\" \"").is_err());
    }

    #[test]
    fn test_state_names_match_persisted_form() {
        assert_eq!(
            serde_json::to_string(&ModuleState::Active).unwrap(),
            "\"ACTIVE\""
        );
        assert_eq!(ModuleState::Failed.as_str(), "FAILED");
        assert!(ModuleState::Starting.is_running());
        assert!(!ModuleState::Resolved.is_running());
    }
}
