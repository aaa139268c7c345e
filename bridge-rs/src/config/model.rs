/**
 * model.rs
 * Data model for the bridge configuration file (JSON format)
 *
 * Format:
 * ```json
 * {
 *   "worker_timeout": 300,
 *   "enable_worker_logging": false,
 *   "log_level": "none",
 *   "libraries": {
 *     "main": {
 *       "path": "libraries/main",
 *       "description": "Primary library",
 *       "default": true,
 *       "permissions": {
 *         "read": true,
 *         "write": ["tags", "rating"],
 *         "delete": false,
 *         "convert": true
 *       },
 *       "import": {"allowed_paths": ["inbox"], "allow_delete_source": false},
 *       "export": {"allowed_paths": ["outbox"], "allow_overwrite_destination": false}
 *     }
 *   }
 * }
 * ```
 */

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Field access rule: a blanket grant/deny or an explicit field whitelist.
///
/// In the config file this is either a boolean or an array of field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    AllFields,
    NoFields,
    FieldSet(BTreeSet<String>),
}

impl FieldRule {
    /// Whether a single named field is covered by this rule.
    pub fn allows(&self, field: &str) -> bool {
        match self {
            FieldRule::AllFields => true,
            FieldRule::NoFields => false,
            FieldRule::FieldSet(set) => set.contains(field),
        }
    }

    /// Whether every field in `fields` is covered by this rule.
    pub fn allows_all_of<'a, I: IntoIterator<Item = &'a str>>(&self, fields: I) -> bool {
        fields.into_iter().all(|f| self.allows(f))
    }

    /// Whether the rule grants access to at least something.
    pub fn allows_any(&self) -> bool {
        match self {
            FieldRule::AllFields => true,
            FieldRule::NoFields => false,
            FieldRule::FieldSet(set) => !set.is_empty(),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, FieldRule::AllFields)
    }
}

impl Default for FieldRule {
    fn default() -> Self {
        FieldRule::NoFields
    }
}

impl<'de> Deserialize<'de> for FieldRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Fields(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flag(true) => Ok(FieldRule::AllFields),
            Repr::Flag(false) => Ok(FieldRule::NoFields),
            Repr::Fields(fields) => {
                let set: BTreeSet<String> = fields.into_iter().collect();
                if set.iter().any(|f| f.trim().is_empty()) {
                    return Err(D::Error::custom("field rule contains an empty field name"));
                }
                Ok(FieldRule::FieldSet(set))
            }
        }
    }
}

impl Serialize for FieldRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldRule::AllFields => serializer.serialize_bool(true),
            FieldRule::NoFields => serializer.serialize_bool(false),
            FieldRule::FieldSet(set) => set.serialize(serializer),
        }
    }
}

/// Per-library permission block. Absent keys deny.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Permissions {
    #[serde(default)]
    pub read: FieldRule,
    #[serde(default)]
    pub write: FieldRule,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub convert: bool,
}

/// Import policy: where book files may be picked up from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportConfig {
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub allow_delete_source: bool,
}

/// Export policy: where book files may be written to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportConfig {
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub allow_overwrite_destination: bool,
}

/// One library entry, fully resolved. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Map key in the config file, injected during load.
    #[serde(default)]
    pub name: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportConfig>,
    /// Idle seconds before the library's worker is reclaimed.
    /// Falls back to the global setting; zero or absent on both
    /// levels means the worker never expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_timeout: Option<u64>,
}

impl LibraryConfig {
    /// Idle timeout for this library's worker, if any.
    pub fn idle_timeout(&self, globals: &GlobalSettings) -> Option<Duration> {
        let secs = self.worker_timeout.unwrap_or(globals.worker_timeout);
        if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        }
    }
}

fn default_call_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "none".to_string()
}

/// Top-level settings of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalSettings {
    /// Idle seconds before a worker is reclaimed. Zero means never.
    #[serde(default)]
    pub worker_timeout: u64,
    /// Ceiling in seconds for a single worker call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,
    /// Append worker stderr to a per-library log file under `logs/`.
    #[serde(default)]
    pub enable_worker_logging: bool,
    /// "none", "error", "warning", "info" or "debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Register read-only listings as callable actions for clients
    /// that cannot fetch resources. Forwarded to the outer transport.
    #[serde(default)]
    pub expose_resources_via_tools: bool,
    /// Worker script handed to calibre-debug. Relative paths resolve
    /// against the config file's directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_script: Option<PathBuf>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        GlobalSettings {
            worker_timeout: 0,
            call_timeout: default_call_timeout(),
            enable_worker_logging: false,
            log_level: default_log_level(),
            expose_resources_via_tools: false,
            worker_script: None,
        }
    }
}

impl GlobalSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout.max(1))
    }
}
