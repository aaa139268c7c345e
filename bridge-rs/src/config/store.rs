/**
 * store.rs
 * Loads, validates and serves the bridge configuration.
 *
 * Relative paths in the file (library paths, import/export allowed_paths,
 * the worker script) resolve against the directory containing the config
 * file, so a config tree can be relocated wholesale.
 */

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::model::{GlobalSettings, LibraryConfig, Permissions};
use crate::errors::{BridgeError, Result};

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    globals: GlobalSettings,
    #[serde(default)]
    libraries: BTreeMap<String, LibraryConfig>,
}

/// Read-only summary of a library for listings, without paths.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LibrarySummary {
    pub name: String,
    pub permissions: Permissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub default: bool,
}

/// Immutable view of the loaded configuration.
pub struct ConfigStore {
    libraries: BTreeMap<String, Arc<LibraryConfig>>,
    globals: Arc<GlobalSettings>,
    default_library: Option<String>,
}

impl ConfigStore {
    /// Load and validate a config file.
    ///
    /// # Arguments
    /// * `path` - Path to the JSON config file
    ///
    /// # Returns
    /// A validated store, or `BridgeError::Config` describing the first
    /// problem found.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("failed to parse {}: {}", path.display(), e)))?;

        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::from_parts(file.globals, file.libraries, &config_dir)
    }

    /// Build a store from already-parsed parts. Used by `load` and by tests.
    pub fn from_parts(
        mut globals: GlobalSettings,
        libraries: BTreeMap<String, LibraryConfig>,
        config_dir: &Path,
    ) -> Result<Self> {
        if libraries.is_empty() {
            return Err(BridgeError::Config(
                "config declares no libraries".to_string(),
            ));
        }

        if let Some(script) = globals.worker_script.take() {
            globals.worker_script = Some(resolve_path(config_dir, &script));
        }

        let mut resolved = BTreeMap::new();
        let mut seen_paths = HashSet::new();
        let mut default_library: Option<String> = None;

        for (name, mut lib) in libraries {
            if name.trim().is_empty() {
                return Err(BridgeError::Config("library name is empty".to_string()));
            }
            if lib.path.as_os_str().is_empty() {
                return Err(BridgeError::Config(format!(
                    "library '{}' has an empty path",
                    name
                )));
            }

            lib.name = name.clone();
            lib.path = resolve_path(config_dir, &lib.path);

            if !seen_paths.insert(lib.path.clone()) {
                return Err(BridgeError::Config(format!(
                    "library '{}' reuses the path {}",
                    name,
                    lib.path.display()
                )));
            }

            if let Some(imp) = lib.import.as_mut() {
                if imp.allowed_paths.is_empty() {
                    return Err(BridgeError::Config(format!(
                        "library '{}': import.allowed_paths is empty",
                        name
                    )));
                }
                for p in imp.allowed_paths.iter_mut() {
                    if p.as_os_str().is_empty() {
                        return Err(BridgeError::Config(format!(
                            "library '{}': import.allowed_paths contains an empty entry",
                            name
                        )));
                    }
                    *p = resolve_path(config_dir, p);
                }
            }
            if let Some(exp) = lib.export.as_mut() {
                if exp.allowed_paths.is_empty() {
                    return Err(BridgeError::Config(format!(
                        "library '{}': export.allowed_paths is empty",
                        name
                    )));
                }
                for p in exp.allowed_paths.iter_mut() {
                    if p.as_os_str().is_empty() {
                        return Err(BridgeError::Config(format!(
                            "library '{}': export.allowed_paths contains an empty entry",
                            name
                        )));
                    }
                    *p = resolve_path(config_dir, p);
                }
            }

            if lib.default {
                if let Some(existing) = &default_library {
                    return Err(BridgeError::Config(format!(
                        "both '{}' and '{}' are marked default",
                        existing, name
                    )));
                }
                default_library = Some(name.clone());
            }

            resolved.insert(name, Arc::new(lib));
        }

        Ok(ConfigStore {
            libraries: resolved,
            globals: Arc::new(globals),
            default_library,
        })
    }

    /// Resolve a library by name, or the marked default when no name is
    /// given. Resolution never falls back to an arbitrary library.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<LibraryConfig>> {
        let name = match name {
            Some(n) => n,
            None => self.default_library.as_deref().ok_or_else(|| {
                BridgeError::LibraryNotFound(
                    "no library specified and no default is configured".to_string(),
                )
            })?,
        };

        self.libraries
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::LibraryNotFound(name.to_string()))
    }

    pub fn globals(&self) -> Arc<GlobalSettings> {
        Arc::clone(&self.globals)
    }

    pub fn library_names(&self) -> Vec<String> {
        self.libraries.keys().cloned().collect()
    }

    /// Summaries for the library listing. Deliberately excludes
    /// filesystem paths.
    pub fn list_libraries(&self) -> Vec<LibrarySummary> {
        self.libraries
            .values()
            .map(|lib| LibrarySummary {
                name: lib.name.clone(),
                permissions: lib.permissions.clone(),
                description: lib.description.clone(),
                default: lib.default,
            })
            .collect()
    }
}

fn resolve_path(config_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}
