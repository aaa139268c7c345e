/**
 * enforcer.rs
 * Pure permission decisions over a library's config.
 *
 * Every decision is total and side-effect-free: config plus action in,
 * allow or a structured denial out. Nothing here touches the filesystem
 * or a worker process. A denial must be returned before any process
 * interaction happens; callers enforce that ordering.
 */

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use crate::config::model::LibraryConfig;
use crate::errors::BridgeError;

/// An operation a caller wants to perform against one library.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Read the named fields. An empty set means "whatever the engine
    /// returns by default" and only a blanket read denial blocks it.
    ReadFields(BTreeSet<String>),
    /// Write a single named field.
    WriteField(String),
    /// Write all of the named fields.
    WriteFields(BTreeSet<String>),
    Delete,
    Convert,
    ImportFrom {
        path: PathBuf,
        delete_source: bool,
    },
    ExportTo {
        path: PathBuf,
        overwrite: bool,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ReadFields(_) => "read",
            Action::WriteField(_) | Action::WriteFields(_) => "write",
            Action::Delete => "delete",
            Action::Convert => "convert",
            Action::ImportFrom { .. } => "import",
            Action::ExportTo { .. } => "export",
        }
    }
}

/// The specific rule an action failed against.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub action: String,
    pub library: String,
    pub rule: String,
}

impl Denial {
    fn new(action: &Action, lib: &LibraryConfig, rule: String) -> Self {
        Denial {
            action: action.name().to_string(),
            library: lib.name.clone(),
            rule,
        }
    }
}

impl From<Denial> for BridgeError {
    fn from(d: Denial) -> Self {
        BridgeError::PermissionDenied {
            action: d.action,
            rule: format!("library '{}': {}", d.library, d.rule),
        }
    }
}

/// Decide whether `action` is permitted against `lib`.
///
/// Field names in a configured list that match no real field are inert:
/// they grant nothing and never cause an error here.
pub fn check(lib: &LibraryConfig, action: &Action) -> Result<(), Denial> {
    let perms = &lib.permissions;

    match action {
        Action::ReadFields(fields) => {
            if fields.is_empty() {
                if !perms.read.allows_any() {
                    return Err(Denial::new(action, lib, "read access denied".to_string()));
                }
                return Ok(());
            }
            let denied: Vec<&str> = fields
                .iter()
                .filter(|f| !perms.read.allows(f))
                .map(String::as_str)
                .collect();
            if !denied.is_empty() {
                return Err(Denial::new(
                    action,
                    lib,
                    format!("read access denied for fields: {}", denied.join(", ")),
                ));
            }
            Ok(())
        }

        Action::WriteField(field) => {
            if !perms.write.allows(field) {
                return Err(Denial::new(
                    action,
                    lib,
                    format!("write access denied for field '{}'", field),
                ));
            }
            Ok(())
        }

        Action::WriteFields(fields) => {
            if fields.is_empty() {
                return Err(Denial::new(action, lib, "no fields to write".to_string()));
            }
            let denied: Vec<&str> = fields
                .iter()
                .filter(|f| !perms.write.allows(f))
                .map(String::as_str)
                .collect();
            if !denied.is_empty() {
                return Err(Denial::new(
                    action,
                    lib,
                    format!("write access denied for fields: {}", denied.join(", ")),
                ));
            }
            Ok(())
        }

        Action::Delete => {
            if !perms.delete {
                return Err(Denial::new(action, lib, "delete is not permitted".to_string()));
            }
            Ok(())
        }

        Action::Convert => {
            if !perms.convert {
                return Err(Denial::new(
                    action,
                    lib,
                    "convert is not permitted".to_string(),
                ));
            }
            Ok(())
        }

        Action::ImportFrom {
            path,
            delete_source,
        } => {
            let imp = lib.import.as_ref().ok_or_else(|| {
                Denial::new(action, lib, "import is not configured".to_string())
            })?;
            if !path_in_allowed(path, &imp.allowed_paths) {
                return Err(Denial::new(
                    action,
                    lib,
                    format!("path '{}' is not in allowed_paths", path.display()),
                ));
            }
            if *delete_source && !imp.allow_delete_source {
                return Err(Denial::new(
                    action,
                    lib,
                    "deleting the source file is not permitted".to_string(),
                ));
            }
            Ok(())
        }

        Action::ExportTo { path, overwrite } => {
            let exp = lib.export.as_ref().ok_or_else(|| {
                Denial::new(action, lib, "export is not configured".to_string())
            })?;
            if !path_in_allowed(path, &exp.allowed_paths) {
                return Err(Denial::new(
                    action,
                    lib,
                    format!("path '{}' is not in allowed_paths", path.display()),
                ));
            }
            if *overwrite && !exp.allow_overwrite_destination {
                return Err(Denial::new(
                    action,
                    lib,
                    "overwriting the destination is not permitted".to_string(),
                ));
            }
            Ok(())
        }
    }
}

/// Component-wise containment: `path` equals an allowed root or sits
/// beneath one. A plain string prefix is not enough ("/data/export2"
/// is outside "/data/export"), and `..` segments are normalized away
/// before comparison so they cannot escape a root.
fn path_in_allowed(path: &Path, allowed: &[PathBuf]) -> bool {
    let candidate = normalize(path);
    allowed.iter().any(|root| {
        let root = normalize(root);
        candidate.starts_with(&root)
    })
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}
