/**
 * dispatch.rs
 * Maps inbound actions to permission checks and worker methods.
 *
 * Every action resolves its library, passes the permission gate, and
 * only then touches the worker pool. A call that times out gets
 * exactly one automatic respawn-and-retry; engine errors pass through
 * untouched. Listing actions are answered locally without a worker.
 */

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::model::{LibraryConfig, Permissions};
use crate::config::store::ConfigStore;
use crate::errors::{BridgeError, Result};
use crate::permissions::{check, Action};
use crate::pool::WorkerPoolManager;
use crate::router::listings;

/// Preferred source formats, best first. Used when an export does not
/// name a format.
const SOURCE_FORMAT_PRIORITY: [&str; 12] = [
    "LIT", "MOBI", "AZW", "EPUB", "AZW3", "FB2", "DOCX", "HTML", "PRC", "RTF", "TXT", "PDF",
];

pub struct Router {
    config: Arc<ConfigStore>,
    pool: Arc<WorkerPoolManager>,
    // Library schemata never change while a worker pool lives
    schema_cache: StdMutex<HashMap<String, Value>>,
}

impl Router {
    pub fn new(config: Arc<ConfigStore>, pool: Arc<WorkerPoolManager>) -> Self {
        Router {
            config,
            pool,
            schema_cache: StdMutex::new(HashMap::new()),
        }
    }

    /// Handle one action against one (possibly defaulted) library.
    pub async fn dispatch(
        &self,
        action: &str,
        library: Option<&str>,
        params: Value,
    ) -> Result<Value> {
        match action {
            "list_libraries" => Ok(serde_json::to_value(self.config.list_libraries())?),
            "search_books" => self.search_books(library, params).await,
            "get_book_details" => self.get_book_details(library, params).await,
            "get_book_content" => self.read_content(library, params, "get_book_content").await,
            "search_book_content" => {
                self.read_content(library, params, "search_book_content").await
            }
            "fts_search" => self.fts_search(library, params).await,
            "get_library_schema" => self.get_library_schema(library).await,
            "get_field_values" => self.get_field_values(library, params).await,
            "update_book" => self.update_book(library, params).await,
            "bulk_update_metadata" => self.bulk_update_metadata(library, params).await,
            "delete_book" => self.delete_book(library, params).await,
            "convert_book" => self.convert_book(library, params).await,
            "add_book" => self.add_book(library, params).await,
            "export_book" => self.export_book(library, params).await,
            "list_importable_files" => self.list_importable(library).await,
            "list_exportable_files" => self.list_exportable(library).await,
            other => Err(BridgeError::Protocol(format!("unknown action '{}'", other))),
        }
    }

    /// One worker call with a single respawn-and-retry on timeout. The
    /// suspect worker is evicted when the first lease drops, so the
    /// second acquire starts a fresh process.
    async fn call_worker(
        &self,
        lib: &Arc<LibraryConfig>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let mut lease = self.pool.acquire(Arc::clone(lib)).await?;
        let first = lease.call(method, params.clone()).await;

        match first {
            Err(BridgeError::WorkerTimeout(msg)) => {
                warn!(library = %lib.name, method, "worker timed out, retrying on a fresh worker");
                drop(lease);
                let mut lease = self.pool.acquire(Arc::clone(lib)).await?;
                lease.call(method, params).await.map_err(|e| match e {
                    BridgeError::WorkerTimeout(second) => BridgeError::WorkerTimeout(format!(
                        "{} (after retry; first attempt: {})",
                        second, msg
                    )),
                    other => other,
                })
            }
            other => other,
        }
    }

    async fn search_books(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        check(&lib, &Action::ReadFields(fields_param(&params)))?;
        self.call_worker(&lib, "search_books", params).await
    }

    async fn get_book_details(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        check(&lib, &Action::ReadFields(fields_param(&params)))?;
        self.call_worker(&lib, "get_book_details", params).await
    }

    /// Content reads need blanket read access. The worker may convert
    /// on the fly to reach a readable format, so the library's convert
    /// grant rides along.
    async fn read_content(
        &self,
        library: Option<&str>,
        params: Value,
        method: &str,
    ) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        check(&lib, &Action::ReadFields(BTreeSet::new()))?;

        let mut params = into_object(params)?;
        params.insert("auto_convert".to_string(), json!(lib.permissions.convert));
        self.call_worker(&lib, method, Value::Object(params)).await
    }

    async fn fts_search(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        check(&lib, &Action::ReadFields(BTreeSet::new()))?;
        self.call_worker(&lib, "fts_search", params).await
    }

    async fn get_library_schema(&self, library: Option<&str>) -> Result<Value> {
        let lib = self.config.resolve(library)?;

        if let Some(cached) = lock_cache(&self.schema_cache).get(&lib.name) {
            return Ok(cached.clone());
        }

        let schema = self.call_worker(&lib, "get_library_schema", json!({})).await?;
        let filtered = filter_schema(schema, &lib.permissions);
        lock_cache(&self.schema_cache).insert(lib.name.clone(), filtered.clone());
        Ok(filtered)
    }

    async fn get_field_values(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        let field = str_param(&params, "field_name")?.to_string();
        check(&lib, &Action::ReadFields([field.clone()].into_iter().collect()))?;

        let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
        let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;

        let counts = self
            .call_worker(
                &lib,
                "get_field_value_counts",
                json!({
                    "field_name": field,
                    "book_ids": params.get("book_ids").cloned().unwrap_or(Value::Null),
                    "regex": params.get("value_filter").cloned().unwrap_or(Value::Null),
                }),
            )
            .await?;

        let Value::Object(counts) = counts else {
            return Err(BridgeError::Protocol(format!(
                "unexpected get_field_value_counts response: {}",
                counts
            )));
        };

        let mut items: Vec<(String, u64)> = counts
            .into_iter()
            .map(|(k, v)| (k, v.as_u64().unwrap_or(0)))
            .collect();
        items.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.to_lowercase().cmp(&b.0.to_lowercase()))
        });

        let total = items.len();
        let page: Vec<Value> = items
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(value, count)| json!({"value": value, "count": count}))
            .collect();

        Ok(json!({
            "field_name": field,
            "total_results": total,
            "offset": offset,
            "limit": limit,
            "results": page,
        }))
    }

    async fn update_book(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        let changed: BTreeSet<String> = params
            .get("changes")
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        check(&lib, &Action::WriteFields(changed))?;
        self.call_worker(&lib, "update_book", params).await
    }

    async fn bulk_update_metadata(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        let field = str_param(&params, "field_name")?.to_string();

        let old_value = params.get("old_value").filter(|v| !v.is_null());
        let new_value = params.get("new_value").filter(|v| !v.is_null());
        if old_value.is_none() && new_value.is_none() {
            return Err(BridgeError::Protocol(
                "bulk_update_metadata requires old_value or new_value".to_string(),
            ));
        }

        check(&lib, &Action::WriteField(field))?;
        self.call_worker(&lib, "bulk_update_metadata", params).await
    }

    async fn delete_book(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        check(&lib, &Action::Delete)?;
        self.call_worker(&lib, "delete_book", params).await
    }

    async fn convert_book(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        check(&lib, &Action::Convert)?;

        let target = str_param(&params, "target_format")?.to_uppercase();
        let book_id = params
            .get("book_id")
            .cloned()
            .ok_or_else(|| BridgeError::Protocol("missing parameter 'book_id'".to_string()))?;

        // Converting over an existing format destroys it, which takes
        // the delete grant. A failed formats lookup does not block the
        // conversion itself.
        match self.book_formats(&lib, book_id.clone()).await {
            Ok(formats) => {
                if formats.iter().any(|f| f.eq_ignore_ascii_case(&target))
                    && !lib.permissions.delete
                {
                    return Err(BridgeError::PermissionDenied {
                        action: "convert".to_string(),
                        rule: format!(
                            "library '{}': target format {} already exists and replacing it requires the delete permission",
                            lib.name, target
                        ),
                    });
                }
            }
            Err(e) => debug!(library = %lib.name, error = %e, "format lookup before convert failed"),
        }

        self.call_worker(
            &lib,
            "convert_book",
            json!({"book_id": book_id, "target_format": target}),
        )
        .await
    }

    async fn add_book(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        let path = PathBuf::from(str_param(&params, "file_path")?);
        let delete_source = params
            .get("delete_source")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        check(
            &lib,
            &Action::ImportFrom {
                path: path.clone(),
                delete_source,
            },
        )?;

        let result = self
            .call_worker(&lib, "add_book", json!({"file_paths": [path]}))
            .await?;

        let mut result = into_object(result)?;
        let succeeded = result.get("status").and_then(Value::as_str) == Some("success");
        if succeeded && delete_source {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    result.insert("source_deleted".to_string(), json!(true));
                }
                Err(e) => {
                    result.insert("source_deleted".to_string(), json!(false));
                    result.insert("source_deletion_error".to_string(), json!(e.to_string()));
                }
            }
        }
        Ok(Value::Object(result))
    }

    async fn export_book(&self, library: Option<&str>, params: Value) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        let destination = PathBuf::from(str_param(&params, "file_path")?);
        let book_id = params
            .get("book_id")
            .cloned()
            .ok_or_else(|| BridgeError::Protocol("missing parameter 'book_id'".to_string()))?;

        // Containment does not depend on the format, so the cheap gate
        // runs before any worker is touched.
        check(
            &lib,
            &Action::ExportTo {
                path: destination.clone(),
                overwrite: false,
            },
        )?;

        let format = match params.get("format").and_then(Value::as_str) {
            Some(f) => f.to_uppercase(),
            None => {
                let available = self.book_formats(&lib, book_id.clone()).await?;
                best_source_format(&available).ok_or_else(|| {
                    BridgeError::Protocol(format!(
                        "could not determine an export format for book {}",
                        book_id
                    ))
                })?
            }
        };

        let corrected = correct_extension(&destination, &format);
        let exists = tokio::fs::try_exists(&corrected).await.unwrap_or(false);
        check(
            &lib,
            &Action::ExportTo {
                path: corrected.clone(),
                overwrite: exists,
            },
        )?;

        let result = self
            .call_worker(
                &lib,
                "export_book",
                json!({"book_id": book_id, "format": format, "file_path": corrected}),
            )
            .await?;

        if corrected != destination {
            let mut result = into_object(result)?;
            result.insert(
                "info".to_string(),
                json!(format!(
                    "file written with corrected extension: {}",
                    corrected.display()
                )),
            );
            return Ok(Value::Object(result));
        }
        Ok(result)
    }

    async fn list_importable(&self, library: Option<&str>) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        let roots = lib
            .import
            .as_ref()
            .map(|c| c.allowed_paths.clone())
            .unwrap_or_default();
        Ok(serde_json::to_value(listings::list_files(&roots).await)?)
    }

    async fn list_exportable(&self, library: Option<&str>) -> Result<Value> {
        let lib = self.config.resolve(library)?;
        let roots = lib
            .export
            .as_ref()
            .map(|c| c.allowed_paths.clone())
            .unwrap_or_default();
        Ok(serde_json::to_value(listings::list_files(&roots).await)?)
    }

    async fn book_formats(&self, lib: &Arc<LibraryConfig>, book_id: Value) -> Result<Vec<String>> {
        let details = self
            .call_worker(
                lib,
                "get_book_details",
                json!({"book_id": book_id, "fields": ["formats"]}),
            )
            .await?;
        Ok(details
            .get("formats")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_uppercase)
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn fields_param(params: &Value) -> BTreeSet<String> {
    params
        .get("fields")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::Protocol(format!("missing parameter '{}'", key)))
}

fn into_object(value: Value) -> Result<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(serde_json::Map::new()),
        other => Err(BridgeError::Protocol(format!(
            "expected a JSON object, got: {}",
            other
        ))),
    }
}

/// With a blanket read or write grant the agent sees every column.
/// Otherwise the schema is cut down to the union of the listed fields.
fn filter_schema(schema: Value, perms: &Permissions) -> Value {
    use crate::config::model::FieldRule;

    if perms.read.is_all() || perms.write.is_all() {
        return schema;
    }

    let mut allowed: BTreeSet<&String> = BTreeSet::new();
    for rule in [&perms.read, &perms.write] {
        if let FieldRule::FieldSet(set) = rule {
            allowed.extend(set.iter());
        }
    }

    match schema {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| allowed.contains(k))
                .collect(),
        ),
        other => other,
    }
}

fn best_source_format(available: &[String]) -> Option<String> {
    for preferred in SOURCE_FORMAT_PRIORITY {
        if available.iter().any(|f| f.eq_ignore_ascii_case(preferred)) {
            return Some(preferred.to_string());
        }
    }
    available.first().map(|f| f.to_uppercase())
}

fn correct_extension(path: &Path, format: &str) -> PathBuf {
    let expected = format.to_lowercase();
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(&expected) => path.to_path_buf(),
        _ => path.with_extension(expected),
    }
}

fn lock_cache(cache: &StdMutex<HashMap<String, Value>>) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
    match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
