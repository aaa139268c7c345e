//! Local directory listings for import/export staging areas.
//!
//! These never touch a worker: they read the configured allowed_paths
//! directly. Unreadable directories are skipped rather than failing
//! the whole listing.

use std::path::PathBuf;

use tokio::fs;

pub async fn list_files(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        let Ok(mut entries) = fs::read_dir(root).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    files
}
