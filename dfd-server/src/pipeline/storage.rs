//! Storage Writer
//!
//! Owns the uploads working directory: creates it lazily, writes each upload
//! under a generated storage key, and applies the retention policy. Files that
//! belong to requests still in flight are never evicted.

use super::receiver::ReceivedUpload;
use dfd_common::config::{RetentionConfig, StorageNaming};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest extension carried over into a generated storage key
const MAX_KEY_EXTENSION_LEN: usize = 8;

/// Storage Writer errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Working directory missing and could not be created
    #[error("cannot create working directory {}: {source}", .path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// File could not be created or fully written
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Working directory could not be listed during a retention sweep
    #[error("cannot scan working directory {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A persisted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    /// Client-declared filename, metadata only
    pub declared_name: String,
    pub stored_path: PathBuf,
    pub size_bytes: u64,
}

/// Outcome of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub removed_files: usize,
    pub removed_bytes: u64,
    pub skipped_in_flight: usize,
}

/// Paths currently owned by requests, with a holder count per path
type InFlight = Arc<Mutex<HashMap<PathBuf, usize>>>;

/// Stored file leased to the current request.
///
/// [`StoredUpload::release`] ends the lease; when `keep_uploads` is off (or
/// the write failed) the file is removed once no other request holds it. A
/// lease that is dropped instead (cancelled request) is cleaned up on the
/// blocking pool.
#[derive(Debug)]
pub struct StoredUpload {
    asset: UploadedAsset,
    in_flight: InFlight,
    discard: bool,
    released: bool,
}

impl StoredUpload {
    pub fn asset(&self) -> &UploadedAsset {
        &self.asset
    }

    pub fn path(&self) -> &Path {
        &self.asset.stored_path
    }

    /// Give up the lease, removing the file now if it is not kept
    pub async fn release(mut self) {
        if let Some(path) = self.end_lease() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(stored_path = %path.display(), "Removed upload"),
                Err(e) => log_removal_failure(&path, e),
            }
        }
    }

    /// Drop this holder; returns the path when the file should be removed
    fn end_lease(&mut self) -> Option<PathBuf> {
        if self.released {
            return None;
        }
        self.released = true;

        let path = &self.asset.stored_path;
        let last_holder = match self.in_flight.lock() {
            Ok(mut in_flight) => {
                let remaining = in_flight.get(path).copied().unwrap_or(0).saturating_sub(1);
                if remaining == 0 {
                    in_flight.remove(path);
                    true
                } else {
                    in_flight.insert(path.clone(), remaining);
                    false
                }
            }
            Err(_) => true,
        };

        (self.discard && last_holder).then(|| path.clone())
    }
}

impl Drop for StoredUpload {
    fn drop(&mut self) {
        let Some(path) = self.end_lease() else {
            return;
        };
        let remove = move || match std::fs::remove_file(&path) {
            Ok(()) => debug!(stored_path = %path.display(), "Removed upload"),
            Err(e) => log_removal_failure(&path, e),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

fn log_removal_failure(path: &Path, e: io::Error) {
    if e.kind() != io::ErrorKind::NotFound {
        warn!(stored_path = %path.display(), "Failed to remove upload: {}", e);
    }
}

/// Uploads working directory
#[derive(Debug)]
pub struct UploadStore {
    root: PathBuf,
    naming: StorageNaming,
    retention: RetentionConfig,
    in_flight: InFlight,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>, naming: StorageNaming, retention: RetentionConfig) -> Self {
        Self {
            root: root.into(),
            naming,
            retention,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create the working directory if it does not exist yet
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::DirectoryCreation {
                path: self.root.clone(),
                source,
            })
    }

    /// Persist an upload. The returned lease keeps the file safe from
    /// retention until it is dropped.
    pub async fn store(&self, upload: &ReceivedUpload) -> Result<StoredUpload, StorageError> {
        self.ensure_root().await?;

        let stored_path = self.root.join(self.storage_key(&upload.declared_name));
        let mut lease = self.lease(UploadedAsset {
            declared_name: upload.declared_name.clone(),
            stored_path: stored_path.clone(),
            size_bytes: upload.size_bytes(),
        });

        if let Err(source) = write_file(&stored_path, &upload.bytes).await {
            // `discard` is still set, so this removes any partial file
            lease.release().await;
            return Err(StorageError::Write {
                path: stored_path,
                source,
            });
        }

        lease.discard = !self.retention.keep_uploads;

        info!(
            declared_name = %upload.declared_name,
            stored_path = %stored_path.display(),
            size_bytes = upload.size_bytes(),
            "Upload stored"
        );

        Ok(lease)
    }

    fn lease(&self, asset: UploadedAsset) -> StoredUpload {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            *in_flight.entry(asset.stored_path.clone()).or_insert(0) += 1;
        }
        StoredUpload {
            asset,
            in_flight: Arc::clone(&self.in_flight),
            discard: true,
            released: false,
        }
    }

    /// Number of stored files currently leased by requests
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn storage_key(&self, declared_name: &str) -> String {
        match self.naming {
            StorageNaming::Unique => unique_key(declared_name),
            StorageNaming::Declared => {
                sanitize_filename(declared_name).unwrap_or_else(|| unique_key(declared_name))
            }
        }
    }

    /// Evict files (oldest first) until every configured limit holds
    pub async fn enforce_retention(&self) -> Result<RetentionReport, StorageError> {
        let mut report = RetentionReport::default();
        if !self.retention.has_limits() {
            return Ok(report);
        }

        let scan_error = |source: io::Error| StorageError::Scan {
            path: self.root.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(scan_error(e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(scan_error)? {
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((entry.path(), metadata.len(), modified));
        }
        files.sort_by_key(|(_, _, modified)| *modified);

        let leased: Vec<PathBuf> = self
            .in_flight
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        let now = SystemTime::now();
        let mut remaining_files = files.len();
        let mut remaining_bytes: u64 = files.iter().map(|(_, size, _)| size).sum();

        for (path, size, modified) in files {
            let expired = self.retention.max_age.is_some_and(|max_age| {
                now.duration_since(modified).unwrap_or_default() > max_age
            });
            let too_many = self
                .retention
                .max_files
                .is_some_and(|max_files| remaining_files > max_files);
            let too_large = self
                .retention
                .max_total_bytes
                .is_some_and(|max_bytes| remaining_bytes > max_bytes);

            if !(expired || too_many || too_large) {
                continue;
            }
            if leased.contains(&path) {
                report.skipped_in_flight += 1;
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    remaining_files -= 1;
                    remaining_bytes = remaining_bytes.saturating_sub(size);
                    report.removed_files += 1;
                    report.removed_bytes += size;
                    debug!(stored_path = %path.display(), size_bytes = size, "Evicted upload");
                }
                Err(e) => warn!(stored_path = %path.display(), "Failed to evict upload: {}", e),
            }
        }

        if report.removed_files > 0 {
            info!(
                removed_files = report.removed_files,
                removed_bytes = report.removed_bytes,
                skipped_in_flight = report.skipped_in_flight,
                "Retention sweep finished"
            );
        }

        Ok(report)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

/// `<uuid>` or `<uuid>.<ext>` when the declared name has a plain extension
fn unique_key(declared_name: &str) -> String {
    let extension = sanitize_filename(declared_name).and_then(|name| {
        name.rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_KEY_EXTENSION_LEN
                    && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
    });

    match extension {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    }
}

/// Reduce a client-declared name to a safe basename.
///
/// Directory components are dropped, whitespace becomes `_`, only
/// `[A-Za-z0-9._-]` survive, and leading dots/underscores are stripped.
/// Returns `None` when nothing usable is left.
pub fn sanitize_filename(declared_name: &str) -> Option<String> {
    let basename = declared_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = basename
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    let cleaned = cleaned.trim_start_matches(|c: char| c == '.' || c == '_');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}
