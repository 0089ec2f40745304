//! Zip export and import of everything stored under the key prefix.
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use chrono::Utc;
use log::{debug, info, warn};
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, ZipArchive, ZipWriter};

use crate::{KeyValueStore, MemoError, RestoreBackupSummary, Result};

const BACKUP_FILE_PREFIX: &str = "memosync_backup_";

// Orders backup files by modification time, newer is greater.
#[derive(Debug, Eq)]
struct BackupFile {
    path: PathBuf,
    modified_time: SystemTime,
}

impl PartialEq for BackupFile {
    fn eq(&self, other: &Self) -> bool {
        self.modified_time.eq(&other.modified_time)
    }
}

impl PartialOrd for BackupFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackupFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.modified_time.cmp(&other.modified_time)
    }
}

pub struct BackupManager {
    backup_dir: PathBuf,
    max_backups: u32,
    kv: Arc<KeyValueStore>,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>, max_backups: u32, kv: Arc<KeyValueStore>) -> Self {
        BackupManager {
            backup_dir: backup_dir.into(),
            max_backups,
            kv,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Writes every namespaced key to a timestamped zip archive, one
    /// `<key>.json` entry per key, then prunes old archives.
    ///
    /// # Returns
    ///
    /// The path to the created backup file
    pub fn create_backup(&self) -> Result<PathBuf> {
        if !self.backup_dir.exists() {
            fs::create_dir_all(&self.backup_dir).map_err(|e| MemoError::BackupFailed {
                message: e.to_string(),
            })?;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let backup_path = self
            .backup_dir
            .join(format!("{}{}.zip", BACKUP_FILE_PREFIX, timestamp));

        let file = File::create(&backup_path).map_err(|e| MemoError::BackupFailed {
            message: e.to_string(),
        })?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        let keys = self.kv.list_keys()?;
        for key in &keys {
            let Some(text) = self.kv.get_raw(key)? else {
                continue;
            };
            zip.start_file(format!("{}.json", key), options)?;
            zip.write_all(text.as_bytes())
                .map_err(|e| MemoError::BackupFailed {
                    message: format!("Failed to write {} to backup: {}", key, e),
                })?;
        }
        zip.finish()?;

        self.cleanup_old_backups()?;

        info!(
            "Full backup created successfully with {} keys at {}",
            keys.len(),
            backup_path.display()
        );
        Ok(backup_path)
    }

    fn backup_files(&self) -> Vec<BackupFile> {
        WalkDir::new(&self.backup_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let path = entry.path();
                path.is_file()
                    && path.extension().is_some_and(|ext| ext == "zip")
                    && path
                        .file_name()
                        .is_some_and(|name| name.to_string_lossy().starts_with(BACKUP_FILE_PREFIX))
            })
            .filter_map(|entry| {
                let modified_time = entry.metadata().ok()?.modified().ok()?;
                Some(BackupFile {
                    path: entry.path().to_path_buf(),
                    modified_time,
                })
            })
            .collect()
    }

    /// Backup archives, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = self.backup_files();
        files.sort_by(|a, b| b.cmp(a).then_with(|| b.path.cmp(&a.path)));
        Ok(files.into_iter().map(|f| f.path).collect())
    }

    /// Keeps the newest `max_backups` archives. 0 keeps everything.
    fn cleanup_old_backups(&self) -> Result<()> {
        if self.max_backups == 0 {
            return Ok(());
        }

        // min-heap: the oldest kept archive sits on top
        let mut newest_backups: BinaryHeap<Reverse<BackupFile>> =
            BinaryHeap::with_capacity(self.max_backups as usize + 1);
        let mut removed = 0;

        for backup_file in self.backup_files() {
            newest_backups.push(Reverse(backup_file));
            if newest_backups.len() > self.max_backups as usize {
                if let Some(Reverse(oldest)) = newest_backups.pop() {
                    match fs::remove_file(&oldest.path) {
                        Ok(_) => {
                            removed += 1;
                            debug!("Removed old backup: {}", oldest.path.display());
                        }
                        Err(e) => warn!(
                            "Failed to remove old backup {}: {}",
                            oldest.path.display(),
                            e
                        ),
                    }
                }
            }
        }

        if removed > 0 {
            debug!(
                "Cleanup complete: kept {} backups, removed {} old backups",
                newest_backups.len(),
                removed
            );
        }
        Ok(())
    }

    /// Restores keys from a backup archive.
    ///
    /// # Arguments
    ///
    /// * `backup_path` - Path to the backup ZIP file to restore from
    /// * `overwrite_existing` - Whether to overwrite keys that already exist
    ///
    /// The search index is not touched; run
    /// `MemoApp::reindex` afterwards.
    pub fn restore_backup(
        &self,
        backup_path: &Path,
        overwrite_existing: bool,
    ) -> Result<RestoreBackupSummary> {
        if !backup_path.is_file() {
            return Err(MemoError::RestoreFailed {
                message: format!("Backup file not found: {}", backup_path.display()),
            });
        }
        if backup_path.extension().map_or(true, |ext| ext != "zip") {
            return Err(MemoError::RestoreFailed {
                message: format!("Not a valid ZIP file: {}", backup_path.display()),
            });
        }

        let backup_file = File::open(backup_path).map_err(|e| MemoError::RestoreFailed {
            message: format!("Failed to open backup file: {}", e),
        })?;
        let mut archive = ZipArchive::new(backup_file)?;

        let mut total_entries = 0;
        let mut entries_restored = 0;
        let mut entries_skipped = 0;
        let mut failed_entries = Vec::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| MemoError::RestoreFailed {
                message: format!("Failed to read ZIP entry: {}", e),
            })?;
            let Some(key) = entry.name().strip_suffix(".json").map(str::to_string) else {
                continue;
            };
            total_entries += 1;

            if !overwrite_existing && self.kv.exists(&key)? {
                entries_skipped += 1;
                continue;
            }

            let mut text = String::new();
            let restored = entry
                .read_to_string(&mut text)
                .map_err(MemoError::from)
                .and_then(|_| self.kv.set_raw(&key, &text));
            match restored {
                Ok(()) => entries_restored += 1,
                Err(e) => {
                    warn!("Failed to restore {}: {}", key, e);
                    failed_entries.push((key, e.to_string()));
                }
            }
        }

        info!(
            "Backup restoration complete: restored {}, skipped {}, failed {} entries from {}",
            entries_restored,
            entries_skipped,
            failed_entries.len(),
            backup_path.display()
        );

        Ok(RestoreBackupSummary {
            backup_file: backup_path.to_path_buf(),
            total_entries,
            entries_restored,
            entries_skipped,
            failed_entries,
        })
    }
}
