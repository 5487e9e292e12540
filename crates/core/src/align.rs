use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::MetadataCache;
use crate::classify::{self, CorruptionType, ProbeOptions};
use crate::datetime::{is_capture_time_key, shift_capture_value};
use crate::metadata;
use crate::pool::ExifToolPool;
use crate::repair::{self, RepairOptions, RepairStrategy};

pub const REPORT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct AlignOptions {
    /// Signed shift applied to every capture timestamp.
    pub offset_seconds: i64,
    /// Files per maintenance group; the pool is fully restarted at each
    /// group boundary (never before the first group).
    pub group_size: usize,
    /// Files per probe/read chunk inside a group.
    pub chunk_size: usize,
    pub command_timeout: Duration,
    /// When false, repairable files are reported and skipped.
    pub repair: bool,
    pub forced_strategy: Option<RepairStrategy>,
    pub backup_dir: PathBuf,
    pub repair_options: RepairOptions,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            offset_seconds: 0,
            group_size: 50,
            chunk_size: 10,
            command_timeout: Duration::from_secs(30),
            repair: true,
            forced_strategy: None,
            backup_dir: PathBuf::from("capture-aligner-backups"),
            repair_options: RepairOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Updated,
    Skipped,
    Unrepairable,
    RepairFailed,
    WriteFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub status: FileStatus,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub fields_updated: usize,
    #[serde(default)]
    pub repair_strategy: Option<RepairStrategy>,
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignReport {
    pub report_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub offset_seconds: i64,
    pub scanned_files: usize,
    pub healthy_files: usize,
    pub repaired_files: usize,
    pub failed_repairs: usize,
    pub unrepairable_files: usize,
    pub updated_files: usize,
    pub skipped_files: usize,
    pub write_failures: usize,
    pub pool_restarts: u64,
    pub files: Vec<FileReport>,
    pub warnings: Vec<String>,
}

impl AlignReport {
    fn new(offset_seconds: i64) -> Self {
        Self {
            report_version: REPORT_VERSION.to_string(),
            run_id: Uuid::new_v4().to_string(),
            generated_at: Utc::now().to_rfc3339(),
            offset_seconds,
            scanned_files: 0,
            healthy_files: 0,
            repaired_files: 0,
            failed_repairs: 0,
            unrepairable_files: 0,
            updated_files: 0,
            skipped_files: 0,
            write_failures: 0,
            pool_restarts: 0,
            files: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn push(&mut self, entry: FileReport) {
        match entry.status {
            FileStatus::Updated => self.updated_files += 1,
            FileStatus::Skipped => self.skipped_files += 1,
            FileStatus::Unrepairable => self.unrepairable_files += 1,
            FileStatus::RepairFailed => self.failed_repairs += 1,
            FileStatus::WriteFailed => self.write_failures += 1,
        }
        self.files.push(entry);
    }
}

/// Batch driver: groups of `group_size` files, pool restarted at each group
/// boundary as scheduled maintenance, then scan → repair → shift within each
/// group. Per-file failures become report entries; the run never aborts for
/// one file.
pub fn align(pool: &ExifToolPool, paths: &[PathBuf], options: &AlignOptions) -> AlignReport {
    let mut report = AlignReport::new(options.offset_seconds);
    report.scanned_files = paths.len();
    let mut cache = MetadataCache::new();
    let group_size = options.group_size.max(1);

    info!(
        files = paths.len(),
        offset_seconds = options.offset_seconds,
        group_size,
        "starting alignment run"
    );

    for (group_index, group) in paths.chunks(group_size).enumerate() {
        if group_index > 0 {
            match pool.restart_pool() {
                Ok(()) => {
                    report.pool_restarts += 1;
                    info!(group = group_index + 1, "pool recycled at group boundary");
                }
                Err(error) => {
                    warn!(%error, "group-boundary pool restart failed");
                    report.warnings.push(format!(
                        "pool restart before group {} failed: {error}",
                        group_index + 1
                    ));
                }
            }
        }
        process_group(pool, group, options, &mut cache, &mut report);
    }

    info!(
        updated = report.updated_files,
        repaired = report.repaired_files,
        skipped = report.skipped_files,
        write_failures = report.write_failures,
        "alignment run finished"
    );
    report
}

fn process_group(
    pool: &ExifToolPool,
    group: &[PathBuf],
    options: &AlignOptions,
    cache: &mut MetadataCache,
    report: &mut AlignReport,
) {
    let probe_options = ProbeOptions {
        command_timeout: options.command_timeout,
        chunk_size: options.chunk_size,
    };
    let records = classify::scan(pool, group, &probe_options);

    let mut to_update: Vec<PathBuf> = Vec::new();
    let mut repair_queue: Vec<(PathBuf, CorruptionType)> = Vec::new();
    let mut repaired_info: BTreeMap<PathBuf, (RepairStrategy, Option<PathBuf>)> = BTreeMap::new();

    for path in group {
        let Some(record) = records.get(path) else {
            continue;
        };
        if record.is_healthy() {
            report.healthy_files += 1;
            to_update.push(path.clone());
        } else if record.is_repairable && options.repair {
            repair_queue.push((path.clone(), record.corruption_type));
        } else if record.is_repairable {
            report.push(FileReport {
                path: path.clone(),
                status: FileStatus::Skipped,
                detail: format!("repairable but repair is disabled: {}", record.diagnostic),
                fields_updated: 0,
                repair_strategy: None,
                backup_path: None,
            });
        } else {
            report.push(FileReport {
                path: path.clone(),
                status: FileStatus::Unrepairable,
                detail: record.diagnostic.clone(),
                fields_updated: 0,
                repair_strategy: None,
                backup_path: None,
            });
        }
    }

    if !repair_queue.is_empty() {
        match pool.checkout() {
            Ok(mut session) => {
                // Strategy attempts on one file are strictly sequential, and
                // one session is enough for a group's repair queue.
                for (path, corruption_type) in repair_queue {
                    let outcome = repair::repair(
                        &mut *session,
                        &path,
                        corruption_type,
                        &options.backup_dir,
                        options.forced_strategy,
                        &options.repair_options,
                    );
                    if outcome.success {
                        report.repaired_files += 1;
                        repaired_info
                            .insert(path.clone(), (outcome.strategy_used, outcome.backup_path));
                        to_update.push(path);
                    } else {
                        report.push(FileReport {
                            path,
                            status: FileStatus::RepairFailed,
                            detail: outcome.error_message,
                            fields_updated: 0,
                            repair_strategy: Some(outcome.strategy_used),
                            backup_path: outcome.backup_path,
                        });
                    }
                }
            }
            Err(error) => {
                warn!(%error, "no session available for the repair queue");
                for (path, _) in repair_queue {
                    report.push(FileReport {
                        path,
                        status: FileStatus::RepairFailed,
                        detail: format!("no tool session available: {error}"),
                        fields_updated: 0,
                        repair_strategy: None,
                        backup_path: None,
                    });
                }
            }
        }
    }

    if to_update.is_empty() {
        return;
    }

    // Cached reads first; only the misses hit the tool.
    let mut metadata_by_path = BTreeMap::new();
    let mut misses = Vec::new();
    for path in &to_update {
        match cache.get(path) {
            Some(record) => {
                metadata_by_path.insert(path.clone(), record);
            }
            None => misses.push(path.clone()),
        }
    }
    for record in metadata::read_batch(pool, &misses, options.chunk_size, options.command_timeout) {
        if record.is_readable() {
            cache.insert(record.clone());
        }
        metadata_by_path.insert(record.path.clone(), record);
    }

    let mut session = match pool.checkout() {
        Ok(session) => session,
        Err(error) => {
            warn!(%error, "no session available for the write phase");
            for path in to_update {
                report.push(FileReport {
                    path,
                    status: FileStatus::WriteFailed,
                    detail: format!("no tool session available: {error}"),
                    fields_updated: 0,
                    repair_strategy: None,
                    backup_path: None,
                });
            }
            return;
        }
    };

    for path in to_update {
        let (repair_strategy, backup_path) = match repaired_info.remove(&path) {
            Some((strategy, backup)) => (Some(strategy), backup),
            None => (None, None),
        };
        let entry = write_shifted_fields(
            &mut *session,
            cache,
            &metadata_by_path,
            &path,
            options,
            repair_strategy,
            backup_path,
        );
        report.push(entry);
    }
}

fn write_shifted_fields(
    session: &mut dyn crate::process::ToolSession,
    cache: &mut MetadataCache,
    metadata_by_path: &BTreeMap<PathBuf, metadata::FileMetadata>,
    path: &Path,
    options: &AlignOptions,
    repair_strategy: Option<RepairStrategy>,
    backup_path: Option<PathBuf>,
) -> FileReport {
    let mut entry = FileReport {
        path: path.to_path_buf(),
        status: FileStatus::Skipped,
        detail: String::new(),
        fields_updated: 0,
        repair_strategy,
        backup_path,
    };

    let Some(record) = metadata_by_path.get(path).filter(|record| record.is_readable()) else {
        entry.detail = metadata_by_path
            .get(path)
            .and_then(|record| record.error.clone())
            .unwrap_or_else(|| "metadata could not be read".to_string());
        return entry;
    };

    let fields: BTreeMap<String, String> = record
        .tags
        .iter()
        .filter(|(tag, _)| is_capture_time_key(tag))
        .filter_map(|(tag, value)| {
            shift_capture_value(value, options.offset_seconds).map(|shifted| (tag.clone(), shifted))
        })
        .collect();
    if fields.is_empty() {
        entry.detail = "no shiftable capture timestamps".to_string();
        return entry;
    }

    match metadata::apply_tag_values(session, path, &fields, options.command_timeout) {
        Ok(true) => {
            cache.invalidate(path);
            entry.status = FileStatus::Updated;
            entry.fields_updated = fields.len();
        }
        Ok(false) => {
            entry.status = FileStatus::WriteFailed;
            entry.detail = "tool did not confirm the update".to_string();
        }
        Err(error) => {
            entry.status = FileStatus::WriteFailed;
            entry.detail = error.to_string();
        }
    }
    entry
}
