use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backup::FileBackup;
use crate::error::{BackupError, ToolError};
use crate::metadata::update_confirmed;
use crate::pool::ExifToolPool;
use crate::process::{path_list_args, write_arg_file, ToolSession};

/// Sentinel value written by the reversible write probe; the file never keeps
/// it because the probe restores from backup unconditionally.
const PROBE_SENTINEL_DATE: &str = "2020:01:01 12:00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionType {
    Healthy,
    ExifStructure,
    MakerNotes,
    SevereCorruption,
    FilesystemOnly,
}

impl CorruptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::ExifStructure => "exif_structure",
            Self::MakerNotes => "maker_notes",
            Self::SevereCorruption => "severe_corruption",
            Self::FilesystemOnly => "filesystem_only",
        }
    }
}

/// Verdict of the two-probe classification for one file. Immutable once
/// created; invalid the moment the file is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionRecord {
    pub path: PathBuf,
    pub corruption_type: CorruptionType,
    pub diagnostic: String,
    pub is_repairable: bool,
    pub estimated_success_rate: f32,
}

impl CorruptionRecord {
    pub fn is_healthy(&self) -> bool {
        self.corruption_type == CorruptionType::Healthy
    }

    fn new(
        path: &Path,
        corruption_type: CorruptionType,
        diagnostic: impl Into<String>,
        is_repairable: bool,
        estimated_success_rate: f32,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            corruption_type,
            diagnostic: diagnostic.into(),
            is_repairable,
            estimated_success_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub command_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            chunk_size: 10,
        }
    }
}

struct KeywordRule {
    corruption_type: CorruptionType,
    success_rate: f32,
    keywords: &'static [&'static str],
}

/// Failure-text lookup table, matched in order against the lowercased
/// diagnostic. Extending classification means adding a row here, not a
/// branch to the probe flow.
const FAILURE_KEYWORDS: &[KeywordRule] = &[
    KeywordRule {
        corruption_type: CorruptionType::MakerNotes,
        success_rate: 0.9,
        keywords: &["makernotes", "offsets may be incorrect"],
    },
    KeywordRule {
        corruption_type: CorruptionType::ExifStructure,
        success_rate: 0.7,
        keywords: &[
            "stripoffsets",
            "ifd0",
            "ifd1",
            "exif structure",
            "invalid exif",
            "bad exif",
            "corrupt exif",
        ],
    },
    KeywordRule {
        corruption_type: CorruptionType::FilesystemOnly,
        success_rate: 0.3,
        keywords: &["no exif", "no metadata"],
    },
];

#[derive(Debug, Error)]
pub(crate) enum ProbeError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// Classifies one file through the two probes. Every failure mode becomes a
/// record; nothing escapes as an error across the file boundary.
pub fn classify_file(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> CorruptionRecord {
    let diagnostic = match read_probe(session, path, timeout) {
        Ok(()) => match write_probe(session, path, timeout) {
            Ok(probe) if probe.confirmed => {
                return CorruptionRecord::new(path, CorruptionType::Healthy, "", true, 1.0);
            }
            Ok(probe) => return classify_failure_text(path, &probe.diagnostic),
            Err(error) => {
                // Unexpected probe failure (dead session, unrestorable
                // backup): degrade this one record, keep scanning.
                warn!(path = %path.display(), %error, "write probe could not run");
                return CorruptionRecord::new(
                    path,
                    CorruptionType::SevereCorruption,
                    format!("scanning error: {error}"),
                    false,
                    0.0,
                );
            }
        },
        Err(diagnostic) => diagnostic,
    };

    // The tool cannot parse the file at all; probing further is unsafe.
    CorruptionRecord::new(path, CorruptionType::SevereCorruption, diagnostic, false, 0.1)
}

/// Two-probe scan of a batch, parallel across the pool in chunks. Record
/// order follows `paths`; a chunk that never got a session degrades its
/// files instead of dropping them.
pub fn scan(
    pool: &ExifToolPool,
    paths: &[PathBuf],
    options: &ProbeOptions,
) -> BTreeMap<PathBuf, CorruptionRecord> {
    let slots = pool.dispatch_chunks(paths, options.chunk_size, |session, chunk, out| {
        for (slot, path) in out.iter_mut().zip(chunk) {
            *slot = Some(classify_file(session, path, options.command_timeout));
        }
    });

    slots
        .into_iter()
        .zip(paths)
        .map(|(slot, path)| {
            let record = slot.unwrap_or_else(|| {
                CorruptionRecord::new(
                    path,
                    CorruptionType::SevereCorruption,
                    "scanning error: no tool session available",
                    false,
                    0.0,
                )
            });
            (path.clone(), record)
        })
        .collect()
}

/// Probe 1: read-only metadata query. Empty output or an error line on
/// stderr means the container is unreadable.
fn read_probe(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> Result<(), String> {
    let arg_file = write_arg_file(&[path.to_path_buf()]).map_err(|error| error.to_string())?;
    let mut args = vec!["-json".to_string()];
    args.extend(path_list_args(&arg_file));

    let output = session
        .execute(&args, timeout)
        .map_err(|error| error.to_string())?;

    let errored = output
        .stderr
        .lines()
        .any(|line| line.trim_start().starts_with("Error"));
    if output.stdout.trim().is_empty() || errored {
        let diagnostic = output.stderr.trim();
        return Err(if diagnostic.is_empty() {
            "no metadata readable".to_string()
        } else {
            diagnostic.to_string()
        });
    }
    Ok(())
}

pub(crate) struct WriteProbe {
    pub confirmed: bool,
    pub diagnostic: String,
}

/// Probe 2: reversible single-field write. The file is backed up first and
/// restored from that backup no matter how the write went; the probe never
/// leaves a mutated file behind. Shared verbatim by repair verification.
pub(crate) fn write_probe(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> Result<WriteProbe, ProbeError> {
    let backup = FileBackup::create(path, None)?;
    let attempt = run_probe_write(session, path, timeout);
    let restored = backup.restore_and_discard();

    // A failed restore outranks whatever the write said; the file's state is
    // now unknown.
    restored?;
    let output = attempt?;

    let confirmed = update_confirmed(&output.stdout);
    let diagnostic = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        output.stderr.trim().to_string()
    };
    debug!(path = %path.display(), confirmed, "write probe finished");
    Ok(WriteProbe {
        confirmed,
        diagnostic,
    })
}

fn run_probe_write(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> Result<crate::process::ToolOutput, ToolError> {
    let arg_file = write_arg_file(&[path.to_path_buf()])?;
    let mut args = vec![
        "-overwrite_original".to_string(),
        "-ignoreMinorErrors".to_string(),
        "-m".to_string(),
        format!("-CreateDate={PROBE_SENTINEL_DATE}"),
    ];
    args.extend(path_list_args(&arg_file));
    session.execute(&args, timeout)
}

/// Maps a failed write probe's diagnostic through the keyword table. An
/// unmatched diagnostic is severe but still worth a repair attempt.
fn classify_failure_text(path: &Path, diagnostic: &str) -> CorruptionRecord {
    let lowered = diagnostic.to_lowercase();
    for rule in FAILURE_KEYWORDS {
        if rule.keywords.iter().any(|keyword| lowered.contains(keyword)) {
            return CorruptionRecord::new(
                path,
                rule.corruption_type,
                diagnostic,
                true,
                rule.success_rate,
            );
        }
    }
    CorruptionRecord::new(path, CorruptionType::SevereCorruption, diagnostic, true, 0.2)
}

/// Aggregate counts the batch driver uses to decide whether repair is worth
/// invoking at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total_files: usize,
    pub healthy_files: usize,
    pub repairable_files: usize,
    pub unrepairable_files: usize,
    pub corruption_types: BTreeMap<String, usize>,
    pub has_corruption: bool,
}

pub fn summarize<'a>(records: impl IntoIterator<Item = &'a CorruptionRecord>) -> ScanSummary {
    let mut summary = ScanSummary {
        total_files: 0,
        healthy_files: 0,
        repairable_files: 0,
        unrepairable_files: 0,
        corruption_types: BTreeMap::new(),
        has_corruption: false,
    };

    for record in records {
        summary.total_files += 1;
        if record.is_healthy() {
            summary.healthy_files += 1;
        } else if record.is_repairable {
            summary.repairable_files += 1;
        } else {
            summary.unrepairable_files += 1;
        }
        *summary
            .corruption_types
            .entry(record.corruption_type.as_str().to_string())
            .or_insert(0) += 1;
    }

    summary.has_corruption = summary.repairable_files + summary.unrepairable_files > 0;
    summary
}
