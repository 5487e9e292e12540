use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::FileBackup;
use crate::classify::{write_probe, CorruptionType};
use crate::error::ToolError;
use crate::metadata::update_confirmed;
use crate::process::{path_list_args, write_arg_file, ToolOutput, ToolSession};

/// Repair strategies from least to most invasive. The order is the attempt
/// sequence; it is fixed, never reordered by past outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    Safest,
    Thorough,
    Aggressive,
    FilesystemOnly,
}

impl RepairStrategy {
    pub const ORDER: [RepairStrategy; 4] = [
        RepairStrategy::Safest,
        RepairStrategy::Thorough,
        RepairStrategy::Aggressive,
        RepairStrategy::FilesystemOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safest => "safest",
            Self::Thorough => "thorough",
            Self::Aggressive => "aggressive",
            Self::FilesystemOnly => "filesystem_only",
        }
    }
}

/// Result of one file's repair run. Immutable; the backup named here is
/// retained on disk whatever `success` says.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub path: PathBuf,
    pub strategy_used: RepairStrategy,
    pub success: bool,
    pub verification_passed: bool,
    pub error_message: String,
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub command_timeout: Duration,
    pub verify_timeout: Duration,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            verify_timeout: Duration::from_secs(30),
        }
    }
}

struct StrategyAttempt {
    succeeded: bool,
    detail: String,
}

/// Runs the strategy progression against one file.
///
/// A verified backup is created before anything else; without it no strategy
/// runs. Each attempt starts by restoring the pristine original so no
/// attempt inherits a predecessor's partial state, and exhaustion restores
/// one final time. The backup stays on disk as user-recoverable evidence.
pub fn repair(
    session: &mut dyn ToolSession,
    path: &Path,
    corruption_type: CorruptionType,
    backup_dir: &Path,
    forced_strategy: Option<RepairStrategy>,
    options: &RepairOptions,
) -> RepairOutcome {
    info!(
        path = %path.display(),
        corruption = corruption_type.as_str(),
        "attempting repair"
    );

    let backup = match FileBackup::create(path, Some(backup_dir)) {
        Ok(backup) => backup,
        Err(error) => {
            warn!(path = %path.display(), %error, "repair aborted; no backup");
            return RepairOutcome {
                path: path.to_path_buf(),
                strategy_used: forced_strategy.unwrap_or(RepairStrategy::Safest),
                success: false,
                verification_passed: false,
                error_message: format!("could not create backup: {error}"),
                backup_path: None,
            };
        }
    };

    let order: Vec<RepairStrategy> = match forced_strategy {
        Some(strategy) => vec![strategy],
        None => RepairStrategy::ORDER.to_vec(),
    };
    let last_strategy = order.last().copied().unwrap_or(RepairStrategy::FilesystemOnly);

    for strategy in order {
        debug!(path = %path.display(), strategy = strategy.as_str(), "trying repair strategy");

        // Pristine-original precondition for every attempt.
        if let Err(error) = backup.restore() {
            return RepairOutcome {
                path: path.to_path_buf(),
                strategy_used: strategy,
                success: false,
                verification_passed: false,
                error_message: format!("could not restore before attempt: {error}"),
                backup_path: Some(backup.backup_path().to_path_buf()),
            };
        }

        let attempt = match apply_strategy(session, path, &backup, strategy, options.command_timeout)
        {
            Ok(attempt) => attempt,
            Err(error) => {
                debug!(strategy = strategy.as_str(), %error, "strategy command failed");
                continue;
            }
        };
        if !attempt.succeeded {
            debug!(strategy = strategy.as_str(), detail = %attempt.detail, "strategy reported failure");
            continue;
        }

        match write_probe(session, path, options.verify_timeout) {
            Ok(probe) if probe.confirmed => {
                info!(
                    path = %path.display(),
                    strategy = strategy.as_str(),
                    "repair verified"
                );
                return RepairOutcome {
                    path: path.to_path_buf(),
                    strategy_used: strategy,
                    success: true,
                    verification_passed: true,
                    error_message: String::new(),
                    backup_path: Some(backup.backup_path().to_path_buf()),
                };
            }
            Ok(probe) => {
                debug!(
                    strategy = strategy.as_str(),
                    detail = %probe.diagnostic,
                    "repair completed but verification failed"
                );
            }
            Err(error) => {
                warn!(strategy = strategy.as_str(), %error, "verification could not run");
            }
        }
    }

    let mut error_message = "all repair strategies failed".to_string();
    if let Err(error) = backup.restore() {
        warn!(path = %path.display(), %error, "final restore after exhaustion failed");
        error_message = format!("{error_message}; final restore failed: {error}");
    }
    RepairOutcome {
        path: path.to_path_buf(),
        strategy_used: last_strategy,
        success: false,
        verification_passed: false,
        error_message,
        backup_path: Some(backup.backup_path().to_path_buf()),
    }
}

fn apply_strategy(
    session: &mut dyn ToolSession,
    path: &Path,
    backup: &FileBackup,
    strategy: RepairStrategy,
    timeout: Duration,
) -> Result<StrategyAttempt, ToolError> {
    match strategy {
        RepairStrategy::Safest => safest_repair(session, path, timeout),
        RepairStrategy::Thorough => thorough_repair(session, path, backup, timeout),
        RepairStrategy::Aggressive => aggressive_repair(session, path, timeout),
        // No tool invocation; the caller falls back to filesystem
        // timestamps, so there is nothing to rewrite.
        RepairStrategy::FilesystemOnly => Ok(StrategyAttempt {
            succeeded: true,
            detail: "defers to filesystem timestamps".to_string(),
        }),
    }
}

/// Minimal rewrite: copy the file onto itself with minor errors ignored,
/// which drops only the tags the tool cannot carry over.
fn safest_repair(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> Result<StrategyAttempt, ToolError> {
    let arg_file = write_arg_file(&[path.to_path_buf()])?;
    let mut args = vec![
        "-overwrite_original".to_string(),
        "-ignoreMinorErrors".to_string(),
        "-m".to_string(),
    ];
    args.extend(path_list_args(&arg_file));

    let output = session.execute(&args, timeout)?;
    let succeeded =
        update_confirmed(&output.stdout) || (!has_error_line(&output.stderr) && output.stdout.trim().is_empty());
    Ok(StrategyAttempt {
        succeeded,
        detail: attempt_detail(&output),
    })
}

/// Full metadata rebuild: strip everything, then copy all tags back from the
/// pristine backup with unsafe tags allowed.
fn thorough_repair(
    session: &mut dyn ToolSession,
    path: &Path,
    backup: &FileBackup,
    timeout: Duration,
) -> Result<StrategyAttempt, ToolError> {
    let arg_file = write_arg_file(&[path.to_path_buf()])?;

    let mut clear_args = vec!["-all=".to_string(), "-overwrite_original".to_string()];
    clear_args.extend(path_list_args(&arg_file));
    let cleared = session.execute(&clear_args, timeout)?;
    if has_error_line(&cleared.stderr) {
        return Ok(StrategyAttempt {
            succeeded: false,
            detail: format!("clear metadata failed: {}", cleared.stderr.trim()),
        });
    }

    let mut rebuild_args = vec![
        "-tagsfromfile".to_string(),
        backup.backup_path().display().to_string(),
        "-all:all".to_string(),
        "-unsafe".to_string(),
        "-overwrite_original".to_string(),
    ];
    rebuild_args.extend(path_list_args(&arg_file));
    let rebuilt = session.execute(&rebuild_args, timeout)?;
    Ok(StrategyAttempt {
        succeeded: update_confirmed(&rebuilt.stdout) || !has_error_line(&rebuilt.stderr),
        detail: attempt_detail(&rebuilt),
    })
}

/// Last tool-assisted resort: force-strip all metadata, then write back a
/// minimal valid EXIF container.
fn aggressive_repair(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> Result<StrategyAttempt, ToolError> {
    let arg_file = write_arg_file(&[path.to_path_buf()])?;

    let mut strip_args = vec![
        "-all=".to_string(),
        "-f".to_string(),
        "-overwrite_original".to_string(),
    ];
    strip_args.extend(path_list_args(&arg_file));
    // The forced strip may itself complain; only the rebuild verdict counts.
    let _ = session.execute(&strip_args, timeout)?;

    let mut minimal_args = vec![
        "-EXIF:ColorSpace=1".to_string(),
        "-EXIF:ExifVersion=0232".to_string(),
        "-overwrite_original".to_string(),
    ];
    minimal_args.extend(path_list_args(&arg_file));
    let written = session.execute(&minimal_args, timeout)?;
    Ok(StrategyAttempt {
        succeeded: update_confirmed(&written.stdout) || !has_error_line(&written.stderr),
        detail: attempt_detail(&written),
    })
}

fn has_error_line(stderr: &str) -> bool {
    stderr
        .lines()
        .any(|line| line.trim_start().starts_with("Error"))
}

fn attempt_detail(output: &ToolOutput) -> String {
    if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        output.stderr.trim().to_string()
    }
}
