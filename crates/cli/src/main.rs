use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use capture_aligner_core::{
    align, collect_doctor_info, describe_offset, expand_paths, locate_executable, offset_between,
    repair, scan, summarize, AlignOptions, CorruptionRecord, ExifToolPool, ExifToolProcess,
    PoolOptions, ProbeOptions, RepairOptions, RepairOutcome, RepairStrategy, ScanSummary,
};
use capture_aligner_core::metadata::inspect_file;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "capture-aligner",
    version,
    about = "Batch-align capture timestamps across photo/video files, repairing damaged metadata first."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe files for metadata corruption and report the classification.
    Scan(ScanArgs),
    /// Scan, then repair every repairable file against mandatory backups.
    Repair(RepairArgs),
    /// Full run: scan, repair, and shift capture timestamps by an offset.
    Align(AlignArgs),
    /// Dump comprehensive metadata for a single file.
    Inspect(InspectArgs),
    /// Show environment and external-tool information.
    Doctor(DoctorArgs),
}

#[derive(Debug, Args)]
struct ToolArgs {
    /// Explicit exiftool executable; PATH and well-known locations otherwise.
    #[arg(long, value_name = "PATH")]
    exiftool: Option<PathBuf>,

    /// Number of persistent tool processes.
    #[arg(long, default_value_t = 4, value_name = "N")]
    pool_size: usize,

    /// Files per probe/read chunk.
    #[arg(long, default_value_t = 10, value_name = "N")]
    chunk_size: usize,

    /// Per-command timeout in seconds.
    #[arg(long, default_value_t = 30, value_name = "SECS")]
    timeout_secs: u64,
}

impl ToolArgs {
    fn pool(&self) -> Result<ExifToolPool> {
        let options = PoolOptions {
            pool_size: self.pool_size,
            executable: self.exiftool.clone(),
            ..PoolOptions::default()
        };
        ExifToolPool::new(options).context("failed to start the exiftool pool")
    }

    fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            command_timeout: Duration::from_secs(self.timeout_secs),
            chunk_size: self.chunk_size.max(1),
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliStrategy {
    Safest,
    Thorough,
    Aggressive,
    #[value(name = "filesystem-only")]
    FilesystemOnly,
}

impl From<CliStrategy> for RepairStrategy {
    fn from(value: CliStrategy) -> Self {
        match value {
            CliStrategy::Safest => RepairStrategy::Safest,
            CliStrategy::Thorough => RepairStrategy::Thorough,
            CliStrategy::Aggressive => RepairStrategy::Aggressive,
            CliStrategy::FilesystemOnly => RepairStrategy::FilesystemOnly,
        }
    }
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Media files or directories to scan.
    #[arg(value_name = "PATH", num_args = 1.., action = ArgAction::Append)]
    paths: Vec<PathBuf>,

    /// Recurse into subdirectories.
    #[arg(long)]
    recursive: bool,

    /// Optional JSON report output file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[command(flatten)]
    tool: ToolArgs,
}

#[derive(Debug, Args)]
struct RepairArgs {
    /// Media files or directories to repair.
    #[arg(value_name = "PATH", num_args = 1.., action = ArgAction::Append)]
    paths: Vec<PathBuf>,

    /// Recurse into subdirectories.
    #[arg(long)]
    recursive: bool,

    /// Directory receiving pre-repair backups.
    #[arg(long, default_value = "capture-aligner-backups", value_name = "DIR")]
    backup_dir: PathBuf,

    /// Pin a single repair strategy instead of the full progression.
    #[arg(long, value_enum)]
    strategy: Option<CliStrategy>,

    /// Optional JSON report output file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[command(flatten)]
    tool: ToolArgs,
}

#[derive(Debug, Args)]
struct AlignArgs {
    /// Media files or directories to align.
    #[arg(value_name = "PATH", num_args = 1.., action = ArgAction::Append)]
    paths: Vec<PathBuf>,

    /// Recurse into subdirectories.
    #[arg(long)]
    recursive: bool,

    /// Signed shift in seconds applied to every capture timestamp.
    #[arg(long, value_name = "SECS", allow_hyphen_values = true)]
    offset_seconds: Option<i64>,

    /// Reference capture time (`YYYY:MM:DD HH:MM:SS`); with --sample,
    /// computes the offset that moves the sample onto the reference.
    #[arg(long, value_name = "TIMESTAMP", requires = "sample")]
    reference: Option<String>,

    /// Sample capture time taken from the camera being corrected.
    #[arg(long, value_name = "TIMESTAMP", requires = "reference")]
    sample: Option<String>,

    /// Files per maintenance group; the pool restarts at group boundaries.
    #[arg(long, default_value_t = 50, value_name = "N")]
    group_size: usize,

    /// Directory receiving pre-repair backups.
    #[arg(long, default_value = "capture-aligner-backups", value_name = "DIR")]
    backup_dir: PathBuf,

    /// Report repairable files without attempting repair.
    #[arg(long)]
    no_repair: bool,

    /// Pin a single repair strategy instead of the full progression.
    #[arg(long, value_enum)]
    strategy: Option<CliStrategy>,

    /// Optional JSON report output file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[command(flatten)]
    tool: ToolArgs,
}

#[derive(Debug, Args)]
struct InspectArgs {
    /// File to dump metadata for.
    #[arg(value_name = "PATH")]
    path: PathBuf,

    #[command(flatten)]
    tool: ToolArgs,
}

#[derive(Debug, Args)]
struct DoctorArgs {
    /// Explicit exiftool executable to check.
    #[arg(long, value_name = "PATH")]
    exiftool: Option<PathBuf>,

    /// Emit the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ScanReportDoc {
    summary: ScanSummary,
    records: Vec<CorruptionRecord>,
}

#[derive(Debug, Serialize)]
struct RepairReportDoc {
    summary: ScanSummary,
    outcomes: Vec<RepairOutcome>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan(args) => run_scan_command(args),
        Commands::Repair(args) => run_repair_command(args),
        Commands::Align(args) => run_align_command(args),
        Commands::Inspect(args) => run_inspect_command(args),
        Commands::Doctor(args) => run_doctor_command(args),
    }
}

fn run_scan_command(args: ScanArgs) -> Result<()> {
    let paths = expand_paths(&args.paths, args.recursive);
    if paths.is_empty() {
        bail!("no media files found under the given paths");
    }

    let pool = args.tool.pool()?;
    let records = scan(&pool, &paths, &args.tool.probe_options());
    pool.shutdown();

    let summary = summarize(records.values());
    for path in &paths {
        let Some(record) = records.get(path) else {
            continue;
        };
        println!(
            "- {} [{}] repairable={} rate={:.1}{}",
            record.path.display(),
            record.corruption_type.as_str(),
            record.is_repairable,
            record.estimated_success_rate,
            if record.diagnostic.is_empty() {
                String::new()
            } else {
                format!(" | {}", record.diagnostic)
            }
        );
    }
    print_summary(&summary);

    if let Some(output) = args.output {
        let ordered = paths
            .iter()
            .filter_map(|path| records.get(path).cloned())
            .collect();
        write_json(
            &output,
            &ScanReportDoc {
                summary,
                records: ordered,
            },
        )?;
        println!("Scan report written to {}", output.display());
    }
    Ok(())
}

fn run_repair_command(args: RepairArgs) -> Result<()> {
    let paths = expand_paths(&args.paths, args.recursive);
    if paths.is_empty() {
        bail!("no media files found under the given paths");
    }

    let pool = args.tool.pool()?;
    let records = scan(&pool, &paths, &args.tool.probe_options());
    let summary = summarize(records.values());
    print_summary(&summary);

    let mut outcomes = Vec::new();
    if summary.repairable_files > 0 {
        let mut session = pool
            .checkout()
            .context("no tool session available for repair")?;
        let options = RepairOptions::default();
        for path in &paths {
            let Some(record) = records.get(path) else {
                continue;
            };
            if record.is_healthy() || !record.is_repairable {
                continue;
            }
            let outcome = repair(
                &mut *session,
                path,
                record.corruption_type,
                &args.backup_dir,
                args.strategy.map(Into::into),
                &options,
            );
            println!(
                "- {} [{}] success={}{}",
                outcome.path.display(),
                outcome.strategy_used.as_str(),
                outcome.success,
                if outcome.error_message.is_empty() {
                    String::new()
                } else {
                    format!(" | {}", outcome.error_message)
                }
            );
            outcomes.push(outcome);
        }
    } else {
        println!("Nothing repairable; no repair attempted.");
    }
    pool.shutdown();

    let repaired = outcomes.iter().filter(|outcome| outcome.success).count();
    println!("Repaired {}/{} file(s).", repaired, outcomes.len());

    if let Some(output) = args.output {
        write_json(&output, &RepairReportDoc { summary, outcomes })?;
        println!("Repair report written to {}", output.display());
    }
    Ok(())
}

fn run_align_command(args: AlignArgs) -> Result<()> {
    let offset_seconds = resolve_offset(&args)?;
    let paths = expand_paths(&args.paths, args.recursive);
    if paths.is_empty() {
        bail!("no media files found under the given paths");
    }

    let pool = args.tool.pool()?;
    let options = AlignOptions {
        offset_seconds,
        group_size: args.group_size,
        chunk_size: args.tool.chunk_size.max(1),
        command_timeout: Duration::from_secs(args.tool.timeout_secs),
        repair: !args.no_repair,
        forced_strategy: args.strategy.map(Into::into),
        backup_dir: args.backup_dir.clone(),
        ..AlignOptions::default()
    };
    let report = align(&pool, &paths, &options);
    pool.shutdown();

    println!(
        "Offset: {} ({offset_seconds}s) across {} file(s).",
        describe_offset(offset_seconds),
        report.scanned_files
    );
    println!(
        "Healthy: {}, repaired: {}, failed repairs: {}, unrepairable: {}.",
        report.healthy_files,
        report.repaired_files,
        report.failed_repairs,
        report.unrepairable_files
    );
    println!(
        "Updated: {}, skipped: {}, write failures: {}, pool restarts: {}.",
        report.updated_files,
        report.skipped_files,
        report.write_failures,
        report.pool_restarts
    );
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }

    if let Some(output) = args.output {
        write_json(&output, &report)?;
        println!("Alignment report written to {}", output.display());
    }
    Ok(())
}

fn run_inspect_command(args: InspectArgs) -> Result<()> {
    if !args.path.is_file() {
        bail!("{} is not a file", args.path.display());
    }
    let executable = locate_executable(args.tool.exiftool.as_deref())?;
    let mut process = ExifToolProcess::new(executable);
    let dump = inspect_file(
        &mut process,
        &args.path,
        Duration::from_secs(args.tool.timeout_secs),
    )
    .with_context(|| format!("could not read metadata from {}", args.path.display()))?;
    println!("{dump}");
    Ok(())
}

fn run_doctor_command(args: DoctorArgs) -> Result<()> {
    let info = collect_doctor_info(args.exiftool.as_deref());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("OS: {} ({})", info.os, info.arch);
    if let Some(current_dir) = info.current_dir {
        println!("Current directory: {current_dir}");
    }
    match (&info.exiftool_path, &info.exiftool_version) {
        (Some(path), Some(version)) => println!("exiftool: {path} (version {version})"),
        (Some(path), None) => println!("exiftool: {path} (version unknown)"),
        (None, _) => println!("exiftool: not found"),
    }
    println!(
        "Supported formats: {} photo, {} video.",
        info.photo_formats, info.video_formats
    );
    for note in info.notes {
        println!("Note: {note}");
    }
    Ok(())
}

fn resolve_offset(args: &AlignArgs) -> Result<i64> {
    match (args.offset_seconds, &args.reference, &args.sample) {
        (Some(_), Some(_), _) => {
            bail!("--offset-seconds and --reference/--sample are mutually exclusive")
        }
        (Some(offset), None, _) => Ok(offset),
        (None, Some(reference), Some(sample)) => offset_between(reference, sample)
            .context("could not parse --reference/--sample timestamps"),
        _ => bail!("provide --offset-seconds or both --reference and --sample"),
    }
}

fn print_summary(summary: &ScanSummary) {
    println!(
        "Scanned {} file(s): {} healthy, {} repairable, {} unrepairable.",
        summary.total_files,
        summary.healthy_files,
        summary.repairable_files,
        summary.unrepairable_files
    );
    for (corruption_type, count) in &summary.corruption_types {
        println!("- {corruption_type}: {count}");
    }
}

fn write_json<T: Serialize>(output: &PathBuf, value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("failed to serialize report")?;
    fs::write(output, payload)
        .with_context(|| format!("failed to write report to {}", output.display()))?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
