use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures raised while driving the external metadata tool or its pool.
///
/// Process-level variants (`Timeout`, `ProcessDead`) are recovered locally by
/// restarting the affected process; they surface to callers only as degraded
/// per-file records, never as batch aborts.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("could not launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("no response from the tool within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("tool process is not running: {detail}")]
    ProcessDead { detail: String },

    #[error("tool rejected the command: {stderr}")]
    Invocation { stderr: String },

    #[error("could not parse tool output: {detail}")]
    Parse { detail: String },

    #[error("no pooled process became available within {timeout:?}")]
    PoolExhausted { timeout: Duration },

    #[error("pool is draining for a restart")]
    PoolDraining,

    #[error("pool has been shut down")]
    PoolClosed,

    #[error("i/o failure while driving the tool: {0}")]
    Io(#[from] io::Error),
}

/// Failures raised while creating or restoring pre-mutation file backups.
///
/// A backup failure is fatal for that file's repair only; the surrounding
/// batch continues.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("could not back up {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup of {} is not byte-identical to the original", path.display())]
    Mismatch { path: PathBuf },

    #[error("could not restore {} from {}: {source}", path.display(), backup.display())]
    Restore {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },
}
