pub mod align;
pub mod backup;
pub mod cache;
pub mod classify;
pub mod datetime;
pub mod doctor;
pub mod error;
pub mod formats;
pub mod metadata;
pub mod pool;
pub mod process;
pub mod repair;

#[cfg(test)]
pub(crate) mod testing;

pub use align::{align, AlignOptions, AlignReport, FileReport, FileStatus, REPORT_VERSION};
pub use backup::FileBackup;
pub use cache::MetadataCache;
pub use classify::{
    classify_file, scan, summarize, CorruptionRecord, CorruptionType, ProbeOptions, ScanSummary,
};
pub use datetime::{describe_offset, offset_between, parse_capture_value, shift_capture_value};
pub use doctor::{collect_doctor_info, DoctorInfo};
pub use error::{BackupError, ToolError};
pub use formats::{expand_paths, is_supported_media, media_kind, MediaKind};
pub use metadata::{read_batch, update_confirmed, FileMetadata};
pub use pool::{ExifToolPool, PoolOptions, PooledProcess};
pub use process::{locate_executable, ExifToolProcess, ProcessState, ToolOutput, ToolSession};
pub use repair::{repair, RepairOptions, RepairOutcome, RepairStrategy};
