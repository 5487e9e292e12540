use std::env;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::formats::{photo_format_count, video_format_count};
use crate::process::locate_executable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub exiftool_path: Option<String>,
    pub exiftool_version: Option<String>,
    pub photo_formats: usize,
    pub video_formats: usize,
    pub notes: Vec<String>,
}

/// Environment report for the `doctor` subcommand: resolved tool path, its
/// version from a one-shot invocation, and the format registry sizes.
pub fn collect_doctor_info(explicit_tool: Option<&Path>) -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());

    let mut notes = Vec::new();
    let (exiftool_path, exiftool_version) = match locate_executable(explicit_tool) {
        Ok(path) => {
            let version = query_version(&path);
            if version.is_none() {
                notes.push("exiftool was found but did not answer a version query.".to_string());
            }
            (Some(path.display().to_string()), version)
        }
        Err(error) => {
            notes.push(format!("exiftool is not available: {error}"));
            notes.push(
                "Install exiftool or point --exiftool at the executable.".to_string(),
            );
            (None, None)
        }
    };

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        current_dir,
        exiftool_path,
        exiftool_version,
        photo_formats: photo_format_count(),
        video_formats: video_format_count(),
        notes,
    }
}

/// One-shot `-ver` outside the persistent session; the only probe with a
/// real exit status.
fn query_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("-ver").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}
