use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::pool::ExifToolPool;
use crate::process::{path_list_args, write_arg_file, ToolSession};

/// The only place that knows what the tool prints on a confirmed write.
///
/// Classification's write probe, repair verification, and datetime writes all
/// decide success through this one adapter, so a tool version that changes
/// its phrasing breaks exactly one function.
pub fn update_confirmed(stdout: &str) -> bool {
    stdout.contains("1 image files updated") || stdout.contains("1 files updated")
}

/// Shaped record from one tool JSON read. One per input path, always, even
/// when the tool returned fewer records; a padded record carries `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: PathBuf,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// String-valued tags as the tool printed them, timestamps included.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FileMetadata {
    pub fn missing(path: &Path, error: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            make: None,
            model: None,
            tags: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_readable(&self) -> bool {
        self.error.is_none()
    }
}

/// Reads timestamp tags plus camera make/model for a batch of paths over one
/// session. Output lines up with `paths` index for index; a record the tool
/// did not return comes back as a padded error record rather than shifting
/// its neighbours.
pub fn read_batch_session(
    session: &mut dyn ToolSession,
    paths: &[PathBuf],
    timeout: Duration,
) -> Result<Vec<FileMetadata>, ToolError> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }

    let arg_file = write_arg_file(paths)?;
    let mut args = vec![
        "-json".to_string(),
        "-time:all".to_string(),
        "-make".to_string(),
        "-model".to_string(),
    ];
    args.extend(path_list_args(&arg_file));

    let output = session.execute(&args, timeout)?;
    Ok(correlate_records(paths, &output.stdout))
}

/// Chunked batch read across the pool. Order preservation and padding come
/// from `dispatch_chunks` slots plus per-chunk correlation; a chunk that
/// never got a session degrades to error records, not a shorter result.
pub fn read_batch(
    pool: &ExifToolPool,
    paths: &[PathBuf],
    chunk_size: usize,
    timeout: Duration,
) -> Vec<FileMetadata> {
    let slots = pool.dispatch_chunks(paths, chunk_size, |session, chunk, out| {
        match read_batch_session(session, chunk, timeout) {
            Ok(records) => {
                for (slot, record) in out.iter_mut().zip(records) {
                    *slot = Some(record);
                }
            }
            Err(error) => {
                warn!(%error, files = chunk.len(), "batch metadata read failed");
                for (slot, path) in out.iter_mut().zip(chunk) {
                    *slot = Some(FileMetadata::missing(path, error.to_string()));
                }
            }
        }
    });

    slots
        .into_iter()
        .zip(paths)
        .map(|(slot, path)| {
            slot.unwrap_or_else(|| FileMetadata::missing(path, "no tool session available"))
        })
        .collect()
}

pub fn read_single(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> Result<FileMetadata, ToolError> {
    let records = read_batch_session(session, &[path.to_path_buf()], timeout)?;
    records.into_iter().next().ok_or_else(|| ToolError::Parse {
        detail: "batch read returned no records for a single path".to_string(),
    })
}

/// Full tag dump (`-a -u -g1`) for one file, duplicates and unknown tags
/// included, grouped by container. Human-oriented; the CLI `inspect` command
/// prints it verbatim.
pub fn inspect_file(
    session: &mut dyn ToolSession,
    path: &Path,
    timeout: Duration,
) -> Result<String, ToolError> {
    let arg_file = write_arg_file(&[path.to_path_buf()])?;
    let mut args = vec!["-a".to_string(), "-u".to_string(), "-g1".to_string()];
    args.extend(path_list_args(&arg_file));

    let output = session.execute(&args, timeout)?;
    if output.stdout.trim().is_empty() {
        return Err(ToolError::Invocation {
            stderr: if output.stderr.trim().is_empty() {
                "no metadata readable".to_string()
            } else {
                output.stderr.trim().to_string()
            },
        });
    }
    Ok(output.stdout.trim().to_string())
}

/// Writes tag values in place (`-overwrite_original`). Returns whether the
/// tool confirmed the update; an unconfirmed write is a `false`, not an
/// error, because the caller decides whether that degrades the file or the
/// run.
pub fn apply_tag_values(
    session: &mut dyn ToolSession,
    path: &Path,
    fields: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<bool, ToolError> {
    if fields.is_empty() {
        return Ok(false);
    }

    let arg_file = write_arg_file(&[path.to_path_buf()])?;
    let mut args = vec![
        "-overwrite_original".to_string(),
        "-ignoreMinorErrors".to_string(),
        "-m".to_string(),
    ];
    for (tag, value) in fields {
        args.push(format!("-{tag}={value}"));
    }
    args.extend(path_list_args(&arg_file));

    let output = session.execute(&args, timeout)?;
    let confirmed = update_confirmed(&output.stdout);
    if !confirmed {
        debug!(
            path = %path.display(),
            stdout = %output.stdout.trim(),
            stderr = %output.stderr.trim(),
            "tool did not confirm the tag update"
        );
    }
    Ok(confirmed)
}

/// Pairs tool JSON records back to the input paths by their embedded
/// `SourceFile` field. Count mismatches and parse failures pad rather than
/// abort so callers can keep zipping inputs with outputs.
fn correlate_records(paths: &[PathBuf], stdout: &str) -> Vec<FileMetadata> {
    let parsed: Vec<Value> = match serde_json::from_str(stdout.trim()) {
        Ok(Value::Array(records)) => records,
        Ok(_) => {
            warn!("tool JSON output was not an array; padding all records");
            return paths
                .iter()
                .map(|path| FileMetadata::missing(path, "malformed tool output"))
                .collect();
        }
        Err(error) => {
            warn!(%error, "could not parse tool JSON output; padding all records");
            return paths
                .iter()
                .map(|path| FileMetadata::missing(path, format!("unparseable tool output: {error}")))
                .collect();
        }
    };

    let mut by_source: BTreeMap<String, Value> = BTreeMap::new();
    for record in parsed {
        if let Some(source) = record.get("SourceFile").and_then(Value::as_str) {
            by_source.insert(source.to_string(), record);
        }
    }

    paths
        .iter()
        .map(|path| {
            let key = path.display().to_string();
            match by_source.remove(&key) {
                Some(record) => shape_record(path, &record),
                None => {
                    debug!(path = %key, "tool returned no record for this path; padding");
                    FileMetadata::missing(path, "tool returned no record for this file")
                }
            }
        })
        .collect()
}

fn shape_record(path: &Path, record: &Value) -> FileMetadata {
    let mut metadata = FileMetadata {
        path: path.to_path_buf(),
        make: None,
        model: None,
        tags: BTreeMap::new(),
        error: None,
    };

    let Some(object) = record.as_object() else {
        metadata.error = Some("record was not a JSON object".to_string());
        return metadata;
    };

    for (key, value) in object {
        let Some(text) = value.as_str() else { continue };
        match key.as_str() {
            "SourceFile" => {}
            "Make" => metadata.make = Some(text.to_string()),
            "Model" => metadata.model = Some(text.to_string()),
            "Error" => metadata.error = Some(text.to_string()),
            _ => {
                metadata.tags.insert(key.clone(), text.to_string());
            }
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_adapter_accepts_both_tool_phrasings() {
        assert!(update_confirmed("    1 image files updated\n"));
        assert!(update_confirmed("1 files updated"));
        assert!(!update_confirmed("0 image files updated"));
        assert!(!update_confirmed("1 image files unchanged"));
        assert!(!update_confirmed(""));
    }

    #[test]
    fn records_are_correlated_by_source_file_not_position() {
        let paths = vec![PathBuf::from("/p/a.jpg"), PathBuf::from("/p/b.jpg")];
        // Tool output order reversed relative to input.
        let stdout = r#"[
            {"SourceFile": "/p/b.jpg", "CreateDate": "2023:07:14 10:30:00"},
            {"SourceFile": "/p/a.jpg", "Make": "Canon", "CreateDate": "2023:07:14 09:00:00"}
        ]"#;

        let records = correlate_records(&paths, stdout);
        assert_eq!(records[0].path, paths[0]);
        assert_eq!(records[0].make.as_deref(), Some("Canon"));
        assert_eq!(
            records[0].tags.get("CreateDate").map(String::as_str),
            Some("2023:07:14 09:00:00")
        );
        assert_eq!(records[1].path, paths[1]);
        assert!(records[1].make.is_none());
    }

    #[test]
    fn missing_records_are_padded_not_dropped() {
        let paths = vec![PathBuf::from("/p/a.jpg"), PathBuf::from("/p/b.jpg")];
        let stdout = r#"[{"SourceFile": "/p/a.jpg", "CreateDate": "2023:07:14 10:30:00"}]"#;

        let records = correlate_records(&paths, stdout);
        assert_eq!(records.len(), 2);
        assert!(records[0].is_readable());
        assert!(!records[1].is_readable());
        assert_eq!(records[1].path, paths[1]);
    }

    #[test]
    fn unparseable_output_degrades_every_record() {
        let paths = vec![PathBuf::from("/p/a.jpg")];
        let records = correlate_records(&paths, "not json at all");
        assert_eq!(records.len(), 1);
        assert!(records[0].error.as_deref().unwrap_or("").contains("unparseable"));
    }

    #[test]
    fn embedded_error_fields_mark_the_record_unreadable() {
        let paths = vec![PathBuf::from("/p/a.jpg")];
        let stdout = r#"[{"SourceFile": "/p/a.jpg", "Error": "File format error"}]"#;
        let records = correlate_records(&paths, stdout);
        assert_eq!(records[0].error.as_deref(), Some("File format error"));
        assert!(!records[0].is_readable());
    }
}
