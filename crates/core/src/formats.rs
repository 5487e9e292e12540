use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

/// Photo extensions the tool can read and write, lowercase without the dot.
const PHOTO_EXTENSIONS: &[&str] = &[
    // common
    "jpg", "jpeg", "png", "bmp", "tiff", "tif", "gif",
    // raw
    "cr2", "nef", "arw", "dng", "orf", "rw2", "raf", "raw", "rwl", "dcr", "srw", "x3f",
    // modern
    "heic", "heif", "webp", "avif", "jxl",
    // professional
    "psd", "exr", "hdr", "tga",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    // common
    "mp4", "mov", "avi", "mkv", "wmv", "flv", "webm", "m4v", "mpg", "mpeg",
    // professional
    "mxf", "r3d", "braw",
    // mobile
    "3gp", "3g2", "mts", "m2ts",
    // other
    "ts", "vob", "ogv", "asf", "m2v", "f4v",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

/// Classifies a path by extension, case-insensitively. `None` means the file
/// is not a media format the aligner handles.
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if PHOTO_EXTENSIONS.contains(&extension.as_str()) {
        return Some(MediaKind::Photo);
    }
    if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        return Some(MediaKind::Video);
    }
    None
}

pub fn is_supported_media(path: &Path) -> bool {
    media_kind(path).is_some()
}

pub fn photo_format_count() -> usize {
    PHOTO_EXTENSIONS.len()
}

pub fn video_format_count() -> usize {
    VIDEO_EXTENSIONS.len()
}

/// Expands a mixed list of files and directories into a flat list of media
/// files. Files are kept as given (even with unknown extensions, so an
/// explicit argument is never silently ignored); directories are walked and
/// filtered through the format registry. The result is sorted and
/// deduplicated so batch ordering is stable across runs.
pub fn expand_paths(inputs: &[PathBuf], recursive: bool) -> Vec<PathBuf> {
    let mut expanded = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let max_depth = if recursive { usize::MAX } else { 1 };
            for entry in WalkDir::new(input).max_depth(max_depth) {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        if is_supported_media(entry.path()) {
                            expanded.push(entry.path().to_path_buf());
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "skipping unreadable directory entry");
                    }
                }
            }
        } else {
            expanded.push(input.clone());
        }
    }
    expanded.sort();
    expanded.dedup();
    expanded
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn extension_matching_is_case_insensitive() {
        assert_eq!(media_kind(Path::new("a/IMG_0042.JPG")), Some(MediaKind::Photo));
        assert_eq!(media_kind(Path::new("clip.MOV")), Some(MediaKind::Video));
        assert_eq!(media_kind(Path::new("photo.HeIc")), Some(MediaKind::Photo));
        assert_eq!(media_kind(Path::new("notes.txt")), None);
        assert_eq!(media_kind(Path::new("no_extension")), None);
    }

    #[test]
    fn expand_walks_directories_and_keeps_explicit_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.jpg"), b"x").expect("write");
        fs::write(dir.path().join("a.mov"), b"x").expect("write");
        fs::write(dir.path().join("readme.txt"), b"x").expect("write");
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).expect("mkdir");
        fs::write(nested.join("c.png"), b"x").expect("write");

        let explicit = dir.path().join("readme.txt");
        let flat = expand_paths(&[dir.path().to_path_buf(), explicit.clone()], false);
        assert_eq!(
            flat,
            vec![dir.path().join("a.mov"), dir.path().join("b.jpg"), explicit.clone()]
        );

        let deep = expand_paths(&[dir.path().to_path_buf()], true);
        assert!(deep.contains(&nested.join("c.png")));
        assert!(!deep.contains(&dir.path().join("readme.txt")));
    }
}
