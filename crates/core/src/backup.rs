use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::BackupError;

/// Pre-mutation copy of a media file.
///
/// Every destructive tool command is preceded by one of these. Probe backups
/// restore by rename and disappear; repair backups restore by copy and stay
/// on disk so the caller can point at them in the report.
#[derive(Debug)]
pub struct FileBackup {
    original: PathBuf,
    backup: PathBuf,
}

impl FileBackup {
    /// Copies `original` next to itself (or into `backup_dir`) and proves the
    /// copy byte-identical before declaring it usable. A copy that cannot be
    /// verified is removed and reported as a failure.
    pub fn create(original: &Path, backup_dir: Option<&Path>) -> Result<Self, BackupError> {
        let create_error = |source: io::Error| BackupError::Create {
            path: original.to_path_buf(),
            source,
        };

        let dir = match backup_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(create_error)?;
                dir.to_path_buf()
            }
            None => original
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        let backup = free_backup_path(original, &dir);
        fs::copy(original, &backup).map_err(create_error)?;

        let original_digest = file_digest(original).map_err(create_error)?;
        let backup_digest = file_digest(&backup).map_err(create_error)?;
        if original_digest != backup_digest {
            let _ = fs::remove_file(&backup);
            return Err(BackupError::Mismatch {
                path: original.to_path_buf(),
            });
        }

        debug!(original = %original.display(), backup = %backup.display(), "backup verified");
        Ok(Self {
            original: original.to_path_buf(),
            backup,
        })
    }

    pub fn original(&self) -> &Path {
        &self.original
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Copies the backup over the original; the backup stays on disk.
    pub fn restore(&self) -> Result<(), BackupError> {
        fs::copy(&self.backup, &self.original)
            .map(|_| ())
            .map_err(|source| self.restore_error(source))
    }

    /// Puts the original bytes back and removes the backup. Probes use this;
    /// they must leave no trace on disk.
    pub fn restore_and_discard(self) -> Result<(), BackupError> {
        if fs::rename(&self.backup, &self.original).is_ok() {
            return Ok(());
        }
        // Rename fails across filesystems; copy and remove instead.
        self.restore()?;
        fs::remove_file(&self.backup).map_err(|source| self.restore_error(source))
    }

    /// Removes the backup without touching the original.
    pub fn discard(self) -> Result<(), BackupError> {
        fs::remove_file(&self.backup).map_err(|source| self.restore_error(source))
    }

    fn restore_error(&self, source: io::Error) -> BackupError {
        BackupError::Restore {
            path: self.original.clone(),
            backup: self.backup.clone(),
            source,
        }
    }
}

/// `IMG_0042.jpg` backs up as `IMG_0042_backup.jpg`; existing names get a
/// numeric suffix rather than being overwritten.
fn free_backup_path(original: &Path, dir: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let extension = original
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let mut candidate = dir.join(format!("{stem}_backup{extension}"));
    let mut counter = 2;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_backup_{counter}{extension}"));
        counter += 1;
    }
    candidate
}

fn file_digest(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0_u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write fixture");
        path
    }

    #[test]
    fn backup_is_verified_and_named_after_the_original() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = write_file(dir.path(), "IMG_0042.jpg", b"original bytes");

        let backup = FileBackup::create(&original, None).expect("create backup");

        assert_eq!(
            backup.backup_path().file_name().and_then(|n| n.to_str()),
            Some("IMG_0042_backup.jpg")
        );
        let copied = fs::read(backup.backup_path()).expect("read backup");
        assert_eq!(copied, b"original bytes");
    }

    #[test]
    fn backup_name_collisions_get_a_numeric_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = write_file(dir.path(), "IMG_0042.jpg", b"original");
        write_file(dir.path(), "IMG_0042_backup.jpg", b"already here");

        let backup = FileBackup::create(&original, None).expect("create backup");

        assert_eq!(
            backup.backup_path().file_name().and_then(|n| n.to_str()),
            Some("IMG_0042_backup_2.jpg")
        );
        let untouched = fs::read(dir.path().join("IMG_0042_backup.jpg")).expect("read");
        assert_eq!(untouched, b"already here");
    }

    #[test]
    fn explicit_backup_dir_receives_the_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = dir.path().join("vault");
        let original = write_file(dir.path(), "clip.mov", b"frames");

        let backup = FileBackup::create(&original, Some(&vault)).expect("create backup");

        assert!(backup.backup_path().starts_with(&vault));
        assert!(backup.backup_path().exists());
    }

    #[test]
    fn restore_puts_the_original_bytes_back_and_keeps_the_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = write_file(dir.path(), "IMG_0001.jpg", b"good");

        let backup = FileBackup::create(&original, None).expect("create backup");
        fs::write(&original, b"mangled by a failed rewrite").expect("mangle");

        backup.restore().expect("restore");

        assert_eq!(fs::read(&original).expect("read"), b"good");
        assert!(backup.backup_path().exists());
    }

    #[test]
    fn restore_and_discard_consumes_the_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = write_file(dir.path(), "IMG_0001.jpg", b"good");

        let backup = FileBackup::create(&original, None).expect("create backup");
        let backup_path = backup.backup_path().to_path_buf();
        fs::write(&original, b"probe write").expect("mangle");

        backup.restore_and_discard().expect("restore");

        assert_eq!(fs::read(&original).expect("read"), b"good");
        assert!(!backup_path.exists());
    }

    #[test]
    fn missing_original_is_a_create_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.jpg");

        let error = FileBackup::create(&missing, None).expect_err("must fail");
        assert!(matches!(error, BackupError::Create { .. }));
    }
}
