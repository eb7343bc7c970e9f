//! Enumerates a peer's shared folder into [`FileRecord`]s.

use chrono::{DateTime, Utc};
use sharenet_types::{
    is_shareable_name, validate_filename, ContentHash, FileRecord, FilenameError, PeerId,
    STAGING_SUFFIX,
};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("shared folder {path} is not readable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("shared folder {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// The flat directory a peer shares. Only regular files directly under the
/// root are shared; subdirectories, symlinks and dotfiles are ignored.
#[derive(Debug, Clone)]
pub struct SharedFolder {
    root: PathBuf,
    owner: PeerId,
}

impl SharedFolder {
    pub fn new(root: impl Into<PathBuf>, owner: PeerId) -> Self {
        Self {
            root: root.into(),
            owner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    /// Create the root if missing.
    pub fn ensure_exists(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// Blocking. Files that vanish or cannot be read mid-scan are skipped.
    pub fn scan(&self) -> Result<Vec<FileRecord>, ScanError> {
        let meta = fs::metadata(&self.root).map_err(|source| ScanError::Unreadable {
            path: self.root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory(self.root.clone()));
        }

        let entries = fs::read_dir(&self.root).map_err(|source| ScanError::Unreadable {
            path: self.root.clone(),
            source,
        })?;

        let indexed_at = Utc::now();
        let mut records = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry in {}: {}", self.root.display(), err);
                    continue;
                }
            };

            let filename = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!("skipping non UTF-8 filename {:?}", raw);
                    continue;
                }
            };
            if !is_shareable_name(&filename) {
                continue;
            }

            // file_type() does not follow symlinks
            match entry.file_type() {
                Ok(kind) if kind.is_file() => {}
                _ => continue,
            }

            match self.describe(&filename, &entry.path(), indexed_at) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping {}: {}", entry.path().display(), err),
            }
        }

        records.sort_by(|a, b| a.filename.cmp(&b.filename));
        debug!(
            "scanned {} shareable files in {}",
            records.len(),
            self.root.display()
        );
        Ok(records)
    }

    fn describe(
        &self,
        filename: &str,
        path: &Path,
        indexed_at: DateTime<Utc>,
    ) -> io::Result<FileRecord> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;

        Ok(FileRecord {
            filename: filename.to_string(),
            owner: self.owner.clone(),
            size_bytes: metadata.len(),
            content_hash: ContentHash::from(hasher.finalize()),
            path: filename.to_string(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            indexed_at,
        })
    }

    /// Path of a shared file, if `filename` names a regular file directly
    /// under the root. Names that could escape the root are rejected.
    pub fn resolve(&self, filename: &str) -> Result<Option<PathBuf>, FilenameError> {
        validate_filename(filename)?;
        if !is_shareable_name(filename) {
            return Ok(None);
        }
        let path = self.root.join(filename);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            _ => Ok(None),
        }
    }

    /// Destination for a validated filename.
    pub fn target_path(&self, filename: &str) -> Result<PathBuf, FilenameError> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    /// Unique hidden path in the root for staging an incoming upload.
    /// The name never embeds the upload's filename, so it stays short for
    /// any valid target. Hidden names are skipped by [`SharedFolder::scan`].
    pub fn staging_path(&self) -> PathBuf {
        let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            ".upload.{}.{}{}",
            std::process::id(),
            n,
            STAGING_SUFFIX
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharenet_types::MAX_FILENAME_LEN;
    use tempfile::TempDir;

    fn folder(dir: &TempDir) -> SharedFolder {
        SharedFolder::new(dir.path(), PeerId::parse("peer1").unwrap())
    }

    #[test]
    fn test_scan_lists_regular_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), b"bravo").unwrap();
        fs::write(dir.path().join("a.txt"), vec![7u8; 120]).unwrap();
        fs::write(dir.path().join(".hidden"), b"secret").unwrap();
        fs::write(dir.path().join("upload.part"), b"partial").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("deep.txt"), b"deep").unwrap();

        let records = folder(&dir).scan().unwrap();
        let names: Vec<_> = records.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let a = &records[0];
        assert_eq!(a.size_bytes, 120);
        assert_eq!(a.owner.as_str(), "peer1");
        assert_eq!(a.path, "a.txt");
        assert_eq!(a.content_hash, ContentHash::from_data(&[7u8; 120]));
        assert!(a.modified_at.is_some());
    }

    #[test]
    fn test_empty_folder() {
        let dir = TempDir::new().unwrap();
        assert!(folder(&dir).scan().unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = SharedFolder::new(dir.path().join("nope"), PeerId::parse("p").unwrap());
        assert!(matches!(missing.scan(), Err(ScanError::Unreadable { .. })));

        let file = dir.path().join("plain.txt");
        fs::write(&file, b"x").unwrap();
        let not_dir = SharedFolder::new(&file, PeerId::parse("p").unwrap());
        assert!(matches!(not_dir.scan(), Err(ScanError::NotADirectory(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_shared() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("secret.txt");
        fs::write(&target, b"secret").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link.txt")).unwrap();

        let shared = folder(&dir);
        assert!(shared.scan().unwrap().is_empty());
        assert_eq!(shared.resolve("link.txt").unwrap(), None);
    }

    #[test]
    fn test_resolve() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("report.txt"), b"data").unwrap();
        let shared = folder(&dir);

        assert_eq!(
            shared.resolve("report.txt").unwrap(),
            Some(dir.path().join("report.txt"))
        );
        assert_eq!(shared.resolve("missing.txt").unwrap(), None);
        assert!(shared.resolve("../report.txt").is_err());
        assert!(shared.resolve("").is_err());
    }

    #[test]
    fn test_staging_paths_are_hidden_and_unique() {
        let dir = TempDir::new().unwrap();
        let shared = folder(&dir);
        let a = shared.staging_path();
        let b = shared.staging_path();
        assert_ne!(a, b);
        fs::write(&a, b"partial").unwrap();
        assert!(shared.scan().unwrap().is_empty());
    }

    #[test]
    fn test_staging_name_is_short_for_longest_filename() {
        let dir = TempDir::new().unwrap();
        let shared = folder(&dir);
        let longest = format!("{}.txt", "a".repeat(MAX_FILENAME_LEN - 4));
        let target = shared.target_path(&longest).unwrap();
        let staged = shared.staging_path();

        let staged_name = staged.file_name().unwrap().to_str().unwrap();
        assert!(staged_name.len() < 64);
        fs::write(&staged, b"payload").unwrap();
        fs::rename(&staged, &target).unwrap();
        assert_eq!(shared.resolve(&longest).unwrap(), Some(target));
    }
}
