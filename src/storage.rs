//! Filesystem storage for trial directories.
//!
//! Every trial owns a directory under a common root; the manifest, the
//! checkpoint blob, metric files, and attachments all live inside it. Writes
//! go through [`AtomicFile`], which stages content in a temp file and
//! publishes it with a single rename, so no partially written file is ever
//! observable regardless of where a writer dies.
//!
//! Retention and deletion are deliberately absent: this layer only ever
//! creates and reads.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::{Error, Result};

/// Filesystem store anchored at a root directory.
///
/// Trial ids are hierarchical (`"sweep/lr-0.1"`) and map directly to
/// subdirectories of the root. Paths of distinct trials are disjoint, which
/// is what lets trials run without cross-trial locking.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by the trial `tid`.
    #[must_use]
    pub fn trial_dir(&self, tid: &str) -> PathBuf {
        self.root.join(tid)
    }

    /// Whether a file exists under the root.
    #[must_use]
    pub fn exists(&self, rel: &str) -> bool {
        self.root.join(rel).exists()
    }

    /// Open a file under the root for reading.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file is missing or unreadable.
    pub fn open_read(&self, rel: &str) -> Result<File> {
        Ok(File::open(self.root.join(rel))?)
    }

    /// Read a whole file under the root into a string.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file is missing or unreadable.
    pub fn read_to_string(&self, rel: &str) -> Result<String> {
        let mut buf = String::new();
        self.open_read(rel)?.read_to_string(&mut buf)?;
        Ok(buf)
    }

    /// Open a file under the root for writing through the atomic-commit
    /// discipline.
    ///
    /// With `autocommit` the content is published when the handle is closed
    /// or dropped, even if the caller's code panics in between. Without it,
    /// the caller must invoke [`AtomicFile::commit`] explicitly; a dropped
    /// uncommitted handle discards the staged content.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the parent directory or temp file cannot be
    /// created.
    pub fn open_write(&self, rel: &str, autocommit: bool) -> Result<AtomicFile> {
        AtomicFile::create(self.root.join(rel), autocommit)
    }

    /// Deserialize a JSON file under the root.
    ///
    /// # Errors
    /// Returns [`Error::Io`] or [`Error::Serde`].
    pub fn read_json<T: DeserializeOwned>(&self, rel: &str) -> Result<T> {
        let file = self.open_read(rel)?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }

    /// Serialize a value as pretty JSON and publish it atomically.
    ///
    /// # Errors
    /// Returns [`Error::Io`] or [`Error::Serde`].
    pub fn write_json<T: Serialize>(&self, rel: &str, value: &T) -> Result<()> {
        let mut file = self.open_write(rel, false)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.commit()
    }

    /// Discover trial ids under the root by locating files named
    /// `marker` (the manifest file name), sorted for determinism.
    #[must_use]
    pub fn find_trials(&self, marker: &str) -> Vec<String> {
        let mut tids = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if entry.file_type().is_file() && entry.file_name() == marker {
                if let Some(dir) = entry.path().parent() {
                    if let Ok(rel) = dir.strip_prefix(&self.root) {
                        tids.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        tids.sort();
        tids
    }

    /// List files inside a trial directory, relative to it, excluding
    /// `marker` and staged temp files.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the directory cannot be traversed.
    pub fn list_attachments(&self, tid: &str, marker: &str) -> Result<Vec<String>> {
        let dir = self.trial_dir(tid);
        let mut names = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|e| Error::other(format!("walk {}: {e}", dir.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&dir)
                .map_err(Error::other)?
                .to_string_lossy()
                .replace('\\', "/");
            if rel == marker || rel.ends_with(".tmp") {
                continue;
            }
            names.push(rel);
        }
        names.sort();
        Ok(names)
    }
}

/// Write handle with write-then-atomically-publish semantics.
///
/// Content is staged in `<name>.<uuid>.tmp` next to the destination and moved
/// into place by a rename on commit. A reader can therefore only ever observe
/// the previous complete content or the new complete content.
pub struct AtomicFile {
    dest: PathBuf,
    tmp: PathBuf,
    writer: Option<BufWriter<File>>,
    autocommit: bool,
}

impl AtomicFile {
    fn create(dest: PathBuf, autocommit: bool) -> Result<Self> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::other(format!("not a file path: {}", dest.display())))?;
        let tmp = dest.with_file_name(format!(
            ".{file_name}.{}.tmp",
            uuid::Uuid::new_v4().simple()
        ));
        let writer = BufWriter::new(File::create(&tmp)?);
        Ok(Self {
            dest,
            tmp,
            writer: Some(writer),
            autocommit,
        })
    }

    /// Destination path the content will be published at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dest
    }

    /// Flush, sync, and publish the staged content with a rename.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on flush, sync, or rename failure; the staged
    /// temp file is removed either way.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let result = (|| {
            let file = writer
                .into_inner()
                .map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
            file.sync_all()?;
            fs::rename(&self.tmp, &self.dest)?;
            debug!(path = %self.dest.display(), "published file");
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&self.tmp);
        }
        result
    }

    fn discard(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
            debug!(path = %self.dest.display(), "discarded staged file");
        }
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::other("write after commit")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.writer.is_none() {
            return;
        }
        if self.autocommit {
            if let Err(e) = self.commit_inner() {
                error!(path = %self.dest.display(), "autocommit failed: {e}");
            }
        } else {
            self.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_autocommit_publishes_on_drop() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());

        {
            let mut f = store.open_write("t1/out.txt", true).unwrap();
            f.write_all(b"hello").unwrap();
        }

        assert_eq!(store.read_to_string("t1/out.txt").unwrap(), "hello");
    }

    #[test]
    fn test_no_autocommit_discards_without_commit() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());

        {
            let mut f = store.open_write("t1/out.txt", false).unwrap();
            f.write_all(b"hello").unwrap();
        }

        assert!(!store.exists("t1/out.txt"));
        // No stray temp files either
        assert!(store.list_attachments("t1", "trial.json").unwrap().is_empty());
    }

    #[test]
    fn test_explicit_commit_publishes() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());

        let mut f = store.open_write("t1/out.txt", false).unwrap();
        f.write_all(b"content").unwrap();
        f.commit().unwrap();

        assert_eq!(store.read_to_string("t1/out.txt").unwrap(), "content");
    }

    #[test]
    fn test_partial_write_never_visible() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());

        let mut f = store.open_write("t1/out.txt", true).unwrap();
        f.write_all(b"partial").unwrap();
        // While the handle is open, the destination must not exist.
        assert!(!store.exists("t1/out.txt"));
        drop(f);
        assert!(store.exists("t1/out.txt"));
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());

        let value = serde_json::json!({"a": 1, "b": [1, 2, 3]});
        store.write_json("t1/data.json", &value).unwrap();
        let back: serde_json::Value = store.read_json("t1/data.json").unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_find_trials_hierarchical() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.write_json("sweep/a/trial.json", &1).unwrap();
        store.write_json("sweep/b/trial.json", &2).unwrap();
        store.write_json("sweep/b/other.json", &3).unwrap();

        let tids = store.find_trials("trial.json");
        assert_eq!(tids, vec!["sweep/a".to_string(), "sweep/b".to_string()]);
    }

    #[test]
    fn test_list_attachments_excludes_manifest() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path());

        store.write_json("t1/trial.json", &1).unwrap();
        store.write_json("t1/extra.json", &2).unwrap();
        let mut f = store.open_write("t1/notes/log.txt", true).unwrap();
        f.write_all(b"x").unwrap();
        drop(f);

        let listed = store.list_attachments("t1", "trial.json").unwrap();
        assert_eq!(listed, vec!["extra.json".to_string(), "notes/log.txt".to_string()]);
    }
}
