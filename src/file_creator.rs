//! Destination file materialization.
//!
//! Block identifiers are destination-relative paths. Workers on different
//! ports may carry blocks of the same file concurrently, so files are
//! opened without truncation and truncated explicitly only for blocks that
//! start a file (offset zero); the OS serializes creation of the inode.

use crate::error::TransferError;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Opens destination files under a fixed root directory.
#[derive(Debug)]
pub struct FileCreator {
    root: PathBuf,
}

impl FileCreator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the destination file for `id`, creating intermediate
    /// directories as needed. The file is opened for writing without
    /// truncation so positional blocks from other connections survive.
    pub fn create(&self, id: &str) -> Result<File, TransferError> {
        let path = self.root.join(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create(true).open(&path)?;
        debug!(id, path = %path.display(), "opened destination file");
        Ok(file)
    }

    /// Set the destination file to its final size.
    pub fn truncate(&self, file: &File, size: u64) -> io::Result<()> {
        file.set_len(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::tempdir;

    #[test]
    fn test_creates_intermediate_directories() {
        let dir = tempdir().unwrap();
        let creator = FileCreator::new(dir.path());

        let file = creator.create("a/b/c.bin").unwrap();
        drop(file);

        assert!(dir.path().join("a/b/c.bin").exists());
    }

    #[test]
    fn test_open_does_not_truncate() {
        let dir = tempdir().unwrap();
        let creator = FileCreator::new(dir.path());

        let mut first = creator.create("f.txt").unwrap();
        first.write_all(b"hello").unwrap();
        drop(first);

        let mut second = creator.create("f.txt").unwrap();
        second.seek(SeekFrom::Start(5)).unwrap();
        second.write_all(b" more").unwrap();
        drop(second);

        let mut content = String::new();
        File::open(dir.path().join("f.txt"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello more");
    }

    #[test]
    fn test_truncate_sets_length() {
        let dir = tempdir().unwrap();
        let creator = FileCreator::new(dir.path());

        let file = creator.create("sized.bin").unwrap();
        creator.truncate(&file, 16).unwrap();
        drop(file);

        assert_eq!(fs::metadata(dir.path().join("sized.bin")).unwrap().len(), 16);
    }
}
