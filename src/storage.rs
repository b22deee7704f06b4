//! C10: storage paths & metadata.
//!
//! Canonical on-disk layout (§6), grounded in the original's
//! `kernel/storage.hpp`, which lays the same `mds/core/...` tree out for
//! exactly the same reason: separating the "is this datastore consistent"
//! question (a single top-level mark file) from the bulk of the state (one
//! subdirectory per subsystem, each independently serializable).
//!
//! ```text
//! P/
//!   properly_closed_mark
//!   mds/
//!     core/
//!       segment/               block-0, block-1, ...
//!       named_object_directory
//!       unique_object_directory
//!       anonymous_object_directory
//!       non_full_chunk_bin
//!       chunk_directory
//!       manager_metadata.json
//!       description
//! ```

use crate::error::{Error, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub fn mds_root(datastore_root: &Path) -> PathBuf {
    datastore_root.join("mds")
}

pub fn core_dir(datastore_root: &Path) -> PathBuf {
    mds_root(datastore_root).join("core")
}

pub fn properly_closed_mark(datastore_root: &Path) -> PathBuf {
    datastore_root.join("properly_closed_mark")
}

pub fn metadata_path(datastore_root: &Path) -> PathBuf {
    core_dir(datastore_root).join("manager_metadata.json")
}

pub fn description_path(datastore_root: &Path) -> PathBuf {
    core_dir(datastore_root).join("description")
}

pub fn named_object_directory_path(datastore_root: &Path) -> PathBuf {
    core_dir(datastore_root).join("named_object_directory")
}

pub fn unique_object_directory_path(datastore_root: &Path) -> PathBuf {
    core_dir(datastore_root).join("unique_object_directory")
}

pub fn anonymous_object_directory_path(datastore_root: &Path) -> PathBuf {
    core_dir(datastore_root).join("anonymous_object_directory")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub uuid: Uuid,
    pub version: u32,
}

impl Metadata {
    pub fn fresh() -> Self {
        Metadata { uuid: Uuid::new_v4(), version: crate::config::FORMAT_VERSION }
    }

    pub fn write(&self, datastore_root: &Path) -> Result<()> {
        let path = metadata_path(datastore_root);
        let text = serde_json::to_string_pretty(self).map_err(|e| Error::Corrupt(path.clone(), e.to_string()))?;
        fs::write(&path, text).map_err(|e| Error::io(&path, e))
    }

    pub fn read(datastore_root: &Path) -> Result<Self> {
        let path = metadata_path(datastore_root);
        let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let metadata: Metadata =
            serde_json::from_str(&text).map_err(|e| Error::Corrupt(path.clone(), e.to_string()))?;
        if metadata.version != crate::config::FORMAT_VERSION {
            return Err(Error::VersionMismatch { found: metadata.version, expected: crate::config::FORMAT_VERSION });
        }
        Ok(metadata)
    }
}

/// Creates the full directory tree for a fresh datastore. Removes any
/// existing directory at `datastore_root` first (§4.9 `create`: "erase any
/// existing datastore at path").
pub fn create_layout(datastore_root: &Path) -> Result<()> {
    if datastore_root.exists() {
        remove(datastore_root)?;
    }
    fs::create_dir_all(core_dir(datastore_root)).map_err(|e| Error::io(datastore_root, e))?;
    Ok(())
}

pub fn is_properly_closed(datastore_root: &Path) -> bool {
    properly_closed_mark(datastore_root).exists()
}

pub fn write_properly_closed_mark(datastore_root: &Path) -> Result<()> {
    let path = properly_closed_mark(datastore_root);
    fs::File::create(&path).map(|_| ()).map_err(|e| Error::io(&path, e))
}

pub fn clear_properly_closed_mark(datastore_root: &Path) -> Result<()> {
    let path = properly_closed_mark(datastore_root);
    if path.exists() {
        fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
    }
    Ok(())
}

pub fn read_description(datastore_root: &Path) -> Result<String> {
    let path = description_path(datastore_root);
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(&path).map_err(|e| Error::io(&path, e))
}

pub fn write_description(datastore_root: &Path, text: &str) -> Result<()> {
    let path = description_path(datastore_root);
    fs::write(&path, text).map_err(|e| Error::io(&path, e))
}

pub fn remove(datastore_root: &Path) -> Result<()> {
    if datastore_root.exists() {
        fs::remove_dir_all(datastore_root).map_err(|e| Error::io(datastore_root, e))?;
    }
    Ok(())
}

/// Recursively copies `src` onto `dst`, one worker thread per file,
/// attempting a reflink clone before falling back to a byte copy (§9
/// "Parallel file copy").
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    let files = collect_files(src, dst)?;
    debug!("copying {} files from {:?} to {:?}", files.len(), src, dst);

    let failures: usize = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = files
            .into_iter()
            .map(|(from, to)| scope.spawn(move |_| copy_one(&from, &to).is_ok()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or(false)).filter(|ok| !ok).count()
    })
    .map_err(|_| Error::Broken)?;

    if failures > 0 {
        return Err(Error::io(dst, std::io::Error::new(std::io::ErrorKind::Other, "one or more files failed to copy")));
    }
    info!("copied datastore tree {:?} -> {:?}", src, dst);
    Ok(())
}

fn collect_files(src: &Path, dst: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut out = Vec::new();
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from_dir, to_dir)) = stack.pop() {
        fs::create_dir_all(&to_dir).map_err(|e| Error::io(&to_dir, e))?;
        for entry in fs::read_dir(&from_dir).map_err(|e| Error::io(&from_dir, e))? {
            let entry = entry.map_err(|e| Error::io(&from_dir, e))?;
            let file_type = entry.file_type().map_err(|e| Error::io(&from_dir, e))?;
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((from, to));
            } else {
                out.push((from, to));
            }
        }
    }
    Ok(out)
}

fn copy_one(from: &Path, to: &Path) -> Result<()> {
    let src_file = fs::File::open(from).map_err(|e| Error::io(from, e))?;
    let dst_file = fs::OpenOptions::new().write(true).create(true).truncate(true).open(to).map_err(|e| Error::io(to, e))?;
    let len = src_file.metadata().map_err(|e| Error::io(from, e))?.len();
    dst_file.set_len(len).map_err(|e| Error::io(to, e))?;
    if crate::os::reflink(&src_file, &dst_file) {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| Error::io(to, e)).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn metadata_roundtrip() {
        let dir = tempdir().unwrap();
        create_layout(dir.path()).unwrap();
        let meta = Metadata::fresh();
        meta.write(dir.path()).unwrap();
        let restored = Metadata::read(dir.path()).unwrap();
        assert_eq!(meta.uuid, restored.uuid);
    }

    #[test]
    fn properly_closed_mark_lifecycle() {
        let dir = tempdir().unwrap();
        create_layout(dir.path()).unwrap();
        assert!(!is_properly_closed(dir.path()));
        write_properly_closed_mark(dir.path()).unwrap();
        assert!(is_properly_closed(dir.path()));
        clear_properly_closed_mark(dir.path()).unwrap();
        assert!(!is_properly_closed(dir.path()));
    }

    #[test]
    fn copy_tree_duplicates_contents() {
        let src = tempdir().unwrap();
        create_layout(src.path()).unwrap();
        fs::write(description_path(src.path()), "hello").unwrap();
        let dst = tempdir().unwrap();
        copy_tree(src.path(), dst.path()).unwrap();
        assert_eq!(fs::read_to_string(description_path(dst.path())).unwrap(), "hello");
    }
}
