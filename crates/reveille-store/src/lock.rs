//! Cross-process lock for state files.
//!
//! The CLI and the daemon are separate processes that both rewrite the same
//! files. Every read-modify-write holds an exclusive advisory lock on a
//! sibling `<file>.lock`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Exclusive lock guarding a state file. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Wait until the lock guarding `path` is held.
    pub async fn acquire(path: &Path) -> io::Result<Self> {
        let lock_path = lock_path(path);
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = lock_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(Self { _file: file })
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// The lock file guarding `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}
