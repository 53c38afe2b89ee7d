pub(crate) mod encoding;
pub(crate) mod recovery;
pub(crate) mod snapshot;
pub(crate) mod wal;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};

pub(crate) fn snapshot_directory(data_directory: &Path) -> PathBuf {
    data_directory.join("snapshots")
}

pub(crate) fn wal_directory(data_directory: &Path) -> PathBuf {
    data_directory.join("wal")
}

pub(crate) fn lock_file_path(data_directory: &Path) -> PathBuf {
    data_directory.join(".lock")
}

pub(crate) fn backup_directory(data_directory: &Path) -> PathBuf {
    data_directory.join(".backup")
}

/// Creates the on-disk layout and takes the exclusive directory lock.
/// Returns the held lock file; dropping it releases the lock. Only called
/// when durability or recovery is enabled.
pub(crate) fn prepare_directories(config: &Config) -> Result<File> {
    let data_directory = &config.data_directory;
    std::fs::create_dir_all(snapshot_directory(data_directory))?;
    std::fs::create_dir_all(wal_directory(data_directory))?;

    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_file_path(data_directory))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        Error::Recovery(format!(
            "storage directory {} is locked by another process",
            data_directory.display()
        ))
    })?;
    Ok(lock_file)
}

/// Moves existing snapshot and WAL files into `.backup/` so a run with
/// recovery disabled cannot overwrite durable state from a previous run.
/// Returns whether anything was moved.
pub(crate) fn move_durable_files_to_backup(config: &Config) -> Result<bool> {
    let data_directory = &config.data_directory;
    let mut files_moved = false;
    for (source, name) in [
        (snapshot_directory(data_directory), "snapshots"),
        (wal_directory(data_directory), "wal"),
    ] {
        if !source.exists() {
            continue;
        }
        let target = backup_directory(data_directory).join(name);
        for entry in std::fs::read_dir(&source)? {
            let entry = entry?;
            std::fs::create_dir_all(&target)?;
            let destination = target.join(entry.file_name());
            std::fs::rename(entry.path(), destination)?;
            files_moved = true;
        }
    }
    if files_moved {
        warn!(
            data_directory = %data_directory.display(),
            "recovery is disabled; existing durability files were moved to .backup"
        );
    }
    Ok(files_moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directory_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let config = Config::durable(dir.path());
        let first = prepare_directories(&config).unwrap();
        assert!(prepare_directories(&config).is_err());
        drop(first);
        assert!(prepare_directories(&config).is_ok());
    }

    #[test]
    fn backup_moves_existing_files() {
        let dir = tempdir().unwrap();
        let config = Config::durable(dir.path());
        let lock = prepare_directories(&config).unwrap();
        std::fs::write(
            snapshot_directory(dir.path()).join("00000000000000000001.snapshot"),
            b"x",
        )
        .unwrap();
        std::fs::write(wal_directory(dir.path()).join("000001_1.wal"), b"y").unwrap();
        drop(lock);

        assert!(move_durable_files_to_backup(&config).unwrap());
        assert!(backup_directory(dir.path())
            .join("snapshots/00000000000000000001.snapshot")
            .exists());
        assert!(backup_directory(dir.path()).join("wal/000001_1.wal").exists());
        assert!(!move_durable_files_to_backup(&config).unwrap());
    }
}
