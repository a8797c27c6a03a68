//! Purpose: Daemon liveness signaling through the lock indicator file.
//! Exports: `LOCK_FILE`, `lock_path`, `is_daemon_running`, `DaemonLock`.
//! Role: The locator only tests the indicator; acquisition belongs to the
//! daemon process alone.
//! Invariants: At most one process holds the lock for a configuration root.
//! Invariants: A stale indicator left by fail-fast termination is recoverable
//! by the next acquisition.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

pub const LOCK_FILE: &str = "daemon.lock";

pub fn lock_path(config_root: &Path) -> PathBuf {
    config_root.join(LOCK_FILE)
}

/// Reports whether a daemon currently advertises this configuration root.
///
/// Absence is the steady state for a never-started daemon, so a missing file
/// (or missing root) is `Ok(false)`, not an error. Any other I/O failure is
/// surfaced to the caller.
pub fn is_daemon_running(config_root: &Path) -> Result<bool, Error> {
    let path = lock_path(config_root);
    match std::fs::metadata(&path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("failed to check daemon lock")
            .with_path(&path)
            .with_source(err)),
    }
}

/// Exclusive hold on a configuration root, owned by the daemon process for
/// its whole lifetime. Dropping the lock removes the indicator.
#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
    file: File,
}

impl DaemonLock {
    pub fn acquire(config_root: &Path) -> Result<Self, Error> {
        let path = lock_path(config_root);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to open daemon lock")
                    .with_path(&path)
                    .with_source(err)
            })?;
        // An indicator file left behind by a killed daemon carries no OS
        // lock, so taking the flock here recovers it.
        fs2::FileExt::try_lock_exclusive(&file).map_err(|err| {
            if err.kind() == fs2::lock_contended_error().kind() {
                Error::new(ErrorKind::Busy)
                    .with_message("a daemon is already running for this configuration root")
                    .with_path(&path)
                    .with_hint("Stop the running daemon before starting another.")
            } else {
                Error::new(ErrorKind::Io)
                    .with_message("failed to lock daemon lock")
                    .with_path(&path)
                    .with_source(err)
            }
        })?;

        let mut lock = Self { path, file };
        lock.write_pid()?;
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_pid(&mut self) -> Result<(), Error> {
        self.file.set_len(0).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to truncate daemon lock")
                .with_path(&self.path)
                .with_source(err)
        })?;
        writeln!(self.file, "{}", std::process::id()).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to record daemon pid")
                .with_path(&self.path)
                .with_source(err)
        })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::{DaemonLock, is_daemon_running, lock_path};
    use crate::core::error::ErrorKind;

    #[test]
    fn absent_lock_means_not_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!is_daemon_running(temp.path()).expect("check"));
    }

    #[test]
    fn missing_config_root_means_not_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("never-initialized");
        assert!(!is_daemon_running(&root).expect("check"));
    }

    #[test]
    fn held_lock_means_running_and_release_removes_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = DaemonLock::acquire(temp.path()).expect("acquire");
        assert!(is_daemon_running(temp.path()).expect("check"));
        drop(lock);
        assert!(!is_daemon_running(temp.path()).expect("check"));
    }

    #[test]
    fn second_acquisition_is_busy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _lock = DaemonLock::acquire(temp.path()).expect("acquire");
        let err = DaemonLock::acquire(temp.path()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn stale_indicator_is_recovered() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(lock_path(temp.path()), "12345\n").expect("write stale");
        let _lock = DaemonLock::acquire(temp.path()).expect("acquire over stale");
        assert!(is_daemon_running(temp.path()).expect("check"));
    }

    #[test]
    fn unreadable_root_surfaces_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A file where the config root should be turns the stat into a
        // NotADirectory failure, which must not be swallowed as "not running".
        let bogus_root = temp.path().join("actually-a-file");
        std::fs::write(&bogus_root, "").expect("write");
        let err = is_daemon_running(&bogus_root).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
