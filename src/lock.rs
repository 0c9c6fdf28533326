//! Single-instance guard backed by a PID lockfile.
//!
//! One lock per queue keeps two runners off the same queue; one fixed lock
//! keeps a second server from starting. Acquisition never waits on the
//! holder: a lock held by a live process fails immediately, a lock left
//! behind by a dead process is reclaimed.
//!
//! The lock file appears with its PID already in it: the PID is written to
//! a staging file which is then hard-linked onto the lock path. Every
//! inspect/remove/recreate step runs under an advisory lock on a sidecar
//! `.guard` file, so two reclaimers never both remove and recreate.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const SERVER_LOCK_FILE: &str = "sparkq-server.lock";

/// Lock path for the runner of `queue_name`.
pub fn runner_lock_path(lock_dir: &Path, queue_name: &str) -> PathBuf {
    let safe: String = queue_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    lock_dir.join(format!("sparkq-runner-{safe}.lock"))
}

/// Lock path for the server process.
pub fn server_lock_path(lock_dir: &Path) -> PathBuf {
    lock_dir.join(SERVER_LOCK_FILE)
}

/// A held lock. The file is removed when the guard is dropped, provided it
/// still carries this process's PID.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    pid: u32,
}

impl LockFile {
    /// Take the lock at `path`, stamping it with the current PID.
    ///
    /// Fails with [`Error::LockHeld`] if a live process owns it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        let _guard = ReclaimGuard::take(&path)?;

        // Second pass only happens after a stale lock was removed.
        for _ in 0..2 {
            if publish(&path, pid)? {
                info!(path = %path.display(), pid, "lock acquired");
                return Ok(Self { path, pid });
            }
            match read_owner(&path)? {
                Some(owner) if process_alive(owner) => {
                    return Err(Error::LockHeld { path, pid: owner });
                }
                owner => {
                    warn!(path = %path.display(), stale_pid = ?owner, "removing stale lock");
                    remove_if_present(&path)?;
                }
            }
        }

        Err(Error::Other(format!(
            "lock {} was re-created while reclaiming it",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, reporting I/O errors instead of logging them.
    pub fn release(mut self) -> Result<()> {
        let result = self.remove_own();
        // Already released; keep Drop from trying again.
        self.path = PathBuf::new();
        result
    }

    fn remove_own(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let _guard = ReclaimGuard::take(&self.path)?;
        match read_owner(&self.path)? {
            Some(owner) if i64::from(owner) == i64::from(self.pid) => {
                remove_if_present(&self.path)?;
                debug!(path = %self.path.display(), "lock released");
            }
            owner => {
                warn!(
                    path = %self.path.display(),
                    ?owner,
                    "lock no longer ours, leaving it in place"
                );
            }
        }
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove_own() {
            warn!(path = %self.path.display(), "failed to release lock: {e}");
        }
    }
}

/// Exclusive advisory lock on `<lock>.guard`, held for the duration of one
/// inspect-and-replace step. Closing the file releases it.
struct ReclaimGuard {
    _file: File,
}

impl ReclaimGuard {
    fn take(lock_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(lock_path, ".guard"))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Create the lock at `path` already containing `pid`.
///
/// Returns `false` if something is already at `path`.
fn publish(path: &Path, pid: u32) -> Result<bool> {
    let staging = sibling(path, &format!(".{}.tmp", Uuid::new_v4().simple()));
    let linked = stage(&staging, pid).and_then(|()| std::fs::hard_link(&staging, path));
    remove_if_present(&staging)?;

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn stage(staging: &Path, pid: u32) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staging)?;
    write!(file, "{pid}")?;
    file.sync_all()
}

/// PID recorded in the lock, `None` if the file is gone or unreadable.
fn read_owner(path: &Path) -> Result<Option<i32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Non-blocking liveness probe (signal 0).
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a probe, assume the owner is alive so two instances never run.
#[cfg(not(unix))]
pub fn process_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_lock_names_are_filesystem_safe() {
        let dir = Path::new("/tmp/locks");
        assert_eq!(
            runner_lock_path(dir, "Back End/ops"),
            PathBuf::from("/tmp/locks/sparkq-runner-Back_End_ops.lock")
        );
        assert_eq!(
            server_lock_path(dir),
            PathBuf::from("/tmp/locks/sparkq-server.lock")
        );
    }

    #[test]
    fn garbage_lock_contents_are_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.lock");
        std::fs::write(&path, "not a pid").unwrap();

        let lock = LockFile::acquire(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, std::process::id().to_string());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_leaves_no_staging_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidy.lock");
        let lock = LockFile::acquire(&path).unwrap();
        let _ = LockFile::acquire(&path).unwrap_err();
        drop(lock);

        let mut left: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, vec!["tidy.lock.guard".to_string()]);
    }

    #[test]
    fn release_leaves_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stolen.lock");
        let lock = LockFile::acquire(&path).unwrap();

        // Someone reclaimed and re-stamped the file behind our back.
        std::fs::write(&path, "1").unwrap();
        lock.release().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }
}
