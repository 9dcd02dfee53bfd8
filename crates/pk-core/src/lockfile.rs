//! Lock file utilities for single-instance execution
//!
//! A run claims the lock by creating a file holding its process id. A
//! later run that finds the file probes the recorded process; a dead owner
//! (or unreadable content) marks the lock as stale and it is reclaimed.
//! Release only ever removes a file that still names the caller as owner.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::LockError;

/// Lock file name, resolved against the working directory
pub const LOCK_FILE_NAME: &str = ".portal-keeper.lock";

/// Get the default lock file path
pub fn default_lock_path() -> PathBuf {
    PathBuf::from(LOCK_FILE_NAME)
}

/// What was found at the lock path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFileState {
    /// No lock file
    Missing,
    /// Lock file naming an owner
    Owned(u32),
    /// Lock file whose content is not a process id
    Corrupt(String),
}

/// Result of [`InstanceLock::acquire`]
#[derive(Debug)]
pub enum LockAcquisition {
    /// The caller now holds the lock
    Acquired(InstanceLock),
    /// A live process holds the lock
    AlreadyHeld(u32),
}

/// Result of [`release_lock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The file named the caller and was deleted
    Removed,
    /// The file names another process and was left alone
    NotOwner(u32),
    /// The file holds no process id and was left alone
    Corrupt,
    /// There was nothing to release
    Missing,
}

/// Read the lock file without interpreting ownership
pub fn read_lock_file(path: &Path) -> io::Result<LockFileState> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            match contents.trim().parse::<u32>() {
                Ok(pid) => Ok(LockFileState::Owned(pid)),
                Err(_) => Ok(LockFileState::Corrupt(contents)),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LockFileState::Missing),
        Err(e) => Err(e),
    }
}

/// Create the lock file with `owner` as its content
///
/// Fails with `AlreadyExists` if another process created it first.
fn create_lock_file(path: &Path, owner: u32) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    write!(file, "{}", owner)?;
    file.sync_all()?;
    Ok(())
}

/// Remove the lock file
///
/// Returns `Ok(())` even if the file doesn't exist.
fn remove_lock_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete the lock file if, and only if, it names `owner`
pub fn release_lock(path: &Path, owner: u32) -> io::Result<ReleaseOutcome> {
    match read_lock_file(path)? {
        LockFileState::Missing => Ok(ReleaseOutcome::Missing),
        LockFileState::Owned(pid) if pid == owner => {
            remove_lock_file(path)?;
            Ok(ReleaseOutcome::Removed)
        }
        LockFileState::Owned(pid) => Ok(ReleaseOutcome::NotOwner(pid)),
        // The next acquire reclaims it
        LockFileState::Corrupt(_) => Ok(ReleaseOutcome::Corrupt),
    }
}

/// Check if a process with the given PID is still alive
///
/// On Unix, uses kill(pid, 0) to check if the process exists.
/// On Windows, uses OpenProcess to check if the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // pid 0 and negative pid_t values address process groups, not a process
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    // ESRCH means no such process; EPERM means it exists but belongs to someone else
    unsafe {
        let result = libc::kill(pid as libc::pid_t, 0);
        if result == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        err.raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == INVALID_HANDLE_VALUE || handle == 0 {
            return false;
        }
        CloseHandle(handle);
        true
    }
}

/// Guard for a held instance lock
///
/// Dropping the guard performs the owner-checked release, so the lock is
/// given back on early returns, errors and panics alike.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    owner: u32,
    released: bool,
}

impl InstanceLock {
    /// Claim the lock at `path` for `owner`, probing recorded owners with
    /// [`is_process_alive`]
    pub fn acquire(path: impl Into<PathBuf>, owner: u32) -> Result<LockAcquisition, LockError> {
        Self::acquire_with(path, owner, is_process_alive)
    }

    /// Claim the lock with a caller-supplied liveness probe
    ///
    /// A stale or corrupt file is removed and the claim retried once. Any
    /// filesystem failure is returned as an error: without the lock the run
    /// cannot be made safe.
    pub fn acquire_with<F>(
        path: impl Into<PathBuf>,
        owner: u32,
        is_alive: F,
    ) -> Result<LockAcquisition, LockError>
    where
        F: Fn(u32) -> bool,
    {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        for _ in 0..2 {
            match read_lock_file(&path).map_err(io_err)? {
                LockFileState::Missing => {}
                LockFileState::Owned(pid) if pid != owner && is_alive(pid) => {
                    return Ok(LockAcquisition::AlreadyHeld(pid));
                }
                LockFileState::Owned(pid) => {
                    tracing::warn!("Lock held by dead process {} -> reclaiming {:?}", pid, path);
                    remove_lock_file(&path).map_err(io_err)?;
                }
                LockFileState::Corrupt(contents) => {
                    tracing::warn!(
                        "Lock file {:?} is corrupt ({:?}) -> reclaiming",
                        path,
                        contents.trim()
                    );
                    remove_lock_file(&path).map_err(io_err)?;
                }
            }

            match create_lock_file(&path, owner) {
                Ok(()) => {
                    tracing::info!("Lock acquired by PID {}", owner);
                    return Ok(LockAcquisition::Acquired(Self {
                        path: path.clone(),
                        owner,
                        released: false,
                    }));
                }
                // Someone else created it between our read and create
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(io_err(e)),
            }
        }

        // Final look: a live winner of the race means the lock is simply held
        match read_lock_file(&path).map_err(io_err)? {
            LockFileState::Owned(pid) if pid != owner && is_alive(pid) => {
                Ok(LockAcquisition::AlreadyHeld(pid))
            }
            _ => Err(LockError::Contended(path)),
        }
    }

    /// Path of the held lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Process id recorded as owner
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Release the lock now and report what happened
    pub fn release(mut self) -> io::Result<ReleaseOutcome> {
        self.released = true;
        release_lock(&self.path, self.owner)
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match release_lock(&self.path, self.owner) {
            Ok(ReleaseOutcome::Removed) => {
                tracing::info!("Lock released by PID {}", self.owner);
            }
            Ok(ReleaseOutcome::NotOwner(pid)) => {
                tracing::warn!(
                    "Lock file {:?} now belongs to PID {}, leaving it in place",
                    self.path,
                    pid
                );
            }
            Ok(ReleaseOutcome::Corrupt) => {
                tracing::warn!("Lock file {:?} no longer holds a PID, leaving it in place", self.path);
            }
            Ok(ReleaseOutcome::Missing) => {
                tracing::debug!("Lock file {:?} already gone", self.path);
            }
            Err(e) => {
                tracing::warn!("Failed to release lock file {:?}: {}", self.path, e);
            }
        }
    }
}
