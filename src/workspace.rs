use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::filters::LOCK_FILE_NAME;

#[derive(Debug)]
pub struct WorkspaceLockedError;

impl std::fmt::Display for WorkspaceLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local folder is already synced by another process")
    }
}

impl std::error::Error for WorkspaceLockedError {}

/// Exclusive claim on a local root; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn try_lock(local_root: &Path) -> Result<Self> {
        let lock_path = local_root.join(LOCK_FILE_NAME);
        let file = open_lock_file(&lock_path)?;
        lock_file(&file).context("lock")?;

        Ok(Self {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    // EWOULDBLOCK is 11 on Linux and 35 on macOS.
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(WorkspaceLockedError.into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_UN: i32 = 8;
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(windows)]
fn lock_file(_file: &fs::File) -> Result<()> {
    // open_lock_file() uses create_new so locking is implicit.
    Ok(())
}

#[cfg(windows)]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(windows)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path);
    match file {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(WorkspaceLockedError.into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
    }
}

/// True when `err` (or one of its causes) is a held lock.
pub fn is_locked_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<WorkspaceLockedError>())
}
