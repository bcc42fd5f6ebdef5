use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive advisory lock on a file; released on drop.
///
/// NOTE: `flock` locks belong to the open file description, so two acquires
/// inside one process contend just like two processes do.
#[derive(Debug)]
pub struct FileLock {
    file: fs::File,
    path: PathBuf,
}

fn open_lock_file(path: &Path) -> anyhow::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))
}

impl FileLock {
    /// Blocks the calling thread until the lock is free.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        let file = open_lock_file(path)?;
        lock_exclusive(&file).with_context(|| format!("lock {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Waits for the lock without blocking the runtime, so a holder on the same
    /// thread can finish and release it.
    pub async fn acquire_async(path: &Path) -> anyhow::Result<Self> {
        let file = open_lock_file(path)?;
        let mut waited = false;
        while !try_lock_exclusive(&file).with_context(|| format!("lock {}", path.display()))? {
            if !waited {
                tracing::debug!(path = %path.display(), "waiting for lock");
                waited = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn flock(file: &fs::File, op: libc::c_int) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &fs::File) -> std::io::Result<()> {
    flock(file, libc::LOCK_EX)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &fs::File) -> std::io::Result<bool> {
    match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn unlock(file: &fs::File) {
    let _ = flock(file, libc::LOCK_UN);
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &fs::File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &fs::File) {}
