//! Exclusive hold on a data directory.
//!
//! A writable engine keeps an flock() on `kwgroup.lock` until it is dropped.
//! The holder writes its pid into the file so a second process can report who
//! is in the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE: &str = "kwgroup.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{path} is held by another kwgroup process (pid {holder})")]
    Busy { path: String, holder: String },

    #[error("cannot lock data directory: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct DataDirLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl DataDirLock {
    /// Take the lock without waiting.
    pub fn try_acquire(base_path: &Path) -> Result<Self, LockError> {
        let path = base_path.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !try_flock(&file)? {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = match holder.trim() {
                "" => "unknown".to_string(),
                pid => pid.to_string(),
            };
            return Err(LockError::Busy {
                path: path.display().to_string(),
                holder,
            });
        }

        let pid = std::process::id();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{pid}")?;
        file.flush()?;
        log::debug!("locked {} pid={pid}", path.display());

        Ok(Self { file })
    }
}

/// Ok(false) when someone else holds the lock.
#[cfg(unix)]
fn try_flock(file: &File) -> io::Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
impl Drop for DataDirLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_until_released() {
        let dir = tempfile::tempdir().unwrap();

        let held = DataDirLock::try_acquire(dir.path()).unwrap();
        let pid = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(pid, std::process::id().to_string());

        match DataDirLock::try_acquire(dir.path()) {
            Err(LockError::Busy { holder, .. }) => assert_eq!(holder, pid),
            other => panic!("unexpected {other:?}"),
        }

        drop(held);
        DataDirLock::try_acquire(dir.path()).unwrap();
    }
}
