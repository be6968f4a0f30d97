//! Advisory pidfile.
//!
//! Locked with lockf(F_TLOCK) and held for the process lifetime so a second
//! backend instance for the same disk fails fast.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::errno::Errno;
use tracing::debug;

use crate::{Result, TdError};

pub struct Pidfile {
    _file: File,
}

impl Pidfile {
    /// Create (or truncate) `path`, take the lock, write our pid.
    pub fn write(path: impl AsRef<Path>) -> Result<Pidfile> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Safety: fd is valid for the lifetime of `file`.
        let ret = unsafe { libc::lockf(file.as_raw_fd(), libc::F_TLOCK, 0) };
        if let Err(e) = Errno::result(ret) {
            return Err(match e {
                Errno::EACCES | Errno::EAGAIN => TdError::Busy,
                e => TdError::Io(std::io::Error::from_raw_os_error(e as i32)),
            });
        }

        file.set_len(0)?;
        write!(file, "{}\n", std::process::id())?;
        file.sync_all()?;

        debug!(path = %path.display(), pid = std::process::id(), "pidfile written");
        Ok(Pidfile { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pidfile_holds_contents_and_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backend.pid");

        let held = Pidfile::write(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(held);
        // Lock released with the fd; a second writer now succeeds.
        Pidfile::write(&path).unwrap();
    }
}
