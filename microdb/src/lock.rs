use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Advisory exclusive lock guarding transactions on a record file.
///
/// The lock binds to a sidecar `<file>.lock` path rather than the record
/// file itself: saves replace the record file by rename, which would change
/// the inode a direct lock is attached to. The sidecar's inode is stable,
/// and flock on independently opened handles excludes handlers whether they
/// live in one process or many.
pub struct LockFile {
    file: File,
    held: bool,
}

impl LockFile {
    /// Opens (creating if absent) the sidecar lock file for `record_path`.
    pub fn open(record_path: &Path) -> io::Result<LockFile> {
        let mut name = record_path.as_os_str().to_owned();
        name.push(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&name)?;
        Ok(LockFile { file, held: false })
    }

    /// Non-blocking exclusive acquisition. `Ok(false)` means another
    /// handler holds the lock.
    pub fn try_exclusive(&mut self) -> io::Result<bool> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            self.held = true;
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(&mut self) -> io::Result<()> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.held = false;
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.held {
            let _ = self.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_handle_is_excluded_until_unlock() {
        let dir = tempdir().expect("tempdir");
        let record = dir.path().join("data.csv");
        let mut first = LockFile::open(&record).expect("open first");
        let mut second = LockFile::open(&record).expect("open second");

        assert!(first.try_exclusive().expect("first lock"));
        assert!(!second.try_exclusive().expect("second must be excluded"));

        first.unlock().expect("unlock");
        assert!(second.try_exclusive().expect("second lock after unlock"));
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempdir().expect("tempdir");
        let record = dir.path().join("data.csv");
        {
            let mut held = LockFile::open(&record).expect("open");
            assert!(held.try_exclusive().expect("lock"));
        }
        let mut next = LockFile::open(&record).expect("open next");
        assert!(next.try_exclusive().expect("lock after drop"));
    }
}
