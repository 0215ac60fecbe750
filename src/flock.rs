use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive lock over the data directory. Held from open to close so a
/// second engine instance cannot mutate the same tree.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file (writing the process id for debugging) and
    /// acquires an exclusive, non-blocking lock on it.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself stays behind to avoid races with a concurrent opener.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("LOCK");
        let lock = FileLock::lock(&path).expect("failed to acquire lock");
        assert_eq!(lock.path(), path.as_path());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_double_lock_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("LOCK");
        let _first = FileLock::lock(&path).expect("failed to acquire first lock");
        assert!(FileLock::lock(&path).is_err());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("LOCK");
        {
            let _lock = FileLock::lock(&path).unwrap();
        }
        let _again = FileLock::lock(&path).expect("lock should be free after drop");
    }
}
