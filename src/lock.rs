//! Advisory file locks shared by registries, port allocation and the reaper descriptor.
//!
//! Lock files are created on demand and never removed: unlinking a flock'd file lets a
//! waiter lock the old inode while a newcomer locks a fresh one.
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock guard; the lock is released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock at `path` is held.
    pub fn acquire(path: &Path) -> io::Result<FileLock> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Try to take the lock without blocking; `Ok(None)` when another holder exists.
    pub fn try_acquire(path: &Path) -> io::Result<Option<FileLock>> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(FileLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Best-effort unlock; closing the descriptor releases it anyway
        let _ = self.file.unlock();
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

/// Sibling lock path for a data file: `service.json` -> `service.lock`.
pub fn lock_path_for(data: &Path) -> PathBuf {
    data.with_extension("lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_is_exclusive_until_drop() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("nested").join("x.lock");

        let first = FileLock::try_acquire(&p)
            .expect("open lock")
            .expect("first lock should succeed");
        assert_eq!(first.path(), p.as_path());

        // A second descriptor must not get the lock while the first is held
        let p2 = p.clone();
        let held = thread::spawn(move || FileLock::try_acquire(&p2).expect("open lock").is_none())
            .join()
            .unwrap();
        assert!(held, "second try_acquire unexpectedly succeeded");

        drop(first);
        let again = FileLock::try_acquire(&p).expect("open lock");
        assert!(again.is_some(), "lock should be free after drop");
        assert!(p.exists(), "lock file must be kept on disk");
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("b.lock");
        let first = FileLock::acquire(&p).expect("acquire");

        let p2 = p.clone();
        let waiter = thread::spawn(move || {
            let started = std::time::Instant::now();
            let _g = FileLock::acquire(&p2).expect("acquire in thread");
            started.elapsed()
        });
        thread::sleep(Duration::from_millis(150));
        drop(first);
        let waited = waiter.join().unwrap();
        assert!(
            waited >= Duration::from_millis(100),
            "waiter did not block: {waited:?}"
        );
    }

    #[test]
    fn test_lock_path_for_replaces_extension() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/env/service.json")),
            PathBuf::from("/tmp/env/service.lock")
        );
    }
}
