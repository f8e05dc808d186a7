use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Advisory exclusive lock on `<tmp_dir>/<resource>_lock`, released on drop.
/// The lock file itself is left in place: removing it while another process
/// waits on the same inode would let two holders in.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

fn sanitize_resource(resource: &str) -> String {
    let clean: String = resource
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = clean.trim_matches('_');
    if trimmed.is_empty() {
        "resource".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn lock_path(tmp_dir: &Path, resource: Option<&str>) -> PathBuf {
    let name = match resource {
        Some(resource) => sanitize_resource(resource),
        None => uuid::Uuid::new_v4().simple().to_string(),
    };
    tmp_dir.join(format!("{name}_lock"))
}

impl FileLock {
    /// Polls for the lock until `timeout`. Failure is logged and reported as
    /// `None`; callers skip their protected section.
    pub fn acquire(path: &Path, timeout: Duration, poll: Duration) -> Option<FileLock> {
        match Self::try_acquire(path, timeout, poll) {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                error!(
                    lock = %path.display(),
                    timeout_secs = timeout.as_secs_f64(),
                    "timed out waiting for lock"
                );
                None
            }
            Err(err) => {
                error!(lock = %path.display(), error = %err, "failed to open lock file");
                None
            }
        }
    }

    fn try_acquire(path: &Path, timeout: Duration, poll: Duration) -> io::Result<Option<FileLock>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(lock = %path.display(), "lock acquired");
                    return Ok(Some(FileLock {
                        path: path.to_path_buf(),
                        file,
                    }));
                }
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {}
                Err(err) => return Err(err),
            }
            if started.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(poll);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(lock = %self.path.display(), "lock released");
    }
}
