//! Exclusive run lock so two pipeline runs never overlap.
//!
//! The lock file carries a `pid=<n> started_at=<rfc3339>` stamp. A lock whose
//! owner has died, or whose stamp is older than the stale window, is taken
//! over instead of blocking every later run.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::postgres::PgRunClaim;
use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockStamp {
    pid: u32,
    started_at: DateTime<Utc>,
}

impl LockStamp {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    fn render(&self) -> String {
        format!("pid={} started_at={}\n", self.pid, self.started_at.to_rfc3339())
    }

    fn parse(text: &str) -> Option<Self> {
        let mut pid = None;
        let mut started_at = None;
        for field in text.split_whitespace() {
            if let Some(raw) = field.strip_prefix("pid=") {
                pid = raw.parse::<u32>().ok();
            } else if let Some(raw) = field.strip_prefix("started_at=") {
                started_at = DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|ts| ts.with_timezone(&Utc));
            }
        }
        Some(Self {
            pid: pid?,
            started_at: started_at?,
        })
    }
}

/// `None` when liveness cannot be checked on this platform.
fn process_alive(pid: u32) -> Option<bool> {
    #[cfg(target_os = "linux")]
    {
        Some(pid == std::process::id() || Path::new(&format!("/proc/{pid}")).exists())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// Held for the duration of a run; the lock file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Takes the lock at `path`, replacing it first if its owner is gone or
    /// it is older than `stale_after`.
    pub async fn acquire(path: impl AsRef<Path>, stale_after: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        if let Some(lock) = Self::try_create(&path).await? {
            return Ok(lock);
        }
        if !Self::is_stale(&path, stale_after).await? {
            return Err(StoreError::LockHeld { path });
        }

        warn!(lock = %path.display(), "taking over stale run lock");
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::Io { path, source }),
        }
        Self::try_create(&path)
            .await?
            .ok_or(StoreError::LockHeld { path })
    }

    async fn try_create(path: &Path) -> Result<Option<Self>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => return Err(io_err(source)),
        };
        let lock = Self {
            path: path.to_path_buf(),
        };
        file.write_all(LockStamp::current().render().as_bytes())
            .await
            .map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(Some(lock))
    }

    async fn is_stale(path: &Path, stale_after: Duration) -> Result<bool, StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(source) => return Err(io_err(source)),
        };

        if let Some(stamp) = LockStamp::parse(&text) {
            let dead = process_alive(stamp.pid) == Some(false);
            return Ok(dead || Utc::now() - stamp.started_at > stale_after);
        }

        // no readable stamp: judge by file age
        let modified = fs::metadata(path)
            .await
            .and_then(|meta| meta.modified())
            .map_err(io_err)?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(Duration::from_std(age).map_or(true, |age| age > stale_after))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

/// Store-level claim on the alert history for one run. Stores shared
/// between hosts hand out a real lock; local stores rely on [`RunLock`].
#[derive(Debug)]
pub enum RunClaim {
    Local,
    Postgres(PgRunClaim),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn window() -> Duration {
        Duration::hours(6)
    }

    #[tokio::test]
    async fn second_acquire_fails_until_first_is_dropped() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");

        let first = RunLock::acquire(&path, window()).await.expect("first lock");
        let err = RunLock::acquire(&path, window()).await.expect_err("held");
        assert!(matches!(err, StoreError::LockHeld { .. }));

        drop(first);
        assert!(!path.exists());
        let _again = RunLock::acquire(&path, window()).await.expect("re-acquire");
    }

    #[tokio::test]
    async fn lock_older_than_the_window_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        let old = LockStamp {
            pid: std::process::id(),
            started_at: Utc::now() - Duration::hours(7),
        };
        std::fs::write(&path, old.render()).expect("write");

        let lock = RunLock::acquire(&path, window()).await.expect("takeover");
        let stamp = LockStamp::parse(&std::fs::read_to_string(&path).expect("read")).expect("stamp");
        assert!(stamp.started_at > old.started_at);
        drop(lock);
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn lock_of_a_dead_process_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        let orphan = LockStamp {
            pid: u32::MAX,
            started_at: Utc::now(),
        };
        std::fs::write(&path, orphan.render()).expect("write");

        assert!(RunLock::acquire(&path, window()).await.is_ok());
    }

    #[tokio::test]
    async fn fresh_unstamped_lock_is_respected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        std::fs::write(&path, "").expect("write");

        let err = RunLock::acquire(&path, window()).await.expect_err("held");
        assert!(matches!(err, StoreError::LockHeld { .. }));
        assert!(path.exists());
    }

    #[test]
    fn stamp_parses_what_it_renders() {
        let stamp = LockStamp::current();
        assert_eq!(LockStamp::parse(&stamp.render()), Some(stamp));
        assert_eq!(LockStamp::parse("pid=12"), None);
    }
}
