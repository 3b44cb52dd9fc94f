//! Per-instance file access side channel (spec §2 item 9, §4.5).
//!
//! First accessor spawns the server process under the named lock registry;
//! later accessors find it already running and just connect. Generalizes
//! the teacher's "spawn once, reuse by key" sandbox process bookkeeping to a
//! long-lived auxiliary process instead of a one-shot run.
use crate::lock::{LockError, NamedLockRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum FileServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("unshare failed: {0}")]
    Unshare(nix::errno::Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGINT: refuse new connections, let in-flight requests finish.
    Graceful,
    /// SIGTERM: tear the process down immediately.
    Forceful,
}

struct RunningServer {
    pid: nix::unistd::Pid,
    socket_path: PathBuf,
}

/// Tracks the one file-server process per instance that may be running at
/// any time, keyed by instance id (`<project>/<name>`).
pub struct FileServerRegistry {
    named_locks: NamedLockRegistry,
    running: Mutex<HashMap<String, RunningServer>>,
}

impl FileServerRegistry {
    pub fn new() -> Self {
        Self {
            named_locks: NamedLockRegistry::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn instance_key(project: &str, name: &str) -> String {
        format!("{project}/{name}")
    }

    /// Returns the socket path to connect to, spawning the server if this is
    /// the first accessor for this instance.
    #[instrument(skip(self, spawn), fields(project, name))]
    pub async fn ensure_running<F>(
        &self,
        project: &str,
        name: &str,
        instance_running: bool,
        socket_path: PathBuf,
        cancel: &CancellationToken,
        spawn: F,
    ) -> Result<PathBuf, FileServerError>
    where
        F: FnOnce(bool, &std::path::Path) -> std::io::Result<nix::unistd::Pid>,
    {
        let key = Self::instance_key(project, name);
        let guard = self.named_locks.acquire(&key, cancel).await?;

        let mut running = self.running.lock().await;
        if let Some(existing) = running.get(&key) {
            return Ok(existing.socket_path.clone());
        }

        // Dropping into a user namespace when the instance is not running
        // keeps the file server from needing the instance's real uid/gid
        // mappings to already exist on disk (spec §4.5).
        if !instance_running {
            unshare_user_namespace()?;
        }

        let pid = spawn(instance_running, &socket_path)?;
        info!(pid = pid.as_raw(), %key, "spawned file server");
        running.insert(
            key,
            RunningServer {
                pid,
                socket_path: socket_path.clone(),
            },
        );
        drop(guard);
        Ok(socket_path)
    }

    /// Signals the running server and waits under the named lock for it to
    /// fully exit, so callers can safely follow with a destructive storage
    /// operation (spec §4.5).
    #[instrument(skip(self, cancel))]
    pub async fn stop(
        &self,
        project: &str,
        name: &str,
        mode: StopMode,
        cancel: &CancellationToken,
    ) -> Result<(), FileServerError> {
        let key = Self::instance_key(project, name);
        let guard = self.named_locks.acquire(&key, cancel).await?;

        let server = {
            let mut running = self.running.lock().await;
            running.remove(&key)
        };
        let Some(server) = server else {
            drop(guard);
            return Ok(());
        };

        let signal = match mode {
            StopMode::Graceful => nix::sys::signal::Signal::SIGINT,
            StopMode::Forceful => nix::sys::signal::Signal::SIGTERM,
        };
        if let Err(err) = nix::sys::signal::kill(server.pid, signal) {
            warn!(%err, pid = server.pid.as_raw(), "file server already gone");
        }

        // Reap; a stuck server under a graceful stop just blocks the holder
        // of this lock, which is the documented behavior (spec §4.5: callers
        // wait on the lock to confirm full exit).
        let _ = nix::sys::wait::waitpid(server.pid, None);
        drop(guard);
        Ok(())
    }
}

impl Default for FileServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unshare_user_namespace() -> Result<(), FileServerError> {
    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUSER).map_err(FileServerError::Unshare)
}
