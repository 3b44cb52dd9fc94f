//! Exec session state machine (spec §2 item 8, §4.4).
//!
//! One `ExecSession` owns up to four logical channels — control, stdin/tty,
//! stdout, stderr — each gated by a one-time secret the caller must present
//! when connecting. Mirrors the teacher's "state-checked wrapper with an
//! explicit connect handshake" shape, generalized from a single vsock
//! control socket to N independent data channels.
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{instrument, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Reserved exit code for a guest/VM disconnect mid-command (spec §4.4).
pub const DISCONNECT_EXIT_CODE: i32 = 129;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel did not connect within the handshake window")]
    ConnectTimeout,
    #[error("nix error: {0}")]
    Nix(#[from] nix::errno::Errno),
    #[error("incompatible exec request options: {0}")]
    IncompatibleRequestOptions(String),
}

/// One secret-gated logical channel of an exec session.
pub struct Channel {
    pub secret: String,
    connected: Notify,
}

impl Channel {
    fn new() -> Self {
        Self {
            secret: random_hex_secret(),
            connected: Notify::new(),
        }
    }

    /// Called by the connection handler once a client presents the matching
    /// secret; wakes anyone waiting in [`Channel::wait_connected`].
    pub fn mark_connected(&self) {
        self.connected.notify_waiters();
    }

    pub async fn wait_connected(&self) -> Result<(), ExecError> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.connected.notified())
            .await
            .map_err(|_| ExecError::ConnectTimeout)
    }
}

/// Hex-encoded one-time channel secret, sourced straight from the kernel CSPRNG
/// the same way the agent's seccomp profile already allows `getrandom` for
/// the guest side (spec §4.4 — no userspace RNG dependency needed).
fn random_hex_secret() -> String {
    let mut buf = [0u8; 16];
    let written = unsafe { libc::getrandom(buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if written != buf.len() as isize {
        panic!("getrandom failed to fill the exec channel secret buffer");
    }
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    InteractiveContainer,
    InteractiveVm,
    NonInteractive,
}

/// Commands accepted on the control channel, one JSON object per line.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlCommand {
    WindowResize { width: u16, height: u16 },
    Signal { signal: i32 },
}

/// Guards against sending more than one SIGKILL to the exec'd process, no
/// matter how many channels observe a disconnect concurrently (spec §8
/// property 8).
#[derive(Default)]
pub struct KillOnce(Mutex<bool>);

impl KillOnce {
    pub async fn kill(&self, pid: nix::unistd::Pid) -> Result<(), ExecError> {
        let mut fired = self.0.lock().await;
        if *fired {
            return Ok(());
        }
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL)?;
        *fired = true;
        Ok(())
    }
}

/// One completion message per spawned mirror task; `ExecSession` waits for
/// exactly as many as it spawned before declaring the command done
/// (resolves the "one Done per Add" ambiguity rather than counting bytes).
pub struct DoneTracker {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
    expected: usize,
}

impl DoneTracker {
    pub fn new(expected: usize) -> Self {
        let (tx, rx) = mpsc::channel(expected.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            expected,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<()> {
        self.tx.clone()
    }

    pub async fn wait_all(&self) {
        let mut rx = self.rx.lock().await;
        for _ in 0..self.expected {
            let _ = rx.recv().await;
        }
    }
}

pub struct ExecSession {
    pub mode: ExecMode,
    pub control: Channel,
    pub data: Channel,
    pub stdout: Option<Channel>,
    pub stderr: Option<Channel>,
    pub kill_once: KillOnce,
    pub record_output_dir: Option<PathBuf>,
}

impl ExecSession {
    /// Record-output mode is mutually exclusive with `wait_for_ws` and with
    /// interactive mode (spec §4.4): a caller that wants its stdout/stderr
    /// tee'd to files cannot also ask to stream them to a connected
    /// websocket, interactive or not.
    pub fn new(
        mode: ExecMode,
        operation_id: &str,
        record_output_root: Option<&Path>,
        wait_for_ws: bool,
    ) -> Result<Self, ExecError> {
        let interactive = matches!(mode, ExecMode::InteractiveContainer | ExecMode::InteractiveVm);
        if record_output_root.is_some() && (wait_for_ws || interactive) {
            return Err(ExecError::IncompatibleRequestOptions(
                "record-output cannot be combined with wait-for-ws or interactive mode".into(),
            ));
        }

        let stdout = (mode == ExecMode::NonInteractive).then(Channel::new);
        let stderr = (mode == ExecMode::NonInteractive).then(Channel::new);
        let record_output_dir = record_output_root.map(|root| root.join(operation_id));
        Ok(Self {
            mode,
            control: Channel::new(),
            data: Channel::new(),
            stdout,
            stderr,
            kill_once: KillOnce::default(),
            record_output_dir,
        })
    }

    /// Number of mirror tasks this session will spawn once all channels
    /// connect, used to size [`DoneTracker`].
    pub fn channel_count(&self) -> usize {
        1 + self.stdout.is_some() as usize + self.stderr.is_some() as usize
    }

    #[instrument(skip(self, control_stream))]
    pub async fn run_control_loop<S>(
        &self,
        mut control_stream: S,
        pid: nix::unistd::Pid,
        pty_fd: Option<Arc<OwnedFd>>,
    ) -> Result<(), ExecError>
    where
        S: AsyncRead + Unpin,
    {
        let mut reader = tokio::io::BufReader::new(&mut control_stream);
        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await?;
            if n == 0 {
                self.kill_once.kill(pid).await?;
                return Ok(());
            }
            match serde_json::from_str::<ControlCommand>(line.trim()) {
                Ok(ControlCommand::WindowResize { width, height }) => {
                    if let Some(ref fd) = pty_fd {
                        if self.mode == ExecMode::InteractiveContainer
                            || self.mode == ExecMode::InteractiveVm
                        {
                            set_window_size(fd.as_raw_fd(), width, height)?;
                        }
                    }
                }
                Ok(ControlCommand::Signal { signal }) => {
                    let sig = nix::sys::signal::Signal::try_from(signal)
                        .map_err(|_| nix::errno::Errno::EINVAL)?;
                    let _ = nix::sys::signal::kill(pid, sig);
                }
                Err(err) => {
                    warn!(%err, raw = %line.trim(), "ignoring malformed exec control message");
                }
            }
        }
    }

    /// Tee a byte stream to the record-output directory while forwarding it
    /// unchanged, when record-output mode is enabled for this session.
    pub async fn maybe_tee<R, W>(
        &self,
        channel_name: &str,
        mut source: R,
        mut dest: W,
    ) -> Result<(), ExecError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut file = match &self.record_output_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                Some(tokio::fs::File::create(dir.join(channel_name)).await?)
            }
            None => None,
        };
        let mut buf = [0u8; 8192];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n]).await?;
            if let Some(ref mut f) = file {
                f.write_all(&buf[..n]).await?;
            }
        }
        Ok(())
    }
}

fn set_window_size(fd: std::os::fd::RawFd, cols: u16, rows: u16) -> Result<(), ExecError> {
    let ws = nix::pty::Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    nix::ioctl_write_ptr_bad!(set_winsize, libc::TIOCSWINSZ, nix::pty::Winsize);
    unsafe { set_winsize(fd, &ws) }?;
    Ok(())
}

/// Opens a fresh pty pair for an interactive container exec, applying the
/// client's requested initial window size if given (spec §4.4).
pub fn open_pty(width: Option<u16>, height: Option<u16>) -> Result<nix::pty::OpenptyResult, ExecError> {
    let result = nix::pty::openpty(None, None)?;
    if let (Some(width), Some(height)) = (width, height) {
        set_window_size(result.master.as_raw_fd(), width, height)?;
    }
    Ok(result)
}

/// Environment composition exactly per spec §4.4: request env, then
/// `environment.*` expanded config, then synthesized defaults. `HOME` and
/// `USER` are only synthesized when the command runs as uid 0 — for any
/// other uid neither is guessable from here, so the command inherits
/// whatever the runtime's own defaults are.
pub fn compose_environment(
    request_env: &HashMap<String, String>,
    expanded_config: &HashMap<String, String>,
    instance_root: &Path,
    uid: u32,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if uid == 0 {
        env.insert("HOME".to_string(), "/root".to_string());
        env.insert("USER".to_string(), "root".to_string());
    }
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    let mut path = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string();
    if instance_root.join("snap").exists() {
        path = format!("/snap/bin:{path}");
    }
    if instance_root.join("etc/NIXOS").exists() {
        path = format!("{path}:/run/current-system/sw/bin");
    }
    env.insert("PATH".to_string(), path);

    for (key, value) in expanded_config {
        if let Some(name) = key.strip_prefix("environment.") {
            env.insert(name.to_string(), value.clone());
        }
    }

    for (key, value) in request_env {
        env.insert(key.clone(), value.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn environment_precedence_matches_request_then_config_then_defaults() {
        let mut expanded = HashMap::new();
        expanded.insert("environment.HOME".to_string(), "/home/custom".to_string());
        expanded.insert("environment.FOO".to_string(), "bar".to_string());
        let mut request = HashMap::new();
        request.insert("FOO".to_string(), "overridden".to_string());

        let env = compose_environment(&request, &expanded, Path::new("/nonexistent"), 0);
        assert_eq!(env.get("HOME").unwrap(), "/home/custom");
        assert_eq!(env.get("FOO").unwrap(), "overridden");
        assert_eq!(env.get("LANG").unwrap(), "C.UTF-8");
    }

    #[test]
    fn defaults_apply_when_nothing_overrides_them_as_root() {
        let env = compose_environment(&HashMap::new(), &HashMap::new(), Path::new("/nonexistent"), 0);
        assert_eq!(env.get("HOME").unwrap(), "/root");
        assert_eq!(env.get("USER").unwrap(), "root");
        assert!(!env.get("PATH").unwrap().contains("/snap"));
    }

    #[test]
    fn home_and_user_are_not_synthesized_for_a_non_root_uid() {
        let env = compose_environment(&HashMap::new(), &HashMap::new(), Path::new("/nonexistent"), 1000);
        assert!(env.get("HOME").is_none());
        assert!(env.get("USER").is_none());
        assert_eq!(env.get("LANG").unwrap(), "C.UTF-8");
    }

    #[tokio::test]
    async fn channel_count_matches_mode() {
        let interactive = ExecSession::new(ExecMode::InteractiveContainer, "op1", None, false).unwrap();
        assert_eq!(interactive.channel_count(), 1);
        let non_interactive = ExecSession::new(ExecMode::NonInteractive, "op2", None, false).unwrap();
        assert_eq!(non_interactive.channel_count(), 3);
    }

    #[test]
    fn record_output_rejects_wait_for_ws() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ExecSession::new(ExecMode::NonInteractive, "op3", Some(tmp.path()), true).unwrap_err();
        assert!(matches!(err, ExecError::IncompatibleRequestOptions(_)));
    }

    #[test]
    fn record_output_rejects_interactive_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let err =
            ExecSession::new(ExecMode::InteractiveContainer, "op4", Some(tmp.path()), false).unwrap_err();
        assert!(matches!(err, ExecError::IncompatibleRequestOptions(_)));
    }

    #[test]
    fn record_output_is_fine_for_plain_non_interactive_non_ws_exec() {
        let tmp = tempfile::tempdir().unwrap();
        let session =
            ExecSession::new(ExecMode::NonInteractive, "op5", Some(tmp.path()), false).unwrap();
        assert!(session.record_output_dir.is_some());
    }

    #[tokio::test]
    async fn connect_gate_times_out_when_nobody_connects() {
        let channel = Channel::new();
        let result =
            tokio::time::timeout(Duration::from_millis(50), channel.wait_connected()).await;
        assert!(result.is_err(), "should still be waiting after 50ms");
    }

    #[tokio::test]
    async fn connect_gate_resolves_once_marked() {
        let channel = Arc::new(Channel::new());
        let waiter = channel.clone();
        let handle = tokio::spawn(async move { waiter.wait_connected().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.mark_connected();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn kill_once_only_signals_a_real_pid_a_single_time() {
        let kill_once = KillOnce::default();
        let pid = nix::unistd::getpid();
        assert!(kill_once.kill(pid).await.is_ok());
        assert!(kill_once.kill(pid).await.is_ok());
    }

    #[tokio::test]
    async fn done_tracker_waits_for_every_spawned_task() {
        let tracker = Arc::new(DoneTracker::new(3));
        for _ in 0..3 {
            let sender = tracker.sender();
            tokio::spawn(async move {
                let _ = sender.send(()).await;
            });
        }
        tracker.wait_all().await;
    }
}
