//! Guest side of the VM-interactive exec mode (spec §4.4): stdin is
//! mirrored from the connection into the child's stdin, and the child's
//! stdout+stderr are multiplexed back onto the same connection, matching
//! the host's expectation that VM stdout "multiplexes stdout+stderr in the
//! guest".
use crate::seccomp::SeccompFilter;
use shared::agent_protocol::BeginInteractiveRequest;
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::{LazyLock, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};

/// pid -> nothing but presence; lets a later `Signal` request validate the
/// target is a session this agent actually started.
static SESSIONS: LazyLock<Mutex<HashMap<u32, ()>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

pub fn is_known_session(pid: u32) -> bool {
    SESSIONS.lock().unwrap().contains_key(&pid)
}

fn register(pid: u32) {
    SESSIONS.lock().unwrap().insert(pid, ());
}

fn unregister(pid: u32) {
    SESSIONS.lock().unwrap().remove(&pid);
}

pub struct InteractiveSession {
    pub pid: u32,
    child: Child,
}

impl InteractiveSession {
    pub fn spawn(req: &BeginInteractiveRequest) -> std::io::Result<Self> {
        let Some((program, args)) = req.argv.split_first() else {
            return Err(std::io::Error::other("empty command"));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&req.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &req.cwd {
            command.current_dir(cwd);
        }

        let child = unsafe { command.pre_exec(|| SeccompFilter::apply_exec_filter()).spawn()? };
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("child exited before its pid could be read"))?;
        register(pid);

        Ok(Self { pid, child })
    }

    /// Mirror `conn` <-> child until the child exits or the connection
    /// closes, then drop the session from the registry.
    pub async fn run<S>(mut self, mut conn: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stdin = self.child.stdin.take().unwrap();
        let mut stdout = self.child.stdout.take().unwrap();
        let mut stderr = self.child.stderr.take().unwrap();

        let (mut conn_read, mut conn_write) = tokio::io::split(&mut conn);

        let stdin_task = async {
            let mut buf = [0u8; 8192];
            loop {
                match conn_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdin.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        let out_write = &mut conn_write;
        let mux_task = async move {
            let mut out_buf = [0u8; 8192];
            let mut err_buf = [0u8; 8192];
            loop {
                tokio::select! {
                    n = stdout.read(&mut out_buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => if out_write.write_all(&out_buf[..n]).await.is_err() { break },
                        }
                    }
                    n = stderr.read(&mut err_buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => if out_write.write_all(&err_buf[..n]).await.is_err() { break },
                        }
                    }
                }
            }
        };

        tokio::select! {
            _ = stdin_task => {}
            _ = mux_task => {}
            _ = self.child.wait() => {}
        }

        let _ = self.child.kill().await;
        unregister(self.pid);
        Ok(())
    }
}
