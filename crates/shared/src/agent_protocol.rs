//! Wire types for the vsock channel between the engine's VM instance driver
//! and the guest-resident control agent (`crates/agent`).
//!
//! The engine's exec subsystem (spec §4.4) talks to the guest agent for both
//! of the VM-backed modes: interactive mode streams stdin/stdout directly
//! once a session is accepted, non-interactive mode sends the whole request
//! up front and waits for one [`AgentResponse::CommandResult`].
use std::collections::HashMap;

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub enum AgentRequest {
    /// Liveness probe, answered with [`AgentResponse::Pong`].
    Ping,
    /// Run a command to completion under resource limits and return its
    /// captured output. Used for the VM non-interactive exec mode and for
    /// VM post-start hooks that must run inside the guest.
    RunCommand(RunCommandRequest),
    /// Begin an interactive session: after this request the stream switches
    /// to raw byte mirroring (stdin in, multiplexed stdout+stderr out) until
    /// the guest process exits or the host closes the stream.
    BeginInteractive(BeginInteractiveRequest),
    /// Forward a signal to a process previously started by
    /// [`AgentRequest::BeginInteractive`] on another connection. Mirrors the
    /// host-side control channel being a separate connection from the data
    /// channel it controls (spec §4.4).
    Signal { pid: u32, signum: i32 },
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub enum AgentResponse {
    Pong,
    CommandResult(CommandResult),
    /// Sent once, immediately before switching to raw byte mirroring for an
    /// interactive session. Carries the guest pid so a later connection can
    /// target it with [`AgentRequest::Signal`].
    InteractiveReady { pid: u32 },
    SignalDelivered,
    Error { message: String },
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct RunCommandRequest {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    /// Full stdin payload; non-interactive exec sends it all up front since
    /// there is no channel to stream more after the request is framed.
    pub stdin: Vec<u8>,
    pub limits: ResourceLimits,
    /// Cap on captured stdout/stderr; set generously above expected output
    /// size the way the engine bounds compile/execute output.
    pub stdout_limit_bytes: usize,
    pub stderr_limit_bytes: usize,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct BeginInteractiveRequest {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub limits: ResourceLimits,
}

#[derive(Debug, serde::Deserialize, serde::Serialize, Clone, Copy, Default)]
pub struct ResourceLimits {
    pub time_ms: u64,
    pub memory_kib: u64,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub resource_usage: ResourceUsage,
}

#[derive(Debug, serde::Deserialize, serde::Serialize, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub memory_kib: u64,
    pub real_time_ms: u64,
    pub cpu_time_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentProtocolError {
    #[error("time limit exceeded")]
    TimeLimitExceeded,
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
    #[error("output limit exceeded")]
    OutputLimitExceeded,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
