//! Sandboxed command execution inside the guest.
//!
//! This is the guest-side half of the exec subsystem's VM modes (spec
//! §4.4): the engine's host-side session hands the agent a fully-specified
//! command plus resource limits, the agent runs it under a cgroup with an
//! optional seccomp filter and reports back exit status, captured output,
//! and resource usage.
use crate::seccomp::SeccompFilter;
use crate::utils::CpuStats;
use cgroups_rs::{
    CgroupPid,
    fs::{cgroup_builder::CgroupBuilder, cpu::CpuController, hierarchies, memory::MemController},
};
use shared::agent_protocol::{CommandResult, ResourceUsage, RunCommandRequest};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{Instant, timeout};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time limit exceeded")]
    TimeLimitExceeded,
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
    #[error("output limit exceeded")]
    OutputLimitExceeded,
    #[error("empty command")]
    EmptyCommand,
    #[error("cgroup error: {0}")]
    Cgroup(#[from] cgroups_rs::fs::error::Error),
    #[error("failed to parse cpu stats: {0}")]
    CpuStats(#[from] crate::utils::ParseCpuStatsError),
}

/// Run one command to completion under a dedicated cgroup, mirroring the
/// teacher's compile/execute cgroup accounting but against an arbitrary
/// argv rather than a fixed compiled binary.
pub async fn run(req: &RunCommandRequest) -> Result<CommandResult, RunnerError> {
    let Some((program, args)) = req.argv.split_first() else {
        return Err(RunnerError::EmptyCommand);
    };

    let now = Instant::now();

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

    let mut child = unsafe { command.pre_exec(|| SeccompFilter::apply_exec_filter()).spawn()? };

    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("child exited before its pid could be read"))?;

    let hier = hierarchies::auto();
    let cg = CgroupBuilder::new(&format!("incusd-exec-{}", pid))
        .cpu()
        .done()
        .memory()
        .memory_hard_limit((req.limits.memory_kib * 1024) as i64)
        .done()
        .build(hier)?;
    cg.add_task(CgroupPid::from(pid as u64))?;

    let mut stdin = child.stdin.take().unwrap();
    if !req.stdin.is_empty() {
        stdin.write_all(&req.stdin).await?;
    }
    drop(stdin);

    let output = match timeout(
        Duration::from_millis(req.limits.time_ms),
        child.wait_with_output(),
    )
    .await
    {
        Err(_) => {
            cg.delete()?;
            return Err(RunnerError::TimeLimitExceeded);
        }
        Ok(Err(e)) => {
            cg.delete()?;
            return Err(e.into());
        }
        Ok(Ok(output)) => output,
    };

    let memory_controller: &MemController = cg.controller_of().unwrap();
    let memory_stat = memory_controller.memory_stat();
    if memory_stat.fail_cnt > 0 {
        cg.delete()?;
        return Err(RunnerError::MemoryLimitExceeded);
    }

    if output.stdout.len() > req.stdout_limit_bytes || output.stderr.len() > req.stderr_limit_bytes
    {
        cg.delete()?;
        return Err(RunnerError::OutputLimitExceeded);
    }

    let cpu_controller: &CpuController = cg.controller_of().unwrap();
    let cpu = CpuStats::from_str(&cpu_controller.cpu().stat)?;

    cg.delete()?;

    Ok(CommandResult {
        exit_code: output.status.code(),
        signal: unix_signal(&output.status),
        stdout: output.stdout,
        stderr: output.stderr,
        resource_usage: ResourceUsage {
            memory_kib: memory_stat.max_usage_in_bytes.div_ceil(1024),
            real_time_ms: now.elapsed().as_millis() as u64,
            cpu_time_ms: cpu.usage_usec / 1000,
        },
    })
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
