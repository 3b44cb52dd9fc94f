//! Checkpoint/restore external collaborator (spec §2 item 10, §4.6).
//!
//! `Checkpointer` is a CRIU-style trait kept separate from any concrete
//! binary so the predump loop in this module stays testable against a fake.
//! The real implementation shells out to the configured checkpointer binary
//! the same way `crates/agent::runner` shells out to the sandboxed program,
//! rather than linking a CRIU client library.
use crate::error::{ErrorKind, Kinded};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpointer exited with status {0}")]
    NonZeroExit(i32),
    #[error("feature probe failed: {0}")]
    FeatureProbe(String),
    #[error("rsync transfer failed: {0}")]
    Rsync(String),
    #[error("failed to parse pre-dump stats: {0}")]
    StatsParse(String),
}

impl Kinded for CheckpointError {
    fn kind(&self) -> ErrorKind {
        match self {
            CheckpointError::Io(_) => ErrorKind::TransientIo,
            CheckpointError::NonZeroExit(_)
            | CheckpointError::FeatureProbe(_)
            | CheckpointError::Rsync(_)
            | CheckpointError::StatsParse(_) => ErrorKind::Fatal,
        }
    }
}

/// CRIU-style external checkpoint/restore collaborator. A real
/// implementation wraps the configured checkpointer binary; tests use a
/// fake that just touches files to simulate progress.
#[async_trait::async_trait]
pub trait Checkpointer: Send + Sync {
    async fn pre_dump(
        &self,
        state_dir: &Path,
        parent_dir: Option<&Path>,
        action_script: Option<&Path>,
    ) -> Result<PreDumpStats, CheckpointError>;

    async fn dump(
        &self,
        state_dir: &Path,
        parent_dir: Option<&Path>,
        action_script: Option<&Path>,
    ) -> Result<(), CheckpointError>;

    async fn restore(
        &self,
        state_dir: &Path,
        action_script: Option<&Path>,
    ) -> Result<(), CheckpointError>;

    /// Whether the underlying binary supports pre-copy/iterative dumps at
    /// all; gates the predump loop entirely when `false` (spec §4.6).
    async fn supports_pre_dump(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreDumpStats {
    pub pages_written: u64,
    pub pages_skipped: u64,
}

impl PreDumpStats {
    /// `skippedPercentage`, clamped to 0 when nothing was written yet.
    pub fn skipped_percentage(&self) -> u32 {
        let total = self.pages_written + self.pages_skipped;
        if total == 0 {
            0
        } else {
            ((self.pages_skipped * 100) / total) as u32
        }
    }
}

/// Parse the JSON `crit decode` produces for a `stats-dump` image
/// (`{"entries": [{"dump": {"pages_written": N, "pages_skipped_parent": N,
/// ...}}]}`). Kept as a free function so the wire format can be tested
/// without shelling out to `crit`.
fn parse_stats_dump_json(raw: &str) -> Result<PreDumpStats, CheckpointError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| CheckpointError::StatsParse(format!("invalid json: {e}")))?;
    let dump = value
        .get("entries")
        .and_then(|e| e.get(0))
        .and_then(|e| e.get("dump"))
        .ok_or_else(|| CheckpointError::StatsParse("missing entries[0].dump".into()))?;
    let pages_written = dump
        .get("pages_written")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| CheckpointError::StatsParse("missing pages_written".into()))?;
    let pages_skipped = dump
        .get("pages_skipped_parent")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Ok(PreDumpStats {
        pages_written,
        pages_skipped,
    })
}

/// Shell-out implementation of [`Checkpointer`] for the configured
/// checkpointer binary, matching the teacher's pattern of driving an
/// external tool via `tokio::process::Command` and parsing its exit status.
pub struct ExternalCheckpointer {
    pub binary: PathBuf,
    /// The `crit` decoder shipped alongside CRIU, used to turn a pre-dump's
    /// `stats-dump` image into JSON (spec §4.6's "parse real per-page
    /// stats" requirement).
    pub stats_tool: PathBuf,
}

#[async_trait::async_trait]
impl Checkpointer for ExternalCheckpointer {
    async fn pre_dump(
        &self,
        state_dir: &Path,
        parent_dir: Option<&Path>,
        action_script: Option<&Path>,
    ) -> Result<PreDumpStats, CheckpointError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("pre-dump")
            .arg("--images-dir")
            .arg(state_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(parent) = parent_dir {
            cmd.arg("--prev-images-dir").arg(parent);
        }
        if let Some(script) = action_script {
            cmd.arg("--action-script").arg(script);
        }
        let status = cmd.status().await?;
        if !status.success() {
            return Err(CheckpointError::NonZeroExit(status.code().unwrap_or(-1)));
        }

        let output = Command::new(&self.stats_tool)
            .arg("decode")
            .arg("--pretty")
            .arg("-i")
            .arg(state_dir.join("stats-dump"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(CheckpointError::StatsParse(format!(
                "{} exited with status {:?}",
                self.stats_tool.display(),
                output.status.code()
            )));
        }
        let raw = String::from_utf8(output.stdout)
            .map_err(|e| CheckpointError::StatsParse(format!("non-utf8 output: {e}")))?;
        parse_stats_dump_json(&raw)
    }

    async fn dump(
        &self,
        state_dir: &Path,
        parent_dir: Option<&Path>,
        action_script: Option<&Path>,
    ) -> Result<(), CheckpointError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("dump")
            .arg("--images-dir")
            .arg(state_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(parent) = parent_dir {
            cmd.arg("--prev-images-dir").arg(parent);
        }
        if let Some(script) = action_script {
            cmd.arg("--action-script").arg(script);
        }
        let status = cmd.status().await?;
        if !status.success() {
            return Err(CheckpointError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        Ok(())
    }

    async fn restore(
        &self,
        state_dir: &Path,
        action_script: Option<&Path>,
    ) -> Result<(), CheckpointError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("restore")
            .arg("--images-dir")
            .arg(state_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(script) = action_script {
            cmd.arg("--action-script").arg(script);
        }
        let status = cmd.status().await?;
        if !status.success() {
            return Err(CheckpointError::NonZeroExit(status.code().unwrap_or(-1)));
        }
        Ok(())
    }

    async fn supports_pre_dump(&self) -> bool {
        Command::new(&self.binary)
            .arg("check")
            .arg("--feature")
            .arg("mem_dirty_track")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Per-iteration result, mirrored from the dump side to the restore side via
/// `migration::MigrationSync` framed messages (spec §4.6).
pub struct PreDumpIteration {
    pub index: u32,
    pub dir: PathBuf,
    pub stats: PreDumpStats,
    pub final_pre_dump: bool,
}

/// Drives the iterative pre-dump loop exactly per spec §4.6: iterate while
/// under `max_iterations` and below `goal_percent` skipped pages, each
/// iteration landing in a zero-padded `NNN/` directory and rsync'd to the
/// migration target immediately, then a final full dump into `final/`.
#[instrument(skip(checkpointer, rsync_transfer), fields(max_iterations, goal_percent))]
pub async fn run_predump_loop<F, Fut>(
    checkpointer: &dyn Checkpointer,
    state_root: &Path,
    max_iterations: u32,
    goal_percent: u32,
    action_script: Option<&Path>,
    mut rsync_transfer: F,
) -> Result<Vec<PreDumpIteration>, CheckpointError>
where
    F: FnMut(&Path) -> Fut,
    Fut: std::future::Future<Output = Result<(), CheckpointError>>,
{
    if !checkpointer.supports_pre_dump().await {
        info!("checkpointer lacks pre-dump support, skipping directly to final dump");
        return Ok(Vec::new());
    }

    let mut iterations = Vec::new();
    let mut parent: Option<PathBuf> = None;

    for index in 0..max_iterations {
        let dir = state_root.join(format!("{index:03}"));
        tokio::fs::create_dir_all(&dir).await?;

        let stats = checkpointer
            .pre_dump(&dir, parent.as_deref(), action_script)
            .await?;
        let final_pre_dump = stats.skipped_percentage() >= goal_percent;

        rsync_transfer(&dir).await.map_err(|err| {
            warn!(%err, iteration = index, "rsync transfer of pre-dump iteration failed");
            err
        })?;

        iterations.push(PreDumpIteration {
            index,
            dir: dir.clone(),
            stats,
            final_pre_dump,
        });

        if final_pre_dump {
            break;
        }
        parent = Some(dir);
    }

    Ok(iterations)
}

/// Invokes the configured `rsync` binary to mirror one pre-dump iteration's
/// directory to the migration target, matching spec §4.6's note that this
/// stays a shell-out rather than a reimplementation of the rsync protocol.
pub async fn rsync_directory(
    rsync_binary: &Path,
    source: &Path,
    destination: &str,
) -> Result<(), CheckpointError> {
    let status = Command::new(rsync_binary)
        .arg("-a")
        .arg(format!("{}/", source.display()))
        .arg(destination)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .status()
        .await?;
    if !status.success() {
        return Err(CheckpointError::Rsync(format!(
            "rsync exited with status {:?}",
            status.code()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeCheckpointer {
        supports_pre_dump: bool,
        calls: Arc<AtomicU32>,
        goal_after: u32,
    }

    #[async_trait::async_trait]
    impl Checkpointer for FakeCheckpointer {
        async fn pre_dump(
            &self,
            _state_dir: &Path,
            _parent_dir: Option<&Path>,
            _action_script: Option<&Path>,
        ) -> Result<PreDumpStats, CheckpointError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let skipped = if call >= self.goal_after { 90 } else { 10 };
            Ok(PreDumpStats {
                pages_written: 100 - skipped,
                pages_skipped: skipped as u64,
            })
        }

        async fn dump(
            &self,
            _state_dir: &Path,
            _parent_dir: Option<&Path>,
            _action_script: Option<&Path>,
        ) -> Result<(), CheckpointError> {
            Ok(())
        }

        async fn restore(
            &self,
            _state_dir: &Path,
            _action_script: Option<&Path>,
        ) -> Result<(), CheckpointError> {
            Ok(())
        }

        async fn supports_pre_dump(&self) -> bool {
            self.supports_pre_dump
        }
    }

    #[test]
    fn skipped_percentage_is_zero_before_any_pages() {
        let stats = PreDumpStats::default();
        assert_eq!(stats.skipped_percentage(), 0);
    }

    #[test]
    fn parses_a_real_crit_decoded_stats_dump() {
        let raw = r#"{"entries":[{"dump":{"pages_written":900,"pages_skipped_parent":100}}]}"#;
        let stats = parse_stats_dump_json(raw).unwrap();
        assert_eq!(stats.pages_written, 900);
        assert_eq!(stats.pages_skipped, 100);
        assert_eq!(stats.skipped_percentage(), 10);
    }

    #[test]
    fn missing_pages_skipped_parent_defaults_to_zero() {
        let raw = r#"{"entries":[{"dump":{"pages_written":42}}]}"#;
        let stats = parse_stats_dump_json(raw).unwrap();
        assert_eq!(stats.pages_skipped, 0);
    }

    #[test]
    fn rejects_a_stats_dump_with_no_entries() {
        let err = parse_stats_dump_json(r#"{"entries":[]}"#).unwrap_err();
        assert!(matches!(err, CheckpointError::StatsParse(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_stats_dump_json("not json").unwrap_err();
        assert!(matches!(err, CheckpointError::StatsParse(_)));
    }

    #[tokio::test]
    async fn predump_loop_stops_as_soon_as_it_reaches_the_goal() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpointer = FakeCheckpointer {
            supports_pre_dump: true,
            calls: Arc::new(AtomicU32::new(0)),
            goal_after: 2,
        };

        let iterations = run_predump_loop(
            &checkpointer,
            tmp.path(),
            10,
            70,
            None,
            |_dir| async { Ok(()) },
        )
        .await
        .unwrap();

        assert_eq!(iterations.len(), 3);
        assert!(iterations.last().unwrap().final_pre_dump);
    }

    #[tokio::test]
    async fn predump_loop_is_skipped_entirely_when_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpointer = FakeCheckpointer {
            supports_pre_dump: false,
            calls: Arc::new(AtomicU32::new(0)),
            goal_after: 0,
        };

        let iterations = run_predump_loop(
            &checkpointer,
            tmp.path(),
            10,
            70,
            None,
            |_dir| async { Ok(()) },
        )
        .await
        .unwrap();

        assert!(iterations.is_empty());
    }

    #[tokio::test]
    async fn predump_loop_caps_at_max_iterations_even_if_goal_never_reached() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpointer = FakeCheckpointer {
            supports_pre_dump: true,
            calls: Arc::new(AtomicU32::new(0)),
            goal_after: 999,
        };

        let iterations = run_predump_loop(
            &checkpointer,
            tmp.path(),
            3,
            70,
            None,
            |_dir| async { Ok(()) },
        )
        .await
        .unwrap();

        assert_eq!(iterations.len(), 3);
        assert!(!iterations.last().unwrap().final_pre_dump);
    }
}
