//! Daemon-wide configuration, loaded from `config.toml` with environment
//! overrides the way the teacher forwards `INCUS_DIR`/`INCUS_SOCKET` into a
//! container's Start environment.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root of per-instance state (`<root>/<project>/<name>/...`).
    pub state_dir: PathBuf,
    pub named_lock_timeout_ms: u64,
    pub operation_lock_timeout_ms: u64,
    /// Exec channel connect gate timeout (spec §4.4, §8 property 7).
    pub exec_connect_timeout_ms: u64,
    pub migration: MigrationDefaults,
    pub binaries: BinaryPaths,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/incusd"),
            named_lock_timeout_ms: 30_000,
            operation_lock_timeout_ms: 300_000,
            exec_connect_timeout_ms: 5_000,
            migration: MigrationDefaults::default(),
            binaries: BinaryPaths::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationDefaults {
    pub incremental_memory_iterations: u32,
    pub incremental_memory_goal_percent: u32,
}

impl Default for MigrationDefaults {
    fn default() -> Self {
        Self {
            incremental_memory_iterations: 10,
            incremental_memory_goal_percent: 70,
        }
    }
}

impl MigrationDefaults {
    /// Clamp per spec §4.6 ("default 10, clamped ≤ 999").
    pub fn clamped_iterations(&self) -> u32 {
        self.incremental_memory_iterations.min(999)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryPaths {
    pub container_runtime_shim: PathBuf,
    pub vm_binary: PathBuf,
    pub virtiofsd: PathBuf,
    pub checkpointer: PathBuf,
    pub rsync: PathBuf,
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            container_runtime_shim: PathBuf::from("/usr/libexec/incusd/runtime-shim"),
            vm_binary: PathBuf::from("/usr/bin/incus-vmm"),
            virtiofsd: PathBuf::from("/usr/lib/incus/virtiofsd"),
            checkpointer: PathBuf::from("/usr/bin/criu"),
            rsync: PathBuf::from("/usr/bin/rsync"),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Mirrors the teacher's own `INCUS_DIR`/`INCUS_SOCKET` env-forwarding
    /// pattern (spec §4.2's container Start environment).
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("INCUS_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
    }

    pub fn named_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.named_lock_timeout_ms)
    }

    pub fn operation_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_lock_timeout_ms)
    }

    pub fn exec_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_connect_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = DaemonConfig::default();
        assert_eq!(config.exec_connect_timeout_ms, 5_000);
        assert_eq!(config.migration.clamped_iterations(), 10);
    }

    #[test]
    fn iteration_override_clamps_at_999() {
        let mut config = MigrationDefaults::default();
        config.incremental_memory_iterations = 5_000;
        assert_eq!(config.clamped_iterations(), 999);
    }
}
