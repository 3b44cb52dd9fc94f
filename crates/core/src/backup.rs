//! `backup.yaml`-equivalent persistence (spec §2 item 13, §6, §8 property 5).
//!
//! Written atomically after every committed `Update` and consulted as a
//! fallback source of truth when an instance fails to start from the live
//! database record. A dedicated serde record (rather than deriving
//! `Serialize` straight onto `model::Instance`) keeps the on-disk shape
//! stable even if the in-memory model grows fields that don't belong in a
//! portable backup.
use crate::model::{DeviceConfig, Instance, InstanceType, Profile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDeviceRecord {
    pub device_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupProfileRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, BackupDeviceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupInstanceType {
    Container,
    Vm,
}

/// Byte-identical round-trip target for spec §8 property 5: write, read
/// back, compare as data (field order doesn't matter since this derives
/// `PartialEq`, but the on-disk bytes are also stable since `serde_yaml`
/// serializes `BTreeMap`s in key order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub project: String,
    pub name: String,
    pub instance_type: BackupInstanceType,
    pub architecture: String,
    pub ephemeral: bool,
    pub stateful: bool,
    pub node: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, BackupDeviceRecord>,
    #[serde(default)]
    pub profiles: Vec<BackupProfileRecord>,
}

impl From<&Instance> for BackupRecord {
    fn from(instance: &Instance) -> Self {
        Self {
            project: instance.project.clone(),
            name: instance.name.clone(),
            instance_type: match instance.instance_type {
                InstanceType::Container => BackupInstanceType::Container,
                InstanceType::Vm => BackupInstanceType::Vm,
            },
            architecture: instance.architecture.clone(),
            ephemeral: instance.ephemeral,
            stateful: instance.stateful,
            node: instance.node.clone(),
            description: instance.description.clone(),
            config: instance.local_config.clone(),
            devices: instance
                .local_devices
                .iter()
                .map(|(name, device)| (name.clone(), device.into()))
                .collect(),
            profiles: instance.profiles.iter().map(Into::into).collect(),
        }
    }
}

impl From<&DeviceConfig> for BackupDeviceRecord {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            device_type: device.device_type.clone(),
            config: device.config.clone(),
        }
    }
}

impl From<&Profile> for BackupProfileRecord {
    fn from(profile: &Profile) -> Self {
        Self {
            name: profile.name.clone(),
            description: profile.description.clone(),
            config: profile.config.clone(),
            devices: profile
                .devices
                .iter()
                .map(|(name, device)| (name.clone(), device.into()))
                .collect(),
        }
    }
}

impl BackupRecord {
    pub fn instance_type(&self) -> InstanceType {
        match self.instance_type {
            BackupInstanceType::Container => InstanceType::Container,
            BackupInstanceType::Vm => InstanceType::Vm,
        }
    }
}

/// Write `record` to `path` atomically: serialize to a sibling temp file,
/// then rename over the destination so a concurrent reader (or a crash
/// mid-write) never observes a partial file.
pub async fn write_atomic(path: &Path, record: &BackupRecord) -> Result<(), BackupError> {
    let yaml = serde_yaml::to_string(record)?;
    let tmp_path = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp_path, yaml.as_bytes()).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub async fn read(path: &Path) -> Result<BackupRecord, BackupError> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_yaml::from_str(&raw)?)
}

/// Fallback lookup consulted when an instance fails to start from the live
/// database record (spec §6): best-effort, returns `None` rather than
/// erroring when no backup file exists yet.
pub async fn read_fallback(path: &Path) -> Option<BackupRecord> {
    read(path).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceConfig, Instance, InstanceType, Profile};

    fn sample_instance() -> Instance {
        let mut local_config = BTreeMap::new();
        local_config.insert("limits.cpu".to_string(), "2".to_string());

        let mut root_disk_config = BTreeMap::new();
        root_disk_config.insert("path".to_string(), "/".to_string());
        root_disk_config.insert("pool".to_string(), "default".to_string());
        let mut local_devices = BTreeMap::new();
        local_devices.insert(
            "root".to_string(),
            DeviceConfig {
                device_type: "disk".to_string(),
                config: root_disk_config,
            },
        );

        Instance {
            project: "default".to_string(),
            name: "c1".to_string(),
            instance_type: InstanceType::Container,
            architecture: "x86_64".to_string(),
            ephemeral: false,
            stateful: false,
            node: "node1".to_string(),
            description: "test instance".to_string(),
            local_config,
            local_devices,
            profiles: vec![Profile {
                name: "default".to_string(),
                ..Default::default()
            }],
            snapshot: false,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips_byte_identically() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("backup.yaml");
        let record = BackupRecord::from(&sample_instance());

        write_atomic(&path, &record).await.unwrap();
        let read_back = read(&path).await.unwrap();

        assert_eq!(record, read_back);
    }

    #[tokio::test]
    async fn write_atomic_never_leaves_the_temp_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("backup.yaml");
        let record = BackupRecord::from(&sample_instance());
        write_atomic(&path, &record).await.unwrap();
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[tokio::test]
    async fn fallback_read_is_none_when_no_backup_exists_yet() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("backup.yaml");
        assert!(read_fallback(&path).await.is_none());
    }

    #[test]
    fn instance_type_round_trips_through_the_backup_enum() {
        let mut instance = sample_instance();
        instance.instance_type = InstanceType::Vm;
        let record = BackupRecord::from(&instance);
        assert_eq!(record.instance_type(), InstanceType::Vm);
    }
}
