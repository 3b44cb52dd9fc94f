//! Pluggable device model (spec §2 item 5, §4.3).
pub mod disk;
pub mod kinds;

use crate::error::{ErrorKind, Kinded};
use crate::idmap::{IdmapSet, ShiftMode};
use crate::model::{DeviceConfig, ExpandedConfig};
use crate::revert::RevertStack;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("device already in use: {0}")]
    InUse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Kinded for DeviceError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Validation(_) => ErrorKind::Validation,
            DeviceError::Precondition(_) => ErrorKind::Precondition,
            DeviceError::SourceNotFound(_) => ErrorKind::NotFound,
            DeviceError::InUse(_) => ErrorKind::Conflict,
            DeviceError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

/// Capability interface breaking the `Instance <-> Device` cycle (spec §9):
/// a device only ever sees getters, never an owning reference back to the
/// instance.
pub trait InstanceHandle: Send + Sync {
    fn project(&self) -> &str;
    fn name(&self) -> &str;
    fn expanded_config(&self) -> &ExpandedConfig;
    fn devices_path(&self) -> std::path::PathBuf;
    fn log_path(&self) -> std::path::PathBuf;
    fn idmap_current(&self) -> Option<IdmapSet>;
    fn idmap_next(&self) -> Option<IdmapSet>;
}

#[derive(Debug, Clone, Default)]
pub struct IoLimits {
    pub read_bps: Option<u64>,
    pub write_bps: Option<u64>,
    pub read_iops: Option<u64>,
    pub write_iops: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub devpath: String,
    pub targetpath: String,
    pub fstype: String,
    pub options: Vec<String>,
    pub freq: u32,
    pub passno: u32,
    pub idmap_shift: Option<ShiftMode>,
    pub limits: Option<IoLimits>,
    pub attached: bool,
}

#[derive(Debug, Clone)]
pub struct RootfsDescriptor {
    pub path: std::path::PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct CgroupRule {
    pub controller: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct NetworkInterfaceConfig {
    pub name: String,
    pub host_name: Option<String>,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GpuDescriptor {
    pub vendor_id: String,
    pub product_id: String,
    pub pci_slot: String,
}

#[derive(Debug, Clone)]
pub struct UeventInjection {
    pub subsystem: String,
    pub action: String,
}

pub type PostStartHook = std::sync::Arc<dyn Fn() -> Result<(), DeviceError> + Send + Sync>;

/// The composition output of a device's `start` (spec §3 "Run-config").
#[derive(Default)]
pub struct RunConfig {
    pub rootfs: Option<RootfsDescriptor>,
    pub mounts: Vec<MountEntry>,
    pub cgroup_rules: Vec<CgroupRule>,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
    pub gpus: Vec<GpuDescriptor>,
    pub uevents: Vec<UeventInjection>,
    pub post_start_hooks: Vec<PostStartHook>,
    pub local_revert: RevertStack,
}

impl RunConfig {
    /// Mounts in path order, as required within a single device (spec
    /// §4.3 "Ordering").
    pub fn mounts_in_path_order(&self) -> Vec<&MountEntry> {
        let mut mounts: Vec<_> = self.mounts.iter().collect();
        mounts.sort_by(|a, b| a.targetpath.cmp(&b.targetpath));
        mounts
    }
}

#[async_trait::async_trait]
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn validate(&self, expanded: &ExpandedConfig) -> Result<(), DeviceError>;
    fn pre_start_check(&self, inst: &dyn InstanceHandle) -> Result<(), DeviceError>;
    async fn start(&self, inst: &dyn InstanceHandle) -> Result<RunConfig, DeviceError>;
    async fn stop(&self, inst: &dyn InstanceHandle) -> Result<(), DeviceError>;
    async fn update(
        &self,
        inst: &dyn InstanceHandle,
        old: &DeviceConfig,
    ) -> Result<(), DeviceError>;
    fn register(&self) -> Result<(), DeviceError>;
    fn remove(&self) -> Result<(), DeviceError>;
    fn can_hotplug(&self) -> bool;
    fn can_migrate(&self) -> bool;
    fn updatable_fields(&self) -> &'static [&'static str];
}

/// Construct the concrete device implementation for a config's `type`
/// discriminator.
pub fn build(name: &str, config: &DeviceConfig) -> Result<Box<dyn Device>, DeviceError> {
    match config.device_type.as_str() {
        "disk" => Ok(Box::new(disk::DiskDevice::new(name, config)?)),
        "nic" => Ok(Box::new(kinds::NicDevice::new(name, config))),
        "unix-char" => Ok(Box::new(kinds::UnixCharDevice::new(name, config))),
        "unix-block" => Ok(Box::new(kinds::UnixBlockDevice::new(name, config))),
        "gpu" => Ok(Box::new(kinds::GpuDevice::new(name, config))),
        "proxy" => Ok(Box::new(kinds::ProxyDevice::new(name, config))),
        "infiniband" => Ok(Box::new(kinds::InfinibandDevice::new(name, config))),
        "tpm" => Ok(Box::new(kinds::TpmDevice::new(name, config))),
        "pci" => Ok(Box::new(kinds::PciDevice::new(name, config))),
        "usb" => Ok(Box::new(kinds::UsbDevice::new(name, config))),
        other => Err(DeviceError::Validation(format!("unknown device type {other}"))),
    }
}

/// Expand profiles + local devices (thin wrapper over `model::expand` kept
/// here so callers only need `device::DeviceSet`), then provide ordering
/// and diffing utilities (spec §4.3 "Composition").
pub struct DeviceSet;

impl DeviceSet {
    /// Name-sorted with a stable tiebreak (spec §4.3 "Ordering"). Removal
    /// should iterate the reverse of this order.
    pub fn start_order(devices: &BTreeMap<String, DeviceConfig>) -> Vec<String> {
        let mut names: Vec<_> = devices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stop_order(devices: &BTreeMap<String, DeviceConfig>) -> Vec<String> {
        let mut names = Self::start_order(devices);
        names.reverse();
        names
    }

    pub fn diff(
        old: &BTreeMap<String, DeviceConfig>,
        new: &BTreeMap<String, DeviceConfig>,
    ) -> crate::model::DeviceDiff {
        crate::model::diff_devices(old, new, |device_type| match device_type {
            "disk" => disk::DiskDevice::UPDATABLE_FIELDS,
            "nic" => kinds::NicDevice::UPDATABLE_FIELDS,
            "proxy" => kinds::ProxyDevice::UPDATABLE_FIELDS,
            "unix-char" => kinds::UnixCharDevice::UPDATABLE_FIELDS,
            "unix-block" => kinds::UnixBlockDevice::UPDATABLE_FIELDS,
            _ => &[],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devs(names: &[&str]) -> BTreeMap<String, DeviceConfig> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    DeviceConfig {
                        device_type: "nic".to_string(),
                        config: BTreeMap::new(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn start_order_is_name_sorted_and_stop_is_reversed() {
        let devices = devs(&["b", "a", "c"]);
        assert_eq!(DeviceSet::start_order(&devices), vec!["a", "b", "c"]);
        assert_eq!(DeviceSet::stop_order(&devices), vec!["c", "b", "a"]);
    }

    #[test]
    fn diff_treats_unix_char_uid_change_as_an_update_not_a_reshuffle() {
        let mut old = BTreeMap::new();
        let mut old_config = BTreeMap::new();
        old_config.insert("uid".to_string(), "0".to_string());
        old.insert(
            "console".to_string(),
            DeviceConfig {
                device_type: "unix-char".to_string(),
                config: old_config,
            },
        );

        let mut new = old.clone();
        new.get_mut("console").unwrap().config.insert("uid".to_string(), "1000".to_string());

        let diff = DeviceSet::diff(&old, &new);
        assert_eq!(diff.updated, vec!["console".to_string()]);
        assert!(diff.removed.is_empty() && diff.added.is_empty());
    }

    #[test]
    fn build_rejects_unknown_device_type() {
        let config = DeviceConfig {
            device_type: "quantum".to_string(),
            config: BTreeMap::new(),
        };
        assert!(build("x", &config).is_err());
    }
}
