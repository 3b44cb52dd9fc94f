//! Shared data model (spec §3): instances, profiles, devices, and the
//! expanded-config/device overlay. Kept separate from `instance` and
//! `device` so both can depend on it without a cycle (spec §9's
//! "cyclic references" note).
use crate::idmap::IdmapSet;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    Container,
    Vm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_type: String,
    pub config: BTreeMap<String, String>,
}

impl DeviceConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub name: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct ExpandedConfig {
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, DeviceConfig>,
}

/// Overlay profiles in order, then local config/devices, last writer wins.
/// Device shadowing is by name: a local device with the same name as a
/// profile device replaces it entirely (spec §3).
pub fn expand(
    profiles: &[Profile],
    local_config: &BTreeMap<String, String>,
    local_devices: &BTreeMap<String, DeviceConfig>,
) -> ExpandedConfig {
    let mut expanded = ExpandedConfig::default();
    for profile in profiles {
        for (k, v) in &profile.config {
            expanded.config.insert(k.clone(), v.clone());
        }
        for (name, device) in &profile.devices {
            expanded.devices.insert(name.clone(), device.clone());
        }
    }
    for (k, v) in local_config {
        expanded.config.insert(k.clone(), v.clone());
    }
    for (name, device) in local_devices {
        expanded.devices.insert(name.clone(), device.clone());
    }
    expanded
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    /// Keys that changed within each updated device, keyed by device name.
    pub changed_keys: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub project: String,
    pub name: String,
    pub instance_type: InstanceType,
    pub architecture: String,
    pub ephemeral: bool,
    pub stateful: bool,
    pub node: String,
    pub description: String,
    pub local_config: BTreeMap<String, String>,
    pub local_devices: BTreeMap<String, DeviceConfig>,
    pub profiles: Vec<Profile>,
    pub snapshot: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("name does not match the hostname grammar")]
    InvalidName,
    #[error("more than one disk device uses the same path")]
    DuplicateRootDisk,
    #[error("no expanded device has path=\"/\"")]
    MissingRootDisk,
    #[error("pool cannot be changed across an update for device {0}")]
    RootDiskPoolRename(String),
}

impl Instance {
    pub fn expanded(&self) -> ExpandedConfig {
        expand(&self.profiles, &self.local_config, &self.local_devices)
    }

    /// Valid hostname grammar, plus a free-form snapshot suffix after `/`
    /// not containing space or another `/` (spec §3 invariant).
    pub fn validate_name(name: &str) -> Result<(), ModelError> {
        let (base, snapshot_suffix) = match name.split_once('/') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (name, None),
        };

        if !is_valid_hostname_component(base) {
            return Err(ModelError::InvalidName);
        }
        if let Some(suffix) = snapshot_suffix {
            if suffix.is_empty() || suffix.contains(' ') || suffix.contains('/') {
                return Err(ModelError::InvalidName);
            }
        }
        Ok(())
    }

    /// Exactly one expanded device has `path=="/"` (spec §8 property 1).
    pub fn validate_single_root_disk(expanded: &ExpandedConfig) -> Result<(), ModelError> {
        let root_disks: Vec<_> = expanded
            .devices
            .iter()
            .filter(|(_, d)| d.device_type == "disk" && d.get("path") == Some("/"))
            .collect();

        match root_disks.len() {
            0 => Err(ModelError::MissingRootDisk),
            1 => Ok(()),
            _ => Err(ModelError::DuplicateRootDisk),
        }
    }
}

fn is_valid_hostname_component(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let bytes = s.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// Compare old vs new expanded device maps (spec §3 "Expanded device diff").
/// `updatable_fields` resolves each device kind's whitelist so the diff can
/// decide updated-vs-reshuffled.
pub fn diff_devices(
    old: &BTreeMap<String, DeviceConfig>,
    new: &BTreeMap<String, DeviceConfig>,
    updatable_fields: impl Fn(&str) -> &'static [&'static str],
) -> DeviceDiff {
    let mut diff = DeviceDiff::default();

    for name in old.keys() {
        if !new.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }
    for name in new.keys() {
        if !old.contains_key(name) {
            diff.added.push(name.clone());
        }
    }

    for (name, new_device) in new {
        let Some(old_device) = old.get(name) else {
            continue;
        };
        if old_device.device_type != new_device.device_type {
            diff.removed.push(name.clone());
            diff.added.push(name.clone());
            continue;
        }

        let mut changed = Vec::new();
        let mut keys: Vec<_> = old_device
            .config
            .keys()
            .chain(new_device.config.keys())
            .collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            if old_device.config.get(key) != new_device.config.get(key) {
                changed.push(key.clone());
            }
        }

        if changed.is_empty() {
            continue;
        }

        let allowed = updatable_fields(&new_device.device_type);
        if changed.iter().all(|k| allowed.contains(&k.as_str())) {
            diff.updated.push(name.clone());
            diff.changed_keys.insert(name.clone(), changed);
        } else {
            diff.removed.push(name.clone());
            diff.added.push(name.clone());
        }
    }

    diff.removed.sort();
    diff.added.sort();
    diff.updated.sort();
    diff
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdmapKeys {
    pub base: Option<String>,
    pub next: Option<String>,
    pub current: Option<String>,
    pub last_state: String,
}

impl IdmapKeys {
    pub fn current_set(&self) -> Result<IdmapSet, serde_json::Error> {
        match &self.current {
            Some(s) => IdmapSet::from_json(s),
            None => Ok(IdmapSet::default()),
        }
    }
}
