//! Disk device policy (spec §4.3's largest kind).
use super::{Device, DeviceError, InstanceHandle, IoLimits, MountEntry, RunConfig};
use crate::idmap::{IdmapSet, ShiftMode};
use crate::model::{DeviceConfig, ExpandedConfig, InstanceType};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    Path(PathBuf),
    CloudInitConfig,
    AgentConfig,
    Ceph { pool: String, vol: String },
    CephFs { mds: String, path: String },
    Pool { volume: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Filesystem,
    Block,
    Iso,
}

impl DiskSource {
    pub fn parse(raw: &str, pool: Option<&str>) -> Result<Self, DeviceError> {
        if let Some(pool) = pool {
            return Ok(DiskSource::Pool {
                volume: format!("{pool}/{raw}"),
            });
        }
        match raw {
            "cloud-init:config" => Ok(DiskSource::CloudInitConfig),
            "agent:config" => Ok(DiskSource::AgentConfig),
            other if other.starts_with("ceph:") => {
                let rest = &other[5..];
                let (pool, vol) = rest.split_once('/').ok_or_else(|| {
                    DeviceError::Validation(format!("invalid ceph source {other}"))
                })?;
                Ok(DiskSource::Ceph {
                    pool: pool.to_string(),
                    vol: vol.to_string(),
                })
            }
            other if other.starts_with("cephfs:") => {
                let rest = &other[7..];
                let (mds, path) = rest.split_once('/').ok_or_else(|| {
                    DeviceError::Validation(format!("invalid cephfs source {other}"))
                })?;
                Ok(DiskSource::CephFs {
                    mds: mds.to_string(),
                    path: path.to_string(),
                })
            }
            other if other.starts_with('/') => Ok(DiskSource::Path(PathBuf::from(other))),
            other => Err(DeviceError::Validation(format!(
                "disk source must be absolute, a special source, or a pool volume: {other}"
            ))),
        }
    }
}

/// Resolve a non-pool local source path beneath `root`, rejecting symlink
/// escapes even when the final target exists (spec §4.3). Grounded in the
/// same raw-syscall style the teacher uses for its `pre_exec` hook: `nix`
/// does not wrap `openat2`, so this goes through `libc::syscall` directly.
pub fn resolve_local_source(root: &Path, requested: &Path) -> Result<PathBuf, DeviceError> {
    let relative = requested
        .strip_prefix("/")
        .map_err(|_| DeviceError::Validation("disk source path must be absolute".into()))?;
    let full = root.join(relative);

    #[repr(C)]
    struct OpenHow {
        flags: u64,
        mode: u64,
        resolve: u64,
    }
    const RESOLVE_BENEATH: u64 = 0x08;
    const RESOLVE_NO_MAGICLINKS: u64 = 0x02;
    const SYS_OPENAT2: i64 = 437;

    let root_cstr = std::ffi::CString::new(root.as_os_str().as_encoded_bytes())
        .map_err(|_| DeviceError::Validation("root path contains a NUL byte".into()))?;
    let relative_cstr = std::ffi::CString::new(relative.as_os_str().as_encoded_bytes())
        .map_err(|_| DeviceError::Validation("source path contains a NUL byte".into()))?;

    let root_fd = unsafe { libc::open(root_cstr.as_ptr(), libc::O_DIRECTORY | libc::O_PATH) };
    if root_fd < 0 {
        return Err(DeviceError::SourceNotFound(full.display().to_string()));
    }

    let how = OpenHow {
        flags: libc::O_PATH as u64,
        mode: 0,
        resolve: RESOLVE_BENEATH | RESOLVE_NO_MAGICLINKS,
    };

    let fd = unsafe {
        libc::syscall(
            SYS_OPENAT2,
            root_fd,
            relative_cstr.as_ptr(),
            &how as *const OpenHow,
            std::mem::size_of::<OpenHow>(),
        )
    };
    unsafe { libc::close(root_fd) };

    if fd < 0 {
        return Err(DeviceError::SourceNotFound(full.display().to_string()));
    }
    unsafe { libc::close(fd as i32) };

    Ok(full)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedIoLimit {
    pub bytes_per_sec: Option<u64>,
    pub iops: Option<u64>,
}

/// Parse `<size>[suffix]/s` or `<n>iops` (spec §4.3).
pub fn parse_io_limit(raw: &str) -> Result<ParsedIoLimit, DeviceError> {
    if let Some(stripped) = raw.strip_suffix("iops") {
        let n: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| DeviceError::Validation(format!("invalid iops limit: {raw}")))?;
        return Ok(ParsedIoLimit {
            bytes_per_sec: None,
            iops: Some(n),
        });
    }
    let stripped = raw
        .strip_suffix("/s")
        .ok_or_else(|| DeviceError::Validation(format!("invalid io limit: {raw}")))?;
    let bytes = parse_size_suffix(stripped)?;
    Ok(ParsedIoLimit {
        bytes_per_sec: Some(bytes),
        iops: None,
    })
}

fn parse_size_suffix(raw: &str) -> Result<u64, DeviceError> {
    let raw = raw.trim();
    let (digits, multiplier) = if let Some(n) = raw.strip_suffix("GB") {
        (n, 1_000_000_000)
    } else if let Some(n) = raw.strip_suffix("MB") {
        (n, 1_000_000)
    } else if let Some(n) = raw.strip_suffix("kB") {
        (n, 1_000)
    } else {
        (raw, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| DeviceError::Validation(format!("invalid size: {raw}")))
}

/// Average per-device limits arithmetically across instances sharing a
/// block device (spec §4.3).
pub fn average_limits(limits: &[IoLimits]) -> IoLimits {
    fn avg(values: impl Iterator<Item = Option<u64>> + Clone) -> Option<u64> {
        let present: Vec<u64> = values.flatten().collect();
        if present.is_empty() {
            None
        } else {
            Some(present.iter().sum::<u64>() / present.len() as u64)
        }
    }
    IoLimits {
        read_bps: avg(limits.iter().map(|l| l.read_bps)),
        write_bps: avg(limits.iter().map(|l| l.write_bps)),
        read_iops: avg(limits.iter().map(|l| l.read_iops)),
        write_iops: avg(limits.iter().map(|l| l.write_iops)),
    }
}

/// Idmap reconciliation for an attached custom volume (spec §4.3): compare
/// `volatile.idmap.last` on the volume against the instance's next idmap.
pub enum Reconciliation {
    /// Volume idmap already matches; nothing to do.
    NoOp,
    /// Unshift by `from`, shift by `to`, and persist `to` as the volume's
    /// new `volatile.idmap.last`.
    Reshift { from: IdmapSet, to: IdmapSet },
}

pub fn reconcile_custom_volume_idmap(
    volume_last: &IdmapSet,
    instance_next: &IdmapSet,
    shared_by_others_with_disagreeing_idmap: bool,
) -> Result<Reconciliation, DeviceError> {
    if volume_last == instance_next {
        return Ok(Reconciliation::NoOp);
    }
    if shared_by_others_with_disagreeing_idmap {
        return Err(DeviceError::InUse("idmaps not identical".into()));
    }
    Ok(Reconciliation::Reshift {
        from: volume_last.clone(),
        to: instance_next.clone(),
    })
}

pub struct DiskDevice {
    name: String,
    config: DeviceConfig,
}

impl DiskDevice {
    pub const UPDATABLE_FIELDS: &'static [&'static str] =
        &["limits.read", "limits.write", "limits.max", "io.cache"];

    pub fn new(name: &str, config: &DeviceConfig) -> Result<Self, DeviceError> {
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
        })
    }

    pub fn is_root_disk(&self) -> bool {
        self.config.get("path") == Some("/")
    }

    pub fn content_type(&self) -> ContentType {
        match self.config.get("content_type") {
            Some("block") => ContentType::Block,
            Some("iso") => ContentType::Iso,
            _ => ContentType::Filesystem,
        }
    }

    /// Block and ISO volumes cannot attach to containers; un-shared block
    /// volumes can attach to at most one instance (spec §4.3).
    pub fn validate_attach(
        &self,
        instance_type: InstanceType,
        shared: bool,
        already_attached_elsewhere: bool,
    ) -> Result<(), DeviceError> {
        match self.content_type() {
            ContentType::Block | ContentType::Iso if instance_type == InstanceType::Container => {
                Err(DeviceError::Validation(
                    "block and iso volumes cannot attach to containers".into(),
                ))
            }
            ContentType::Block if !shared && already_attached_elsewhere => Err(
                DeviceError::InUse("un-shared block volume already attached".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Shift mode selection: containers only (spec §4.3).
    pub fn shift_mode_for(&self, instance_type: InstanceType) -> ShiftMode {
        if instance_type != InstanceType::Container {
            return ShiftMode::None;
        }
        match self.config.get("shift") {
            Some("false") | Some("none") => ShiftMode::None,
            Some("dynamic") => ShiftMode::Dynamic,
            _ => ShiftMode::Static,
        }
    }
}

#[async_trait::async_trait]
impl Device for DiskDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, expanded: &ExpandedConfig) -> Result<(), DeviceError> {
        if self.config.device_type != "disk" {
            return Err(DeviceError::Validation("not a disk device".into()));
        }
        let path = self
            .config
            .get("path")
            .ok_or_else(|| DeviceError::Validation("disk device requires a path".into()))?;

        if path != "/" && self.config.get("size").is_some() {
            return Err(DeviceError::Validation(
                "size may only be set on the root disk".into(),
            ));
        }

        if self.is_root_disk() {
            let root_disk_count = expanded
                .devices
                .values()
                .filter(|d| d.device_type == "disk" && d.get("path") == Some("/"))
                .count();
            if root_disk_count > 1 {
                return Err(DeviceError::Validation(
                    "More than one disk device uses the same path".into(),
                ));
            }
        }
        Ok(())
    }

    fn pre_start_check(&self, _inst: &dyn InstanceHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn start(&self, _inst: &dyn InstanceHandle) -> Result<RunConfig, DeviceError> {
        let mut run_config = RunConfig::default();
        if let Some(path) = self.config.get("path") {
            run_config.mounts.push(MountEntry {
                devpath: self.config.get("source").unwrap_or_default().to_string(),
                targetpath: path.to_string(),
                fstype: "none".to_string(),
                options: vec!["bind".to_string()],
                freq: 0,
                passno: 0,
                idmap_shift: None,
                limits: None,
                attached: true,
            });
        }
        Ok(run_config)
    }

    async fn stop(&self, _inst: &dyn InstanceHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn update(
        &self,
        _inst: &dyn InstanceHandle,
        _old: &DeviceConfig,
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    fn register(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn remove(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn can_hotplug(&self) -> bool {
        !self.is_root_disk()
    }

    fn can_migrate(&self) -> bool {
        true
    }

    fn updatable_fields(&self) -> &'static [&'static str] {
        Self::UPDATABLE_FIELDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn disk_config(path: &str) -> DeviceConfig {
        let mut config = BTreeMap::new();
        config.insert("path".to_string(), path.to_string());
        DeviceConfig {
            device_type: "disk".to_string(),
            config,
        }
    }

    #[test]
    fn parses_absolute_path_source() {
        let source = DiskSource::parse("/srv/data", None).unwrap();
        assert_eq!(source, DiskSource::Path(PathBuf::from("/srv/data")));
    }

    #[test]
    fn parses_pool_volume_source() {
        let source = DiskSource::parse("myvol", Some("p1")).unwrap();
        assert_eq!(
            source,
            DiskSource::Pool {
                volume: "p1/myvol".to_string()
            }
        );
    }

    #[test]
    fn parses_ceph_source() {
        let source = DiskSource::parse("ceph:pool1/vol1", None).unwrap();
        assert_eq!(
            source,
            DiskSource::Ceph {
                pool: "pool1".to_string(),
                vol: "vol1".to_string()
            }
        );
    }

    #[test]
    fn rejects_relative_non_special_source() {
        assert!(DiskSource::parse("relative/path", None).is_err());
    }

    #[test]
    fn parses_bytes_per_second_limit() {
        let limit = parse_io_limit("10MB/s").unwrap();
        assert_eq!(limit.bytes_per_sec, Some(10_000_000));
        assert_eq!(limit.iops, None);
    }

    #[test]
    fn parses_iops_limit() {
        let limit = parse_io_limit("500iops").unwrap();
        assert_eq!(limit.iops, Some(500));
    }

    #[test]
    fn averages_limits_across_instances() {
        let limits = vec![
            IoLimits {
                read_bps: Some(100),
                write_bps: Some(200),
                read_iops: None,
                write_iops: None,
            },
            IoLimits {
                read_bps: Some(300),
                write_bps: None,
                read_iops: None,
                write_iops: None,
            },
        ];
        let avg = average_limits(&limits);
        assert_eq!(avg.read_bps, Some(200));
        assert_eq!(avg.write_bps, Some(200));
        assert_eq!(avg.write_iops, None);
    }

    #[test]
    fn scenario_s1_rejects_duplicate_root_disk_path() {
        let mut devices = BTreeMap::new();
        devices.insert("root".to_string(), disk_config("/"));
        devices.insert("root2".to_string(), disk_config("/"));
        let expanded = ExpandedConfig {
            config: BTreeMap::new(),
            devices,
        };

        let disk = DiskDevice::new("root", &disk_config("/")).unwrap();
        let err = disk.validate(&expanded).unwrap_err();
        assert!(matches!(err, DeviceError::Validation(msg) if msg.contains("More than one disk device")));
    }

    #[test]
    fn block_volumes_cannot_attach_to_containers() {
        let mut config = disk_config("/data");
        config.config.insert("content_type".to_string(), "block".to_string());
        let disk = DiskDevice::new("data", &config).unwrap();
        assert!(disk
            .validate_attach(InstanceType::Container, false, false)
            .is_err());
        assert!(disk
            .validate_attach(InstanceType::Vm, false, false)
            .is_ok());
    }

    #[test]
    fn unshared_block_volume_rejects_second_attach() {
        let mut config = disk_config("/data");
        config.config.insert("content_type".to_string(), "block".to_string());
        let disk = DiskDevice::new("data", &config).unwrap();
        assert!(disk.validate_attach(InstanceType::Vm, false, true).is_err());
        assert!(disk.validate_attach(InstanceType::Vm, true, true).is_ok());
    }

    #[test]
    fn shift_mode_defaults_to_static_for_containers_only() {
        let disk = DiskDevice::new("root", &disk_config("/")).unwrap();
        assert_eq!(disk.shift_mode_for(InstanceType::Container), ShiftMode::Static);
        assert_eq!(disk.shift_mode_for(InstanceType::Vm), ShiftMode::None);
    }

    #[test]
    fn idmap_reconciliation_fails_on_disagreement_when_shared() {
        use crate::idmap::{IdKind, IdmapEntry};
        let last = IdmapSet::new(vec![IdmapEntry {
            kind: IdKind::Uid,
            nsid: 0,
            hostid: 100_000,
            maprange: 65536,
        }]);
        let next = IdmapSet::new(vec![IdmapEntry {
            kind: IdKind::Uid,
            nsid: 0,
            hostid: 200_000,
            maprange: 65536,
        }]);
        let err = reconcile_custom_volume_idmap(&last, &next, true).unwrap_err();
        assert!(matches!(err, DeviceError::InUse(msg) if msg == "idmaps not identical"));
    }

    #[test]
    fn idmap_reconciliation_reshifts_when_not_shared() {
        use crate::idmap::{IdKind, IdmapEntry};
        let last = IdmapSet::new(vec![IdmapEntry {
            kind: IdKind::Uid,
            nsid: 0,
            hostid: 100_000,
            maprange: 65536,
        }]);
        let next = IdmapSet::new(vec![IdmapEntry {
            kind: IdKind::Uid,
            nsid: 0,
            hostid: 200_000,
            maprange: 65536,
        }]);
        match reconcile_custom_volume_idmap(&last, &next, false).unwrap() {
            Reconciliation::Reshift { from, to } => {
                assert_eq!(from, last);
                assert_eq!(to, next);
            }
            Reconciliation::NoOp => panic!("expected a reshift"),
        }
    }
}
