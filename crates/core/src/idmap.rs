//! ID-map set (spec §2 item 4, §4.3, §8 property 4).
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use crate::error::{ErrorKind, Kinded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKind {
    Uid,
    Gid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdmapEntry {
    pub kind: IdKind,
    pub nsid: i64,
    pub hostid: i64,
    pub maprange: i64,
}

impl IdmapEntry {
    pub fn contains_host(&self, id: i64) -> bool {
        id >= self.hostid && id < self.hostid + self.maprange
    }

    /// Translate a host id into its namespace id, if this entry covers it.
    pub fn host_to_ns(&self, hostid: i64) -> Option<i64> {
        self.contains_host(hostid)
            .then(|| self.nsid + (hostid - self.hostid))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapSet(pub Vec<IdmapEntry>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftMode {
    None,
    Static,
    Dynamic,
}

#[derive(Debug, thiserror::Error)]
pub enum IdmapError {
    #[error("io error shifting {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("host id range overlaps a reserved isolated-idmap allocation")]
    Validation,
    #[error("dynamic (idmapped-mount) shift is not supported on this kernel/filesystem")]
    DynamicUnsupported,
}

impl Kinded for IdmapError {
    fn kind(&self) -> ErrorKind {
        match self {
            IdmapError::Io { .. } => ErrorKind::TransientIo,
            IdmapError::Validation => ErrorKind::Validation,
            IdmapError::DynamicUnsupported => ErrorKind::Precondition,
        }
    }
}

impl IdmapSet {
    pub fn new(entries: Vec<IdmapEntry>) -> Self {
        Self(entries)
    }

    /// Order-preserving union: entries already present (by exact value) are
    /// not duplicated; genuinely new ranges are appended (spec §2 item 4).
    pub fn union(&self, other: &IdmapSet) -> IdmapSet {
        let mut merged = self.0.clone();
        let existing: HashSet<_> = self.0.iter().copied().collect();
        for entry in &other.0 {
            if !existing.contains(entry) {
                merged.push(*entry);
            }
        }
        IdmapSet(merged)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        if s.trim().is_empty() {
            return Ok(IdmapSet::default());
        }
        serde_json::from_str(s)
    }

    /// Reject entries whose host range overlaps a reserved sub-id range
    /// (spec §2 item 4's "host-ID-is-sub-ID rejection").
    pub fn validate_no_subid_overlap(&self, reserved: &[IdmapEntry]) -> Result<(), IdmapError> {
        for entry in &self.0 {
            for other in reserved {
                if entry.kind != other.kind {
                    continue;
                }
                let overlap = entry.hostid < other.hostid + other.maprange
                    && other.hostid < entry.hostid + entry.maprange;
                if overlap {
                    return Err(IdmapError::Validation);
                }
            }
        }
        Ok(())
    }

    /// Shift (chown) every file under `path` by this map's host offset,
    /// mapping namespace-visible ownership to host ownership. In `Dynamic`
    /// mode, an idmapped mount does this translation at the mount layer, so
    /// once the kernel is confirmed to support it no on-disk chown pass
    /// happens at all.
    pub fn shift_path(&self, path: &Path, mode: ShiftMode) -> Result<(), IdmapError> {
        if mode == ShiftMode::Dynamic {
            return if dynamic_shift_supported() {
                Ok(())
            } else {
                Err(IdmapError::DynamicUnsupported)
            };
        }
        self.walk_and_chown(path, Direction::Shift)
    }

    /// Inverse of [`IdmapSet::shift_path`]. Shift then unshift is the
    /// identity (spec §8 property 4).
    pub fn unshift_path(&self, path: &Path, mode: ShiftMode) -> Result<(), IdmapError> {
        if mode == ShiftMode::Dynamic {
            return if dynamic_shift_supported() {
                Ok(())
            } else {
                Err(IdmapError::DynamicUnsupported)
            };
        }
        self.walk_and_chown(path, Direction::Unshift)
    }

    fn walk_and_chown(&self, path: &Path, direction: Direction) -> Result<(), IdmapError> {
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry.map_err(|e| IdmapError::Io {
                path: path.display().to_string(),
                source: e.into(),
            })?;
            let meta = entry.metadata().map_err(|e| IdmapError::Io {
                path: entry.path().display().to_string(),
                source: e.into(),
            })?;

            use std::os::unix::fs::MetadataExt;
            let (uid, gid) = (meta.uid() as i64, meta.gid() as i64);
            let new_uid = self.translate(IdKind::Uid, uid, direction);
            let new_gid = self.translate(IdKind::Gid, gid, direction);

            nix::unistd::chown(
                entry.path(),
                Some(nix::unistd::Uid::from_raw(new_uid as u32)),
                Some(nix::unistd::Gid::from_raw(new_gid as u32)),
            )
            .map_err(|e| IdmapError::Io {
                path: entry.path().display().to_string(),
                source: std::io::Error::from_raw_os_error(e as i32),
            })?;
        }
        Ok(())
    }

    fn translate(&self, kind: IdKind, id: i64, direction: Direction) -> i64 {
        for entry in &self.0 {
            if entry.kind != kind {
                continue;
            }
            match direction {
                Direction::Shift => {
                    if id >= entry.nsid && id < entry.nsid + entry.maprange {
                        return entry.hostid + (id - entry.nsid);
                    }
                }
                Direction::Unshift => {
                    if entry.contains_host(id) {
                        return entry.nsid + (id - entry.hostid);
                    }
                }
            }
        }
        id
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Shift,
    Unshift,
}

static DYNAMIC_SHIFT_SUPPORT: OnceLock<bool> = OnceLock::new();

/// Detects idmapped-mount (`mount_setattr`/`MOUNT_ATTR_IDMAP`) support once
/// per daemon startup and caches the result, since the running kernel
/// cannot change underneath a live process.
fn dynamic_shift_supported() -> bool {
    *DYNAMIC_SHIFT_SUPPORT.get_or_init(|| {
        nix::sys::utsname::uname()
            .map(|uts| kernel_supports_idmapped_mounts(&uts.release().to_string_lossy()))
            .unwrap_or(false)
    })
}

/// `MOUNT_ATTR_IDMAP` landed in Linux 5.12; anything older cannot run a
/// Dynamic shift regardless of filesystem.
fn kernel_supports_idmapped_mounts(release: &str) -> bool {
    let mut version = release
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse::<u32>().ok());
    let major = version.next().unwrap_or(0);
    let minor = version.next().unwrap_or(0);
    (major, minor) >= (5, 12)
}

/// Global, process-wide allocator computing a non-overlapping host-id
/// offset for `security.idmap.isolated=true` containers (spec §5: "Idmap
/// allocation uses a global lock").
pub struct IdmapAllocator {
    next_offset: Mutex<i64>,
    block_size: i64,
}

impl IdmapAllocator {
    pub fn new(base_offset: i64, block_size: i64) -> Self {
        Self {
            next_offset: Mutex::new(base_offset),
            block_size,
        }
    }

    pub fn allocate(&self) -> i64 {
        let mut next = self.next_offset.lock().unwrap();
        let offset = *next;
        *next += self.block_size;
        offset
    }
}
