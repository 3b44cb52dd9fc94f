//! Storage pool surface (spec §2 item 6, §6) — trait only; real ZFS/Btrfs
//! /Ceph/LVM drivers are out of scope (spec.md §1).
use crate::device::{MountEntry, RootfsDescriptor};
use crate::error::{ErrorKind, Kinded};
use crate::idmap::ShiftMode;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("pool not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Kinded for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Mount(_) => ErrorKind::Fatal,
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

pub trait PoolInstance: Send + Sync {
    fn project(&self) -> &str;
    fn name(&self) -> &str;
    fn instance_path(&self) -> PathBuf;
}

pub struct CustomVolumeRef {
    pub pool: String,
    pub name: String,
}

#[async_trait::async_trait]
pub trait StoragePool: Send + Sync {
    async fn mount_instance(
        &self,
        inst: &dyn PoolInstance,
    ) -> Result<RootfsDescriptor, StorageError>;
    async fn unmount_instance(&self, inst: &dyn PoolInstance) -> Result<(), StorageError>;
    async fn apply_quota(
        &self,
        inst: &dyn PoolInstance,
        size: Option<u64>,
    ) -> Result<(), StorageError>;
    async fn snapshot(&self, inst: &dyn PoolInstance, name: &str) -> Result<(), StorageError>;
    async fn restore_snapshot(
        &self,
        inst: &dyn PoolInstance,
        name: &str,
    ) -> Result<(), StorageError>;
    async fn attach_custom_volume(
        &self,
        inst: &dyn PoolInstance,
        vol: &CustomVolumeRef,
        shift: ShiftMode,
    ) -> Result<MountEntry, StorageError>;
}

/// A pool backed by plain bind-mounts under a scratch directory, generalized
/// from the teacher's `cpp.rs::prepare` tempdir-per-run staging into a
/// persistent per-instance rootfs directory.
pub struct DirStoragePool {
    root: PathBuf,
}

impl DirStoragePool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn instance_root(&self, inst: &dyn PoolInstance) -> PathBuf {
        self.root.join(inst.project()).join(inst.name())
    }
}

#[async_trait::async_trait]
impl StoragePool for DirStoragePool {
    async fn mount_instance(
        &self,
        inst: &dyn PoolInstance,
    ) -> Result<RootfsDescriptor, StorageError> {
        let path = self.instance_root(inst);
        tokio::fs::create_dir_all(&path).await?;
        Ok(RootfsDescriptor {
            path,
            read_only: false,
        })
    }

    async fn unmount_instance(&self, _inst: &dyn PoolInstance) -> Result<(), StorageError> {
        Ok(())
    }

    async fn apply_quota(
        &self,
        _inst: &dyn PoolInstance,
        _size: Option<u64>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn snapshot(&self, inst: &dyn PoolInstance, name: &str) -> Result<(), StorageError> {
        let source = self.instance_root(inst);
        let dest = self.root.join(inst.project()).join(format!(
            "{}.snap.{}",
            inst.name(),
            name
        ));
        copy_dir_recursive(&source, &dest)?;
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        inst: &dyn PoolInstance,
        name: &str,
    ) -> Result<(), StorageError> {
        let source = self.root.join(inst.project()).join(format!(
            "{}.snap.{}",
            inst.name(),
            name
        ));
        if !source.exists() {
            return Err(StorageError::NotFound(format!(
                "snapshot {name} for {}/{}",
                inst.project(),
                inst.name()
            )));
        }
        let dest = self.instance_root(inst);
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        copy_dir_recursive(&source, &dest)?;
        Ok(())
    }

    async fn attach_custom_volume(
        &self,
        inst: &dyn PoolInstance,
        vol: &CustomVolumeRef,
        shift: ShiftMode,
    ) -> Result<MountEntry, StorageError> {
        let source = self.root.join("custom").join(&vol.pool).join(&vol.name);
        tokio::fs::create_dir_all(&source).await?;
        Ok(MountEntry {
            devpath: source.display().to_string(),
            targetpath: format!("/mnt/{}", vol.name),
            fstype: "none".to_string(),
            options: vec!["bind".to_string()],
            freq: 0,
            passno: 0,
            idmap_shift: Some(shift),
            limits: None,
            attached: true,
        })
    }
}

fn copy_dir_recursive(source: &std::path::Path, dest: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(source).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).unwrap();
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// In-memory pool used by component tests for the device/instance layers
/// that only need "some `StoragePool`", not real persistence.
#[cfg(test)]
pub struct NullStoragePool;

#[cfg(test)]
#[async_trait::async_trait]
impl StoragePool for NullStoragePool {
    async fn mount_instance(
        &self,
        _inst: &dyn PoolInstance,
    ) -> Result<RootfsDescriptor, StorageError> {
        Ok(RootfsDescriptor {
            path: PathBuf::from("/dev/null"),
            read_only: false,
        })
    }

    async fn unmount_instance(&self, _inst: &dyn PoolInstance) -> Result<(), StorageError> {
        Ok(())
    }

    async fn apply_quota(
        &self,
        _inst: &dyn PoolInstance,
        _size: Option<u64>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn snapshot(&self, _inst: &dyn PoolInstance, _name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        _inst: &dyn PoolInstance,
        _name: &str,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn attach_custom_volume(
        &self,
        _inst: &dyn PoolInstance,
        vol: &CustomVolumeRef,
        shift: ShiftMode,
    ) -> Result<MountEntry, StorageError> {
        Ok(MountEntry {
            devpath: format!("/dev/null/{}", vol.name),
            targetpath: format!("/mnt/{}", vol.name),
            fstype: "none".to_string(),
            options: vec![],
            freq: 0,
            passno: 0,
            idmap_shift: Some(shift),
            limits: None,
            attached: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestInstance {
        project: String,
        name: String,
    }

    impl PoolInstance for TestInstance {
        fn project(&self) -> &str {
            &self.project
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn instance_path(&self) -> PathBuf {
            PathBuf::new()
        }
    }

    #[tokio::test]
    async fn dir_pool_mounts_create_the_instance_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = DirStoragePool::new(tmp.path());
        let inst = TestInstance {
            project: "default".into(),
            name: "c1".into(),
        };
        let descriptor = pool.mount_instance(&inst).await.unwrap();
        assert!(descriptor.path.exists());
    }

    #[tokio::test]
    async fn dir_pool_snapshot_and_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = DirStoragePool::new(tmp.path());
        let inst = TestInstance {
            project: "default".into(),
            name: "c1".into(),
        };
        let descriptor = pool.mount_instance(&inst).await.unwrap();
        std::fs::write(descriptor.path.join("marker"), b"v1").unwrap();

        pool.snapshot(&inst, "snap0").await.unwrap();
        std::fs::write(descriptor.path.join("marker"), b"v2").unwrap();

        pool.restore_snapshot(&inst, "snap0").await.unwrap();
        let content = std::fs::read(descriptor.path.join("marker")).unwrap();
        assert_eq!(content, b"v1");
    }

    #[tokio::test]
    async fn restoring_a_missing_snapshot_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = DirStoragePool::new(tmp.path());
        let inst = TestInstance {
            project: "default".into(),
            name: "c1".into(),
        };
        let err = pool.restore_snapshot(&inst, "nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
