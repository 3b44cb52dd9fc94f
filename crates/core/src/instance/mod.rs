//! Instance driver (spec §2 item 7, §4.2, §3's state machine).
pub mod container;
pub mod vm;

use crate::device::DeviceError;
use crate::error::{ErrorKind, Kinded};
use crate::idmap::IdmapSet;
use crate::lock::OperationError;
use crate::storage::StorageError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: String, to: String },
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("operation error: {0}")]
    Operation(#[from] OperationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Kinded for LifecycleError {
    fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Precondition(_) | LifecycleError::InvalidTransition { .. } => {
                ErrorKind::Precondition
            }
            LifecycleError::Device(e) => e.kind(),
            LifecycleError::Storage(e) => e.kind(),
            LifecycleError::Operation(_) => ErrorKind::Fatal,
            LifecycleError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

/// Snapshot of an instance's idmap bookkeeping (spec §3's four coordinated
/// keys).
#[derive(Debug, Clone, Default)]
pub struct IdmapState {
    pub base: Option<IdmapSet>,
    pub next: Option<IdmapSet>,
    pub current: Option<IdmapSet>,
    /// Never `None`; possibly an empty set, per spec §3.
    pub last_state: IdmapSet,
}

/// Shared contract for both instance driver variants (spec §2 item 7).
/// Generalizes `lib/runtime-sdk`'s state-checked process wrapper pattern to
/// the instance lifecycle as a whole.
#[async_trait::async_trait]
pub trait InstanceDriver: Send + Sync {
    async fn start(&mut self, stateful: bool) -> Result<(), LifecycleError>;
    async fn stop(&mut self, stateful: bool) -> Result<(), LifecycleError>;
    async fn shutdown(&mut self, timeout: Duration) -> Result<(), LifecycleError>;
    async fn freeze(&mut self) -> Result<(), LifecycleError>;
    async fn unfreeze(&mut self) -> Result<(), LifecycleError>;
    async fn restart(&mut self, timeout: Duration) -> Result<(), LifecycleError>;
    async fn snapshot(
        &mut self,
        name: &str,
        stateful: bool,
    ) -> Result<(), LifecycleError>;
    async fn restore(&mut self, source: &str, stateful: bool) -> Result<(), LifecycleError>;
}
