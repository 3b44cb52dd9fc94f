//! Error kinds shared across every lifecycle component (spec §7).
//!
//! Every component-level error enum (`DeviceError`, `LifecycleError`,
//! `ExecError`, `MigrationError`, `StorageError`, ...) implements [`Kinded`]
//! so that an HTTP-adjacent layer (out of scope here) can map any error back
//! to one of these classes without downcasting through every concrete
//! variant.

/// The coarse class an error belongs to, independent of which component
/// raised it. Mirrors spec §7's five kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad config or device shape. No side effects occurred.
    Validation,
    /// Instance state wrong for the requested action.
    Precondition,
    /// Operation lock incompatible with an in-flight action.
    Conflict,
    /// A required resource (disk source, volume, pool) is missing.
    NotFound,
    /// Retryable I/O condition (EAGAIN/EINTR and friends).
    TransientIo,
    /// Unrecoverable: runtime/checkpointer/store failure.
    Fatal,
}

pub trait Kinded {
    fn kind(&self) -> ErrorKind;
}
