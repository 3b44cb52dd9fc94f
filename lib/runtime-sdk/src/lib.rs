//! Process + control-API wrapper for the VM instance driver.
//!
//! *Targets a KVM microVM manager compatible with Firecracker's v1.x control
//! API.* The VM variant of the instance driver (`core::instance::vm`) uses
//! this crate exclusively; the container variant talks to its own runtime
//! library and never touches this crate.
pub mod api;
pub mod builder;
pub mod dto;
mod process;

pub use api::{ApiError, RuntimeApiClient};
pub use builder::RuntimeProcessBuilder;
pub use process::{Error, RuntimeProcess};
