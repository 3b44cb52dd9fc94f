//! Wire types for the VM instance driver's VMM control API.
//!
//! These mirror the JSON schema a KVM-backed microVM manager exposes over its
//! local control socket. Field names are load-bearing: they round-trip
//! straight onto the wire, so they follow the API's own naming rather than
//! Rust conventions where the two disagree (`mem_size_mib`, `iface_id`, ...).
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Balloon device descriptor.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balloon {
    /// Target balloon size in MiB.
    pub amount_mib: isize,
    /// Whether the balloon should deflate when the guest has memory pressure.
    pub deflate_on_oom: bool,
    /// Interval in seconds between refreshing statistics. Zero disables them.
    pub stats_polling_interval_s: Option<isize>,
}

/// Partial update to a running balloon device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalloonUpdate {
    pub amount_mib: isize,
}

/// CPU template controlling which guest-visible features are masked.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum CpuTemplate {
    C3,
    T2,
    T2S,
    T2CL,
    T2A,
    #[default]
    None,
}

/// Boot source descriptor.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    /// Kernel command line.
    pub boot_args: Option<String>,
    /// Host path to the initrd image, if any.
    pub initrd_path: Option<String>,
    /// Host path to the kernel image used to boot the guest.
    pub kernel_image_path: String,
}

/// A single block device attached to the VM, sourced from a `RunConfig`
/// `MountEntry` whose fstype marks it as a raw block attachment.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub partuuid: Option<String>,
    pub is_root_device: bool,
    pub cache_type: Option<CacheType>,
    pub is_read_only: Option<bool>,
    pub path_on_host: Option<String>,
    pub rate_limiter: Option<RateLimiter>,
    pub io_engine: Option<IoEngine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheType {
    Unsafe,
    Writeback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IoEngine {
    Sync,
    Async,
}

/// A memory-mapped pass-through device backing a pmem volume.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pmem {
    pub id: String,
    pub path_on_host: String,
    pub root_device: Option<bool>,
    pub read_only: Option<bool>,
}

/// Error body returned by the control API on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub fault_message: String,
}

/// Full point-in-time configuration snapshot, used by `get_vm_config`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FullVmConfiguration {
    pub balloon: Option<Balloon>,
    pub drives: Option<Vec<Drive>>,
    #[serde(rename = "boot-source")]
    pub boot_source: Option<BootSource>,
    pub logger: Option<Logger>,
    #[serde(rename = "machine-config")]
    pub machine_config: Option<MachineConfiguration>,
    pub metrics: Option<Metrics>,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Option<Vec<NetworkInterface>>,
    pub pmem: Option<Vec<Pmem>>,
    pub vsock: Option<Vsock>,
    pub entropy: Option<EntropyDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceActionInfo {
    pub action_type: ActionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionType {
    FlushMetrics,
    InstanceStart,
    SendCtrlAltDel,
}

/// Point-in-time status of the VMM process, returned by `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub app_name: String,
    pub id: String,
    pub state: InstanceState,
    pub vmm_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    #[serde(rename = "Not Started")]
    NotStarted,
    Running,
    Paused,
    Stopped,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    pub level: Option<LoggerLevel>,
    pub log_path: Option<String>,
    pub module: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum LoggerLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
    Trace,
    Off,
}

#[allow(clippy::from_over_into)]
impl Into<String> for LoggerLevel {
    fn into(self) -> String {
        match self {
            LoggerLevel::Error => "Error".to_string(),
            LoggerLevel::Warning => "Warning".to_string(),
            LoggerLevel::Info => "Info".to_string(),
            LoggerLevel::Debug => "Debug".to_string(),
            LoggerLevel::Trace => "Trace".to_string(),
            LoggerLevel::Off => "Off".to_string(),
        }
    }
}

/// Host-vsock bridge used by the exec subsystem's VM-interactive mode and by
/// the guest agent control channel.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Vsock {
    pub guest_cid: isize,
    pub uds_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerVersion {
    pub firecracker_version: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDevice {
    pub serial_out_path: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyDevice {
    pub rate_limiter: Option<RateLimiter>,
}

/// A network interface, composed from a device's `NetworkInterfaceConfig`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub guest_mac: Option<String>,
    pub host_dev_name: String,
    pub iface_id: String,
    pub rx_rate_limiter: Option<RateLimiter>,
    pub tx_rate_limiter: Option<RateLimiter>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub metrics_path: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfiguration {
    pub cpu_template: Option<CpuTemplate>,
    pub smt: Option<bool>,
    pub mem_size_mib: isize,
    pub track_dirty_pages: Option<bool>,
    pub vcpu_count: isize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MemoryBackendType {
    File,
    Uffd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBackend {
    pub backend_type: MemoryBackendType,
    pub backend_path: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiter {
    pub bandwidth: Option<TokenBucket>,
    pub ops: Option<TokenBucket>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreateParams {
    pub snapshot_type: Option<SnapshotType>,
    pub mem_file_path: String,
    pub snapshot_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotType {
    Full,
    Diff,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialDrive {
    pub drive_id: String,
    pub path_on_host: Option<String>,
    pub rate_limiter: Option<RateLimiter>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialNetworkInterface {
    pub iface_id: String,
    pub rx_rate_limiter: Option<RateLimiter>,
    pub tx_rate_limiter: Option<RateLimiter>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    pub one_time_burst: Option<i64>,
    pub refill_time: i64,
    pub size: i64,
}

/// Used during snapshot restore to rebind a network interface's TAP device,
/// since a migration destination's host names differ from the source's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOverride {
    pub iface_id: String,
    pub host_dev_name: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLoadParams {
    pub track_dirty_pages: Option<bool>,
    pub mem_file_path: Option<String>,
    pub mem_backend: Option<MemoryBackend>,
    pub snapshot_path: String,
    pub resume_vm: Option<bool>,
    pub network_overrides: Option<Vec<NetworkOverride>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VmState {
    Paused,
    Running,
}
