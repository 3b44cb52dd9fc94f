/// Vsock port the guest agent listens on for engine connections.
pub const DEFAULT_VSOCK_PORT: u32 = 9999;

/// Default wall-clock limit for a `RunCommand` request when the request
/// does not specify one.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 60_000;

/// Default memory limit in KiB (256 MiB) for a `RunCommand` request when the
/// request does not specify one.
pub const DEFAULT_MEMORY_LIMIT_KIB: u64 = 256 * 1024;
