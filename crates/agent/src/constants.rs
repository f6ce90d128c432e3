/// vsock port the guest executor listens on; matches `VmShapeConfig::vsock_port`.
pub const DEFAULT_VSOCK_PORT: u32 = 5000;

/// Hard ceiling on a single dependency-install invocation, per the
/// in-band provisioning command.
pub const INSTALL_TIMEOUT_SECS: u64 = 300;

/// Tail of installer stdout/stderr kept when surfacing a non-zero exit.
pub const INSTALL_OUTPUT_TAIL_BYTES: usize = 500;
