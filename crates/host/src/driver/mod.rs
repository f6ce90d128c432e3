//! Hypervisor abstraction. [`HypervisorDriver`] is the seam between pool
//! bookkeeping (which only cares about acquiring/releasing handles) and the
//! actual mechanism used to get a guest executor running: a real Firecracker
//! process or, for tests, a plain tokio task.

pub mod firecracker;
pub mod in_process;

use async_trait::async_trait;

use shared::profile::CapabilityProfile;

use crate::config::VmShapeConfig;
use crate::error::SandboxError;
use crate::transport::Endpoint;

/// Concrete boot shape for one VM, derived from a [`VmShapeConfig`] with a
/// profile's `mem_mb` overlaid on top.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub cid: u32,
    pub vcpu_count: u32,
    pub mem_size_mb: u32,
    pub vsock_port: u32,
    pub boot_args: String,
}

impl VmConfig {
    /// `cid` is the guest vsock context id assigned by the pool's counter
    /// (starts at 101; 0-2 are reserved by the kernel/hypervisor).
    pub fn from_shape(shape: &VmShapeConfig, cid: u32) -> Self {
        VmConfig {
            cid,
            vcpu_count: shape.vcpu_count,
            mem_size_mb: shape.mem_size_mb,
            vsock_port: shape.vsock_port,
            boot_args: shape.boot_args.clone(),
        }
    }

    /// Overlays the profile's memory limit; the profile never widens vcpu
    /// count or the vsock port, only the amount of memory given to the guest.
    pub fn with_profile(mut self, profile: &CapabilityProfile) -> Self {
        self.mem_size_mb = profile.mem_mb;
        self
    }
}

/// A baked disk+memory snapshot cached under a profile's fingerprint, ready
/// to be restored into a fresh VM instead of cold-booting and re-installing
/// dependencies on every acquire.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub profile_key: String,
    pub snapshot_path: String,
    pub mem_path: String,
    pub dependencies: Vec<String>,
}

/// Handle to one running VM. Only exposes what the pool needs: an
/// identifier for logging/tainting and the endpoint to dial for RPC.
pub trait VmHandle: Send + Sync {
    fn vm_id(&self) -> &str;
    fn endpoint(&self) -> Endpoint;
    /// Lets a driver's `stop_vm` recover its own concrete handle type back
    /// out of the trait object the pool hands it.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// VM lifecycle operations a worker pool drives. Implemented once for real
/// Firecracker processes and once as an in-process stand-in for tests; the
/// pool itself is written against this trait and never against either
/// concrete type.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    async fn start_vm(&self, config: &VmConfig) -> Result<Box<dyn VmHandle>, SandboxError>;

    async fn restore_snapshot(
        &self,
        config: &VmConfig,
        snapshot: &Snapshot,
    ) -> Result<Box<dyn VmHandle>, SandboxError>;

    async fn stop_vm(&self, handle: Box<dyn VmHandle>) -> Result<(), SandboxError>;

    /// Cold-boots a VM, runs the in-band install RPC, pauses it, and
    /// snapshots disk+memory, caching the result under `profile_key`.
    async fn provision_snapshot(
        &self,
        config: &VmConfig,
        profile_key: &str,
        dependencies: &[String],
    ) -> Result<Snapshot, SandboxError>;

    /// Returns a previously provisioned snapshot for this profile, if any.
    async fn get_snapshot(&self, profile_key: &str) -> Option<Snapshot>;
}
