//! Real [`HypervisorDriver`] backed by actual Firecracker processes. Each VM
//! gets its own workdir holding the API socket, the vsock UDS, and (once
//! provisioned) its disk+memory snapshot files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use firecracker_sdk::FirecrackerBuilder;
use firecracker_sdk::dto::{BootSource, Drive, MachineConfiguration, Vsock};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::error::SandboxError;
use crate::transport::{Endpoint, HostConnection, Transport};

use super::{HypervisorDriver, Snapshot, VmConfig, VmHandle};

pub struct FirecrackerHandle {
    vm_id: String,
    cid: u32,
    vsock_port: u32,
    workdir: PathBuf,
    firecracker: Mutex<firecracker_sdk::Firecracker>,
}

impl VmHandle for FirecrackerHandle {
    fn vm_id(&self) -> &str {
        &self.vm_id
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Vsock {
            cid: self.cid,
            port: self.vsock_port,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct FirecrackerDriver {
    config: DriverConfig,
}

impl FirecrackerDriver {
    pub fn new(config: DriverConfig) -> Self {
        FirecrackerDriver { config }
    }

    fn vm_workdir(&self, vm_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sandbox-{vm_id}"))
    }

    async fn boot(&self, config: &VmConfig, rootfs_path: &Path) -> Result<Box<dyn VmHandle>, SandboxError> {
        let vm_id = Uuid::new_v4().to_string();
        let workdir = self.vm_workdir(&vm_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: format!("creating workdir: {e}"),
            })?;

        let api_socket = workdir.join("firecracker.sock");
        let vsock_uds = workdir.join("vsock.sock");

        let mut firecracker = FirecrackerBuilder::new(&self.config.firecracker_binary)
            .with_api_socket_path(api_socket.clone())
            .build()
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        firecracker
            .set_boot_source(BootSource {
                kernel_image_path: self.config.kernel_image_path.to_string_lossy().into_owned(),
                boot_args: Some(config.boot_args.clone()),
                initrd_path: None,
            })
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        firecracker
            .add_drive(Drive {
                drive_id: "rootfs".to_string(),
                partuuid: None,
                is_root_device: true,
                cache_type: None,
                is_read_only: Some(false),
                path_on_host: Some(rootfs_path.to_string_lossy().into_owned()),
                rate_limiter: None,
                io_engine: None,
                socket: None,
            })
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        firecracker
            .set_machine_config(MachineConfiguration {
                cpu_template: None,
                smt: None,
                mem_size_mib: config.mem_size_mb as isize,
                track_dirty_pages: Some(true),
                vcpu_count: config.vcpu_count as isize,
                huge_pages: None,
            })
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        firecracker
            .set_vsock(Vsock {
                guest_cid: config.cid as isize,
                uds_path: vsock_uds.to_string_lossy().into_owned(),
                vsock_id: None,
            })
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        firecracker
            .start(api_socket)
            .await
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(FirecrackerHandle {
            vm_id,
            cid: config.cid,
            vsock_port: config.vsock_port,
            workdir,
            firecracker: Mutex::new(firecracker),
        }))
    }

    /// Drives the install RPC over vsock, pauses the VM and snapshots it to
    /// disk. The caller is responsible for stopping `vm_handle` once this
    /// returns, success or not; the snapshot files already hold everything
    /// needed to restore fresh copies from here on.
    async fn install_and_snapshot(
        &self,
        vm_handle: &Box<dyn VmHandle>,
        profile_key: &str,
        dependencies: &[String],
    ) -> Result<Snapshot, SandboxError> {
        let Some(handle) = vm_handle.as_any().downcast_ref::<FirecrackerHandle>() else {
            return Err(SandboxError::Provisioning {
                profile_key: profile_key.to_string(),
                reason: "driver returned an unexpected handle type".to_string(),
            });
        };

        let endpoint = handle.endpoint();
        let Endpoint::Vsock { cid, port } = endpoint else {
            return Err(SandboxError::Provisioning {
                profile_key: profile_key.to_string(),
                reason: "firecracker handle did not expose a vsock endpoint".to_string(),
            });
        };
        let _ = (cid, port);

        let stream = tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(handle.cid, handle.vsock_port))
            .await
            .map_err(|e| SandboxError::Provisioning {
                profile_key: profile_key.to_string(),
                reason: format!("connecting to guest vsock: {e}"),
            })?;
        let mut conn = HostConnection::new(Transport::Vsock(stream));

        let response = conn
            .call(&shared::rpc::RpcRequest::Install {
                request_id: Uuid::new_v4().to_string(),
                dependencies: dependencies.to_vec(),
            })
            .await?;

        if !response.success {
            let error = response.error.unwrap_or_else(|| shared::rpc::RemoteError::new("InstallError", "unknown failure"));
            return Err(SandboxError::Provisioning {
                profile_key: profile_key.to_string(),
                reason: error.message,
            });
        }

        let snapshot_dir = self.config.snapshot_dir.join(profile_key);
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|e| SandboxError::Provisioning {
                profile_key: profile_key.to_string(),
                reason: e.to_string(),
            })?;
        let snapshot_path = snapshot_dir.join("snapshot").to_string_lossy().into_owned();
        let mem_path = snapshot_dir.join("mem").to_string_lossy().into_owned();

        {
            let mut fc = handle.firecracker.lock().await;
            fc.pause().await.map_err(|e| SandboxError::Provisioning {
                profile_key: profile_key.to_string(),
                reason: e.to_string(),
            })?;
            fc.create_snapshot(snapshot_path.clone(), mem_path.clone())
                .await
                .map_err(|e| SandboxError::Provisioning {
                    profile_key: profile_key.to_string(),
                    reason: e.to_string(),
                })?;
        }

        Ok(Snapshot {
            profile_key: profile_key.to_string(),
            snapshot_path,
            mem_path,
            dependencies: dependencies.to_vec(),
        })
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    async fn start_vm(&self, config: &VmConfig) -> Result<Box<dyn VmHandle>, SandboxError> {
        self.boot(config, &self.config.rootfs_path).await
    }

    async fn restore_snapshot(
        &self,
        config: &VmConfig,
        snapshot: &Snapshot,
    ) -> Result<Box<dyn VmHandle>, SandboxError> {
        let vm_id = Uuid::new_v4().to_string();
        let workdir = self.vm_workdir(&vm_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: format!("creating workdir: {e}"),
            })?;

        let api_socket = workdir.join("firecracker.sock");

        let mut firecracker = FirecrackerBuilder::new(&self.config.firecracker_binary)
            .with_api_socket_path(api_socket.clone())
            .build()
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        firecracker
            .start_from_snapshot(api_socket, snapshot.snapshot_path.clone(), snapshot.mem_path.clone(), true)
            .await
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(FirecrackerHandle {
            vm_id,
            cid: config.cid,
            vsock_port: config.vsock_port,
            workdir,
            firecracker: Mutex::new(firecracker),
        }))
    }

    async fn stop_vm(&self, handle: Box<dyn VmHandle>) -> Result<(), SandboxError> {
        let Some(handle) = handle.as_any().downcast_ref::<FirecrackerHandle>() else {
            return Ok(());
        };

        handle
            .firecracker
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| SandboxError::VmStartup {
                vm_id: handle.vm_id.clone(),
                reason: e.to_string(),
            })?;

        let _ = tokio::fs::remove_dir_all(&handle.workdir).await;
        Ok(())
    }

    async fn provision_snapshot(
        &self,
        config: &VmConfig,
        profile_key: &str,
        dependencies: &[String],
    ) -> Result<Snapshot, SandboxError> {
        let vm_handle = self.boot(config, &self.config.rootfs_path).await?;
        let result = self.install_and_snapshot(&vm_handle, profile_key, dependencies).await;
        let _ = self.stop_vm(vm_handle).await;
        result
    }

    async fn get_snapshot(&self, profile_key: &str) -> Option<Snapshot> {
        let snapshot_dir = self.config.snapshot_dir.join(profile_key);
        let snapshot_path = snapshot_dir.join("snapshot");
        let mem_path = snapshot_dir.join("mem");
        if snapshot_path.exists() && mem_path.exists() {
            Some(Snapshot {
                profile_key: profile_key.to_string(),
                snapshot_path: snapshot_path.to_string_lossy().into_owned(),
                mem_path: mem_path.to_string_lossy().into_owned(),
                dependencies: Vec::new(),
            })
        } else {
            None
        }
    }
}
