//! In-process stand-in for a real Firecracker VM: a loopback TCP listener
//! running the exact same [`shared::executor::serve_connection`] loop the
//! real guest agent runs over vsock. Used by tests and by any embedder that
//! wants to exercise pool/driver wiring without a kernel or rootfs image.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use shared::executor::{FunctionRegistry, InstallFn};

use super::{HypervisorDriver, Snapshot, VmConfig, VmHandle};
use crate::error::SandboxError;
use crate::transport::Endpoint;

pub struct InProcessHandle {
    vm_id: String,
    port: u16,
    accept_task: JoinHandle<()>,
}

impl VmHandle for InProcessHandle {
    fn vm_id(&self) -> &str {
        &self.vm_id
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp { port: self.port }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Stub driver: every "VM" is a tokio task looping on `accept()` against a
/// dedicated loopback port and serving calls out of a shared registry.
/// `provision_snapshot` doesn't touch disk; it records bookkeeping only, so
/// the pool's caching logic can still be exercised end to end.
pub struct InProcessDriver {
    registry: Arc<FunctionRegistry>,
    install: InstallFn,
    snapshots: Mutex<HashMap<String, Snapshot>>,
    next_vm_id: AtomicU64,
}

impl InProcessDriver {
    pub fn new(registry: FunctionRegistry, install: InstallFn) -> Self {
        InProcessDriver {
            registry: Arc::new(registry),
            install,
            snapshots: Mutex::new(HashMap::new()),
            next_vm_id: AtomicU64::new(1),
        }
    }

    async fn spawn_vm(&self, config: &VmConfig) -> Result<Box<dyn VmHandle>, SandboxError> {
        let _ = config;
        let vm_id = format!("stub-vm-{}", self.next_vm_id.fetch_add(1, Ordering::SeqCst));

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| SandboxError::VmStartup {
                vm_id: vm_id.clone(),
                reason: e.to_string(),
            })?;
        let port = listener.local_addr().map_err(|e| SandboxError::VmStartup {
            vm_id: vm_id.clone(),
            reason: e.to_string(),
        })?.port();

        let registry = self.registry.clone();
        let install = self.install.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                shared::executor::serve_connection(stream, registry.clone(), install.clone()).await;
            }
        });

        Ok(Box::new(InProcessHandle {
            vm_id,
            port,
            accept_task,
        }))
    }
}

#[async_trait]
impl HypervisorDriver for InProcessDriver {
    async fn start_vm(&self, config: &VmConfig) -> Result<Box<dyn VmHandle>, SandboxError> {
        self.spawn_vm(config).await
    }

    async fn restore_snapshot(
        &self,
        config: &VmConfig,
        _snapshot: &Snapshot,
    ) -> Result<Box<dyn VmHandle>, SandboxError> {
        self.spawn_vm(config).await
    }

    async fn stop_vm(&self, handle: Box<dyn VmHandle>) -> Result<(), SandboxError> {
        if let Some(handle) = handle.as_any().downcast_ref::<InProcessHandle>() {
            handle.accept_task.abort();
        }
        Ok(())
    }

    async fn provision_snapshot(
        &self,
        _config: &VmConfig,
        profile_key: &str,
        dependencies: &[String],
    ) -> Result<Snapshot, SandboxError> {
        let snapshot = Snapshot {
            profile_key: profile_key.to_string(),
            snapshot_path: format!("stub://{profile_key}/snapshot"),
            mem_path: format!("stub://{profile_key}/mem"),
            dependencies: dependencies.to_vec(),
        };
        self.snapshots
            .lock()
            .await
            .insert(profile_key.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    async fn get_snapshot(&self, profile_key: &str) -> Option<Snapshot> {
        self.snapshots.lock().await.get(profile_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shared::wire::Value;

    use super::*;
    use crate::config::VmShapeConfig;
    use crate::transport::{HostConnection, Transport};
    use shared::rpc::RpcRequest;

    fn test_registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register(
            "benchmarks.bench_executor:simple_add",
            Arc::new(|args, _kwargs| {
                Box::pin(async move {
                    let a = args[0].as_i64().unwrap();
                    let b = args[1].as_i64().unwrap();
                    Ok(Value::Int(a + b))
                })
            }),
        );
        registry
    }

    #[tokio::test]
    async fn starts_a_vm_and_serves_a_call_over_loopback_tcp() {
        let driver = InProcessDriver::new(test_registry(), Arc::new(|_deps| Box::pin(async { Ok(()) })));
        let config = VmConfig::from_shape(&VmShapeConfig::default(), 101);
        let handle = driver.start_vm(&config).await.unwrap();

        let Endpoint::Tcp { port } = handle.endpoint() else {
            panic!("expected tcp endpoint from in-process driver");
        };
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut conn = HostConnection::new(Transport::Tcp(stream));

        let response = conn
            .call(&RpcRequest::Call {
                request_id: "r1".to_string(),
                function_ref: "benchmarks.bench_executor:simple_add".to_string(),
                args: vec![Value::Int(2), Value::Int(3)],
                kwargs: vec![],
                timeout_ms: 1000,
            })
            .await
            .unwrap();

        assert_eq!(response.result, Some(Value::Int(5)));
    }

    #[tokio::test]
    async fn provision_and_get_snapshot_round_trips() {
        let driver = InProcessDriver::new(test_registry(), Arc::new(|_deps| Box::pin(async { Ok(()) })));
        let config = VmConfig::from_shape(&VmShapeConfig::default(), 101);

        assert!(driver.get_snapshot("abc123").await.is_none());

        driver
            .provision_snapshot(&config, "abc123", &["numpy".to_string()])
            .await
            .unwrap();

        let snapshot = driver.get_snapshot("abc123").await.unwrap();
        assert_eq!(snapshot.profile_key, "abc123");
        assert_eq!(snapshot.dependencies, vec!["numpy".to_string()]);
    }
}
