//! Top-level owner of one driver and one pool manager. An embedding process
//! typically holds a single `Arc<Supervisor>`, handing clones to every
//! [`crate::stub::Stub`] it constructs; nothing here is a process-wide
//! singleton, so tests can run several independent supervisors side by side.

use std::sync::Arc;

use shared::profile::CapabilityProfile;
use shared::rpc::{RpcRequest, RpcResponse};

use crate::config::SupervisorConfig;
use crate::driver::HypervisorDriver;
use crate::driver::in_process::InProcessDriver;
use crate::error::SandboxError;
use crate::pool_manager::PoolManager;

pub struct Supervisor {
    pool_manager: PoolManager,
}

impl Supervisor {
    pub fn new(driver: Arc<dyn HypervisorDriver>, config: SupervisorConfig) -> Self {
        Supervisor {
            pool_manager: PoolManager::new(driver, config.vm_shape, config.pool),
        }
    }

    /// Convenience constructor for tests and demos: wires up the in-process
    /// stub driver instead of a real Firecracker binary.
    pub fn in_process(registry: shared::executor::FunctionRegistry, install: shared::executor::InstallFn, config: SupervisorConfig) -> Self {
        let driver: Arc<dyn HypervisorDriver> = Arc::new(InProcessDriver::new(registry, install));
        Supervisor::new(driver, config)
    }

    pub async fn execute(
        &self,
        profile: &CapabilityProfile,
        profile_key: &str,
        request: RpcRequest,
    ) -> Result<RpcResponse, SandboxError> {
        let pool = self.pool_manager.get_or_create(profile, profile_key).await;
        pool.execute(request).await
    }

    pub async fn shutdown(&self) {
        self.pool_manager.shutdown().await;
    }

    /// Total VM count (available + in-use) for an already-started pool.
    /// `None` if no pool has been created yet for `profile_key`.
    pub async fn pool_vm_count(&self, profile_key: &str) -> Option<usize> {
        let pool = self.pool_manager.get(profile_key).await?;
        Some(pool.total_count().await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shared::executor::FunctionRegistry;
    use shared::profile::ProfileOptions;
    use shared::wire::Value;

    use super::*;
    use crate::stub::Stub;

    fn add_registry() -> FunctionRegistry {
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
    async fn a_stub_call_round_trips_through_the_supervisor() {
        let supervisor = Arc::new(Supervisor::in_process(
            add_registry(),
            Arc::new(|_deps| Box::pin(async { Ok(()) })),
            SupervisorConfig::default(),
        ));

        let profile = CapabilityProfile::from_options(ProfileOptions::default()).unwrap();
        let stub = Stub::new("benchmarks.bench_executor:simple_add", profile, supervisor.clone());

        let result = stub
            .call_async(vec![Value::Int(2), Value::Int(3)], vec![])
            .await
            .unwrap();

        assert_eq!(result, Value::Int(5));
        assert_eq!(supervisor.pool_vm_count(&stub.profile_key).await, Some(1));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn warm_reuse_keeps_a_single_vm_across_sequential_calls() {
        let supervisor = Arc::new(Supervisor::in_process(
            add_registry(),
            Arc::new(|_deps| Box::pin(async { Ok(()) })),
            SupervisorConfig::default(),
        ));

        let profile = CapabilityProfile::from_options(ProfileOptions::default()).unwrap();
        let stub = Stub::new("benchmarks.bench_executor:simple_add", profile, supervisor.clone());

        for _ in 0..5 {
            stub.call_async(vec![Value::Int(1), Value::Int(1)], vec![]).await.unwrap();
        }

        assert_eq!(supervisor.pool_vm_count(&stub.profile_key).await, Some(1));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn a_vm_is_recycled_once_it_hits_the_call_count_cap() {
        let mut config = SupervisorConfig::default();
        config.pool.min_size = 1;
        config.pool.max_calls_per_vm = 2;

        let supervisor = Arc::new(Supervisor::in_process(
            add_registry(),
            Arc::new(|_deps| Box::pin(async { Ok(()) })),
            config,
        ));

        let profile = CapabilityProfile::from_options(ProfileOptions::default()).unwrap();
        let stub = Stub::new("benchmarks.bench_executor:simple_add", profile, supervisor.clone());

        for _ in 0..3 {
            stub.call_async(vec![Value::Int(1), Value::Int(1)], vec![]).await.unwrap();
        }

        // The VM that served call 2 was torn down and replaced; a single
        // replacement keeps the pool at min_size.
        assert_eq!(supervisor.pool_vm_count(&stub.profile_key).await, Some(1));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn a_guest_side_timeout_taints_and_destroys_its_vm() {
        let mut registry = FunctionRegistry::new();
        registry.register(
            "test:sleep200",
            Arc::new(|_args, _kwargs| {
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    Ok(Value::Null)
                })
            }),
        );

        let supervisor = Arc::new(Supervisor::in_process(
            registry,
            Arc::new(|_deps| Box::pin(async { Ok(()) })),
            SupervisorConfig::default(),
        ));

        let mut options = ProfileOptions::default();
        options.cpu_ms = Some(50);
        let profile = CapabilityProfile::from_options(options).unwrap();
        let stub = Stub::new("test:sleep200", profile, supervisor.clone());

        let err = stub.call_async(vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, SandboxError::SandboxTimeout { ref function_ref, .. } if function_ref == "test:sleep200"));

        // The timed-out VM was tainted and destroyed on release, so the
        // only VM left standing is the min_size replacement.
        assert_eq!(supervisor.pool_vm_count(&stub.profile_key).await, Some(1));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn distinct_net_policies_get_distinct_pools() {
        let supervisor = Arc::new(Supervisor::in_process(
            add_registry(),
            Arc::new(|_deps| Box::pin(async { Ok(()) })),
            SupervisorConfig::default(),
        ));

        let mut none_opts = ProfileOptions::default();
        none_opts.net = Some("none".to_string());
        let none_profile = CapabilityProfile::from_options(none_opts).unwrap();

        let mut https_opts = ProfileOptions::default();
        https_opts.net = Some("https-only".to_string());
        let https_profile = CapabilityProfile::from_options(https_opts).unwrap();

        assert_ne!(none_profile.fingerprint(), https_profile.fingerprint());

        let none_stub = Stub::new("benchmarks.bench_executor:simple_add", none_profile, supervisor.clone());
        let https_stub = Stub::new("benchmarks.bench_executor:simple_add", https_profile, supervisor.clone());

        none_stub.call_async(vec![Value::Int(1), Value::Int(1)], vec![]).await.unwrap();
        https_stub.call_async(vec![Value::Int(1), Value::Int(1)], vec![]).await.unwrap();

        assert_eq!(supervisor.pool_vm_count(&none_stub.profile_key).await, Some(1));
        assert_eq!(supervisor.pool_vm_count(&https_stub.profile_key).await, Some(1));
        assert_ne!(none_stub.profile_key, https_stub.profile_key);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn provisioning_a_dependency_profile_caches_its_snapshot() {
        let mut options = ProfileOptions::default();
        options.dependencies = vec!["numpy".to_string(), "pandas".to_string()];
        let profile = CapabilityProfile::from_options(options).unwrap();
        let profile_key = profile.fingerprint();

        let supervisor = Supervisor::in_process(
            add_registry(),
            Arc::new(|_deps| Box::pin(async { Ok(()) })),
            SupervisorConfig::default(),
        );

        // Triggers pool startup, which provisions the snapshot once.
        supervisor.pool_manager.get_or_create(&profile, &profile_key).await;
        let first = supervisor.pool_manager.driver_snapshot(&profile_key).await.unwrap();

        // A second lookup of the same fingerprint reuses the cached pool
        // (and therefore its already-provisioned snapshot) rather than
        // provisioning again.
        supervisor.pool_manager.get_or_create(&profile, &profile_key).await;
        let second = supervisor.pool_manager.driver_snapshot(&profile_key).await.unwrap();

        assert_eq!(first.snapshot_path, second.snapshot_path);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn calling_an_unregistered_function_surfaces_as_sandbox_remote() {
        let supervisor = Arc::new(Supervisor::in_process(
            add_registry(),
            Arc::new(|_deps| Box::pin(async { Ok(()) })),
            SupervisorConfig::default(),
        ));

        let profile = CapabilityProfile::from_options(ProfileOptions::default()).unwrap();
        let stub = Stub::new("nope:fn", profile, supervisor.clone());

        let err = stub.call_async(vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, SandboxError::SandboxRemote(_)));

        supervisor.shutdown().await;
    }
}
