//! Per-profile worker pool. One [`VMWorkerPool`] owns every VM booted for a
//! single capability fingerprint: it boots the minimum pool eagerly, grows
//! up to `max_size` on demand, recycles VMs that were tainted or have served
//! too many calls, and reaps VMs idle past `idle_timeout_sec`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use shared::profile::CapabilityProfile;
use shared::rpc::{RpcRequest, RpcResponse};

use crate::config::{PoolConfig, VmShapeConfig};
use crate::driver::{HypervisorDriver, Snapshot, VmConfig, VmHandle};
use crate::error::SandboxError;
use crate::transport::HostConnection;

/// Guest-side budget named by `request` and a label for the timeout error,
/// used to derive the host-side deadline in [`VMWorkerPool::execute`].
/// `Install` requests don't carry a caller timeout, so they fall back to a
/// generous flat budget.
fn request_timeout_ms(request: &RpcRequest) -> (String, u32) {
    match request {
        RpcRequest::Call {
            function_ref, timeout_ms, ..
        } => (function_ref.clone(), *timeout_ms),
        RpcRequest::Install { .. } => ("install".to_string(), 300_000),
    }
}

struct VmInstance {
    vm_id: String,
    cid: u32,
    handle: Box<dyn VmHandle>,
    conn: Option<HostConnection>,
    call_count: u64,
    last_used: Instant,
    tainted: bool,
}

impl VmInstance {
    fn mark_used(&mut self) {
        self.call_count += 1;
        self.last_used = Instant::now();
    }
}

struct PoolState {
    available: VecDeque<VmInstance>,
    in_use: HashSet<String>,
    all_vms: HashSet<String>,
    cid_counter: u32,
    shutdown: bool,
}

/// Worker pool for a single capability fingerprint. Constructed once per
/// distinct profile by [`crate::pool_manager::PoolManager`].
pub struct VMWorkerPool {
    pub profile_key: String,
    profile: CapabilityProfile,
    driver: Arc<dyn HypervisorDriver>,
    vm_shape: VmShapeConfig,
    pool_config: PoolConfig,
    state: Mutex<PoolState>,
    available_notify: Notify,
    snapshot: Mutex<Option<Snapshot>>,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
}

impl VMWorkerPool {
    pub fn new(
        profile: CapabilityProfile,
        profile_key: String,
        driver: Arc<dyn HypervisorDriver>,
        vm_shape: VmShapeConfig,
        pool_config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(VMWorkerPool {
            profile_key,
            profile,
            driver,
            vm_shape,
            pool_config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                in_use: HashSet::new(),
                all_vms: HashSet::new(),
                cid_counter: 100,
                shutdown: false,
            }),
            available_notify: Notify::new(),
            snapshot: Mutex::new(None),
            maintenance_task: Mutex::new(None),
        })
    }

    pub async fn total_count(&self) -> usize {
        self.state.lock().await.all_vms.len()
    }

    /// Provisions the dependency snapshot (if the profile names any), boots
    /// `min_size` VMs, and starts the idle-reaper loop.
    pub async fn start(self: &Arc<Self>) {
        if !self.profile.dependencies.is_empty() {
            match self
                .driver
                .provision_snapshot(
                    &VmConfig::from_shape(&self.vm_shape, 0).with_profile(&self.profile),
                    &self.profile_key,
                    &self.profile.dependencies,
                )
                .await
            {
                Ok(snapshot) => {
                    tracing::info!(profile_key = %self.profile_key, path = %snapshot.snapshot_path, "snapshot ready");
                    *self.snapshot.lock().await = Some(snapshot);
                }
                Err(e) => {
                    tracing::error!(profile_key = %self.profile_key, error = %e, "failed to provision snapshot");
                }
            }
        }

        for _ in 0..self.pool_config.min_size {
            match self.create_vm().await {
                Ok(vm) => self.state.lock().await.available.push_back(vm),
                Err(e) => tracing::error!(profile_key = %self.profile_key, error = %e, "failed to create initial vm"),
            }
        }

        let pool = self.clone();
        let task = tokio::spawn(async move { pool.maintenance_loop().await });
        *self.maintenance_task.lock().await = Some(task);
    }

    pub async fn stop(self: &Arc<Self>) {
        self.state.lock().await.shutdown = true;

        if let Some(task) = self.maintenance_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        let mut to_destroy = Vec::new();
        {
            let mut state = self.state.lock().await;
            while let Some(vm) = state.available.pop_front() {
                to_destroy.push(vm);
            }
        }
        for vm in to_destroy {
            self.destroy_vm(vm).await;
        }

        // In-flight calls still hold their VmInstance out of pool state;
        // once `shutdown` is set, release_vm destroys rather than
        // re-enqueues whatever comes back, so this converges as soon as
        // every outstanding call returns.
        while !self.state.lock().await.in_use.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn create_vm(&self) -> Result<VmInstance, SandboxError> {
        let cid = {
            let mut state = self.state.lock().await;
            state.cid_counter += 1;
            state.cid_counter
        };

        let vm_id = format!("{}-{}", self.profile_key, cid);
        let config = VmConfig::from_shape(&self.vm_shape, cid).with_profile(&self.profile);

        let snapshot = self.snapshot.lock().await.clone();
        let handle = match snapshot {
            Some(ref snapshot) => self.driver.restore_snapshot(&config, snapshot).await,
            None => self.driver.start_vm(&config).await,
        }
        .map_err(|e| SandboxError::VmStartup {
            vm_id: vm_id.clone(),
            reason: e.to_string(),
        })?;

        let vm_id = handle.vm_id().to_string();
        let conn = self.wait_for_vm_ready(&vm_id, handle.endpoint()).await?;
        self.state.lock().await.all_vms.insert(vm_id.clone());

        Ok(VmInstance {
            vm_id,
            cid,
            handle,
            conn: Some(conn),
            call_count: 0,
            last_used: Instant::now(),
            tainted: false,
        })
    }

    /// Polls the guest's executor endpoint until it accepts a connection or
    /// `startup_timeout_sec` elapses. The VM process being up (Firecracker's
    /// API socket answering) doesn't mean the guest's own executor has
    /// finished booting, so this is a distinct readiness check.
    async fn wait_for_vm_ready(&self, vm_id: &str, endpoint: crate::transport::Endpoint) -> Result<HostConnection, SandboxError> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.pool_config.startup_timeout_sec);
        let mut last_error = None;

        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(2), HostConnection::connect(&endpoint)).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(_) => last_error = Some("connect attempt timed out".to_string()),
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Err(SandboxError::VmStartup {
            vm_id: vm_id.to_string(),
            reason: format!(
                "did not become ready within {}s: {}",
                self.pool_config.startup_timeout_sec,
                last_error.unwrap_or_else(|| "no connection attempt succeeded".to_string())
            ),
        })
    }

    async fn destroy_vm(&self, vm: VmInstance) {
        let vm_id = vm.vm_id.clone();
        if let Err(e) = self.driver.stop_vm(vm.handle).await {
            tracing::warn!(%vm_id, error = %e, "error stopping vm");
        }
        let mut state = self.state.lock().await;
        state.all_vms.remove(&vm_id);
        state.in_use.remove(&vm_id);
    }

    fn should_recycle(&self, vm: &VmInstance) -> bool {
        vm.tainted || vm.call_count >= self.pool_config.max_calls_per_vm
    }

    async fn acquire_vm(&self) -> Result<VmInstance, SandboxError> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.pool_config.acquire_timeout_sec);

        loop {
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return Err(SandboxError::PoolClosed {
                        profile_key: self.profile_key.clone(),
                    });
                }
                if let Some(vm) = state.available.pop_front() {
                    state.in_use.insert(vm.vm_id.clone());
                    return Ok(vm);
                }
                if state.all_vms.len() < self.pool_config.max_size {
                    drop(state);
                    let vm = self.create_vm().await?;
                    self.state.lock().await.in_use.insert(vm.vm_id.clone());
                    return Ok(vm);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SandboxError::PoolExhausted {
                    profile_key: self.profile_key.clone(),
                });
            }
            let remaining = deadline - now;
            let _ = tokio::time::timeout(remaining, self.available_notify.notified()).await;
        }
    }

    async fn release_vm(&self, mut vm: VmInstance) {
        let shutting_down = {
            let mut state = self.state.lock().await;
            state.in_use.remove(&vm.vm_id);
            state.shutdown
        };
        vm.mark_used();

        if shutting_down {
            self.destroy_vm(vm).await;
            return;
        }

        if self.should_recycle(&vm) {
            tracing::debug!(vm_id = %vm.vm_id, "recycling vm");
            self.destroy_vm(vm).await;
            if self.total_count().await < self.pool_config.min_size {
                match self.create_vm().await {
                    Ok(vm) => {
                        self.state.lock().await.available.push_back(vm);
                        self.available_notify.notify_one();
                    }
                    Err(e) => tracing::error!(profile_key = %self.profile_key, error = %e, "failed to replace recycled vm"),
                }
            }
        } else {
            self.state.lock().await.available.push_back(vm);
            self.available_notify.notify_one();
        }
    }

    /// Acquires a VM, dials it if not already connected, issues `request`,
    /// and releases the VM back to the pool (or recycles it if the call
    /// tainted it). Mirrors the per-call lifecycle end to end.
    ///
    /// The response is awaited under a host-side deadline of `timeout_ms`
    /// plus a 5s safety margin, on top of whatever guest-side timeout the
    /// request itself carries: a guest that hangs without ever closing the
    /// socket (e.g. wedged past its own `tokio::time::timeout`) would
    /// otherwise block this call forever.
    pub async fn execute(&self, request: RpcRequest) -> Result<RpcResponse, SandboxError> {
        let mut vm = self.acquire_vm().await?;

        if vm.conn.is_none() {
            let endpoint = vm.handle.endpoint();
            vm.conn = Some(HostConnection::connect(&endpoint).await?);
        }

        let conn = vm.conn.as_mut().expect("connected in create_vm or above");
        let (function_ref, timeout_ms) = request_timeout_ms(&request);
        let deadline = Duration::from_millis(u64::from(timeout_ms)) + Duration::from_secs(5);
        let outcome = match tokio::time::timeout(deadline, conn.call(&request)).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                vm.tainted = true;
                self.release_vm(vm).await;
                return Err(SandboxError::SandboxTimeout {
                    function_ref,
                    cpu_ms: timeout_ms,
                });
            }
        };

        match outcome {
            Ok(response) => {
                // A guest-enforced timeout still tore down whatever the
                // function was doing mid-flight inside a single-threaded
                // guest; treat it the same as a transport-level fault even
                // though the RPC itself completed cleanly.
                vm.tainted = !response.success && response.error.as_ref().is_some_and(|e| e.error_type == "TimeoutError");
                self.release_vm(vm).await;
                Ok(response)
            }
            Err(e) => {
                vm.tainted = e.taints_vm();
                self.release_vm(vm).await;
                Err(e)
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;

            if self.state.lock().await.shutdown {
                return;
            }

            let now = Instant::now();
            let mut keep = VecDeque::new();
            let mut reap = Vec::new();

            {
                let mut state = self.state.lock().await;
                // Decremented as candidates are chosen so the guard reflects
                // what the pool's total would be *after* reaping them,
                // rather than re-checking a count frozen before any of this
                // round's destroys have happened.
                let mut live = state.all_vms.len();
                while let Some(vm) = state.available.pop_front() {
                    let idle_for = now.duration_since(vm.last_used).as_secs_f64();
                    if idle_for > self.pool_config.idle_timeout_sec && live > self.pool_config.min_size {
                        live -= 1;
                        reap.push(vm);
                    } else {
                        keep.push_back(vm);
                    }
                }
                state.available = keep;
            }

            for vm in reap {
                tracing::debug!(vm_id = %vm.vm_id, "reaping idle vm");
                self.destroy_vm(vm).await;
            }
        }
    }
}
