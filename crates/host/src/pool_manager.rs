//! Directory of [`VMWorkerPool`]s keyed by capability fingerprint. Pools are
//! created lazily on first use and live until [`PoolManager::shutdown`] is
//! called.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;

use shared::profile::CapabilityProfile;

use crate::config::{PoolConfig, VmShapeConfig};
use crate::driver::{HypervisorDriver, Snapshot};
use crate::pool::VMWorkerPool;

pub struct PoolManager {
    driver: Arc<dyn HypervisorDriver>,
    vm_shape: VmShapeConfig,
    pool_config: PoolConfig,
    pools: Mutex<HashMap<String, Arc<VMWorkerPool>>>,
}

impl PoolManager {
    pub fn new(driver: Arc<dyn HypervisorDriver>, vm_shape: VmShapeConfig, pool_config: PoolConfig) -> Self {
        PoolManager {
            driver,
            vm_shape,
            pool_config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pool for `profile_key`, starting it first if this is the
    /// first call seen for that fingerprint.
    pub async fn get_or_create(&self, profile: &CapabilityProfile, profile_key: &str) -> Arc<VMWorkerPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(profile_key) {
            return pool.clone();
        }

        let pool = VMWorkerPool::new(
            profile.clone(),
            profile_key.to_string(),
            self.driver.clone(),
            self.vm_shape.clone(),
            self.pool_config.clone(),
        );
        pool.start().await;
        pools.insert(profile_key.to_string(), pool.clone());
        pool
    }

    /// Looks up an already-started pool without creating one. Used by tests
    /// that need to inspect pool sizing invariants after a round of calls.
    pub async fn get(&self, profile_key: &str) -> Option<Arc<VMWorkerPool>> {
        self.pools.lock().await.get(profile_key).cloned()
    }

    pub async fn shutdown(&self) {
        let pools: Vec<Arc<VMWorkerPool>> = self.pools.lock().await.drain().map(|(_, p)| p).collect();
        join_all(pools.iter().map(|pool| pool.stop())).await;
    }

    /// Looks up the driver's cached snapshot record for `profile_key`,
    /// independent of pool state. Used by tests asserting that provisioning
    /// happens at most once per fingerprint.
    pub async fn driver_snapshot(&self, profile_key: &str) -> Option<Snapshot> {
        self.driver.get_snapshot(profile_key).await
    }
}
