use std::path::PathBuf;

/// Per-profile worker pool sizing and timing knobs. Defaults match the
/// values a pool is built with when the caller supplies none.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub max_calls_per_vm: u64,
    pub idle_timeout_sec: f64,
    pub startup_timeout_sec: f64,
    pub acquire_timeout_sec: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 1,
            max_size: 10,
            max_calls_per_vm: 100,
            idle_timeout_sec: 300.0,
            startup_timeout_sec: 30.0,
            acquire_timeout_sec: 10.0,
        }
    }
}

/// Shape of the VM booted for a pool, before a profile's `mem_mb` is
/// overlaid onto `mem_size_mb`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct VmShapeConfig {
    pub vcpu_count: u32,
    pub mem_size_mb: u32,
    pub vsock_port: u32,
    pub boot_args: String,
}

impl Default for VmShapeConfig {
    fn default() -> Self {
        VmShapeConfig {
            vcpu_count: 1,
            mem_size_mb: 128,
            vsock_port: 5000,
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
        }
    }
}

/// Paths the hypervisor driver is parameterized by; never read from the
/// environment by the core, only ever supplied by the embedding process.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub firecracker_binary: PathBuf,
    pub kernel_image_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub snapshot_dir: PathBuf,
}

/// Aggregates the knobs needed to stand up a [`crate::supervisor::Supervisor`].
/// Constructible in code or deserialized from a small on-disk TOML file;
/// discovering *that* file from the environment or a CLI is out of scope
/// here and left to the embedding application.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub driver: DriverConfig,
    pub vm_shape: VmShapeConfig,
    pub pool: PoolConfig,
}

impl SupervisorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults_match_documented_values() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.min_size, 1);
        assert_eq!(cfg.max_size, 10);
        assert_eq!(cfg.max_calls_per_vm, 100);
        assert_eq!(cfg.idle_timeout_sec, 300.0);
        assert_eq!(cfg.startup_timeout_sec, 30.0);
        assert_eq!(cfg.acquire_timeout_sec, 10.0);
    }

    #[test]
    fn supervisor_config_parses_partial_toml_with_defaults() {
        let cfg = SupervisorConfig::from_toml_str(
            r#"
            [pool]
            max_size = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pool.max_size, 5);
        assert_eq!(cfg.pool.min_size, 1);
        assert_eq!(cfg.vm_shape.vsock_port, 5000);
    }
}
