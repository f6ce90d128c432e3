use sha2::{Digest, Sha256};
use std::fmt;

/// Filesystem access mode for a single mount entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum FsAccess {
    Read,
    Write,
    ReadWrite,
}

impl FsAccess {
    fn token(self) -> &'static str {
        match self {
            FsAccess::Read => "r",
            FsAccess::Write => "w",
            FsAccess::ReadWrite => "rw",
        }
    }

    fn parse(token: &str) -> Result<Self, BadProfile> {
        match token {
            "r" => Ok(FsAccess::Read),
            "w" => Ok(FsAccess::Write),
            "rw" => Ok(FsAccess::ReadWrite),
            other => Err(BadProfile::InvalidAccessMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct FsMount {
    pub access: FsAccess,
    pub path: String,
}

impl fmt::Display for FsMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.access.token(), self.path)
    }
}

/// Parses one mount spec. `"none"` is the empty-mount sentinel and yields no
/// entries; everything else must be `"<r|w|rw>:/path"`.
pub fn parse_mount(spec: &str) -> Result<Vec<FsMount>, BadProfile> {
    if spec == "none" {
        return Ok(Vec::new());
    }

    let (access_str, path) = spec
        .split_once(':')
        .ok_or_else(|| BadProfile::InvalidMountSpec(spec.to_string()))?;
    let access = FsAccess::parse(access_str)?;

    Ok(vec![FsMount {
        access,
        path: path.to_string(),
    }])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NetPolicy {
    None,
    HttpsOnly,
    All,
}

impl NetPolicy {
    fn token(self) -> &'static str {
        match self {
            NetPolicy::None => "none",
            NetPolicy::HttpsOnly => "https-only",
            NetPolicy::All => "all",
        }
    }

    fn parse(token: &str) -> Result<Self, BadProfile> {
        match token {
            "none" => Ok(NetPolicy::None),
            "https-only" => Ok(NetPolicy::HttpsOnly),
            "all" => Ok(NetPolicy::All),
            other => Err(BadProfile::InvalidNetPolicy(other.to_string())),
        }
    }
}

impl Default for NetPolicy {
    fn default() -> Self {
        NetPolicy::None
    }
}

/// Immutable description of isolation guarantees and resource limits for a
/// single sandboxed call. Every field that affects isolation must enter
/// [`CapabilityProfile::canonical`], and order-sensitive fields are kept
/// sorted so semantically identical profiles always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapabilityProfile {
    pub fs_mounts: Vec<FsMount>,
    pub net: NetPolicy,
    pub cpu_ms: u32,
    pub mem_mb: u32,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ProfileOptions {
    pub fs: Vec<String>,
    pub net: Option<String>,
    pub cpu_ms: Option<u32>,
    pub mem_mb: Option<u32>,
    pub dependencies: Vec<String>,
}

impl CapabilityProfile {
    const DEFAULT_CPU_MS: u32 = 1000;
    const DEFAULT_MEM_MB: u32 = 128;

    /// Normalizes and validates a set of call-site options into a profile.
    /// Rejects non-positive limits and unparseable mount/net specs with
    /// [`BadProfile`].
    pub fn from_options(options: ProfileOptions) -> Result<Self, BadProfile> {
        let cpu_ms = options.cpu_ms.unwrap_or(Self::DEFAULT_CPU_MS);
        let mem_mb = options.mem_mb.unwrap_or(Self::DEFAULT_MEM_MB);
        if cpu_ms == 0 {
            return Err(BadProfile::NonPositiveCpuMs);
        }
        if mem_mb == 0 {
            return Err(BadProfile::NonPositiveMemMb);
        }

        let mut fs_mounts = Vec::new();
        for spec in &options.fs {
            fs_mounts.extend(parse_mount(spec)?);
        }
        fs_mounts.sort();

        let net = match options.net {
            Some(ref s) => NetPolicy::parse(s)?,
            None => NetPolicy::None,
        };

        let mut dependencies: Vec<String> = options.dependencies;
        dependencies.sort();
        dependencies.dedup();

        Ok(CapabilityProfile {
            fs_mounts,
            net,
            cpu_ms,
            mem_mb,
            dependencies,
        })
    }

    /// Canonical textual form, fixed field order `cpu_ms;deps;fs;mem_mb;net`
    /// with an explicit `"none"` sentinel for empty sequences.
    pub fn canonical(&self) -> String {
        let deps = if self.dependencies.is_empty() {
            "none".to_string()
        } else {
            self.dependencies.join(",")
        };
        let fs = if self.fs_mounts.is_empty() {
            "none".to_string()
        } else {
            self.fs_mounts
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        format!(
            "cpu_ms={};deps={};fs={};mem_mb={};net={}",
            self.cpu_ms,
            deps,
            fs,
            self.mem_mb,
            self.net.token(),
        )
    }

    /// First 16 hex characters of the SHA-256 digest of [`canonical`](Self::canonical).
    /// The sole key used to partition the worker pool.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        let hex = hex_encode(&digest);
        hex[..16].to_string()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).expect("writing to a String cannot fail");
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum BadProfile {
    #[error("invalid fs mount spec: {0} (expected 'none' or '<r|w|rw>:/path')")]
    InvalidMountSpec(String),
    #[error("invalid fs access mode: {0} (expected 'r', 'w', or 'rw')")]
    InvalidAccessMode(String),
    #[error("invalid network policy: {0} (expected 'none', 'https-only', or 'all')")]
    InvalidNetPolicy(String),
    #[error("cpu_ms must be positive")]
    NonPositiveCpuMs,
    #[error("mem_mb must be positive")]
    NonPositiveMemMb,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ProfileOptions {
        ProfileOptions::default()
    }

    #[test]
    fn none_mount_parses_to_empty_sequence() {
        assert_eq!(parse_mount("none").unwrap(), Vec::new());
    }

    #[test]
    fn parses_rw_mount() {
        let mounts = parse_mount("rw:/data").unwrap();
        assert_eq!(
            mounts,
            vec![FsMount {
                access: FsAccess::ReadWrite,
                path: "/data".to_string(),
            }]
        );
    }

    #[test]
    fn rejects_bad_mount_spec() {
        assert!(matches!(
            parse_mount("bogus"),
            Err(BadProfile::InvalidMountSpec(_))
        ));
        assert!(matches!(
            parse_mount("xx:/data"),
            Err(BadProfile::InvalidAccessMode(_))
        ));
    }

    #[test]
    fn rejects_non_positive_limits() {
        let mut o = opts();
        o.cpu_ms = Some(0);
        assert!(matches!(
            CapabilityProfile::from_options(o),
            Err(BadProfile::NonPositiveCpuMs)
        ));

        let mut o = opts();
        o.mem_mb = Some(0);
        assert!(matches!(
            CapabilityProfile::from_options(o),
            Err(BadProfile::NonPositiveMemMb)
        ));
    }

    #[test]
    fn fingerprint_is_stable_across_reorderings() {
        let mut a = opts();
        a.fs = vec!["r:/b".to_string(), "w:/a".to_string()];
        a.dependencies = vec!["numpy".to_string(), "pandas".to_string()];

        let mut b = opts();
        b.fs = vec!["w:/a".to_string(), "r:/b".to_string()];
        b.dependencies = vec!["pandas".to_string(), "numpy".to_string()];

        let pa = CapabilityProfile::from_options(a).unwrap();
        let pb = CapabilityProfile::from_options(b).unwrap();

        assert_eq!(pa.canonical(), pb.canonical());
        assert_eq!(pa.fingerprint(), pb.fingerprint());
    }

    #[test]
    fn distinct_net_policy_yields_distinct_fingerprint() {
        let mut a = opts();
        a.net = Some("none".to_string());
        let mut b = opts();
        b.net = Some("https-only".to_string());

        let pa = CapabilityProfile::from_options(a).unwrap();
        let pb = CapabilityProfile::from_options(b).unwrap();

        assert_ne!(pa.fingerprint(), pb.fingerprint());
    }

    #[test]
    fn fingerprint_length_is_16_hex_chars() {
        let p = CapabilityProfile::from_options(opts()).unwrap();
        let fp = p.fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
