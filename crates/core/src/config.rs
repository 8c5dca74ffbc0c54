//! Configuration types shared across crates.
//!
//! Two layers of configuration exist. Process configuration
//! ([`AgentConfig`]) is loaded from a TOML file and `DROVER_` environment
//! variables on every agent/CLI start. Cluster configuration
//! ([`StoreConfig`]) is a singleton document in the control database so
//! every agent resolves the same storage descriptor.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local (or mounted) filesystem storage.
    Filesystem {
        /// Root directory for backup objects.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO and friends).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        /// Optional region (defaults to us-east-1).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        /// Optional key prefix inside the bucket.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        /// Explicit credentials. When absent the ambient AWS credential
        /// chain is used.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_access_key: Option<String>,
        /// Use path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
    /// Validate the descriptor before a backend is built from it.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage requires a non-empty path".to_string());
                }
                if !path.is_absolute() {
                    return Err(format!(
                        "filesystem storage path must be absolute: {}",
                        path.display()
                    ));
                }
                Ok(())
            }
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 storage requires a bucket".to_string());
                }
                if access_key_id.is_some() != secret_access_key.is_some() {
                    return Err(
                        "s3 config requires both access_key_id and secret_access_key \
                         when either is set"
                            .to_string(),
                    );
                }
                Ok(())
            }
        }
    }
}

/// Compression applied to dump and oplog objects.
///
/// The kind is recorded in the backup metadata and restore reads the same
/// field; there is no auto-detection. `Pgzip` shares the gzip wire format,
/// so either codec can read the other's output. `Snappy` and `S2` are
/// representable (backups written by other tooling may carry them) but no
/// codec is available for them here; opening one fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Pgzip,
    Snappy,
    Lz4,
    S2,
    Zstd,
}

impl Compression {
    /// Object-name extension for this kind, including the leading dot.
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip | Compression::Pgzip => ".gz",
            Compression::Snappy => ".snappy",
            Compression::Lz4 => ".lz4",
            Compression::S2 => ".s2",
            Compression::Zstd => ".zst",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Pgzip => "pgzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::S2 => "s2",
            Compression::Zstd => "zstd",
        };
        f.write_str(s)
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "pgzip" => Ok(Compression::Pgzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "s2" => Ok(Compression::S2),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::UnknownCompression(other.to_string())),
        }
    }
}

/// Cluster-wide configuration, stored as the singleton document of the
/// configuration collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage descriptor backups are written to. A snapshot of this value
    /// is embedded into every backup's metadata at start time.
    pub storage: StorageConfig,
    /// Compression used when a backup command does not name one.
    #[serde(default)]
    pub compression: Compression,
}

/// Coordination timing knobs. The defaults match the protocol constants the
/// liveness analysis assumes; deployments mostly leave them alone.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Tunables {
    /// Grace period after which a non-refreshed lock heartbeat is considered
    /// dead and the lock is reclaimable. Must be strictly greater than the
    /// heartbeat cadence.
    #[serde(default = "default_stale_frame_sec")]
    pub stale_frame_sec: u32,
    /// Lock and meta heartbeat refresh cadence.
    #[serde(default = "default_heartbeat_sec")]
    pub heartbeat_sec: u64,
    /// Reconciler and status-wait poll cadence.
    #[serde(default = "default_poll_sec")]
    pub poll_sec: u64,
    /// Budget for every shard to acknowledge a started operation; applies
    /// only to the Starting -> Running hop.
    #[serde(default = "default_wait_action_start_sec")]
    pub wait_action_start_sec: u64,
}

fn default_stale_frame_sec() -> u32 {
    30
}

fn default_heartbeat_sec() -> u64 {
    5
}

fn default_poll_sec() -> u64 {
    1
}

fn default_wait_action_start_sec() -> u64 {
    30
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            stale_frame_sec: default_stale_frame_sec(),
            heartbeat_sec: default_heartbeat_sec(),
            poll_sec: default_poll_sec(),
            wait_action_start_sec: default_wait_action_start_sec(),
        }
    }
}

impl Tunables {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sec)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_sec)
    }

    pub fn wait_action_start(&self) -> Duration {
        Duration::from_secs(self.wait_action_start_sec)
    }
}

/// Agent process configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Connection string of the local database node.
    pub mongodb_uri: String,
    #[serde(default)]
    pub tunables: Tunables,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_suffixes() {
        assert_eq!(Compression::None.suffix(), "");
        assert_eq!(Compression::Gzip.suffix(), ".gz");
        assert_eq!(Compression::Pgzip.suffix(), ".gz");
        assert_eq!(Compression::Zstd.suffix(), ".zst");
        assert_eq!(Compression::Lz4.suffix(), ".lz4");
    }

    #[test]
    fn compression_round_trips_through_str() {
        for kind in [
            Compression::None,
            Compression::Gzip,
            Compression::Pgzip,
            Compression::Snappy,
            Compression::Lz4,
            Compression::S2,
            Compression::Zstd,
        ] {
            let parsed: Compression = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("brotli".parse::<Compression>().is_err());
    }

    #[test]
    fn storage_validate_rejects_relative_path() {
        let cfg = StorageConfig::Filesystem {
            path: PathBuf::from("relative/dir"),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn storage_validate_rejects_partial_credentials() {
        let cfg = StorageConfig::S3 {
            bucket: "backups".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tunables_defaults_keep_heartbeat_inside_stale_frame() {
        let t = Tunables::default();
        assert!(u64::from(t.stale_frame_sec) > t.heartbeat_sec);
        assert_eq!(t.poll(), Duration::from_secs(1));
        assert_eq!(t.wait_action_start(), Duration::from_secs(30));
    }
}
