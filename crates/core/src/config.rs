//! Configuration types shared across crates.
//!
//! All sections deserialize with defaults so a config file only needs to
//! name what it changes. The binary layers environment variables on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::Duration;

use crate::chunker::{ChunkingParams, DEFAULT_MAX_SIZE, DEFAULT_MIN_SIZE, DEFAULT_TARGET_SIZE};
use crate::{Error, Result};

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem { path: PathBuf },
    /// S3-compatible storage.
    S3 {
        bucket: String,
        /// Custom endpoint (MinIO, R2, ...).
        endpoint: Option<String>,
        region: Option<String>,
        /// Key prefix inside the bucket.
        prefix: Option<String>,
        /// Falls back to the default AWS credential chain when unset.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// `endpoint/bucket/key` addressing, needed by MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err(Error::Config("storage.bucket cannot be empty".into()));
                }
                match (access_key_id, secret_access_key) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(Error::Config(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .into(),
                    )),
                }
            }
            Self::Filesystem { .. } => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    Sqlite {
        path: PathBuf,
        /// Busy timeout for lock waits, in seconds.
        #[serde(default = "default_query_timeout_secs")]
        query_timeout_secs: u64,
    },
}

fn default_query_timeout_secs() -> u64 {
    30
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

/// Signing configuration. Required: pulls cannot be served unsigned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Key name, e.g. `cache.example.com-1`.
    pub key_name: String,
    pub private_key: PrivateKeyConfig,
}

/// Where the signing key comes from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PrivateKeyConfig {
    File { path: PathBuf },
    Env { var: String },
    /// Inline key. Avoid outside development.
    Value { key: String },
    /// Fresh ephemeral key on every start.
    Generate,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_name: "larder-1".to_string(),
            private_key: PrivateKeyConfig::Generate,
        }
    }
}

/// Chunker size bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_min_size() -> usize {
    DEFAULT_MIN_SIZE
}

fn default_target_size() -> usize {
    DEFAULT_TARGET_SIZE
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            target_size: DEFAULT_TARGET_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> Result<ChunkingParams> {
        ChunkingParams::new(self.min_size, self.target_size, self.max_size)
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Seconds between scheduled sweeps. 0 disables the scheduler.
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    /// Entry retention for caches that do not set their own.
    /// Unset means entries never expire by age.
    #[serde(default)]
    pub default_retention_secs: Option<u64>,
    /// Minimum age before unreferenced content may be reclaimed.
    #[serde(default = "default_gc_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Reclaim least recently used objects only while stored object bytes
    /// exceed this.
    #[serde(default)]
    pub budget_bytes: Option<u64>,
    /// Upper bound on objects reclaimed per sweep.
    #[serde(default)]
    pub max_objects_per_sweep: Option<u64>,
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: u32,
    /// Parallel chunk deletions against the storage backend.
    #[serde(default = "default_gc_delete_concurrency")]
    pub delete_concurrency: usize,
}

fn default_gc_interval_secs() -> u64 {
    43_200 // 12 hours
}

fn default_gc_grace_period_secs() -> u64 {
    3600
}

fn default_gc_batch_size() -> u32 {
    1000
}

fn default_gc_delete_concurrency() -> usize {
    20
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval_secs(),
            default_retention_secs: None,
            grace_period_secs: default_gc_grace_period_secs(),
            budget_bytes: None,
            max_objects_per_sweep: None,
            batch_size: default_gc_batch_size(),
            delete_concurrency: default_gc_delete_concurrency(),
        }
    }
}

impl GcConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX))
    }

    pub fn interval(&self) -> Option<std::time::Duration> {
        (self.interval_secs > 0).then(|| std::time::Duration::from_secs(self.interval_secs))
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("gc.grace_period_secs", Some(self.grace_period_secs)),
            ("gc.interval_secs", Some(self.interval_secs)),
            ("gc.default_retention_secs", self.default_retention_secs),
        ] {
            if let Some(value) = value
                && value > i64::MAX as u64
            {
                return Err(Error::Config(format!(
                    "{name} {value} exceeds maximum value {}",
                    i64::MAX
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(Error::Config("gc.batch_size cannot be 0".into()));
        }
        if self.delete_concurrency == 0 {
            return Err(Error::Config("gc.delete_concurrency cannot be 0".into()));
        }
        Ok(())
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LarderConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

impl LarderConfig {
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.chunking.params()?;
        self.gc.validate()?;
        if self.signing.key_name.is_empty() || self.signing.key_name.contains(':') {
            return Err(Error::Config(format!(
                "signing.key_name {:?} must be non-empty and contain no ':'",
                self.signing.key_name
            )));
        }
        Ok(())
    }

    /// Filesystem storage and SQLite under `dir`, an ephemeral key and
    /// small chunks so test objects split into many pieces.
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            storage: StorageConfig::Filesystem {
                path: dir.join("storage"),
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
                query_timeout_secs: default_query_timeout_secs(),
            },
            signing: SigningConfig {
                key_name: "larder-test-1".to_string(),
                private_key: PrivateKeyConfig::Generate,
            },
            chunking: ChunkingConfig {
                min_size: 2 * 1024,
                target_size: 8 * 1024,
                max_size: 32 * 1024,
            },
            gc: GcConfig {
                interval_secs: 0,
                grace_period_secs: 0,
                ..GcConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: LarderConfig = serde_json::from_str("{}").unwrap();
        assert!(matches!(config.storage, StorageConfig::Filesystem { .. }));
        assert_eq!(config.gc.interval_secs, 43_200);
        assert_eq!(config.chunking.target_size, DEFAULT_TARGET_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_s3_defaults() {
        let json = r#"{"type":"s3","bucket":"test","endpoint":"https://s3.amazonaws.com"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        match config {
            StorageConfig::S3 {
                force_path_style,
                access_key_id,
                ..
            } => {
                assert!(!force_path_style);
                assert!(access_key_id.is_none());
            }
            other => panic!("expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let partial = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(partial.validate().is_err());

        let full = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: Some("secret-key".to_string()),
            force_path_style: false,
        };
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_private_key_sources_deserialize() {
        let json = r#"{"key_name":"c-1","private_key":{"type":"env","var":"LARDER_KEY"}}"#;
        let signing: SigningConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(signing.private_key, PrivateKeyConfig::Env { ref var } if var == "LARDER_KEY"));

        let json = r#"{"key_name":"c-1","private_key":{"type":"generate"}}"#;
        let signing: SigningConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(signing.private_key, PrivateKeyConfig::Generate));
    }

    #[test]
    fn test_gc_config_validation() {
        let mut gc = GcConfig::default();
        assert!(gc.validate().is_ok());
        assert_eq!(gc.interval(), Some(std::time::Duration::from_secs(43_200)));

        gc.interval_secs = 0;
        assert_eq!(gc.interval(), None);

        gc.grace_period_secs = u64::MAX;
        assert!(gc.validate().is_err());

        let gc = GcConfig {
            delete_concurrency: 0,
            ..GcConfig::default()
        };
        assert!(gc.validate().is_err());
    }

    #[test]
    fn test_invalid_chunking_rejected() {
        let config = LarderConfig {
            chunking: ChunkingConfig {
                min_size: 1024,
                target_size: 3000,
                max_size: 8192,
            },
            ..LarderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_name_with_colon_rejected() {
        let config = LarderConfig {
            signing: SigningConfig {
                key_name: "bad:name".into(),
                private_key: PrivateKeyConfig::Generate,
            },
            ..LarderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_testing_is_valid() {
        let dir = std::path::Path::new("/tmp/larder-test");
        assert!(LarderConfig::for_testing(dir).validate().is_ok());
    }
}
