//! Configuration loading and types for SpanStore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The heart of it is the `location_constraints`
//! map: each entry names one data backend (its type plus provider
//! details), and objects are routed between them by location name.
//!
//! Per-location credentials may be overridden by environment variables
//! so secrets can stay out of the config file:
//!   `{LOCATION}_AWS_ACCESS_KEY_ID` / `{LOCATION}_AWS_SECRET_ACCESS_KEY`
//!   `{LOCATION}_AZURE_STORAGE_ACCOUNT_NAME` / `{LOCATION}_AZURE_STORAGE_ACCESS_KEY`
//!   `GCP_CRED` (service account JSON path, all GCP locations)

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Data-plane backend selection.
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Location constraint table: name -> backend description.
    #[serde(default)]
    pub location_constraints: HashMap<String, LocationConfig>,

    /// Replication (backbeat) settings.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// AWS region to present (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Data-plane backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    /// Data backend mode: `mem`, `file`, `multiple`, or `cdmi`.
    ///
    /// `multiple` routes through the location-constraint table; the other
    /// modes pin every object to a single built-in backend.
    #[serde(default = "default_data_backend")]
    pub data: String,

    /// Location used when neither the request nor the bucket names one.
    #[serde(default = "default_location_name")]
    pub default_location: String,

    /// Root directory for the `file` backend.
    #[serde(default = "default_file_root")]
    pub file_root: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            data: default_data_backend(),
            default_location: default_location_name(),
            file_root: default_file_root(),
        }
    }
}

/// One entry in the location constraint table.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    /// Backend type: `mem`, `file`, `scality`, `aws_s3`, `azure`, `gcp`,
    /// or `cdmi`.
    #[serde(rename = "type")]
    pub location_type: String,

    /// Whether AWS list semantics of the legacy (pre-v2) kind apply.
    #[serde(default)]
    pub legacy_aws_behavior: bool,

    /// Provider-specific details.
    #[serde(default)]
    pub details: LocationDetails,
}

/// Provider-specific details for one location.
///
/// Only the fields relevant to the location's type are consulted; the
/// rest stay at their defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocationDetails {
    /// Remote bucket / container this location writes into.
    #[serde(default)]
    pub bucket_name: String,

    /// One-to-one (true) vs. many-to-one (false) mapping between
    /// gateway buckets and the remote bucket.  When false, native keys
    /// are prefixed with the gateway bucket name.  Fixed for the life
    /// of every object stored through the location.
    #[serde(default)]
    pub bucket_match: bool,

    /// Remote region (`aws_s3`).
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint (`aws_s3` S3-compatible targets, `scality` RPC).
    #[serde(default)]
    pub endpoint: String,

    /// Force path-style addressing (`aws_s3`).
    #[serde(default)]
    pub path_style: bool,

    /// Explicit AWS credentials (overridable via env).
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,

    /// Azure storage account (overridable via env).
    #[serde(default)]
    pub azure_storage_account_name: String,
    /// Azure shared key, base64 (overridable via env).
    #[serde(default)]
    pub azure_storage_access_key: String,

    /// GCP service-account JSON path (overridable via `GCP_CRED`).
    #[serde(default)]
    pub gcp_credentials_file: String,
    /// Bucket used by GCP for in-flight multipart parts.
    #[serde(default)]
    pub mpu_bucket_name: String,

    /// Server-side encryption flag advertised by the remote store.
    #[serde(default)]
    pub server_side_encryption: bool,
}

/// Replication (backbeat) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Bearer key the replication worker must present.  The worker's
    /// identity and its `objectReplicate` grant live in the external
    /// auth service; this key is the narrow contract with it.
    #[serde(default = "default_replication_key")]
    pub service_key: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            service_key: default_replication_key(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/health` and the deep per-location healthcheck.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_data_backend() -> String {
    "file".to_string()
}

fn default_location_name() -> String {
    "us-east-1".to_string()
}

fn default_file_root() -> String {
    "./data/objects".to_string()
}

fn default_replication_key() -> String {
    "backbeat".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`, then apply
/// environment-variable credential overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config: Config = serde_yaml::from_str(&contents)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply per-location environment-variable credential overrides.
///
/// Location names are upper-cased with `-` mapped to `_` to form the
/// variable prefix, e.g. location `aws-east` reads
/// `AWS_EAST_AWS_ACCESS_KEY_ID`.
pub fn apply_env_overrides(config: &mut Config) {
    for (name, location) in config.location_constraints.iter_mut() {
        let prefix = name.to_uppercase().replace('-', "_");

        if let Ok(v) = std::env::var(format!("{prefix}_AWS_ACCESS_KEY_ID")) {
            location.details.access_key = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AWS_SECRET_ACCESS_KEY")) {
            location.details.secret_key = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AZURE_STORAGE_ACCOUNT_NAME")) {
            location.details.azure_storage_account_name = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AZURE_STORAGE_ACCESS_KEY")) {
            location.details.azure_storage_access_key = v;
        }
        if location.location_type == "gcp" {
            if let Ok(v) = std::env::var("GCP_CRED") {
                location.details.gcp_credentials_file = v;
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: 8100
backends:
  data: multiple
  default_location: mem-main
location_constraints:
  mem-main:
    type: mem
  aws-east:
    type: aws_s3
    details:
      bucket_name: remote-bucket
      bucket_match: true
      region: us-east-1
  azure-west:
    type: azure
    details:
      bucket_name: remote-container
      azure_storage_account_name: acct
"#;

    #[test]
    fn test_parse_location_constraints() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 8100);
        assert_eq!(config.backends.data, "multiple");
        assert_eq!(config.location_constraints.len(), 3);

        let aws = &config.location_constraints["aws-east"];
        assert_eq!(aws.location_type, "aws_s3");
        assert!(aws.details.bucket_match);
        assert_eq!(aws.details.bucket_name, "remote-bucket");

        let mem = &config.location_constraints["mem-main"];
        assert_eq!(mem.location_type, "mem");
        assert!(!mem.details.bucket_match);
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.backends.data, "file");
        assert_eq!(config.backends.default_location, "us-east-1");
        assert_eq!(config.server.port, 8000);
        assert!(config.observability.metrics);
        assert_eq!(config.replication.service_key, "backbeat");
    }

    #[test]
    fn test_env_override_azure_account() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        std::env::set_var("AZURE_WEST_AZURE_STORAGE_ACCOUNT_NAME", "from-env");
        apply_env_overrides(&mut config);
        std::env::remove_var("AZURE_WEST_AZURE_STORAGE_ACCOUNT_NAME");
        assert_eq!(
            config.location_constraints["azure-west"]
                .details
                .azure_storage_account_name,
            "from-env"
        );
    }
}
