//! Location registry: one data backend client per configured location
//! constraint.
//!
//! Built once at process start from `location_constraints`; no runtime
//! mutation.  A pseudo-entry named `legacy` is always registered for
//! records that predate `dataStoreName`.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::aws::AwsBackend;
use crate::backends::azure::AzureBackend;
use crate::backends::client::{BackendClient, BackendType};
use crate::backends::file::FileBackend;
use crate::backends::gcp::GcpBackend;
use crate::backends::memory::MemoryBackend;
use crate::backends::scality::ScalityBackend;
use crate::config::{Config, LocationDetails};

/// Name of the pseudo-location serving pre-`dataStoreName` records.
pub const LEGACY_LOCATION: &str = "legacy";

/// One registered location.
struct LocationEntry {
    backend_type: BackendType,
    details: LocationDetails,
    /// Absent for `cdmi` locations, which are recognised in
    /// configuration but rejected at dispatch.
    client: Option<Arc<dyn BackendClient>>,
}

/// Mapping `location name -> backend client`.
pub struct LocationRegistry {
    entries: HashMap<String, LocationEntry>,
    default_location: String,
}

impl LocationRegistry {
    /// Instantiate one client per configured location, plus the
    /// `legacy` pseudo-entry backed by the process-default internal
    /// backend.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut entries = HashMap::new();

        for (name, location) in &config.location_constraints {
            let backend_type = BackendType::parse(&location.location_type).ok_or_else(|| {
                anyhow::anyhow!(
                    "location {name}: unknown backend type {:?}",
                    location.location_type
                )
            })?;

            let client: Option<Arc<dyn BackendClient>> = match backend_type {
                BackendType::Mem => Some(Arc::new(MemoryBackend::new(name))),
                BackendType::File => Some(Arc::new(FileBackend::new(
                    name,
                    format!("{}/{}", config.backends.file_root, name),
                )?)),
                BackendType::Scality => Some(Arc::new(ScalityBackend::new(
                    name,
                    &location.details.endpoint,
                )?)),
                BackendType::AwsS3 => Some(Arc::new(AwsBackend::new(name, &location.details).await?)),
                BackendType::Azure => Some(Arc::new(AzureBackend::new(name, &location.details)?)),
                BackendType::Gcp => Some(Arc::new(GcpBackend::new(name, &location.details)?)),
                BackendType::Cdmi => {
                    warn!("location {name}: cdmi backend is recognised but not implemented");
                    None
                }
            };

            entries.insert(
                name.clone(),
                LocationEntry {
                    backend_type,
                    details: location.details.clone(),
                    client,
                },
            );
        }

        // Legacy pseudo-entry for records without a dataStoreName: the
        // process-default internal backend.
        if !entries.contains_key(LEGACY_LOCATION) {
            let client: Arc<dyn BackendClient> = if config.backends.data == "file" {
                Arc::new(FileBackend::new(
                    LEGACY_LOCATION,
                    format!("{}/{}", config.backends.file_root, LEGACY_LOCATION),
                )?)
            } else {
                Arc::new(MemoryBackend::new(LEGACY_LOCATION))
            };
            let backend_type = client.backend_type();
            entries.insert(
                LEGACY_LOCATION.to_string(),
                LocationEntry {
                    backend_type,
                    details: LocationDetails::default(),
                    client: Some(client),
                },
            );
        }

        info!("location registry built with {} entries", entries.len());

        Ok(Self {
            entries,
            default_location: config.backends.default_location.clone(),
        })
    }

    /// Build a registry directly from clients (test seam).
    pub fn from_clients(
        clients: Vec<Arc<dyn BackendClient>>,
        default_location: &str,
    ) -> Self {
        let mut entries = HashMap::new();
        for client in clients {
            entries.insert(
                client.location().to_string(),
                LocationEntry {
                    backend_type: client.backend_type(),
                    details: LocationDetails::default(),
                    client: Some(client),
                },
            );
        }
        Self {
            entries,
            default_location: default_location.to_string(),
        }
    }

    /// Register details for a location (test seam for the coherence
    /// check).
    pub fn set_details(&mut self, name: &str, details: LocationDetails) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.details = details;
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn client(&self, name: &str) -> Option<Arc<dyn BackendClient>> {
        self.entries.get(name).and_then(|e| e.client.clone())
    }

    pub fn location_type(&self, name: &str) -> Option<BackendType> {
        self.entries.get(name).map(|e| e.backend_type)
    }

    pub fn details(&self, name: &str) -> Option<&LocationDetails> {
        self.entries.get(name).map(|e| &e.details)
    }

    pub fn default_location(&self) -> &str {
        &self.default_location
    }

    /// All registered location names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_registry_builds_mem_locations() {
        let config = mem_config(
            r#"
backends:
  data: multiple
  default_location: mem-a
location_constraints:
  mem-a:
    type: mem
  mem-b:
    type: mem
"#,
        );
        let registry = LocationRegistry::from_config(&config).await.unwrap();
        assert!(registry.is_registered("mem-a"));
        assert!(registry.is_registered("mem-b"));
        assert_eq!(registry.location_type("mem-a"), Some(BackendType::Mem));
        assert!(registry.client("mem-a").is_some());
        assert_eq!(registry.default_location(), "mem-a");
    }

    #[tokio::test]
    async fn test_legacy_entry_always_registered() {
        let config = mem_config("backends:\n  data: mem\n");
        let registry = LocationRegistry::from_config(&config).await.unwrap();
        assert!(registry.is_registered(LEGACY_LOCATION));
        assert_eq!(
            registry.location_type(LEGACY_LOCATION),
            Some(BackendType::Mem)
        );
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let config = mem_config(
            r#"
location_constraints:
  bad:
    type: tape-robot
"#,
        );
        assert!(LocationRegistry::from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_cdmi_registered_without_client() {
        let config = mem_config(
            r#"
location_constraints:
  cdmi-loc:
    type: cdmi
"#,
        );
        let registry = LocationRegistry::from_config(&config).await.unwrap();
        assert!(registry.is_registered("cdmi-loc"));
        assert_eq!(
            registry.location_type("cdmi-loc"),
            Some(BackendType::Cdmi)
        );
        assert!(registry.client("cdmi-loc").is_none());
    }
}
