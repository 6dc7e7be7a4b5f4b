//! SpanStore library -- S3-compatible multi-backend data gateway.
//!
//! This crate provides the routing core of the gateway: per-location
//! backend clients, the location registry and resolver, the uniform
//! multi-backend façade, the top-level data wrapper, the replication
//! (backbeat) surface, and the bucket deletion pipeline.

use std::sync::Arc;

pub mod backends;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod kms;
pub mod locations;
pub mod metadata;
pub mod metrics;
pub mod resolver;
pub mod server;
pub mod versioning;
pub mod wrapper;
pub mod xml;

use crate::config::Config;
use crate::gateway::MultiBackendGateway;
use crate::kms::Kms;
use crate::metadata::store::MetadataClient;
use crate::wrapper::DataWrapper;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata-plane client.
    pub metadata: Arc<dyn MetadataClient>,
    /// Top-level data dispatcher.
    pub data: Arc<DataWrapper>,
    /// Multi-backend façade (also reachable from `data` in `multiple`
    /// mode; kept here for the replication surface and healthchecks).
    pub gateway: Arc<MultiBackendGateway>,
    /// KMS collaborator.
    pub kms: Arc<dyn Kms>,
}

/// Test fixtures shared by handler tests.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::backends::client::BackendClient;
    use crate::backends::memory::MemoryBackend;
    use crate::config::LocationDetails;
    use crate::kms::NoopKms;
    use crate::locations::LocationRegistry;
    use crate::metadata::memory::MemoryMetadata;
    use crate::wrapper::DataClient;

    /// Build an `AppState` over in-memory backends.  Each entry is
    /// `(location name, remote bucket name)`; the first location is the
    /// default.
    pub async fn test_state(locations: &[(&str, &str)]) -> Arc<AppState> {
        let clients: Vec<Arc<dyn BackendClient>> = locations
            .iter()
            .map(|(name, _)| Arc::new(MemoryBackend::new(name)) as Arc<dyn BackendClient>)
            .collect();
        let mut registry = LocationRegistry::from_clients(clients, locations[0].0);
        for (name, bucket_name) in locations {
            registry.set_details(
                name,
                LocationDetails {
                    bucket_name: bucket_name.to_string(),
                    ..Default::default()
                },
            );
        }

        let gateway = Arc::new(MultiBackendGateway::new(Arc::new(registry)));
        let kms: Arc<dyn Kms> = Arc::new(NoopKms);
        let data = Arc::new(DataWrapper::new(
            DataClient::Multiple(gateway.clone()),
            kms.clone(),
        ));

        Arc::new(AppState {
            config: serde_yaml::from_str("{}").unwrap(),
            metadata: Arc::new(MemoryMetadata::new()),
            data,
            gateway,
            kms,
        })
    }

    /// Create a bucket record directly in metadata.
    pub async fn seed_bucket(
        state: &AppState,
        name: &str,
        location: &str,
        versioning: crate::versioning::VersioningState,
    ) {
        let md = crate::metadata::store::BucketMd {
            name: name.to_string(),
            owner: "account-default".to_string(),
            owner_display: "account-default".to_string(),
            location_constraint: location.to_string(),
            versioning,
            sse: None,
            transient: false,
            deleted: false,
            creation_date: crate::handlers::object::now_iso8601(),
        };
        state.metadata.put_bucket(md).await.unwrap();
    }
}
