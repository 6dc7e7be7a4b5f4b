//! Scality RING data backend.
//!
//! Proxies data operations to the RING's HTTP daemon.  Unlike the cloud
//! backends, the store is key-addressed: PUT generates a fresh 40-hex
//! key and the GET path accepts that bare key rather than a full
//! retrieval record.
//!
//! Multipart, tagging, and server-side copy are handled above the data
//! layer for this backend, so none of the optional capabilities are
//! advertised.

use bytes::Bytes;
use rand::RngCore;
use reqwest::StatusCode;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

use super::client::{
    compute_etag, BackendClient, BackendType, Capabilities, DataRetrievalInfo, HealthResult,
    KeyContext, PutResult,
};

/// Base path of the proxy daemon's data namespace.
const PROXY_PATH: &str = "/proxy/arc";

/// Data backend talking to a Scality RING HTTP proxy.
pub struct ScalityBackend {
    location: String,
    client: reqwest::Client,
    /// Proxy endpoint, e.g. `http://ring.internal:81`.
    endpoint: String,
}

impl ScalityBackend {
    pub fn new(location: &str, endpoint: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        Ok(Self {
            location: location.to_string(),
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Generate a fresh 40-hex data key.
    fn generate_key() -> String {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}{}/{}", self.endpoint, PROXY_PATH, key)
    }

    fn map_proxy_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow::anyhow!("RING proxy {context}: HTTP {status} - {body}")
    }
}

impl BackendClient for ScalityBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Scality
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn put(
        &self,
        data: Bytes,
        _ctx: &KeyContext,
        req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutResult>> + Send + '_>> {
        let req_id = req_id.to_string();
        Box::pin(async move {
            let key = Self::generate_key();
            let e_tag = compute_etag(&data);
            let url = self.key_url(&key);

            debug!("RING put: key={} bytes={}", key, data.len());

            let resp = self
                .client
                .put(&url)
                .header("x-scal-request-uids", &req_id)
                .header("content-length", data.len())
                .body(data)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("RING proxy put request failed: {e}"))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_proxy_error("put", status, &body));
            }

            Ok(PutResult {
                key,
                e_tag: Some(e_tag),
                data_store_version_id: None,
            })
        })
    }

    fn get(
        &self,
        info: &DataRetrievalInfo,
        range: Option<(u64, u64)>,
        req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        // The RING path takes the bare key; everything else on the
        // record is ignored here.
        let key = info.key.clone();
        let req_id = req_id.to_string();
        Box::pin(async move {
            let url = self.key_url(&key);

            debug!("RING get: key={} range={:?}", key, range);

            let mut req = self
                .client
                .get(&url)
                .header("x-scal-request-uids", &req_id);
            if let Some((first, last)) = range {
                req = req.header("range", format!("bytes={first}-{last}"));
            }

            let resp = req
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("RING proxy get request failed: {e}"))?;

            if !resp.status().is_success() {
                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    anyhow::bail!("no data found for key: {key}");
                }
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_proxy_error("get", status, &body));
            }

            resp.bytes()
                .await
                .map_err(|e| anyhow::anyhow!("RING proxy get body read failed: {e}"))
        })
    }

    fn delete(
        &self,
        info: &DataRetrievalInfo,
        req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = info.key.clone();
        let req_id = req_id.to_string();
        Box::pin(async move {
            let url = self.key_url(&key);

            debug!("RING delete: key={}", key);

            let resp = self
                .client
                .delete(&url)
                .header("x-scal-request-uids", &req_id)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("RING proxy delete request failed: {e}"))?;

            // Idempotent on missing keys.
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_proxy_error("delete", status, &body));
            }

            Ok(())
        })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = HealthResult> + Send + '_>> {
        Box::pin(async move {
            // The proxy daemon exposes its config document; a readable
            // config means the daemon and its backing ring are up.
            let url = format!("{}/.conf", self.endpoint);
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => HealthResult::ok(),
                Ok(resp) => HealthResult {
                    code: resp.status().as_u16(),
                    message: "proxy responded with error".to_string(),
                    error: Some(format!("HTTP {}", resp.status())),
                },
                Err(e) => HealthResult::failed(e),
            }
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_40_hex() {
        let key = ScalityBackend::generate_key();
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, ScalityBackend::generate_key());
    }

    #[test]
    fn test_key_url_shape() {
        let backend = ScalityBackend::new("ring-main", "http://ring.internal:81/").unwrap();
        assert_eq!(
            backend.key_url("abc123"),
            "http://ring.internal:81/proxy/arc/abc123"
        );
    }

    #[test]
    fn test_no_optional_capabilities() {
        let backend = ScalityBackend::new("ring-main", "http://ring.internal:81").unwrap();
        let caps = backend.capabilities();
        assert!(!caps.mpu);
        assert!(!caps.tagging);
        assert!(!caps.copy_object);
        assert!(!caps.upload_part_copy);
    }
}
