//! Google Cloud Storage data backend.
//!
//! Talks to the GCS JSON API with `reqwest`.  Credentials are resolved
//! via Application Default Credentials: `GOOGLE_OAUTH_ACCESS_TOKEN`,
//! a credentials file (authorized_user refresh flow), or the GCE
//! metadata server.
//!
//! GCS has no native tag API on this surface, so the tag set is folded
//! into object metadata under `tag-` keys and tagging operations
//! rewrite the full metadata map.
//!
//! Multipart: parts are staged as temporary objects under
//! `.parts/{upload_id}/` and assembled server-side with `compose`
//! (chained when more than 32 sources are involved).

use bytes::Bytes;
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::LocationDetails;

use super::client::{
    BackendClient, BackendType, Capabilities, CompletedMpu, DataRetrievalInfo, HealthResult,
    KeyContext, PartInput, PartListing, PutResult, UploadedPart,
};

/// GCS compose() supports at most 32 source objects per call.
const MAX_COMPOSE_SOURCES: usize = 32;

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com/storage/v1";

/// GCS upload base URL (for media uploads).
const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

#[derive(Debug, Serialize)]
struct ComposeSourceObject {
    name: String,
}

#[derive(Debug, Serialize)]
struct ComposeRequest {
    #[serde(rename = "sourceObjects")]
    source_objects: Vec<ComposeSourceObject>,
    destination: serde_json::Value,
}

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: std::time::Instant,
}

/// Data backend that forwards operations to a GCS bucket.
pub struct GcpBackend {
    location: String,
    client: reqwest::Client,
    /// The remote GCS bucket name.
    bucket: String,
    /// Bucket used for in-flight multipart parts (falls back to the
    /// data bucket).
    mpu_bucket: String,
    bucket_match: bool,
    /// Cached OAuth2 access token.
    token_cache: Mutex<Option<CachedToken>>,
    /// Parts staged per in-flight upload.
    staged: tokio::sync::RwLock<HashMap<String, Vec<UploadedPart>>>,
}

impl GcpBackend {
    pub fn new(location: &str, details: &LocationDetails) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        let mpu_bucket = if details.mpu_bucket_name.is_empty() {
            details.bucket_name.clone()
        } else {
            details.mpu_bucket_name.clone()
        };

        info!(
            "GCP backend initialized: location={} bucket={} mpuBucket={}",
            location, details.bucket_name, mpu_bucket
        );

        Ok(Self {
            location: location.to_string(),
            client,
            bucket: details.bucket_name.clone(),
            mpu_bucket,
            bucket_match: details.bucket_match,
            token_cache: Mutex::new(None),
            staged: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    fn part_name(upload_id: &str, part_number: u32) -> String {
        format!(".parts/{upload_id}/{part_number:05}")
    }

    fn url_encode_object_name(name: &str) -> String {
        percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
    }

    fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
    }

    /// Get an OAuth2 access token (cached with a 60s safety margin).
    async fn get_access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self.token_cache.lock().expect("token cache mutex poisoned");
            if let Some(ref cached) = *cache {
                if cached.expiry > std::time::Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_access_token().await?;
        let expiry = std::time::Instant::now()
            + std::time::Duration::from_secs(expires_in.saturating_sub(60));
        {
            let mut cache = self.token_cache.lock().expect("token cache mutex poisoned");
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expiry,
            });
        }
        Ok(token)
    }

    /// Resolve a fresh token: env token, then credentials-file refresh
    /// flow, then the GCE metadata server.
    async fn fetch_access_token(&self) -> anyhow::Result<(String, u64)> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok((token, 3600));
        }

        if let Ok(creds_path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            if let Ok(pair) = self.token_from_credentials_file(&creds_path).await {
                return Ok(pair);
            }
        }

        self.token_from_metadata_server().await
    }

    /// Refresh-token flow for `authorized_user` credential files.
    async fn token_from_credentials_file(&self, path: &str) -> anyhow::Result<(String, u64)> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read credentials file {path}: {e}"))?;
        let creds: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse credentials file: {e}"))?;

        let cred_type = creds.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if cred_type != "authorized_user" {
            anyhow::bail!("unsupported credential type in {path}: {cred_type}");
        }

        let resp = self
            .client
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                (
                    "client_id",
                    creds.get("client_id").and_then(|v| v.as_str()).unwrap_or(""),
                ),
                (
                    "client_secret",
                    creds
                        .get("client_secret")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                ),
                (
                    "refresh_token",
                    creds
                        .get("refresh_token")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                ),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("token refresh request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token refresh failed ({status}): {body}");
        }

        Self::parse_token_response(resp.json().await?)
    }

    async fn token_from_metadata_server(&self) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "metadata server request failed: {e}. Set GCP_CRED or \
                     GOOGLE_OAUTH_ACCESS_TOKEN."
                )
            })?;

        if !resp.status().is_success() {
            anyhow::bail!(
                "metadata server returned {}: set GCP_CRED or GOOGLE_OAUTH_ACCESS_TOKEN",
                resp.status()
            );
        }

        Self::parse_token_response(resp.json().await?)
    }

    fn parse_token_response(token_resp: serde_json::Value) -> anyhow::Result<(String, u64)> {
        let access_token = token_resp
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("no access_token in token response"))?
            .to_string();
        let expires_in = token_resp
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(3600);
        Ok((access_token, expires_in))
    }

    // -- GCS JSON API operations ----------------------------------------------

    async fn gcs_upload(
        &self,
        bucket: &str,
        object_name: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let token = self.get_access_token().await?;
        let url = format!(
            "{GCS_UPLOAD_BASE}/b/{bucket}/o?uploadType=multipart"
        );

        // Multipart upload: JSON resource part + media part.
        let boundary = format!("spanstore-{}", uuid::Uuid::new_v4());
        let resource = serde_json::json!({
            "name": object_name,
            "metadata": metadata,
        });

        let mut body: Vec<u8> = Vec::with_capacity(data.len() + 512);
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(resource.to_string().as_bytes());
        body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header(
                "Content-Type",
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS upload request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("upload", status, &body));
        }
        Ok(())
    }

    async fn gcs_download(
        &self,
        bucket: &str,
        object_name: &str,
        range: Option<(u64, u64)>,
    ) -> anyhow::Result<Bytes> {
        let token = self.get_access_token().await?;
        let url = format!(
            "{GCS_API_BASE}/b/{bucket}/o/{}?alt=media",
            Self::url_encode_object_name(object_name)
        );

        let mut req = self.client.get(&url).bearer_auth(&token);
        if let Some((first, last)) = range {
            req = req.header("range", format!("bytes={first}-{last}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                anyhow::bail!("no data found for key: {object_name}");
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("download", status, &body));
        }

        resp.bytes()
            .await
            .map_err(|e| anyhow::anyhow!("GCS download body read failed: {e}"))
    }

    async fn gcs_delete(&self, bucket: &str, object_name: &str) -> anyhow::Result<()> {
        let token = self.get_access_token().await?;
        let url = format!(
            "{GCS_API_BASE}/b/{bucket}/o/{}",
            Self::url_encode_object_name(object_name)
        );

        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS delete request failed: {e}"))?;

        // Idempotent on missing objects.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("delete", status, &body));
        }
        Ok(())
    }

    /// Rewrite the full metadata map on an object.  `metadata` values of
    /// `null` remove the key.
    async fn gcs_patch_metadata(
        &self,
        object_name: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        let token = self.get_access_token().await?;
        let url = format!(
            "{GCS_API_BASE}/b/{}/o/{}",
            self.bucket,
            Self::url_encode_object_name(object_name)
        );

        let resp = self
            .client
            .patch(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "metadata": metadata }))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS metadata patch request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("metadata patch", status, &body));
        }
        Ok(())
    }

    async fn gcs_compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> anyhow::Result<()> {
        let token = self.get_access_token().await?;
        let url = format!(
            "{GCS_API_BASE}/b/{bucket}/o/{}/compose",
            Self::url_encode_object_name(destination)
        );

        let body = ComposeRequest {
            source_objects: sources
                .iter()
                .map(|name| ComposeSourceObject { name: name.clone() })
                .collect(),
            destination: serde_json::json!({"contentType": "application/octet-stream"}),
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS compose request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("compose", status, &body));
        }
        Ok(())
    }

    /// Server-side copy between buckets (used to land composed MPU data
    /// in the data bucket).
    async fn gcs_copy(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
    ) -> anyhow::Result<()> {
        let token = self.get_access_token().await?;
        let url = format!(
            "{GCS_API_BASE}/b/{src_bucket}/o/{}/copyTo/b/{dst_bucket}/o/{}",
            Self::url_encode_object_name(src_object),
            Self::url_encode_object_name(dst_object)
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header("Content-Length", 0)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS copy request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("copy", status, &body));
        }
        Ok(())
    }

    /// Compose more than 32 parts by folding batches into intermediate
    /// objects.
    async fn chain_compose(
        &self,
        bucket: &str,
        sources: Vec<String>,
        destination: &str,
    ) -> anyhow::Result<Vec<String>> {
        let mut intermediates: Vec<String> = Vec::new();
        let mut current = sources;

        while current.len() > MAX_COMPOSE_SOURCES {
            let mut next: Vec<String> = Vec::new();
            for (i, chunk) in current.chunks(MAX_COMPOSE_SOURCES).enumerate() {
                let intermediate = format!("{destination}.compose-{i}-{}", intermediates.len());
                self.gcs_compose(bucket, chunk, &intermediate).await?;
                intermediates.push(intermediate.clone());
                next.push(intermediate);
            }
            current = next;
        }

        self.gcs_compose(bucket, &current, destination).await?;
        Ok(intermediates)
    }
}

impl BackendClient for GcpBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Gcp
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            mpu: true,
            tagging: true,
            copy_object: false,
            upload_part_copy: false,
        }
    }

    fn put(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutResult>> + Send + '_>> {
        let object_name = ctx.backend_key(self.bucket_match);
        // No distinct tag API: tags ride along in the metadata map.
        let metadata = ctx.native_metadata(true);
        Box::pin(async move {
            let e_tag = super::client::compute_etag(&data);

            debug!(
                "GCS put: bucket={} object={} bytes={}",
                self.bucket,
                object_name,
                data.len()
            );

            self.gcs_upload(&self.bucket, &object_name, &data, &metadata)
                .await?;

            Ok(PutResult {
                key: object_name,
                e_tag: Some(e_tag),
                data_store_version_id: None,
            })
        })
    }

    fn get(
        &self,
        info: &DataRetrievalInfo,
        range: Option<(u64, u64)>,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let object_name = info.key.clone();
        Box::pin(async move { self.gcs_download(&self.bucket, &object_name, range).await })
    }

    fn delete(
        &self,
        info: &DataRetrievalInfo,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let object_name = info.key.clone();
        Box::pin(async move { self.gcs_delete(&self.bucket, &object_name).await })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = HealthResult> + Send + '_>> {
        Box::pin(async move {
            let token = match self.get_access_token().await {
                Ok(t) => t,
                Err(e) => return HealthResult::failed(e),
            };
            let url = format!("{GCS_API_BASE}/b/{}", self.bucket);
            match self.client.get(&url).bearer_auth(&token).send().await {
                Ok(resp) if resp.status().is_success() => HealthResult::ok(),
                Ok(resp) => HealthResult {
                    code: resp.status().as_u16(),
                    message: "bucket probe failed".to_string(),
                    error: Some(format!("HTTP {}", resp.status())),
                },
                Err(e) => HealthResult::failed(e),
            }
        })
    }

    fn create_mpu(
        &self,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        Box::pin(async move {
            let upload_id = uuid::Uuid::new_v4().to_string();
            self.staged.write().await.insert(upload_id.clone(), Vec::new());
            Ok(upload_id)
        })
    }

    fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UploadedPart>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let part_name = Self::part_name(&upload_id, part_number);
            let e_tag = super::client::compute_etag(&data);
            let size = data.len() as u64;

            self.gcs_upload(&self.mpu_bucket, &part_name, &data, &HashMap::new())
                .await?;

            let part = UploadedPart {
                part_number,
                e_tag: e_tag.clone(),
                size: Some(size),
            };
            let mut staged = self.staged.write().await;
            let parts = staged.entry(upload_id).or_default();
            parts.retain(|p| p.part_number != part_number);
            parts.push(part.clone());
            parts.sort_by_key(|p| p.part_number);

            Ok(part)
        })
    }

    fn list_parts(
        &self,
        upload_id: &str,
        _ctx: &KeyContext,
        max_parts: u32,
        part_number_marker: u32,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PartListing>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let staged = self.staged.read().await;
            let mut parts: Vec<UploadedPart> = staged
                .get(&upload_id)
                .map(|v| {
                    v.iter()
                        .filter(|p| p.part_number > part_number_marker)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let is_truncated = parts.len() > max_parts as usize;
            parts.truncate(max_parts as usize);
            let next_part_number_marker =
                is_truncated.then(|| parts.last().map(|p| p.part_number).unwrap_or(0));

            Ok(PartListing {
                parts,
                is_truncated,
                next_part_number_marker,
            })
        })
    }

    fn complete_mpu(
        &self,
        upload_id: &str,
        parts: &[PartInput],
        ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CompletedMpu>> + Send + '_>> {
        use md5::{Digest, Md5};

        let object_name = ctx.backend_key(self.bucket_match);
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let staged_parts = {
                let staged = self.staged.read().await;
                staged.get(&upload_id).cloned().unwrap_or_default()
            };

            let mut sources = Vec::with_capacity(parts.len());
            let mut combined_md5: Vec<u8> = Vec::new();
            let mut content_length = 0u64;
            for part in &parts {
                let staged_part = staged_parts
                    .iter()
                    .find(|p| p.part_number == part.part_number)
                    .ok_or_else(|| {
                        anyhow::anyhow!("part {} was never staged", part.part_number)
                    })?;
                sources.push(Self::part_name(&upload_id, part.part_number));
                if let Ok(bytes) = hex::decode(staged_part.e_tag.trim_matches('"')) {
                    combined_md5.extend_from_slice(&bytes);
                }
                content_length += staged_part.size.unwrap_or(0);
            }

            // Compose into the MPU bucket, then land in the data bucket.
            let composed = format!(".parts/{upload_id}/composed");
            let intermediates = self
                .chain_compose(&self.mpu_bucket, sources.clone(), &composed)
                .await?;
            self.gcs_copy(&self.mpu_bucket, &composed, &self.bucket, &object_name)
                .await?;

            // Clean up staging objects; failures only leak temp objects.
            for name in sources.iter().chain(intermediates.iter()) {
                let _ = self.gcs_delete(&self.mpu_bucket, name).await;
            }
            let _ = self.gcs_delete(&self.mpu_bucket, &composed).await;

            let mut hasher = Md5::new();
            hasher.update(&combined_md5);
            let e_tag = format!("\"{}-{}\"", hex::encode(hasher.finalize()), parts.len());

            self.staged.write().await.remove(&upload_id);

            Ok(CompletedMpu {
                e_tag,
                content_length,
                data_store_version_id: None,
            })
        })
    }

    fn abort_mpu(
        &self,
        upload_id: &str,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let staged_parts = {
                let mut staged = self.staged.write().await;
                staged.remove(&upload_id).unwrap_or_default()
            };
            for part in staged_parts {
                let name = Self::part_name(&upload_id, part.part_number);
                self.gcs_delete(&self.mpu_bucket, &name).await?;
            }
            Ok(())
        })
    }

    fn put_tagging(
        &self,
        info: &DataRetrievalInfo,
        ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let object_name = info.key.clone();
        // Full-map rewrite: user metadata plus the new tag set.
        let metadata = serde_json::to_value(ctx.native_metadata(true)).unwrap_or_default();
        Box::pin(async move { self.gcs_patch_metadata(&object_name, metadata).await })
    }

    fn delete_tagging(
        &self,
        info: &DataRetrievalInfo,
        ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let object_name = info.key.clone();
        // Full-map rewrite with the current tag keys nulled out so the
        // patch removes them; untagged metadata survives.
        let mut metadata = serde_json::Map::new();
        for (k, v) in ctx.native_metadata(false) {
            metadata.insert(k, serde_json::Value::String(v));
        }
        if let Some(tags) = ctx.tagging.as_deref().and_then(super::client::parse_tagging) {
            for (k, _) in tags {
                metadata.insert(format!("tag-{k}"), serde_json::Value::Null);
            }
        }
        Box::pin(async move {
            self.gcs_patch_metadata(&object_name, serde_json::Value::Object(metadata))
                .await
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> LocationDetails {
        LocationDetails {
            bucket_name: "gcs-bucket".to_string(),
            mpu_bucket_name: "gcs-mpu".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_part_name_layout() {
        assert_eq!(GcpBackend::part_name("u-1", 7), ".parts/u-1/00007");
    }

    #[test]
    fn test_mpu_bucket_falls_back_to_data_bucket() {
        let mut d = details();
        d.mpu_bucket_name.clear();
        let backend = GcpBackend::new("gcp-main", &d).unwrap();
        assert_eq!(backend.mpu_bucket, "gcs-bucket");
    }

    #[test]
    fn test_object_name_encoding() {
        assert_eq!(
            GcpBackend::url_encode_object_name("bucket/key with spaces"),
            "bucket%2Fkey%20with%20spaces"
        );
    }

    #[test]
    fn test_capabilities_include_tagging_via_metadata() {
        let backend = GcpBackend::new("gcp-main", &details()).unwrap();
        let caps = backend.capabilities();
        assert!(caps.mpu);
        assert!(caps.tagging);
        assert!(!caps.copy_object);
    }
}
