//! Azure Blob Storage data backend.
//!
//! Talks to the Azure Blob REST API with `reqwest` and Shared Key
//! request signing.
//!
//! Multipart strategy uses Block Blob primitives:
//!   `upload_part()`   -> Put Block (staged on the final blob, no temp objects)
//!   `complete_mpu()`  -> Put Block List
//!   `abort_mpu()`     -> no-op at the data layer; uncommitted blocks
//!                        auto-expire, so callers must skip the usual
//!                        post-abort data delete (the gateway surfaces
//!                        this as `skip_data_delete`).
//!
//! Block IDs: `base64("{upload_id}:{part_number:05}")` -- including the
//! upload id keeps concurrent uploads to one key from colliding.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, CONTROLS};
use reqwest::StatusCode;
use sha2::Sha256;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use crate::config::LocationDetails;

use super::client::{
    BackendClient, BackendType, Capabilities, CompletedMpu, DataRetrievalInfo, HealthResult,
    KeyContext, PartInput, PartListing, PutResult, UploadedPart,
};

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Characters percent-encoded in blob URLs ('/' stays unencoded).
const BLOB_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Data backend that forwards operations to an Azure Blob container.
pub struct AzureBackend {
    location: String,
    client: reqwest::Client,
    /// The remote container name.
    container: String,
    /// Azure storage account name.
    account: String,
    /// Decoded shared key.
    key_bytes: Vec<u8>,
    /// Blob service endpoint.
    base_url: String,
    bucket_match: bool,
    /// Parts staged per in-flight upload, so complete can commit the
    /// block list and report the composite ETag without a round trip.
    staged: tokio::sync::RwLock<HashMap<String, Vec<UploadedPart>>>,
}

impl AzureBackend {
    pub fn new(location: &str, details: &LocationDetails) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        let account = details.azure_storage_account_name.clone();
        if account.is_empty() {
            anyhow::bail!("location {location}: azure_storage_account_name is required");
        }
        let key_bytes = BASE64_STANDARD
            .decode(&details.azure_storage_access_key)
            .map_err(|e| anyhow::anyhow!("location {location}: invalid Azure access key: {e}"))?;

        let base_url = format!("https://{account}.blob.core.windows.net");

        info!(
            "Azure backend initialized: location={} container={} account={}",
            location, details.bucket_name, account
        );

        Ok(Self {
            location: location.to_string(),
            client,
            container: details.bucket_name.clone(),
            account,
            key_bytes,
            base_url,
            bucket_match: details.bucket_match,
            staged: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    fn blob_url(&self, blob_name: &str) -> String {
        let encoded =
            percent_encoding::utf8_percent_encode(blob_name, BLOB_ENCODE_SET).to_string();
        format!("{}/{}/{}", self.base_url, self.container, encoded)
    }

    fn block_id(upload_id: &str, part_number: u32) -> String {
        BASE64_STANDARD.encode(format!("{upload_id}:{part_number:05}"))
    }

    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(std::time::SystemTime::now())
    }

    /// Sign a request with the Shared Key scheme and return the
    /// Authorization header value.
    fn sign_request(
        &self,
        method: &str,
        blob_name: &str,
        content_length: Option<usize>,
        content_type: &str,
        date: &str,
        extra_headers: &[(String, String)],
        query_params: &[(String, String)],
    ) -> anyhow::Result<String> {
        let content_length_str = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        // Canonicalized headers: all x-ms-* headers, lowercased, sorted.
        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        for (k, v) in extra_headers {
            let lk = k.to_lowercase();
            if lk.starts_with("x-ms-") && lk != "x-ms-date" && lk != "x-ms-version" {
                ms_headers.push((lk, v.clone()));
            }
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("\n");

        // Canonicalized resource uses the un-encoded blob name.
        let mut canonicalized_resource = if blob_name.is_empty() {
            format!("/{}/{}", self.account, self.container)
        } else {
            format!("/{}/{}/{}", self.account, self.container, blob_name)
        };
        if !query_params.is_empty() {
            let mut sorted = query_params.to_vec();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in &sorted {
                canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
            }
        }

        let string_to_sign = format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}\n{}",
            method, content_length_str, content_type, canonicalized_headers, canonicalized_resource
        );

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&self.key_bytes)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {e}"))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    fn map_azure_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow::anyhow!("Azure {context}: HTTP {status} - {body}")
    }

    /// Put Blob with native metadata and optional tag set.
    async fn azure_upload(
        &self,
        blob_name: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
        tagging: Option<&str>,
    ) -> anyhow::Result<()> {
        let url = self.blob_url(blob_name);
        let date = Self::rfc1123_date();
        let content_type = "application/octet-stream";

        let mut extra_headers =
            vec![("x-ms-blob-type".to_string(), "BlockBlob".to_string())];
        for (k, v) in metadata {
            extra_headers.push((format!("x-ms-meta-{k}"), v.clone()));
        }
        if let Some(tags) = tagging {
            extra_headers.push(("x-ms-tags".to_string(), tags.to_string()));
        }

        let auth = self.sign_request(
            "PUT",
            blob_name,
            Some(data.len()),
            content_type,
            &date,
            &extra_headers,
            &[],
        )?;

        let mut req = self
            .client
            .put(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Content-Type", content_type)
            .header("Authorization", auth)
            .body(data.to_vec());
        for (k, v) in &extra_headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure upload request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("upload", status, &body));
        }
        Ok(())
    }

    async fn azure_download(
        &self,
        blob_name: &str,
        range: Option<(u64, u64)>,
    ) -> anyhow::Result<Bytes> {
        let url = self.blob_url(blob_name);
        let date = Self::rfc1123_date();

        let mut extra_headers = Vec::new();
        if let Some((first, last)) = range {
            extra_headers.push(("x-ms-range".to_string(), format!("bytes={first}-{last}")));
        }

        let auth = self.sign_request("GET", blob_name, None, "", &date, &extra_headers, &[])?;

        let mut req = self
            .client
            .get(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", auth);
        for (k, v) in &extra_headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure download request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                anyhow::bail!("no data found for key: {blob_name}");
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("download", status, &body));
        }

        resp.bytes()
            .await
            .map_err(|e| anyhow::anyhow!("Azure download body read failed: {e}"))
    }

    async fn azure_delete(&self, blob_name: &str) -> anyhow::Result<()> {
        let url = self.blob_url(blob_name);
        let date = Self::rfc1123_date();
        let auth = self.sign_request("DELETE", blob_name, None, "", &date, &[], &[])?;

        let resp = self
            .client
            .delete(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure delete request failed: {e}"))?;

        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("delete", status, &body));
        }
        Ok(())
    }

    async fn azure_put_block(
        &self,
        blob_name: &str,
        block_id: &str,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let base_url = self.blob_url(blob_name);
        let encoded_block = percent_encoding::utf8_percent_encode(block_id, BLOB_ENCODE_SET);
        let url = format!("{base_url}?comp=block&blockid={encoded_block}");
        let date = Self::rfc1123_date();
        let content_type = "application/octet-stream";

        let query_params = vec![
            ("blockid".to_string(), block_id.to_string()),
            ("comp".to_string(), "block".to_string()),
        ];
        let auth = self.sign_request(
            "PUT",
            blob_name,
            Some(data.len()),
            content_type,
            &date,
            &[],
            &query_params,
        )?;

        let resp = self
            .client
            .put(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Content-Type", content_type)
            .header("Authorization", auth)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure put_block request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("put_block", status, &body));
        }
        Ok(())
    }

    async fn azure_put_block_list(
        &self,
        blob_name: &str,
        block_ids: &[String],
    ) -> anyhow::Result<()> {
        let base_url = self.blob_url(blob_name);
        let url = format!("{base_url}?comp=blocklist");
        let date = Self::rfc1123_date();
        let content_type = "application/xml";

        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in block_ids {
            body.push_str(&format!("<Uncommitted>{id}</Uncommitted>"));
        }
        body.push_str("</BlockList>");

        let query_params = vec![("comp".to_string(), "blocklist".to_string())];
        let auth = self.sign_request(
            "PUT",
            blob_name,
            Some(body.len()),
            content_type,
            &date,
            &[],
            &query_params,
        )?;

        let resp = self
            .client
            .put(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Content-Type", content_type)
            .header("Authorization", auth)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure put_block_list request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("put_block_list", status, &body));
        }
        Ok(())
    }

    /// Set the full tag set on a blob (`comp=tags`).  An empty list
    /// clears the tags.
    async fn azure_set_tags(
        &self,
        blob_name: &str,
        tags: &[(String, String)],
    ) -> anyhow::Result<()> {
        let base_url = self.blob_url(blob_name);
        let url = format!("{base_url}?comp=tags");
        let date = Self::rfc1123_date();
        let content_type = "application/xml; charset=UTF-8";

        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><Tags><TagSet>");
        for (k, v) in tags {
            body.push_str(&format!("<Tag><Key>{k}</Key><Value>{v}</Value></Tag>"));
        }
        body.push_str("</TagSet></Tags>");

        let query_params = vec![("comp".to_string(), "tags".to_string())];
        let auth = self.sign_request(
            "PUT",
            blob_name,
            Some(body.len()),
            content_type,
            &date,
            &[],
            &query_params,
        )?;

        let resp = self
            .client
            .put(&url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Content-Type", content_type)
            .header("Authorization", auth)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure set_tags request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_azure_error("set_tags", status, &body));
        }
        Ok(())
    }

    /// Composite ETag over staged part ETags, in the S3 MPU form.
    fn composite_etag(parts: &[UploadedPart]) -> String {
        use md5::{Digest, Md5};
        let mut combined: Vec<u8> = Vec::new();
        for part in parts {
            if let Ok(bytes) = hex::decode(part.e_tag.trim_matches('"')) {
                combined.extend_from_slice(&bytes);
            }
        }
        let mut hasher = Md5::new();
        hasher.update(&combined);
        format!("\"{}-{}\"", hex::encode(hasher.finalize()), parts.len())
    }
}

impl BackendClient for AzureBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Azure
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
        let blob_name = ctx.backend_key(self.bucket_match);
        let metadata = ctx.native_metadata(false);
        let tagging = ctx.tagging.clone();
        Box::pin(async move {
            let e_tag = super::client::compute_etag(&data);

            debug!(
                "Azure put: container={} blob={} bytes={}",
                self.container,
                blob_name,
                data.len()
            );

            self.azure_upload(&blob_name, &data, &metadata, tagging.as_deref())
                .await?;

            Ok(PutResult {
                key: blob_name,
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
        let blob_name = info.key.clone();
        Box::pin(async move { self.azure_download(&blob_name, range).await })
    }

    fn delete(
        &self,
        info: &DataRetrievalInfo,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let blob_name = info.key.clone();
        Box::pin(async move { self.azure_delete(&blob_name).await })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = HealthResult> + Send + '_>> {
        Box::pin(async move {
            let url = format!(
                "{}/{}?restype=container",
                self.base_url, self.container
            );
            let date = Self::rfc1123_date();
            let query_params = vec![("restype".to_string(), "container".to_string())];
            let auth =
                match self.sign_request("HEAD", "", None, "", &date, &[], &query_params) {
                    Ok(a) => a,
                    Err(e) => return HealthResult::failed(e),
                };

            let result = self
                .client
                .head(&url)
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION)
                .header("Authorization", auth)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => HealthResult::ok(),
                Ok(resp) => HealthResult {
                    code: resp.status().as_u16(),
                    message: "container probe failed".to_string(),
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
        ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UploadedPart>> + Send + '_>> {
        let blob_name = ctx.backend_key(self.bucket_match);
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let block_id = Self::block_id(&upload_id, part_number);
            let e_tag = super::client::compute_etag(&data);
            let size = data.len() as u64;

            self.azure_put_block(&blob_name, &block_id, &data).await?;

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
        let blob_name = ctx.backend_key(self.bucket_match);
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let staged_parts = {
                let staged = self.staged.read().await;
                staged.get(&upload_id).cloned().unwrap_or_default()
            };

            let mut committed: Vec<UploadedPart> = Vec::with_capacity(parts.len());
            let mut block_ids = Vec::with_capacity(parts.len());
            for part in &parts {
                let staged_part = staged_parts
                    .iter()
                    .find(|p| p.part_number == part.part_number)
                    .ok_or_else(|| {
                        anyhow::anyhow!("part {} was never staged", part.part_number)
                    })?;
                block_ids.push(Self::block_id(&upload_id, part.part_number));
                committed.push(staged_part.clone());
            }

            self.azure_put_block_list(&blob_name, &block_ids).await?;

            let content_length = committed.iter().map(|p| p.size.unwrap_or(0)).sum();
            let e_tag = Self::composite_etag(&committed);

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
        // Uncommitted blocks auto-expire; there is no data to delete and
        // callers are told to skip the follow-up delete.
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.staged.write().await.remove(&upload_id);
            Ok(())
        })
    }

    fn put_tagging(
        &self,
        info: &DataRetrievalInfo,
        ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let blob_name = info.key.clone();
        let tags = ctx
            .tagging
            .as_deref()
            .and_then(super::client::parse_tagging)
            .unwrap_or_default();
        Box::pin(async move { self.azure_set_tags(&blob_name, &tags).await })
    }

    fn delete_tagging(
        &self,
        info: &DataRetrievalInfo,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let blob_name = info.key.clone();
        Box::pin(async move { self.azure_set_tags(&blob_name, &[]).await })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
