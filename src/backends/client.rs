//! Abstract data backend trait and the records that flow through it.
//!
//! Every backend must implement [`BackendClient`].  The trait works in
//! terms of opaque byte payloads plus a [`KeyContext`] describing the
//! logical object, so callers never see provider-native naming.
//!
//! Optional capabilities (`copyObject`, `uploadPartCopy`, `uploadPart`,
//! tagging) are advertised via [`Capabilities`]; the default method
//! bodies fail, and the gateway checks the flags before dispatching so
//! unsupported operations surface as `NotImplemented` rather than a
//! backend error.

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Backend type tag carried on every retrieval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Mem,
    File,
    Scality,
    AwsS3,
    Azure,
    Gcp,
    Cdmi,
}

impl BackendType {
    /// Parse a configuration type string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mem" => Some(BackendType::Mem),
            "file" => Some(BackendType::File),
            "scality" => Some(BackendType::Scality),
            "aws_s3" => Some(BackendType::AwsS3),
            "azure" => Some(BackendType::Azure),
            "gcp" => Some(BackendType::Gcp),
            "cdmi" => Some(BackendType::Cdmi),
            _ => None,
        }
    }

    /// The configuration / wire form of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Mem => "mem",
            BackendType::File => "file",
            BackendType::Scality => "scality",
            BackendType::AwsS3 => "aws_s3",
            BackendType::Azure => "azure",
            BackendType::Gcp => "gcp",
            BackendType::Cdmi => "cdmi",
        }
    }

    /// External cloud providers overwrite keys in place, which drives
    /// the overwrite-skip policy on re-PUT.
    pub fn is_external(&self) -> bool {
        matches!(self, BackendType::AwsS3 | BackendType::Azure | BackendType::Gcp)
    }
}

/// The opaque record returned by a successful PUT and consumed by a
/// subsequent GET/DELETE.  Serialized into object metadata and onto the
/// replication wire, hence the camelCase field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRetrievalInfo {
    /// Backend-native object identifier.
    pub key: String,
    /// Location constraint that holds the data.
    pub data_store_name: String,
    /// Backend type tag.
    pub data_store_type: BackendType,
    /// Stored size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_store_version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_store_e_tag: Option<String>,
    /// Wrapped data key, present when server-side encryption is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphered_data_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_scheme: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key_id: Option<String>,
}

impl DataRetrievalInfo {
    /// A minimal record for a freshly written object.
    pub fn new(key: String, location: &str, backend_type: BackendType, size: u64) -> Self {
        Self {
            key,
            data_store_name: location.to_string(),
            data_store_type: backend_type,
            size,
            e_tag: None,
            data_store_version_id: None,
            data_store_e_tag: None,
            ciphered_data_key: None,
            crypto_scheme: None,
            master_key_id: None,
        }
    }
}

/// Reference to stored data: either a full retrieval record, or a bare
/// backend key from records that predate `dataStoreName` (routed to the
/// `legacy` client).
#[derive(Debug, Clone)]
pub enum RetrievalRef {
    Record(DataRetrievalInfo),
    Legacy(String),
}

/// Logical description of the object being written.
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub bucket_name: String,
    pub object_key: String,
    /// Canonical id of the owner, when known.
    pub owner: Option<String>,
    /// `x-amz-meta-*` headers, full lowercased names.  Backends strip
    /// the prefix when mapping to native metadata.
    pub meta_headers: HashMap<String, String>,
    /// Query-string-encoded tag set (`k=v&k2=v2`).
    pub tagging: Option<String>,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    /// Externally supplied version id (replica writes).
    pub version_id: Option<String>,
    /// Replication status to stamp on the write (`REPLICA`).
    pub replication_status: Option<String>,
}

impl KeyContext {
    pub fn new(bucket_name: &str, object_key: &str) -> Self {
        Self {
            bucket_name: bucket_name.to_string(),
            object_key: object_key.to_string(),
            ..Default::default()
        }
    }

    /// Derive the backend-native key.  With `bucket_match` the remote
    /// bucket maps 1:1 to one gateway bucket and the object key is used
    /// alone; otherwise gateway buckets are multiplexed onto one remote
    /// bucket and the key is prefixed with the bucket name.  This choice
    /// is fixed per location and never changes for the life of an object.
    pub fn backend_key(&self, bucket_match: bool) -> String {
        if bucket_match {
            self.object_key.clone()
        } else {
            format!("{}/{}", self.bucket_name, self.object_key)
        }
    }

    /// Native metadata map: `x-amz-meta-` prefixes stripped, tag set
    /// merged under `tag-` keys when `merge_tags` is set (backends
    /// without a distinct tagging API).
    pub fn native_metadata(&self, merge_tags: bool) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for (name, value) in &self.meta_headers {
            let stripped = name
                .strip_prefix("x-amz-meta-")
                .unwrap_or(name.as_str())
                .to_string();
            out.insert(stripped, value.clone());
        }
        if merge_tags {
            if let Some(ref tagging) = self.tagging {
                for (k, v) in parse_tagging(tagging).unwrap_or_default() {
                    out.insert(format!("tag-{k}"), v);
                }
            }
        }
        out
    }
}

/// Parse a query-string-encoded tag set.  Returns `None` on malformed
/// input (empty keys, missing separators).
pub fn parse_tagging(tagging: &str) -> Option<Vec<(String, String)>> {
    if tagging.is_empty() {
        return Some(Vec::new());
    }
    let mut tags = Vec::new();
    for pair in tagging.split('&') {
        let (k, v) = pair.split_once('=')?;
        if k.is_empty() {
            return None;
        }
        let k = percent_encoding::percent_decode_str(k)
            .decode_utf8()
            .ok()?
            .into_owned();
        let v = percent_encoding::percent_decode_str(v)
            .decode_utf8()
            .ok()?
            .into_owned();
        tags.push((k, v));
    }
    Some(tags)
}

/// Compute the quoted MD5-hex ETag for a byte slice.  Empty bodies hash
/// to `"d41d8cd98f00b204e9800998ecf8427e"`.
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Result of a backend PUT.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Backend-native key the data landed under.
    pub key: String,
    /// Quoted MD5 ETag of the written bytes.
    pub e_tag: Option<String>,
    /// Version id assigned by the remote store, if versioned.
    pub data_store_version_id: Option<String>,
}

/// One uploaded part.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub e_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Part reference supplied to complete-MPU.
#[derive(Debug, Clone, Deserialize)]
pub struct PartInput {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub e_tag: String,
}

/// Page of parts from list-parts.
#[derive(Debug, Clone)]
pub struct PartListing {
    pub parts: Vec<UploadedPart>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// Result of completing an MPU.
#[derive(Debug, Clone)]
pub struct CompletedMpu {
    /// Composite ETag (`"{md5}-{count}"`).
    pub e_tag: String,
    pub content_length: u64,
    /// Version id assigned by the remote store, if versioned.
    pub data_store_version_id: Option<String>,
}

/// In-band health probe result. `check_health` never fails; transport
/// errors are reported in the `error` field.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthResult {
    pub fn ok() -> Self {
        Self {
            code: 200,
            message: "OK".to_string(),
            error: None,
        }
    }

    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self {
            code: 500,
            message: "unreachable".to_string(),
            error: Some(err.to_string()),
        }
    }
}

/// Optional-capability flags per backend variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub mpu: bool,
    pub tagging: bool,
    pub copy_object: bool,
    pub upload_part_copy: bool,
}

type PinFut<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Async data backend contract.
pub trait BackendClient: Send + Sync + 'static {
    /// Backend type tag for this client.
    fn backend_type(&self) -> BackendType;

    /// Location constraint this client serves.
    fn location(&self) -> &str;

    /// Optional-capability flags.
    fn capabilities(&self) -> Capabilities;

    /// Write `data` for the object described by `ctx`, returning the
    /// native key and quoted MD5 ETag.
    fn put(&self, data: Bytes, ctx: &KeyContext, req_id: &str) -> PinFut<'_, PutResult>;

    /// Read the object back.  `range` is an inclusive `[first, last]`
    /// byte pair.
    fn get(
        &self,
        info: &DataRetrievalInfo,
        range: Option<(u64, u64)>,
        req_id: &str,
    ) -> PinFut<'_, Bytes>;

    /// Delete the object. Implementations are idempotent on "not found"
    /// so the invisible bucket sweeper can replay deletions.
    fn delete(&self, info: &DataRetrievalInfo, req_id: &str) -> PinFut<'_, ()>;

    /// Probe the backend. Never fails; errors come back in-band.
    fn check_health(&self) -> Pin<Box<dyn Future<Output = HealthResult> + Send + '_>>;

    // ── Multipart (optional, see `Capabilities::mpu`) ───────────────

    fn create_mpu(&self, ctx: &KeyContext, req_id: &str) -> PinFut<'_, String> {
        let _ = (ctx, req_id);
        Box::pin(async move { anyhow::bail!("multipart upload is not supported by this backend") })
    }

    fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        ctx: &KeyContext,
        req_id: &str,
    ) -> PinFut<'_, UploadedPart> {
        let _ = (upload_id, part_number, data, ctx, req_id);
        Box::pin(async move { anyhow::bail!("multipart upload is not supported by this backend") })
    }

    fn list_parts(
        &self,
        upload_id: &str,
        ctx: &KeyContext,
        max_parts: u32,
        part_number_marker: u32,
        req_id: &str,
    ) -> PinFut<'_, PartListing> {
        let _ = (upload_id, ctx, max_parts, part_number_marker, req_id);
        Box::pin(async move { anyhow::bail!("multipart upload is not supported by this backend") })
    }

    fn complete_mpu(
        &self,
        upload_id: &str,
        parts: &[PartInput],
        ctx: &KeyContext,
        req_id: &str,
    ) -> PinFut<'_, CompletedMpu> {
        let _ = (upload_id, parts, ctx, req_id);
        Box::pin(async move { anyhow::bail!("multipart upload is not supported by this backend") })
    }

    fn abort_mpu(&self, upload_id: &str, ctx: &KeyContext, req_id: &str) -> PinFut<'_, ()> {
        let _ = (upload_id, ctx, req_id);
        Box::pin(async move { anyhow::bail!("multipart upload is not supported by this backend") })
    }

    // ── Tagging (optional, see `Capabilities::tagging`) ─────────────

    fn put_tagging(
        &self,
        info: &DataRetrievalInfo,
        ctx: &KeyContext,
        req_id: &str,
    ) -> PinFut<'_, ()> {
        let _ = (info, ctx, req_id);
        Box::pin(async move { anyhow::bail!("object tagging is not supported by this backend") })
    }

    fn delete_tagging(
        &self,
        info: &DataRetrievalInfo,
        ctx: &KeyContext,
        req_id: &str,
    ) -> PinFut<'_, ()> {
        let _ = (info, ctx, req_id);
        Box::pin(async move { anyhow::bail!("object tagging is not supported by this backend") })
    }

    // ── Server-side copy (optional) ─────────────────────────────────

    fn copy_object(
        &self,
        src_info: &DataRetrievalInfo,
        dst_ctx: &KeyContext,
        req_id: &str,
    ) -> PinFut<'_, PutResult> {
        let _ = (src_info, dst_ctx, req_id);
        Box::pin(async move { anyhow::bail!("server-side copy is not supported by this backend") })
    }

    fn upload_part_copy(
        &self,
        src_info: &DataRetrievalInfo,
        upload_id: &str,
        part_number: u32,
        dst_ctx: &KeyContext,
        req_id: &str,
    ) -> PinFut<'_, UploadedPart> {
        let _ = (src_info, upload_id, part_number, dst_ctx, req_id);
        Box::pin(async move { anyhow::bail!("server-side copy is not supported by this backend") })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_round_trip() {
        for tag in ["mem", "file", "scality", "aws_s3", "azure", "gcp", "cdmi"] {
            let parsed = BackendType::parse(tag).unwrap();
            assert_eq!(parsed.as_str(), tag);
        }
        assert!(BackendType::parse("s3").is_none());
    }

    #[test]
    fn test_external_backends() {
        assert!(BackendType::AwsS3.is_external());
        assert!(BackendType::Azure.is_external());
        assert!(BackendType::Gcp.is_external());
        assert!(!BackendType::Mem.is_external());
        assert!(!BackendType::File.is_external());
        assert!(!BackendType::Scality.is_external());
    }

    #[test]
    fn test_backend_key_bucket_match() {
        let ctx = KeyContext::new("photos", "2026/cat.jpg");
        assert_eq!(ctx.backend_key(true), "2026/cat.jpg");
        assert_eq!(ctx.backend_key(false), "photos/2026/cat.jpg");
    }

    #[test]
    fn test_native_metadata_strips_prefix() {
        let mut ctx = KeyContext::new("b", "k");
        ctx.meta_headers
            .insert("x-amz-meta-color".to_string(), "blue".to_string());
        ctx.meta_headers
            .insert("x-amz-meta-shape".to_string(), "round".to_string());
        let native = ctx.native_metadata(false);
        assert_eq!(native.get("color").map(String::as_str), Some("blue"));
        assert_eq!(native.get("shape").map(String::as_str), Some("round"));
        assert!(!native.keys().any(|k| k.starts_with("x-amz-meta-")));
    }

    #[test]
    fn test_native_metadata_merges_tags() {
        let mut ctx = KeyContext::new("b", "k");
        ctx.tagging = Some("env=prod&team=core".to_string());
        let native = ctx.native_metadata(true);
        assert_eq!(native.get("tag-env").map(String::as_str), Some("prod"));
        assert_eq!(native.get("tag-team").map(String::as_str), Some("core"));
    }

    #[test]
    fn test_parse_tagging() {
        assert_eq!(
            parse_tagging("a=1&b=2").unwrap(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
        assert_eq!(parse_tagging("").unwrap(), vec![]);
        assert!(parse_tagging("novalue").is_none());
        assert!(parse_tagging("=orphan").is_none());
    }

    #[test]
    fn test_compute_etag_empty() {
        assert_eq!(compute_etag(b""), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[test]
    fn test_retrieval_info_wire_shape() {
        let info = DataRetrievalInfo::new("b/k".to_string(), "aws-east", BackendType::AwsS3, 11);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["key"], "b/k");
        assert_eq!(json["dataStoreName"], "aws-east");
        assert_eq!(json["dataStoreType"], "aws_s3");
        assert!(json.get("eTag").is_none());
    }
}
