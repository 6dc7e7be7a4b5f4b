//! Metadata-plane contract.
//!
//! The metadata store itself is an external key-value service; the
//! gateway reaches it through this trait only: bucket records, object
//! versions, the shadow MPU listing, and the users-bucket index.
//!
//! The users-bucket index historically used two key layouts; removal
//! tolerates both splitters and treats "not found" as success so the
//! invisible-delete sweeper can replay it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::backends::client::DataRetrievalInfo;
use crate::versioning::VersioningState;

/// Internal bucket indexing owners to the buckets they own.
pub const USERS_BUCKET: &str = "users..bucket";

/// Current users-bucket key splitter.
pub const SPLITTER: &str = "..|..";

/// Legacy users-bucket key splitter, still tolerated on removal.
pub const LEGACY_SPLITTER: &str = "::";

/// Prefix under which in-flight MPU overview records live in the
/// shadow bucket.
pub const MPU_OVERVIEW_PREFIX: &str = "overview..|..";

/// Name of the hidden bucket tracking in-flight MPUs for `bucket`.
pub fn shadow_mpu_bucket(bucket: &str) -> String {
    format!("mpuShadowBucket{bucket}")
}

/// Server-side encryption configuration on a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseConfig {
    /// Only AES256 is recognised.
    pub algorithm: String,
    /// KMS master key backing the bucket.
    pub master_key_id: String,
}

/// Bucket metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketMd {
    pub name: String,
    pub owner: String,
    pub owner_display: String,
    pub location_constraint: String,
    #[serde(default)]
    pub versioning: VersioningState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse: Option<SseConfig>,
    /// Set while the bucket is being created.
    #[serde(default)]
    pub transient: bool,
    /// Set by the deletion pipeline before the final metadata delete;
    /// a crash leaves the bucket recoverable by the sweeper.
    #[serde(default)]
    pub deleted: bool,
    pub creation_date: String,
}

/// Object metadata record.  One record per version; the tip of a key is
/// its newest version (possibly a delete marker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMd {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default)]
    pub content_length: u64,
    /// Quoted MD5 ETag.
    pub e_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    /// `x-amz-meta-*` headers, full lowercased names.
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
    /// Tag set.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub owner_id: String,
    #[serde(default)]
    pub owner_display: String,
    /// Canned ACL (`private`, `public-read`, ...).
    #[serde(default = "default_acl")]
    pub acl: String,
    /// Physical location records holding the data.  Empty for delete
    /// markers.
    #[serde(default)]
    pub location: Vec<DataRetrievalInfo>,
    #[serde(default)]
    pub is_delete_marker: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_status: Option<String>,
    /// Location constraint the object was written with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_store_name: Option<String>,
    pub last_modified: String,
}

fn default_acl() -> String {
    "private".to_string()
}

/// Options controlling how a version is persisted.
#[derive(Debug, Clone, Default)]
pub struct PutVersionOptions {
    /// Versioning state of the target bucket.
    pub versioning: VersioningState,
    /// Externally supplied version id (replica writes).
    pub version_id: Option<String>,
}

type PinFut<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Async metadata-plane contract.
pub trait MetadataClient: Send + Sync + 'static {
    // ── Buckets ─────────────────────────────────────────────────────

    fn put_bucket(&self, md: BucketMd) -> PinFut<'_, ()>;

    fn get_bucket(&self, name: &str) -> PinFut<'_, Option<BucketMd>>;

    fn delete_bucket(&self, name: &str) -> PinFut<'_, ()>;

    // ── Object versions ─────────────────────────────────────────────

    /// Persist a version of `bucket/key` per `options`, returning the
    /// version id the record got (None on unversioned buckets).
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        md: ObjectMd,
        options: PutVersionOptions,
    ) -> PinFut<'_, Option<String>>;

    /// Fetch a version (None = the tip, delete markers included).
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> PinFut<'_, Option<ObjectMd>>;

    /// Remove a version (None = every version of the key).  Missing
    /// records are not an error.
    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> PinFut<'_, ()>;

    /// List up to `max_keys` versions and delete markers in a bucket.
    fn list_object_versions(
        &self,
        bucket: &str,
        max_keys: u32,
    ) -> PinFut<'_, Vec<(String, ObjectMd)>>;

    // ── Raw keyspaces (shadow MPU bucket, users bucket) ─────────────

    fn put_raw(&self, namespace: &str, key: &str, value: String) -> PinFut<'_, ()>;

    fn delete_raw(&self, namespace: &str, key: &str) -> PinFut<'_, ()>;

    fn list_raw_keys(
        &self,
        namespace: &str,
        prefix: &str,
        max_keys: u32,
    ) -> PinFut<'_, Vec<String>>;
}

/// Users-bucket helpers layered over the raw keyspace.
pub struct UsersIndex;

impl UsersIndex {
    pub fn key(canonical_id: &str, bucket: &str) -> String {
        format!("{canonical_id}{SPLITTER}{bucket}")
    }

    pub fn legacy_key(canonical_id: &str, bucket: &str) -> String {
        format!("{canonical_id}{LEGACY_SPLITTER}{bucket}")
    }

    /// Record `bucket` under its owner.
    pub async fn add(
        metadata: &dyn MetadataClient,
        canonical_id: &str,
        bucket: &str,
    ) -> anyhow::Result<()> {
        metadata
            .put_raw(USERS_BUCKET, &Self::key(canonical_id, bucket), String::new())
            .await
    }

    /// Detach `bucket` from its owner, tolerating both the current and
    /// the legacy key layout; "not found" in either is not an error.
    pub async fn remove(
        metadata: &dyn MetadataClient,
        canonical_id: &str,
        bucket: &str,
    ) -> anyhow::Result<()> {
        metadata
            .delete_raw(USERS_BUCKET, &Self::key(canonical_id, bucket))
            .await?;
        metadata
            .delete_raw(USERS_BUCKET, &Self::legacy_key(canonical_id, bucket))
            .await?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_bucket_name() {
        assert_eq!(shadow_mpu_bucket("photos"), "mpuShadowBucketphotos");
    }

    #[test]
    fn test_users_index_keys() {
        assert_eq!(UsersIndex::key("acct1", "b"), "acct1..|..b");
        assert_eq!(UsersIndex::legacy_key("acct1", "b"), "acct1::b");
    }

    #[test]
    fn test_object_md_wire_shape() {
        let md = ObjectMd {
            version_id: Some("v1".to_string()),
            content_length: 3,
            e_tag: "\"abc\"".to_string(),
            content_type: None,
            cache_control: None,
            content_disposition: None,
            content_encoding: None,
            expires: None,
            user_metadata: HashMap::new(),
            tags: HashMap::new(),
            owner_id: "acct1".to_string(),
            owner_display: "acct1".to_string(),
            acl: "private".to_string(),
            location: vec![],
            is_delete_marker: false,
            replication_status: Some("REPLICA".to_string()),
            data_store_name: None,
            last_modified: "2026-01-01T00:00:00.000Z".to_string(),
        };
        let json = serde_json::to_value(&md).unwrap();
        assert_eq!(json["versionId"], "v1");
        assert_eq!(json["replicationStatus"], "REPLICA");
        assert_eq!(json["isDeleteMarker"], false);

        let back: ObjectMd = serde_json::from_value(json).unwrap();
        assert_eq!(back.version_id.as_deref(), Some("v1"));
    }
}
