//! In-memory metadata client.
//!
//! Backs tests and single-node operation.  Versions of one key are held
//! oldest-to-newest; the tip is the last entry.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;

use crate::versioning::{generate_version_id, VersioningState, NULL_VERSION_ID};

use super::store::{BucketMd, MetadataClient, ObjectMd, PutVersionOptions};

/// In-process metadata store.
#[derive(Default)]
pub struct MemoryMetadata {
    buckets: tokio::sync::RwLock<HashMap<String, BucketMd>>,
    /// bucket -> key -> versions (oldest first).
    objects: tokio::sync::RwLock<HashMap<String, HashMap<String, Vec<ObjectMd>>>>,
    /// namespace -> sorted raw keys.
    raw: tokio::sync::RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataClient for MemoryMetadata {
    fn put_bucket(
        &self,
        md: BucketMd,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.buckets.write().await.insert(md.name.clone(), md);
            Ok(())
        })
    }

    fn get_bucket(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<BucketMd>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.buckets.read().await.get(&name).cloned()) })
    }

    fn delete_bucket(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            self.buckets.write().await.remove(&name);
            self.objects.write().await.remove(&name);
            Ok(())
        })
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut md: ObjectMd,
        options: PutVersionOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            let versions = objects
                .entry(bucket)
                .or_default()
                .entry(key)
                .or_default();

            match options.versioning {
                VersioningState::Unversioned => {
                    md.version_id = None;
                    versions.clear();
                    versions.push(md);
                    Ok(None)
                }
                VersioningState::Suspended => {
                    // Writes land on the single overwritable null version.
                    md.version_id = Some(NULL_VERSION_ID.to_string());
                    versions.retain(|v| v.version_id.as_deref() != Some(NULL_VERSION_ID));
                    versions.push(md);
                    Ok(Some(NULL_VERSION_ID.to_string()))
                }
                VersioningState::Enabled => {
                    let version_id = options
                        .version_id
                        .unwrap_or_else(generate_version_id);
                    md.version_id = Some(version_id.clone());
                    // A replica re-write of an existing version replaces
                    // it in place; anything else is a fresh tip.
                    if let Some(existing) = versions
                        .iter_mut()
                        .find(|v| v.version_id.as_deref() == Some(version_id.as_str()))
                    {
                        *existing = md;
                    } else {
                        versions.push(md);
                    }
                    Ok(Some(version_id))
                }
            }
        })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectMd>>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let version_id = version_id.map(|v| v.to_string());
        Box::pin(async move {
            let objects = self.objects.read().await;
            let versions = match objects.get(&bucket).and_then(|b| b.get(&key)) {
                Some(v) => v,
                None => return Ok(None),
            };
            let found = match version_id {
                Some(vid) => versions
                    .iter()
                    .find(|v| v.version_id.as_deref() == Some(vid.as_str())),
                None => versions.last(),
            };
            Ok(found.cloned())
        })
    }

    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        let version_id = version_id.map(|v| v.to_string());
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            if let Some(keys) = objects.get_mut(&bucket) {
                match version_id {
                    Some(vid) => {
                        if let Some(versions) = keys.get_mut(&key) {
                            versions.retain(|v| v.version_id.as_deref() != Some(vid.as_str()));
                            if versions.is_empty() {
                                keys.remove(&key);
                            }
                        }
                    }
                    None => {
                        keys.remove(&key);
                    }
                }
            }
            Ok(())
        })
    }

    fn list_object_versions(
        &self,
        bucket: &str,
        max_keys: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<(String, ObjectMd)>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            let mut out = Vec::new();
            if let Some(keys) = objects.get(&bucket) {
                let mut sorted: Vec<&String> = keys.keys().collect();
                sorted.sort();
                'outer: for key in sorted {
                    for version in &keys[key] {
                        out.push((key.clone(), version.clone()));
                        if out.len() >= max_keys as usize {
                            break 'outer;
                        }
                    }
                }
            }
            Ok(out)
        })
    }

    fn put_raw(
        &self,
        namespace: &str,
        key: &str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.raw
                .write()
                .await
                .entry(namespace)
                .or_default()
                .insert(key, value);
            Ok(())
        })
    }

    fn delete_raw(
        &self,
        namespace: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        Box::pin(async move {
            // Tolerant by contract: missing namespaces and keys are fine.
            if let Some(ns) = self.raw.write().await.get_mut(&namespace) {
                ns.remove(&key);
            }
            Ok(())
        })
    }

    fn list_raw_keys(
        &self,
        namespace: &str,
        prefix: &str,
        max_keys: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let namespace = namespace.to_string();
        let prefix = prefix.to_string();
        Box::pin(async move {
            let raw = self.raw.read().await;
            let keys = raw
                .get(&namespace)
                .map(|ns| {
                    ns.range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .take(max_keys as usize)
                        .map(|(k, _)| k.clone())
                        .collect()
                })
                .unwrap_or_default();
            Ok(keys)
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn object_md(etag: &str) -> ObjectMd {
        ObjectMd {
            version_id: None,
            content_length: 1,
            e_tag: etag.to_string(),
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
            replication_status: None,
            data_store_name: None,
            last_modified: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unversioned_overwrites() {
        let md = MemoryMetadata::new();
        let vid = md
            .put_object("b", "k", object_md("\"a\""), PutVersionOptions::default())
            .await
            .unwrap();
        assert!(vid.is_none());

        md.put_object("b", "k", object_md("\"b\""), PutVersionOptions::default())
            .await
            .unwrap();

        let tip = md.get_object("b", "k", None).await.unwrap().unwrap();
        assert_eq!(tip.e_tag, "\"b\"");

        let versions = md.list_object_versions("b", 100).await.unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn test_versioned_puts_stack() {
        let md = MemoryMetadata::new();
        let options = PutVersionOptions {
            versioning: VersioningState::Enabled,
            version_id: None,
        };
        let v1 = md
            .put_object("b", "k", object_md("\"a\""), options.clone())
            .await
            .unwrap()
            .unwrap();
        let v2 = md
            .put_object("b", "k", object_md("\"b\""), options)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(v1, v2);

        let tip = md.get_object("b", "k", None).await.unwrap().unwrap();
        assert_eq!(tip.version_id.as_deref(), Some(v2.as_str()));

        let old = md.get_object("b", "k", Some(&v1)).await.unwrap().unwrap();
        assert_eq!(old.e_tag, "\"a\"");
    }

    #[tokio::test]
    async fn test_supplied_version_id_is_kept_and_replayable() {
        let md = MemoryMetadata::new();
        let options = PutVersionOptions {
            versioning: VersioningState::Enabled,
            version_id: Some("replica-v7".to_string()),
        };
        let vid = md
            .put_object("b", "k", object_md("\"a\""), options.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vid, "replica-v7");

        // Re-writing the same version replaces it instead of stacking.
        md.put_object("b", "k", object_md("\"b\""), options)
            .await
            .unwrap();
        let versions = md.list_object_versions("b", 100).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].1.e_tag, "\"b\"");
    }

    #[tokio::test]
    async fn test_suspended_targets_null_version() {
        let md = MemoryMetadata::new();
        let enabled = PutVersionOptions {
            versioning: VersioningState::Enabled,
            version_id: None,
        };
        md.put_object("b", "k", object_md("\"a\""), enabled)
            .await
            .unwrap();

        let suspended = PutVersionOptions {
            versioning: VersioningState::Suspended,
            version_id: None,
        };
        let vid = md
            .put_object("b", "k", object_md("\"n1\""), suspended.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vid, NULL_VERSION_ID);

        // A second suspended write replaces the null version only.
        md.put_object("b", "k", object_md("\"n2\""), suspended)
            .await
            .unwrap();
        let versions = md.list_object_versions("b", 100).await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_version_then_key() {
        let md = MemoryMetadata::new();
        let options = PutVersionOptions {
            versioning: VersioningState::Enabled,
            version_id: None,
        };
        let v1 = md
            .put_object("b", "k", object_md("\"a\""), options.clone())
            .await
            .unwrap()
            .unwrap();
        md.put_object("b", "k", object_md("\"b\""), options)
            .await
            .unwrap();

        md.delete_object("b", "k", Some(&v1)).await.unwrap();
        assert!(md.get_object("b", "k", Some(&v1)).await.unwrap().is_none());
        assert!(md.get_object("b", "k", None).await.unwrap().is_some());

        md.delete_object("b", "k", None).await.unwrap();
        assert!(md.get_object("b", "k", None).await.unwrap().is_none());

        // Deleting a missing record is fine.
        md.delete_object("b", "k", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_keyspace_prefix_listing() {
        let md = MemoryMetadata::new();
        md.put_raw("shadow", "overview..|..k1", String::new())
            .await
            .unwrap();
        md.put_raw("shadow", "overview..|..k2", String::new())
            .await
            .unwrap();
        md.put_raw("shadow", "part..|..k1", String::new())
            .await
            .unwrap();

        let keys = md.list_raw_keys("shadow", "overview..|..", 10).await.unwrap();
        assert_eq!(keys.len(), 2);

        let one = md.list_raw_keys("shadow", "overview..|..", 1).await.unwrap();
        assert_eq!(one.len(), 1);

        md.delete_raw("shadow", "missing-key").await.unwrap();
        md.delete_raw("missing-namespace", "k").await.unwrap();
    }
}
