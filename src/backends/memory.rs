//! In-memory data backend.
//!
//! Objects and multipart parts are held in `tokio::sync::RwLock<HashMap>`
//! maps keyed by generated data keys.  Every PUT creates a fresh key, so
//! re-writing an object never clobbers the record a concurrent reader
//! may still hold.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::client::{
    compute_etag, BackendClient, BackendType, Capabilities, CompletedMpu, DataRetrievalInfo,
    HealthResult, KeyContext, PartInput, PartListing, PutResult, UploadedPart,
};

/// In-process map backend.
pub struct MemoryBackend {
    location: String,
    /// data key -> bytes.
    objects: tokio::sync::RwLock<HashMap<String, Bytes>>,
    /// "upload_id/part_number" -> (bytes, etag).
    parts: tokio::sync::RwLock<HashMap<String, (Bytes, String)>>,
}

impl MemoryBackend {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            objects: tokio::sync::RwLock::new(HashMap::new()),
            parts: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Generate a fresh data key.
    fn generate_key() -> String {
        hex::encode(uuid::Uuid::new_v4().as_bytes())
    }

    fn part_key(upload_id: &str, part_number: u32) -> String {
        format!("{upload_id}/{part_number}")
    }
}

impl BackendClient for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Mem
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            mpu: true,
            tagging: false,
            copy_object: false,
            upload_part_copy: false,
        }
    }

    fn put(
        &self,
        data: Bytes,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<PutResult>> + Send + '_>> {
        Box::pin(async move {
            let key = Self::generate_key();
            let e_tag = compute_etag(&data);

            let mut objects = self.objects.write().await;
            objects.insert(key.clone(), data);

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
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let key = info.key.clone();
        Box::pin(async move {
            let objects = self.objects.read().await;
            let data = objects
                .get(&key)
                .ok_or_else(|| anyhow::anyhow!("no data found for key: {key}"))?;

            match range {
                Some((first, last)) => {
                    let last = std::cmp::min(last, data.len().saturating_sub(1) as u64);
                    if first > last {
                        anyhow::bail!("requested range [{first}, {last}] is not satisfiable");
                    }
                    Ok(data.slice(first as usize..=last as usize))
                }
                None => Ok(data.clone()),
            }
        })
    }

    fn delete(
        &self,
        info: &DataRetrievalInfo,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = info.key.clone();
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            objects.remove(&key);
            Ok(())
        })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = HealthResult> + Send + '_>> {
        Box::pin(async move { HealthResult::ok() })
    }

    fn create_mpu(
        &self,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        Box::pin(async move { Ok(uuid::Uuid::new_v4().to_string()) })
    }

    fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UploadedPart>> + Send + '_>> {
        let part_key = Self::part_key(upload_id, part_number);
        Box::pin(async move {
            let e_tag = compute_etag(&data);
            let size = data.len() as u64;

            let mut parts = self.parts.write().await;
            parts.insert(part_key, (data, e_tag.clone()));

            Ok(UploadedPart {
                part_number,
                e_tag,
                size: Some(size),
            })
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
        let prefix = format!("{upload_id}/");
        Box::pin(async move {
            let parts_map = self.parts.read().await;
            let mut listed: Vec<UploadedPart> = parts_map
                .iter()
                .filter_map(|(k, (data, e_tag))| {
                    let number: u32 = k.strip_prefix(&prefix)?.parse().ok()?;
                    (number > part_number_marker).then(|| UploadedPart {
                        part_number: number,
                        e_tag: e_tag.clone(),
                        size: Some(data.len() as u64),
                    })
                })
                .collect();
            listed.sort_by_key(|p| p.part_number);

            let is_truncated = listed.len() > max_parts as usize;
            listed.truncate(max_parts as usize);
            let next_part_number_marker =
                is_truncated.then(|| listed.last().map(|p| p.part_number).unwrap_or(0));

            Ok(PartListing {
                parts: listed,
                is_truncated,
                next_part_number_marker,
            })
        })
    }

    fn complete_mpu(
        &self,
        upload_id: &str,
        parts: &[PartInput],
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CompletedMpu>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let mut combined_data: Vec<u8> = Vec::new();
            let mut combined_md5_bytes: Vec<u8> = Vec::new();

            {
                let parts_map = self.parts.read().await;
                for part in &parts {
                    let part_key = Self::part_key(&upload_id, part.part_number);
                    let (data, e_tag) = parts_map
                        .get(&part_key)
                        .ok_or_else(|| anyhow::anyhow!("part not found: {part_key}"))?;
                    if e_tag.trim_matches('"') != part.e_tag.trim_matches('"') {
                        anyhow::bail!(
                            "part {} etag mismatch: stored {e_tag}, supplied {}",
                            part.part_number,
                            part.e_tag
                        );
                    }

                    let mut part_hasher = Md5::new();
                    part_hasher.update(data.as_ref());
                    combined_md5_bytes.extend_from_slice(&part_hasher.finalize());

                    combined_data.extend_from_slice(data.as_ref());
                }
            }

            // Composite ETag: MD5 of concatenated binary MD5s + "-{count}".
            let mut composite_hasher = Md5::new();
            composite_hasher.update(&combined_md5_bytes);
            let e_tag = format!(
                "\"{}-{}\"",
                hex::encode(composite_hasher.finalize()),
                parts.len()
            );

            let content_length = combined_data.len() as u64;
            let key = Self::generate_key();

            {
                let mut objects = self.objects.write().await;
                objects.insert(key, Bytes::from(combined_data));
            }

            // Drop staged parts now that the object is assembled.
            let prefix = format!("{upload_id}/");
            let mut parts_map = self.parts.write().await;
            parts_map.retain(|k, _| !k.starts_with(&prefix));

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
        let prefix = format!("{upload_id}/");
        Box::pin(async move {
            let mut parts = self.parts.write().await;
            parts.retain(|k, _| !k.starts_with(&prefix));
            Ok(())
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new("mem-main")
    }

    fn info_for(backend: &MemoryBackend, key: &str, size: u64) -> DataRetrievalInfo {
        DataRetrievalInfo::new(key.to_string(), backend.location(), BackendType::Mem, size)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let data = Bytes::from("hello world");

        let result = backend.put(data.clone(), &ctx, "req-1").await.unwrap();
        assert!(result.e_tag.as_deref().unwrap().starts_with('"'));

        let info = info_for(&backend, &result.key, data.len() as u64);
        let read = backend.get(&info, None, "req-1").await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_empty_object_etag() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "empty");
        let result = backend.put(Bytes::new(), &ctx, "req-1").await.unwrap();
        assert_eq!(
            result.e_tag.as_deref(),
            Some("\"d41d8cd98f00b204e9800998ecf8427e\"")
        );
    }

    #[tokio::test]
    async fn test_each_put_gets_fresh_key() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let a = backend.put(Bytes::from("v1"), &ctx, "r").await.unwrap();
        let b = backend.put(Bytes::from("v2"), &ctx, "r").await.unwrap();
        assert_ne!(a.key, b.key);
    }

    #[tokio::test]
    async fn test_get_range() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let result = backend
            .put(Bytes::from("0123456789"), &ctx, "r")
            .await
            .unwrap();
        let info = info_for(&backend, &result.key, 10);

        let slice = backend.get(&info, Some((2, 5)), "r").await.unwrap();
        assert_eq!(slice, Bytes::from("2345"));

        // Range end past the object is clamped.
        let tail = backend.get(&info, Some((8, 100)), "r").await.unwrap();
        assert_eq!(tail, Bytes::from("89"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let result = backend.put(Bytes::from("data"), &ctx, "r").await.unwrap();
        let info = info_for(&backend, &result.key, 4);

        backend.delete(&info, "r").await.unwrap();
        // Second delete of the same record must not error.
        backend.delete(&info, "r").await.unwrap();
        assert!(backend.get(&info, None, "r").await.is_err());
    }

    #[tokio::test]
    async fn test_mpu_assemble() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "big.bin");
        let upload_id = backend.create_mpu(&ctx, "r").await.unwrap();

        let p1 = backend
            .upload_part(&upload_id, 1, Bytes::from("hello "), &ctx, "r")
            .await
            .unwrap();
        let p2 = backend
            .upload_part(&upload_id, 2, Bytes::from("world"), &ctx, "r")
            .await
            .unwrap();

        let inputs = vec![
            PartInput {
                part_number: 1,
                e_tag: p1.e_tag.clone(),
            },
            PartInput {
                part_number: 2,
                e_tag: p2.e_tag.clone(),
            },
        ];
        let completed = backend
            .complete_mpu(&upload_id, &inputs, &ctx, "r")
            .await
            .unwrap();
        assert!(completed.e_tag.ends_with("-2\""));
        assert_eq!(completed.content_length, 11);
    }

    #[tokio::test]
    async fn test_list_parts_pagination() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "big.bin");
        let upload_id = backend.create_mpu(&ctx, "r").await.unwrap();
        for n in 1..=5u32 {
            backend
                .upload_part(&upload_id, n, Bytes::from(vec![n as u8]), &ctx, "r")
                .await
                .unwrap();
        }

        let page = backend.list_parts(&upload_id, &ctx, 2, 0, "r").await.unwrap();
        assert_eq!(page.parts.len(), 2);
        assert!(page.is_truncated);
        assert_eq!(page.next_part_number_marker, Some(2));

        let rest = backend.list_parts(&upload_id, &ctx, 10, 2, "r").await.unwrap();
        assert_eq!(rest.parts.len(), 3);
        assert!(!rest.is_truncated);
    }

    #[tokio::test]
    async fn test_abort_clears_parts() {
        let backend = backend();
        let ctx = KeyContext::new("bucket", "big.bin");
        let upload_id = backend.create_mpu(&ctx, "r").await.unwrap();
        backend
            .upload_part(&upload_id, 1, Bytes::from("part"), &ctx, "r")
            .await
            .unwrap();

        backend.abort_mpu(&upload_id, &ctx, "r").await.unwrap();
        let listing = backend.list_parts(&upload_id, &ctx, 10, 0, "r").await.unwrap();
        assert!(listing.parts.is_empty());
    }
}
