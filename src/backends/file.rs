//! Local filesystem data backend.
//!
//! Objects live in a content-addressed tree: each PUT generates a fresh
//! hex data key and stores the payload at `{root}/{k[0..2]}/{key}`, so
//! directories fan out evenly and re-writes never touch an existing
//! file.  All writes follow the temp-fsync-rename pattern.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;

use super::client::{
    compute_etag, BackendClient, BackendType, Capabilities, CompletedMpu, DataRetrievalInfo,
    HealthResult, KeyContext, PartInput, PartListing, PutResult, UploadedPart,
};

/// Stores objects on the local filesystem.
pub struct FileBackend {
    location: String,
    /// Root directory for the data tree.
    root: PathBuf,
}

impl FileBackend {
    /// Create a new `FileBackend` rooted at `root`.  The directory (and
    /// the `.tmp` staging area) is created if it does not exist.
    pub fn new(location: &str, root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self {
            location: location.to_string(),
            root,
        })
    }

    /// Generate a fresh data key.
    fn generate_key() -> String {
        hex::encode(uuid::Uuid::new_v4().as_bytes())
    }

    /// Resolve a data key to its fan-out path.  Rejects keys that are
    /// not plain hex to keep traversal out of the tree.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.len() < 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("invalid data key: {key}");
        }
        Ok(self.root.join(&key[0..2]).join(key))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(".tmp")
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    /// Write `data` to `final_path` via temp-fsync-rename.
    fn write_atomic(&self, final_path: &PathBuf, data: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.temp_path();
        if let Some(parent) = tmp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, final_path)?;
        Ok(())
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.root
            .join(".multipart")
            .join(upload_id)
            .join(part_number.to_string())
    }
}

impl BackendClient for FileBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::File
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
            let final_path = self.resolve(&key)?;

            self.write_atomic(&final_path, &data)?;

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
            let path = self.resolve(&key)?;
            if !path.exists() {
                anyhow::bail!("no data found for key: {key}");
            }

            let data = Bytes::from(std::fs::read(&path)?);
            match range {
                Some((first, last)) => {
                    let last = std::cmp::min(last, data.len().saturating_sub(1) as u64);
                    if first > last {
                        anyhow::bail!("requested range [{first}, {last}] is not satisfiable");
                    }
                    Ok(data.slice(first as usize..=last as usize))
                }
                None => Ok(data),
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
            let path = self.resolve(&key)?;
            // Idempotent: a missing file is not an error.
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            Ok(())
        })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = HealthResult> + Send + '_>> {
        Box::pin(async move {
            match self.root.metadata() {
                Ok(md) if md.is_dir() => HealthResult::ok(),
                Ok(_) => HealthResult::failed("data root is not a directory"),
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
            std::fs::create_dir_all(self.root.join(".multipart").join(&upload_id))?;
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
        let path = self.part_path(upload_id, part_number);
        Box::pin(async move {
            let e_tag = compute_etag(&data);
            let size = data.len() as u64;
            self.write_atomic(&path, &data)?;
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
        let dir = self.root.join(".multipart").join(upload_id);
        Box::pin(async move {
            let mut listed: Vec<UploadedPart> = Vec::new();
            if dir.exists() {
                for entry in std::fs::read_dir(&dir)? {
                    let entry = entry?;
                    let number: u32 = match entry.file_name().to_string_lossy().parse() {
                        Ok(n) => n,
                        Err(_) => continue,
                    };
                    if number <= part_number_marker {
                        continue;
                    }
                    let data = std::fs::read(entry.path())?;
                    listed.push(UploadedPart {
                        part_number: number,
                        e_tag: compute_etag(&data),
                        size: Some(data.len() as u64),
                    });
                }
            }
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

            for part in &parts {
                let path = self.part_path(&upload_id, part.part_number);
                if !path.exists() {
                    anyhow::bail!("part not found: {upload_id}/{}", part.part_number);
                }
                let data = std::fs::read(&path)?;

                let mut part_hasher = Md5::new();
                part_hasher.update(&data);
                combined_md5_bytes.extend_from_slice(&part_hasher.finalize());

                combined_data.extend_from_slice(&data);
            }

            let mut composite_hasher = Md5::new();
            composite_hasher.update(&combined_md5_bytes);
            let e_tag = format!(
                "\"{}-{}\"",
                hex::encode(composite_hasher.finalize()),
                parts.len()
            );

            let key = Self::generate_key();
            let final_path = self.resolve(&key)?;
            let content_length = combined_data.len() as u64;
            self.write_atomic(&final_path, &combined_data)?;

            let _ = std::fs::remove_dir_all(self.root.join(".multipart").join(&upload_id));

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
        let dir = self.root.join(".multipart").join(upload_id);
        Box::pin(async move {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let backend = FileBackend::new("file-main", dir.path()).unwrap();
        (dir, backend)
    }

    fn info_for(backend: &FileBackend, key: &str, size: u64) -> DataRetrievalInfo {
        DataRetrievalInfo::new(key.to_string(), backend.location(), BackendType::File, size)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, backend) = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let data = Bytes::from("file payload");

        let result = backend.put(data.clone(), &ctx, "r").await.unwrap();
        let info = info_for(&backend, &result.key, data.len() as u64);
        assert_eq!(backend.get(&info, None, "r").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_fanout_layout() {
        let (dir, backend) = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let result = backend.put(Bytes::from("x"), &ctx, "r").await.unwrap();

        let fanout = dir.path().join(&result.key[0..2]).join(&result.key);
        assert!(fanout.exists());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (_dir, backend) = backend();
        let info = info_for(&backend, "../escape", 0);
        assert!(backend.get(&info, None, "r").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (_dir, backend) = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let result = backend.put(Bytes::from("data"), &ctx, "r").await.unwrap();
        let info = info_for(&backend, &result.key, 4);

        backend.delete(&info, "r").await.unwrap();
        backend.delete(&info, "r").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_range() {
        let (_dir, backend) = backend();
        let ctx = KeyContext::new("bucket", "key.txt");
        let result = backend
            .put(Bytes::from("abcdefgh"), &ctx, "r")
            .await
            .unwrap();
        let info = info_for(&backend, &result.key, 8);
        let slice = backend.get(&info, Some((1, 3)), "r").await.unwrap();
        assert_eq!(slice, Bytes::from("bcd"));
    }

    #[tokio::test]
    async fn test_mpu_lifecycle() {
        let (_dir, backend) = backend();
        let ctx = KeyContext::new("bucket", "big.bin");
        let upload_id = backend.create_mpu(&ctx, "r").await.unwrap();

        let p1 = backend
            .upload_part(&upload_id, 1, Bytes::from("aaa"), &ctx, "r")
            .await
            .unwrap();
        let p2 = backend
            .upload_part(&upload_id, 2, Bytes::from("bbb"), &ctx, "r")
            .await
            .unwrap();

        let listing = backend.list_parts(&upload_id, &ctx, 10, 0, "r").await.unwrap();
        assert_eq!(listing.parts.len(), 2);

        let completed = backend
            .complete_mpu(
                &upload_id,
                &[
                    PartInput {
                        part_number: 1,
                        e_tag: p1.e_tag,
                    },
                    PartInput {
                        part_number: 2,
                        e_tag: p2.e_tag,
                    },
                ],
                &ctx,
                "r",
            )
            .await
            .unwrap();
        assert_eq!(completed.content_length, 6);
        assert!(completed.e_tag.ends_with("-2\""));

        // Parts are cleaned up after completion.
        let listing = backend.list_parts(&upload_id, &ctx, 10, 0, "r").await.unwrap();
        assert!(listing.parts.is_empty());
    }

    #[tokio::test]
    async fn test_healthcheck_ok() {
        let (_dir, backend) = backend();
        let health = backend.check_health().await;
        assert_eq!(health.code, 200);
        assert!(health.error.is_none());
    }
}
