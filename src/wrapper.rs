//! Top-level data path used by the request handlers.
//!
//! The wrapper fronts either the multi-backend gateway or, when the
//! process is configured with a single backend, that backend directly.
//! It owns payload hashing, the optional cipher piping, the retrying
//! delete, and the bounded-concurrency batch delete with the
//! overwrite-skip policy for external stores.

use base64::Engine;
use bytes::Bytes;
use futures::stream::StreamExt;
use md5::{Digest, Md5};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::backends::client::{
    BackendClient, DataRetrievalInfo, KeyContext, RetrievalRef,
};
use crate::errors::S3Error;
use crate::gateway::MultiBackendGateway;
use crate::kms::{CipherMeta, Kms};

/// Delete attempts: initial try plus two retries.
const DELETE_ATTEMPTS: u32 = 3;

/// Batch-delete fan-out bound.
const BATCH_DELETE_CONCURRENCY: usize = 5;

/// Request method driving a batch delete; PUT overwrites are subject to
/// the overwrite-skip policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Put,
    Delete,
}

/// Active data client: the gateway, or one pinned backend.
#[derive(Clone)]
pub enum DataClient {
    Multiple(Arc<MultiBackendGateway>),
    Single(Arc<dyn BackendClient>),
}

/// Top-level dispatcher over the data plane.
pub struct DataWrapper {
    client: tokio::sync::RwLock<DataClient>,
    kms: Arc<dyn Kms>,
}

impl DataWrapper {
    pub fn new(client: DataClient, kms: Arc<dyn Kms>) -> Self {
        Self {
            client: tokio::sync::RwLock::new(client),
            kms,
        }
    }

    /// Replace the active client, returning the previous one (test seam).
    pub async fn switch(&self, new_client: DataClient) -> DataClient {
        let mut client = self.client.write().await;
        std::mem::replace(&mut *client, new_client)
    }

    async fn client(&self) -> DataClient {
        self.client.read().await.clone()
    }

    /// Store a payload.
    ///
    /// The MD5 of the plaintext is always computed; when the caller
    /// supplied a `Content-MD5` header it is checked against the
    /// completed hash, and a mismatch triggers a background delete of
    /// the just-written record plus `BadDigest`.  When `sse_master_key`
    /// is set the payload is piped through a KMS cipher bundle and the
    /// wrapped key material is stamped onto the returned record.
    ///
    /// Returns the retrieval record and the computed MD5 (hex).
    pub async fn put(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        location: &str,
        content_md5_b64: Option<&str>,
        sse_master_key: Option<&str>,
        req_id: &str,
    ) -> Result<(DataRetrievalInfo, String), S3Error> {
        let mut hasher = Md5::new();
        hasher.update(&data);
        let computed_md5 = hex::encode(hasher.finalize());

        // Decode the declared digest up front so a malformed header
        // fails before any backend write.
        let declared = match content_md5_b64 {
            Some(header) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(header)
                    .map_err(|_| S3Error::InvalidDigest)?;
                if decoded.len() != 16 {
                    return Err(S3Error::InvalidDigest);
                }
                Some(hex::encode(decoded))
            }
            None => None,
        };

        // Encryption is piped before the backend sees any bytes.
        let (payload, cipher_meta) = match sse_master_key {
            Some(master_key_id) => {
                let bundle = self
                    .kms
                    .create_cipher_bundle(master_key_id)
                    .await
                    .map_err(|e| S3Error::internal("KMS cipher bundle", e))?;
                let ciphered = bundle
                    .pipe(data)
                    .map_err(|e| S3Error::internal("cipher pipe", e))?;
                (ciphered, bundle.meta())
            }
            None => (data, None),
        };

        let mut info = match self.client().await {
            DataClient::Multiple(gateway) => gateway.put(payload, ctx, location, req_id).await?,
            DataClient::Single(client) => {
                let size = payload.len() as u64;
                let result = client
                    .put(payload, ctx, req_id)
                    .await
                    .map_err(|e| S3Error::internal("backend put", e))?;
                let mut info = DataRetrievalInfo::new(
                    result.key,
                    client.location(),
                    client.backend_type(),
                    size,
                );
                info.e_tag = result.e_tag.clone();
                info.data_store_e_tag = result.e_tag;
                info.data_store_version_id = result.data_store_version_id;
                info
            }
        };

        if let Some(CipherMeta {
            ciphered_data_key,
            crypto_scheme,
            master_key_id,
        }) = cipher_meta
        {
            info.ciphered_data_key = Some(ciphered_data_key);
            info.crypto_scheme = Some(crypto_scheme);
            info.master_key_id = Some(master_key_id);
        }

        if let Some(declared) = declared {
            if declared != computed_md5 {
                warn!(
                    "content hash mismatch on {}/{}: declared {declared}, computed {computed_md5}",
                    ctx.bucket_name, ctx.object_key
                );
                // Compensating delete of the offending write only.
                self.batch_delete(
                    vec![info],
                    RequestMethod::Delete,
                    None,
                    req_id,
                )
                .await;
                return Err(S3Error::BadDigest);
            }
        }

        Ok((info, computed_md5))
    }

    /// Read a payload back, deciphering when the record carries wrapped
    /// key material.  The first byte of the requested range is passed to
    /// the KMS so CTR keystreams stay aligned.
    pub async fn get(
        &self,
        reference: &RetrievalRef,
        range: Option<(u64, u64)>,
        req_id: &str,
    ) -> Result<Bytes, S3Error> {
        let data = match self.client().await {
            DataClient::Multiple(gateway) => gateway.get(reference, range, req_id).await?,
            DataClient::Single(client) => {
                let info = match reference {
                    RetrievalRef::Record(info) => info.clone(),
                    RetrievalRef::Legacy(key) => DataRetrievalInfo::new(
                        key.clone(),
                        client.location(),
                        client.backend_type(),
                        0,
                    ),
                };
                client
                    .get(&info, range, req_id)
                    .await
                    .map_err(|e| S3Error::internal("backend get", e))?
            }
        };

        if let RetrievalRef::Record(info) = reference {
            if let (Some(ciphered_data_key), Some(crypto_scheme), Some(master_key_id)) = (
                info.ciphered_data_key.clone(),
                info.crypto_scheme,
                info.master_key_id.clone(),
            ) {
                let meta = CipherMeta {
                    ciphered_data_key,
                    crypto_scheme,
                    master_key_id,
                };
                let offset = range.map(|(first, _)| first).unwrap_or(0);
                let bundle = self
                    .kms
                    .create_decipher_bundle(&meta, offset)
                    .await
                    .map_err(|e| S3Error::internal("KMS decipher bundle", e))?;
                return bundle
                    .pipe(data)
                    .map_err(|e| S3Error::internal("decipher pipe", e));
            }
        }

        Ok(data)
    }

    /// Delete with retries: a small state machine over
    /// `{attempt_count, last_error}` rather than recursion.
    pub async fn delete(&self, reference: &RetrievalRef, req_id: &str) -> Result<(), S3Error> {
        let mut attempt = 0u32;
        let mut last_error: Option<S3Error> = None;

        while attempt < DELETE_ATTEMPTS {
            attempt += 1;
            let result = match self.client().await {
                DataClient::Multiple(gateway) => gateway.delete(reference, req_id).await,
                DataClient::Single(client) => {
                    let info = match reference {
                        RetrievalRef::Record(info) => info.clone(),
                        RetrievalRef::Legacy(key) => DataRetrievalInfo::new(
                            key.clone(),
                            client.location(),
                            client.backend_type(),
                            0,
                        ),
                    };
                    client
                        .delete(&info, req_id)
                        .await
                        .map_err(|e| S3Error::internal("backend delete", e))
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("delete attempt {attempt}/{DELETE_ATTEMPTS} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| S3Error::InternalError(anyhow::anyhow!("delete retries exhausted"))))
    }

    /// Delete a set of retrieval records with bounded concurrency.
    ///
    /// Overwrite-skip policy: on a PUT whose destination location
    /// matches an existing record on an external backend, that record is
    /// NOT deleted -- the external store already overwrote the object in
    /// place, and a follow-up delete would destroy the fresh write.
    /// Errors are logged, never propagated: a failed cleanup must not
    /// fail the enclosing request.
    pub async fn batch_delete(
        &self,
        records: Vec<DataRetrievalInfo>,
        method: RequestMethod,
        new_location: Option<&str>,
        req_id: &str,
    ) {
        let to_delete: Vec<DataRetrievalInfo> = records
            .into_iter()
            .filter(|info| {
                let skip = method == RequestMethod::Put
                    && info.data_store_type.is_external()
                    && new_location == Some(info.data_store_name.as_str());
                if skip {
                    debug!(
                        "skipping delete of overwritten external record {} on {}",
                        info.key, info.data_store_name
                    );
                }
                !skip
            })
            .collect();

        futures::stream::iter(to_delete.into_iter().map(|info| async move {
            let reference = RetrievalRef::Record(info);
            if let Err(e) = self.delete(&reference, req_id).await {
                if let RetrievalRef::Record(info) = &reference {
                    error!(
                        "batch delete failed for key {} on {}: {e}",
                        info.key, info.data_store_name
                    );
                }
            }
        }))
        .buffer_unordered(BATCH_DELETE_CONCURRENCY)
        .collect::<Vec<()>>()
        .await;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::client::BackendType;
    use crate::backends::memory::MemoryBackend;
    use crate::kms::NoopKms;
    use crate::locations::LocationRegistry;

    fn wrapper_with(locations: &[&str]) -> (DataWrapper, Arc<MultiBackendGateway>) {
        let clients: Vec<Arc<dyn BackendClient>> = locations
            .iter()
            .map(|name| Arc::new(MemoryBackend::new(name)) as Arc<dyn BackendClient>)
            .collect();
        let gateway = Arc::new(MultiBackendGateway::new(Arc::new(
            LocationRegistry::from_clients(clients, locations[0]),
        )));
        (
            DataWrapper::new(DataClient::Multiple(gateway.clone()), Arc::new(NoopKms)),
            gateway,
        )
    }

    fn md5_b64(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    }

    #[tokio::test]
    async fn test_put_computes_md5() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let (info, md5) = wrapper
            .put(Bytes::from("hello world"), &ctx, "mem-a", None, None, "r")
            .await
            .unwrap();
        assert_eq!(md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(info.e_tag.as_deref(), Some("\"5eb63bbbe01eeed093cb22bb8f5acdc3\""));
    }

    #[tokio::test]
    async fn test_put_with_matching_content_md5() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let declared = md5_b64(b"payload");
        wrapper
            .put(
                Bytes::from("payload"),
                &ctx,
                "mem-a",
                Some(&declared),
                None,
                "r",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_bad_digest_deletes_write() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let declared = md5_b64(b"different payload");
        let err = wrapper
            .put(
                Bytes::from("payload"),
                &ctx,
                "mem-a",
                Some(&declared),
                None,
                "r",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BadDigest");
    }

    #[tokio::test]
    async fn test_put_invalid_digest_rejected_before_write() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let err = wrapper
            .put(
                Bytes::from("payload"),
                &ctx,
                "mem-a",
                Some("not base64!!!"),
                None,
                "r",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidDigest");
    }

    #[tokio::test]
    async fn test_get_round_trip() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let (info, _) = wrapper
            .put(Bytes::from("round trip"), &ctx, "mem-a", None, None, "r")
            .await
            .unwrap();
        let data = wrapper
            .get(&RetrievalRef::Record(info), None, "r")
            .await
            .unwrap();
        assert_eq!(data, Bytes::from("round trip"));
    }

    #[tokio::test]
    async fn test_delete_then_get_fails() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let (info, _) = wrapper
            .put(Bytes::from("doomed"), &ctx, "mem-a", None, None, "r")
            .await
            .unwrap();
        let reference = RetrievalRef::Record(info);
        wrapper.delete(&reference, "r").await.unwrap();
        assert!(wrapper.get(&reference, None, "r").await.is_err());
    }

    #[tokio::test]
    async fn test_batch_delete_removes_internal_records() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let (info, _) = wrapper
            .put(Bytes::from("old"), &ctx, "mem-a", None, None, "r")
            .await
            .unwrap();
        let reference = RetrievalRef::Record(info.clone());

        wrapper
            .batch_delete(vec![info], RequestMethod::Put, Some("mem-a"), "r")
            .await;
        // Internal backends are not subject to the skip policy.
        assert!(wrapper.get(&reference, None, "r").await.is_err());
    }

    #[tokio::test]
    async fn test_overwrite_skip_for_external_same_location() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let (mut info, _) = wrapper
            .put(Bytes::from("still here"), &ctx, "mem-a", None, None, "r")
            .await
            .unwrap();
        // Pretend the record lives on an external store.
        info.data_store_type = BackendType::AwsS3;
        let reference = RetrievalRef::Record(info.clone());

        // Same-location PUT overwrite: the old record must survive.
        wrapper
            .batch_delete(vec![info.clone()], RequestMethod::Put, Some("mem-a"), "r")
            .await;
        assert!(wrapper.get(&reference, None, "r").await.is_ok());

        // Cross-location PUT: deletion proceeds.
        wrapper
            .batch_delete(vec![info.clone()], RequestMethod::Put, Some("mem-b"), "r")
            .await;
        assert!(wrapper.get(&reference, None, "r").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_requests_never_skip() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let ctx = KeyContext::new("bucket", "key.txt");
        let (mut info, _) = wrapper
            .put(Bytes::from("gone"), &ctx, "mem-a", None, None, "r")
            .await
            .unwrap();
        info.data_store_type = BackendType::AwsS3;
        let reference = RetrievalRef::Record(info.clone());

        wrapper
            .batch_delete(vec![info], RequestMethod::Delete, Some("mem-a"), "r")
            .await;
        assert!(wrapper.get(&reference, None, "r").await.is_err());
    }

    #[tokio::test]
    async fn test_switch_replaces_client() {
        let (wrapper, _) = wrapper_with(&["mem-a"]);
        let single: Arc<dyn BackendClient> = Arc::new(MemoryBackend::new("solo"));
        wrapper.switch(DataClient::Single(single)).await;

        let ctx = KeyContext::new("bucket", "key.txt");
        let (info, _) = wrapper
            .put(Bytes::from("solo write"), &ctx, "ignored", None, None, "r")
            .await
            .unwrap();
        assert_eq!(info.data_store_name, "solo");
    }
}
