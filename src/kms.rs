//! Narrow contract with the external KMS / cipher subsystem.
//!
//! The gateway never implements cryptography itself.  When a bucket has
//! server-side encryption, the data wrapper asks the KMS collaborator
//! for a cipher bundle before writing and a decipher bundle before
//! reading; the bundle transforms the byte payload and reports the
//! wrapped key material to be stored on the retrieval record.
//!
//! CTR-mode alignment: the decipher bundle is created with the byte
//! offset of the first requested byte so range reads decrypt correctly.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// Key material recorded on a retrieval record for an encrypted write.
#[derive(Debug, Clone)]
pub struct CipherMeta {
    /// The data key, wrapped by the bucket master key.
    pub ciphered_data_key: String,
    /// Cipher scheme version.
    pub crypto_scheme: u8,
    /// Master key the data key is wrapped with.
    pub master_key_id: String,
}

/// A one-shot transform over a byte payload (encrypt or decrypt).
pub trait CipherBundle: Send + Sync {
    /// Transform `data`. For decipher bundles the construction offset
    /// determines keystream alignment.
    fn pipe(&self, data: Bytes) -> anyhow::Result<Bytes>;

    /// Key material to persist alongside the write. Decipher bundles
    /// return `None`.
    fn meta(&self) -> Option<CipherMeta>;
}

/// Async KMS contract.
pub trait Kms: Send + Sync + 'static {
    /// Create a cipher bundle for a new write under `master_key_id`.
    fn create_cipher_bundle(
        &self,
        master_key_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn CipherBundle>>> + Send + '_>>;

    /// Create a decipher bundle for stored key material, aligned to
    /// `first_byte_offset` of the requested range.
    fn create_decipher_bundle(
        &self,
        meta: &CipherMeta,
        first_byte_offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn CipherBundle>>> + Send + '_>>;

    /// Destroy a bucket's master key on bucket teardown.
    fn destroy_bucket_key(
        &self,
        master_key_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// KMS implementation used when encryption is off: bundles pass bytes
/// through unchanged and key destruction is a no-op.
pub struct NoopKms;

struct PassthroughBundle;

impl CipherBundle for PassthroughBundle {
    fn pipe(&self, data: Bytes) -> anyhow::Result<Bytes> {
        Ok(data)
    }

    fn meta(&self) -> Option<CipherMeta> {
        None
    }
}

impl Kms for NoopKms {
    fn create_cipher_bundle(
        &self,
        _master_key_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn CipherBundle>>> + Send + '_>> {
        Box::pin(async move { Ok(Box::new(PassthroughBundle) as Box<dyn CipherBundle>) })
    }

    fn create_decipher_bundle(
        &self,
        _meta: &CipherMeta,
        _first_byte_offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Box<dyn CipherBundle>>> + Send + '_>> {
        Box::pin(async move { Ok(Box::new(PassthroughBundle) as Box<dyn CipherBundle>) })
    }

    fn destroy_bucket_key(
        &self,
        _master_key_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_bundle_passes_bytes_through() {
        let kms = NoopKms;
        let bundle = kms.create_cipher_bundle("master-1").await.unwrap();
        let data = Bytes::from_static(b"plaintext");
        assert_eq!(bundle.pipe(data.clone()).unwrap(), data);
        assert!(bundle.meta().is_none());
    }

    #[tokio::test]
    async fn test_noop_destroy_is_ok() {
        let kms = NoopKms;
        kms.destroy_bucket_key("master-1").await.unwrap();
    }
}
