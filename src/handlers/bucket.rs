//! Bucket-level handlers, centred on the deletion pipeline.
//!
//! Deletion is a sequential pipeline: emptiness check, in-flight MPU
//! check, mark (`deleted` set, `transient` cleared), detach from the
//! users-bucket index, finalise (metadata delete + KMS master-key
//! destruction for encrypted buckets).  A crash between stages leaves
//! the bucket marked `deleted`, where the invisible-delete sweeper can
//! finish the job.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::errors::S3Error;
use crate::handlers::object::now_iso8601;
use crate::metadata::store::{
    shadow_mpu_bucket, BucketMd, SseConfig, UsersIndex, MPU_OVERVIEW_PREFIX,
};
use crate::versioning::VersioningState;
use crate::AppState;

/// Header enabling per-bucket AES-256 server-side encryption at create
/// time.
pub const SSE_HEADER: &str = "x-amz-scal-server-side-encryption";

/// `PUT /{bucket}` -- Create a bucket.
#[utoipa::path(
    put,
    path = "/{bucket}",
    tag = "Bucket",
    operation_id = "CreateBucket",
    params(("bucket" = String, Path, description = "Bucket name")),
    responses(
        (status = 200, description = "Bucket created"),
        (status = 400, description = "Invalid location constraint")
    )
)]
pub async fn create_bucket(
    state: Arc<AppState>,
    bucket: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    // Location constraint comes from the create configuration XML or
    // falls back to the process default.
    let location = parse_create_configuration(body)
        .unwrap_or_else(|| state.gateway.registry().default_location().to_string());
    if !state.gateway.registry().is_registered(&location) {
        return Err(S3Error::InvalidArgument {
            message: format!("Location constraint {location} is not in your location config"),
        });
    }

    let sse = headers
        .get(SSE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| v.eq_ignore_ascii_case("AES256"))
        .map(|_| SseConfig {
            algorithm: "AES256".to_string(),
            master_key_id: uuid::Uuid::new_v4().to_string(),
        });

    let owner = headers
        .get("x-amz-canonical-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("account-default")
        .to_string();

    let md = BucketMd {
        name: bucket.to_string(),
        owner: owner.clone(),
        owner_display: owner.clone(),
        location_constraint: location,
        versioning: VersioningState::Unversioned,
        sse,
        transient: false,
        deleted: false,
        creation_date: now_iso8601(),
    };

    state
        .metadata
        .put_bucket(md)
        .await
        .map_err(S3Error::InternalError)?;
    UsersIndex::add(state.metadata.as_ref(), &owner, bucket)
        .await
        .map_err(S3Error::InternalError)?;

    Ok(StatusCode::OK.into_response())
}

/// Pull the LocationConstraint out of `<CreateBucketConfiguration>`.
fn parse_create_configuration(body: &[u8]) -> Option<String> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    if body.is_empty() {
        return None;
    }
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut in_location = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                in_location = e.name().as_ref() == b"LocationConstraint";
            }
            Ok(Event::Text(ref e)) if in_location => {
                return Some(e.unescape().unwrap_or_default().to_string());
            }
            Ok(Event::End(_)) => in_location = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// `PUT /{bucket}?versioning` -- Set the bucket versioning state.
pub async fn put_bucket_versioning(
    state: Arc<AppState>,
    bucket: &str,
    body: &[u8],
) -> Result<Response, S3Error> {
    let mut md = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;

    let text = String::from_utf8_lossy(body);
    md.versioning = if text.contains("<Status>Enabled</Status>") {
        VersioningState::Enabled
    } else if text.contains("<Status>Suspended</Status>") {
        VersioningState::Suspended
    } else {
        return Err(S3Error::MalformedXML);
    };

    state
        .metadata
        .put_bucket(md)
        .await
        .map_err(S3Error::InternalError)?;
    Ok(StatusCode::OK.into_response())
}

/// `DELETE /{bucket}` -- The deletion pipeline.
#[utoipa::path(
    delete,
    path = "/{bucket}",
    tag = "Bucket",
    operation_id = "DeleteBucket",
    params(("bucket" = String, Path, description = "Bucket name")),
    responses(
        (status = 204, description = "Bucket deleted"),
        (status = 404, description = "Bucket not found"),
        (status = 409, description = "Bucket not empty or MPU in progress")
    )
)]
pub async fn delete_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    let mut md = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;

    // 1. Emptiness: any version or delete marker blocks deletion.
    let versions = state
        .metadata
        .list_object_versions(bucket, 1)
        .await
        .map_err(S3Error::InternalError)?;
    if !versions.is_empty() {
        return Err(S3Error::BucketNotEmpty {
            bucket: bucket.to_string(),
        });
    }

    // 2. In-flight MPUs live in the shadow bucket under the overview
    //    prefix.
    let uploads = state
        .metadata
        .list_raw_keys(&shadow_mpu_bucket(bucket), MPU_OVERVIEW_PREFIX, 1)
        .await
        .map_err(S3Error::InternalError)?;
    if !uploads.is_empty() {
        return Err(S3Error::MPUinProgress {
            bucket: bucket.to_string(),
        });
    }

    // 3. Mark. A crash after this point leaves the bucket recoverable
    //    by the invisible-delete sweeper.
    md.transient = false;
    md.deleted = true;
    state
        .metadata
        .put_bucket(md.clone())
        .await
        .map_err(S3Error::InternalError)?;

    // 4. Detach from the owner's users-bucket index.
    UsersIndex::remove(state.metadata.as_ref(), &md.owner, bucket)
        .await
        .map_err(S3Error::InternalError)?;

    // 5. Finalise.
    state
        .metadata
        .delete_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?;
    if let Some(sse) = &md.sse {
        if sse.algorithm == "AES256" {
            state
                .kms
                .destroy_bucket_key(&sse.master_key_id)
                .await
                .map_err(|e| S3Error::internal("KMS destroy bucket key", e))?;
        }
    }

    info!("bucket {bucket} deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Sweeper path for buckets marked `deleted` whose finalisation never
/// completed: replays detach + finalise only, tolerating "not found"
/// throughout.  Failures end with a log entry and leave the bucket for
/// a later sweep.
pub async fn invisible_delete(state: &AppState, bucket: &str) {
    let md = match state.metadata.get_bucket(bucket).await {
        Ok(Some(md)) if md.deleted => md,
        Ok(_) => return,
        Err(e) => {
            warn!("invisible delete of {bucket}: bucket lookup failed: {e}");
            return;
        }
    };

    if let Err(e) = UsersIndex::remove(state.metadata.as_ref(), &md.owner, bucket).await {
        warn!("invisible delete of {bucket}: users index detach failed: {e}");
        return;
    }

    if let Err(e) = state.metadata.delete_bucket(bucket).await {
        warn!("invisible delete of {bucket}: metadata delete failed: {e}");
        return;
    }

    if let Some(sse) = &md.sse {
        if sse.algorithm == "AES256" {
            if let Err(e) = state.kms.destroy_bucket_key(&sse.master_key_id).await {
                warn!("invisible delete of {bucket}: master key destruction failed: {e}");
            }
        }
    }

    info!("invisible delete of {bucket} completed");
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::object::put_object;
    use crate::metadata::store::{UsersIndex, USERS_BUCKET};
    use crate::test_support::{seed_bucket, test_state};

    #[test]
    fn test_parse_create_configuration() {
        let body = br#"<CreateBucketConfiguration><LocationConstraint>mem-b</LocationConstraint></CreateBucketConfiguration>"#;
        assert_eq!(parse_create_configuration(body).as_deref(), Some("mem-b"));
        assert_eq!(parse_create_configuration(b""), None);
        assert_eq!(
            parse_create_configuration(b"<CreateBucketConfiguration/>"),
            None
        );
    }

    #[tokio::test]
    async fn test_delete_rejects_nonempty_then_succeeds() {
        let state = test_state(&[("mem-a", "remote-a")]).await;
        seed_bucket(&state, "b", "mem-a", VersioningState::Unversioned).await;

        put_object(state.clone(), "b", "x", &HeaderMap::new(), b"data")
            .await
            .unwrap();

        let err = delete_bucket(state.clone(), "b").await.unwrap_err();
        assert_eq!(err.code(), "BucketNotEmpty");

        crate::handlers::object::delete_object(
            state.clone(),
            "b",
            "x",
            &std::collections::HashMap::new(),
        )
        .await
        .unwrap();

        let resp = delete_bucket(state.clone(), "b").await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.metadata.get_bucket("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_rejects_inflight_mpu_with_distinct_code() {
        let state = test_state(&[("mem-a", "remote-a")]).await;
        seed_bucket(&state, "b", "mem-a", VersioningState::Unversioned).await;

        // Simulate an in-flight MPU overview record in the shadow bucket.
        state
            .metadata
            .put_raw(
                &shadow_mpu_bucket("b"),
                &format!("{MPU_OVERVIEW_PREFIX}big.bin"),
                String::new(),
            )
            .await
            .unwrap();

        let err = delete_bucket(state.clone(), "b").await.unwrap_err();
        assert_eq!(err.code(), "MPUinProgress");
    }

    #[tokio::test]
    async fn test_delete_detaches_users_index() {
        let state = test_state(&[("mem-a", "remote-a")]).await;
        seed_bucket(&state, "b", "mem-a", VersioningState::Unversioned).await;
        UsersIndex::add(state.metadata.as_ref(), "account-default", "b")
            .await
            .unwrap();
        // A stale legacy-layout entry is cleaned up too.
        state
            .metadata
            .put_raw(USERS_BUCKET, &UsersIndex::legacy_key("account-default", "b"), String::new())
            .await
            .unwrap();

        delete_bucket(state.clone(), "b").await.unwrap();

        let keys = state
            .metadata
            .list_raw_keys(USERS_BUCKET, "account-default", 10)
            .await
            .unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_invisible_delete_replays_finalisation() {
        let state = test_state(&[("mem-a", "remote-a")]).await;
        seed_bucket(&state, "b", "mem-a", VersioningState::Unversioned).await;

        // Simulate a crash after the mark stage.
        let mut md = state.metadata.get_bucket("b").await.unwrap().unwrap();
        md.deleted = true;
        state.metadata.put_bucket(md).await.unwrap();

        invisible_delete(&state, "b").await;
        assert!(state.metadata.get_bucket("b").await.unwrap().is_none());

        // Replaying against a gone bucket is a no-op.
        invisible_delete(&state, "b").await;
    }

    #[tokio::test]
    async fn test_invisible_delete_skips_unmarked_buckets() {
        let state = test_state(&[("mem-a", "remote-a")]).await;
        seed_bucket(&state, "b", "mem-a", VersioningState::Unversioned).await;

        invisible_delete(&state, "b").await;
        assert!(state.metadata.get_bucket("b").await.unwrap().is_some());
    }
}
