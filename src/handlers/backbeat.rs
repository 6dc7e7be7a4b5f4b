//! Internal replication surface ("backbeat").
//!
//! The replication worker pushes raw object data, object metadata, and
//! multipart fragments here, keyed by the source's version id.  Every
//! route validates the `x-scal-*` header contract and the location
//! coherence of the advertised storage class before touching any
//! backend, so a misconfigured worker cannot stampede data across
//! backend types.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::backends::client::{
    BackendType, DataRetrievalInfo, KeyContext, PartInput, RetrievalRef,
};
use crate::errors::S3Error;
use crate::handlers::object::now_iso8601;
use crate::metadata::store::{ObjectMd, PutVersionOptions};
use crate::versioning::{VersioningState, REPLICA_STATUS};
use crate::AppState;

// -- Header contract ----------------------------------------------------------

pub const STORAGE_TYPE_HEADER: &str = "x-scal-storage-type";
pub const STORAGE_CLASS_HEADER: &str = "x-scal-storage-class";
pub const VERSION_ID_HEADER: &str = "x-scal-version-id";
pub const CANONICAL_ID_HEADER: &str = "x-scal-canonical-id";
pub const PART_NUMBER_HEADER: &str = "x-scal-part-number";
pub const UPLOAD_ID_HEADER: &str = "x-scal-upload-id";
pub const REPLICATION_CONTENT_HEADER: &str = "x-scal-replication-content";

fn require_header(headers: &HeaderMap, name: &str) -> Result<String, S3Error> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| S3Error::InvalidRequest {
            message: format!("missing required header {name}"),
        })
}

fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Location coherence: the advertised storage class must be a
/// registered location of the advertised type, and its configured
/// remote bucket must match the request's bucket.
fn check_location_coherence(
    state: &AppState,
    storage_class: &str,
    storage_type: &str,
    bucket: &str,
) -> Result<(), S3Error> {
    let registry = state.gateway.registry();

    let expected = BackendType::parse(storage_type).ok_or_else(|| S3Error::InvalidRequest {
        message: format!("unknown storage type {storage_type}"),
    })?;

    let actual = registry
        .location_type(storage_class)
        .ok_or_else(|| S3Error::InvalidRequest {
            message: format!("storage class {storage_class} is not a registered location"),
        })?;

    if actual != expected {
        return Err(S3Error::InvalidRequest {
            message: format!(
                "storage class {storage_class} is of type {}, not {}",
                actual.as_str(),
                expected.as_str()
            ),
        });
    }

    let details = registry.details(storage_class);
    if details.map(|d| d.bucket_name.as_str()) != Some(bucket) {
        return Err(S3Error::InvalidRequest {
            message: format!(
                "storage class {storage_class} does not target bucket {bucket}"
            ),
        });
    }

    Ok(())
}

/// Require versioning to be enabled on the target bucket; replication
/// must not silently mutate a non-versioned bucket.
async fn require_versioned_bucket(
    state: &AppState,
    bucket: &str,
) -> Result<crate::metadata::store::BucketMd, S3Error> {
    let md = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;
    if !md.versioning.is_enabled() {
        return Err(S3Error::InvalidBucketState {
            message: format!("bucket {bucket} does not have versioning enabled"),
        });
    }
    Ok(md)
}

fn json_response(value: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        )],
        value.to_string(),
    )
        .into_response()
}

// -- Routes -------------------------------------------------------------------

/// `PUT /_/backbeat/data/{bucket}/{key}` -- raw replica data write.
///
/// Responds with the location records the worker stores back into the
/// source object's metadata.
pub async fn put_data(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let bucket_md = require_versioned_bucket(&state, bucket).await?;
    let content_md5 = require_header(headers, "content-md5")?;

    let ctx = KeyContext::new(bucket, key);
    let (info, _) = state
        .data
        .put(
            bytes::Bytes::copy_from_slice(body),
            &ctx,
            &bucket_md.location_constraint,
            Some(&content_md5),
            None,
            &req_id,
        )
        .await?;

    debug!("backbeat data write {}/{} -> {}", bucket, key, info.key);

    Ok(json_response(serde_json::json!([{
        "key": info.key,
        "dataStoreName": info.data_store_name,
    }])))
}

/// `PUT /_/backbeat/metadata/{bucket}/{key}` -- replica metadata write.
///
/// With `x-scal-replication-content: METADATA` the target object must
/// already exist and keeps its physical location; everything else in
/// the record is overwritten.  A missing target fails with
/// `ObjNotFound` so the worker retries as a full replication.
pub async fn put_metadata(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    require_versioned_bucket(&state, bucket).await?;

    let mut incoming: ObjectMd =
        serde_json::from_slice(body).map_err(|_| S3Error::MalformedPOSTRequest)?;
    incoming.replication_status = Some(REPLICA_STATUS.to_string());

    let metadata_only =
        optional_header(headers, REPLICATION_CONTENT_HEADER).as_deref() == Some("METADATA");
    if metadata_only {
        let existing = state
            .metadata
            .get_object(bucket, key, incoming.version_id.as_deref())
            .await
            .map_err(S3Error::InternalError)?
            .ok_or_else(|| S3Error::ObjNotFound {
                key: key.to_string(),
            })?;
        // The physical location is the one field the metadata-only
        // path must never touch.
        incoming.location = existing.location;
    }

    let version_id = incoming.version_id.clone();
    state
        .metadata
        .put_object(
            bucket,
            key,
            incoming,
            PutVersionOptions {
                versioning: VersioningState::Enabled,
                version_id,
            },
        )
        .await
        .map_err(S3Error::InternalError)?;

    Ok(json_response(serde_json::json!({})))
}

/// `/_/backbeat/multiplebackenddata/{bucket}/{key}?operation=...`
pub async fn multiple_backend_data(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    method: &axum::http::Method,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, S3Error> {
    let operation = query
        .get("operation")
        .map(String::as_str)
        .ok_or_else(|| S3Error::InvalidRequest {
            message: "missing operation query parameter".to_string(),
        })?;

    match (method.as_str(), operation) {
        ("PUT", "putobject") => put_object_replica(state, bucket, key, headers, body).await,
        ("PUT", "putpart") => put_part_replica(state, bucket, key, headers, body).await,
        ("POST", "initiatempu") => initiate_mpu_replica(state, bucket, key, headers).await,
        ("POST", "completempu") => complete_mpu_replica(state, bucket, key, headers, body).await,
        ("DELETE", "deleteobject") => delete_object_replica(state, bucket, key, headers).await,
        _ => Err(S3Error::InvalidRequest {
            message: format!("unsupported operation {operation} for method {method}"),
        }),
    }
}

/// `operation=putobject` -- full-object replica write.
async fn put_object_replica(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let storage_type = require_header(headers, STORAGE_TYPE_HEADER)?;
    let storage_class = require_header(headers, STORAGE_CLASS_HEADER)?;
    let version_id = require_header(headers, VERSION_ID_HEADER)?;
    let canonical_id = require_header(headers, CANONICAL_ID_HEADER)?;
    let content_md5 = require_header(headers, "content-md5")?;

    check_location_coherence(&state, &storage_class, &storage_type, bucket)?;

    let mut ctx = KeyContext::new(bucket, key);
    ctx.owner = Some(canonical_id.clone());
    ctx.version_id = Some(version_id.clone());
    ctx.replication_status = Some(REPLICA_STATUS.to_string());
    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_lowercase();
        if name_str.starts_with("x-amz-meta-") {
            if let Ok(val) = value.to_str() {
                ctx.meta_headers.insert(name_str, val.to_string());
            }
        }
    }

    let (info, md5_hex) = state
        .data
        .put(
            bytes::Bytes::copy_from_slice(body),
            &ctx,
            &storage_class,
            Some(&content_md5),
            None,
            &req_id,
        )
        .await?;

    // The replica version carries the source's version id verbatim.
    let md = ObjectMd {
        version_id: None,
        content_length: info.size,
        e_tag: format!("\"{md5_hex}\""),
        content_type: None,
        cache_control: None,
        content_disposition: None,
        content_encoding: None,
        expires: None,
        user_metadata: ctx.meta_headers.clone(),
        tags: HashMap::new(),
        owner_id: canonical_id.clone(),
        owner_display: canonical_id,
        acl: "private".to_string(),
        location: vec![info],
        is_delete_marker: false,
        replication_status: Some(REPLICA_STATUS.to_string()),
        data_store_name: Some(storage_class.clone()),
        last_modified: now_iso8601(),
    };

    let assigned = state
        .metadata
        .put_object(
            bucket,
            key,
            md,
            PutVersionOptions {
                versioning: VersioningState::Enabled,
                version_id: Some(version_id.clone()),
            },
        )
        .await
        .map_err(S3Error::InternalError)?;

    debug!(
        "backbeat putobject {}/{} replica version {:?}",
        bucket, key, assigned
    );

    Ok(json_response(serde_json::json!({ "versionId": version_id })))
}

/// `operation=putpart` -- MPU part relay.
async fn put_part_replica(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let storage_type = require_header(headers, STORAGE_TYPE_HEADER)?;
    let storage_class = require_header(headers, STORAGE_CLASS_HEADER)?;
    let upload_id = require_header(headers, UPLOAD_ID_HEADER)?;
    let part_number: u32 = require_header(headers, PART_NUMBER_HEADER)?
        .parse()
        .map_err(|_| S3Error::InvalidRequest {
            message: format!("{PART_NUMBER_HEADER} must be an integer"),
        })?;

    check_location_coherence(&state, &storage_class, &storage_type, bucket)?;

    let ctx = KeyContext::new(bucket, key);
    let part = state
        .gateway
        .upload_part(
            &upload_id,
            part_number,
            bytes::Bytes::copy_from_slice(body),
            &ctx,
            &storage_class,
            &req_id,
        )
        .await?;

    Ok(json_response(serde_json::json!({
        "partNumber": part.part_number,
        "ETag": part.e_tag,
    })))
}

/// `operation=initiatempu` -- open a native MPU on the target backend.
async fn initiate_mpu_replica(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let storage_type = require_header(headers, STORAGE_TYPE_HEADER)?;
    let storage_class = require_header(headers, STORAGE_CLASS_HEADER)?;
    let version_id = require_header(headers, VERSION_ID_HEADER)?;

    check_location_coherence(&state, &storage_class, &storage_type, bucket)?;

    let mut ctx = KeyContext::new(bucket, key);
    ctx.version_id = Some(version_id);
    ctx.replication_status = Some(REPLICA_STATUS.to_string());

    let upload_id = state.gateway.create_mpu(&ctx, &storage_class, &req_id).await?;

    Ok(json_response(serde_json::json!({ "uploadId": upload_id })))
}

/// `operation=completempu` -- commit a relayed MPU.
async fn complete_mpu_replica(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let storage_type = require_header(headers, STORAGE_TYPE_HEADER)?;
    let storage_class = require_header(headers, STORAGE_CLASS_HEADER)?;
    let upload_id = require_header(headers, UPLOAD_ID_HEADER)?;

    check_location_coherence(&state, &storage_class, &storage_type, bucket)?;

    let parts: Vec<PartInput> =
        serde_json::from_slice(body).map_err(|_| S3Error::MalformedPOSTRequest)?;

    let ctx = KeyContext::new(bucket, key);
    state
        .gateway
        .complete_mpu(&upload_id, &parts, &ctx, &storage_class, &req_id)
        .await?;

    Ok(json_response(serde_json::json!({})))
}

/// `operation=deleteobject` -- delete a replica by its native key.
async fn delete_object_replica(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let storage_type = require_header(headers, STORAGE_TYPE_HEADER)?;
    let storage_class = require_header(headers, STORAGE_CLASS_HEADER)?;

    check_location_coherence(&state, &storage_class, &storage_type, bucket)?;

    let backend_type =
        BackendType::parse(&storage_type).ok_or_else(|| S3Error::InvalidRequest {
            message: format!("unknown storage type {storage_type}"),
        })?;
    let info = DataRetrievalInfo::new(key.to_string(), &storage_class, backend_type, 0);
    state
        .data
        .delete(&RetrievalRef::Record(info), &req_id)
        .await?;

    Ok(json_response(serde_json::json!({})))
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use axum::http::HeaderValue;

    fn scal_headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(
                axum::http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    #[tokio::test]
    async fn test_coherence_rejects_type_mismatch() {
        // mem-remote is registered as `mem`; advertising aws_s3 must fail.
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        let err = check_location_coherence(&state, "mem-remote", "aws_s3", "replica-bucket")
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_coherence_rejects_bucket_mismatch() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        let err =
            check_location_coherence(&state, "mem-remote", "mem", "other-bucket").unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_coherence_accepts_matching_class() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        check_location_coherence(&state, "mem-remote", "mem", "replica-bucket").unwrap();
    }

    #[tokio::test]
    async fn test_missing_header_is_invalid_request() {
        let headers = scal_headers(&[(STORAGE_TYPE_HEADER, "mem")]);
        let err = require_header(&headers, STORAGE_CLASS_HEADER).unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
        assert!(err.to_string().contains(STORAGE_CLASS_HEADER));
    }

    // -- Replica flows over in-memory backends --------------------------------

    use crate::test_support::seed_bucket;
    use base64::Engine;
    use md5::{Digest, Md5};

    fn content_md5_b64(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    }

    #[tokio::test]
    async fn test_putobject_replica_carries_source_version_id() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        seed_bucket(
            &state,
            "replica-bucket",
            "mem-remote",
            crate::versioning::VersioningState::Enabled,
        )
        .await;

        let body = b"replicated bytes";
        let headers = scal_headers(&[
            (STORAGE_TYPE_HEADER, "mem"),
            (STORAGE_CLASS_HEADER, "mem-remote"),
            (VERSION_ID_HEADER, "source-v42"),
            (CANONICAL_ID_HEADER, "source-owner"),
            ("content-md5", &content_md5_b64(body)),
        ]);
        let mut query = HashMap::new();
        query.insert("operation".to_string(), "putobject".to_string());

        let resp = multiple_backend_data(
            state.clone(),
            "replica-bucket",
            "obj",
            &axum::http::Method::PUT,
            &headers,
            &query,
            body,
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The created version is externally visible under the source's
        // version id and is marked REPLICA.
        let md = state
            .metadata
            .get_object("replica-bucket", "obj", Some("source-v42"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(md.version_id.as_deref(), Some("source-v42"));
        assert_eq!(md.replication_status.as_deref(), Some(REPLICA_STATUS));
        assert_eq!(md.owner_id, "source-owner");
        assert_eq!(md.location.len(), 1);
    }

    #[tokio::test]
    async fn test_initiatempu_rejects_storage_type_mismatch() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        seed_bucket(
            &state,
            "replica-bucket",
            "mem-remote",
            crate::versioning::VersioningState::Enabled,
        )
        .await;

        let headers = scal_headers(&[
            (STORAGE_TYPE_HEADER, "aws_s3"),
            (STORAGE_CLASS_HEADER, "mem-remote"),
            (VERSION_ID_HEADER, "source-v1"),
        ]);
        let mut query = HashMap::new();
        query.insert("operation".to_string(), "initiatempu".to_string());

        let err = multiple_backend_data(
            state.clone(),
            "replica-bucket",
            "obj",
            &axum::http::Method::POST,
            &headers,
            &query,
            b"",
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_mpu_relay_roundtrip() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        seed_bucket(
            &state,
            "replica-bucket",
            "mem-remote",
            crate::versioning::VersioningState::Enabled,
        )
        .await;

        let init_headers = scal_headers(&[
            (STORAGE_TYPE_HEADER, "mem"),
            (STORAGE_CLASS_HEADER, "mem-remote"),
            (VERSION_ID_HEADER, "source-v1"),
        ]);
        let mut query = HashMap::new();
        query.insert("operation".to_string(), "initiatempu".to_string());
        let resp = multiple_backend_data(
            state.clone(),
            "replica-bucket",
            "obj",
            &axum::http::Method::POST,
            &init_headers,
            &query,
            b"",
        )
        .await
        .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let upload_id = parsed["uploadId"].as_str().unwrap().to_string();

        let part_headers = scal_headers(&[
            (STORAGE_TYPE_HEADER, "mem"),
            (STORAGE_CLASS_HEADER, "mem-remote"),
            (UPLOAD_ID_HEADER, &upload_id),
            (PART_NUMBER_HEADER, "1"),
        ]);
        query.insert("operation".to_string(), "putpart".to_string());
        let resp = multiple_backend_data(
            state.clone(),
            "replica-bucket",
            "obj",
            &axum::http::Method::PUT,
            &part_headers,
            &query,
            b"only part",
        )
        .await
        .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["partNumber"], 1);
        let e_tag = parsed["ETag"].as_str().unwrap().to_string();

        let complete_headers = scal_headers(&[
            (STORAGE_TYPE_HEADER, "mem"),
            (STORAGE_CLASS_HEADER, "mem-remote"),
            (UPLOAD_ID_HEADER, &upload_id),
        ]);
        query.insert("operation".to_string(), "completempu".to_string());
        let complete_body =
            serde_json::json!([{ "PartNumber": 1, "ETag": e_tag }]).to_string();
        let resp = multiple_backend_data(
            state.clone(),
            "replica-bucket",
            "obj",
            &axum::http::Method::POST,
            &complete_headers,
            &query,
            complete_body.as_bytes(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_data_route_requires_versioned_bucket() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        seed_bucket(
            &state,
            "replica-bucket",
            "mem-remote",
            crate::versioning::VersioningState::Unversioned,
        )
        .await;

        let body = b"bytes";
        let headers = scal_headers(&[("content-md5", &content_md5_b64(body))]);
        let err = put_data(state.clone(), "replica-bucket", "obj", &headers, body)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidBucketState");
    }

    #[tokio::test]
    async fn test_data_route_returns_location_record() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        seed_bucket(
            &state,
            "replica-bucket",
            "mem-remote",
            crate::versioning::VersioningState::Enabled,
        )
        .await;

        let body = b"bytes";
        let headers = scal_headers(&[("content-md5", &content_md5_b64(body))]);
        let resp = put_data(state.clone(), "replica-bucket", "obj", &headers, body)
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed[0]["dataStoreName"], "mem-remote");
        assert!(parsed[0]["key"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_metadata_only_requires_existing_target() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        seed_bucket(
            &state,
            "replica-bucket",
            "mem-remote",
            crate::versioning::VersioningState::Enabled,
        )
        .await;

        let incoming = serde_json::json!({
            "versionId": "source-v1",
            "eTag": "\"abc\"",
            "ownerId": "source-owner",
            "lastModified": "2026-01-01T00:00:00.000Z",
        });
        let headers = scal_headers(&[(REPLICATION_CONTENT_HEADER, "METADATA")]);
        let err = put_metadata(
            state.clone(),
            "replica-bucket",
            "obj",
            &headers,
            incoming.to_string().as_bytes(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ObjNotFound");
    }

    #[tokio::test]
    async fn test_metadata_only_preserves_location() {
        let state = test_state(&[("mem-remote", "replica-bucket")]).await;
        seed_bucket(
            &state,
            "replica-bucket",
            "mem-remote",
            crate::versioning::VersioningState::Enabled,
        )
        .await;

        // Seed a full replica first.
        let body = b"replicated bytes";
        let put_headers = scal_headers(&[
            (STORAGE_TYPE_HEADER, "mem"),
            (STORAGE_CLASS_HEADER, "mem-remote"),
            (VERSION_ID_HEADER, "source-v1"),
            (CANONICAL_ID_HEADER, "source-owner"),
            ("content-md5", &content_md5_b64(body)),
        ]);
        let mut query = HashMap::new();
        query.insert("operation".to_string(), "putobject".to_string());
        multiple_backend_data(
            state.clone(),
            "replica-bucket",
            "obj",
            &axum::http::Method::PUT,
            &put_headers,
            &query,
            body,
        )
        .await
        .unwrap();

        let original = state
            .metadata
            .get_object("replica-bucket", "obj", Some("source-v1"))
            .await
            .unwrap()
            .unwrap();

        // Metadata-only update rewrites everything but the location.
        let incoming = serde_json::json!({
            "versionId": "source-v1",
            "eTag": "\"abc\"",
            "ownerId": "source-owner",
            "userMetadata": { "x-amz-meta-new": "value" },
            "location": [],
            "lastModified": "2026-06-01T00:00:00.000Z",
        });
        let headers = scal_headers(&[(REPLICATION_CONTENT_HEADER, "METADATA")]);
        put_metadata(
            state.clone(),
            "replica-bucket",
            "obj",
            &headers,
            incoming.to_string().as_bytes(),
        )
        .await
        .unwrap();

        let updated = state
            .metadata
            .get_object("replica-bucket", "obj", Some("source-v1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            updated.user_metadata.get("x-amz-meta-new").map(String::as_str),
            Some("value")
        );
        assert_eq!(updated.location.len(), 1);
        assert_eq!(updated.location[0].key, original.location[0].key);
    }
}
