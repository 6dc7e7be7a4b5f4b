//! Object-level S3 API handlers, routed through the data wrapper.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::backends::client::{parse_tagging, KeyContext, RetrievalRef};
use crate::errors::S3Error;
use crate::metadata::store::ObjectMd;
use crate::resolver::{header_constraint, resolve_location};
use crate::versioning::VersioningState;
use crate::wrapper::RequestMethod;
use crate::AppState;

/// Ceiling on entries in a single multi-object delete request.
const MULTI_OBJECT_DELETE_MAX: usize = 1000;

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a Range header.
#[derive(Debug, Clone, PartialEq)]
enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-  (from start to end of object)
    StartOpen(u64),
    /// bytes=-N  (last N bytes)
    Suffix(u64),
}

/// Parse a Range header value like "bytes=0-4", "bytes=5-", "bytes=-3".
fn parse_range_header(range_str: &str) -> Option<ByteRange> {
    let range_str = range_str.trim();
    let spec = range_str.strip_prefix("bytes=")?;

    // Only a single range is supported.
    if spec.contains(',') {
        return None;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        if n == 0 {
            return None;
        }
        Some(ByteRange::Suffix(n))
    } else if let Some(stripped) = spec.strip_suffix('-') {
        let start: u64 = stripped.parse().ok()?;
        Some(ByteRange::StartOpen(start))
    } else if let Some((start_s, end_s)) = spec.split_once('-') {
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = end_s.parse().ok()?;
        if start > end {
            return None;
        }
        Some(ByteRange::StartEnd(start, end))
    } else {
        None
    }
}

/// Resolve a ByteRange against a total length. Returns inclusive
/// (first, last), or None if unsatisfiable.
fn resolve_range(range: &ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match range {
        ByteRange::StartEnd(start, end) => {
            if *start >= total {
                return None;
            }
            Some((*start, std::cmp::min(*end, total - 1)))
        }
        ByteRange::StartOpen(start) => {
            if *start >= total {
                return None;
            }
            Some((*start, total - 1))
        }
        ByteRange::Suffix(n) => {
            if *n >= total {
                Some((0, total - 1))
            } else {
                Some((total - n, total - 1))
            }
        }
    }
}

// -- Time helpers -------------------------------------------------------------

/// Get current time as ISO-8601 string.
pub fn now_iso8601() -> String {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs();
    let millis = since_epoch.subsec_millis();

    let days = secs / 86400;
    let day_secs = secs % 86400;
    let hours = day_secs / 3600;
    let minutes = (day_secs % 3600) / 60;
    let seconds = day_secs % 60;

    let (year, month, day) = days_to_ymd(days);

    format!("{year:04}-{month:02}-{day:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}Z")
}

/// Convert days since Unix epoch to (year, month, day).
fn days_to_ymd(days: u64) -> (i32, u32, u32) {
    let z = days as i64 + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if m <= 2 { y + 1 } else { y };
    (year as i32, m as u32, d as u32)
}

/// Convert (year, month, day) to days since Unix epoch.
fn ymd_to_days(year: i32, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year as i64 - 1 } else { year as i64 };
    let m = if month <= 2 { month as i64 + 9 } else { month as i64 - 3 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let doy = (153 * m as u64 + 2) / 5 + day as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe as i64 - 719468
}

/// Parse an ISO-8601 timestamp to SystemTime (second granularity).
fn parse_iso8601_to_system_time(iso: &str) -> Option<std::time::SystemTime> {
    if iso.len() < 19 {
        return None;
    }
    let year: i32 = iso[0..4].parse().ok()?;
    let month: u32 = iso[5..7].parse().ok()?;
    let day: u32 = iso[8..10].parse().ok()?;
    let hours: u32 = iso[11..13].parse().ok()?;
    let minutes: u32 = iso[14..16].parse().ok()?;
    let seconds: u32 = iso[17..19].parse().ok()?;

    let total_secs = ymd_to_days(year, month, day) as u64 * 86400
        + hours as u64 * 3600
        + minutes as u64 * 60
        + seconds as u64;
    Some(std::time::UNIX_EPOCH + std::time::Duration::from_secs(total_secs))
}

/// Convert an ISO-8601 timestamp to RFC 7231 for Last-Modified.
fn iso8601_to_http_date(iso: &str) -> String {
    match parse_iso8601_to_system_time(iso) {
        Some(t) => httpdate::fmt_http_date(t),
        None => httpdate::fmt_http_date(std::time::SystemTime::now()),
    }
}

// -- Header helpers -----------------------------------------------------------

/// Extract `x-amz-meta-*` headers (full lowercased names).
fn extract_user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_lowercase();
        if name_str.starts_with("x-amz-meta-") {
            if let Ok(val) = value.to_str() {
                meta.insert(name_str, val.to_string());
            }
        }
    }
    meta
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Strip the `aws-chunked` transport artifact from an outbound
/// Content-Encoding value (`"base64,aws-chunked"` becomes `"base64,"`).
fn strip_aws_chunked(encoding: &str) -> String {
    encoding.replace("aws-chunked", "")
}

fn strip_etag_quotes(etag: &str) -> &str {
    let etag = etag.trim();
    if etag.starts_with('"') && etag.ends_with('"') && etag.len() >= 2 {
        &etag[1..etag.len() - 1]
    } else {
        etag
    }
}

/// Build a KeyContext from request headers.
fn key_context_from_headers(bucket: &str, key: &str, headers: &HeaderMap) -> KeyContext {
    let mut ctx = KeyContext::new(bucket, key);
    ctx.meta_headers = extract_user_metadata(headers);
    ctx.tagging = header_string(headers, "x-amz-tagging");
    ctx.content_type = header_string(headers, "content-type");
    ctx.cache_control = header_string(headers, "cache-control");
    ctx.content_disposition = header_string(headers, "content-disposition");
    ctx.content_encoding = header_string(headers, "content-encoding");
    ctx
}

/// Build object metadata for a fresh write.
#[allow(clippy::too_many_arguments)]
fn object_md_for_write(
    ctx: &KeyContext,
    info: &crate::backends::client::DataRetrievalInfo,
    e_tag: String,
    owner_id: &str,
    acl: String,
    location: &str,
) -> ObjectMd {
    ObjectMd {
        version_id: None,
        content_length: info.size,
        e_tag,
        content_type: ctx.content_type.clone(),
        cache_control: ctx.cache_control.clone(),
        content_disposition: ctx.content_disposition.clone(),
        content_encoding: ctx.content_encoding.clone(),
        expires: None,
        user_metadata: ctx.meta_headers.clone(),
        tags: ctx
            .tagging
            .as_deref()
            .and_then(parse_tagging)
            .unwrap_or_default()
            .into_iter()
            .collect(),
        owner_id: owner_id.to_string(),
        owner_display: owner_id.to_string(),
        acl,
        location: vec![info.clone()],
        is_delete_marker: false,
        replication_status: ctx.replication_status.clone(),
        data_store_name: Some(location.to_string()),
        last_modified: now_iso8601(),
    }
}

/// The canonical id the (out-of-scope) auth layer resolved for this
/// request; defaults to the bucket owner when absent.
fn requester_id(headers: &HeaderMap, bucket_owner: &str) -> String {
    header_string(headers, "x-amz-canonical-id").unwrap_or_else(|| bucket_owner.to_string())
}

// -- Conditional copy evaluation ----------------------------------------------

/// Evaluate `x-amz-copy-source-if-*` headers against the source record.
///
/// Precedence follows the published CopyObject rules: a passing If-Match
/// short-circuits If-Unmodified-Since; a present If-None-Match
/// short-circuits If-Modified-Since.  Every failure is a 412 (copy has
/// no 304 path).
fn eval_copy_conditions(headers: &HeaderMap, src: &ObjectMd) -> Result<(), S3Error> {
    let src_etag = strip_etag_quotes(&src.e_tag);
    let last_modified = parse_iso8601_to_system_time(&src.last_modified);

    if let Some(if_match) = header_string(headers, "x-amz-copy-source-if-match") {
        let wanted = strip_etag_quotes(&if_match);
        if wanted != "*" && wanted != src_etag {
            return Err(S3Error::PreconditionFailed);
        }
        // Matched: If-Unmodified-Since is not consulted.
    } else if let Some(if_unmodified) =
        header_string(headers, "x-amz-copy-source-if-unmodified-since")
    {
        if let (Some(modified), Ok(threshold)) =
            (last_modified, httpdate::parse_http_date(&if_unmodified))
        {
            if modified > threshold {
                return Err(S3Error::PreconditionFailed);
            }
        }
    }

    if let Some(if_none_match) = header_string(headers, "x-amz-copy-source-if-none-match") {
        let unwanted = strip_etag_quotes(&if_none_match);
        if unwanted == "*" || unwanted == src_etag {
            return Err(S3Error::PreconditionFailed);
        }
        // Present and not matching: If-Modified-Since is not consulted.
    } else if let Some(if_modified) =
        header_string(headers, "x-amz-copy-source-if-modified-since")
    {
        if let (Some(modified), Ok(threshold)) =
            (last_modified, httpdate::parse_http_date(&if_modified))
        {
            if modified <= threshold {
                return Err(S3Error::PreconditionFailed);
            }
        }
    }

    Ok(())
}

// -- Response assembly --------------------------------------------------------

/// Apply an object record's headers onto a response.
fn apply_md_headers(response: &mut Response, md: &ObjectMd, body_len: u64) {
    let hdrs = response.headers_mut();

    if let Some(ref ct) = md.content_type {
        if let Ok(val) = HeaderValue::from_str(ct) {
            hdrs.insert("content-type", val);
        }
    }
    hdrs.insert("etag", HeaderValue::from_str(&md.e_tag).unwrap());
    hdrs.insert(
        "content-length",
        HeaderValue::from_str(&body_len.to_string()).unwrap(),
    );
    hdrs.insert(
        "last-modified",
        HeaderValue::from_str(&iso8601_to_http_date(&md.last_modified)).unwrap(),
    );
    hdrs.insert("accept-ranges", HeaderValue::from_static("bytes"));

    if let Some(ref enc) = md.content_encoding {
        // aws-chunked is a transport artifact; never echo it back.
        if let Ok(val) = HeaderValue::from_str(&strip_aws_chunked(enc)) {
            hdrs.insert("content-encoding", val);
        }
    }
    if let Some(ref cc) = md.cache_control {
        if let Ok(val) = HeaderValue::from_str(cc) {
            hdrs.insert("cache-control", val);
        }
    }
    if let Some(ref disp) = md.content_disposition {
        if let Ok(val) = HeaderValue::from_str(disp) {
            hdrs.insert("content-disposition", val);
        }
    }
    if let Some(ref exp) = md.expires {
        if let Ok(val) = HeaderValue::from_str(exp) {
            hdrs.insert("expires", val);
        }
    }
    if let Some(ref vid) = md.version_id {
        if let Ok(val) = HeaderValue::from_str(vid) {
            hdrs.insert("x-amz-version-id", val);
        }
    }
    if let Some(ref status) = md.replication_status {
        if let Ok(val) = HeaderValue::from_str(status) {
            hdrs.insert("x-amz-replication-status", val);
        }
    }

    for (name, value) in &md.user_metadata {
        if let (Ok(hname), Ok(hval)) = (
            axum::http::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            hdrs.insert(hname, hval);
        }
    }
}

// -- Handlers -----------------------------------------------------------------

/// `PUT /{bucket}/{key}` -- Upload an object.
#[utoipa::path(
    put,
    path = "/{bucket}/{key}",
    tag = "Object",
    operation_id = "PutObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
    ),
    responses(
        (status = 200, description = "Object stored"),
        (status = 400, description = "Digest mismatch"),
        (status = 404, description = "Bucket not found")
    )
)]
pub async fn put_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let bucket_md = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;

    let location = resolve_location(
        state.gateway.registry(),
        header_constraint(headers).as_deref(),
        None,
        Some(&bucket_md.location_constraint),
    )?;

    let ctx = key_context_from_headers(bucket, key, headers);
    let content_md5 = header_string(headers, "content-md5");
    let sse_master_key = bucket_md.sse.as_ref().map(|s| s.master_key_id.clone());

    let data = bytes::Bytes::copy_from_slice(body);
    let (info, md5_hex) = state
        .data
        .put(
            data,
            &ctx,
            &location,
            content_md5.as_deref(),
            sse_master_key.as_deref(),
            &req_id,
        )
        .await?;

    let e_tag = format!("\"{md5_hex}\"");

    // On an unversioned bucket a re-PUT replaces the data of the tip;
    // the displaced records are deleted subject to the overwrite-skip
    // policy.
    if bucket_md.versioning == VersioningState::Unversioned {
        if let Some(old) = state
            .metadata
            .get_object(bucket, key, None)
            .await
            .map_err(S3Error::InternalError)?
        {
            if !old.is_delete_marker && !old.location.is_empty() {
                state
                    .data
                    .batch_delete(old.location, RequestMethod::Put, Some(&location), &req_id)
                    .await;
            }
        }
    }

    let acl = header_string(headers, "x-amz-acl").unwrap_or_else(|| "private".to_string());
    let md = object_md_for_write(&ctx, &info, e_tag.clone(), &bucket_md.owner, acl, &location);

    let version_id = state
        .metadata
        .put_object(
            bucket,
            key,
            md,
            crate::metadata::store::PutVersionOptions {
                versioning: bucket_md.versioning,
                version_id: None,
            },
        )
        .await
        .map_err(S3Error::InternalError)?;

    debug!("put {}/{} -> {} ({})", bucket, key, info.key, location);

    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert("etag", HeaderValue::from_str(&e_tag).unwrap());
    if let Some(vid) = version_id {
        if bucket_md.versioning.is_enabled() {
            response
                .headers_mut()
                .insert("x-amz-version-id", HeaderValue::from_str(&vid).unwrap());
        }
    }
    Ok(response)
}

/// `GET /{bucket}/{key}` -- Retrieve an object.
#[utoipa::path(
    get,
    path = "/{bucket}/{key}",
    tag = "Object",
    operation_id = "GetObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
    ),
    responses(
        (status = 200, description = "Object data"),
        (status = 206, description = "Partial content"),
        (status = 404, description = "No such key"),
        (status = 416, description = "Range not satisfiable")
    )
)]
pub async fn get_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    if state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .is_none()
    {
        return Err(S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        });
    }

    let version_id = query.get("versionId").map(String::as_str);
    let md = state
        .metadata
        .get_object(bucket, key, version_id)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchKey {
            key: key.to_string(),
        })?;

    if md.is_delete_marker {
        // The tip (or the named version) is a tombstone.
        let mut response = S3Error::NoSuchKey {
            key: key.to_string(),
        }
        .into_response();
        response
            .headers_mut()
            .insert("x-amz-delete-marker", HeaderValue::from_static("true"));
        return Ok(response);
    }

    let reference = match md.location.first() {
        Some(info) => RetrievalRef::Record(info.clone()),
        None => {
            return Err(S3Error::InternalError(anyhow::anyhow!(
                "object {bucket}/{key} has no location record"
            )))
        }
    };

    // Resolve an optional Range request against the stored size.
    let total = md.content_length;
    let range = match header_string(headers, "range") {
        Some(raw) => match parse_range_header(&raw) {
            Some(byte_range) => match resolve_range(&byte_range, total) {
                Some(resolved) => Some(resolved),
                None => return Err(S3Error::InvalidRange),
            },
            // Malformed range headers are ignored per HTTP spec.
            None => None,
        },
        None => None,
    };

    let data = state.data.get(&reference, range, &req_id).await?;

    let (status, content_range) = match range {
        Some((first, last)) => (
            StatusCode::PARTIAL_CONTENT,
            Some(format!("bytes {first}-{last}/{total}")),
        ),
        None => (StatusCode::OK, None),
    };

    let body_len = data.len() as u64;
    let mut response = (status, data.to_vec()).into_response();
    apply_md_headers(&mut response, &md, body_len);
    if let Some(cr) = content_range {
        response
            .headers_mut()
            .insert("content-range", HeaderValue::from_str(&cr).unwrap());
    }
    Ok(response)
}

/// `HEAD /{bucket}/{key}` -- Object metadata without the body.
pub async fn head_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    if state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .is_none()
    {
        return Err(S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        });
    }

    let version_id = query.get("versionId").map(String::as_str);
    let md = match state
        .metadata
        .get_object(bucket, key, version_id)
        .await
        .map_err(S3Error::InternalError)?
    {
        Some(md) if !md.is_delete_marker => md,
        _ => return Ok(StatusCode::NOT_FOUND.into_response()),
    };

    let mut response = StatusCode::OK.into_response();
    let len = md.content_length;
    apply_md_headers(&mut response, &md, len);
    Ok(response)
}

/// `DELETE /{bucket}/{key}` -- Delete an object (or one version).
///
/// On a versioning-enabled bucket a plain delete lays down a delete
/// marker and touches no data; naming a version removes that version
/// and its data.
#[utoipa::path(
    delete,
    path = "/{bucket}/{key}",
    tag = "Object",
    operation_id = "DeleteObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object key"),
    ),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Bucket not found")
    )
)]
pub async fn delete_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let bucket_md = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;

    let version_id = query.get("versionId").cloned();

    match (bucket_md.versioning.is_enabled(), version_id) {
        (true, None) => {
            // Lay down a delete marker.
            let marker = ObjectMd {
                version_id: None,
                content_length: 0,
                e_tag: String::new(),
                content_type: None,
                cache_control: None,
                content_disposition: None,
                content_encoding: None,
                expires: None,
                user_metadata: HashMap::new(),
                tags: HashMap::new(),
                owner_id: bucket_md.owner.clone(),
                owner_display: bucket_md.owner_display.clone(),
                acl: "private".to_string(),
                location: vec![],
                is_delete_marker: true,
                replication_status: None,
                data_store_name: None,
                last_modified: now_iso8601(),
            };
            let marker_vid = state
                .metadata
                .put_object(
                    bucket,
                    key,
                    marker,
                    crate::metadata::store::PutVersionOptions {
                        versioning: VersioningState::Enabled,
                        version_id: None,
                    },
                )
                .await
                .map_err(S3Error::InternalError)?;

            let mut response = StatusCode::NO_CONTENT.into_response();
            response
                .headers_mut()
                .insert("x-amz-delete-marker", HeaderValue::from_static("true"));
            if let Some(vid) = marker_vid {
                response
                    .headers_mut()
                    .insert("x-amz-version-id", HeaderValue::from_str(&vid).unwrap());
            }
            Ok(response)
        }
        (_, Some(vid)) => {
            // Remove one version (marker or data).
            if let Some(md) = state
                .metadata
                .get_object(bucket, key, Some(&vid))
                .await
                .map_err(S3Error::InternalError)?
            {
                for info in &md.location {
                    state
                        .data
                        .delete(&RetrievalRef::Record(info.clone()), &req_id)
                        .await?;
                }
                state
                    .metadata
                    .delete_object(bucket, key, Some(&vid))
                    .await
                    .map_err(S3Error::InternalError)?;
            }
            let mut response = StatusCode::NO_CONTENT.into_response();
            response
                .headers_mut()
                .insert("x-amz-version-id", HeaderValue::from_str(&vid).unwrap());
            Ok(response)
        }
        (false, None) => {
            if let Some(md) = state
                .metadata
                .get_object(bucket, key, None)
                .await
                .map_err(S3Error::InternalError)?
            {
                for info in &md.location {
                    state
                        .data
                        .delete(&RetrievalRef::Record(info.clone()), &req_id)
                        .await?;
                }
                state
                    .metadata
                    .delete_object(bucket, key, None)
                    .await
                    .map_err(S3Error::InternalError)?;
            }
            // DeleteObject returns 204 even when nothing existed.
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// `PUT /{bucket}/{key}` with `x-amz-copy-source` -- Copy an object.
#[utoipa::path(
    put,
    path = "/{bucket}/{key}?copy",
    tag = "Object",
    operation_id = "CopyObject",
    params(
        ("bucket" = String, Path, description = "Destination bucket"),
        ("key" = String, Path, description = "Destination key"),
    ),
    responses(
        (status = 200, description = "Copy result"),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Access denied"),
        (status = 404, description = "Source not found"),
        (status = 412, description = "Precondition failed")
    )
)]
pub async fn copy_object(
    state: Arc<AppState>,
    dst_bucket: &str,
    dst_key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let dst_bucket_md = state
        .metadata
        .get_bucket(dst_bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: dst_bucket.to_string(),
        })?;

    // Parse x-amz-copy-source: /bucket/key[?versionId=...]
    let copy_source =
        header_string(headers, "x-amz-copy-source").ok_or_else(|| S3Error::InvalidArgument {
            message: "Missing x-amz-copy-source header".to_string(),
        })?;
    let decoded = percent_encoding::percent_decode_str(&copy_source)
        .decode_utf8_lossy()
        .into_owned();
    let (path_part, src_version_id) = match decoded.split_once("?versionId=") {
        Some((p, v)) => (p.to_string(), Some(v.to_string())),
        None => (decoded, None),
    };
    let source_path = path_part.trim_start_matches('/');
    let (src_bucket, src_key) =
        source_path
            .split_once('/')
            .ok_or_else(|| S3Error::InvalidArgument {
                message: format!("Invalid x-amz-copy-source: {copy_source}"),
            })?;

    let src_bucket_md = state
        .metadata
        .get_bucket(src_bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: src_bucket.to_string(),
        })?;

    let src_md = state
        .metadata
        .get_object(src_bucket, src_key, src_version_id.as_deref())
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchKey {
            key: src_key.to_string(),
        })?;

    if src_md.is_delete_marker {
        // Tombstones cannot be copied: addressing one by version id is
        // an invalid request, hitting one at the tip is a missing key.
        return if src_version_id.is_some() {
            Err(S3Error::InvalidRequest {
                message: "The source of a copy request may not specifically refer to a delete marker by version id.".to_string(),
            })
        } else {
            Err(S3Error::NoSuchKey {
                key: src_key.to_string(),
            })
        };
    }

    // Cross-account reads need a public-read grant on the source.
    let requester = requester_id(headers, &dst_bucket_md.owner);
    if requester != src_md.owner_id && src_bucket_md.owner != requester {
        let public = matches!(src_md.acl.as_str(), "public-read" | "public-read-write");
        if !public {
            return Err(S3Error::AccessDenied {
                message: "Access Denied".to_string(),
            });
        }
    }

    eval_copy_conditions(headers, &src_md)?;

    let metadata_directive = header_string(headers, "x-amz-metadata-directive")
        .unwrap_or_else(|| "COPY".to_string());

    let location = resolve_location(
        state.gateway.registry(),
        header_constraint(headers).as_deref(),
        None,
        Some(&dst_bucket_md.location_constraint),
    )?;

    // Destination context: REPLACE takes this request's headers, COPY
    // carries the source metadata.
    let mut dst_ctx = key_context_from_headers(dst_bucket, dst_key, headers);
    if !metadata_directive.eq_ignore_ascii_case("REPLACE") {
        dst_ctx.meta_headers = src_md.user_metadata.clone();
        dst_ctx.content_type = src_md.content_type.clone();
        dst_ctx.cache_control = src_md.cache_control.clone();
        dst_ctx.content_disposition = src_md.content_disposition.clone();
        dst_ctx.content_encoding = src_md.content_encoding.clone();
    }

    // Data movement: native server-side copy when source and target
    // share one external backend, byte relay otherwise.
    let src_info = src_md.location.first();
    let new_info = match src_info {
        Some(info)
            if info.data_store_name == location
                && info.data_store_type.is_external()
                && state
                    .gateway
                    .registry()
                    .client(&location)
                    .is_some_and(|c| c.capabilities().copy_object) =>
        {
            state
                .gateway
                .copy_object(info, &dst_ctx, &location, &req_id)
                .await?
        }
        Some(info) => {
            let data = state
                .data
                .get(&RetrievalRef::Record(info.clone()), None, &req_id)
                .await?;
            let sse_master_key = dst_bucket_md.sse.as_ref().map(|s| s.master_key_id.clone());
            let (new_info, _) = state
                .data
                .put(data, &dst_ctx, &location, None, sse_master_key.as_deref(), &req_id)
                .await?;
            new_info
        }
        None => {
            return Err(S3Error::InternalError(anyhow::anyhow!(
                "source object {src_bucket}/{src_key} has no location record"
            )))
        }
    };

    // Displaced destination data on an unversioned bucket.
    if dst_bucket_md.versioning == VersioningState::Unversioned {
        if let Some(old) = state
            .metadata
            .get_object(dst_bucket, dst_key, None)
            .await
            .map_err(S3Error::InternalError)?
        {
            if !old.is_delete_marker && !old.location.is_empty() {
                state
                    .data
                    .batch_delete(old.location, RequestMethod::Put, Some(&location), &req_id)
                    .await;
            }
        }
    }

    let now = now_iso8601();
    let dst_md = ObjectMd {
        version_id: None,
        content_length: src_md.content_length,
        e_tag: src_md.e_tag.clone(),
        content_type: dst_ctx.content_type.clone(),
        cache_control: dst_ctx.cache_control.clone(),
        content_disposition: dst_ctx.content_disposition.clone(),
        content_encoding: dst_ctx.content_encoding.clone(),
        expires: src_md.expires.clone(),
        user_metadata: dst_ctx.meta_headers.clone(),
        tags: src_md.tags.clone(),
        owner_id: dst_bucket_md.owner.clone(),
        owner_display: dst_bucket_md.owner_display.clone(),
        acl: "private".to_string(),
        location: vec![new_info],
        is_delete_marker: false,
        replication_status: None,
        data_store_name: Some(location.clone()),
        last_modified: now.clone(),
    };

    let version_id = state
        .metadata
        .put_object(
            dst_bucket,
            dst_key,
            dst_md,
            crate::metadata::store::PutVersionOptions {
                versioning: dst_bucket_md.versioning,
                version_id: None,
            },
        )
        .await
        .map_err(S3Error::InternalError)?;

    let xml = crate::xml::render_copy_object_result(&src_md.e_tag, &now);
    let mut response = (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        )],
        xml,
    )
        .into_response();
    if let Some(ref vid) = src_md.version_id {
        response.headers_mut().insert(
            "x-amz-copy-source-version-id",
            HeaderValue::from_str(vid).unwrap(),
        );
    }
    if let Some(vid) = version_id {
        if dst_bucket_md.versioning.is_enabled() {
            response
                .headers_mut()
                .insert("x-amz-version-id", HeaderValue::from_str(&vid).unwrap());
        }
    }
    Ok(response)
}

/// `POST /{bucket}?delete` -- Multi-object delete.
#[utoipa::path(
    post,
    path = "/{bucket}?delete",
    tag = "Object",
    operation_id = "DeleteObjects",
    params(("bucket" = String, Path, description = "Bucket name")),
    responses(
        (status = 200, description = "Delete result"),
        (status = 400, description = "Malformed XML"),
        (status = 404, description = "Bucket not found")
    )
)]
pub async fn delete_objects(
    state: Arc<AppState>,
    bucket: &str,
    body: &[u8],
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let bucket_md = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;

    let (keys, quiet) = parse_delete_xml(body)?;
    if keys.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    // The cap is enforced before any deletion occurs.
    if keys.len() > MULTI_OBJECT_DELETE_MAX {
        return Err(S3Error::MalformedXML);
    }

    let mut deleted: Vec<(String, bool, Option<String>)> = Vec::new();
    let mut failed: Vec<(String, &'static str, String)> = Vec::new();

    for key in &keys {
        if bucket_md.versioning.is_enabled() {
            // Versioned buckets tombstone each key.
            let marker = ObjectMd {
                version_id: None,
                content_length: 0,
                e_tag: String::new(),
                content_type: None,
                cache_control: None,
                content_disposition: None,
                content_encoding: None,
                expires: None,
                user_metadata: HashMap::new(),
                tags: HashMap::new(),
                owner_id: bucket_md.owner.clone(),
                owner_display: bucket_md.owner_display.clone(),
                acl: "private".to_string(),
                location: vec![],
                is_delete_marker: true,
                replication_status: None,
                data_store_name: None,
                last_modified: now_iso8601(),
            };
            match state
                .metadata
                .put_object(
                    bucket,
                    key,
                    marker,
                    crate::metadata::store::PutVersionOptions {
                        versioning: VersioningState::Enabled,
                        version_id: None,
                    },
                )
                .await
            {
                Ok(vid) => deleted.push((key.clone(), true, vid)),
                Err(e) => failed.push((key.clone(), "InternalError", e.to_string())),
            }
            continue;
        }

        match state
            .metadata
            .get_object(bucket, key, None)
            .await
            .map_err(S3Error::InternalError)?
        {
            Some(md) => {
                let mut data_error = None;
                for info in &md.location {
                    if let Err(e) = state
                        .data
                        .delete(&RetrievalRef::Record(info.clone()), &req_id)
                        .await
                    {
                        data_error = Some(e);
                        break;
                    }
                }
                match data_error {
                    Some(e) => failed.push((key.clone(), "InternalError", e.to_string())),
                    None => {
                        state
                            .metadata
                            .delete_object(bucket, key, None)
                            .await
                            .map_err(S3Error::InternalError)?;
                        deleted.push((key.clone(), false, None));
                    }
                }
            }
            // Deleting a missing key is a success, as in S3.
            None => deleted.push((key.clone(), false, None)),
        }
    }

    let deleted_entries: Vec<crate::xml::DeletedEntry<'_>> = deleted
        .iter()
        .map(|(k, marker, vid)| crate::xml::DeletedEntry {
            key: k,
            delete_marker: *marker,
            delete_marker_version_id: vid.as_deref(),
        })
        .collect();
    let error_entries: Vec<crate::xml::DeleteErrorEntry<'_>> = failed
        .iter()
        .map(|(k, code, message)| crate::xml::DeleteErrorEntry {
            key: k,
            code,
            message,
        })
        .collect();

    let xml = crate::xml::render_delete_result(&deleted_entries, &error_entries, quiet);
    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        )],
        xml,
    )
        .into_response())
}

/// Parse the `<Delete>` XML body for DeleteObjects.
fn parse_delete_xml(body: &[u8]) -> Result<(Vec<String>, bool), S3Error> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut keys = Vec::new();
    let mut quiet = false;
    let mut current_tag = String::new();
    let mut in_object = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Object" {
                    in_object = true;
                }
                current_tag = tag_name;
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Object" {
                    in_object = false;
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_object && current_tag == "Key" {
                    keys.push(text);
                } else if current_tag == "Quiet" {
                    quiet = text == "true";
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    Ok((keys, quiet))
}

/// `PUT /{bucket}/{key}?tagging` -- Replace the tag set.
///
/// External backends mirror the tag set natively; internal backends
/// keep it in metadata only.
pub async fn put_object_tagging(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    tagging: &str,
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let mut md = state
        .metadata
        .get_object(bucket, key, None)
        .await
        .map_err(S3Error::InternalError)?
        .filter(|md| !md.is_delete_marker)
        .ok_or_else(|| S3Error::NoSuchKey {
            key: key.to_string(),
        })?;

    let tags = parse_tagging(tagging).ok_or_else(|| S3Error::InvalidArgument {
        message: "The header 'x-amz-tagging' shall be encoded as UTF-8 then URLEncoded URL query parameters without tag name duplicates.".to_string(),
    })?;

    if let Some(info) = md.location.first() {
        if info.data_store_type.is_external() {
            let mut ctx = KeyContext::new(bucket, key);
            ctx.meta_headers = md.user_metadata.clone();
            ctx.tagging = Some(tagging.to_string());
            state.gateway.object_put_tagging(info, &ctx, &req_id).await?;
        }
    }

    md.tags = tags.into_iter().collect();
    let versioning = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .map(|b| b.versioning)
        .unwrap_or_default();
    let version_id = md.version_id.clone();
    state
        .metadata
        .put_object(
            bucket,
            key,
            md,
            crate::metadata::store::PutVersionOptions {
                versioning,
                version_id,
            },
        )
        .await
        .map_err(S3Error::InternalError)?;

    Ok(StatusCode::OK.into_response())
}

/// `DELETE /{bucket}/{key}?tagging` -- Clear the tag set.
pub async fn delete_object_tagging(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
) -> Result<Response, S3Error> {
    let req_id = crate::errors::generate_request_id();

    let mut md = state
        .metadata
        .get_object(bucket, key, None)
        .await
        .map_err(S3Error::InternalError)?
        .filter(|md| !md.is_delete_marker)
        .ok_or_else(|| S3Error::NoSuchKey {
            key: key.to_string(),
        })?;

    if let Some(info) = md.location.first() {
        if info.data_store_type.is_external() {
            let mut ctx = KeyContext::new(bucket, key);
            ctx.meta_headers = md.user_metadata.clone();
            ctx.tagging = Some(
                md.tags
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&"),
            );
            state
                .gateway
                .object_delete_tagging(info, &ctx, &req_id)
                .await?;
        }
    }

    md.tags.clear();
    let versioning = state
        .metadata
        .get_bucket(bucket)
        .await
        .map_err(S3Error::InternalError)?
        .map(|b| b.versioning)
        .unwrap_or_default();
    let version_id = md.version_id.clone();
    state
        .metadata
        .put_object(
            bucket,
            key,
            md,
            crate::metadata::store::PutVersionOptions {
                versioning,
                version_id,
            },
        )
        .await
        .map_err(S3Error::InternalError)?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Unit tests ---------------------------------------------------------------
