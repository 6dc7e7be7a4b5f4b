//! Axum router construction and route mapping.
//!
//! S3 distinguishes operations by query parameters, not just
//! path+method: `PUT /:bucket` is CreateBucket or PutBucketVersioning
//! (`?versioning`), `POST /:bucket` with `?delete` is DeleteObjects,
//! and so on.  One handler per method+path dispatches internally on
//! query params.
//!
//! The replication worker surface is nested under `/_/backbeat` behind
//! a bearer-key check -- the narrow contract with the external auth
//! service that granted the worker `objectReplicate`.

use axum::{
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, head, post, put},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::errors::{generate_request_id, S3Error};
use crate::metrics::{metrics_handler, metrics_middleware, record_replication_op};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the public S3-compatible surface.  The
/// backbeat surface is intentionally undocumented here.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "SpanStore S3-Compatible API",
        version = "0.3.0",
        description = "S3-compatible multi-backend data gateway"
    ),
    paths(
        health_check,
        crate::handlers::bucket::create_bucket,
        crate::handlers::bucket::delete_bucket,
        crate::handlers::object::put_object,
        crate::handlers::object::get_object,
        crate::handlers::object::delete_object,
        crate::handlers::object::copy_object,
        crate::handlers::object::delete_objects,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Bucket", description = "Bucket operations"),
        (name = "Object", description = "Object operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    let openapi = ApiDoc::openapi();

    let backbeat = Router::new()
        .route("/data/:bucket/*key", put(handle_backbeat_data))
        .route("/metadata/:bucket/*key", put(handle_backbeat_metadata))
        .route(
            "/multiplebackenddata/:bucket/*key",
            put(handle_backbeat_multiple)
                .post(handle_backbeat_multiple)
                .delete(handle_backbeat_multiple),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            replication_auth_middleware,
        ));

    Router::new()
        // Infrastructure endpoints.
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/_/healthcheck/deep", get(deep_healthcheck))
        // Replication worker surface.
        .nest("/_/backbeat", backbeat)
        // Bucket-level routes.
        .route("/:bucket", put(handle_put_bucket))
        .route("/:bucket", delete(handle_delete_bucket))
        .route("/:bucket", post(handle_post_bucket))
        // Object-level routes (wildcard key captures slashes).
        .route("/:bucket/*key", get(handle_get_object))
        .route("/:bucket/*key", put(handle_put_object))
        .route("/:bucket/*key", delete(handle_delete_object))
        .route("/:bucket/*key", head(handle_head_object))
        // Swagger UI at /docs, OpenAPI spec at /openapi.json.
        .merge(SwaggerUi::new("/docs").url("/openapi.json", openapi))
        .with_state(state)
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        // S3 objects can be large; drop the default 2MB body cap.
        .layer(DefaultBodyLimit::disable())
}

// -- Middleware ---------------------------------------------------------------

/// Adds the common response headers to every response:
/// `x-amz-request-id`, `Date`, `Server`.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-amz-request-id") {
        let request_id = generate_request_id();
        headers.insert(
            "x-amz-request-id",
            HeaderValue::from_str(&request_id).unwrap(),
        );
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    headers.insert("date", HeaderValue::from_str(&date).unwrap());
    headers.insert("server", HeaderValue::from_static("SpanStore"));

    response
}

/// Bearer-key check for the replication surface.  The worker's identity
/// and its `objectReplicate` grant live in the external auth service;
/// this key is what it hands us.
async fn replication_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, S3Error> {
    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if presented != state.config.replication.service_key {
        return Err(S3Error::AccessDenied {
            message: "replication principal is not authorized for objectReplicate".to_string(),
        });
    }

    Ok(next.run(req).await)
}

// -- Health endpoints ---------------------------------------------------------

/// `GET /health` -- Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses((status = 200, description = "Health check OK"))
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /_/healthcheck/deep` -- Aggregated per-location healthcheck.
async fn deep_healthcheck(State(state): State<Arc<AppState>>) -> Response {
    let results = state.gateway.healthcheck().await;
    let any_failed = results.values().any(|r| r.code != 200);
    let status = if any_failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (
        status,
        [("content-type", "application/json")],
        serde_json::to_string(&results).unwrap_or_else(|_| "{}".to_string()),
    )
        .into_response()
}

// -- Query parsing ------------------------------------------------------------

/// Parse a raw query string into a map; bare params (`?delete`,
/// `?versioning`) map to empty strings.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let decoded_v = percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded_k, decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_encoding::percent_decode_str(part)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded, String::new());
            }
        }
    }
    map
}

/// Parse an S3 `<Tagging>` document into the query-string form the
/// data layer works with.
fn tagging_xml_to_query(body: &[u8]) -> Result<String, S3Error> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut current_tag = String::new();
    let mut key: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                match current_tag.as_str() {
                    "Key" => key = Some(text),
                    "Value" => {
                        if let Some(k) = key.take() {
                            pairs.push((k, text));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current_tag.clear(),
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    Ok(pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&"))
}

// -- Bucket-level dispatch ----------------------------------------------------

/// `PUT /:bucket` -- `?versioning` -> PutBucketVersioning, otherwise
/// CreateBucket.
async fn handle_put_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    if query.contains_key("versioning") {
        crate::handlers::bucket::put_bucket_versioning(state, &bucket, &body).await
    } else {
        crate::handlers::bucket::create_bucket(state, &bucket, &headers, &body).await
    }
}

/// `DELETE /:bucket` -- DeleteBucket.
async fn handle_delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, S3Error> {
    crate::handlers::bucket::delete_bucket(state, &bucket).await
}

/// `POST /:bucket` -- `?delete` -> DeleteObjects.
async fn handle_post_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    body: axum::body::Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    if query.contains_key("delete") {
        crate::handlers::object::delete_objects(state, &bucket, &body).await
    } else {
        Err(S3Error::NotImplemented {
            message: "POST on a bucket supports only the delete operation".to_string(),
        })
    }
}

// -- Object-level dispatch ----------------------------------------------------

/// `GET /:bucket/*key` -- GetObject.
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    crate::handlers::object::get_object(state, &bucket, &key, &headers, &query).await
}

/// `PUT /:bucket/*key` -- `?tagging` -> PutObjectTagging,
/// `x-amz-copy-source` -> CopyObject, otherwise PutObject.
async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    if query.contains_key("tagging") {
        let tagging = tagging_xml_to_query(&body)?;
        crate::handlers::object::put_object_tagging(state, &bucket, &key, &tagging).await
    } else if headers.contains_key("x-amz-copy-source") {
        crate::handlers::object::copy_object(state, &bucket, &key, &headers).await
    } else {
        crate::handlers::object::put_object(state, &bucket, &key, &headers, &body).await
    }
}

/// `DELETE /:bucket/*key` -- `?tagging` -> DeleteObjectTagging,
/// otherwise DeleteObject.
async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    if query.contains_key("tagging") {
        crate::handlers::object::delete_object_tagging(state, &bucket, &key).await
    } else {
        crate::handlers::object::delete_object(state, &bucket, &key, &query).await
    }
}

/// `HEAD /:bucket/*key` -- HeadObject.
async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    crate::handlers::object::head_object(state, &bucket, &key, &query).await
}

// -- Backbeat dispatch --------------------------------------------------------

async fn handle_backbeat_data(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, S3Error> {
    record_replication_op("data");
    crate::handlers::backbeat::put_data(state, &bucket, &key, &headers, &body).await
}

async fn handle_backbeat_metadata(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, S3Error> {
    record_replication_op("metadata");
    crate::handlers::backbeat::put_metadata(state, &bucket, &key, &headers, &body).await
}

async fn handle_backbeat_multiple(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, S3Error> {
    record_replication_op("multiplebackenddata");
    let query = parse_query(raw_query);
    crate::handlers::backbeat::multiple_backend_data(
        state, &bucket, &key, &method, &headers, &query, &body,
    )
    .await
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_forms() {
        let q = parse_query(Some("delete&versionId=v1&quiet=true".to_string()));
        assert!(q.contains_key("delete"));
        assert_eq!(q.get("versionId").map(String::as_str), Some("v1"));
        assert_eq!(q.get("quiet").map(String::as_str), Some("true"));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_parse_query_percent_decoding() {
        let q = parse_query(Some("prefix=a%2Fb".to_string()));
        assert_eq!(q.get("prefix").map(String::as_str), Some("a/b"));
    }

    #[test]
    fn test_tagging_xml_to_query() {
        let body = br#"<Tagging><TagSet><Tag><Key>env</Key><Value>prod</Value></Tag><Tag><Key>team</Key><Value>core</Value></Tag></TagSet></Tagging>"#;
        assert_eq!(tagging_xml_to_query(body).unwrap(), "env=prod&team=core");
    }

    #[test]
    fn test_tagging_xml_empty_set() {
        let body = br#"<Tagging><TagSet></TagSet></Tagging>"#;
        assert_eq!(tagging_xml_to_query(body).unwrap(), "");
    }
}
