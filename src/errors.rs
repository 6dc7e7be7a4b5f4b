//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code (plus the two
//! gateway-specific codes `MPUinProgress` and `ObjNotFound`).  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(S3Error::NoSuchBucket { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The specified key does not exist.")]
    NoSuchKey { key: String },

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// The bucket you tried to delete is not empty.
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    /// The bucket you tried to delete has in-flight multipart uploads.
    /// Non-standard code, intentionally distinct from BucketNotEmpty so
    /// operators can tell the two situations apart.
    #[error("The bucket you tried to delete has ongoing multipart uploads")]
    MPUinProgress { bucket: String },

    /// Access denied.
    #[error("Access Denied")]
    AccessDenied { message: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The request is invalid (e.g. copying a delete marker by version id,
    /// or a replica write whose storage class contradicts its storage type).
    #[error("{message}")]
    InvalidRequest { message: String },

    /// The website redirect location is not valid.
    #[error("The website redirect location must have a prefix of 'http://' or 'https://' or '/'.")]
    InvalidRedirectLocation,

    /// The request is not valid for the current state of the bucket.
    #[error("The request is not valid with the current state of the bucket.")]
    InvalidBucketState { message: String },

    /// A precondition on the request did not hold.
    #[error("At least one of the pre-conditions you specified did not hold")]
    PreconditionFailed,

    /// The Content-MD5 you specified did not match what we received.
    #[error("The Content-MD5 you specified did not match what we received.")]
    BadDigest,

    /// The Content-MD5 you specified is not valid.
    #[error("The Content-MD5 you specified is not valid.")]
    InvalidDigest,

    /// Malformed XML in request body.
    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    /// Malformed POST/internal request body.
    #[error("The body of your POST request is not well-formed multipart/form-data.")]
    MalformedPOSTRequest,

    /// The requested object was not found in the metadata plane.
    /// Internal code used on the replication surface.
    #[error("The object was not found in metadata")]
    ObjNotFound { key: String },

    /// Feature not implemented.
    #[error("{message}")]
    NotImplemented { message: String },

    /// Invalid part in multipart upload.
    #[error("{message}")]
    InvalidPart { message: String },

    /// Invalid part order in CompleteMultipartUpload.
    #[error("The list of parts was not in ascending order. Parts must be ordered by part number.")]
    InvalidPartOrder,

    /// Invalid range request.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    /// Not modified (304 response for conditional requests).
    #[error("Not Modified")]
    NotModified,

    /// Catch-all for unexpected internal errors. The cause text is logged
    /// and interpolated into the description; raw backend errors are never
    /// exposed verbatim.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Wrap a backend-native failure as an `InternalError`, logging the
    /// original cause with context.
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        tracing::error!("{context}: {err}");
        S3Error::InternalError(anyhow::anyhow!("{context}: {err}"))
    }

    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::MPUinProgress { .. } => "MPUinProgress",
            S3Error::AccessDenied { .. } => "AccessDenied",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::InvalidRequest { .. } => "InvalidRequest",
            S3Error::InvalidRedirectLocation => "InvalidRedirectLocation",
            S3Error::InvalidBucketState { .. } => "InvalidBucketState",
            S3Error::PreconditionFailed => "PreconditionFailed",
            S3Error::BadDigest => "BadDigest",
            S3Error::InvalidDigest => "InvalidDigest",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::MalformedPOSTRequest => "MalformedPOSTRequest",
            S3Error::ObjNotFound { .. } => "ObjNotFound",
            S3Error::NotImplemented { .. } => "NotImplemented",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::NotModified => "NotModified",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::MPUinProgress { .. } => StatusCode::CONFLICT,
            S3Error::AccessDenied { .. } => StatusCode::FORBIDDEN,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidRedirectLocation => StatusCode::BAD_REQUEST,
            S3Error::InvalidBucketState { .. } => StatusCode::CONFLICT,
            S3Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            S3Error::BadDigest => StatusCode::BAD_REQUEST,
            S3Error::InvalidDigest => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::MalformedPOSTRequest => StatusCode::BAD_REQUEST,
            S3Error::ObjNotFound { .. } => StatusCode::NOT_FOUND,
            S3Error::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            S3Error::InvalidPart { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidPartOrder => StatusCode::BAD_REQUEST,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::NotModified => StatusCode::NOT_MODIFIED,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        // 304 Not Modified responses must not have a body.
        if matches!(self, S3Error::NotModified) {
            return (
                status,
                [
                    ("x-amz-request-id", request_id),
                    ("date", date),
                    ("server", "SpanStore".to_string()),
                ],
            )
                .into_response();
        }

        let body = render_error(self.code(), &self.to_string(), "", &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "SpanStore".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_uppercase());
    }

    #[test]
    fn test_codes_are_stable_strings() {
        assert_eq!(
            S3Error::MPUinProgress { bucket: "b".into() }.code(),
            "MPUinProgress"
        );
        assert_eq!(
            S3Error::ObjNotFound { key: "k".into() }.code(),
            "ObjNotFound"
        );
        assert_eq!(S3Error::BadDigest.code(), "BadDigest");
        assert_eq!(
            S3Error::InvalidBucketState {
                message: String::new()
            }
            .code(),
            "InvalidBucketState"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            S3Error::MPUinProgress { bucket: "b".into() }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            S3Error::InvalidRequest {
                message: String::new()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            S3Error::InternalError(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_wraps_cause_text() {
        let err = S3Error::internal("AWS put_object", "connection reset");
        match err {
            S3Error::InternalError(cause) => {
                assert!(cause.to_string().contains("connection reset"));
            }
            other => panic!("expected InternalError, got {other:?}"),
        }
    }
}
