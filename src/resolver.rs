//! Backend info resolution: which location constraint controls a
//! request.
//!
//! Selection order: per-request header override, then the location the
//! object already lives in, then the bucket's configured location, then
//! the global default.  Naming an unregistered location at any step is
//! an error rather than a silent fall-through.

use axum::http::HeaderMap;

use crate::errors::S3Error;
use crate::locations::LocationRegistry;

/// Header carrying the per-request location override.
pub const LOCATION_CONSTRAINT_HEADER: &str = "x-amz-meta-scal-location-constraint";

/// Resolve the controlling location constraint.
pub fn resolve_location(
    registry: &LocationRegistry,
    header_constraint: Option<&str>,
    object_constraint: Option<&str>,
    bucket_constraint: Option<&str>,
) -> Result<String, S3Error> {
    for candidate in [header_constraint, object_constraint, bucket_constraint] {
        if let Some(name) = candidate {
            if !registry.is_registered(name) {
                return Err(S3Error::InvalidArgument {
                    message: format!("Location constraint {name} is not in your location config"),
                });
            }
            return Ok(name.to_string());
        }
    }

    let default = registry.default_location();
    if !registry.is_registered(default) {
        return Err(S3Error::InvalidArgument {
            message: format!("Location constraint {default} is not in your location config"),
        });
    }
    Ok(default.to_string())
}

/// Extract the location override header from a request, if present.
pub fn header_constraint(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION_CONSTRAINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::client::BackendClient;
    use crate::backends::memory::MemoryBackend;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    fn registry() -> LocationRegistry {
        let clients: Vec<Arc<dyn BackendClient>> = vec![
            Arc::new(MemoryBackend::new("mem-a")),
            Arc::new(MemoryBackend::new("mem-b")),
        ];
        LocationRegistry::from_clients(clients, "mem-a")
    }

    #[test]
    fn test_header_override_wins() {
        let registry = registry();
        let resolved =
            resolve_location(&registry, Some("mem-b"), None, Some("mem-a")).unwrap();
        assert_eq!(resolved, "mem-b");
    }

    #[test]
    fn test_object_location_beats_bucket() {
        let registry = registry();
        let resolved =
            resolve_location(&registry, None, Some("mem-b"), Some("mem-a")).unwrap();
        assert_eq!(resolved, "mem-b");
    }

    #[test]
    fn test_bucket_location_used_when_no_override() {
        let registry = registry();
        let resolved = resolve_location(&registry, None, None, Some("mem-b")).unwrap();
        assert_eq!(resolved, "mem-b");
    }

    #[test]
    fn test_global_default_as_last_resort() {
        let registry = registry();
        let resolved = resolve_location(&registry, None, None, None).unwrap();
        assert_eq!(resolved, "mem-a");
    }

    #[test]
    fn test_unregistered_name_is_invalid_argument() {
        let registry = registry();
        let err = resolve_location(&registry, Some("nowhere"), None, Some("mem-a")).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[test]
    fn test_header_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION_CONSTRAINT_HEADER,
            HeaderValue::from_static("mem-b"),
        );
        assert_eq!(header_constraint(&headers).as_deref(), Some("mem-b"));
        assert_eq!(header_constraint(&HeaderMap::new()), None);
    }
}
