//! Versioning semantics shared by the data path and the replication
//! surface: version-id generation, bucket versioning state, and the
//! replication status carried on replica writes.

use serde::{Deserialize, Serialize};

/// Version id used for the single overwritable version on a
/// versioning-suspended bucket.
pub const NULL_VERSION_ID: &str = "null";

/// Replication status stamped on objects written by the replication
/// worker.
pub const REPLICA_STATUS: &str = "REPLICA";

/// Versioning state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VersioningState {
    /// Versioning was never configured.
    #[default]
    Unversioned,
    /// Every PUT creates a fresh version; DELETE creates a delete marker.
    Enabled,
    /// New writes target the `null` version; existing versions persist.
    Suspended,
}

impl VersioningState {
    /// Whether writes to this bucket produce version ids.
    pub fn is_enabled(&self) -> bool {
        matches!(self, VersioningState::Enabled)
    }
}

/// Generate an opaque, unique version id.
///
/// Ids sort roughly by creation time (leading nanosecond counter) and
/// carry enough entropy that concurrent writers on one key cannot
/// collide.
pub fn generate_version_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let entropy = uuid::Uuid::new_v4();
    format!("{:024x}{}", nanos, hex::encode(&entropy.as_bytes()[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ids_are_distinct_and_non_empty() {
        let a = generate_version_id();
        let b = generate_version_id();
        assert!(!a.is_empty());
        assert!(!b.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_id_is_hex() {
        let id = generate_version_id();
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_default_state_is_unversioned() {
        assert_eq!(VersioningState::default(), VersioningState::Unversioned);
        assert!(!VersioningState::Suspended.is_enabled());
        assert!(VersioningState::Enabled.is_enabled());
    }
}
