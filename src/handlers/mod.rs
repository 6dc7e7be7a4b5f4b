//! Request handlers: the S3 object surface, the bucket deletion
//! pipeline, and the internal replication (backbeat) surface.

pub mod backbeat;
pub mod bucket;
pub mod object;
