// Shared helpers used across the control plane.

pub mod hash;
pub mod id;
pub mod pagination;

pub use hash::{canonical_json, hash_idempotency_key, payload_checksum, request_fingerprint};
pub use id::db_id;
pub use pagination::{Page, PageParams};
