use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value in canonical form.
///
/// Object keys are emitted in sorted order (serde_json maps are BTree-backed)
/// with no insignificant whitespace, so equal values always produce equal
/// strings.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash a caller-provided idempotency key for storage.
pub fn hash_idempotency_key(key: &str) -> String {
    sha256_hex(key.as_bytes())
}

/// Checksum of a part payload: SHA-256 over the canonical JSON encoding.
pub fn payload_checksum(payload: &Value) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

/// Fingerprint of a mutating request, recorded in provenance.
pub fn request_fingerprint(operation: &str, inputs: &Value) -> String {
    sha256_hex(format!("{}:{}", operation, canonical_json(inputs)).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_object_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn key_hash_is_sha256_hex() {
        let hash = hash_idempotency_key("propose-once");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn equal_payloads_share_a_checksum() {
        let a = json!({"research": "findings", "score": 3});
        let b = json!({"score": 3, "research": "findings"});
        assert_eq!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn fingerprint_varies_by_operation() {
        let inputs = json!({"order_id": "x"});
        assert_ne!(
            request_fingerprint("submit", &inputs),
            request_fingerprint("approve", &inputs)
        );
    }
}
