use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ciborium::Value;

use crate::types::resource::ResourceDescriptor;

/// Schema version for snapshot hashing
pub const SCHEMA_VERSION: u8 = 1;

/// 256-bit content hash of a rendered manifest set (BLAKE2b-256)
pub type SnapshotHash = [u8; 32];

/// Compute the snapshot hash over canonical CBOR of the descriptors.
///
/// Callers pass descriptors sorted by identity; see `RevisionSnapshot::new`.
pub fn compute_snapshot_hash(resources: &[ResourceDescriptor]) -> SnapshotHash {
    let preimage = build_canonical_cbor(resources);
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(&preimage);
    hasher.finalize().into()
}

/// Build the canonical CBOR preimage.
/// Format: [schema_version, [[kind, namespace, name, normalized_spec], ...]]
pub fn build_canonical_cbor(resources: &[ResourceDescriptor]) -> Vec<u8> {
    let entries = resources
        .iter()
        .map(|r| {
            Value::Array(vec![
                Value::Text(r.kind.as_str().to_string()),
                match &r.namespace {
                    Some(ns) => Value::Text(ns.clone()),
                    None => Value::Null,
                },
                Value::Text(r.name.clone()),
                json_to_cbor(&r.normalized_spec()),
            ])
        })
        .collect();

    let array = Value::Array(vec![
        Value::Integer(SCHEMA_VERSION.into()),
        Value::Array(entries),
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&array, &mut buf).expect("CBOR serialization into a Vec should not fail");
    buf
}

/// Convert JSON into CBOR with map keys in sorted order
pub fn json_to_cbor(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                Value::Integer(u.into())
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_cbor).collect()),
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (Value::Text(k.clone()), json_to_cbor(v)))
                    .collect(),
            )
        }
    }
}
