//! Primary hash derivation.
//!
//! The fingerprint is a pure function of a record's payload and is what the
//! downstream consumer groups and deduplicates on, so it must be identical on
//! every replay of the same record.
//!
//! Resolution order:
//!
//! 1. `hashes`: the event already carries computed hashes; the first one is
//!    the primary hash when it is 32 hex characters.
//! 2. `fingerprint`: explicit grouping values, unless it is the bare
//!    `{{ default }}` marker.
//! 3. Default components: last exception `type` + `value`, else the message,
//!    else the canonical JSON of the whole payload.
//!
//! Digests are SHA-256, hex-encoded and truncated to 32 characters.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::Record;

/// Length of a primary hash in hex characters.
pub const FINGERPRINT_HEX_LEN: usize = 32;

const DEFAULT_MARKER: &str = "{{ default }}";

/// Derived identity hash of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the primary hash of a record.
#[must_use]
pub fn fingerprint(record: &Record) -> Fingerprint {
    fingerprint_payload(&record.payload)
}

/// Compute the primary hash of a bare payload.
#[must_use]
pub fn fingerprint_payload(payload: &Value) -> Fingerprint {
    if let Some(stored) = stored_primary_hash(payload) {
        return Fingerprint(stored);
    }
    Fingerprint(hash_components(&grouping_components(payload)))
}

fn stored_primary_hash(payload: &Value) -> Option<String> {
    let first = payload.get("hashes")?.as_array()?.first()?.as_str()?;
    let trimmed = first.trim();
    let well_formed =
        trimmed.len() == FINGERPRINT_HEX_LEN && trimmed.bytes().all(|b| b.is_ascii_hexdigit());
    well_formed.then(|| trimmed.to_ascii_lowercase())
}

fn grouping_components(payload: &Value) -> Vec<String> {
    if let Some(values) = explicit_fingerprint(payload) {
        return values;
    }

    if let Some(exc) = last_exception(payload) {
        let ty = exc.get("type").and_then(Value::as_str).unwrap_or_default();
        let value = exc.get("value").and_then(Value::as_str).unwrap_or_default();
        if !ty.is_empty() || !value.is_empty() {
            return vec![ty.to_string(), value.to_string()];
        }
    }

    let message = payload
        .get("logentry")
        .and_then(|l| l.get("formatted"))
        .and_then(Value::as_str)
        .or_else(|| payload.get("message").and_then(Value::as_str));
    if let Some(message) = message.filter(|m| !m.is_empty()) {
        return vec![message.to_string()];
    }

    // serde_json maps are ordered by key, so this rendering is canonical.
    vec![payload.to_string()]
}

fn explicit_fingerprint(payload: &Value) -> Option<Vec<String>> {
    let values: Vec<String> = payload
        .get("fingerprint")?
        .as_array()?
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    if values.is_empty() || (values.len() == 1 && values[0] == DEFAULT_MARKER) {
        None
    } else {
        Some(values)
    }
}

fn last_exception(payload: &Value) -> Option<&Value> {
    let exception = payload.get("exception")?;
    exception
        .get("values")
        .and_then(Value::as_array)
        .or_else(|| exception.as_array())?
        .last()
}

fn hash_components(components: &[String]) -> String {
    let mut hasher = Sha256::new();
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(component.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_HEX_LEN);
    digest
}
