//! Completion marker wrapped around every committed artifact.
//!
//! An artifact is a JSON object carrying a format tag, the key it was written
//! under and a blake3 checksum of the exact payload bytes. Nothing time- or
//! process-dependent goes in, so the same value under the same key always
//! encodes to the same bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::core::errors::{FanoutError, Result};
use crate::storage::ArtifactKey;

pub const ENVELOPE_FORMAT: &str = "fanout.artifact.v1";

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: String,
    key: String,
    checksum: String,
    payload: Box<RawValue>,
}

fn checksum(payload: &str) -> String {
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

/// Serialize `value` as the artifact stored at `key`
pub fn encode<T: Serialize + ?Sized>(key: &ArtifactKey, value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_string(value)?;
    let envelope = Envelope {
        format: ENVELOPE_FORMAT.to_string(),
        key: key.as_str().to_string(),
        checksum: checksum(&payload),
        payload: RawValue::from_string(payload)?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse and verify an artifact read from `key`
///
/// Any mismatch is reported as [`FanoutError::CorruptArtifact`].
pub fn decode<T: DeserializeOwned>(key: &ArtifactKey, bytes: &[u8]) -> Result<T> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| FanoutError::corrupt(key.as_str(), format!("unreadable envelope: {}", e)))?;

    if envelope.format != ENVELOPE_FORMAT {
        return Err(FanoutError::corrupt(
            key.as_str(),
            format!("unknown format {:?}", envelope.format),
        ));
    }
    if envelope.key != key.as_str() {
        return Err(FanoutError::corrupt(
            key.as_str(),
            format!("written for key {}", envelope.key),
        ));
    }
    let payload = envelope.payload.get();
    if envelope.checksum != checksum(payload) {
        return Err(FanoutError::corrupt(key.as_str(), "checksum mismatch"));
    }

    serde_json::from_str(payload)
        .map_err(|e| FanoutError::corrupt(key.as_str(), format!("unexpected payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ArtifactKey {
        ArtifactKey::new("jail_scraper/04-30-2020/worker_0/cases.json")
    }

    #[test]
    fn test_encoding_is_byte_stable() {
        let rows = vec![vec!["a".to_string(), "b".to_string()]];
        assert_eq!(encode(&key(), &rows).unwrap(), encode(&key(), &rows).unwrap());

        let decoded: Vec<Vec<String>> = decode(&key(), &encode(&key(), &rows).unwrap()).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_truncated_artifact_is_corrupt() {
        let bytes = encode(&key(), &vec![1, 2, 3]).unwrap();
        let truncated = &bytes[..bytes.len() - 5];
        match decode::<Vec<i32>>(&key(), truncated) {
            Err(FanoutError::CorruptArtifact { .. }) => {}
            other => panic!("expected corrupt artifact, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let bytes = encode(&key(), &vec![1, 2, 3]).unwrap();
        let tampered = String::from_utf8(bytes).unwrap().replace("[1,2,3]", "[1,2,4]");
        match decode::<Vec<i32>>(&key(), tampered.as_bytes()) {
            Err(FanoutError::CorruptArtifact { reason, .. }) => assert_eq!(reason, "checksum mismatch"),
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_artifact_moved_to_other_key_is_rejected() {
        let bytes = encode(&key(), &vec![1]).unwrap();
        let other = ArtifactKey::new("jail_scraper/04-30-2020/worker_1/cases.json");
        assert!(decode::<Vec<i32>>(&other, &bytes).is_err());
    }
}
