//! Archive blob format.
//!
//! Each archived record is one self-describing JSON document:
//!
//! ```text
//! {
//!   "format_version": 1,
//!   "id": "R1",
//!   "partition_key": "R1",
//!   "timestamp": 1700000000000,
//!   "payload": { ... },
//!   "checksum": 123456789      // CRC32 of the serialized payload
//! }
//! ```
//!
//! Cache attributes (`expires_at`) are never archived.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::{Record, RecordId, Timestamp};

/// Current archive format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    id: RecordId,
    partition_key: String,
    timestamp: Timestamp,
    payload: serde_json::Value,
    checksum: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("malformed archive document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported archive format version {0}")]
    UnsupportedVersion(u32),

    #[error("payload checksum mismatch: stored={stored:#010x} computed={computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("archive entry belongs to {found}, expected {expected}")]
    IdMismatch { expected: RecordId, found: RecordId },
}

/// Serialize a record into its archive document.
pub fn encode_record(record: &Record) -> Result<Vec<u8>, FormatError> {
    let payload_bytes = serde_json::to_vec(&record.payload)?;
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        id: record.id.clone(),
        partition_key: record.partition_key.clone(),
        timestamp: record.timestamp,
        payload: record.payload.clone(),
        checksum: payload_checksum(&payload_bytes),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse an archive document and verify its checksum.
pub fn decode_record(bytes: &[u8]) -> Result<Record, FormatError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(envelope.format_version));
    }

    let payload_bytes = serde_json::to_vec(&envelope.payload)?;
    let computed = payload_checksum(&payload_bytes);
    if computed != envelope.checksum {
        return Err(FormatError::ChecksumMismatch {
            stored: envelope.checksum,
            computed,
        });
    }

    Ok(Record {
        id: envelope.id,
        partition_key: envelope.partition_key,
        timestamp: envelope.timestamp,
        payload: envelope.payload,
        expires_at: None,
    })
}

/// Like [`decode_record`], but also checks that the blob belongs to `expected`.
pub fn decode_record_for(expected: &RecordId, bytes: &[u8]) -> Result<Record, FormatError> {
    let record = decode_record(bytes)?;
    if &record.id != expected {
        return Err(FormatError::IdMismatch {
            expected: expected.clone(),
            found: record.id,
        });
    }
    Ok(record)
}

fn payload_checksum(payload_bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload_bytes);
    hasher.finalize()
}
