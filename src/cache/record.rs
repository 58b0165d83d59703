//! On-disk format of a single cache entry file.
//!
//! ```text
//! +-------+------------+------------------+-----------------+
//! | magic | header len |   JSON header    |     payload     |
//! | u32le |   u32le    | (header len B)   |  (data_len B)   |
//! +-------+------------+------------------+-----------------+
//! ```
//!
//! The header carries the key so a file can be matched back to its index
//! record, and the insertion generation so eviction order survives restarts.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{CacheEntry, CacheError};
use crate::network::Headers;

/// File magic ("CRR1").
const MAGIC: u32 = 0x4352_5231;

/// Fixed prefix: magic + header length.
const PREFIX_LEN: usize = 8;

/// Upper bound on the JSON header, to reject garbage lengths early.
const MAX_HEADER_LEN: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    etag: Option<String>,
    last_modified: Option<u64>,
    server_date: Option<u64>,
    ttl: u64,
    soft_ttl: u64,
    response_headers: Headers,
    data_len: u64,
    generation: u64,
}

/// A decoded entry file.
#[derive(Debug)]
pub(super) struct DecodedEntry {
    pub(super) key: String,
    pub(super) generation: u64,
    pub(super) entry: CacheEntry,
}

/// Serializes an entry into its file representation.
pub(super) fn encode(key: &str, entry: &CacheEntry, generation: u64) -> Result<Vec<u8>, CacheError> {
    let header = EntryHeader {
        key: key.to_string(),
        etag: entry.etag.clone(),
        last_modified: entry.last_modified,
        server_date: entry.server_date,
        ttl: entry.ttl,
        soft_ttl: entry.soft_ttl,
        response_headers: entry.response_headers.clone(),
        data_len: entry.data.len() as u64,
        generation,
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| CacheError::corrupt("entry header too large"))?;

    let mut out = Vec::with_capacity(PREFIX_LEN + header_bytes.len() + entry.data.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&entry.data);
    Ok(out)
}

/// Parses and validates an entry file.
pub(super) fn decode(bytes: &[u8]) -> Result<DecodedEntry, CacheError> {
    if bytes.len() < PREFIX_LEN {
        return Err(CacheError::corrupt("file shorter than entry prefix"));
    }
    let magic = read_u32(&bytes[0..4]);
    if magic != MAGIC {
        return Err(CacheError::corrupt(format!("bad magic {magic:#010x}")));
    }
    let header_len = read_u32(&bytes[4..8]) as usize;
    if header_len > MAX_HEADER_LEN || PREFIX_LEN + header_len > bytes.len() {
        return Err(CacheError::corrupt(format!(
            "header length {header_len} exceeds file size {}",
            bytes.len()
        )));
    }

    let header: EntryHeader = serde_json::from_slice(&bytes[PREFIX_LEN..PREFIX_LEN + header_len])
        .map_err(|error| CacheError::corrupt(format!("unreadable header: {error}")))?;

    let payload = &bytes[PREFIX_LEN + header_len..];
    if payload.len() as u64 != header.data_len {
        return Err(CacheError::corrupt(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.data_len
        )));
    }

    Ok(DecodedEntry {
        key: header.key,
        generation: header.generation,
        entry: CacheEntry {
            data: Bytes::copy_from_slice(payload),
            etag: header.etag,
            last_modified: header.last_modified,
            server_date: header.server_date,
            ttl: header.ttl,
            soft_ttl: header.soft_ttl,
            response_headers: header.response_headers,
        },
    })
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
