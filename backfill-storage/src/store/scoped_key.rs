//! Collection-scoped key encoding for byte-ordered stores.
//!
//! A `CollectionScopedKey` cannot be built without a collection, and its
//! encoding sorts first by collection and then by position, so one
//! collection's rows form a contiguous, position-ordered key range.

use backfill_core::{BackfillError, CollectionKey, PositionIndex, StorageError};

/// Separator byte between the collection name and the position.
const SEPARATOR: u8 = 0xFF;

/// Bytes used by the big-endian position suffix.
const POSITION_LEN: usize = 8;

/// Key of one row in a byte-ordered store.
///
/// # Binary Format
///
/// - Bytes 0-1: collection name length (u16, big-endian)
/// - Next `len` bytes: collection name (UTF-8)
/// - 1 byte: separator (0xFF)
/// - Last 8 bytes: position (u64, big-endian)
///
/// The length prefix keeps collections that share a textual prefix
/// ("rust" and "rustjerk") in disjoint ranges. Big-endian positions make
/// lexicographic order equal numeric order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionScopedKey {
    collection: CollectionKey,
    position: PositionIndex,
}

impl CollectionScopedKey {
    pub fn new(collection: CollectionKey, position: PositionIndex) -> Self {
        Self {
            collection,
            position,
        }
    }

    pub fn collection(&self) -> &CollectionKey {
        &self.collection
    }

    pub fn position(&self) -> PositionIndex {
        self.position
    }

    /// Encode this key. Collection keys are at most 512 bytes, so the
    /// length always fits the u16 prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Self::collection_prefix(&self.collection);
        bytes.extend_from_slice(&self.position.to_be_bytes());
        bytes
    }

    /// Prefix shared by every key of a collection.
    pub fn collection_prefix(collection: &CollectionKey) -> Vec<u8> {
        let name = collection.as_str().as_bytes();
        let mut bytes = Vec::with_capacity(2 + name.len() + 1 + POSITION_LEN);
        bytes.extend_from_slice(&(name.len() as u16).to_be_bytes());
        bytes.extend_from_slice(name);
        bytes.push(SEPARATOR);
        bytes
    }

    /// Decode a key previously produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, BackfillError> {
        let corrupt = |reason: &str| {
            BackfillError::from(StorageError::CorruptKey {
                reason: reason.to_string(),
            })
        };

        if bytes.len() < 2 {
            return Err(corrupt("missing length prefix"));
        }
        let name_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let expected = 2 + name_len + 1 + POSITION_LEN;
        if bytes.len() != expected {
            return Err(corrupt("length does not match prefix"));
        }
        if bytes[2 + name_len] != SEPARATOR {
            return Err(corrupt("missing separator"));
        }

        let name = std::str::from_utf8(&bytes[2..2 + name_len])
            .map_err(|_| corrupt("collection name is not UTF-8"))?;
        let collection = CollectionKey::new(name).map_err(|e| corrupt(&e.to_string()))?;

        Ok(Self {
            collection,
            position: decode_position(&bytes[expected - POSITION_LEN..])?,
        })
    }
}

/// Read the position suffix of an encoded key without decoding the name.
pub fn position_from_key(bytes: &[u8]) -> Result<PositionIndex, BackfillError> {
    if bytes.len() < POSITION_LEN {
        return Err(StorageError::CorruptKey {
            reason: "key shorter than position suffix".to_string(),
        }
        .into());
    }
    decode_position(&bytes[bytes.len() - POSITION_LEN..])
}

fn decode_position(suffix: &[u8]) -> Result<PositionIndex, BackfillError> {
    let raw: [u8; POSITION_LEN] = suffix.try_into().map_err(|_| StorageError::CorruptKey {
        reason: "invalid position suffix".to_string(),
    })?;
    Ok(u64::from_be_bytes(raw))
}
