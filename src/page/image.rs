//! Stored page images and delta records
//!
//! Every stored segment is framed with a fixed-size header followed by a
//! bincode payload.
//!
//! ```text
//! +----------------+----------------+----------------+
//! |  xxh3 checksum |    Length      |     Kind       |
//! |    8 bytes     |    4 bytes     |    4 bytes     |
//! +----------------+----------------+----------------+
//! |                 bincode payload                  |
//! +--------------------------------------------------+
//! ```
//!
//! A frame whose length field disagrees with the number of bytes read is a
//! structural corruption and panics. A checksum or payload mismatch returns
//! [`Status::Corruption`].

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::status::Status;
use crate::txn::{Timestamp, TxnId};

/// Frame header size in bytes (8 + 4 + 4)
pub const FRAME_HEADER_SIZE: usize = 16;

/// Kind tag stored in a frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    /// Full page image
    Image = 1,
    /// Delta record appended after an image
    Delta = 2,
}

impl FrameKind {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Image),
            2 => Some(FrameKind::Delta),
            _ => None,
        }
    }
}

/// Child slot of a stored internal page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildImage {
    /// Smallest key routed to this child
    pub key: Vec<u8>,
    /// Stored address, `None` for a child that was never written
    pub addr: Option<u64>,
}

/// Full stored image of a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageImage {
    /// Leaf page: sorted key/value rows
    Leaf {
        /// Rows in key order
        rows: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Internal page: sorted child slots
    Internal {
        /// Children in key order
        children: Vec<ChildImage>,
    },
}

/// One key-tagged operation of a delta record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Value with its time window; `stop` is set when the value was later
    /// removed.
    Insert {
        /// Value bytes
        value: Vec<u8>,
        /// Writing transaction
        start_txn: TxnId,
        /// Commit timestamp of the write
        start_ts: Timestamp,
        /// Removing transaction and timestamp
        stop: Option<(TxnId, Timestamp)>,
    },
    /// Tombstone
    Delete {
        /// Removing transaction
        txn: TxnId,
        /// Commit timestamp of the removal
        ts: Timestamp,
    },
}

/// Keyed delta operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Row key
    pub key: Vec<u8>,
    /// Operation on the row
    pub op: DeltaOp,
}

/// Incremental changes written since the previous image or delta
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// Operations in the order they were written
    pub entries: Vec<DeltaEntry>,
}

fn encode_frame<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Vec<u8>, Status> {
    let body = bincode::serialize(payload).map_err(|_| Status::InvalidArgument)?;
    let length = u32::try_from(body.len()).map_err(|_| Status::InvalidArgument)?;

    let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    bytes.extend_from_slice(&xxh3_64(&body).to_le_bytes());
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.extend_from_slice(&(kind as u32).to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode_frame(bytes: &[u8], expected: FrameKind) -> Result<&[u8], Status> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(Status::Corruption);
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[0..8]);
    let checksum = u64::from_le_bytes(word);
    let mut half = [0u8; 4];
    half.copy_from_slice(&bytes[8..12]);
    let length = u32::from_le_bytes(half) as usize;
    half.copy_from_slice(&bytes[12..16]);
    let kind = FrameKind::from_u32(u32::from_le_bytes(half));

    let body = &bytes[FRAME_HEADER_SIZE..];
    if body.len() != length {
        tracing::error!(
            stored = body.len(),
            header = length,
            "page segment size disagrees with its header length"
        );
        return Err(Status::Corruption);
    }
    if kind != Some(expected) || xxh3_64(body) != checksum {
        return Err(Status::Corruption);
    }
    Ok(body)
}

impl PageImage {
    /// Serialize into a framed segment
    pub fn encode(&self) -> Result<Vec<u8>, Status> {
        encode_frame(FrameKind::Image, self)
    }

    /// Parse a framed segment
    pub fn decode(bytes: &[u8]) -> Result<Self, Status> {
        let body = decode_frame(bytes, FrameKind::Image)?;
        bincode::deserialize(body).map_err(|_| Status::Corruption)
    }
}

impl DeltaRecord {
    /// Serialize into a framed segment
    pub fn encode(&self) -> Result<Vec<u8>, Status> {
        encode_frame(FrameKind::Delta, self)
    }

    /// Parse a framed segment
    pub fn decode(bytes: &[u8]) -> Result<Self, Status> {
        let body = decode_frame(bytes, FrameKind::Delta)?;
        bincode::deserialize(body).map_err(|_| Status::Corruption)
    }

    /// Whether the record carries no operations
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_leaf() -> PageImage {
        PageImage::Leaf {
            rows: vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ],
        }
    }

    #[test]
    fn test_image_decodes_what_it_encodes() {
        let image = sample_leaf();
        let bytes = image.encode().unwrap();
        assert_eq!(PageImage::decode(&bytes).unwrap(), image);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let mut bytes = sample_leaf().encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(PageImage::decode(&bytes), Err(Status::Corruption));
    }

    #[test]
    fn test_kind_mismatch_is_corruption() {
        let bytes = DeltaRecord::default().encode().unwrap();
        assert_eq!(PageImage::decode(&bytes), Err(Status::Corruption));
    }

    #[test]
    fn test_short_header_is_corruption() {
        assert_eq!(DeltaRecord::decode(&[0u8; 5]), Err(Status::Corruption));
    }

    #[test]
    fn test_length_mismatch_is_corruption() {
        let mut bytes = sample_leaf().encode().unwrap();
        bytes.push(0);
        assert_eq!(PageImage::decode(&bytes), Err(Status::Corruption));
        bytes.truncate(bytes.len() - 2);
        assert_eq!(PageImage::decode(&bytes), Err(Status::Corruption));
    }
}
