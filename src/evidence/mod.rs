//! Evidence custody pipeline
//!
//! ```text
//! client chunks ──► ChunkStore (per-session, index-addressed)
//!                        │ finalize: concatenate + sha256 per stream
//!                        ▼
//!                  EvidenceLedger ──► ObjectStore (put/get)
//!                        │ append-only, hash-chained entries
//!                        ▼
//!                  EvidenceAccess (short-lived signed references)
//! ```
//!
//! Records are write-once. Share grants only grow. There is no delete path.

pub mod access;
pub mod chunk_store;
pub mod ledger;

pub use access::{AccessConfig, AccessError, EvidenceAccess, SignedReference};
pub use chunk_store::{
    spawn_session_gc_task, AssembledStream, ChunkAck, ChunkStore, ChunkStoreConfig,
    SessionStatus, StreamProgress, UploadError,
};
pub use ledger::{
    ChainReport, EvidenceCommitted, EvidenceLedger, EvidenceRecord, LedgerEntry,
    LedgerEntryKind, LedgerError, ShareGrant, StoredStream, VerifyReport,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Prefix used on every content hash
pub const HASH_PREFIX: &str = "sha256-";

/// Kind of evidence stream inside one recording
///
/// The declaration order is the canonical order used for `combined_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    FrontVideo,
    BackVideo,
    Audio,
    Photo,
}

impl StreamType {
    pub const ALL: [StreamType; 4] = [
        StreamType::FrontVideo,
        StreamType::BackVideo,
        StreamType::Audio,
        StreamType::Photo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::FrontVideo => "front_video",
            StreamType::BackVideo => "back_video",
            StreamType::Audio => "audio",
            StreamType::Photo => "photo",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front_video" => Ok(StreamType::FrontVideo),
            "back_video" => Ok(StreamType::BackVideo),
            "audio" => Ok(StreamType::Audio),
            "photo" => Ok(StreamType::Photo),
            other => Err(format!("unknown stream type: {other}")),
        }
    }
}

/// Compute the prefixed SHA256 of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
}

/// Combined hash over per-stream hashes, already in canonical order
///
/// `H(content_hash_1 ∥ content_hash_2 ∥ ...)` over the prefixed hash strings.
pub fn combine_hashes<'a, I>(hashes: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for hash in hashes {
        hasher.update(hash.as_bytes());
    }
    format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
}
