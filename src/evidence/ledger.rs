//! Append-only, hash-chained evidence ledger
//!
//! `commit` is the only write path for evidence. Every commit and every share
//! grant appends a [`LedgerEntry`] whose hash covers the previous entry's hash,
//! starting from `"genesis"`:
//!
//! ```text
//! entry_hash = H(tag ∥ seq ∥ kind ∥ evidence_id ∥ payload_digest ∥ recorded_at ∥ prev_hash)
//! ```
//!
//! Records are never removed. `verify` re-reads stream bytes from the object
//! store; a mismatch only raises the sticky `tamper_suspected` flag.

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::{combine_hashes, compute_hash, AssembledStream, StreamType, HASH_PREFIX};
use crate::collaborators::{ObjectStore, ObjectStoreError};
use crate::ids::IdGenerator;
use crate::types::LifelineError;

const GENESIS: &str = "genesis";
const ENTRY_HASH_TAG: &[u8] = b"lifeline-ledger-entry-v1";
const COMMIT_NOTICE_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Evidence not found: {0}")]
    NotFound(String),

    #[error("Nothing to commit: no streams supplied")]
    EmptyCommit,

    #[error("Share party must not be empty")]
    EmptyParty,

    #[error("Evidence {0} is immutable and cannot be deleted")]
    DeletionRejected(String),

    #[error("Stored bytes for {evidence_id} no longer match: {mismatches:?}")]
    Tampered {
        evidence_id: String,
        mismatches: Vec<StreamType>,
    },

    #[error("Object storage: {0}")]
    Storage(#[from] ObjectStoreError),
}

impl From<LedgerError> for LifelineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => LifelineError::NotFound(format!("evidence {id}")),
            LedgerError::EmptyCommit | LedgerError::EmptyParty => {
                LifelineError::Validation(err.to_string())
            }
            LedgerError::DeletionRejected(_) => LifelineError::Conflict(err.to_string()),
            LedgerError::Tampered {
                evidence_id,
                mismatches,
            } => LifelineError::TamperSuspected {
                evidence_id,
                mismatches,
            },
            LedgerError::Storage(e) => e.into(),
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// One stored stream of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStream {
    pub size_bytes: u64,
    pub content_hash: String,
    pub storage_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareGrant {
    pub party: String,
    pub granted_at: DateTime<Utc>,
}

/// Immutable evidence record; only `shared_with` and `tamper_suspected` change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub evidence_id: String,
    pub incident_id: String,
    pub user_id: String,
    pub streams: BTreeMap<StreamType, StoredStream>,
    pub combined_hash: String,
    pub finalized_at: DateTime<Utc>,
    pub shared_with: Vec<ShareGrant>,
    pub tamper_suspected: bool,
    pub ledger_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Commit,
    ShareGrant,
}

impl LedgerEntryKind {
    fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Commit => "commit",
            LedgerEntryKind::ShareGrant => "share_grant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub kind: LedgerEntryKind,
    pub evidence_id: String,
    pub payload_digest: String,
    pub recorded_at: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl LedgerEntry {
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ENTRY_HASH_TAG);
        hasher.update(self.seq.to_be_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.evidence_id.as_bytes());
        hasher.update(self.payload_digest.as_bytes());
        hasher.update(
            self.recorded_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        hasher.update(self.prev_hash.as_bytes());
        format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
    }
}

/// Result of re-reading a record's streams from storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub evidence_id: String,
    pub ok: bool,
    pub mismatches: Vec<StreamType>,
    pub combined_ok: bool,
}

/// Result of walking the whole hash chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub entries: u64,
    pub ok: bool,
    /// First entry whose hash or link does not check out
    pub broken_at: Option<u64>,
}

/// Broadcast after every successful commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceCommitted {
    pub evidence_id: String,
    pub incident_id: String,
    pub user_id: String,
    pub combined_hash: String,
}

// ============================================================================
// Ledger
// ============================================================================

pub struct EvidenceLedger {
    store: Arc<dyn ObjectStore>,
    ids: Arc<dyn IdGenerator>,
    records: DashMap<String, EvidenceRecord>,
    by_incident: DashMap<String, Vec<String>>,
    /// Appends are serialized here; record mutations happen under the same lock
    chain: Mutex<Vec<LedgerEntry>>,
    commits: broadcast::Sender<EvidenceCommitted>,
}

impl EvidenceLedger {
    pub fn new(store: Arc<dyn ObjectStore>, ids: Arc<dyn IdGenerator>) -> Self {
        let (commits, _) = broadcast::channel(COMMIT_NOTICE_CAPACITY);
        Self {
            store,
            ids,
            records: DashMap::new(),
            by_incident: DashMap::new(),
            chain: Mutex::new(Vec::new()),
            commits,
        }
    }

    /// Receive a notice for every future commit
    pub fn subscribe_commits(&self) -> broadcast::Receiver<EvidenceCommitted> {
        self.commits.subscribe()
    }

    /// Store assembled streams and append an immutable record
    pub async fn commit(
        &self,
        incident_id: &str,
        user_id: &str,
        assembled: BTreeMap<StreamType, AssembledStream>,
    ) -> Result<EvidenceRecord, LedgerError> {
        if assembled.is_empty() {
            return Err(LedgerError::EmptyCommit);
        }

        let mut streams = BTreeMap::new();
        for (stream_type, stream) in assembled {
            let storage_ref = self.store.put(stream.bytes).await?;
            debug!(
                stream_type = %stream_type,
                storage_ref = %storage_ref,
                size = stream.size_bytes,
                "Stored evidence stream"
            );
            streams.insert(
                stream_type,
                StoredStream {
                    size_bytes: stream.size_bytes,
                    content_hash: stream.content_hash,
                    storage_ref,
                },
            );
        }

        // BTreeMap iteration is already canonical stream order
        let combined_hash = combine_hashes(streams.values().map(|s| s.content_hash.as_str()));
        let evidence_id = self.ids.next_id("evd");
        let payload_digest = compute_hash(
            format!("{incident_id}\n{user_id}\n{combined_hash}").as_bytes(),
        );

        let mut chain = self.chain.lock().await;
        let entry = append_entry(
            &mut chain,
            LedgerEntryKind::Commit,
            &evidence_id,
            payload_digest,
        );

        let record = EvidenceRecord {
            evidence_id: evidence_id.clone(),
            incident_id: incident_id.to_string(),
            user_id: user_id.to_string(),
            streams,
            combined_hash: combined_hash.clone(),
            finalized_at: entry.recorded_at,
            shared_with: Vec::new(),
            tamper_suspected: false,
            ledger_seq: entry.seq,
        };
        self.records.insert(evidence_id.clone(), record.clone());
        self.by_incident
            .entry(incident_id.to_string())
            .or_default()
            .push(evidence_id.clone());
        drop(chain);

        info!(
            evidence_id = %evidence_id,
            incident_id = %incident_id,
            combined_hash = %combined_hash,
            seq = record.ledger_seq,
            "Committed evidence record"
        );

        // No listener is not an error
        let _ = self.commits.send(EvidenceCommitted {
            evidence_id,
            incident_id: incident_id.to_string(),
            user_id: user_id.to_string(),
            combined_hash,
        });

        Ok(record)
    }

    pub fn get(&self, evidence_id: &str) -> Result<EvidenceRecord, LedgerError> {
        self.records
            .get(evidence_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| LedgerError::NotFound(evidence_id.to_string()))
    }

    pub fn records_for_incident(&self, incident_id: &str) -> Vec<EvidenceRecord> {
        let ids = self
            .by_incident
            .get(incident_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id).ok()).collect()
    }

    /// Re-hash every stream from storage
    ///
    /// A missing blob counts as a mismatch. Other storage failures are returned
    /// as errors without touching the record.
    pub async fn verify(&self, evidence_id: &str) -> Result<VerifyReport, LedgerError> {
        let record = self.get(evidence_id)?;

        let mut mismatches = Vec::new();
        let mut observed = Vec::with_capacity(record.streams.len());
        for (stream_type, stream) in &record.streams {
            match self.store.get(&stream.storage_ref).await {
                Ok(bytes) => {
                    let hash = compute_hash(&bytes);
                    if hash != stream.content_hash || bytes.len() as u64 != stream.size_bytes {
                        mismatches.push(*stream_type);
                    }
                    observed.push(hash);
                }
                Err(ObjectStoreError::NotFound(_)) => {
                    mismatches.push(*stream_type);
                    observed.push(String::new());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let combined_ok = combine_hashes(observed.iter().map(String::as_str)) == record.combined_hash;
        let ok = mismatches.is_empty() && combined_ok;

        if !ok {
            self.flag_tamper(evidence_id, &mismatches).await;
        } else {
            debug!(evidence_id = %evidence_id, "Evidence verified");
        }

        Ok(VerifyReport {
            evidence_id: evidence_id.to_string(),
            ok,
            mismatches,
            combined_ok,
        })
    }

    /// Fetch one stream's bytes, refusing to hand out anything that fails its hash
    pub async fn read_stream(
        &self,
        evidence_id: &str,
        stream_type: StreamType,
    ) -> Result<bytes::Bytes, LedgerError> {
        let record = self.get(evidence_id)?;
        let stream = record.streams.get(&stream_type).ok_or_else(|| {
            LedgerError::NotFound(format!("{evidence_id}/{stream_type}"))
        })?;

        let bytes = self.store.get(&stream.storage_ref).await?;
        if compute_hash(&bytes) != stream.content_hash {
            self.flag_tamper(evidence_id, &[stream_type]).await;
            return Err(LedgerError::Tampered {
                evidence_id: evidence_id.to_string(),
                mismatches: vec![stream_type],
            });
        }
        Ok(bytes)
    }

    async fn flag_tamper(&self, evidence_id: &str, mismatches: &[StreamType]) {
        let _chain = self.chain.lock().await;
        if let Some(mut record) = self.records.get_mut(evidence_id) {
            record.tamper_suspected = true;
        }
        warn!(
            evidence_id = %evidence_id,
            mismatches = ?mismatches,
            "Evidence tamper suspected"
        );
    }

    /// Grant a party access; grants are only ever appended
    pub async fn grant_share(
        &self,
        evidence_id: &str,
        party: &str,
    ) -> Result<EvidenceRecord, LedgerError> {
        let party = party.trim();
        if party.is_empty() {
            return Err(LedgerError::EmptyParty);
        }

        let mut chain = self.chain.lock().await;
        let mut record = self
            .records
            .get_mut(evidence_id)
            .ok_or_else(|| LedgerError::NotFound(evidence_id.to_string()))?;

        let granted_at = Utc::now();
        let payload_digest = compute_hash(
            format!(
                "{party}\n{}",
                granted_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
            )
            .as_bytes(),
        );
        append_entry(
            &mut chain,
            LedgerEntryKind::ShareGrant,
            evidence_id,
            payload_digest,
        );
        record.shared_with.push(ShareGrant {
            party: party.to_string(),
            granted_at,
        });

        info!(evidence_id = %evidence_id, party = %party, "Granted evidence share");
        Ok(record.value().clone())
    }

    /// Evidence is never deleted; every request is refused
    pub fn request_deletion(&self, evidence_id: &str) -> Result<(), LedgerError> {
        if !self.records.contains_key(evidence_id) {
            return Err(LedgerError::NotFound(evidence_id.to_string()));
        }
        warn!(evidence_id = %evidence_id, "Rejected evidence deletion request");
        Err(LedgerError::DeletionRejected(evidence_id.to_string()))
    }

    /// Recompute every entry hash and link from genesis
    pub async fn verify_chain(&self) -> ChainReport {
        let chain = self.chain.lock().await;
        let mut prev_hash = GENESIS.to_string();
        let mut broken_at = None;

        for (i, entry) in chain.iter().enumerate() {
            if entry.seq != i as u64
                || entry.prev_hash != prev_hash
                || entry.compute_hash() != entry.entry_hash
            {
                broken_at = Some(i as u64);
                break;
            }
            prev_hash = entry.entry_hash.clone();
        }

        if let Some(seq) = broken_at {
            warn!(seq, "Ledger hash chain broken");
        }
        ChainReport {
            entries: chain.len() as u64,
            ok: broken_at.is_none(),
            broken_at,
        }
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.chain.lock().await.clone()
    }
}

fn append_entry(
    chain: &mut Vec<LedgerEntry>,
    kind: LedgerEntryKind,
    evidence_id: &str,
    payload_digest: String,
) -> LedgerEntry {
    let prev_hash = chain
        .last()
        .map(|e| e.entry_hash.clone())
        .unwrap_or_else(|| GENESIS.to_string());
    let mut entry = LedgerEntry {
        seq: chain.len() as u64,
        kind,
        evidence_id: evidence_id.to_string(),
        payload_digest,
        recorded_at: Utc::now(),
        prev_hash,
        entry_hash: String::new(),
    };
    entry.entry_hash = entry.compute_hash();
    chain.push(entry.clone());
    entry
}
