//! Chunked, resumable evidence uploads
//!
//! A client declares up front how many chunks each stream will have, then sends
//! chunks by index in any order, over any number of parallel connections.
//! Writes are index-addressed and idempotent, so "resend chunk N" is the only
//! retry protocol a flaky mobile client needs.
//!
//! ## Concurrency
//!
//! Each stream keeps its chunks in a `DashMap<u32, Bytes>`; puts to different
//! indexes land on independent shards. Received counters are atomics. A
//! per-session `RwLock<bool>` gate lets puts proceed concurrently (read side)
//! while `finalize` takes the write side, so no chunk can slip in between the
//! completeness check and assembly.
//!
//! ## Lifecycle
//!
//! `begin_session` → `put_chunk`* → `finalize` (session deleted once the
//! commit succeeds) or TTL expiry
//! (session garbage-collected, a tombstone remembers it so later calls get
//! `SessionExpired` instead of `UnknownSession`).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{StreamType, HASH_PREFIX};
use crate::ids::IdGenerator;
use crate::types::LifelineError;

// ============================================================================
// Configuration
// ============================================================================

/// Chunk store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkStoreConfig {
    /// Sessions not finalized within this window are discarded (default: 1 hour)
    pub session_ttl_secs: u64,
    /// Largest accepted chunk (default: 8 MiB)
    pub max_chunk_bytes: usize,
    /// Upper bound on declared chunks per stream
    pub max_chunks_per_stream: u32,
    /// How often the GC task sweeps expired sessions
    pub gc_interval_secs: u64,
    /// How long expired session ids are remembered
    pub tombstone_retention_secs: u64,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 3600,
            max_chunk_bytes: 8 * 1024 * 1024,
            max_chunks_per_stream: 65_536,
            gc_interval_secs: 60,
            tombstone_retention_secs: 3600,
        }
    }
}

impl ChunkStoreConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UploadError {
    #[error("Recording {0} already has a live upload session")]
    DuplicateSession(String),

    #[error("Unknown upload session: {0}")]
    UnknownSession(String),

    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Stream {0} was not declared for this session")]
    StreamNotDeclared(StreamType),

    #[error("Chunk index {index} out of range for {stream_type} ({total} chunks declared)")]
    IndexOutOfRange {
        stream_type: StreamType,
        index: u32,
        total: u32,
    },

    #[error("Chunk of {size} bytes exceeds limit of {max} bytes")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("Invalid stream declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Stream {stream_type} is missing chunks {missing_indexes:?}")]
    IncompleteUpload {
        stream_type: StreamType,
        missing_indexes: Vec<u32>,
    },
}

impl From<UploadError> for LifelineError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::DuplicateSession(_) => LifelineError::Conflict(err.to_string()),
            UploadError::UnknownSession(_) => LifelineError::NotFound(err.to_string()),
            UploadError::SessionExpired(_) => LifelineError::NotFound(err.to_string()),
            UploadError::StreamNotDeclared(_)
            | UploadError::IndexOutOfRange { .. }
            | UploadError::ChunkTooLarge { .. }
            | UploadError::InvalidDeclaration(_) => LifelineError::Validation(err.to_string()),
            UploadError::IncompleteUpload {
                stream_type,
                missing_indexes,
            } => LifelineError::IncompleteUpload {
                stream_type,
                missing_indexes,
            },
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Acknowledgement for one stored chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub stream_type: StreamType,
    /// Distinct chunks received for this stream
    pub received: u32,
    /// Chunks declared for this stream
    pub total_expected: u32,
    /// Distinct chunks received across all streams
    pub session_received: u32,
    /// Chunks declared across all streams
    pub session_total: u32,
}

/// One fully assembled stream, ready for the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledStream {
    pub bytes: Bytes,
    pub content_hash: String,
    pub size_bytes: u64,
    pub chunk_count: u32,
}

/// Per-stream upload progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProgress {
    pub stream_type: StreamType,
    pub total_chunks: u32,
    pub received: u32,
    pub missing_indexes: Vec<u32>,
}

/// Resumption view of a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub recording_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub streams: Vec<StreamProgress>,
}

/// Chunk slots for one declared stream
struct StreamSlots {
    total: u32,
    chunks: DashMap<u32, Bytes>,
    received: AtomicU32,
}

impl StreamSlots {
    fn new(total: u32) -> Self {
        Self {
            total,
            chunks: DashMap::new(),
            received: AtomicU32::new(0),
        }
    }

    fn missing_indexes(&self) -> Vec<u32> {
        (0..self.total)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }
}

/// One in-flight upload
struct UploadSession {
    session_id: String,
    recording_id: String,
    streams: BTreeMap<StreamType, StreamSlots>,
    session_total: u32,
    session_received: AtomicU32,
    created_at: DateTime<Utc>,
    started: Instant,
    /// `true` once finalized; puts hold the read side
    gate: RwLock<bool>,
}

impl UploadSession {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.started.elapsed() >= ttl
    }
}

// ============================================================================
// Chunk Store
// ============================================================================

/// Index-addressed chunk store for multi-stream evidence uploads
pub struct ChunkStore {
    config: ChunkStoreConfig,
    ids: Arc<dyn IdGenerator>,
    sessions: DashMap<String, Arc<UploadSession>>,
    /// recording_id -> live session_id
    by_recording: DashMap<String, String>,
    /// Expired session ids and when they expired
    tombstones: DashMap<String, Instant>,
}

impl ChunkStore {
    pub fn new(config: ChunkStoreConfig, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            config,
            ids,
            sessions: DashMap::new(),
            by_recording: DashMap::new(),
            tombstones: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ChunkStoreConfig {
        &self.config
    }

    /// Open an upload session for a recording
    pub fn begin_session(
        &self,
        recording_id: &str,
        expected_streams: &HashMap<StreamType, u32>,
    ) -> Result<String, UploadError> {
        if recording_id.trim().is_empty() {
            return Err(UploadError::InvalidDeclaration(
                "recording id must not be empty".into(),
            ));
        }
        if expected_streams.is_empty() {
            return Err(UploadError::InvalidDeclaration(
                "at least one stream must be declared".into(),
            ));
        }
        for (stream_type, total) in expected_streams {
            if *total == 0 || *total > self.config.max_chunks_per_stream {
                return Err(UploadError::InvalidDeclaration(format!(
                    "{} declares {} chunks (allowed 1..={})",
                    stream_type, total, self.config.max_chunks_per_stream
                )));
            }
        }

        // A stale session for the same recording does not block a new one
        let existing = self
            .by_recording
            .get(recording_id)
            .map(|s| s.value().clone());
        if let Some(existing_id) = existing {
            let expired = self
                .sessions
                .get(&existing_id)
                .map(|s| s.is_expired(self.config.session_ttl()))
                .unwrap_or(true);
            if !expired {
                return Err(UploadError::DuplicateSession(recording_id.to_string()));
            }
            self.expire_session(&existing_id);
        }

        let session_id = self.ids.next_id("upl");
        match self.by_recording.entry(recording_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(UploadError::DuplicateSession(recording_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session_id.clone());
            }
        }

        let streams: BTreeMap<StreamType, StreamSlots> = expected_streams
            .iter()
            .map(|(stream_type, total)| (*stream_type, StreamSlots::new(*total)))
            .collect();
        let session_total = expected_streams.values().sum();

        let session = UploadSession {
            session_id: session_id.clone(),
            recording_id: recording_id.to_string(),
            streams,
            session_total,
            session_received: AtomicU32::new(0),
            created_at: Utc::now(),
            started: Instant::now(),
            gate: RwLock::new(false),
        };
        self.sessions.insert(session_id.clone(), Arc::new(session));

        info!(
            session_id = %session_id,
            recording_id = %recording_id,
            streams = expected_streams.len(),
            total_chunks = session_total,
            "Upload session started"
        );

        Ok(session_id)
    }

    /// Store one chunk; re-sending an index overwrites it
    pub async fn put_chunk(
        &self,
        session_id: &str,
        stream_type: StreamType,
        chunk_index: u32,
        bytes: Bytes,
    ) -> Result<ChunkAck, UploadError> {
        let session = self.live_session(session_id)?;

        if bytes.len() > self.config.max_chunk_bytes {
            return Err(UploadError::ChunkTooLarge {
                size: bytes.len(),
                max: self.config.max_chunk_bytes,
            });
        }

        let slots = session
            .streams
            .get(&stream_type)
            .ok_or(UploadError::StreamNotDeclared(stream_type))?;

        if chunk_index >= slots.total {
            return Err(UploadError::IndexOutOfRange {
                stream_type,
                index: chunk_index,
                total: slots.total,
            });
        }

        let finalized = session.gate.read().await;
        if *finalized {
            return Err(UploadError::UnknownSession(session_id.to_string()));
        }

        let size = bytes.len();
        let replaced = slots.chunks.insert(chunk_index, bytes).is_some();
        let (received, session_received) = if replaced {
            (
                slots.received.load(Ordering::SeqCst),
                session.session_received.load(Ordering::SeqCst),
            )
        } else {
            (
                slots.received.fetch_add(1, Ordering::SeqCst) + 1,
                session.session_received.fetch_add(1, Ordering::SeqCst) + 1,
            )
        };
        drop(finalized);

        debug!(
            session_id = %session_id,
            stream = %stream_type,
            index = chunk_index,
            size = size,
            replaced = replaced,
            received = received,
            "Stored chunk"
        );

        Ok(ChunkAck {
            stream_type,
            received,
            total_expected: slots.total,
            session_received,
            session_total: session.session_total,
        })
    }

    /// Assemble and hash every stream, then delete the session
    ///
    /// Nothing is assembled unless every declared stream is complete.
    pub async fn finalize(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<StreamType, AssembledStream>, UploadError> {
        self.finalize_with(session_id, |assembled| async move {
            Ok::<_, UploadError>(assembled)
        })
        .await
    }

    /// Assemble every stream and hand it to `commit`
    ///
    /// The session is deleted only once `commit` succeeds. Puts stay blocked
    /// while it runs; on failure the session is left as it was so the client
    /// can retry.
    pub async fn finalize_with<T, E, F, Fut>(&self, session_id: &str, commit: F) -> Result<T, E>
    where
        F: FnOnce(BTreeMap<StreamType, AssembledStream>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<UploadError>,
    {
        let session = self.live_session(session_id)?;
        let mut finalized = session.gate.write().await;
        if *finalized {
            return Err(UploadError::UnknownSession(session_id.to_string()).into());
        }

        let assembled = assemble(session_id, &session)?;
        let streams = assembled.len();
        let bytes = assembled.values().map(|s| s.size_bytes).sum::<u64>();

        let output = match commit(assembled).await {
            Ok(output) => output,
            Err(e) => {
                warn!(session_id = %session_id, "Commit failed, upload session kept for retry");
                return Err(e);
            }
        };

        *finalized = true;
        drop(finalized);
        self.sessions.remove(session_id);
        self.by_recording
            .remove_if(&session.recording_id, |_, live| live == session_id);

        info!(
            session_id = %session_id,
            recording_id = %session.recording_id,
            streams = streams,
            bytes = bytes,
            "Upload session finalized"
        );

        Ok(output)
    }

    /// Progress view for resuming an upload
    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus, UploadError> {
        let session = self.live_session(session_id)?;
        let ttl = chrono::Duration::seconds(self.config.session_ttl_secs as i64);
        let streams = session
            .streams
            .iter()
            .map(|(stream_type, slots)| StreamProgress {
                stream_type: *stream_type,
                total_chunks: slots.total,
                received: slots.received.load(Ordering::SeqCst),
                missing_indexes: slots.missing_indexes(),
            })
            .collect();

        Ok(SessionStatus {
            session_id: session.session_id.clone(),
            recording_id: session.recording_id.clone(),
            created_at: session.created_at,
            expires_at: session.created_at + ttl,
            streams,
        })
    }

    /// Drop every session past its TTL and prune old tombstones
    pub fn collect_expired(&self) -> usize {
        let ttl = self.config.session_ttl();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(ttl))
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in &expired {
            self.expire_session(session_id);
        }

        let retention = Duration::from_secs(self.config.tombstone_retention_secs);
        self.tombstones
            .retain(|_, expired_at| expired_at.elapsed() < retention);

        expired.len()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn live_session(&self, session_id: &str) -> Result<Arc<UploadSession>, UploadError> {
        let session = self.sessions.get(session_id).map(|s| Arc::clone(s.value()));
        match session {
            Some(session) if session.is_expired(self.config.session_ttl()) => {
                self.expire_session(session_id);
                Err(UploadError::SessionExpired(session_id.to_string()))
            }
            Some(session) => Ok(session),
            None if self.tombstones.contains_key(session_id) => {
                Err(UploadError::SessionExpired(session_id.to_string()))
            }
            None => Err(UploadError::UnknownSession(session_id.to_string())),
        }
    }

    fn expire_session(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.by_recording
                .remove_if(&session.recording_id, |_, live| live == session_id);
            self.tombstones.insert(session_id.to_string(), Instant::now());
            warn!(
                session_id = %session_id,
                recording_id = %session.recording_id,
                received = session.session_received.load(Ordering::SeqCst),
                expected = session.session_total,
                "Upload session expired, chunks released"
            );
        }
    }
}

/// Concatenate and hash every stream; fails on the first incomplete one
fn assemble(
    session_id: &str,
    session: &UploadSession,
) -> Result<BTreeMap<StreamType, AssembledStream>, UploadError> {
    for (stream_type, slots) in &session.streams {
        let missing_indexes = slots.missing_indexes();
        if !missing_indexes.is_empty() {
            debug!(
                session_id = %session_id,
                stream = %stream_type,
                missing = missing_indexes.len(),
                "Finalize rejected, upload incomplete"
            );
            return Err(UploadError::IncompleteUpload {
                stream_type: *stream_type,
                missing_indexes,
            });
        }
    }

    let mut assembled = BTreeMap::new();
    for (stream_type, slots) in &session.streams {
        let mut data = Vec::new();
        let mut hasher = Sha256::new();
        for index in 0..slots.total {
            let chunk = slots.chunks.get(&index).ok_or_else(|| UploadError::IncompleteUpload {
                stream_type: *stream_type,
                missing_indexes: vec![index],
            })?;
            let chunk = chunk.value();
            hasher.update(chunk);
            data.extend_from_slice(chunk);
        }
        let content_hash = format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()));
        let size_bytes = data.len() as u64;
        assembled.insert(
            *stream_type,
            AssembledStream {
                bytes: Bytes::from(data),
                content_hash,
                size_bytes,
                chunk_count: slots.total,
            },
        );
    }
    Ok(assembled)
}

/// Spawn the periodic sweep for expired upload sessions
pub fn spawn_session_gc_task(
    store: Arc<ChunkStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        loop {
            interval_timer.tick().await;
            let removed = store.collect_expired();
            if removed > 0 {
                info!(removed = removed, "Collected expired upload sessions");
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
