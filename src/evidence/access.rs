//! Short-lived signed references to stored evidence
//!
//! A reference is an HS256 JWT naming one stream of one record and the party
//! it was issued to. Only the record's owner or a party the record has been
//! shared with can be issued one. Opening it checks the signature and expiry
//! (no leeway), then reads the stream through the ledger so bytes that fail
//! their hash are never served.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EvidenceLedger, LedgerError, StreamType};
use crate::types::LifelineError;

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Lifetime of a signed reference (default: 1 hour)
    pub ttl_secs: i64,
    /// HMAC secret; a random per-process secret is used when unset
    pub signing_secret: Option<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            signing_secret: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Signing secret must be at least {MIN_SECRET_LEN} characters")]
    WeakSecret,

    #[error("Access reference expired")]
    Expired,

    #[error("Invalid access reference: {0}")]
    InvalidToken(String),

    #[error("{party} has no access to evidence {evidence_id}")]
    NotShared { evidence_id: String, party: String },

    #[error("Failed to sign access reference: {0}")]
    Signing(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<AccessError> for LifelineError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Expired
            | AccessError::InvalidToken(_)
            | AccessError::NotShared { .. } => {
                LifelineError::Validation(err.to_string())
            }
            AccessError::WeakSecret | AccessError::Signing(_) => {
                LifelineError::Internal(err.to_string())
            }
            AccessError::Ledger(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessClaims {
    /// Party the reference was issued to
    sub: String,
    evidence_id: String,
    stream_type: StreamType,
    iat: i64,
    exp: i64,
}

/// Token plus its expiry, as handed to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedReference {
    pub token: String,
    pub evidence_id: String,
    pub stream_type: StreamType,
    pub expires_at: DateTime<Utc>,
}

pub struct EvidenceAccess {
    ledger: Arc<EvidenceLedger>,
    secret: String,
    ttl_secs: i64,
}

impl EvidenceAccess {
    pub fn new(config: &AccessConfig, ledger: Arc<EvidenceLedger>) -> Result<Self, AccessError> {
        let secret = match &config.signing_secret {
            Some(secret) if secret.len() < MIN_SECRET_LEN => return Err(AccessError::WeakSecret),
            Some(secret) => secret.clone(),
            None => {
                warn!("No signing secret configured; evidence links will not survive a restart");
                format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
            }
        };

        Ok(Self {
            ledger,
            secret,
            ttl_secs: config.ttl_secs,
        })
    }

    /// Sign a reference to one stream of a committed record for `party`
    pub fn issue(
        &self,
        evidence_id: &str,
        stream_type: StreamType,
        party: &str,
    ) -> Result<SignedReference, AccessError> {
        self.issue_at(evidence_id, stream_type, party, Utc::now())
    }

    fn issue_at(
        &self,
        evidence_id: &str,
        stream_type: StreamType,
        party: &str,
        now: DateTime<Utc>,
    ) -> Result<SignedReference, AccessError> {
        let record = self.ledger.get(evidence_id)?;
        let permitted =
            record.user_id == party || record.shared_with.iter().any(|g| g.party == party);
        if !permitted {
            warn!(evidence_id = %evidence_id, party = %party, "Refused evidence reference");
            return Err(AccessError::NotShared {
                evidence_id: evidence_id.to_string(),
                party: party.to_string(),
            });
        }
        if !record.streams.contains_key(&stream_type) {
            return Err(LedgerError::NotFound(format!("{evidence_id}/{stream_type}")).into());
        }

        let iat = now.timestamp();
        let exp = iat + self.ttl_secs;
        let claims = AccessClaims {
            sub: party.to_string(),
            evidence_id: evidence_id.to_string(),
            stream_type,
            iat,
            exp,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AccessError::Signing(e.to_string()))?;

        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| AccessError::Signing(format!("expiry out of range: {exp}")))?;

        debug!(
            evidence_id = %evidence_id,
            stream_type = %stream_type,
            party = %party,
            "Issued evidence reference"
        );
        Ok(SignedReference {
            token,
            evidence_id: evidence_id.to_string(),
            stream_type,
            expires_at,
        })
    }

    /// Validate a reference and return the stream bytes
    pub async fn open(&self, token: &str) -> Result<(StreamType, Bytes), AccessError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|err| {
            use jsonwebtoken::errors::ErrorKind;
            match err.kind() {
                ErrorKind::ExpiredSignature => AccessError::Expired,
                _ => AccessError::InvalidToken(err.to_string()),
            }
        })?;

        let claims = data.claims;
        debug!(evidence_id = %claims.evidence_id, party = %claims.sub, "Opening evidence reference");
        let bytes = self
            .ledger
            .read_stream(&claims.evidence_id, claims.stream_type)
            .await?;
        Ok((claims.stream_type, bytes))
    }
}
