//! Hand-off to emergency authorities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dispatch::ChannelError;
use crate::geo::GeoPoint;
use crate::incident::{DistressSource, IncidentType};

/// Alert sent when an incident is escalated to authorities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityAlert {
    pub incident_id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_phone: Option<String>,
    pub incident_type: IncidentType,
    pub origin: GeoPoint,
    pub source: DistressSource,
    pub score: f32,
    pub evidence_refs: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait AuthorityNotifier: Send + Sync {
    async fn alert(&self, alert: &AuthorityAlert) -> Result<(), ChannelError>;
}

/// Writes the alert to the log only; used when no authority endpoint is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAuthority;

#[async_trait::async_trait]
impl AuthorityNotifier for LoggingAuthority {
    async fn alert(&self, alert: &AuthorityAlert) -> Result<(), ChannelError> {
        warn!(
            incident_id = %alert.incident_id,
            user_id = %alert.user_id,
            incident_type = ?alert.incident_type,
            lat = alert.origin.lat,
            lon = alert.origin.lon,
            score = alert.score,
            "Authority escalation (no endpoint configured)"
        );
        Ok(())
    }
}
