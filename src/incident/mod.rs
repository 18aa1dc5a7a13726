//! Incidents and their lifecycle
//!
//! ```text
//! open ──► dispatching ──► resolved(responder | self_reported)
//!   │           │      ├─► closed_unanswered
//!   └───────────┴──────┴─► escalated_to_authorities ──► resolved
//! ```
//!
//! `resolved` and `closed_unanswered` are terminal. Incidents are never deleted.

pub mod orchestrator;
pub mod store;

pub use orchestrator::{IncidentOrchestrator, OrchestratorConfig};
pub use store::IncidentStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

use crate::geo::GeoPoint;
use crate::responders::ResponderCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    Sos,
    Medical,
    Assault,
    Harassment,
    Accident,
    Other,
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IncidentType::Sos => "sos",
            IncidentType::Medical => "medical",
            IncidentType::Assault => "assault",
            IncidentType::Harassment => "harassment",
            IncidentType::Accident => "accident",
            IncidentType::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for IncidentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sos" => Ok(IncidentType::Sos),
            "medical" => Ok(IncidentType::Medical),
            "assault" => Ok(IncidentType::Assault),
            "harassment" => Ok(IncidentType::Harassment),
            "accident" => Ok(IncidentType::Accident),
            "other" => Ok(IncidentType::Other),
            other => Err(format!("unknown incident type: {other}")),
        }
    }
}

/// How a resolved incident ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Resolution {
    Responder { responder_id: String },
    /// The user marked themselves safe (cancellation)
    SelfReported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "resolution", rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Dispatching,
    Resolved(Resolution),
    EscalatedToAuthorities,
    ClosedUnanswered,
}

impl IncidentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncidentStatus::Resolved(_) | IncidentStatus::ClosedUnanswered
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Accepted,
    Declined,
    /// Recorded by the dispatcher when a tier deadline passes
    Timeout,
}

/// One responder's answer; never modified once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub responder_id: String,
    pub incident_id: String,
    pub action: ResponseAction,
    pub responded_at: DateTime<Utc>,
    pub latency_ms: u64,
    /// Tier in which the responder was notified
    pub tier: u32,
    /// Whether the response took effect; late answers are kept as history only
    pub authoritative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    PendingTier,
    AwaitingResponse,
    Settled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Settlement {
    Accepted { responder_id: String },
    Unanswered,
    Cancelled,
}

/// Dispatcher bookkeeping for one incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchState {
    pub phase: DispatchPhase,
    pub tier: u32,
    pub deadline_at: Option<DateTime<Utc>>,
    /// responder_id -> tier in which it was notified
    pub notified: BTreeMap<String, u32>,
    pub declined: BTreeSet<String>,
    pub settled: Option<Settlement>,
}

impl Default for DispatchState {
    fn default() -> Self {
        Self {
            phase: DispatchPhase::PendingTier,
            tier: 0,
            deadline_at: None,
            notified: BTreeMap::new(),
            declined: BTreeSet::new(),
            settled: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistressSource {
    /// Classifier over the user's voice or messages
    Emotion,
    /// Analysis of uploaded evidence
    Evidence,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistressSignal {
    pub source: DistressSource,
    pub score: f32,
    pub reported_at: DateTime<Utc>,
}

/// Live incident state, guarded by the per-incident mutex in [`IncidentStore`]
#[derive(Debug, Clone)]
pub struct Incident {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_phone: Option<String>,
    pub incident_type: IncidentType,
    pub opened_at: DateTime<Utc>,
    pub origin: GeoPoint,
    pub status: IncidentStatus,
    pub dispatch: DispatchState,
    /// Ranked at open and never re-ranked
    pub candidate_queue: Vec<ResponderCandidate>,
    pub responses: Vec<Response>,
    pub evidence_refs: Vec<String>,
    pub escalation_tier: u32,
    pub distress_signals: Vec<DistressSignal>,
    pub authority_alerted: bool,
    pub closed_at: Option<DateTime<Utc>>,
    /// Monotonic notify instants, for response latency
    pub notified_at: HashMap<String, Instant>,
}

impl Incident {
    pub fn new(
        id: String,
        user_id: String,
        user_name: String,
        user_phone: Option<String>,
        incident_type: IncidentType,
        origin: GeoPoint,
        candidate_queue: Vec<ResponderCandidate>,
    ) -> Self {
        Self {
            id,
            user_id,
            user_name,
            user_phone,
            incident_type,
            opened_at: Utc::now(),
            origin,
            status: IncidentStatus::Open,
            dispatch: DispatchState::default(),
            candidate_queue,
            responses: Vec::new(),
            evidence_refs: Vec::new(),
            escalation_tier: 0,
            distress_signals: Vec::new(),
            authority_alerted: false,
            closed_at: None,
            notified_at: HashMap::new(),
        }
    }

    /// The authoritative accepted response, if any
    pub fn accepted_response(&self) -> Option<&Response> {
        self.responses
            .iter()
            .find(|r| r.action == ResponseAction::Accepted && r.authoritative)
    }

    pub fn view(&self) -> IncidentView {
        IncidentView::from(self)
    }
}

/// Read-only, serializable snapshot of an incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentView {
    pub id: String,
    pub user_id: String,
    pub incident_type: IncidentType,
    pub opened_at: DateTime<Utc>,
    pub origin: GeoPoint,
    pub status: IncidentStatus,
    pub dispatch: DispatchState,
    pub candidate_queue: Vec<ResponderCandidate>,
    pub responses: Vec<Response>,
    pub evidence_refs: Vec<String>,
    pub escalation_tier: u32,
    pub distress_signals: Vec<DistressSignal>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Current tier deadline while awaiting responses
    pub respond_by: Option<DateTime<Utc>>,
}

impl From<&Incident> for IncidentView {
    fn from(incident: &Incident) -> Self {
        Self {
            id: incident.id.clone(),
            user_id: incident.user_id.clone(),
            incident_type: incident.incident_type,
            opened_at: incident.opened_at,
            origin: incident.origin,
            status: incident.status.clone(),
            dispatch: incident.dispatch.clone(),
            candidate_queue: incident.candidate_queue.clone(),
            responses: incident.responses.clone(),
            evidence_refs: incident.evidence_refs.clone(),
            escalation_tier: incident.escalation_tier,
            distress_signals: incident.distress_signals.clone(),
            closed_at: incident.closed_at,
            respond_by: match incident.dispatch.phase {
                DispatchPhase::AwaitingResponse => incident.dispatch.deadline_at,
                _ => None,
            },
        }
    }
}
