//! Guardians and volunteers who can respond to an incident
//!
//! The [`ResponderDirectory`] keeps the latest position and trust of every
//! registered responder and turns that into a ranked, per-incident snapshot of
//! [`ResponderCandidate`]s.

pub mod directory;

pub use directory::{DirectoryConfig, ResponderDirectory, ResponderProfile};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relationship of a responder to the user in distress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponderKind {
    /// Linked by the user personally
    #[default]
    Guardian,
    /// Community volunteer available to anyone nearby
    Volunteer,
}

/// Addresses on each notification channel; `None` disables the channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactChannels {
    pub push_token: Option<String>,
    pub sms_phone: Option<String>,
    /// Mesh node id used for offline fallback broadcasts
    pub mesh_id: Option<String>,
}

impl ContactChannels {
    pub fn has_direct_channel(&self) -> bool {
        self.push_token.is_some() || self.sms_phone.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_direct_channel() && self.mesh_id.is_none()
    }

    /// Take addresses from `other` only where this set has none
    pub fn fill_missing(&mut self, other: ContactChannels) {
        if self.push_token.is_none() {
            self.push_token = other.push_token;
        }
        if self.sms_phone.is_none() {
            self.sms_phone = other.sms_phone;
        }
        if self.mesh_id.is_none() {
            self.mesh_id = other.mesh_id;
        }
    }
}

/// Seed data for a responder from the identity collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderSeed {
    pub responder_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ResponderKind,
    pub trust_score: f64,
    #[serde(default)]
    pub channels: ContactChannels,
}

/// A responder as seen by one incident at open time
///
/// Frozen for the life of the incident: later heartbeats do not re-rank it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderCandidate {
    pub responder_id: String,
    pub name: String,
    pub kind: ResponderKind,
    pub distance_meters: f64,
    pub trust_score: f64,
    pub last_active_at: DateTime<Utc>,
    /// `trust_score × recency_weight` at ranking time
    pub score: f64,
    pub channels: ContactChannels,
    /// Whether the responder had a recent heartbeat; offline ones also get mesh
    pub reachable_online: bool,
}
