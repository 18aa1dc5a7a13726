//! Per-incident event topics
//!
//! Each incident gets its own `broadcast` channel. Only the incident owner and
//! responders who were actually dispatched may subscribe. Publishing to a topic
//! with no subscribers is not an error; slow subscribers lag and skip events.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::debug;

use crate::incident::{DistressSource, IncidentStatus, IncidentType, Response};
use crate::types::{LifelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Events buffered per topic before slow subscribers lag
    pub channel_capacity: usize,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IncidentEvent {
    Opened {
        incident_id: String,
        incident_type: IncidentType,
        candidates: usize,
    },
    TierDispatched {
        incident_id: String,
        tier: u32,
        responder_ids: Vec<String>,
        respond_by: DateTime<Utc>,
    },
    ResponseRecorded {
        incident_id: String,
        response: Response,
    },
    EvidenceAttached {
        incident_id: String,
        evidence_id: String,
    },
    StatusChanged {
        incident_id: String,
        status: IncidentStatus,
    },
    Escalated {
        incident_id: String,
        source: DistressSource,
        score: f32,
    },
}

struct Topic {
    sender: broadcast::Sender<IncidentEvent>,
    authorized: HashSet<String>,
}

pub struct IncidentTopics {
    config: TopicsConfig,
    topics: DashMap<String, Topic>,
}

impl IncidentTopics {
    pub fn new(config: TopicsConfig) -> Self {
        Self {
            config,
            topics: DashMap::new(),
        }
    }

    /// Create the topic for a new incident, authorizing its owner
    pub fn open(&self, incident_id: &str, owner_id: &str) {
        let (sender, _) = broadcast::channel(self.config.channel_capacity.max(1));
        let mut authorized = HashSet::new();
        authorized.insert(owner_id.to_string());
        self.topics
            .insert(incident_id.to_string(), Topic { sender, authorized });
    }

    /// Allow a dispatched responder to follow the incident
    pub fn authorize(&self, incident_id: &str, party_id: &str) {
        if let Some(mut topic) = self.topics.get_mut(incident_id) {
            topic.authorized.insert(party_id.to_string());
        }
    }

    pub fn subscribe(
        &self,
        incident_id: &str,
        party_id: &str,
    ) -> Result<broadcast::Receiver<IncidentEvent>> {
        let topic = self
            .topics
            .get(incident_id)
            .ok_or_else(|| LifelineError::NotFound(format!("incident topic {incident_id}")))?;
        if !topic.authorized.contains(party_id) {
            return Err(LifelineError::Validation(format!(
                "{party_id} may not follow incident {incident_id}"
            )));
        }
        Ok(topic.sender.subscribe())
    }

    pub fn publish(&self, incident_id: &str, event: IncidentEvent) {
        if let Some(topic) = self.topics.get(incident_id) {
            let receivers = topic.sender.send(event).unwrap_or(0);
            debug!(incident_id = %incident_id, receivers, "Published incident event");
        }
    }
}
