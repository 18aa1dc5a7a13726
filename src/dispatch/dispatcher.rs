//! Tiered notification dispatch
//!
//! One task per incident walks the frozen candidate queue tier by tier:
//!
//! ```text
//! pending_tier(t) ──notify next fanout_size──► awaiting_response(t, deadline)
//!        ▲                                          │ deadline: silent => timeout
//!        └──────── more candidates and t < max ─────┤
//!                                                   ▼
//!                        settled(accepted(id) | unanswered | cancelled)
//! ```
//!
//! Tier advancement and response recording both take the incident's mutex, so
//! the first accept wins and a deadline can never race a settlement. Settling
//! signals the incident's `watch` channel, which wakes the task out of its
//! deadline sleep.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channels::{ChannelError, ChannelKind, ChannelSet, Delivery, NotificationPayload};
use crate::incident::{
    DispatchPhase, Incident, IncidentStatus, IncidentStore, IncidentView, Resolution, Response,
    ResponseAction, Settlement,
};
use crate::responders::ResponderCandidate;
use crate::topics::{IncidentEvent, IncidentTopics};
use crate::types::{LifelineError, Result};

/// Dispatch policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Candidates notified per tier
    pub fanout_size: usize,
    /// Time a tier waits for an accept (default: 45 seconds)
    pub tier_deadline_ms: u64,
    /// Last tier before the incident settles unanswered
    pub max_tier: u32,
    /// Per-call provider timeout
    pub send_timeout_ms: u64,
    /// Pause before the single retry of a failed send
    pub retry_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fanout_size: 5,
            tier_deadline_ms: 45_000,
            max_tier: 3,
            send_timeout_ms: 5_000,
            retry_backoff_ms: 500,
        }
    }
}

impl DispatchConfig {
    pub fn tier_deadline(&self) -> Duration {
        Duration::from_millis(self.tier_deadline_ms)
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    store: Arc<IncidentStore>,
    topics: Arc<IncidentTopics>,
    channels: ChannelSet,
    /// incident_id -> settle signal for incidents with a running dispatch task
    active: DashMap<String, watch::Sender<bool>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        store: Arc<IncidentStore>,
        topics: Arc<IncidentTopics>,
        channels: ChannelSet,
    ) -> Self {
        Self {
            config,
            store,
            topics,
            channels,
            active: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Incidents whose dispatch has not settled yet
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start the dispatch task for a freshly opened incident
    pub fn start(self: &Arc<Self>, incident_id: &str) -> JoinHandle<()> {
        let (tx, rx) = watch::channel(false);
        self.active.insert(incident_id.to_string(), tx);

        let this = Arc::clone(self);
        let incident_id = incident_id.to_string();
        tokio::spawn(async move { this.run(incident_id, rx).await })
    }

    async fn run(self: Arc<Self>, incident_id: String, mut settled: watch::Receiver<bool>) {
        loop {
            let deadline = match self.dispatch_next_tier(&incident_id).await {
                Ok(Some(deadline)) => deadline,
                Ok(None) => break,
                Err(e) => {
                    warn!(incident_id = %incident_id, error = %e, "Dispatch stopped");
                    break;
                }
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = settled.changed() => {}
            }
            if *settled.borrow() {
                break;
            }

            match self.expire_tier(&incident_id).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(incident_id = %incident_id, error = %e, "Dispatch stopped");
                    break;
                }
            }
        }

        self.active.remove(&incident_id);
        debug!(incident_id = %incident_id, "Dispatch task finished");
    }

    /// Notify the next tier; `None` once the incident is settled
    async fn dispatch_next_tier(&self, incident_id: &str) -> Result<Option<Instant>> {
        let cell = self.store.get(incident_id)?;
        let mut incident = cell.lock().await;
        if incident.dispatch.settled.is_some() || incident.status.is_terminal() {
            return Ok(None);
        }

        let batch: Vec<ResponderCandidate> = remaining_candidates(&incident)
            .take(self.config.fanout_size)
            .cloned()
            .collect();

        if batch.is_empty() {
            let events = settle(&mut incident, Settlement::Unanswered);
            drop(incident);
            info!(incident_id = %incident_id, "No candidates to notify, settled unanswered");
            self.finish(incident_id, events);
            return Ok(None);
        }

        let tier = incident.dispatch.tier + 1;
        let now = Instant::now();
        let deadline = now + self.config.tier_deadline();
        let respond_by = Utc::now()
            + chrono::Duration::milliseconds(self.config.tier_deadline_ms as i64);

        let mut events = Vec::new();
        if incident.status == IncidentStatus::Open {
            incident.status = IncidentStatus::Dispatching;
            events.push(IncidentEvent::StatusChanged {
                incident_id: incident_id.to_string(),
                status: IncidentStatus::Dispatching,
            });
        }
        incident.dispatch.tier = tier;
        incident.dispatch.phase = DispatchPhase::AwaitingResponse;
        incident.dispatch.deadline_at = Some(respond_by);
        incident.escalation_tier = tier;
        for candidate in &batch {
            incident
                .dispatch
                .notified
                .insert(candidate.responder_id.clone(), tier);
            incident
                .notified_at
                .insert(candidate.responder_id.clone(), now);
        }

        let deliveries: Vec<(ResponderCandidate, NotificationPayload)> = batch
            .into_iter()
            .map(|candidate| {
                let payload = NotificationPayload {
                    incident_id: incident_id.to_string(),
                    responder_id: candidate.responder_id.clone(),
                    user_name: incident.user_name.clone(),
                    incident_type: incident.incident_type,
                    origin: incident.origin,
                    distance_meters: candidate.distance_meters,
                    tier,
                    respond_by,
                    mesh_id: candidate.channels.mesh_id.clone(),
                };
                (candidate, payload)
            })
            .collect();
        drop(incident);

        let responder_ids: Vec<String> = deliveries
            .iter()
            .map(|(c, _)| c.responder_id.clone())
            .collect();
        for responder_id in &responder_ids {
            self.topics.authorize(incident_id, responder_id);
        }
        events.push(IncidentEvent::TierDispatched {
            incident_id: incident_id.to_string(),
            tier,
            responder_ids: responder_ids.clone(),
            respond_by,
        });
        for event in events {
            self.topics.publish(incident_id, event);
        }

        info!(
            incident_id = %incident_id,
            tier,
            responders = ?responder_ids,
            deadline_ms = self.config.tier_deadline_ms,
            "Dispatched tier"
        );

        self.spawn_deliveries(deliveries);
        Ok(Some(deadline))
    }

    /// Close the current tier; `true` if another tier should follow
    async fn expire_tier(&self, incident_id: &str) -> Result<bool> {
        let cell = self.store.get(incident_id)?;
        let mut incident = cell.lock().await;
        if incident.dispatch.settled.is_some() || incident.status.is_terminal() {
            return Ok(false);
        }

        let tier = incident.dispatch.tier;
        let silent: Vec<String> = incident
            .dispatch
            .notified
            .iter()
            .filter(|(_, t)| **t == tier)
            .map(|(id, _)| id.clone())
            .filter(|id| !incident.responses.iter().any(|r| &r.responder_id == id))
            .collect();

        let mut events = Vec::new();
        for responder_id in silent {
            let response = Response {
                responder_id,
                incident_id: incident_id.to_string(),
                action: ResponseAction::Timeout,
                responded_at: Utc::now(),
                latency_ms: self.config.tier_deadline_ms,
                tier,
                authoritative: true,
            };
            incident.responses.push(response.clone());
            events.push(IncidentEvent::ResponseRecorded {
                incident_id: incident_id.to_string(),
                response,
            });
        }

        let remaining = remaining_candidates(&incident).count();
        if tier >= self.config.max_tier || remaining == 0 {
            events.extend(settle(&mut incident, Settlement::Unanswered));
            let status = incident.status.clone();
            drop(incident);
            info!(
                incident_id = %incident_id,
                tier,
                remaining,
                status = ?status,
                "Dispatch exhausted without an accept"
            );
            self.finish(incident_id, events);
            return Ok(false);
        }

        incident.dispatch.phase = DispatchPhase::PendingTier;
        incident.dispatch.deadline_at = None;
        drop(incident);
        debug!(incident_id = %incident_id, tier, "Tier deadline passed, escalating");
        for event in events {
            self.topics.publish(incident_id, event);
        }
        Ok(true)
    }

    /// Record an accept or decline from a notified responder
    ///
    /// The first accept while the incident is live wins. Anything after that,
    /// or after a cancellation, is kept as history with `authoritative = false`.
    pub async fn record_response(
        &self,
        incident_id: &str,
        responder_id: &str,
        action: ResponseAction,
    ) -> Result<Response> {
        if action == ResponseAction::Timeout {
            return Err(LifelineError::Validation(
                "timeouts are recorded by the dispatcher".into(),
            ));
        }

        let cell = self.store.get(incident_id)?;
        let mut incident = cell.lock().await;

        let tier = *incident.dispatch.notified.get(responder_id).ok_or_else(|| {
            LifelineError::Validation(format!(
                "{responder_id} was not notified for incident {incident_id}"
            ))
        })?;

        if let Some(existing) = incident
            .responses
            .iter()
            .find(|r| r.responder_id == responder_id && r.action == action)
        {
            debug!(incident_id = %incident_id, responder_id = %responder_id, "Duplicate response ignored");
            return Ok(existing.clone());
        }

        let live = !incident.status.is_terminal();
        let latency_ms = incident
            .notified_at
            .get(responder_id)
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or_default();

        let response = Response {
            responder_id: responder_id.to_string(),
            incident_id: incident_id.to_string(),
            action,
            responded_at: Utc::now(),
            latency_ms,
            tier,
            authoritative: live,
        };
        incident.responses.push(response.clone());

        let mut events = vec![IncidentEvent::ResponseRecorded {
            incident_id: incident_id.to_string(),
            response: response.clone(),
        }];

        match (action, live) {
            (ResponseAction::Accepted, true) => {
                events.extend(settle(
                    &mut incident,
                    Settlement::Accepted {
                        responder_id: responder_id.to_string(),
                    },
                ));
                drop(incident);
                info!(
                    incident_id = %incident_id,
                    responder_id = %responder_id,
                    tier,
                    latency_ms,
                    "Responder accepted"
                );
                self.finish(incident_id, events);
                return Ok(response);
            }
            (ResponseAction::Declined, true) => {
                incident.dispatch.declined.insert(responder_id.to_string());
                debug!(incident_id = %incident_id, responder_id = %responder_id, "Responder declined");
            }
            _ => {
                debug!(
                    incident_id = %incident_id,
                    responder_id = %responder_id,
                    action = ?action,
                    "Late response kept as history"
                );
            }
        }
        drop(incident);

        for event in events {
            self.topics.publish(incident_id, event);
        }
        Ok(response)
    }

    /// Settle as resolved by the user and stop dispatch
    pub async fn cancel(&self, incident_id: &str) -> Result<IncidentView> {
        let cell = self.store.get(incident_id)?;
        let mut incident = cell.lock().await;
        if incident.status.is_terminal() {
            return Err(LifelineError::Conflict(format!(
                "incident {incident_id} is already {:?}",
                incident.status
            )));
        }

        let events = settle(&mut incident, Settlement::Cancelled);
        let view = incident.view();
        drop(incident);

        info!(incident_id = %incident_id, "Incident cancelled by user");
        self.finish(incident_id, events);
        Ok(view)
    }

    fn finish(&self, incident_id: &str, events: Vec<IncidentEvent>) {
        for event in events {
            self.topics.publish(incident_id, event);
        }
        if let Some((_, tx)) = self.active.remove(incident_id) {
            let _ = tx.send(true);
        }
    }

    fn spawn_deliveries(&self, deliveries: Vec<(ResponderCandidate, NotificationPayload)>) {
        let channels = self.channels.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let results = join_all(
                deliveries
                    .iter()
                    .map(|(candidate, payload)| notify_candidate(&channels, &config, candidate, payload)),
            )
            .await;
            let reached = results.iter().filter(|ok| **ok).count();
            debug!(reached, total = results.len(), "Tier deliveries finished");
        });
    }
}

fn remaining_candidates(incident: &Incident) -> impl Iterator<Item = &ResponderCandidate> {
    incident.candidate_queue.iter().filter(|c| {
        !incident.dispatch.notified.contains_key(&c.responder_id)
            && !incident.dispatch.declined.contains(&c.responder_id)
    })
}

/// Apply a settlement and return the resulting status events
fn settle(incident: &mut Incident, outcome: Settlement) -> Vec<IncidentEvent> {
    let status = match &outcome {
        Settlement::Accepted { responder_id } => Some(IncidentStatus::Resolved(
            Resolution::Responder {
                responder_id: responder_id.clone(),
            },
        )),
        Settlement::Cancelled => Some(IncidentStatus::Resolved(Resolution::SelfReported)),
        // Authorities already have the incident; it stays open for them
        Settlement::Unanswered if incident.status == IncidentStatus::EscalatedToAuthorities => {
            None
        }
        Settlement::Unanswered => Some(IncidentStatus::ClosedUnanswered),
    };

    incident.dispatch.phase = DispatchPhase::Settled;
    incident.dispatch.deadline_at = None;
    incident.dispatch.settled = Some(outcome);

    match status {
        Some(status) => {
            incident.status = status.clone();
            incident.closed_at = Some(Utc::now());
            vec![IncidentEvent::StatusChanged {
                incident_id: incident.id.clone(),
                status,
            }]
        }
        None => Vec::new(),
    }
}

async fn notify_candidate(
    channels: &ChannelSet,
    config: &DispatchConfig,
    candidate: &ResponderCandidate,
    payload: &NotificationPayload,
) -> bool {
    let responder_id = candidate.responder_id.as_str();

    let push = async {
        match (&channels.push, &candidate.channels.push_token) {
            (Some(ch), Some(token)) => {
                deliver(config, ChannelKind::Push, responder_id, move || {
                    ch.send(token, payload)
                })
                .await
            }
            _ => false,
        }
    };
    let sms = async {
        match (&channels.sms, &candidate.channels.sms_phone) {
            (Some(ch), Some(phone)) => {
                deliver(config, ChannelKind::Sms, responder_id, move || {
                    ch.send(phone, payload)
                })
                .await
            }
            _ => false,
        }
    };
    // Offline responders get mesh alongside the direct channels
    let mesh_now = async {
        match &channels.mesh {
            Some(mesh) if !candidate.reachable_online => {
                deliver(config, ChannelKind::Mesh, responder_id, move || {
                    mesh.broadcast(payload)
                })
                .await
            }
            _ => false,
        }
    };
    let (push_ok, sms_ok, mesh_ok) = tokio::join!(push, sms, mesh_now);
    let mut delivered = push_ok || sms_ok || mesh_ok;

    // Online responders fall back to mesh only once every direct channel failed
    if !delivered && candidate.reachable_online {
        if let Some(mesh) = &channels.mesh {
            delivered = deliver(config, ChannelKind::Mesh, responder_id, move || {
                mesh.broadcast(payload)
            })
            .await;
        }
    }

    if !delivered {
        warn!(
            incident_id = %payload.incident_id,
            responder_id = %responder_id,
            "Responder unreachable on every channel"
        );
    }
    delivered
}

/// One send with a per-call timeout and a single retry
async fn deliver<F, Fut>(
    config: &DispatchConfig,
    channel: ChannelKind,
    responder_id: &str,
    mut send: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Delivery, ChannelError>>,
{
    let timeout = Duration::from_millis(config.send_timeout_ms);
    for attempt in 1..=2u32 {
        let outcome = match tokio::time::timeout(timeout, send()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ChannelError::Timeout),
        };
        match outcome {
            Ok(delivery) => {
                debug!(
                    channel = ?channel,
                    responder_id = %responder_id,
                    delivered = delivery.delivered,
                    attempt,
                    "Channel send finished"
                );
                return delivery.delivered;
            }
            Err(e) if attempt == 1 => {
                debug!(channel = ?channel, responder_id = %responder_id, error = %e, "Retrying send");
                tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms)).await;
            }
            Err(e) => {
                warn!(
                    channel = ?channel,
                    responder_id = %responder_id,
                    error = %e,
                    "Channel send failed after retry"
                );
            }
        }
    }
    false
}
