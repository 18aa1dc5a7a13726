//! Incident orchestration
//!
//! Opens incidents, hands them to the dispatcher, folds distress signals into
//! authority escalation and links committed evidence. All per-incident state
//! changes go through the incident's mutex in [`IncidentStore`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    DistressSignal, DistressSource, Incident, IncidentStatus, IncidentStore, IncidentType,
    IncidentView, Response, ResponseAction,
};
use crate::collaborators::{AuthorityAlert, AuthorityNotifier, IdentityDirectory};
use crate::dispatch::Dispatcher;
use crate::evidence::{ChunkStore, EvidenceLedger, EvidenceRecord};
use crate::geo::GeoPoint;
use crate::ids::IdGenerator;
use crate::responders::ResponderDirectory;
use crate::topics::{IncidentEvent, IncidentTopics};
use crate::types::{LifelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Distress score at which authorities are alerted
    pub authority_escalation_threshold: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            authority_escalation_threshold: 0.85,
        }
    }
}

/// Components the orchestrator drives
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub ids: Arc<dyn IdGenerator>,
    pub identity: Arc<dyn IdentityDirectory>,
    pub directory: Arc<ResponderDirectory>,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<IncidentStore>,
    pub topics: Arc<IncidentTopics>,
    pub chunks: Arc<ChunkStore>,
    pub ledger: Arc<EvidenceLedger>,
    pub authority: Arc<dyn AuthorityNotifier>,
}

pub struct IncidentOrchestrator {
    config: OrchestratorConfig,
    deps: OrchestratorDeps,
}

impl IncidentOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: OrchestratorDeps) -> Self {
        Self { config, deps }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Raise an incident and start dispatching to ranked responders
    ///
    /// `radius_meters` falls back to the directory's default radius.
    pub async fn open_incident(
        &self,
        user_id: &str,
        incident_type: IncidentType,
        origin: GeoPoint,
        radius_meters: Option<f64>,
    ) -> Result<IncidentView> {
        if !origin.is_valid() {
            return Err(LifelineError::Validation(format!(
                "invalid origin ({}, {})",
                origin.lat, origin.lon
            )));
        }

        let user = self.deps.identity.resolve_user(user_id).await?;
        let guardians = self.deps.identity.resolve_guardians(user_id).await?;
        self.deps.directory.sync_guardians(user_id, guardians)?;

        let directory_config = self.deps.directory.config();
        let candidates = self.deps.directory.rank_candidates(
            user_id,
            origin,
            radius_meters.unwrap_or(directory_config.default_radius_meters),
            directory_config.max_candidates,
        )?;

        let incident_id = self.deps.ids.next_id("inc");
        let candidate_count = candidates.len();
        let incident = Incident::new(
            incident_id.clone(),
            user.user_id,
            user.name,
            user.phone,
            incident_type,
            origin,
            candidates,
        );
        let view = incident.view();

        self.deps.topics.open(&incident_id, user_id);
        self.deps.store.insert(incident);
        self.deps.topics.publish(
            &incident_id,
            IncidentEvent::Opened {
                incident_id: incident_id.clone(),
                incident_type,
                candidates: candidate_count,
            },
        );
        self.deps.dispatcher.start(&incident_id);

        info!(
            incident_id = %incident_id,
            user_id = %user_id,
            incident_type = %incident_type,
            candidates = candidate_count,
            "Opened incident"
        );
        Ok(view)
    }

    pub async fn record_response(
        &self,
        incident_id: &str,
        responder_id: &str,
        action: ResponseAction,
    ) -> Result<Response> {
        self.deps
            .dispatcher
            .record_response(incident_id, responder_id, action)
            .await
    }

    /// The user marks themselves safe
    pub async fn cancel_incident(&self, incident_id: &str, user_id: &str) -> Result<IncidentView> {
        self.ensure_owner(incident_id, user_id).await?;
        self.deps.dispatcher.cancel(incident_id).await
    }

    /// Record a distress signal; a score at or above the threshold escalates
    pub async fn report_distress(
        &self,
        incident_id: &str,
        source: DistressSource,
        score: f32,
    ) -> Result<IncidentView> {
        if !(0.0..=1.0).contains(&score) {
            return Err(LifelineError::Validation(format!(
                "distress score must be within [0, 1], got {score}"
            )));
        }

        let cell = self.deps.store.get(incident_id)?;
        let mut incident = cell.lock().await;
        incident.distress_signals.push(DistressSignal {
            source,
            score,
            reported_at: Utc::now(),
        });

        let escalate = score >= self.config.authority_escalation_threshold
            && !incident.status.is_terminal()
            && incident.status != IncidentStatus::EscalatedToAuthorities;

        let mut alert = None;
        if escalate {
            incident.status = IncidentStatus::EscalatedToAuthorities;
            if !incident.authority_alerted {
                incident.authority_alerted = true;
                alert = Some(AuthorityAlert {
                    incident_id: incident.id.clone(),
                    user_id: incident.user_id.clone(),
                    user_name: incident.user_name.clone(),
                    user_phone: incident.user_phone.clone(),
                    incident_type: incident.incident_type,
                    origin: incident.origin,
                    source,
                    score,
                    evidence_refs: incident.evidence_refs.clone(),
                    raised_at: Utc::now(),
                });
            }
        }
        let view = incident.view();
        drop(incident);

        if !escalate {
            debug!(incident_id = %incident_id, source = ?source, score, "Recorded distress signal");
            return Ok(view);
        }

        warn!(incident_id = %incident_id, source = ?source, score, "Escalating incident to authorities");
        self.deps.topics.publish(
            incident_id,
            IncidentEvent::Escalated {
                incident_id: incident_id.to_string(),
                source,
                score,
            },
        );
        self.deps.topics.publish(
            incident_id,
            IncidentEvent::StatusChanged {
                incident_id: incident_id.to_string(),
                status: IncidentStatus::EscalatedToAuthorities,
            },
        );

        if let Some(alert) = alert {
            if let Err(e) = self.deps.authority.alert(&alert).await {
                warn!(incident_id = %incident_id, error = %e, "Authority alert failed");
            }
        }
        Ok(view)
    }

    /// Link evidence to an incident; repeated calls are no-ops
    pub async fn attach_evidence(&self, incident_id: &str, evidence_id: &str) -> Result<IncidentView> {
        let cell = self.deps.store.get(incident_id)?;
        let mut incident = cell.lock().await;
        if incident.evidence_refs.iter().any(|e| e == evidence_id) {
            return Ok(incident.view());
        }
        incident.evidence_refs.push(evidence_id.to_string());
        let view = incident.view();
        drop(incident);

        info!(incident_id = %incident_id, evidence_id = %evidence_id, "Attached evidence");
        self.deps.topics.publish(
            incident_id,
            IncidentEvent::EvidenceAttached {
                incident_id: incident_id.to_string(),
                evidence_id: evidence_id.to_string(),
            },
        );
        Ok(view)
    }

    /// Finalize an upload session, commit it to the ledger and link it
    ///
    /// A failed commit leaves the upload session open for another attempt.
    pub async fn submit_evidence(
        &self,
        incident_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<EvidenceRecord> {
        self.ensure_owner(incident_id, user_id).await?;

        let ledger = &self.deps.ledger;
        let record = self
            .deps
            .chunks
            .finalize_with(session_id, |assembled| async move {
                ledger
                    .commit(incident_id, user_id, assembled)
                    .await
                    .map_err(LifelineError::from)
            })
            .await?;
        self.attach_evidence(incident_id, &record.evidence_id).await?;
        Ok(record)
    }

    /// Attach every evidence commit to its incident as it happens
    pub fn spawn_evidence_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut commits = self.deps.ledger.subscribe_commits();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            info!("Evidence listener started");
            loop {
                match commits.recv().await {
                    Ok(notice) => {
                        if let Err(e) = this
                            .attach_evidence(&notice.incident_id, &notice.evidence_id)
                            .await
                        {
                            debug!(
                                incident_id = %notice.incident_id,
                                evidence_id = %notice.evidence_id,
                                error = %e,
                                "Committed evidence not attached"
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Evidence listener lagged behind commits");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn get_incident(&self, incident_id: &str) -> Result<IncidentView> {
        self.deps.store.view(incident_id).await
    }

    pub fn subscribe(
        &self,
        incident_id: &str,
        party_id: &str,
    ) -> Result<tokio::sync::broadcast::Receiver<IncidentEvent>> {
        self.deps.topics.subscribe(incident_id, party_id)
    }

    async fn ensure_owner(&self, incident_id: &str, user_id: &str) -> Result<()> {
        let cell = self.deps.store.get(incident_id)?;
        let owner = cell.lock().await.user_id.clone();
        if owner != user_id {
            return Err(LifelineError::Validation(format!(
                "incident {incident_id} does not belong to {user_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryIdentity, InMemoryObjectStore, UserProfile};
    use crate::dispatch::{ChannelError, ChannelSet, DispatchConfig, RecordingChannel};
    use crate::evidence::{ChunkStoreConfig, StreamType};
    use crate::ids::SequentialIds;
    use crate::responders::{
        ContactChannels, DirectoryConfig, ResponderKind, ResponderProfile, ResponderSeed,
    };
    use crate::topics::TopicsConfig;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CapturingAuthority {
        alerts: Mutex<Vec<AuthorityAlert>>,
    }

    #[async_trait::async_trait]
    impl AuthorityNotifier for CapturingAuthority {
        async fn alert(&self, alert: &AuthorityAlert) -> std::result::Result<(), ChannelError> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: Arc<IncidentOrchestrator>,
        authority: Arc<CapturingAuthority>,
        chunks: Arc<ChunkStore>,
        ledger: Arc<EvidenceLedger>,
    }

    fn origin() -> GeoPoint {
        GeoPoint::new(12.9716, 77.5946)
    }

    async fn harness(dispatch: DispatchConfig) -> Harness {
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIds::new());
        let identity = InMemoryIdentity::new();
        identity
            .upsert(
                UserProfile {
                    user_id: "u-1".into(),
                    name: "Asha".into(),
                    phone: Some("+15550100".into()),
                    emergency_contacts: Vec::new(),
                },
                vec![ResponderSeed {
                    responder_id: "g-1".into(),
                    name: "Ravi".into(),
                    kind: ResponderKind::Guardian,
                    trust_score: 0.9,
                    channels: ContactChannels {
                        sms_phone: Some("+15550101".into()),
                        ..Default::default()
                    },
                }],
            )
            .await;

        let directory = Arc::new(ResponderDirectory::new(DirectoryConfig::default()));
        directory
            .register_responder(ResponderProfile {
                responder_id: "g-1".into(),
                name: "Ravi".into(),
                kind: ResponderKind::Guardian,
                trust_score: 0.9,
                channels: ContactChannels::default(),
                location: Some(origin()),
                last_active_at: Some(Utc::now()),
            })
            .unwrap();

        let store = Arc::new(IncidentStore::new());
        let topics = Arc::new(IncidentTopics::new(TopicsConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            dispatch,
            store.clone(),
            topics.clone(),
            ChannelSet::uniform(Arc::new(RecordingChannel::new())),
        ));
        let chunks = Arc::new(ChunkStore::new(ChunkStoreConfig::default(), ids.clone()));
        let ledger = Arc::new(EvidenceLedger::new(
            Arc::new(InMemoryObjectStore::new()),
            ids.clone(),
        ));
        let authority = Arc::new(CapturingAuthority::default());

        let orchestrator = Arc::new(IncidentOrchestrator::new(
            OrchestratorConfig::default(),
            OrchestratorDeps {
                ids,
                identity: Arc::new(identity),
                directory,
                dispatcher,
                store,
                topics,
                chunks: chunks.clone(),
                ledger: ledger.clone(),
                authority: authority.clone(),
            },
        ));
        Harness {
            orchestrator,
            authority,
            chunks,
            ledger,
        }
    }

    fn short_dispatch() -> DispatchConfig {
        DispatchConfig {
            fanout_size: 2,
            tier_deadline_ms: 1_000,
            max_tier: 1,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_incident_ranks_synced_guardians() {
        let h = harness(short_dispatch()).await;
        let view = h
            .orchestrator
            .open_incident("u-1", IncidentType::Sos, origin(), None)
            .await
            .unwrap();

        assert_eq!(view.status, IncidentStatus::Open);
        assert_eq!(view.candidate_queue.len(), 1);
        // Contact details come from the identity sync
        assert_eq!(
            view.candidate_queue[0].channels.sms_phone.as_deref(),
            Some("+15550101")
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let view = h.orchestrator.get_incident(&view.id).await.unwrap();
        assert_eq!(view.status, IncidentStatus::Dispatching);
        assert!(view.dispatch.notified.contains_key("g-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_user_is_not_found() {
        let h = harness(short_dispatch()).await;
        let err = h
            .orchestrator
            .open_incident("ghost", IncidentType::Sos, origin(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LifelineError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_distress_escalates_once_and_can_still_resolve() {
        let h = harness(short_dispatch()).await;
        let view = h
            .orchestrator
            .open_incident("u-1", IncidentType::Assault, origin(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let low = h
            .orchestrator
            .report_distress(&view.id, DistressSource::Emotion, 0.4)
            .await
            .unwrap();
        assert_eq!(low.status, IncidentStatus::Dispatching);

        let high = h
            .orchestrator
            .report_distress(&view.id, DistressSource::Emotion, 0.9)
            .await
            .unwrap();
        assert_eq!(high.status, IncidentStatus::EscalatedToAuthorities);
        h.orchestrator
            .report_distress(&view.id, DistressSource::Evidence, 0.95)
            .await
            .unwrap();
        assert_eq!(h.authority.alerts.lock().unwrap().len(), 1);

        h.orchestrator
            .record_response(&view.id, "g-1", ResponseAction::Accepted)
            .await
            .unwrap();
        let view = h.orchestrator.get_incident(&view.id).await.unwrap();
        assert!(matches!(view.status, IncidentStatus::Resolved(_)));
        assert_eq!(view.distress_signals.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalated_incident_outlives_exhausted_dispatch() {
        let h = harness(short_dispatch()).await;
        let view = h
            .orchestrator
            .open_incident("u-1", IncidentType::Sos, origin(), None)
            .await
            .unwrap();
        h.orchestrator
            .report_distress(&view.id, DistressSource::Manual, 1.0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let view = h.orchestrator.get_incident(&view.id).await.unwrap();
        assert_eq!(view.status, IncidentStatus::EscalatedToAuthorities);
        assert!(view.closed_at.is_none());

        let cancelled = h.orchestrator.cancel_incident(&view.id, "u-1").await.unwrap();
        assert_eq!(
            cancelled.status,
            IncidentStatus::Resolved(crate::incident::Resolution::SelfReported)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_owner_can_cancel() {
        let h = harness(short_dispatch()).await;
        let view = h
            .orchestrator
            .open_incident("u-1", IncidentType::Sos, origin(), None)
            .await
            .unwrap();

        assert!(matches!(
            h.orchestrator.cancel_incident(&view.id, "u-2").await,
            Err(LifelineError::Validation(_))
        ));
        assert!(h.orchestrator.cancel_incident(&view.id, "u-1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_evidence_commits_and_attaches_once() {
        let h = harness(short_dispatch()).await;
        let listener = h.orchestrator.spawn_evidence_listener();
        let view = h
            .orchestrator
            .open_incident("u-1", IncidentType::Sos, origin(), None)
            .await
            .unwrap();

        let session = h
            .chunks
            .begin_session("rec-1", &HashMap::from([(StreamType::Audio, 2)]))
            .unwrap();
        for (i, part) in [&b"hel"[..], &b"lo"[..]].into_iter().enumerate() {
            h.chunks
                .put_chunk(&session, StreamType::Audio, i as u32, Bytes::copy_from_slice(part))
                .await
                .unwrap();
        }

        let record = h
            .orchestrator
            .submit_evidence(&view.id, "u-1", &session)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let view = h.orchestrator.get_incident(&view.id).await.unwrap();
        assert_eq!(view.evidence_refs, vec![record.evidence_id.clone()]);
        assert_eq!(h.ledger.records_for_incident(&view.id).len(), 1);
        listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_lifecycle_events() {
        let h = harness(short_dispatch()).await;
        let view = h
            .orchestrator
            .open_incident("u-1", IncidentType::Sos, origin(), None)
            .await
            .unwrap();
        let mut events = h.orchestrator.subscribe(&view.id, "u-1").unwrap();
        assert!(h.orchestrator.subscribe(&view.id, "stranger").is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen
            .iter()
            .any(|e| matches!(e, IncidentEvent::TierDispatched { tier: 1, .. })));

        // The dispatched guardian may now follow the incident
        assert!(h.orchestrator.subscribe(&view.id, "g-1").is_ok());
    }
}
