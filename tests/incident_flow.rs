//! End-to-end dispatch behavior through the public API

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use lifeline::collaborators::{InMemoryIdentity, InMemoryObjectStore, LoggingAuthority, UserProfile};
use lifeline::dispatch::{ChannelSet, DispatchConfig, RecordingChannel};
use lifeline::ids::SequentialIds;
use lifeline::incident::{IncidentStatus, IncidentType, Resolution, ResponseAction};
use lifeline::responders::{ContactChannels, ResponderKind, ResponderProfile};
use lifeline::topics::IncidentEvent;
use lifeline::{Collaborators, GeoPoint, Lifeline, LifelineConfig};

fn origin() -> GeoPoint {
    GeoPoint::new(51.5072, -0.1276)
}

async fn lifeline(dispatch: DispatchConfig, volunteers: &[(&str, f64)]) -> (Arc<Lifeline>, Arc<RecordingChannel>) {
    let identity = InMemoryIdentity::new();
    identity
        .upsert(
            UserProfile {
                user_id: "u-1".into(),
                name: "Maya".into(),
                phone: Some("+447700900001".into()),
                emergency_contacts: Vec::new(),
            },
            Vec::new(),
        )
        .await;

    let channel = Arc::new(RecordingChannel::new());
    let config = LifelineConfig {
        dispatch,
        ..Default::default()
    };
    let app = Lifeline::build(
        config,
        Collaborators {
            ids: Arc::new(SequentialIds::new()),
            identity: Arc::new(identity),
            object_store: Arc::new(InMemoryObjectStore::new()),
            authority: Arc::new(LoggingAuthority),
            channels: ChannelSet::uniform(channel.clone()),
        },
    )
    .unwrap();

    for (id, trust) in volunteers {
        app.directory
            .register_responder(ResponderProfile {
                responder_id: id.to_string(),
                name: id.to_uppercase(),
                kind: ResponderKind::Volunteer,
                trust_score: *trust,
                channels: ContactChannels {
                    push_token: Some(format!("push-{id}")),
                    ..Default::default()
                },
                location: None,
                last_active_at: None,
            })
            .unwrap();
        app.directory
            .record_heartbeat(id, origin(), Utc::now())
            .unwrap();
    }

    (Arc::new(app), channel)
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn second_tier_candidate_accepts_after_first_tier_declines() {
    let dispatch = DispatchConfig {
        fanout_size: 2,
        tier_deadline_ms: 1_000,
        max_tier: 2,
        ..Default::default()
    };
    let (app, channel) = lifeline(dispatch, &[("c0", 0.9), ("c1", 0.8), ("c2", 0.7)]).await;

    let incident = app
        .orchestrator
        .open_incident("u-1", IncidentType::Sos, origin(), None)
        .await
        .unwrap();
    let ranked: Vec<&str> = incident
        .candidate_queue
        .iter()
        .map(|c| c.responder_id.as_str())
        .collect();
    assert_eq!(ranked, vec!["c0", "c1", "c2"]);

    sleep_ms(200).await;
    assert_eq!(channel.notified_responders(), vec!["c0", "c1"]);
    for id in ["c0", "c1"] {
        app.orchestrator
            .record_response(&incident.id, id, ResponseAction::Declined)
            .await
            .unwrap();
    }

    sleep_ms(790).await;
    let view = app.orchestrator.get_incident(&incident.id).await.unwrap();
    assert_eq!(view.escalation_tier, 1);
    assert_eq!(view.status, IncidentStatus::Dispatching);

    sleep_ms(310).await;
    assert_eq!(channel.notified_responders(), vec!["c0", "c1", "c2"]);
    app.orchestrator
        .record_response(&incident.id, "c2", ResponseAction::Accepted)
        .await
        .unwrap();

    let view = app.orchestrator.get_incident(&incident.id).await.unwrap();
    assert_eq!(
        view.status,
        IncidentStatus::Resolved(Resolution::Responder {
            responder_id: "c2".into()
        })
    );
    assert_eq!(view.escalation_tier, 2);
    assert!(view.closed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn small_pool_settles_unanswered_without_second_tier() {
    let dispatch = DispatchConfig {
        fanout_size: 5,
        tier_deadline_ms: 1_000,
        max_tier: 3,
        ..Default::default()
    };
    let (app, channel) = lifeline(dispatch, &[("c0", 0.9), ("c1", 0.8), ("c2", 0.7)]).await;

    let incident = app
        .orchestrator
        .open_incident("u-1", IncidentType::Medical, origin(), None)
        .await
        .unwrap();

    sleep_ms(10).await;
    assert_eq!(channel.notified_responders().len(), 3);

    sleep_ms(5_000).await;
    let view = app.orchestrator.get_incident(&incident.id).await.unwrap();
    assert_eq!(view.status, IncidentStatus::ClosedUnanswered);
    assert_eq!(view.escalation_tier, 1);
    assert_eq!(view.responses.len(), 3);
    assert_eq!(app.dispatcher.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn near_simultaneous_accepts_have_one_winner() {
    let dispatch = DispatchConfig {
        fanout_size: 4,
        tier_deadline_ms: 10_000,
        max_tier: 1,
        ..Default::default()
    };
    let (app, _) = lifeline(
        dispatch,
        &[("c0", 0.9), ("c1", 0.8), ("c2", 0.7), ("c3", 0.6)],
    )
    .await;

    let incident = app
        .orchestrator
        .open_incident("u-1", IncidentType::Accident, origin(), None)
        .await
        .unwrap();
    let mut events = app.orchestrator.subscribe(&incident.id, "u-1").unwrap();
    sleep_ms(10).await;

    let handles: Vec<_> = ["c3", "c1", "c0", "c2"]
        .into_iter()
        .map(|id| {
            let app = app.clone();
            let incident_id = incident.id.clone();
            tokio::spawn(async move {
                app.orchestrator
                    .record_response(&incident_id, id, ResponseAction::Accepted)
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut authoritative = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap();
        if response.authoritative {
            authoritative.push(response.responder_id);
        }
    }
    assert_eq!(authoritative.len(), 1);

    let view = app.orchestrator.get_incident(&incident.id).await.unwrap();
    assert_eq!(
        view.status,
        IncidentStatus::Resolved(Resolution::Responder {
            responder_id: authoritative[0].clone()
        })
    );

    let mut status_changes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let IncidentEvent::StatusChanged { status, .. } = event {
            status_changes.push(status);
        }
    }
    assert_eq!(
        status_changes,
        vec![IncidentStatus::Dispatching, view.status.clone()]
    );
}

#[tokio::test(start_paused = true)]
async fn stale_responders_are_not_dispatched() {
    let dispatch = DispatchConfig {
        fanout_size: 5,
        tier_deadline_ms: 1_000,
        max_tier: 1,
        ..Default::default()
    };
    let (app, channel) = lifeline(dispatch, &[("fresh", 0.5)]).await;
    app.directory
        .register_responder(ResponderProfile {
            responder_id: "stale".into(),
            name: "Stale".into(),
            kind: ResponderKind::Volunteer,
            trust_score: 1.0,
            channels: ContactChannels::default(),
            location: None,
            last_active_at: None,
        })
        .unwrap();
    app.directory
        .record_heartbeat("stale", origin(), Utc::now() - chrono::Duration::hours(25))
        .unwrap();

    let incident = app
        .orchestrator
        .open_incident("u-1", IncidentType::Sos, origin(), None)
        .await
        .unwrap();
    assert_eq!(incident.candidate_queue.len(), 1);

    sleep_ms(10).await;
    assert_eq!(channel.notified_responders(), vec!["fresh"]);
}
