//! Notification channels
//!
//! Providers sit behind small traits so the dispatcher never knows whether a
//! push goes to a real gateway, a webhook, or a test recorder. A channel with
//! no configured endpoint is simply absent from the [`ChannelSet`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::collaborators::{AuthorityAlert, AuthorityNotifier};
use crate::geo::GeoPoint;
use crate::incident::IncidentType;
use crate::types::LifelineError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    #[error("Channel call timed out")]
    Timeout,
}

impl From<ChannelError> for LifelineError {
    fn from(err: ChannelError) -> Self {
        LifelineError::ChannelUnavailable(err.to_string())
    }
}

/// Provider acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivered: bool,
}

/// What a responder is told about an incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub incident_id: String,
    pub responder_id: String,
    pub user_name: String,
    pub incident_type: IncidentType,
    pub origin: GeoPoint,
    pub distance_meters: f64,
    pub tier: u32,
    pub respond_by: DateTime<Utc>,
    /// Target node for mesh broadcasts, if the responder has one
    pub mesh_id: Option<String>,
}

impl NotificationPayload {
    pub fn sms_text(&self) -> String {
        format!(
            "LIFELINE {}: {} needs help {:.0} m from you ({:.5}, {:.5}). Reply ACCEPT or DECLINE to incident {}.",
            self.incident_type.to_string().to_uppercase(),
            self.user_name,
            self.distance_meters,
            self.origin.lat,
            self.origin.lon,
            self.incident_id
        )
    }
}

#[async_trait::async_trait]
pub trait PushChannel: Send + Sync {
    async fn send(&self, token: &str, payload: &NotificationPayload)
        -> Result<Delivery, ChannelError>;
}

#[async_trait::async_trait]
pub trait SmsChannel: Send + Sync {
    async fn send(&self, phone: &str, payload: &NotificationPayload)
        -> Result<Delivery, ChannelError>;
}

/// Offline fallback over the local mesh network
#[async_trait::async_trait]
pub trait MeshChannel: Send + Sync {
    async fn broadcast(&self, payload: &NotificationPayload) -> Result<Delivery, ChannelError>;
}

/// Enabled channels; `None` means the channel is switched off
#[derive(Clone, Default)]
pub struct ChannelSet {
    pub push: Option<Arc<dyn PushChannel>>,
    pub sms: Option<Arc<dyn SmsChannel>>,
    pub mesh: Option<Arc<dyn MeshChannel>>,
}

impl ChannelSet {
    /// Route every channel to the same implementation
    pub fn uniform<C>(channel: Arc<C>) -> Self
    where
        C: PushChannel + SmsChannel + MeshChannel + 'static,
    {
        Self {
            push: Some(channel.clone()),
            sms: Some(channel.clone()),
            mesh: Some(channel),
        }
    }
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Serialize)]
struct SmsBody<'a> {
    to: &'a str,
    body: String,
    incident_id: &'a str,
}

#[derive(Serialize)]
struct PushBody<'a> {
    token: &'a str,
    #[serde(flatten)]
    payload: &'a NotificationPayload,
}

/// JSON webhook towards a notification provider
pub struct WebhookChannel {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<Delivery, ChannelError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChannelError::Timeout
                } else {
                    ChannelError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(url = %self.url, status = %status, "Webhook delivered");
        if status.is_success() {
            Ok(Delivery { delivered: true })
        } else if status.is_server_error() {
            Err(ChannelError::Unavailable(format!("provider returned {status}")))
        } else {
            // Provider refused this message; retrying will not help
            Ok(Delivery { delivered: false })
        }
    }
}

#[async_trait::async_trait]
impl PushChannel for WebhookChannel {
    async fn send(
        &self,
        token: &str,
        payload: &NotificationPayload,
    ) -> Result<Delivery, ChannelError> {
        self.post(&PushBody { token, payload }).await
    }
}

#[async_trait::async_trait]
impl SmsChannel for WebhookChannel {
    async fn send(
        &self,
        phone: &str,
        payload: &NotificationPayload,
    ) -> Result<Delivery, ChannelError> {
        self.post(&SmsBody {
            to: phone,
            body: payload.sms_text(),
            incident_id: &payload.incident_id,
        })
        .await
    }
}

#[async_trait::async_trait]
impl MeshChannel for WebhookChannel {
    async fn broadcast(&self, payload: &NotificationPayload) -> Result<Delivery, ChannelError> {
        self.post(payload).await
    }
}

#[async_trait::async_trait]
impl AuthorityNotifier for WebhookChannel {
    async fn alert(&self, alert: &AuthorityAlert) -> Result<(), ChannelError> {
        let delivery = self.post(alert).await?;
        if delivery.delivered {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("authority endpoint refused alert".into()))
        }
    }
}

// ============================================================================
// Recording
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Push,
    Sms,
    Mesh,
}

/// One attempted send captured by [`RecordingChannel`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub channel: ChannelKind,
    pub target: Option<String>,
    pub payload: NotificationPayload,
}

/// Keeps every send in memory; can be told to fail
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail as unavailable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Distinct responders reached on any channel, in first-contact order
    pub fn notified_responders(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for sent in self.sent() {
            if !seen.contains(&sent.payload.responder_id) {
                seen.push(sent.payload.responder_id);
            }
        }
        seen
    }

    fn record(
        &self,
        channel: ChannelKind,
        target: Option<&str>,
        payload: &NotificationPayload,
    ) -> Result<Delivery, ChannelError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentNotification {
                channel,
                target: target.map(str::to_string),
                payload: payload.clone(),
            });
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable("recording channel set to fail".into()));
        }
        Ok(Delivery { delivered: true })
    }
}

#[async_trait::async_trait]
impl PushChannel for RecordingChannel {
    async fn send(
        &self,
        token: &str,
        payload: &NotificationPayload,
    ) -> Result<Delivery, ChannelError> {
        self.record(ChannelKind::Push, Some(token), payload)
    }
}

#[async_trait::async_trait]
impl SmsChannel for RecordingChannel {
    async fn send(
        &self,
        phone: &str,
        payload: &NotificationPayload,
    ) -> Result<Delivery, ChannelError> {
        self.record(ChannelKind::Sms, Some(phone), payload)
    }
}

#[async_trait::async_trait]
impl MeshChannel for RecordingChannel {
    async fn broadcast(&self, payload: &NotificationPayload) -> Result<Delivery, ChannelError> {
        self.record(ChannelKind::Mesh, payload.mesh_id.as_deref(), payload)
    }
}
