//! Multi-channel responder notification with tiered escalation

pub mod channels;
pub mod dispatcher;

pub use channels::{
    ChannelError, ChannelKind, ChannelSet, Delivery, MeshChannel, NotificationPayload,
    PushChannel, RecordingChannel, SentNotification, SmsChannel, WebhookChannel,
};
pub use dispatcher::{DispatchConfig, Dispatcher};
