//! Push-notification transport seam.

pub mod error;
pub mod fcm;

use futures::future::BoxFuture;
use tracing::info;

pub use error::{PushError, PushResult};
pub use fcm::FcmTransport;

/// User-facing content of a notification; equal texts collapse into one push.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// One notification addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub notification: Notification,
    pub token: String,
}

/// Per-message result reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The token is permanently invalid and should be dropped from the registry.
    Unregistered,
    Failed(String),
}

/// Batched fan-out to device tokens. Outcomes are returned in message order.
pub trait PushTransport: Send + Sync {
    fn send_batch(&self, messages: Vec<PushMessage>)
    -> BoxFuture<'static, PushResult<Vec<PushOutcome>>>;
}

/// Transport used when no push credentials are configured: notifications are only logged.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

impl PushTransport for LogTransport {
    fn send_batch(
        &self,
        messages: Vec<PushMessage>,
    ) -> BoxFuture<'static, PushResult<Vec<PushOutcome>>> {
        Box::pin(async move {
            for message in &messages {
                info!(
                    title = %message.notification.title,
                    body = %message.notification.body,
                    "notification (push transport not configured)"
                );
            }
            Ok(vec![PushOutcome::Delivered; messages.len()])
        })
    }
}
