use std::{sync::Arc, time::Duration};

use indexmap::IndexSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::PushConfig,
    dao::tracker_store::TrackerStore,
    push::{Notification, PushMessage, PushOutcome, PushTransport},
};

/// What happened to one dispatch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Tokens removed from the registry because the transport reported them invalid.
    pub pruned: u64,
}

/// Fans notification contents out to every registered device in fixed-size chunks.
#[derive(Clone)]
pub struct NotificationDispatcher {
    transport: Arc<dyn PushTransport>,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl NotificationDispatcher {
    pub fn new(transport: Arc<dyn PushTransport>, config: &PushConfig) -> Self {
        Self {
            transport,
            chunk_size: config.chunk_size.max(1),
            chunk_delay: config.chunk_delay(),
        }
    }

    /// Send every content to every token. No-op when either side is empty.
    ///
    /// A failed chunk is logged and skipped. Tokens reported as unregistered are
    /// deleted from `store`.
    pub async fn dispatch(
        &self,
        store: &dyn TrackerStore,
        contents: &IndexSet<Notification>,
        tokens: &[String],
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if contents.is_empty() || tokens.is_empty() {
            debug!(
                contents = contents.len(),
                tokens = tokens.len(),
                "nothing to dispatch"
            );
            return report;
        }

        let messages: Vec<PushMessage> = contents
            .iter()
            .flat_map(|notification| {
                tokens.iter().map(move |token| PushMessage {
                    notification: notification.clone(),
                    token: token.clone(),
                })
            })
            .collect();

        let mut invalid: IndexSet<String> = IndexSet::new();
        let chunks: Vec<&[PushMessage]> = messages.chunks(self.chunk_size).collect();
        let total_chunks = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if index > 0 {
                sleep(self.chunk_delay).await;
            }

            match self.transport.send_batch(chunk.to_vec()).await {
                Ok(outcomes) => {
                    for (message, outcome) in chunk.iter().zip(outcomes) {
                        match outcome {
                            PushOutcome::Delivered => report.delivered += 1,
                            PushOutcome::Unregistered => {
                                report.failed += 1;
                                invalid.insert(message.token.clone());
                            }
                            PushOutcome::Failed(reason) => {
                                report.failed += 1;
                                debug!(reason = %reason, "push message failed");
                            }
                        }
                    }
                }
                Err(err) => {
                    report.failed += chunk.len();
                    warn!(
                        chunk = index + 1,
                        chunks = total_chunks,
                        error = %err,
                        "push chunk failed"
                    );
                }
            }
        }

        if !invalid.is_empty() {
            match store
                .remove_device_tokens(invalid.into_iter().collect())
                .await
            {
                Ok(removed) => {
                    report.pruned = removed;
                    info!(removed, "removed unregistered device tokens");
                }
                Err(err) => warn!(error = %err, "failed to remove unregistered device tokens"),
            }
        }

        info!(
            delivered = report.delivered,
            failed = report.failed,
            "dispatched notifications"
        );
        report
    }
}
