//! Firebase Cloud Messaging HTTP v1 transport.

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use futures::future::{BoxFuture, join_all};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    PushMessage, PushOutcome, PushTransport,
    error::{PushError, PushResult},
};
use crate::config::PushConfig;

const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const UNREGISTERED: &str = "UNREGISTERED";

/// Retries after the first attempt of a message.
const MAX_RETRIES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
enum Credentials {
    /// Service-account key; tokens are cached and refreshed before they expire.
    ServiceAccount(Arc<dyn TokenProvider>),
    #[cfg(test)]
    Fixed(Arc<str>),
}

impl Credentials {
    async fn bearer(&self) -> PushResult<String> {
        match self {
            Credentials::ServiceAccount(provider) => provider
                .token(&[FCM_SCOPE])
                .await
                .map(|token| token.as_str().to_owned())
                .map_err(|err| PushError::AccessToken {
                    message: err.to_string(),
                }),
            #[cfg(test)]
            Credentials::Fixed(token) => Ok(token.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct FcmTransport {
    client: Client,
    endpoint: Arc<str>,
    credentials: Credentials,
    retry_backoff: Duration,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    message: MessageBody<'a>,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    token: &'a str,
    notification: NotificationBody<'a>,
}

#[derive(Serialize)]
struct NotificationBody<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: ErrorStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

impl FcmTransport {
    /// Build the transport for `project_id` from the service-account key at
    /// `push.fcm_credentials_path`, or `GOOGLE_APPLICATION_CREDENTIALS` when unset.
    pub fn from_service_account(config: &PushConfig, project_id: &str) -> PushResult<Self> {
        let path = config
            .fcm_credentials_path
            .clone()
            .or_else(|| env::var_os(CREDENTIALS_ENV).map(PathBuf::from))
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(PushError::MissingCredential {
                var: CREDENTIALS_ENV,
            })?;
        let account = CustomServiceAccount::from_file(&path)
            .map_err(|source| PushError::ServiceAccount { source })?;

        Self::with_credentials(config, project_id, Credentials::ServiceAccount(Arc::new(account)))
    }

    fn with_credentials(
        config: &PushConfig,
        project_id: &str,
        credentials: Credentials,
    ) -> PushResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|source| PushError::ClientBuilder { source })?;
        let endpoint = format!(
            "{}/v1/projects/{}/messages:send",
            config.fcm_base_url.trim_end_matches('/'),
            project_id
        );

        Ok(Self {
            client,
            endpoint: Arc::from(endpoint),
            credentials,
            retry_backoff: RETRY_BACKOFF,
        })
    }

    /// Send one message, retrying throttling, upstream errors and dropped connections.
    async fn send_one(&self, bearer: &str, message: &PushMessage) -> PushOutcome {
        let request = SendRequest {
            message: MessageBody {
                token: &message.token,
                notification: NotificationBody {
                    title: &message.notification.title,
                    body: &message.notification.body,
                },
            },
        };

        let mut retries = 0;
        loop {
            let reason = match self
                .client
                .post(self.endpoint.as_ref())
                .bearer_auth(bearer)
                .json(&request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return PushOutcome::Delivered;
                    }
                    if !is_retryable(status) {
                        let error = response.json::<ErrorResponse>().await.unwrap_or_default();
                        return classify_failure(status, &error);
                    }
                    status.to_string()
                }
                Err(err) if err.is_connect() || err.is_timeout() => err.to_string(),
                Err(err) => return PushOutcome::Failed(err.to_string()),
            };

            if retries >= MAX_RETRIES {
                return PushOutcome::Failed(reason);
            }
            let delay = retry_delay(self.retry_backoff, retries);
            debug!(retries, delay_ms = delay.as_millis() as u64, %reason, "retrying push message");
            sleep(delay).await;
            retries += 1;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// `backoff * 2^retries`.
fn retry_delay(backoff: Duration, retries: u32) -> Duration {
    backoff.saturating_mul(1 << retries.min(16))
}

fn classify_failure(status: StatusCode, error: &ErrorResponse) -> PushOutcome {
    let unregistered = error
        .error
        .details
        .iter()
        .any(|detail| detail.error_code.as_deref() == Some(UNREGISTERED));
    if unregistered || error.error.status == UNREGISTERED {
        return PushOutcome::Unregistered;
    }
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        warn!(%status, fcm_status = %error.error.status, "FCM refused the push credentials");
    }
    PushOutcome::Failed(format!("{status} {}", error.error.status))
}

impl PushTransport for FcmTransport {
    fn send_batch(
        &self,
        messages: Vec<PushMessage>,
    ) -> BoxFuture<'static, PushResult<Vec<PushOutcome>>> {
        let transport = self.clone();
        Box::pin(async move {
            let bearer = transport.credentials.bearer().await?;
            let outcomes = join_all(
                messages
                    .iter()
                    .map(|message| transport.send_one(&bearer, message)),
            )
            .await;
            debug!(count = outcomes.len(), "sent push batch");
            Ok(outcomes)
        })
    }
}
