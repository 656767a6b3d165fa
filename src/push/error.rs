use thiserror::Error;

pub type PushResult<T> = Result<T, PushError>;

/// Failures of the push transport as a whole (per-message failures are outcomes).
#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to build push HTTP client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    #[error("missing push credential `{var}`")]
    MissingCredential { var: &'static str },
    #[error("failed to load FCM service account")]
    ServiceAccount {
        #[source]
        source: gcp_auth::Error,
    },
    /// No access token could be minted, so the whole batch was not sent.
    #[error("failed to obtain FCM access token: {message}")]
    AccessToken { message: String },
}
