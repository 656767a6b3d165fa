//! Error types raised while talking to the game-room service.

use reqwest::StatusCode;
use thiserror::Error;

/// Convenient result alias returning [`RemoteError`] failures.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures that can occur while fetching remote room state.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build HTTP client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// The request could not be sent or timed out.
    #[error("failed to send request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The service answered with a non-success status.
    #[error("unexpected response status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    /// The response body was not the expected JSON.
    #[error("failed to decode response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// A JSON value could not be mapped onto the expected model.
    #[error("failed to deserialize payload for `{path}`")]
    DeserializeValue {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    /// Room status did not carry a tracker handle or a port.
    #[error("room `{room_id}` has no {missing} yet")]
    RoomNotReady {
        room_id: String,
        missing: &'static str,
    },
    /// The room socket could not be opened.
    #[error("failed to connect to room socket `{uri}`")]
    SocketConnect {
        uri: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    /// The room socket did not produce a usable first frame in time.
    #[error("room socket `{uri}` timed out")]
    SocketTimeout { uri: String },
    /// The room socket closed or sent something other than a text `RoomInfo` frame.
    #[error("room socket `{uri}` sent no room info")]
    SocketHandshake { uri: String },
}
