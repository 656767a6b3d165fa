use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::{StreamExt, future::BoxFuture};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use super::{
    RoomApi,
    error::{RemoteError, RemoteResult},
    models::{GamePackage, RoomInfo, RoomStatus, TrackerPayload, game_package_from_value},
};
use crate::config::RemoteConfig;

/// HTTP + socket client for an Archipelago-compatible host.
#[derive(Clone)]
pub struct ArchipelagoClient {
    client: Client,
    host: Arc<str>,
    socket_timeout: Duration,
}

impl ArchipelagoClient {
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|source| RemoteError::ClientBuilder { source })?;

        Ok(Self {
            client,
            host: Arc::from(config.host.trim_end_matches('/')),
            socket_timeout: config.socket_timeout(),
        })
    }

    async fn get_json<T>(&self, path: &str) -> RemoteResult<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("https://{}/api/{}", self.host, path);
        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|source| RemoteError::RequestSend {
                    path: path.to_owned(),
                    source,
                })?;

        match response.status() {
            status if status.is_success() => {
                response
                    .json::<T>()
                    .await
                    .map_err(|source| RemoteError::DecodeResponse {
                        path: path.to_owned(),
                        source,
                    })
            }
            other => Err(RemoteError::RequestStatus {
                path: path.to_owned(),
                status: other,
            }),
        }
    }

    async fn read_room_info(&self, port: u16) -> RemoteResult<BTreeMap<String, String>> {
        let uri = format!("wss://{}:{}", self.host, port);
        let connect = timeout(self.socket_timeout, connect_async(uri.as_str()))
            .await
            .map_err(|_| RemoteError::SocketTimeout { uri: uri.clone() })?;
        let (mut socket, _) = connect.map_err(|source| RemoteError::SocketConnect {
            uri: uri.clone(),
            source,
        })?;

        let frame = timeout(self.socket_timeout, socket.next())
            .await
            .map_err(|_| RemoteError::SocketTimeout { uri: uri.clone() })?;
        // Best effort; the frame is already in hand.
        let _ = socket.close(None).await;

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Err(source)) => return Err(RemoteError::SocketConnect { uri, source }),
            _ => return Err(RemoteError::SocketHandshake { uri }),
        };

        let commands: Vec<Value> =
            serde_json::from_str(&text).map_err(|source| RemoteError::DeserializeValue {
                path: uri.clone(),
                source,
            })?;
        let first = commands
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::SocketHandshake { uri: uri.clone() })?;
        let info: RoomInfo = serde_json::from_value(first)
            .map_err(|source| RemoteError::DeserializeValue { path: uri, source })?;

        debug!(port, games = info.datapackage_checksums.len(), "read room info from socket");
        Ok(info.datapackage_checksums)
    }
}

impl RoomApi for ArchipelagoClient {
    fn room_status(&self, room_id: &str) -> BoxFuture<'static, RemoteResult<RoomStatus>> {
        let client = self.clone();
        let path = format!("room_status/{room_id}");
        Box::pin(async move { client.get_json(&path).await })
    }

    fn tracker(&self, tracker_handle: &str) -> BoxFuture<'static, RemoteResult<TrackerPayload>> {
        let client = self.clone();
        let path = format!("tracker/{tracker_handle}");
        Box::pin(async move { client.get_json(&path).await })
    }

    fn datapackage(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, RemoteResult<GamePackage>> {
        let client = self.clone();
        let game = game.to_owned();
        let path = format!("datapackage/{checksum}");
        Box::pin(async move {
            let value: Value = client.get_json(&path).await?;
            game_package_from_value(&game, value)
                .map_err(|source| RemoteError::DeserializeValue { path, source })
        })
    }

    fn socket_checksums(
        &self,
        port: u16,
    ) -> BoxFuture<'static, RemoteResult<BTreeMap<String, String>>> {
        let client = self.clone();
        Box::pin(async move { client.read_room_info(port).await })
    }
}
