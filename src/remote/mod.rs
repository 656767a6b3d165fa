//! Client side of the third-party game-room service.

pub mod client;
pub mod error;
pub mod models;

use std::collections::BTreeMap;

use futures::future::BoxFuture;

pub use client::ArchipelagoClient;
pub use error::{RemoteError, RemoteResult};

use self::models::{GamePackage, RoomStatus, TrackerPayload};

/// Read-only operations the tracker needs from the game-room service.
pub trait RoomApi: Send + Sync {
    /// Roster, port and tracker handle of a room.
    fn room_status(&self, room_id: &str) -> BoxFuture<'static, RemoteResult<RoomStatus>>;
    /// Consolidated per-room tracker state.
    fn tracker(&self, tracker_handle: &str) -> BoxFuture<'static, RemoteResult<TrackerPayload>>;
    /// Name manifest of `game` addressed by `checksum`.
    fn datapackage(
        &self,
        game: &str,
        checksum: &str,
    ) -> BoxFuture<'static, RemoteResult<GamePackage>>;
    /// Open a short-lived room socket and read the checksum manifest from its first frame.
    fn socket_checksums(
        &self,
        port: u16,
    ) -> BoxFuture<'static, RemoteResult<BTreeMap<String, String>>>;
}
