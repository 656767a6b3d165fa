use mongodb::error::Error as MongoError;
use thiserror::Error;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("tracked room `{room_id}` not found")]
    RoomNotFound { room_id: String },
    #[error("failed to list tracked rooms")]
    ListRooms {
        #[source]
        source: MongoError,
    },
    #[error("failed to load tracked room `{room_id}`")]
    LoadRoom {
        room_id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to save tracked room `{room_id}`")]
    SaveRoom {
        room_id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to delete tracked room `{room_id}`")]
    DeleteRoom {
        room_id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to read datapackage cache for `{game}` ({checksum})")]
    LoadDatapackage {
        game: String,
        checksum: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to write {count} datapackage cache entries")]
    SaveDatapackage {
        count: usize,
        #[source]
        source: MongoError,
    },
    #[error("failed to mark datapackage `{game}` ({checksum}) as cached")]
    MarkDatapackage {
        game: String,
        checksum: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to load notification ledger for room `{room_id}`")]
    LoadLedger {
        room_id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to commit notification ledger for room `{room_id}`")]
    CommitLedger {
        room_id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to access device registry")]
    Devices {
        #[source]
        source: MongoError,
    },
}
