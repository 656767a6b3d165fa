mod config;
mod connection;
mod error;
mod models;
mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoTrackerStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::RoomNotFound { room_id } => StorageError::RoomNotFound { room_id },
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
