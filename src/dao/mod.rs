/// Database model definitions.
pub mod models;
/// Storage abstraction layer for database operations.
pub mod storage;
/// Tracker persistence seam and its backends.
pub mod tracker_store;
