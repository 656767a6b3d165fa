/// Write-once cache of datapackage names.
pub mod datapackage_cache;
/// Ledger-based deduplication of tracker events into notifications.
pub mod event_dedup;
/// Health check service.
pub mod health_service;
/// Chunked push fan-out with token pruning.
pub mod notification_dispatcher;
/// Reconciliation of configured rooms against running pollers.
pub mod poller_supervisor;
/// Setup and poll loop of one room.
pub mod room_poller;
/// Storage connection supervisor with degraded mode.
pub mod storage_supervisor;
/// Normalization of tracker payloads into events.
pub mod tracker_events;
