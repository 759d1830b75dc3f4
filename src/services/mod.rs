//! Core services: the storage-driver contract and its disk implementation,
//! token verification, the policy caches, per-endpoint locking, the upload
//! byte meter, and the hub request pipeline itself.

pub mod auth_timestamp_cache;
pub mod blacklist_cache;
pub mod disk_driver;
pub mod driver;
pub mod endpoint_locks;
pub mod hub_service;
pub mod perform_files;
pub mod stream_monitor;
pub mod token_verifier;
pub mod ttl_cache;
