//! HTTP handlers, grouped by concern: the authenticated store endpoints,
//! hub metadata, and health probes.

pub mod health_handlers;
pub mod info_handlers;
pub mod store_handlers;
