//! Core data models for the storage hub.
//!
//! Token claims and scopes, driver-facing object metadata, policy records,
//! and the perform-files batch tree. Everything here serializes with the
//! camelCase names the wire contract uses.

pub mod auth;
pub mod metadata;
pub mod perform;
pub mod records;
