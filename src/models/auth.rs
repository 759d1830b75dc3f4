//! Token claim payloads and the parsed scope model.
//!
//! The wire contract is JWT-shaped: claims use the camelCase names below.
//! Scope entries translate into six path/prefix sets that gate writes,
//! deletes, and archival writes.

use serde::{Deserialize, Serialize};

use crate::errors::{HubError, HubResult};

/// Hard cap on scope entries per token.
pub const MAX_AUTH_SCOPES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScopeType {
    #[serde(rename = "putFile")]
    PutFile,
    #[serde(rename = "putFilePrefix")]
    PutFilePrefix,
    #[serde(rename = "deleteFile")]
    DeleteFile,
    #[serde(rename = "deleteFilePrefix")]
    DeleteFilePrefix,
    #[serde(rename = "putFileArchival")]
    PutFileArchival,
    #[serde(rename = "putFileArchivalPrefix")]
    PutFileArchivalPrefix,
}

/// One scope entry as it appears in the token's `scopes` claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub scope: AuthScopeType,
    pub domain: String,
}

/// Claims of the outer bearer token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub gaia_challenge: Option<String>,
    #[serde(default)]
    pub hub_url: Option<String>,
    #[serde(default)]
    pub gaia_hub_url: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<ScopeEntry>>,
    #[serde(default)]
    pub association_token: Option<String>,
    #[serde(default)]
    pub exp: Option<f64>,
    #[serde(default)]
    pub iat: Option<f64>,
    #[serde(default)]
    pub salt: Option<String>,
}

/// Claims of a nested association token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationPayload {
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub child_to_associate: Option<String>,
    #[serde(default)]
    pub exp: Option<f64>,
    #[serde(default)]
    pub iat: Option<f64>,
    #[serde(default)]
    pub salt: Option<String>,
}

/// Scope entries partitioned into the six path/prefix sets.
///
/// Empty write (or delete) sets mean any path within the bucket is allowed.
/// The archival sets additionally restrict both writes and deletes when
/// non-empty.
#[derive(Debug, Clone, Default)]
pub struct AuthScopes {
    pub write_paths: Vec<String>,
    pub write_prefixes: Vec<String>,
    pub delete_paths: Vec<String>,
    pub delete_prefixes: Vec<String>,
    pub write_archival_paths: Vec<String>,
    pub write_archival_prefixes: Vec<String>,
}

impl AuthScopes {
    pub fn from_entries(entries: &[ScopeEntry]) -> Self {
        let mut scopes = AuthScopes::default();
        for entry in entries {
            let domain = entry.domain.clone();
            match entry.scope {
                AuthScopeType::PutFile => scopes.write_paths.push(domain),
                AuthScopeType::PutFilePrefix => scopes.write_prefixes.push(domain),
                AuthScopeType::DeleteFile => scopes.delete_paths.push(domain),
                AuthScopeType::DeleteFilePrefix => scopes.delete_prefixes.push(domain),
                AuthScopeType::PutFileArchival => scopes.write_archival_paths.push(domain),
                AuthScopeType::PutFileArchivalPrefix => {
                    scopes.write_archival_prefixes.push(domain)
                }
            }
        }
        scopes
    }

    /// Archival restriction is in effect when any write-archival entry exists.
    pub fn is_archival_restricted(&self) -> bool {
        !self.write_archival_paths.is_empty() || !self.write_archival_prefixes.is_empty()
    }

    fn matches(paths: &[String], prefixes: &[String], path: &str) -> bool {
        paths.iter().any(|p| p == path) || prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// When archival-restricted, the path must match a write-archival entry.
    pub fn check_archival_write(&self, path: &str) -> HubResult<()> {
        if !self.is_archival_restricted() {
            return Ok(());
        }
        if Self::matches(
            &self.write_archival_paths,
            &self.write_archival_prefixes,
            path,
        ) {
            Ok(())
        } else {
            Err(HubError::validation(format!(
                "archival scopes do not permit writes to {path}"
            )))
        }
    }

    pub fn check_write(&self, path: &str) -> HubResult<()> {
        if self.write_paths.is_empty() && self.write_prefixes.is_empty() {
            return Ok(());
        }
        if Self::matches(&self.write_paths, &self.write_prefixes, path) {
            Ok(())
        } else {
            Err(HubError::validation(format!(
                "token scopes do not permit writes to {path}"
            )))
        }
    }

    pub fn check_delete(&self, path: &str) -> HubResult<()> {
        if self.delete_paths.is_empty() && self.delete_prefixes.is_empty() {
            return Ok(());
        }
        if Self::matches(&self.delete_paths, &self.delete_prefixes, path) {
            Ok(())
        } else {
            Err(HubError::validation(format!(
                "token scopes do not permit deleting {path}"
            )))
        }
    }
}
