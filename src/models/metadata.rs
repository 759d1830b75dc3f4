//! Object metadata as reported by the storage driver.

use serde::Serialize;

/// Result of a stat call against a single key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStat {
    pub exists: bool,

    /// Quoted lowercase-hex MD5 of the stored body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,

    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_date: Option<i64>,

    /// Monotone per-key version id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

impl ObjectStat {
    pub fn missing() -> Self {
        ObjectStat {
            exists: false,
            etag: None,
            content_type: None,
            content_length: None,
            last_modified_date: None,
            generation: None,
        }
    }
}

/// A list entry with metadata, returned by stat-mode listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatEntry {
    pub name: String,
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content_length: u64,
    pub last_modified_date: i64,
    pub generation: i64,
}
