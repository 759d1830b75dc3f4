//! Policy records shared between the hub core and the storage driver.

use serde::{Deserialize, Serialize};

/// Operation class consulted against the per-type blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformType {
    Put,
    Delete,
    List,
    Perform,
}

/// Per-address block status. `0` not blocked, `1` fully blocked,
/// `2` write-blocked only; unknown values are treated as not blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlacklistType(pub i64);

impl BlacklistType {
    pub const NOT_BLOCKED: BlacklistType = BlacklistType(0);
    pub const FULLY_BLOCKED: BlacklistType = BlacklistType(1);
    pub const WRITE_BLOCKED: BlacklistType = BlacklistType(2);

    pub fn blocks(self, perform: PerformType) -> bool {
        match self.0 {
            1 => true,
            2 => perform == PerformType::Put,
            _ => false,
        }
    }
}

/// Action recorded in the append-only file log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAction {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl FileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::Create => "CREATE",
            FileAction::Update => "UPDATE",
            FileAction::Delete => "DELETE",
        }
    }
}

/// One append-only record describing a mutation, enqueued alongside backup
/// paths after every successful write, delete, or rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLogRecord {
    pub path: String,
    pub asso_iss_address: Option<String>,
    pub action: FileAction,
    pub size: u64,
    pub size_change: i64,
    #[serde(rename = "createDT")]
    pub create_dt: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_types_map_to_perform_types() {
        assert!(!BlacklistType::NOT_BLOCKED.blocks(PerformType::Put));
        assert!(BlacklistType::FULLY_BLOCKED.blocks(PerformType::List));
        assert!(BlacklistType::WRITE_BLOCKED.blocks(PerformType::Put));
        assert!(!BlacklistType::WRITE_BLOCKED.blocks(PerformType::Delete));
        assert!(!BlacklistType(7).blocks(PerformType::Put));
    }
}
