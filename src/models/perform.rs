//! Batch operation tree accepted by the perform-files endpoint.
//!
//! Interior nodes group children sequentially or in bounded-parallel
//! windows; leaves are individual PUT/DELETE operations. Per-leaf failures
//! are captured as `{success: false}` results rather than failing the batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::HubError;

/// Longest error message echoed back in a leaf result.
const MAX_LEAF_ERROR_LEN: usize = 999;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PerformNode {
    Group(PerformGroup),
    Leaf(PerformLeaf),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformGroup {
    pub values: Vec<PerformNode>,
    #[serde(default)]
    pub is_sequential: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PerformOpType {
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformLeaf {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(rename = "type")]
    pub op: PerformOpType,
    pub path: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub do_ignore_does_not_exist_error: bool,
}

/// Outcome of one leaf, in input order within its group.
#[derive(Debug, Clone, Serialize)]
pub struct LeafResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(rename = "publicURL", skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LeafResult {
    pub fn put_ok(id: Option<Value>, public_url: String, etag: String) -> Self {
        LeafResult {
            success: true,
            id,
            public_url: Some(public_url),
            etag: Some(etag),
            error: None,
        }
    }

    pub fn delete_ok(id: Option<Value>) -> Self {
        LeafResult {
            success: true,
            id,
            public_url: None,
            etag: None,
            error: None,
        }
    }

    pub fn failed(id: Option<Value>, err: &HubError) -> Self {
        let mut message = err.to_string();
        if message.len() > MAX_LEAF_ERROR_LEN {
            let cut = (0..=MAX_LEAF_ERROR_LEN)
                .rev()
                .find(|i| message.is_char_boundary(*i))
                .unwrap_or(0);
            message.truncate(cut);
        }
        LeafResult {
            success: false,
            id,
            public_url: None,
            etag: None,
            error: Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_deserializes_groups_and_leaves() {
        let json = r#"{
            "isSequential": true,
            "values": [
                {"id": "1", "type": "PUT", "path": "a.txt", "content": "hi"},
                {"values": [
                    {"id": "2", "type": "DELETE", "path": "b.txt",
                     "doIgnoreDoesNotExistError": true}
                ]}
            ]
        }"#;
        let node: PerformNode = serde_json::from_str(json).expect("parse tree");
        let PerformNode::Group(group) = node else {
            panic!("expected group root");
        };
        assert!(group.is_sequential);
        assert_eq!(group.values.len(), 2);
        let PerformNode::Leaf(leaf) = &group.values[0] else {
            panic!("expected leaf first");
        };
        assert_eq!(leaf.op, PerformOpType::Put);
        assert_eq!(leaf.path, "a.txt");
    }

    #[test]
    fn leaf_error_is_truncated() {
        let err = HubError::validation("x".repeat(2000));
        let result = LeafResult::failed(None, &err);
        assert!(!result.success);
        assert_eq!(result.error.unwrap().len(), 999);
    }
}
