//! One-off document sync trigger: routes a single upsert or delete to the partition
//! collection that owns the document.

use hyper::Method;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProxyError, Result};
use crate::partition::compute_partition_index;
use crate::request::{PartitionLayout, PartitionMode};

lazy_static! {
    static ref DOCUMENT_ID: Regex = Regex::new(r"^[A-Za-z0-9_\-.:@]+$").unwrap();
}

/// Sync command, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncCommand {
    /// Insert or replace one document.
    Upsert {
        /// Logical collection.
        collection: String,
        /// Document including its partition key field.
        document: Map<String, Value>,
    },
    /// Delete one document, from the owning partition when its partition value is known,
    /// otherwise from every partition.
    Delete {
        /// Logical collection.
        collection: String,
        /// Engine id of the document.
        #[serde(rename = "documentId")]
        document_id: String,
        /// Partition key of the document, when the caller knows it.
        #[serde(rename = "partitionValue", default)]
        partition_value: Option<u64>,
    },
}

/// A planned engine call of a sync command, without credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCall {
    /// HTTP method.
    pub method: Method,
    /// Engine path.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

fn partition_value(document: &Map<String, Value>, key: &str) -> Result<u64> {
    match document.get(key) {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        ProxyError::MalformedRequest(format!(
            "document has no non-negative integer partition key '{key}'"
        ))
    })
}

fn owning_collection(layout: &PartitionLayout, base: &str, value: u64) -> Result<String> {
    if value >= layout.total_domain {
        return Err(ProxyError::MalformedRequest(format!(
            "partition value {value} outside [0, {})",
            layout.total_domain
        )));
    }
    let index = compute_partition_index(layout.num_partitions, value, layout.total_domain)?;
    Ok(match layout.mode {
        PartitionMode::Alias => PartitionLayout::collection_alias(base, index),
        PartitionMode::Filter => base.to_string(),
    })
}

/// A single path segment: whitelisted characters and never a dot segment (`.`, `..`).
fn is_path_segment(name: &str) -> bool {
    DOCUMENT_ID.is_match(name) && !name.chars().all(|c| c == '.')
}

fn check_collection(collection: &str) -> Result<()> {
    if is_path_segment(collection) {
        Ok(())
    } else {
        Err(ProxyError::MalformedRequest(format!(
            "invalid collection name '{collection}'"
        )))
    }
}

impl SyncCommand {
    /// Parse a command body.
    pub fn from_slice(body: &[u8]) -> Result<SyncCommand> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Engine calls that carry out this command.
    pub fn plan(&self, layout: &PartitionLayout) -> Result<Vec<SyncCall>> {
        match self {
            SyncCommand::Upsert {
                collection,
                document,
            } => plan_upsert(layout, collection, document),
            SyncCommand::Delete {
                collection,
                document_id,
                partition_value,
            } => plan_delete(layout, collection, document_id, *partition_value),
        }
    }
}

fn plan_upsert(
    layout: &PartitionLayout,
    collection: &str,
    document: &Map<String, Value>,
) -> Result<Vec<SyncCall>> {
    check_collection(collection)?;
    let value = partition_value(document, &layout.partition_key)?;
    let target = owning_collection(layout, collection, value)?;
    Ok(vec![SyncCall {
        method: Method::POST,
        path: format!("collections/{target}/documents"),
        query: vec![("action".to_string(), "upsert".to_string())],
        body: Some(serde_json::to_vec(document)?),
    }])
}

fn plan_delete(
    layout: &PartitionLayout,
    collection: &str,
    document_id: &str,
    partition_value: Option<u64>,
) -> Result<Vec<SyncCall>> {
    check_collection(collection)?;
    if !is_path_segment(document_id) {
        return Err(ProxyError::MalformedRequest(format!(
            "invalid documentId '{document_id}'"
        )));
    }

    let targets = match (partition_value, &layout.mode) {
        (Some(value), _) => vec![owning_collection(layout, collection, value)?],
        (None, PartitionMode::Filter) => vec![collection.to_string()],
        (None, PartitionMode::Alias) => (0..layout.num_partitions)
            .map(|index| PartitionLayout::collection_alias(collection, index))
            .collect(),
    };

    Ok(targets
        .into_iter()
        .map(|target| SyncCall {
            method: Method::DELETE,
            path: format!("collections/{target}/documents/{document_id}"),
            query: Vec::new(),
            body: None,
        })
        .collect())
}
