// This crate is a library
#![crate_type = "lib"]
// The library is named "shardsearch"
#![crate_name = "shardsearch"]

//! # `shardsearch`
//!
//! shardsearch is a partitioned search proxy written in Rust.
//! It fans one search (single or multi search) out over N horizontally partitioned
//! collections of a Typesense-style search engine and merges the N partial results
//! back into the one result an unpartitioned query would have returned.
//! The **shardsearch library** can be embedded into your program, while the **shardsearch server**
//! is a standalone proxy to be accessed via HTTP.
//!
//! ### Add required crates to your project
//! ```text
//! cargo add shardsearch
//! cargo add tokio
//! cargo add serde_json
//! ```
//!
//! ### partition a key domain
//! ```rust
//! use shardsearch::partition::{compute_partitions, compute_partition_index};
//!
//! let ranges = compute_partitions(100, 2).unwrap();
//! assert_eq!((ranges[0].start, ranges[0].end), (0, 49));
//! assert_eq!((ranges[1].start, ranges[1].end), (50, 99));
//! assert_eq!(compute_partition_index(2, 73, 100).unwrap(), 1);
//! ```
//!
//! ### split a search and merge the partial results
//! ```rust
//! use serde_json::json;
//! use shardsearch::request::{split_request, PartitionLayout, PartitionMode};
//! use shardsearch::merge::merge;
//!
//! let layout = PartitionLayout {
//!     partition_key: "partition".to_string(),
//!     total_domain: 100,
//!     num_partitions: 2,
//!     mode: PartitionMode::Filter,
//! };
//! let request = json!({"collection": "books", "q": "*", "per_page": 5});
//! let split = split_request(&request, &layout).unwrap();
//! assert_eq!(split.variants[1].request["filter_by"], "partition:[50..99]");
//!
//! let partials = vec![
//!     json!({"found": 1, "hits": [{"document": {"id": "1"}, "text_match": 7}]}),
//!     json!({"found": 1, "hits": [{"document": {"id": "2"}, "text_match": 9}]}),
//! ];
//! let merged = merge(&request, &partials).unwrap();
//! assert_eq!(merged["found"], 2);
//! assert_eq!(merged["hits"][0]["document"]["id"], "2");
//! ```
//!
//! ### run the proxy
//! ```text
//! let config = Arc::new(ProxyConfig::load(&params, &env)?);
//! let proxy = Proxy::new(config.clone(), HttpBackend::new(&config), Box::new(TokenAuthorizer::new(&config.tokens)));
//! let response = proxy.handle(request).await;
//! ```

/// Caller identity and the capability check gating every proxied request.
pub mod auth;
/// Proxy configuration: defaults, config file, environment and command line overrides.
pub mod config;
/// Error kinds and their HTTP status mapping.
pub mod error;
/// Scoped search keys and the administrative key.
pub mod keys;
/// Merge of partial search results: facets, hits, grouped hits, counters and final pagination.
pub mod merge;
/// Contiguous numeric ranges over the partition key domain.
pub mod partition;
/// Request-handling entry point: authorization, credential choice, fan-out, merge and passthrough.
pub mod proxy;
/// Splits a single or multi search into one request per partition.
pub mod request;
/// `sort_by` parsing and the hit comparator built from it.
pub mod sort;
/// One-off document sync routed to the owning partition.
pub mod sync;
/// Transport towards the search engine.
pub mod upstream;

pub use crate::error::{ProxyError, Result};
pub use crate::proxy::{Proxy, ProxyRequest, ProxyResponse};

/// Version of the shardsearch library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
