use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProxyError, Result};
use crate::partition::{PartitionSpec, partition_specs};
use crate::sort::{DEFAULT_SORT_BY, SortSpec};

/// Page size requested from every shard so the merged result can be re-sorted and
/// re-paginated. Only the top `OVERFETCH_PER_PAGE * num_partitions` hits are considered.
pub const OVERFETCH_PER_PAGE: i64 = 249;
/// Engine default for `page`.
pub const DEFAULT_PAGE: u64 = 1;
/// Engine default for `per_page`.
pub const DEFAULT_PER_PAGE: i64 = 10;
/// Engine default for `max_facet_values`.
pub const DEFAULT_MAX_FACET_VALUES: usize = 10;
/// Engine default for `group_limit`.
pub const DEFAULT_GROUP_LIMIT: usize = 3;

/// How a logical collection is spread over its partitions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionMode {
    /// All partitions live in one collection; each shard query adds a range filter on the partition key.
    #[default]
    Filter,
    /// Each partition is its own collection alias: `<base>` for shard 0, `<base>-<i>` otherwise.
    Alias,
}

/// Partition layout a search is split over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    /// Numeric field the partitions are ranges of.
    pub partition_key: String,
    /// Size of the key domain.
    pub total_domain: u64,
    /// Number of partitions.
    pub num_partitions: u64,
    /// How partitions are addressed.
    pub mode: PartitionMode,
}

impl PartitionLayout {
    /// Fail fast on a layout that cannot produce valid shard queries.
    pub fn validate(&self) -> Result<()> {
        if self.partition_key.is_empty() || self.partition_key.chars().any(char::is_whitespace) {
            return Err(ProxyError::Config(format!(
                "partition key '{}' must be non-empty and contain no whitespace",
                self.partition_key
            )));
        }
        partition_specs(&self.partition_key, self.total_domain, self.num_partitions).map(|_| ())
    }

    /// Collection name addressed by shard `index` in alias mode.
    pub fn collection_alias(base: &str, index: u64) -> String {
        if index == 0 {
            base.to_string()
        } else {
            format!("{base}-{index}")
        }
    }
}

/// Original pagination, sort and facet parameters of one logical search,
/// applied once after all shard results are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    /// Parsed `sort_by`, `_text_match:desc` when absent.
    pub sort: SortSpec,
    /// Requested page, from 1.
    pub page: u64,
    /// Requested hits per page.
    pub per_page: i64,
    /// Facet values kept per field.
    pub max_facet_values: usize,
    /// Search has a `group_by`.
    pub grouped: bool,
    /// Hits kept per group.
    pub group_limit: usize,
    /// `per_page` was given and is not positive: only facets are requested.
    pub facet_only: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            sort: SortSpec::default(),
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PER_PAGE,
            max_facet_values: DEFAULT_MAX_FACET_VALUES,
            grouped: false,
            group_limit: DEFAULT_GROUP_LIMIT,
            facet_only: false,
        }
    }
}

/// Read an integer parameter that may arrive as a JSON number or, from a query string, as text.
fn int_param(search: &Value, name: &str) -> Result<Option<i64>> {
    match search.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| ProxyError::MalformedRequest(format!("{name} is not an integer"))),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ProxyError::MalformedRequest(format!("{name} is not an integer"))),
        Some(_) => Err(ProxyError::MalformedRequest(format!(
            "{name} is not an integer"
        ))),
    }
}

fn str_param<'a>(search: &'a Value, name: &str) -> Option<&'a str> {
    search
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl SearchParams {
    /// Extract the merge parameters of one search, validating `sort_by` eagerly.
    pub fn from_search(search: &Value) -> Result<SearchParams> {
        let sort = SortSpec::parse(str_param(search, "sort_by").unwrap_or(DEFAULT_SORT_BY))?;
        let page = int_param(search, "page")?
            .map(|page| page.max(1) as u64)
            .unwrap_or(DEFAULT_PAGE);
        let per_page_param = int_param(search, "per_page")?;
        let max_facet_values = int_param(search, "max_facet_values")?
            .map(|max| max.max(0) as usize)
            .unwrap_or(DEFAULT_MAX_FACET_VALUES);
        let group_limit = int_param(search, "group_limit")?
            .map(|limit| limit.max(1) as usize)
            .unwrap_or(DEFAULT_GROUP_LIMIT);

        Ok(SearchParams {
            sort,
            page,
            per_page: per_page_param.unwrap_or(DEFAULT_PER_PAGE),
            max_facet_values,
            grouped: str_param(search, "group_by").is_some(),
            group_limit,
            facet_only: matches!(per_page_param, Some(per_page) if per_page <= 0),
        })
    }

    /// Window `[start, end)` of the globally sorted hits that forms the requested page.
    pub fn page_window(&self) -> (usize, usize) {
        let per_page = self.per_page.max(0) as usize;
        let start = (self.page as usize - 1).saturating_mul(per_page);
        (start, start.saturating_add(per_page))
    }
}

/// A single search or a multi search, normalised to a list of searches.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiSearchRequest {
    /// Searches in request order.
    pub searches: Vec<Value>,
    /// Remaining top-level fields of a multi search; `None` for a bare single search.
    envelope: Option<Map<String, Value>>,
}

impl MultiSearchRequest {
    /// Wrap a request body. An object with a `searches` array is a multi search,
    /// any other object is a single search.
    pub fn from_value(value: &Value) -> Result<MultiSearchRequest> {
        let Value::Object(object) = value else {
            return Err(ProxyError::MalformedRequest(
                "search request must be a JSON object".to_string(),
            ));
        };

        match object.get("searches") {
            Some(Value::Array(searches)) => {
                let mut envelope = object.clone();
                envelope.remove("searches");
                Ok(MultiSearchRequest {
                    searches: searches.clone(),
                    envelope: Some(envelope),
                })
            }
            Some(_) => Err(ProxyError::MalformedRequest(
                "searches must be an array".to_string(),
            )),
            None => Ok(MultiSearchRequest {
                searches: vec![value.clone()],
                envelope: None,
            }),
        }
    }

    /// True when the request arrived wrapped in `searches`.
    pub fn is_multi(&self) -> bool {
        self.envelope.is_some()
    }

    /// Merge parameters of every search, in order.
    pub fn params(&self) -> Result<Vec<SearchParams>> {
        self.searches.iter().map(SearchParams::from_search).collect()
    }

    /// Restore the shape the request arrived in.
    pub fn to_value(&self) -> Value {
        match &self.envelope {
            Some(envelope) => {
                let mut object = envelope.clone();
                object.insert("searches".to_string(), Value::Array(self.searches.clone()));
                Value::Object(object)
            }
            None => self.searches.first().cloned().unwrap_or(Value::Null),
        }
    }
}

/// The request sent to one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestVariant {
    /// Partition the request is scoped to.
    pub partition: PartitionSpec,
    /// Request body in the shape the caller sent.
    pub request: Value,
}

/// Result of splitting a search over all partitions.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitRequest {
    /// One request per partition, in partition order.
    pub variants: Vec<RequestVariant>,
    /// Original parameters of each logical search, by search index.
    pub originals: Vec<SearchParams>,
    /// Caller sent a multi search.
    pub multi: bool,
}

fn scope_search(
    search: &Value,
    partition: &PartitionSpec,
    mode: &PartitionMode,
    params: &SearchParams,
) -> Result<Value> {
    let Value::Object(object) = search else {
        return Err(ProxyError::MalformedRequest(
            "every search must be a JSON object".to_string(),
        ));
    };
    let mut object = object.clone();

    match mode {
        PartitionMode::Filter => {
            let clause = format!(
                "{}:[{}..{}]",
                partition.partition_key, partition.range.start, partition.range.end
            );
            let filter = match object.get("filter_by").and_then(Value::as_str).map(str::trim) {
                Some(existing) if !existing.is_empty() => format!("({existing}) && {clause}"),
                _ => clause,
            };
            object.insert("filter_by".to_string(), Value::String(filter));
        }
        PartitionMode::Alias => {
            let Some(base) = object.get("collection").and_then(Value::as_str) else {
                return Err(ProxyError::MalformedRequest(
                    "collection is required to address partition aliases".to_string(),
                ));
            };
            let alias = PartitionLayout::collection_alias(base, partition.partition_index);
            object.insert("collection".to_string(), Value::String(alias));
        }
    }

    if !params.facet_only {
        object.insert("page".to_string(), Value::from(1));
        object.insert("per_page".to_string(), Value::from(OVERFETCH_PER_PAGE));
    }

    Ok(Value::Object(object))
}

/// Split a single or multi search into one request per partition.
///
/// With a single partition the request is passed through untouched.
pub fn split_request(request: &Value, layout: &PartitionLayout) -> Result<SplitRequest> {
    layout.validate()?;
    let multi_request = MultiSearchRequest::from_value(request)?;
    let originals = multi_request.params()?;
    let partitions = partition_specs(
        &layout.partition_key,
        layout.total_domain,
        layout.num_partitions,
    )?;

    if layout.num_partitions == 1 {
        return Ok(SplitRequest {
            variants: partitions
                .into_iter()
                .map(|partition| RequestVariant {
                    partition,
                    request: request.clone(),
                })
                .collect(),
            originals,
            multi: multi_request.is_multi(),
        });
    }

    let mut variants = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let mut scoped = multi_request.clone();
        scoped.searches = multi_request
            .searches
            .iter()
            .zip(originals.iter())
            .map(|(search, params)| scope_search(search, &partition, &layout.mode, params))
            .collect::<Result<Vec<_>>>()?;
        variants.push(RequestVariant {
            partition,
            request: scoped.to_value(),
        });
    }

    Ok(SplitRequest {
        variants,
        originals,
        multi: multi_request.is_multi(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layout(n: u64, mode: PartitionMode) -> PartitionLayout {
        PartitionLayout {
            partition_key: "partition".to_string(),
            total_domain: 100,
            num_partitions: n,
            mode,
        }
    }

    #[test]
    fn single_partition_is_identity() {
        let request = json!({"q": "*", "per_page": 7, "filter_by": "a:1"});
        let split = split_request(&request, &layout(1, PartitionMode::Filter)).unwrap();
        assert_eq!(split.variants.len(), 1);
        assert_eq!(split.variants[0].request, request);
        assert!(!split.multi);
    }

    #[test]
    fn filter_mode_appends_range() {
        let request = json!({"q": "*", "per_page": 99});
        let split = split_request(&request, &layout(2, PartitionMode::Filter)).unwrap();
        assert_eq!(split.variants[0].request["filter_by"], "partition:[0..49]");
        assert_eq!(split.variants[1].request["filter_by"], "partition:[50..99]");
        assert_eq!(split.variants[1].request["per_page"], OVERFETCH_PER_PAGE);
        assert_eq!(split.variants[1].request["page"], 1);
        assert_eq!(split.originals[0].per_page, 99);
    }

    #[test]
    fn filter_mode_combines_existing_filter() {
        let request = json!({"searches": [{"q": "*", "filter_by": "a:1 || b:2"}, {"q": "x", "filter_by": " "}]});
        let split = split_request(&request, &layout(4, PartitionMode::Filter)).unwrap();
        assert!(split.multi);
        let searches = split.variants[2].request["searches"].as_array().unwrap();
        assert_eq!(searches[0]["filter_by"], "(a:1 || b:2) && partition:[50..74]");
        assert_eq!(searches[1]["filter_by"], "partition:[50..74]");
    }

    #[test]
    fn alias_mode_rewrites_collection() {
        let request = json!({"searches": [{"collection": "books", "q": "*"}], "union": false});
        let split = split_request(&request, &layout(3, PartitionMode::Alias)).unwrap();
        let collections: Vec<&str> = split
            .variants
            .iter()
            .map(|v| v.request["searches"][0]["collection"].as_str().unwrap())
            .collect();
        assert_eq!(collections, vec!["books", "books-1", "books-2"]);
        assert_eq!(split.variants[1].request["union"], false);
        assert!(split.variants[1].request["searches"][0].get("filter_by").is_none());
    }

    #[test]
    fn alias_mode_requires_collection() {
        let request = json!({"q": "*"});
        assert!(matches!(
            split_request(&request, &layout(2, PartitionMode::Alias)),
            Err(ProxyError::MalformedRequest(_))
        ));
    }

    #[test]
    fn facet_only_keeps_pagination() {
        let request = json!({"q": "*", "per_page": 0, "facet_by": "genre"});
        let split = split_request(&request, &layout(2, PartitionMode::Filter)).unwrap();
        assert_eq!(split.variants[0].request["per_page"], 0);
        assert!(split.variants[0].request.get("page").is_none());
        assert!(split.originals[0].facet_only);
    }

    #[test]
    fn params_accept_strings_and_defaults() {
        let params = SearchParams::from_search(&json!({
            "page": "3", "per_page": "5", "group_by": "author", "sort_by": "year:desc"
        }))
        .unwrap();
        assert_eq!(params.page, 3);
        assert_eq!(params.per_page, 5);
        assert!(params.grouped);
        assert_eq!(params.page_window(), (10, 15));

        let defaults = SearchParams::from_search(&json!({"q": "*"})).unwrap();
        assert_eq!(defaults.page, 1);
        assert_eq!(defaults.per_page, 10);
        assert_eq!(defaults.max_facet_values, 10);
        assert_eq!(defaults.sort.to_string(), "_text_match:desc");
    }

    #[test]
    fn invalid_input_fails_before_dispatch() {
        let bad_sort = json!({"q": "*", "sort_by": "year:sideways"});
        assert!(split_request(&bad_sort, &layout(2, PartitionMode::Filter)).is_err());

        let mut bad_key = layout(2, PartitionMode::Filter);
        bad_key.partition_key = "part ition".to_string();
        assert!(matches!(
            split_request(&json!({"q": "*"}), &bad_key),
            Err(ProxyError::Config(_))
        ));

        let too_many = PartitionLayout {
            total_domain: 3,
            ..layout(4, PartitionMode::Filter)
        };
        assert!(matches!(
            split_request(&json!({"q": "*"}), &too_many),
            Err(ProxyError::InvalidPartitioning { .. })
        ));

        assert!(split_request(&json!([1, 2]), &layout(2, PartitionMode::Filter)).is_err());
        assert!(
            split_request(&json!({"q": "*", "page": "two"}), &layout(2, PartitionMode::Filter))
                .is_err()
        );
    }
}
