//! Re-merging of partial shard responses into the response of one logical search.
//!
//! Partial results are folded pairwise, left to right, with [`merge_results`]. The fold only
//! concatenates hit lists; sorting, facet truncation and pagination happen once afterwards in
//! [`adjust_result`], using the parameters of the original request.

use std::cmp::Ordering;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProxyError, Result};
use crate::request::{MultiSearchRequest, SearchParams};
use crate::sort::SortSpec;

/// Aggregated count of one facet value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetValueCount {
    /// Facet value.
    pub value: String,
    /// Number of matching documents carrying the value.
    pub count: u64,
    /// Value with highlight markup, when the engine sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlighted: Option<String>,
    /// Fields passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Facet statistics. Only `total_values` is reconciled across partitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FacetStats {
    /// Number of distinct values of the field.
    #[serde(default)]
    pub total_values: u64,
    /// Other statistics (`min`, `max`, `avg`, ...), taken from the left operand.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Facet counts of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetCount {
    /// Faceted field.
    pub field_name: String,
    /// Counts were computed on a sample of the hits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled: Option<bool>,
    /// Counts per value.
    #[serde(default)]
    pub counts: Vec<FacetValueCount>,
    /// Field statistics, when the engine sent them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FacetStats>,
    /// Fields passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FacetCount {
    /// Order counts by descending count, ties by ascending value.
    pub fn sort_counts(&mut self) {
        self.counts
            .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    }

    /// `total_values` of the stats, 0 when absent.
    pub fn total_values(&self) -> u64 {
        self.stats.as_ref().map_or(0, |stats| stats.total_values)
    }
}

/// Merge the counts of the same facet field from two partitions.
///
/// `total_values` of the merge is a lower bound: a value missing from both
/// partial top lists cannot be reconstructed.
pub fn merge_counts(a: &FacetCount, b: &FacetCount) -> Result<FacetCount> {
    if a.field_name != b.field_name {
        return Err(ProxyError::InconsistentPartitions(format!(
            "facet field '{}' merged with '{}'",
            a.field_name, b.field_name
        )));
    }

    let mut counts: IndexMap<&str, FacetValueCount> = IndexMap::new();
    for entry in a.counts.iter().chain(b.counts.iter()) {
        counts
            .entry(entry.value.as_str())
            .and_modify(|merged| merged.count += entry.count)
            .or_insert_with(|| entry.clone());
    }
    let counts: Vec<FacetValueCount> = counts.into_values().collect();

    let sampled = match (a.sampled, b.sampled) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
    };
    let stats = match (&a.stats, &b.stats) {
        (None, None) => None,
        (left, right) => Some(FacetStats {
            total_values: a.total_values().max(b.total_values()).max(counts.len() as u64),
            extra: left
                .as_ref()
                .or(right.as_ref())
                .map(|stats| stats.extra.clone())
                .unwrap_or_default(),
        }),
    };

    let mut merged = FacetCount {
        field_name: a.field_name.clone(),
        sampled,
        stats,
        counts,
        extra: a.extra.clone(),
    };
    merged.sort_counts();
    Ok(merged)
}

/// Union two facet lists by `field_name`, merging fields present on both sides.
pub fn merge_facet_counts(a: &[FacetCount], b: &[FacetCount]) -> Result<Vec<FacetCount>> {
    let mut merged: IndexMap<&str, FacetCount> = IndexMap::new();
    for facet in a.iter() {
        merged.insert(facet.field_name.as_str(), facet.clone());
    }
    for facet in b.iter() {
        let combined = match merged.get(facet.field_name.as_str()) {
            Some(existing) => merge_counts(existing, facet)?,
            None => facet.clone(),
        };
        merged.insert(facet.field_name.as_str(), combined);
    }
    Ok(merged.into_values().collect())
}

fn facets_of(result: &Value) -> Result<Vec<FacetCount>> {
    match result.get("facet_counts") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(facets) => serde_json::from_value(facets.clone()).map_err(|e| {
            ProxyError::InconsistentPartitions(format!("unreadable facet_counts: {e}"))
        }),
    }
}

fn u64_field(result: &Value, name: &str) -> u64 {
    result.get(name).and_then(Value::as_u64).unwrap_or(0)
}

fn has(a: &Value, b: &Value, name: &str) -> bool {
    a.get(name).is_some() || b.get(name).is_some()
}

fn array_field(result: &Value, name: &str) -> Vec<Value> {
    result
        .get(name)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn collection_name(result: &Value) -> Option<&str> {
    result
        .get("request_params")
        .and_then(|params| params.get("collection_name"))
        .and_then(Value::as_str)
}

/// Union grouped hits by `group_key`; groups found on both sides get their hits concatenated.
fn merge_groups(a: Vec<Value>, b: Vec<Value>) -> Vec<Value> {
    let mut groups: IndexMap<String, Value> = IndexMap::new();
    for group in a.into_iter().chain(b) {
        let key = group
            .get("group_key")
            .map(Value::to_string)
            .unwrap_or_else(|| format!("#{}", groups.len()));
        match groups.get_mut(&key) {
            Some(existing) => {
                let mut hits = array_field(existing, "hits");
                hits.extend(array_field(&group, "hits"));
                let found = u64_field(existing, "found") + u64_field(&group, "found");
                if let Value::Object(object) = existing {
                    object.insert("hits".to_string(), Value::Array(hits));
                    if object.contains_key("found") || group.get("found").is_some() {
                        object.insert("found".to_string(), Value::from(found));
                    }
                }
            }
            None => {
                groups.insert(key, group);
            }
        }
    }
    groups.into_values().collect()
}

/// Merge two partial results of the same logical search.
///
/// A side carrying an `error` wins verbatim, the left one first. Hit lists are
/// concatenated unsorted; `grouped` selects `grouped_hits` over `hits`.
pub fn merge_results(a: &Value, b: &Value, grouped: bool) -> Result<Value> {
    if a.get("error").is_some() {
        return Ok(a.clone());
    }
    if b.get("error").is_some() {
        return Ok(b.clone());
    }
    let Value::Object(mut merged) = a.clone() else {
        return Err(ProxyError::InconsistentPartitions(
            "partial result is not a JSON object".to_string(),
        ));
    };

    for counter in ["found", "found_docs"] {
        if has(a, b, counter) {
            merged.insert(
                counter.to_string(),
                Value::from(u64_field(a, counter) + u64_field(b, counter)),
            );
        }
    }

    if has(a, b, "out_of") {
        let same_collection = collection_name(a).is_some() && collection_name(a) == collection_name(b);
        let out_of = if same_collection {
            u64_field(a, "out_of")
        } else {
            u64_field(a, "out_of") + u64_field(b, "out_of")
        };
        merged.insert("out_of".to_string(), Value::from(out_of));
    }

    if has(a, b, "search_cutoff") {
        let cutoff = [a, b]
            .iter()
            .any(|r| r.get("search_cutoff").and_then(Value::as_bool).unwrap_or(false));
        merged.insert("search_cutoff".to_string(), Value::Bool(cutoff));
    }

    if has(a, b, "search_time_ms") {
        let time = u64_field(a, "search_time_ms").max(u64_field(b, "search_time_ms"));
        merged.insert("search_time_ms".to_string(), Value::from(time));
    }

    if has(a, b, "facet_counts") {
        let facets = merge_facet_counts(&facets_of(a)?, &facets_of(b)?)?;
        merged.insert("facet_counts".to_string(), serde_json::to_value(facets)?);
    }

    if grouped {
        if has(a, b, "grouped_hits") {
            let groups = merge_groups(array_field(a, "grouped_hits"), array_field(b, "grouped_hits"));
            merged.insert("grouped_hits".to_string(), Value::Array(groups));
        }
    } else if has(a, b, "hits") {
        let mut hits = array_field(a, "hits");
        hits.extend(array_field(b, "hits"));
        merged.insert("hits".to_string(), Value::Array(hits));
    }

    Ok(Value::Object(merged))
}

static NO_HIT: Value = Value::Null;

fn first_hit(group: &Value) -> &Value {
    group
        .get("hits")
        .and_then(|hits| hits.get(0))
        .unwrap_or(&NO_HIT)
}

fn page_of(mut items: Vec<Value>, params: &SearchParams) -> Vec<Value> {
    let (start, end) = params.page_window();
    if start >= items.len() {
        return Vec::new();
    }
    items.truncate(end.min(items.len()));
    items.split_off(start)
}

fn compare_groups(sort: &SortSpec, a: &Value, b: &Value) -> Ordering {
    sort.compare(first_hit(a), first_hit(b))
}

/// Finalise a fully merged result with the original search parameters:
/// sort and truncate facet counts, globally sort hits and cut the requested page.
pub fn adjust_result(result: Value, params: &SearchParams) -> Result<Value> {
    if result.get("error").is_some() {
        return Ok(result);
    }
    let mut object = match result {
        Value::Object(object) => object,
        other => return Ok(other),
    };

    if let Some(facets) = object.get("facet_counts") {
        let mut facets: Vec<FacetCount> = serde_json::from_value(facets.clone()).map_err(|e| {
            ProxyError::InconsistentPartitions(format!("unreadable facet_counts: {e}"))
        })?;
        for facet in facets.iter_mut() {
            facet.sort_counts();
            facet.counts.truncate(params.max_facet_values);
        }
        object.insert("facet_counts".to_string(), serde_json::to_value(facets)?);
    }

    if let Some(Value::Array(hits)) = object.get_mut("hits") {
        hits.sort_by(|a, b| params.sort.compare(a, b));
        *hits = page_of(std::mem::take(hits), params);
    }

    if let Some(Value::Array(groups)) = object.get_mut("grouped_hits") {
        for group in groups.iter_mut() {
            if let Some(Value::Array(hits)) = group.get_mut("hits") {
                hits.sort_by(|a, b| params.sort.compare(a, b));
                hits.truncate(params.group_limit);
            }
        }
        groups.sort_by(|a, b| compare_groups(&params.sort, a, b));
        *groups = page_of(std::mem::take(groups), params);
    }

    if object.contains_key("page") {
        object.insert("page".to_string(), Value::from(params.page));
    }

    Ok(Value::Object(object))
}

fn results_of(partial: &Value) -> Vec<Value> {
    match partial.get("results") {
        Some(Value::Array(results)) => results.clone(),
        _ => vec![partial.clone()],
    }
}

/// Merge the N raw shard responses of one split request.
///
/// `originals` holds the parameters of each logical search in request order and
/// `multi` whether the caller sent a multi search. A single response is returned untouched.
pub fn merge_responses(originals: &[SearchParams], multi: bool, partials: &[Value]) -> Result<Value> {
    let Some(first) = partials.first() else {
        return Err(ProxyError::InconsistentPartitions(
            "no partial results to merge".to_string(),
        ));
    };
    if partials.len() == 1 {
        return Ok(first.clone());
    }
    if let Some(failed) = partials.iter().find(|partial| partial.get("error").is_some()) {
        return Ok(failed.clone());
    }

    let per_shard: Vec<Vec<Value>> = partials.iter().map(results_of).collect();
    let search_count = per_shard[0].len();
    if per_shard.iter().any(|results| results.len() != search_count) {
        return Err(ProxyError::InconsistentPartitions(
            "partitions returned different numbers of results".to_string(),
        ));
    }

    let default_params = SearchParams::default();
    let mut merged_results = Vec::with_capacity(search_count);
    for index in 0..search_count {
        let params = originals.get(index).unwrap_or(&default_params);
        let mut merged = per_shard[0][index].clone();
        for results in per_shard.iter().skip(1) {
            merged = merge_results(&merged, &results[index], params.grouped)?;
        }
        merged_results.push(adjust_result(merged, params)?);
    }

    if !multi && merged_results.len() == 1 {
        return Ok(merged_results.remove(0));
    }

    let mut envelope = match first {
        Value::Object(object) if object.contains_key("results") => object.clone(),
        _ => Map::new(),
    };
    envelope.insert("results".to_string(), Value::Array(merged_results));
    Ok(Value::Object(envelope))
}

/// Merge raw shard responses for `original_request`, the request as the caller sent it.
pub fn merge(original_request: &Value, partials: &[Value]) -> Result<Value> {
    let request = MultiSearchRequest::from_value(original_request)?;
    merge_responses(&request.params()?, request.is_multi(), partials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn facet(field: &str, counts: &[(&str, u64)], total: u64) -> FacetCount {
        serde_json::from_value(json!({
            "field_name": field,
            "sampled": false,
            "counts": counts.iter().map(|(v, c)| json!({"value": v, "count": c, "highlighted": v})).collect::<Vec<_>>(),
            "stats": {"total_values": total}
        }))
        .unwrap()
    }

    fn pairs(facet: &FacetCount) -> Vec<(String, u64)> {
        facet
            .counts
            .iter()
            .map(|c| (c.value.clone(), c.count))
            .collect()
    }

    #[test]
    fn merge_counts_sums_and_sorts() {
        let a = facet("genre", &[("rock", 5), ("jazz", 2)], 2);
        let b = facet("genre", &[("jazz", 3), ("blues", 5), ("pop", 1)], 7);
        let merged = merge_counts(&a, &b).unwrap();
        assert_eq!(
            pairs(&merged),
            vec![
                ("blues".to_string(), 5),
                ("jazz".to_string(), 5),
                ("rock".to_string(), 5),
                ("pop".to_string(), 1)
            ]
        );
        assert_eq!(merged.total_values(), 7);

        let reversed = merge_counts(&b, &a).unwrap();
        assert_eq!(pairs(&merged), pairs(&reversed));
    }

    #[test]
    fn merge_counts_total_is_lower_bound() {
        let a = facet("tag", &[("a", 1), ("b", 1)], 1);
        let b = facet("tag", &[("c", 1)], 1);
        assert_eq!(merge_counts(&a, &b).unwrap().total_values(), 3);
    }

    #[test]
    fn merged_facets_keep_engine_shape() {
        let a: FacetCount = serde_json::from_value(json!({
            "field_name": "genre", "counts": [{"value": "rock", "count": 1}]
        }))
        .unwrap();
        let b: FacetCount = serde_json::from_value(json!({
            "field_name": "genre", "counts": [{"value": "rock", "count": 2}]
        }))
        .unwrap();
        let merged = serde_json::to_value(merge_counts(&a, &b).unwrap()).unwrap();
        assert_eq!(
            merged,
            json!({"field_name": "genre", "counts": [{"value": "rock", "count": 3}]})
        );

        let with_stats = facet("genre", &[("rock", 1)], 4);
        let merged = serde_json::to_value(merge_counts(&with_stats, &a).unwrap()).unwrap();
        assert_eq!(merged["stats"], json!({"total_values": 4}));
        assert_eq!(merged["sampled"], false);
        assert_eq!(merged["counts"][0]["highlighted"], "rock");
    }

    #[test]
    fn merge_counts_rejects_different_fields() {
        let a = facet("genre", &[], 0);
        let b = facet("year", &[], 0);
        assert!(matches!(
            merge_counts(&a, &b),
            Err(ProxyError::InconsistentPartitions(_))
        ));
    }

    #[test]
    fn merge_facet_counts_passes_one_sided_fields() {
        let a = vec![facet("genre", &[("rock", 1)], 1)];
        let b = vec![facet("year", &[("1999", 4)], 1), facet("genre", &[("rock", 2)], 1)];
        let merged = merge_facet_counts(&a, &b).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].field_name, "genre");
        assert_eq!(merged[0].counts[0].count, 3);
        assert_eq!(merged[1].field_name, "year");
    }

    #[test]
    fn merge_results_counters() {
        let a = json!({"found": 3, "out_of": 10, "search_time_ms": 4, "search_cutoff": false, "page": 1,
                       "request_params": {"collection_name": "books-0"}, "hits": [{"id": 1}]});
        let b = json!({"found": 2, "out_of": 7, "search_time_ms": 9, "search_cutoff": true, "page": 1,
                       "request_params": {"collection_name": "books-1"}, "hits": [{"id": 2}]});
        let merged = merge_results(&a, &b, false).unwrap();
        assert_eq!(merged["found"], 5);
        assert_eq!(merged["out_of"], 17);
        assert_eq!(merged["search_time_ms"], 9);
        assert_eq!(merged["search_cutoff"], true);
        assert_eq!(merged["request_params"]["collection_name"], "books-0");
        assert_eq!(merged["hits"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn merge_results_same_collection_out_of() {
        let a = json!({"found": 1, "out_of": 100, "request_params": {"collection_name": "books"}});
        let b = json!({"found": 1, "out_of": 100, "request_params": {"collection_name": "books"}});
        assert_eq!(merge_results(&a, &b, false).unwrap()["out_of"], 100);
    }

    #[test]
    fn merge_results_error_short_circuit() {
        let error = json!({"error": "Could not find a field named `x` in the schema.", "code": 404});
        let ok = json!({"found": 1, "hits": []});
        assert_eq!(merge_results(&error, &ok, false).unwrap(), error);
        assert_eq!(merge_results(&ok, &error, false).unwrap(), error);
    }

    #[test]
    fn merge_results_groups_by_key() {
        let a = json!({"found": 2, "found_docs": 3, "grouped_hits": [
            {"group_key": ["x"], "found": 2, "hits": [{"document": {"r": 1}}]},
            {"group_key": ["y"], "found": 1, "hits": [{"document": {"r": 2}}]}]});
        let b = json!({"found": 1, "found_docs": 4, "grouped_hits": [
            {"group_key": ["x"], "found": 4, "hits": [{"document": {"r": 0}}]}]});
        let merged = merge_results(&a, &b, true).unwrap();
        let groups = merged["grouped_hits"].as_array().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0]["found"], 6);
        assert_eq!(groups[0]["hits"].as_array().unwrap().len(), 2);
        assert_eq!(merged["found_docs"], 7);
        assert!(merged.get("hits").is_none());
    }

    #[test]
    fn adjust_sorts_truncates_and_paginates() {
        let params = SearchParams::from_search(&json!({
            "sort_by": "rank:asc", "page": 2, "per_page": 2, "max_facet_values": 1
        }))
        .unwrap();
        let result = json!({
            "page": 1,
            "facet_counts": [{"field_name": "g", "sampled": false, "stats": {"total_values": 2},
                "counts": [{"value": "b", "count": 1, "highlighted": "b"}, {"value": "a", "count": 3, "highlighted": "a"}]}],
            "hits": ([5, 1, 4, 2, 3].iter().map(|r| json!({"document": {"rank": r}})).collect::<Vec<_>>())
        });
        let adjusted = adjust_result(result, &params).unwrap();
        let ranks: Vec<i64> = adjusted["hits"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["document"]["rank"].as_i64().unwrap())
            .collect();
        assert_eq!(ranks, vec![3, 4]);
        assert_eq!(adjusted["page"], 2);
        let counts = adjusted["facet_counts"][0]["counts"].as_array().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0]["value"], "a");
    }

    #[test]
    fn adjust_sorts_groups_by_first_hit() {
        let params =
            SearchParams::from_search(&json!({"sort_by": "rank:desc", "group_by": "g", "group_limit": 1}))
                .unwrap();
        let result = json!({"grouped_hits": [
            {"group_key": ["a"], "hits": [{"document": {"rank": 1}}, {"document": {"rank": 7}}]},
            {"group_key": ["b"], "hits": [{"document": {"rank": 5}}]}]});
        let adjusted = adjust_result(result, &params).unwrap();
        let groups = adjusted["grouped_hits"].as_array().unwrap();
        assert_eq!(groups[0]["group_key"][0], "a");
        assert_eq!(groups[0]["hits"].as_array().unwrap().len(), 1);
        assert_eq!(groups[0]["hits"][0]["document"]["rank"], 7);
    }

    #[test]
    fn page_beyond_results_is_empty() {
        let params = SearchParams::from_search(&json!({"page": 5, "per_page": 10})).unwrap();
        let adjusted = adjust_result(json!({"hits": [{"text_match": 1}]}), &params).unwrap();
        assert!(adjusted["hits"].as_array().unwrap().is_empty());
    }

    #[test]
    fn single_response_is_identity() {
        let request = json!({"q": "*", "per_page": 1});
        let response = json!({"found": 2, "hits": [{"a": 1}, {"a": 2}], "page": 1});
        assert_eq!(merge(&request, std::slice::from_ref(&response)).unwrap(), response);
    }

    #[test]
    fn merge_unwraps_single_search() {
        let request = json!({"q": "*", "per_page": 1, "sort_by": "n:asc"});
        let a = json!({"found": 1, "page": 1, "hits": [{"document": {"n": 2}}]});
        let b = json!({"found": 1, "page": 1, "hits": [{"document": {"n": 1}}]});
        let merged = merge(&request, &[a, b]).unwrap();
        assert_eq!(merged["found"], 2);
        assert_eq!(merged["hits"].as_array().unwrap().len(), 1);
        assert_eq!(merged["hits"][0]["document"]["n"], 1);
    }

    #[test]
    fn merge_rejects_uneven_results() {
        let request = json!({"searches": [{"q": "*"}]});
        let a = json!({"results": [{"found": 1}]});
        let b = json!({"results": []});
        assert!(merge(&request, &[a, b]).is_err());
        assert!(merge(&request, &[]).is_err());
    }
}
