use std::cmp::Ordering;

use itertools::Itertools;
use serde_json::Value;

use crate::error::{ProxyError, Result};

/// Pseudo field that sorts by the engine's relevance score.
pub const TEXT_MATCH_FIELD: &str = "_text_match";

/// Sort order applied when a search carries no `sort_by`.
pub const DEFAULT_SORT_BY: &str = "_text_match:desc";

/// Sort direction of one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// One `field:direction` pair of a `sort_by` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Dotted document path, or `_text_match`.
    pub field: String,
    /// Order of the key.
    pub direction: SortDirection,
}

/// Parsed `sort_by` expression, evaluated left to right as a tie-break chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortSpec {
    /// Keys in tie-break order.
    pub keys: Vec<SortKey>,
}

/// Split on commas that are not nested inside parentheses,
/// so `_eval(a:1,b:2):desc` stays one sort key.
fn split_top_level(spec: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (pos, c) in spec.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&spec[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    parts.push(&spec[start..]);
    parts
}

impl SortSpec {
    /// Parse a comma separated list of `field:direction` pairs.
    /// The direction is case-insensitive and must be `asc` or `desc`.
    pub fn parse(spec: &str) -> Result<SortSpec> {
        let mut keys = Vec::new();
        for part in split_top_level(spec) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((field, direction)) = part.rsplit_once(':') else {
                return Err(ProxyError::MalformedRequest(format!(
                    "sort_by entry '{part}' has no direction"
                )));
            };
            let direction = match direction.trim().to_lowercase().as_str() {
                "asc" => SortDirection::Asc,
                "desc" => SortDirection::Desc,
                other => {
                    return Err(ProxyError::MalformedRequest(format!(
                        "sort_by direction '{other}' is neither asc nor desc"
                    )));
                }
            };
            keys.push(SortKey {
                field: field.trim().to_string(),
                direction,
            });
        }
        Ok(SortSpec { keys })
    }

    /// Compare two hits along the sort chain. Equal hits yield `Ordering::Equal`,
    /// so a stable sort keeps their relative order.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for key in self.keys.iter() {
            let ordering = compare_values(sort_value(a, &key.field), sort_value(b, &key.field));
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl std::fmt::Display for SortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let spec = self
            .keys
            .iter()
            .map(|key| {
                let direction = match key.direction {
                    SortDirection::Asc => "asc",
                    SortDirection::Desc => "desc",
                };
                format!("{}:{}", key.field, direction)
            })
            .join(",");
        f.write_str(&spec)
    }
}

/// Build a comparator for a `sort_by` expression.
pub fn create_sort_function(spec: &str) -> Result<impl Fn(&Value, &Value) -> Ordering> {
    let spec = SortSpec::parse(spec)?;
    Ok(move |a: &Value, b: &Value| spec.compare(a, b))
}

/// Dotted path lookup (`author.name`) into a JSON tree.
/// A missing key or a non-object on the way yields `None`, never a panic.
pub fn get_nested_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

fn sort_value<'a>(hit: &'a Value, field: &str) -> Option<&'a Value> {
    if field == TEXT_MATCH_FIELD {
        hit.get("text_match")
    } else {
        hit.get("document")
            .and_then(|document| get_nested_value(document, field))
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Missing and null values order before every present value.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => match (numeric(x), numeric(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => x.to_string().cmp(&y.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(hits: &[Value]) -> Vec<&str> {
        hits.iter()
            .map(|hit| hit["document"]["name"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn sort_by_name() {
        let mut hits = vec![
            json!({"document": {"name": "Charlie"}}),
            json!({"document": {"name": "Alice"}}),
            json!({"document": {"name": "Bob"}}),
        ];

        let asc = create_sort_function("name:asc").unwrap();
        hits.sort_by(&asc);
        assert_eq!(names(&hits), vec!["Alice", "Bob", "Charlie"]);

        let desc = create_sort_function("name:DESC").unwrap();
        hits.sort_by(&desc);
        assert_eq!(names(&hits), vec!["Charlie", "Bob", "Alice"]);
    }

    #[test]
    fn multi_key_tie_break() {
        let mut hits = vec![
            json!({"document": {"group": "A", "rank": 3}}),
            json!({"document": {"group": "B", "rank": 1}}),
            json!({"document": {"group": "A", "rank": 1}}),
            json!({"document": {"group": "B", "rank": 2}}),
        ];
        hits.sort_by(create_sort_function("group:asc,rank:asc").unwrap());
        let order: Vec<(&str, i64)> = hits
            .iter()
            .map(|h| {
                (
                    h["document"]["group"].as_str().unwrap(),
                    h["document"]["rank"].as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(order, vec![("A", 1), ("A", 3), ("B", 1), ("B", 2)]);
    }

    #[test]
    fn text_match_and_nested_fields() {
        let mut hits = vec![
            json!({"text_match": 10, "document": {"meta": {"year": 2001}}}),
            json!({"text_match": 30, "document": {"meta": {"year": 1999}}}),
            json!({"text_match": 30, "document": {"meta": {"year": 2005}}}),
        ];
        hits.sort_by(create_sort_function("_text_match:desc,meta.year:asc").unwrap());
        let years: Vec<i64> = hits
            .iter()
            .map(|h| h["document"]["meta"]["year"].as_i64().unwrap())
            .collect();
        assert_eq!(years, vec![1999, 2005, 2001]);
    }

    #[test]
    fn missing_values_are_tolerated_and_stable() {
        let mut hits = vec![
            json!({"id": 1, "document": {"price": 5}}),
            json!({"id": 2, "document": {}}),
            json!({"id": 3}),
            json!({"id": 4, "document": {"price": 1.5}}),
        ];
        hits.sort_by(create_sort_function("price:asc").unwrap());
        let ids: Vec<i64> = hits.iter().map(|h| h["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 3, 4, 1]);
    }

    #[test]
    fn nested_lookup() {
        let doc = json!({"a": {"b": {"c": 7}}, "s": "x"});
        assert_eq!(get_nested_value(&doc, "a.b.c"), Some(&json!(7)));
        assert_eq!(get_nested_value(&doc, "a.x.c"), None);
        assert_eq!(get_nested_value(&doc, "s.deeper"), None);
    }

    #[test]
    fn parse_keeps_parenthesised_expressions() {
        let spec = SortSpec::parse("_eval([(a:1),(b:2)]):desc, rank:asc").unwrap();
        assert_eq!(spec.keys.len(), 2);
        assert_eq!(spec.keys[0].field, "_eval([(a:1),(b:2)])");
        assert_eq!(spec.keys[1].direction, SortDirection::Asc);
        assert_eq!(spec.to_string(), "_eval([(a:1),(b:2)]):desc,rank:asc");
    }

    #[test]
    fn parse_rejects_bad_direction() {
        assert!(SortSpec::parse("name:up").is_err());
        assert!(SortSpec::parse("name").is_err());
        assert!(SortSpec::parse("").unwrap().keys.is_empty());
    }
}
