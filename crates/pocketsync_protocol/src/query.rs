//! Live query definitions and filter evaluation.
//!
//! A query names a collection plus an optional filter tree, sort clauses,
//! and a result limit. Filter evaluation is pure and bounded by document
//! size, which lets the delta computer call it on the hot path without
//! suspending.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A live query attached to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Collection the query runs against.
    pub collection: String,
    /// Optional filter tree; absent means "match everything".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterNode>,
    /// Optional sort clauses, applied in order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortClause>>,
    /// Optional result cap. The server never evicts on insert at
    /// capacity; clients re-apply sort+limit locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    /// Creates an unfiltered query over a collection.
    pub fn all(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
            sort: None,
            limit: None,
        }
    }

    /// Returns true if `doc` satisfies this query's filter.
    pub fn matches(&self, doc: &Value) -> bool {
        match &self.filter {
            Some(filter) => evaluate(doc, filter),
            None => true,
        }
    }
}

/// A node in a filter tree: either a boolean group or a leaf condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    /// `and`/`or` over child nodes.
    Group(FilterGroup),
    /// A single field comparison.
    Condition(FilterCondition),
}

/// A boolean combination of filter nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    /// `"and"` or `"or"`.
    pub logic: String,
    /// Child nodes.
    pub conditions: Vec<FilterNode>,
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Dotted path into the document.
    pub field: String,
    /// One of `eq ne gt gte lt lte in nin contains startsWith endsWith exists`.
    pub operator: String,
    /// Comparison operand.
    pub value: Value,
}

/// A sort clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortClause {
    /// Dotted path into the document.
    pub field: String,
    /// `"asc"` or `"desc"`.
    pub direction: String,
}

/// Resolves a dotted field path from a JSON document.
pub fn get_field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Extracts the document id from the `_id` field.
pub fn document_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

fn evaluate(doc: &Value, filter: &FilterNode) -> bool {
    match filter {
        FilterNode::Group(group) => {
            if group.logic == "and" {
                group.conditions.iter().all(|node| evaluate(doc, node))
            } else {
                group.conditions.iter().any(|node| evaluate(doc, node))
            }
        }
        FilterNode::Condition(cond) => evaluate_condition(doc, cond),
    }
}

fn evaluate_condition(doc: &Value, cond: &FilterCondition) -> bool {
    let field_value = get_field(doc, &cond.field);

    match cond.operator.as_str() {
        "eq" => field_value == Some(&cond.value),
        "ne" => field_value != Some(&cond.value),
        "gt" => compare_values(field_value, &cond.value) == Some(Ordering::Greater),
        "gte" => matches!(
            compare_values(field_value, &cond.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "lt" => compare_values(field_value, &cond.value) == Some(Ordering::Less),
        "lte" => matches!(
            compare_values(field_value, &cond.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "in" => match (field_value, &cond.value) {
            (Some(fv), Value::Array(options)) => options.contains(fv),
            _ => false,
        },
        "nin" => match (field_value, &cond.value) {
            (Some(fv), Value::Array(options)) => !options.contains(fv),
            _ => true,
        },
        "contains" => match (field_value, &cond.value) {
            (Some(Value::String(fv)), Value::String(target)) => fv.contains(target.as_str()),
            _ => false,
        },
        "startsWith" => match (field_value, &cond.value) {
            (Some(Value::String(fv)), Value::String(target)) => fv.starts_with(target.as_str()),
            _ => false,
        },
        "endsWith" => match (field_value, &cond.value) {
            (Some(Value::String(fv)), Value::String(target)) => fv.ends_with(target.as_str()),
            _ => false,
        },
        "exists" => {
            let exists = field_value.is_some();
            if cond.value == Value::Bool(true) {
                exists
            } else {
                !exists
            }
        }
        _ => false,
    }
}

fn compare_values(a: Option<&Value>, b: &Value) -> Option<Ordering> {
    let a = a?;
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            let af = a.as_f64()?;
            let bf = b.as_f64()?;
            af.partial_cmp(&bf)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Orders two documents by a list of sort clauses.
///
/// Missing fields sort first; mismatched types compare equal.
pub fn compare_documents(a: &Value, b: &Value, clauses: &[SortClause]) -> Ordering {
    for clause in clauses {
        let av = get_field(a, &clause.field);
        let bv = get_field(b, &clause.field);
        let ordering = compare_sort_values(av, bv);

        let ordering = if clause.direction == "desc" {
            ordering.reverse()
        } else {
            ordering
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_sort_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                let af = a.as_f64().unwrap_or(0.0);
                let bf = b.as_f64().unwrap_or(0.0);
                af.partial_cmp(&bf).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, operator: &str, value: Value) -> FilterNode {
        FilterNode::Condition(FilterCondition {
            field: field.into(),
            operator: operator.into(),
            value,
        })
    }

    #[test]
    fn unfiltered_query_matches_everything() {
        let query = Query::all("todos");
        assert!(query.matches(&json!({"anything": true})));
    }

    #[test]
    fn eq_and_ne() {
        let doc = json!({"name": "Alice"});
        let mut query = Query::all("users");
        query.filter = Some(cond("name", "eq", json!("Alice")));
        assert!(query.matches(&doc));
        query.filter = Some(cond("name", "ne", json!("Alice")));
        assert!(!query.matches(&doc));
    }

    #[test]
    fn numeric_comparisons() {
        let doc = json!({"age": 30});
        for (operator, value, expected) in [
            ("gt", 25, true),
            ("gt", 30, false),
            ("gte", 30, true),
            ("lt", 31, true),
            ("lte", 29, false),
        ] {
            let mut query = Query::all("users");
            query.filter = Some(cond("age", operator, json!(value)));
            assert_eq!(query.matches(&doc), expected, "operator {operator}");
        }
    }

    #[test]
    fn string_operators() {
        let doc = json!({"name": "Charlie"});
        let mut query = Query::all("users");
        query.filter = Some(cond("name", "contains", json!("harl")));
        assert!(query.matches(&doc));
        query.filter = Some(cond("name", "startsWith", json!("Ch")));
        assert!(query.matches(&doc));
        query.filter = Some(cond("name", "endsWith", json!("lie")));
        assert!(query.matches(&doc));
    }

    #[test]
    fn in_and_nin() {
        let doc = json!({"status": "open"});
        let mut query = Query::all("issues");
        query.filter = Some(cond("status", "in", json!(["open", "triaged"])));
        assert!(query.matches(&doc));
        query.filter = Some(cond("status", "nin", json!(["closed"])));
        assert!(query.matches(&doc));
    }

    #[test]
    fn exists_operator() {
        let doc = json!({"assignee": "bob"});
        let mut query = Query::all("issues");
        query.filter = Some(cond("assignee", "exists", json!(true)));
        assert!(query.matches(&doc));
        query.filter = Some(cond("closedAt", "exists", json!(false)));
        assert!(query.matches(&doc));
    }

    #[test]
    fn nested_group() {
        let filter = FilterNode::Group(FilterGroup {
            logic: "or".into(),
            conditions: vec![
                cond("priority", "eq", json!("high")),
                FilterNode::Group(FilterGroup {
                    logic: "and".into(),
                    conditions: vec![
                        cond("priority", "eq", json!("medium")),
                        cond("age", "gt", json!(7)),
                    ],
                }),
            ],
        });
        let mut query = Query::all("issues");
        query.filter = Some(filter);

        assert!(query.matches(&json!({"priority": "high", "age": 1})));
        assert!(query.matches(&json!({"priority": "medium", "age": 10})));
        assert!(!query.matches(&json!({"priority": "medium", "age": 3})));
    }

    #[test]
    fn dotted_field_paths() {
        let doc = json!({"meta": {"owner": {"id": "u1"}}});
        assert_eq!(get_field(&doc, "meta.owner.id"), Some(&json!("u1")));
        assert_eq!(get_field(&doc, "meta.missing"), None);
    }

    #[test]
    fn document_id_extraction() {
        assert_eq!(document_id(&json!({"_id": "d1"})), Some("d1"));
        assert_eq!(document_id(&json!({"id": "d1"})), None);
    }

    #[test]
    fn sort_ordering() {
        let clauses = vec![SortClause {
            field: "rank".into(),
            direction: "desc".into(),
        }];
        let a = json!({"rank": 1});
        let b = json!({"rank": 2});
        assert_eq!(compare_documents(&a, &b, &clauses), Ordering::Greater);
        assert_eq!(compare_documents(&b, &a, &clauses), Ordering::Less);
    }

    #[test]
    fn filter_json_roundtrip() {
        let filter = FilterNode::Group(FilterGroup {
            logic: "and".into(),
            conditions: vec![cond("done", "eq", json!(false))],
        });
        let encoded = serde_json::to_string(&filter).unwrap();
        let decoded: FilterNode = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, filter);
    }
}
