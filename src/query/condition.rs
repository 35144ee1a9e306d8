//! Boolean filter tree: JSON parsing, row evaluation and extraction of the
//! equality predicates the planner can turn into index probes.

use std::collections::BTreeMap;

use ahash::AHashMap;
use serde_json::Value;

use crate::{CidxError, Result};

/// Leaf comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    IsNull,
    IsNotNull,
    /// Accepted by the parser but matches nothing; kept for wire
    /// compatibility with clients that send it.
    In,
}

impl FilterOp {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "=" => Self::Eq,
            "!=" => Self::Neq,
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::Gte,
            "<=" => Self::Lte,
            "LIKE" => Self::Like,
            "IS NULL" => Self::IsNull,
            "IS NOT NULL" => Self::IsNotNull,
            "IN" => Self::In,
            _ => return None,
        })
    }
}

/// A node in the filter tree.
#[derive(Debug, Clone)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Leaf {
        op: FilterOp,
        column: String,
        /// Target value, stringified once at parse time.
        value: String,
    },
}

impl Condition {
    /// Parse a `where` clause. Accepts either a plain `{"col": "value"}`
    /// equality map (implicit AND) or the tagged tree form with
    /// `operator` / `column` / `value` / `children`. Returns `None` for an
    /// empty clause.
    pub fn parse(data: &Value) -> Result<Option<Condition>> {
        match data {
            Value::Null => Ok(None),
            Value::Array(items) if items.is_empty() => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            Value::Object(map) if !map.contains_key("operator") => {
                let children = map
                    .iter()
                    .map(|(col, val)| Condition::Leaf {
                        op: FilterOp::Eq,
                        column: col.to_lowercase(),
                        value: stringify(val),
                    })
                    .collect();
                Ok(Some(Condition::And(children)))
            }
            Value::Object(_) => Ok(Some(Self::parse_node(data)?)),
            _ => Err(CidxError::BadRequest("invalid where format".into())),
        }
    }

    /// Convenience for raw JSON text.
    pub fn parse_str(data: &str) -> Result<Option<Condition>> {
        if data.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(data)
            .map_err(|e| CidxError::BadRequest(format!("where JSON: {e}")))?;
        Self::parse(&value)
    }

    fn parse_node(data: &Value) -> Result<Condition> {
        let op = data
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| CidxError::BadRequest("condition node missing operator".into()))?;

        match op {
            "AND" | "OR" => {
                let children = data
                    .get("children")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().map(Self::parse_node).collect::<Result<Vec<_>>>())
                    .transpose()?
                    .unwrap_or_default();
                if op == "AND" {
                    Ok(Condition::And(children))
                } else {
                    Ok(Condition::Or(children))
                }
            }
            _ => {
                let filter_op = FilterOp::parse(op)
                    .ok_or_else(|| CidxError::BadRequest(format!("unknown operator: {op}")))?;
                let column = data
                    .get("column")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_lowercase();
                let value = data.get("value").map(stringify).unwrap_or_default();
                Ok(Condition::Leaf {
                    op: filter_op,
                    column,
                    value,
                })
            }
        }
    }

    /// Evaluate against a row of lowercased column → string value.
    pub fn evaluate(&self, row: &AHashMap<String, String>) -> bool {
        match self {
            Condition::And(children) => children.iter().all(|c| c.evaluate(row)),
            Condition::Or(children) => children.iter().any(|c| c.evaluate(row)),
            Condition::Leaf { op, column, value } => {
                let cell = row.get(column);
                match op {
                    FilterOp::IsNull => is_null(cell),
                    FilterOp::IsNotNull => !is_null(cell),
                    _ => {
                        let Some(cell) = cell else { return false };
                        match op {
                            FilterOp::Eq => cell == value,
                            FilterOp::Neq => cell != value,
                            // lexicographic string comparison, numeric
                            // columns included ("10" < "9")
                            FilterOp::Gt => cell.as_str() > value.as_str(),
                            FilterOp::Lt => cell.as_str() < value.as_str(),
                            FilterOp::Gte => cell.as_str() >= value.as_str(),
                            FilterOp::Lte => cell.as_str() <= value.as_str(),
                            FilterOp::Like => {
                                cell.to_lowercase().contains(&value.to_lowercase())
                            }
                            FilterOp::In => false,
                            FilterOp::IsNull | FilterOp::IsNotNull => unreachable!(),
                        }
                    }
                }
            }
        }
    }

    /// Top-level equality predicates usable as index probes: the root leaf
    /// itself, or the direct `=` children of a root AND. Sorted by column.
    pub fn extract_index_conditions(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        match self {
            Condition::Leaf {
                op: FilterOp::Eq,
                column,
                value,
            } => {
                out.insert(column.clone(), value.clone());
            }
            Condition::And(children) => {
                for child in children {
                    if let Condition::Leaf {
                        op: FilterOp::Eq,
                        column,
                        value,
                    } = child
                    {
                        out.insert(column.clone(), value.clone());
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// Columns referenced anywhere in the tree.
    pub fn columns(&self, out: &mut Vec<String>) {
        match self {
            Condition::And(children) | Condition::Or(children) => {
                for c in children {
                    c.columns(out);
                }
            }
            Condition::Leaf { column, .. } => out.push(column.clone()),
        }
    }
}

fn is_null(cell: Option<&String>) -> bool {
    match cell {
        None => true,
        Some(v) => v.is_empty() || v == "NULL",
    }
}

/// Stringify a JSON scalar the way the wire format expects.
fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> AHashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_simple_map() {
        let cond = Condition::parse_str(r#"{"Dept":"Eng","id":1}"#).unwrap().unwrap();
        let conds = cond.extract_index_conditions();
        assert_eq!(conds.get("dept"), Some(&"Eng".to_string()));
        assert_eq!(conds.get("id"), Some(&"1".to_string()));

        assert!(cond.evaluate(&row(&[("dept", "Eng"), ("id", "1")])));
        assert!(!cond.evaluate(&row(&[("dept", "Sales"), ("id", "1")])));
    }

    #[test]
    fn test_parse_empty_forms() {
        assert!(Condition::parse_str("").unwrap().is_none());
        assert!(Condition::parse_str("{}").unwrap().is_none());
        assert!(Condition::parse_str("[]").unwrap().is_none());
        assert!(Condition::parse_str("null").unwrap().is_none());
    }

    #[test]
    fn test_parse_tree_form() {
        let cond = Condition::parse_str(
            r#"{"operator":"OR","children":[
                {"operator":"=","column":"dept","value":"Eng"},
                {"operator":">","column":"score","value":"50"}
            ]}"#,
        )
        .unwrap()
        .unwrap();
        assert!(cond.evaluate(&row(&[("dept", "Eng"), ("score", "10")])));
        assert!(cond.evaluate(&row(&[("dept", "Ops"), ("score", "60")])));
        assert!(!cond.evaluate(&row(&[("dept", "Ops"), ("score", "40")])));
        // OR root exposes no index conditions
        assert!(cond.extract_index_conditions().is_empty());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = Condition::parse_str(r#"{"operator":"~","column":"a","value":"b"}"#).unwrap_err();
        assert!(matches!(err, CidxError::BadRequest(_)));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let cond = Condition::parse_str(r#"{"operator":"<","column":"n","value":"9"}"#)
            .unwrap()
            .unwrap();
        // string comparison: "10" < "9"
        assert!(cond.evaluate(&row(&[("n", "10")])));
        assert!(!cond.evaluate(&row(&[("n", "95")])));
    }

    #[test]
    fn test_like_is_case_insensitive_substring() {
        let cond = Condition::parse_str(r#"{"operator":"LIKE","column":"name","value":"AR"}"#)
            .unwrap()
            .unwrap();
        assert!(cond.evaluate(&row(&[("name", "Carol")])));
        assert!(cond.evaluate(&row(&[("name", "BARNEY")])));
        assert!(!cond.evaluate(&row(&[("name", "Bob")])));
    }

    #[test]
    fn test_is_null_semantics() {
        let cond = Condition::parse_str(r#"{"operator":"IS NULL","column":"x"}"#)
            .unwrap()
            .unwrap();
        assert!(cond.evaluate(&row(&[])));
        assert!(cond.evaluate(&row(&[("x", "")])));
        assert!(cond.evaluate(&row(&[("x", "NULL")])));
        assert!(!cond.evaluate(&row(&[("x", "0")])));

        let not_null = Condition::parse_str(r#"{"operator":"IS NOT NULL","column":"x"}"#)
            .unwrap()
            .unwrap();
        assert!(not_null.evaluate(&row(&[("x", "0")])));
        assert!(!not_null.evaluate(&row(&[("x", "")])));
    }

    #[test]
    fn test_in_never_matches() {
        let cond = Condition::parse_str(r#"{"operator":"IN","column":"dept","value":"Eng"}"#)
            .unwrap()
            .unwrap();
        assert!(!cond.evaluate(&row(&[("dept", "Eng")])));
    }

    #[test]
    fn test_extraction_from_and_root() {
        let cond = Condition::parse_str(
            r#"{"operator":"AND","children":[
                {"operator":"=","column":"dept","value":"Eng"},
                {"operator":">","column":"score","value":"5"},
                {"operator":"=","column":"name","value":"Carol"}
            ]}"#,
        )
        .unwrap()
        .unwrap();
        let conds = cond.extract_index_conditions();
        assert_eq!(conds.len(), 2);
        let cols: Vec<&String> = conds.keys().collect();
        assert_eq!(cols, ["dept", "name"]);
    }

    #[test]
    fn test_missing_column_fails_comparisons() {
        let cond = Condition::parse_str(r#"{"operator":"=","column":"ghost","value":""}"#)
            .unwrap()
            .unwrap();
        assert!(!cond.evaluate(&row(&[("dept", "Eng")])));
    }
}
