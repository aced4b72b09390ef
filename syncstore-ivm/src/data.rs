//! Rows, values and the nodes operators hand to each other.

use std::{cmp::Ordering, collections::BTreeMap};

use serde_json::Value;

/// A row of a table, by column name. A missing column reads as `null`.
pub type Row = BTreeMap<String, Value>;

static NULL: Value = Value::Null;

/// A row together with the rows related to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// The row itself.
    pub row: Row,
    /// Related rows, by relationship name.
    pub relationships: BTreeMap<String, Vec<Node>>,
}

impl Node {
    /// A node for `row` with no relationships.
    pub fn new(row: Row) -> Self {
        Self {
            row,
            relationships: BTreeMap::new(),
        }
    }
}

impl From<Row> for Node {
    fn from(row: Row) -> Self {
        Self::new(row)
    }
}

/// The value of `column` in `row`, `null` if the column is missing.
pub fn row_value<'a>(row: &'a Row, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&NULL)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over values.
///
/// `null` sorts first. Values of different types are ordered by type, in the
/// order null, bool, number, string, array, object. Strings compare by their
/// UTF-8 bytes.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
        },
        (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
        (Value::Array(a), Value::Array(b)) => {
            for (a, b) in a.iter().zip(b) {
                let ord = compare_values(a, b);
                if ord.is_ne() {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord.is_ne() {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality as used by constraints: `null` equals nothing, not even itself.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    compare_values(a, b).is_eq()
}
