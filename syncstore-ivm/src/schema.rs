//! What an operator outputs and in which order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::{
    data::{Row, compare_values, row_value},
    operator::{OperatorError, OrderingMissingPrimaryKeySnafu},
};

/// Sort direction of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// Columns to sort by, most significant first.
pub type SortOrder = Vec<(String, Direction)>;

/// Columns that together identify a row.
pub type PrimaryKey = Vec<String>;

/// Describes the rows an operator outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSchema {
    /// The table the rows come from.
    pub table_name: String,
    /// Columns identifying a row.
    pub primary_key: PrimaryKey,
    /// The order rows come out in. Ties are broken by the primary key.
    pub sort: SortOrder,
}

impl SourceSchema {
    /// Compares two rows by [`SourceSchema::sort`].
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        compare_rows_by(&self.sort, a, b)
    }
}

pub(crate) fn compare_rows_by(sort: &[(String, Direction)], a: &Row, b: &Row) -> Ordering {
    for (column, direction) in sort {
        let ord = compare_values(row_value(a, column), row_value(b, column));
        let ord = match direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord.is_ne() {
            return ord;
        }
    }
    Ordering::Equal
}

/// Fails unless every primary key column is part of `sort`, which makes
/// `sort` a total order over rows.
pub fn check_ordering_includes_pk(
    sort: &[(String, Direction)],
    primary_key: &[String],
) -> Result<(), OperatorError> {
    for column in primary_key {
        ensure!(
            sort.iter().any(|(c, _)| c == column),
            OrderingMissingPrimaryKeySnafu {
                column: column.clone()
            }
        );
    }
    Ok(())
}
