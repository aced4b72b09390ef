//! An in-memory table.

use std::cmp::Ordering;

use serde_json::Value;
use snafu::{OptionExt, ensure};
use tracing::trace;

use crate::{
    change::{Change, SourceChange},
    data::{Node, Row, row_value, values_equal},
    operator::{
        Basis, Constraint, DuplicateRowSnafu, FetchRequest, Operator, OperatorError,
        PrimaryKeyChangedSnafu, RowNotFoundSnafu,
    },
    schema::{Direction, SortOrder, SourceSchema, compare_rows_by},
    stream::{self, Stream},
};

/// Rows of one table kept in memory, sorted by the schema's order.
///
/// Ties in the schema's order are broken by the primary key, so the source
/// has a total order even when [`SourceSchema::sort`] does not name the
/// primary key.
#[derive(Debug)]
pub struct MemorySource {
    schema: SourceSchema,
    total_order: SortOrder,
    rows: Vec<Row>,
}

impl MemorySource {
    /// A source sorted by its primary key.
    pub fn new(
        table_name: impl Into<String>,
        primary_key: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let primary_key: Vec<String> = primary_key.into_iter().map(Into::into).collect();
        let sort = primary_key
            .iter()
            .map(|c| (c.clone(), Direction::Asc))
            .collect();
        Self::with_schema(SourceSchema {
            table_name: table_name.into(),
            primary_key,
            sort,
        })
    }

    /// An empty source with `schema`.
    pub fn with_schema(schema: SourceSchema) -> Self {
        let mut total_order = schema.sort.clone();
        for column in &schema.primary_key {
            if !total_order.iter().any(|(c, _)| c == column) {
                total_order.push((column.clone(), Direction::Asc));
            }
        }
        Self {
            schema,
            total_order,
            rows: Vec::new(),
        }
    }

    /// Sorts the source by `sort` instead.
    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.schema.sort = sort;
        let schema = self.schema;
        let rows = self.rows;
        let mut source = Self::with_schema(schema);
        for row in rows {
            source.insert(row);
        }
        source
    }

    /// Adds rows without producing changes, for setting up a source before
    /// anything fetches from it.
    pub fn with_rows(
        mut self,
        rows: impl IntoIterator<Item = Row>,
    ) -> Result<Self, OperatorError> {
        for row in rows {
            self.push(SourceChange::Add { row })?;
        }
        Ok(self)
    }

    /// Number of rows in the source.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the source has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        compare_rows_by(&self.total_order, a, b)
    }

    fn key_of(&self, row: &Row) -> String {
        let key: Vec<Value> = self
            .schema
            .primary_key
            .iter()
            .map(|c| row_value(row, c).clone())
            .collect();
        Value::Array(key).to_string()
    }

    fn same_key(&self, a: &Row, b: &Row) -> bool {
        self.schema
            .primary_key
            .iter()
            .all(|c| row_value(a, c) == row_value(b, c))
    }

    fn position_of(&self, row: &Row) -> Option<usize> {
        self.rows.iter().position(|r| self.same_key(r, row))
    }

    fn insert(&mut self, row: Row) {
        let at = self
            .rows
            .partition_point(|r| self.compare(r, &row).is_lt());
        self.rows.insert(at, row);
    }

    fn matches(constraint: Option<&Constraint>, row: &Row) -> bool {
        constraint.is_none_or(|c| values_equal(row_value(row, &c.key), &c.value))
    }
}

impl Operator for MemorySource {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        let rows: Vec<&Row> = self
            .rows
            .iter()
            .filter(|r| Self::matches(req.constraint.as_ref(), r))
            .collect();
        let from = match &req.start {
            None => 0,
            Some(start) => {
                let at = rows.partition_point(|r| self.compare(r, &start.row).is_lt());
                match start.basis {
                    Basis::Before => at.saturating_sub(1),
                    Basis::At => at,
                    Basis::After => rows.partition_point(|r| self.compare(r, &start.row).is_le()),
                }
            }
        };
        let nodes = rows[from..]
            .iter()
            .map(|r| Node::new((*r).clone()))
            .collect();
        Ok(stream::from_nodes(nodes))
    }

    fn cleanup(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        self.fetch(req)
    }

    fn push(&mut self, change: SourceChange) -> Result<Vec<Change>, OperatorError> {
        let change = match change {
            SourceChange::Add { row } => {
                ensure!(
                    self.position_of(&row).is_none(),
                    DuplicateRowSnafu {
                        key: self.key_of(&row)
                    }
                );
                self.insert(row.clone());
                Change::add(row)
            }
            SourceChange::Remove { row } => {
                let at = self.position_of(&row).context(RowNotFoundSnafu {
                    key: self.key_of(&row),
                })?;
                Change::remove(self.rows.remove(at))
            }
            SourceChange::Edit { old_row, row } => {
                ensure!(
                    self.same_key(&old_row, &row),
                    PrimaryKeyChangedSnafu {
                        key: self.key_of(&old_row)
                    }
                );
                let at = self.position_of(&old_row).context(RowNotFoundSnafu {
                    key: self.key_of(&old_row),
                })?;
                let old_row = self.rows.remove(at);
                self.insert(row.clone());
                Change::edit(old_row, row)
            }
        };
        trace!(table = %self.schema.table_name, ?change, "source push");
        Ok(vec![change])
    }
}
