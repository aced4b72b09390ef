//! The contract between operators.
//!
//! Operators are chained: each owns its input. Data is pulled with
//! [`Operator::fetch`]. Changes enter at the source end through
//! [`Operator::push`], and each stage returns the changes it outputs in
//! turn. A pipeline step runs to completion before the next change is
//! pushed, so an operator may fetch from its input while handling a push and
//! sees the source with the change already applied.

use std::fmt;

use nested_enum_utils::common_fields;
use serde_json::Value;
use snafu::{Backtrace, Snafu};

use crate::{
    change::{Change, SourceChange},
    data::Row,
    schema::SourceSchema,
    stream::Stream,
};

/// Errors of building or running a pipeline.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum OperatorError {
    #[snafu(display("Ordering does not include primary key column {column}"))]
    OrderingMissingPrimaryKey { column: String },
    #[snafu(display("Invalid partition key"))]
    InvalidPartitionKey {},
    #[snafu(display("Row already exists: {key}"))]
    DuplicateRow { key: String },
    #[snafu(display("Row not found: {key}"))]
    RowNotFound { key: String },
    #[snafu(display("Edit changes the primary key of {key}"))]
    PrimaryKeyChanged { key: String },
    #[snafu(display("Hydration does not support a start row"))]
    UnexpectedStart {},
    #[snafu(display("Take state of the partition is missing"))]
    MissingTakeState {},
    #[snafu(display("Input has no {what} row"))]
    MissingRow { what: &'static str },
    #[snafu(display("Edited row collides with the bound"))]
    BoundCollision {},
    #[snafu(display("Invalid take state"))]
    InvalidTakeState { source: serde_json::Error },
    #[snafu(display("Operator {op} expects {expected}"))]
    InvalidOperand {
        op: &'static str,
        expected: &'static str,
    },
    #[snafu(display("LIKE pattern {pattern:?} ends with an escape character"))]
    TrailingEscape { pattern: String },
    #[snafu(display("Invalid LIKE pattern {pattern:?}"))]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Restricts a fetch to rows whose `key` column equals `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    /// The constrained column.
    pub key: String,
    /// The value it must have.
    pub value: Value,
}

/// Where a fetch starts, relative to `row`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// At the last row before `row`, or at the first row if there is none.
    Before,
    /// At `row` or the first row after it.
    At,
    /// At the first row after `row`.
    After,
}

/// Where a fetch starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    /// The reference row. It does not need to exist.
    pub row: Row,
    /// Where to start relative to `row`.
    pub basis: Basis,
}

/// What to fetch from an operator. The default fetches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    /// Only rows matching the constraint.
    pub constraint: Option<Constraint>,
    /// Skip the rows before the start.
    pub start: Option<Start>,
}

impl FetchRequest {
    /// Fetches rows whose `key` column equals `value`.
    pub fn constrained(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            constraint: Some(Constraint {
                key: key.into(),
                value: value.into(),
            }),
            start: None,
        }
    }

    /// Replaces the constraint.
    pub fn with_constraint(mut self, constraint: Option<Constraint>) -> Self {
        self.constraint = constraint;
        self
    }

    /// Starts the fetch at `row`.
    pub fn starting(mut self, row: Row, basis: Basis) -> Self {
        self.start = Some(Start { row, basis });
        self
    }
}

/// A stage of a pipeline.
pub trait Operator: fmt::Debug {
    /// The schema of the rows this operator outputs.
    fn schema(&self) -> &SourceSchema;

    /// Rows this operator outputs, sorted by its schema.
    ///
    /// The first fetch of a stateful operator hydrates its state.
    fn fetch(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError>;

    /// Like [`Operator::fetch`], and drops the state the corresponding fetch
    /// built up.
    fn cleanup(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError>;

    /// Applies `change` at the source end of the pipeline and returns the
    /// changes to this operator's output, in order.
    fn push(&mut self, change: SourceChange) -> Result<Vec<Change>, OperatorError>;
}

impl<O: Operator + ?Sized> Operator for Box<O> {
    fn schema(&self) -> &SourceSchema {
        (**self).schema()
    }

    fn fetch(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        (**self).fetch(req)
    }

    fn cleanup(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        (**self).cleanup(req)
    }

    fn push(&mut self, change: SourceChange) -> Result<Vec<Change>, OperatorError> {
        (**self).push(change)
    }
}
