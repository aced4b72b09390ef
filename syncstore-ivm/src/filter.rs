//! Dropping rows that fail a condition.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, ensure};

use crate::{
    change::{Change, SourceChange},
    data::{Node, Row, compare_values, row_value},
    operator::{
        Basis, FetchRequest, InvalidOperandSnafu, InvalidPatternSnafu, Operator, OperatorError,
        Start, TrailingEscapeSnafu,
    },
    schema::SourceSchema,
    stream::{self, Stream},
};

/// Comparison operators of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum SimpleOperator {
    /// `=`
    #[strum(serialize = "=")]
    Eq,
    /// `!=`
    #[strum(serialize = "!=")]
    Ne,
    /// `<`
    #[strum(serialize = "<")]
    Lt,
    /// `<=`
    #[strum(serialize = "<=")]
    Le,
    /// `>`
    #[strum(serialize = ">")]
    Gt,
    /// `>=`
    #[strum(serialize = ">=")]
    Ge,
    /// `IN`, membership in an array.
    #[strum(serialize = "IN")]
    In,
    /// `NOT IN`
    #[strum(serialize = "NOT IN")]
    NotIn,
    /// `LIKE`, a case sensitive pattern.
    #[strum(serialize = "LIKE")]
    Like,
    /// `NOT LIKE`
    #[strum(serialize = "NOT LIKE")]
    NotLike,
    /// `ILIKE`, a case insensitive pattern.
    #[strum(serialize = "ILIKE")]
    ILike,
    /// `NOT ILIKE`
    #[strum(serialize = "NOT ILIKE")]
    NotILike,
}

#[derive(Debug, Clone)]
enum Matcher {
    Compare(SimpleOperator, Value),
    In(Vec<Value>),
    /// Pattern without wildcards.
    Exact { pattern: String, ignore_case: bool },
    Pattern(Regex),
}

/// `column op value`.
#[derive(Debug, Clone)]
pub struct Condition {
    column: String,
    negate: bool,
    matcher: Matcher,
}

impl Condition {
    /// Compiles a condition.
    ///
    /// `IN` takes an array. `LIKE` takes a string where `%` matches any
    /// number of characters, `_` matches one, and `\` escapes the next
    /// character.
    pub fn new(
        column: impl Into<String>,
        op: SimpleOperator,
        value: Value,
    ) -> Result<Self, OperatorError> {
        use SimpleOperator::*;
        let negate = matches!(op, NotIn | NotLike | NotILike);
        let matcher = match op {
            Eq | Ne | Lt | Le | Gt | Ge => Matcher::Compare(op, value),
            In | NotIn => match value {
                Value::Array(values) => Matcher::In(values),
                _ => {
                    return InvalidOperandSnafu {
                        op: "IN",
                        expected: "an array",
                    }
                    .fail();
                }
            },
            Like | NotLike | ILike | NotILike => {
                let pattern = value.as_str().context(InvalidOperandSnafu {
                    op: "LIKE",
                    expected: "a string",
                })?;
                like_matcher(pattern, matches!(op, ILike | NotILike))?
            }
        };
        Ok(Self {
            column: column.into(),
            negate,
            matcher,
        })
    }

    /// Whether `row` satisfies the condition.
    pub fn matches(&self, row: &Row) -> bool {
        let lhs = row_value(row, &self.column);
        let res = match &self.matcher {
            Matcher::Compare(SimpleOperator::Eq, rhs) => lhs == rhs,
            Matcher::Compare(SimpleOperator::Ne, rhs) => lhs != rhs,
            Matcher::Compare(op, rhs) => match compare_same_type(lhs, rhs) {
                None => false,
                Some(ord) => match op {
                    SimpleOperator::Lt => ord.is_lt(),
                    SimpleOperator::Le => ord.is_le(),
                    SimpleOperator::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                },
            },
            Matcher::In(values) => values.contains(lhs),
            Matcher::Exact {
                pattern,
                ignore_case,
            } => match lhs.as_str() {
                Some(lhs) if *ignore_case => lhs.to_lowercase() == pattern.to_lowercase(),
                Some(lhs) => lhs == pattern,
                None => false,
            },
            Matcher::Pattern(re) => lhs.as_str().is_some_and(|lhs| re.is_match(lhs)),
        };
        res != self.negate
    }
}

/// Ordering of two values of the same scalar type. `None` for nulls and
/// mixed types, which never compare.
fn compare_same_type(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_)) => Some(compare_values(lhs, rhs)),
        _ => None,
    }
}

fn like_matcher(pattern: &str, ignore_case: bool) -> Result<Matcher, OperatorError> {
    if !pattern.contains(['%', '_', '\\']) {
        return Ok(Matcher::Exact {
            pattern: pattern.to_string(),
            ignore_case,
        });
    }
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                let escaped = chars.next().context(TrailingEscapeSnafu { pattern })?;
                re.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4])));
            }
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    let re = RegexBuilder::new(&re)
        .case_insensitive(ignore_case)
        .build()
        .context(InvalidPatternSnafu { pattern })?;
    Ok(Matcher::Pattern(re))
}

/// Passes on the rows of its input that match a [`Condition`].
#[derive(Debug)]
pub struct Filter {
    input: Box<dyn Operator>,
    schema: SourceSchema,
    condition: Condition,
}

impl Filter {
    /// Passes on the rows of `input` that match `condition`.
    pub fn new(input: impl Operator + 'static, condition: Condition) -> Self {
        Self {
            schema: input.schema().clone(),
            input: Box::new(input),
            condition,
        }
    }

    fn filter_change(&self, change: Change) -> Option<Change> {
        match change {
            Change::Edit { old_node, node } => {
                match (
                    self.condition.matches(&old_node.row),
                    self.condition.matches(&node.row),
                ) {
                    (true, true) => Some(Change::Edit { old_node, node }),
                    (true, false) => Some(Change::Remove { node: old_node }),
                    (false, true) => Some(Change::Add { node }),
                    (false, false) => None,
                }
            }
            change => self.condition.matches(change.row()).then_some(change),
        }
    }
}

impl Operator for Filter {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        let condition = &self.condition;
        let Some(Start {
            row: start,
            basis: Basis::Before,
        }) = req.start
        else {
            let nodes = self.input.fetch(req)?;
            return Ok(Box::new(nodes.filter(move |n| condition.matches(&n.row))));
        };
        // The row before the start in the input may not match, so the
        // matching row before it has to be found here.
        let req = FetchRequest {
            constraint: req.constraint,
            start: None,
        };
        let mut nodes: Vec<Node> = self
            .input
            .fetch(req)?
            .filter(|n| condition.matches(&n.row))
            .collect();
        let at = nodes.partition_point(|n| self.schema.compare_rows(&n.row, &start).is_lt());
        Ok(stream::from_nodes(nodes.split_off(at.saturating_sub(1))))
    }

    fn cleanup(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        let condition = &self.condition;
        let nodes = self.input.cleanup(req)?;
        Ok(Box::new(nodes.filter(move |n| condition.matches(&n.row))))
    }

    fn push(&mut self, change: SourceChange) -> Result<Vec<Change>, OperatorError> {
        let changes = self.input.push(change)?;
        Ok(changes
            .into_iter()
            .filter_map(|c| self.filter_change(c))
            .collect())
    }
}
