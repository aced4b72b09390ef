//! Limiting the output to the first rows of the input.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::trace;

use crate::{
    change::{Change, SourceChange},
    data::{Node, Row, row_value},
    operator::{
        Basis, BoundCollisionSnafu, Constraint, FetchRequest, InvalidPartitionKeySnafu,
        InvalidTakeStateSnafu, MissingRowSnafu, MissingTakeStateSnafu, Operator, OperatorError,
        UnexpectedStartSnafu,
    },
    schema::{SourceSchema, check_ordering_includes_pk},
    storage::Storage,
    stream::{self, Stream},
};

const STATE_PREFIX: &str = "take";
const MAX_BOUND_KEY: &str = "maxBound";

/// What a partition has admitted so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TakeState {
    size: usize,
    /// The last admitted row. `None` while nothing is admitted.
    bound: Option<Row>,
}

/// A hydrated partition, loaded for handling a push.
#[derive(Debug)]
struct Partition {
    key: Vec<Value>,
    state: TakeState,
    max_bound: Option<Row>,
    constraint: Option<Constraint>,
}

/// Outputs the first `limit` rows of its input in the input's order,
/// optionally counted separately per value of a partition key.
///
/// Take keeps the last row it admitted as the partition's *bound*. Pushes
/// after the bound are dropped without looking at the input again. The
/// largest bound of all partitions is kept as well, to answer fetches that
/// are not constrained to a single partition.
///
/// A partition is only maintained once it has been fetched; pushes for
/// other partitions are dropped.
#[derive(Debug)]
pub struct Take {
    input: Box<dyn Operator>,
    storage: Box<dyn Storage>,
    schema: SourceSchema,
    limit: usize,
    partition_key: Option<String>,
}

impl Take {
    /// Fails if the input's order is not total, that is if it does not end
    /// with the primary key.
    pub fn new(
        input: impl Operator + 'static,
        storage: impl Storage + 'static,
        limit: usize,
        partition_key: Option<String>,
    ) -> Result<Self, OperatorError> {
        let schema = input.schema().clone();
        check_ordering_includes_pk(&schema.sort, &schema.primary_key)?;
        ensure!(
            partition_key.as_deref() != Some(""),
            InvalidPartitionKeySnafu
        );
        Ok(Self {
            input: Box::new(input),
            storage: Box::new(storage),
            schema,
            limit,
            partition_key,
        })
    }

    fn state_key(partition_value: Option<&Value>) -> Vec<Value> {
        vec![
            Value::from(STATE_PREFIX),
            partition_value.cloned().unwrap_or(Value::Null),
        ]
    }

    fn state_key_for_row(&self, row: &Row) -> Vec<Value> {
        Self::state_key(self.partition_key.as_ref().map(|k| row_value(row, k)))
    }

    fn state_key_for_constraint(&self, constraint: Option<&Constraint>) -> Vec<Value> {
        Self::state_key(
            self.partition_key
                .as_ref()
                .and(constraint)
                .map(|c| &c.value),
        )
    }

    fn get_state(&self, key: &[Value]) -> Result<Option<TakeState>, OperatorError> {
        self.storage
            .get(key)
            .map(serde_json::from_value)
            .transpose()
            .context(InvalidTakeStateSnafu)
    }

    fn max_bound(&self) -> Result<Option<Row>, OperatorError> {
        self.storage
            .get(&[Value::from(MAX_BOUND_KEY)])
            .map(serde_json::from_value)
            .transpose()
            .context(InvalidTakeStateSnafu)
    }

    fn set_state(
        &mut self,
        key: &[Value],
        size: usize,
        bound: Option<Row>,
        max_bound: Option<&Row>,
    ) -> Result<(), OperatorError> {
        let raise = match (&bound, max_bound) {
            (Some(bound), Some(max)) => self.schema.compare_rows(bound, max).is_gt(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if raise {
            let value = serde_json::to_value(&bound).context(InvalidTakeStateSnafu)?;
            self.storage.set(&[Value::from(MAX_BOUND_KEY)], value);
        }
        let value =
            serde_json::to_value(TakeState { size, bound }).context(InvalidTakeStateSnafu)?;
        self.storage.set(key, value);
        Ok(())
    }

    fn load_partition(&self, row: &Row) -> Result<Option<Partition>, OperatorError> {
        let key = self.state_key_for_row(row);
        let Some(state) = self.get_state(&key)? else {
            return Ok(None);
        };
        Ok(Some(Partition {
            key,
            state,
            max_bound: self.max_bound()?,
            constraint: self.partition_key.as_ref().map(|k| Constraint {
                key: k.clone(),
                value: row_value(row, k).clone(),
            }),
        }))
    }

    /// The first row of the partition at or around `row`.
    fn first_from(
        &mut self,
        constraint: &Option<Constraint>,
        row: &Row,
        basis: Basis,
        what: &'static str,
    ) -> Result<Node, OperatorError> {
        let req = FetchRequest::default()
            .with_constraint(constraint.clone())
            .starting(row.clone(), basis);
        self.input.fetch(req)?.next().context(MissingRowSnafu { what })
    }

    /// The first two rows of the partition starting before `row`.
    fn two_before(
        &mut self,
        constraint: &Option<Constraint>,
        row: &Row,
    ) -> Result<(Option<Node>, Option<Node>), OperatorError> {
        let req = FetchRequest::default()
            .with_constraint(constraint.clone())
            .starting(row.clone(), Basis::Before);
        let mut nodes = self.input.fetch(req)?;
        let first = nodes.next();
        let second = nodes.next();
        Ok((first, second))
    }

    fn initial_fetch(
        &mut self,
        req: FetchRequest,
        key: Vec<Value>,
    ) -> Result<Stream<'_>, OperatorError> {
        ensure!(req.start.is_none(), UnexpectedStartSnafu);
        if self.limit == 0 {
            return Ok(stream::empty());
        }
        // Hydration always reads up to the limit, whatever the consumer
        // takes, so that size and bound match the rows handed out.
        let nodes: Vec<Node> = self.input.fetch(req)?.take(self.limit).collect();
        let bound = nodes.last().map(|n| n.row.clone());
        let max_bound = self.max_bound()?;
        trace!(partition = ?key, size = nodes.len(), "take hydrated");
        self.set_state(&key, nodes.len(), bound, max_bound.as_ref())?;
        Ok(stream::from_nodes(nodes))
    }

    fn push_change(&mut self, change: Change, out: &mut Vec<Change>) -> Result<(), OperatorError> {
        match change {
            Change::Add { node } => self.push_add(node, out),
            Change::Remove { node } => self.push_remove(node, out),
            Change::Edit { old_node, node } => self.push_edit(old_node, node, out),
            Change::Child { row, child } => {
                let Some(partition) = self.load_partition(&row)? else {
                    return Ok(());
                };
                let in_window = partition
                    .state
                    .bound
                    .as_ref()
                    .is_some_and(|bound| self.schema.compare_rows(&row, bound).is_le());
                if in_window {
                    out.push(Change::Child { row, child });
                }
                Ok(())
            }
        }
    }

    fn push_add(&mut self, node: Node, out: &mut Vec<Change>) -> Result<(), OperatorError> {
        let Some(Partition {
            key,
            state,
            max_bound,
            constraint,
        }) = self.load_partition(&node.row)?
        else {
            return Ok(());
        };

        if state.size < self.limit {
            let bound = match state.bound {
                Some(bound) if self.schema.compare_rows(&bound, &node.row).is_ge() => bound,
                _ => node.row.clone(),
            };
            self.set_state(&key, state.size + 1, Some(bound), max_bound.as_ref())?;
            out.push(Change::Add { node });
            return Ok(());
        }

        let Some(bound) = state.bound else {
            return Ok(());
        };
        if self.schema.compare_rows(&node.row, &bound).is_ge() {
            return Ok(());
        }

        // The new row pushes the bound out of the window.
        let (before_bound, bound_node) = if self.limit == 1 {
            let bound_node = self.first_from(&constraint, &bound, Basis::At, "bound")?;
            (None, bound_node)
        } else {
            let (before, at) = self.two_before(&constraint, &bound)?;
            (before, at.context(MissingRowSnafu { what: "bound" })?)
        };
        let new_bound = match before_bound {
            Some(before) if self.schema.compare_rows(&node.row, &before.row).is_le() => before.row,
            _ => node.row.clone(),
        };
        self.set_state(&key, state.size, Some(new_bound), max_bound.as_ref())?;
        out.push(Change::Remove { node: bound_node });
        out.push(Change::Add { node });
        Ok(())
    }

    fn push_remove(&mut self, node: Node, out: &mut Vec<Change>) -> Result<(), OperatorError> {
        let Some(Partition {
            key,
            state,
            max_bound,
            constraint,
        }) = self.load_partition(&node.row)?
        else {
            return Ok(());
        };
        let Some(bound) = state.bound else {
            return Ok(());
        };
        if self.schema.compare_rows(&node.row, &bound).is_gt() {
            return Ok(());
        }

        // Walk from just before the old bound. The first row past it, if
        // any, moves into the window. Otherwise the last row seen is the new
        // bound.
        let mut last = None;
        let mut next = None;
        let req = FetchRequest::default()
            .with_constraint(constraint)
            .starting(bound.clone(), Basis::Before);
        for candidate in self.input.fetch(req)? {
            if self.schema.compare_rows(&candidate.row, &bound).is_gt() {
                next = Some(candidate);
                break;
            }
            last = Some(candidate);
        }

        match next {
            Some(next) => {
                self.set_state(&key, state.size, Some(next.row.clone()), max_bound.as_ref())?;
                out.push(Change::Remove { node });
                out.push(Change::Add { node: next });
            }
            None => {
                let bound = last.map(|n| n.row);
                let size = state.size.saturating_sub(1);
                self.set_state(&key, size, bound, max_bound.as_ref())?;
                out.push(Change::Remove { node });
            }
        }
        Ok(())
    }

    fn push_edit(
        &mut self,
        old_node: Node,
        node: Node,
        out: &mut Vec<Change>,
    ) -> Result<(), OperatorError> {
        if let Some(partition_key) = &self.partition_key {
            if row_value(&old_node.row, partition_key) != row_value(&node.row, partition_key) {
                self.push_remove(old_node, out)?;
                return self.push_add(node, out);
            }
        }

        let Some(Partition {
            key,
            state,
            max_bound,
            constraint,
        }) = self.load_partition(&old_node.row)?
        else {
            return Ok(());
        };
        let bound = state
            .bound
            .clone()
            .context(MissingRowSnafu { what: "bound" })?;
        let old_cmp = self.schema.compare_rows(&old_node.row, &bound);
        let new_cmp = self.schema.compare_rows(&node.row, &bound);
        let max_bound = max_bound.as_ref();

        use std::cmp::Ordering::*;
        match (old_cmp, new_cmp) {
            // The bound itself changed.
            (Equal, Equal) => out.push(Change::Edit { old_node, node }),
            (Equal, Less) => {
                let new_bound = if self.limit == 1 {
                    node.row.clone()
                } else {
                    self.first_from(&constraint, &bound, Basis::Before, "previous")?
                        .row
                };
                self.set_state(&key, state.size, Some(new_bound), max_bound)?;
                out.push(Change::Edit { old_node, node });
            }
            (Equal, Greater) => {
                let next = self.first_from(&constraint, &bound, Basis::At, "next")?;
                if self.schema.compare_rows(&next.row, &node.row).is_eq() {
                    self.set_state(&key, state.size, Some(node.row.clone()), max_bound)?;
                    out.push(Change::Edit { old_node, node });
                } else {
                    self.set_state(&key, state.size, Some(next.row.clone()), max_bound)?;
                    out.push(Change::Remove { node: old_node });
                    out.push(Change::Add { node: next });
                }
            }
            (Greater, Equal) | (Less, Equal) => return BoundCollisionSnafu.fail(),
            // Outside before and after.
            (Greater, Greater) => {}
            // Moves into the window and pushes the bound out.
            (Greater, Less) => {
                let (new_bound, old_bound) = self.two_before(&constraint, &bound)?;
                let new_bound = new_bound.context(MissingRowSnafu { what: "previous" })?;
                let old_bound = old_bound.context(MissingRowSnafu { what: "bound" })?;
                self.set_state(&key, state.size, Some(new_bound.row), max_bound)?;
                out.push(Change::Remove { node: old_bound });
                out.push(Change::Add { node });
            }
            // Inside before and after.
            (Less, Less) => out.push(Change::Edit { old_node, node }),
            // Moves past the bound; the row after the bound takes its place.
            (Less, Greater) => {
                let next = self.first_from(&constraint, &bound, Basis::After, "next")?;
                if self.schema.compare_rows(&next.row, &node.row).is_eq() {
                    self.set_state(&key, state.size, Some(node.row.clone()), max_bound)?;
                    out.push(Change::Edit { old_node, node });
                } else {
                    self.set_state(&key, state.size, Some(next.row.clone()), max_bound)?;
                    out.push(Change::Remove { node: old_node });
                    out.push(Change::Add { node: next });
                }
            }
        }
        Ok(())
    }
}

impl Operator for Take {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        let single_partition = match (&self.partition_key, &req.constraint) {
            (None, _) => true,
            (Some(partition_key), Some(constraint)) => &constraint.key == partition_key,
            (Some(_), None) => false,
        };
        if single_partition {
            let key = self.state_key_for_constraint(req.constraint.as_ref());
            let Some(state) = self.get_state(&key)? else {
                return self.initial_fetch(req, key);
            };
            let Some(bound) = state.bound else {
                return Ok(stream::empty());
            };
            let schema = &self.schema;
            let nodes = self.input.fetch(req)?;
            return Ok(Box::new(nodes.take_while(move |n| {
                schema.compare_rows(&bound, &n.row).is_ge()
            })));
        }

        // Partitioned but not constrained to a partition: every row is
        // checked against the bound of its own partition.
        let Some(max_bound) = self.max_bound()? else {
            return Ok(stream::empty());
        };
        let schema = &self.schema;
        let candidates: Vec<Node> = self
            .input
            .fetch(req)?
            .take_while(|n| schema.compare_rows(&n.row, &max_bound).is_le())
            .collect();
        let mut nodes = Vec::new();
        for node in candidates {
            let key = self.state_key_for_row(&node.row);
            let in_window = self.get_state(&key)?.is_some_and(|state| {
                state
                    .bound
                    .is_some_and(|bound| self.schema.compare_rows(&bound, &node.row).is_ge())
            });
            if in_window {
                nodes.push(node);
            }
        }
        Ok(stream::from_nodes(nodes))
    }

    fn cleanup(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
        ensure!(req.start.is_none(), UnexpectedStartSnafu);
        let mut bound = None;
        if self.limit > 0 {
            let key = self.state_key_for_constraint(req.constraint.as_ref());
            let state = self.get_state(&key)?.context(MissingTakeStateSnafu)?;
            self.storage.del(&key);
            // The max bound only answers fetches across hydrated partitions.
            if self.storage.scan(&[Value::from(STATE_PREFIX)]).is_empty() {
                self.storage.del(&[Value::from(MAX_BOUND_KEY)]);
            }
            trace!(partition = ?key, "take cleaned up");
            bound = state.bound;
        }
        let schema = &self.schema;
        let nodes = self.input.cleanup(req)?;
        let Some(bound) = bound else {
            return Ok(stream::empty());
        };
        Ok(Box::new(nodes.take_while(move |n| {
            schema.compare_rows(&bound, &n.row).is_ge()
        })))
    }

    fn push(&mut self, change: SourceChange) -> Result<Vec<Change>, OperatorError> {
        let mut out = Vec::new();
        for change in self.input.push(change)? {
            self.push_change(change, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::{
        change::ChildChange, schema::Direction, source::MemorySource, storage::MemoryStorage,
    };

    fn row(id: i64) -> Row {
        Row::from([("id".to_string(), json!(id))])
    }

    fn vrow(id: i64, val: i64) -> Row {
        Row::from([("id".to_string(), json!(id)), ("val".to_string(), json!(val))])
    }

    fn prow(id: i64, part: i64, val: i64) -> Row {
        Row::from([
            ("id".to_string(), json!(id)),
            ("part".to_string(), json!(part)),
            ("val".to_string(), json!(val)),
        ])
    }

    fn add(row: Row) -> SourceChange {
        SourceChange::Add { row }
    }

    fn remove(row: Row) -> SourceChange {
        SourceChange::Remove { row }
    }

    fn edit(old_row: Row, row: Row) -> SourceChange {
        SourceChange::Edit { old_row, row }
    }

    fn ids(take: &mut Take, req: FetchRequest) -> Vec<i64> {
        take.fetch(req)
            .unwrap()
            .map(|n| n.row["id"].as_i64().unwrap())
            .collect()
    }

    fn take_ids(source: MemorySource, limit: usize) -> Take {
        Take::new(source, MemoryStorage::new(), limit, None).unwrap()
    }

    /// Sorted by `val`, then `id`, with ids 1..=5 and val = 10 * id.
    fn by_val(limit: usize) -> Take {
        let source = MemorySource::new("t", ["id"])
            .with_sort(vec![("val".into(), Direction::Asc), ("id".into(), Direction::Asc)])
            .with_rows((1..=5).map(|id| vrow(id, 10 * id)))
            .unwrap();
        let mut take = take_ids(source, limit);
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 2, 3]);
        take
    }

    #[test]
    fn limit_two_ascending_drops_larger_row() {
        let mut take = take_ids(MemorySource::new("t", ["id"]), 2);
        assert!(ids(&mut take, FetchRequest::default()).is_empty());

        assert_eq!(take.push(add(row(1))).unwrap(), vec![Change::add(row(1))]);
        assert_eq!(take.push(add(row(2))).unwrap(), vec![Change::add(row(2))]);
        assert_eq!(take.push(add(row(3))).unwrap(), vec![]);
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 2]);
    }

    #[test]
    fn limit_two_descending_evicts_bound() {
        let source =
            MemorySource::new("t", ["id"]).with_sort(vec![("id".into(), Direction::Desc)]);
        let mut take = take_ids(source, 2);
        assert!(ids(&mut take, FetchRequest::default()).is_empty());

        assert_eq!(take.push(add(row(1))).unwrap(), vec![Change::add(row(1))]);
        assert_eq!(take.push(add(row(2))).unwrap(), vec![Change::add(row(2))]);
        assert_eq!(
            take.push(add(row(3))).unwrap(),
            vec![Change::remove(row(1)), Change::add(row(3))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [3, 2]);
    }

    #[test]
    fn limit_one_replaces_bound() {
        let source = MemorySource::new("t", ["id"]).with_rows([row(5)]).unwrap();
        let mut take = take_ids(source, 1);
        assert_eq!(ids(&mut take, FetchRequest::default()), [5]);
        assert_eq!(
            take.push(add(row(3))).unwrap(),
            vec![Change::remove(row(5)), Change::add(row(3))]
        );
        assert_eq!(take.push(add(row(4))).unwrap(), vec![]);
        assert_eq!(ids(&mut take, FetchRequest::default()), [3]);
    }

    #[test]
    fn hydration_reads_up_to_limit() {
        let source = MemorySource::new("t", ["id"])
            .with_rows((1..=5).map(row))
            .unwrap();
        let mut take = take_ids(source, 3);
        // consuming only part of the first fetch still seeds the whole window
        let first = take.fetch(FetchRequest::default()).unwrap().next().unwrap();
        assert_eq!(first.row, row(1));
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 2, 3]);
        assert_eq!(
            take.get_state(&Take::state_key(None)).unwrap(),
            Some(TakeState {
                size: 3,
                bound: Some(row(3))
            })
        );
    }

    #[test]
    fn unhydrated_pushes_are_dropped() {
        let mut take = take_ids(MemorySource::new("t", ["id"]), 2);
        assert_eq!(take.push(add(row(1))).unwrap(), vec![]);
        // the row is in the source and shows up on hydration
        assert_eq!(ids(&mut take, FetchRequest::default()), [1]);
    }

    #[test]
    fn limit_zero_outputs_nothing() {
        let source = MemorySource::new("t", ["id"]).with_rows([row(1)]).unwrap();
        let mut take = take_ids(source, 0);
        assert!(ids(&mut take, FetchRequest::default()).is_empty());
        assert_eq!(take.push(add(row(0))).unwrap(), vec![]);
        assert!(take.cleanup(FetchRequest::default()).unwrap().next().is_none());
    }

    #[test]
    fn remove_promotes_next_row() {
        let source = MemorySource::new("t", ["id"])
            .with_rows((1..=5).map(row))
            .unwrap();
        let mut take = take_ids(source, 3);
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 2, 3]);

        assert_eq!(take.push(remove(row(4))).unwrap(), vec![]);
        assert_eq!(
            take.push(remove(row(2))).unwrap(),
            vec![Change::remove(row(2)), Change::add(row(5))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 3, 5]);

        // nothing left to promote
        assert_eq!(take.push(remove(row(5))).unwrap(), vec![Change::remove(row(5))]);
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 3]);
        assert_eq!(take.push(add(row(9))).unwrap(), vec![Change::add(row(9))]);
        assert_eq!(take.push(remove(row(1))).unwrap(), vec![Change::remove(row(1))]);
        assert_eq!(take.push(remove(row(3))).unwrap(), vec![Change::remove(row(3))]);
        assert_eq!(take.push(remove(row(9))).unwrap(), vec![Change::remove(row(9))]);
        assert!(ids(&mut take, FetchRequest::default()).is_empty());
        assert_eq!(take.push(add(row(7))).unwrap(), vec![Change::add(row(7))]);
    }

    #[test]
    fn edit_inside_window() {
        let mut take = by_val(3);
        assert_eq!(
            take.push(edit(vrow(2, 20), vrow(2, 25))).unwrap(),
            vec![Change::edit(vrow(2, 20), vrow(2, 25))]
        );
        assert_eq!(take.push(edit(vrow(5, 50), vrow(5, 45))).unwrap(), vec![]);
    }

    #[test]
    fn edit_bound_to_front() {
        let mut take = by_val(3);
        assert_eq!(
            take.push(edit(vrow(3, 30), vrow(3, 5))).unwrap(),
            vec![Change::edit(vrow(3, 30), vrow(3, 5))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [3, 1, 2]);
        // the bound is now row 2
        assert_eq!(
            take.push(add(vrow(6, 15))).unwrap(),
            vec![Change::remove(vrow(2, 20)), Change::add(vrow(6, 15))]
        );
    }

    #[test]
    fn edit_bound_stays_bound() {
        let mut take = by_val(3);
        assert_eq!(
            take.push(edit(vrow(3, 30), vrow(3, 35))).unwrap(),
            vec![Change::edit(vrow(3, 30), vrow(3, 35))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 2, 3]);
    }

    #[test]
    fn edit_bound_past_next_row() {
        let mut take = by_val(3);
        assert_eq!(
            take.push(edit(vrow(3, 30), vrow(3, 45))).unwrap(),
            vec![Change::remove(vrow(3, 30)), Change::add(vrow(4, 40))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 2, 4]);
    }

    #[test]
    fn edit_leaves_window() {
        let mut take = by_val(3);
        assert_eq!(
            take.push(edit(vrow(1, 10), vrow(1, 45))).unwrap(),
            vec![Change::remove(vrow(1, 10)), Change::add(vrow(4, 40))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [2, 3, 4]);
        // moving just past the bound keeps the row as the new bound
        assert_eq!(
            take.push(edit(vrow(2, 20), vrow(2, 41))).unwrap(),
            vec![Change::edit(vrow(2, 20), vrow(2, 41))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [3, 4, 2]);
    }

    #[test]
    fn edit_enters_window() {
        let mut take = by_val(3);
        assert_eq!(
            take.push(edit(vrow(5, 50), vrow(5, 15))).unwrap(),
            vec![Change::remove(vrow(3, 30)), Change::add(vrow(5, 15))]
        );
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 5, 2]);
    }

    #[test]
    fn partitions_are_independent() {
        let source = MemorySource::new("t", ["id"])
            .with_rows([prow(1, 1, 0), prow(2, 1, 0), prow(3, 2, 0), prow(4, 2, 0)])
            .unwrap();
        let mut take = Take::new(source, MemoryStorage::new(), 1, Some("part".into())).unwrap();
        assert_eq!(ids(&mut take, FetchRequest::constrained("part", 1)), [1]);

        // partition 2 was never fetched
        assert_eq!(take.push(add(prow(0, 2, 0))).unwrap(), vec![]);
        assert_eq!(
            take.push(add(prow(-1, 1, 0))).unwrap(),
            vec![Change::remove(prow(1, 1, 0)), Change::add(prow(-1, 1, 0))]
        );

        assert_eq!(ids(&mut take, FetchRequest::constrained("part", 2)), [0]);
        // unconstrained fetches check every row against its own partition
        assert_eq!(ids(&mut take, FetchRequest::default()), [-1, 0]);

        // moving a row to another partition is a remove and an add
        assert_eq!(
            take.push(edit(prow(-1, 1, 0), prow(-1, 2, 0))).unwrap(),
            vec![
                Change::remove(prow(-1, 1, 0)),
                Change::add(prow(1, 1, 0)),
                Change::remove(prow(0, 2, 0)),
                Change::add(prow(-1, 2, 0)),
            ]
        );
    }

    #[test]
    fn cleanup_drops_state() {
        let source = MemorySource::new("t", ["id"])
            .with_rows([prow(1, 1, 0), prow(2, 1, 0), prow(3, 2, 0)])
            .unwrap();
        let storage = MemoryStorage::new();
        let mut take = Take::new(source, storage, 5, Some("part".into())).unwrap();
        assert_eq!(ids(&mut take, FetchRequest::constrained("part", 1)), [1, 2]);

        let cleaned: Vec<_> = take
            .cleanup(FetchRequest::constrained("part", 1))
            .unwrap()
            .map(|n| n.row["id"].clone())
            .collect();
        assert_eq!(cleaned, vec![json!(1), json!(2)]);
        assert_eq!(take.get_state(&Take::state_key(Some(&json!(1)))).unwrap(), None);
        assert_eq!(take.max_bound().unwrap(), None);
        assert_eq!(ids(&mut take, FetchRequest::default()), Vec::<i64>::new());
        assert!(matches!(
            take.cleanup(FetchRequest::constrained("part", 1)),
            Err(OperatorError::MissingTakeState { .. })
        ));
        // no longer maintained
        assert_eq!(take.push(add(prow(0, 1, 0))).unwrap(), vec![]);
    }

    #[test]
    fn cleanup_keeps_max_bound_of_remaining_partitions() {
        let source = MemorySource::new("t", ["id"])
            .with_rows([prow(1, 1, 0), prow(2, 1, 0), prow(3, 2, 0), prow(4, 2, 0)])
            .unwrap();
        let mut take = Take::new(source, MemoryStorage::new(), 1, Some("part".into())).unwrap();
        assert_eq!(ids(&mut take, FetchRequest::constrained("part", 1)), [1]);
        assert_eq!(ids(&mut take, FetchRequest::constrained("part", 2)), [3]);
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 3]);

        take.cleanup(FetchRequest::constrained("part", 2))
            .unwrap()
            .for_each(drop);
        assert_eq!(take.max_bound().unwrap(), Some(prow(3, 2, 0)));
        assert_eq!(ids(&mut take, FetchRequest::default()), [1]);
    }

    #[test]
    fn ordering_must_end_with_primary_key() {
        let source =
            MemorySource::new("t", ["id"]).with_sort(vec![("val".into(), Direction::Asc)]);
        assert!(matches!(
            Take::new(source, MemoryStorage::new(), 1, None),
            Err(OperatorError::OrderingMissingPrimaryKey { .. })
        ));
        let source = MemorySource::new("t", ["id"]);
        assert!(matches!(
            Take::new(source, MemoryStorage::new(), 1, Some(String::new())),
            Err(OperatorError::InvalidPartitionKey { .. })
        ));
    }

    /// Turns edits into child changes of the edited row.
    #[derive(Debug)]
    struct ChildChanges(MemorySource);

    impl Operator for ChildChanges {
        fn schema(&self) -> &SourceSchema {
            self.0.schema()
        }

        fn fetch(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
            self.0.fetch(req)
        }

        fn cleanup(&mut self, req: FetchRequest) -> Result<Stream<'_>, OperatorError> {
            self.0.cleanup(req)
        }

        fn push(&mut self, change: SourceChange) -> Result<Vec<Change>, OperatorError> {
            let SourceChange::Edit { row, .. } = change else {
                return self.0.push(change);
            };
            Ok(vec![Change::Child {
                row: row.clone(),
                child: ChildChange {
                    relationship_name: "comments".into(),
                    change: Box::new(Change::add(row)),
                },
            }])
        }
    }

    #[test]
    fn child_changes_inside_window() {
        let source = MemorySource::new("t", ["id"])
            .with_rows((1..=3).map(row))
            .unwrap();
        let mut take = Take::new(ChildChanges(source), MemoryStorage::new(), 2, None).unwrap();
        assert_eq!(ids(&mut take, FetchRequest::default()), [1, 2]);
        assert_eq!(take.push(edit(row(2), row(2))).unwrap().len(), 1);
        assert_eq!(take.push(edit(row(3), row(3))).unwrap(), vec![]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { part: i64, val: i64 },
        Remove { pick: usize },
        Edit { pick: usize, part: i64, val: i64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3i64, 0..20i64).prop_map(|(part, val)| Op::Add { part, val }),
            any::<usize>().prop_map(|pick| Op::Remove { pick }),
            (any::<usize>(), 0..3i64, 0..20i64)
                .prop_map(|(pick, part, val)| Op::Edit { pick, part, val }),
        ]
    }

    /// Inserts `row`, keeping `window` sorted by (val, id).
    fn insert(window: &mut Vec<Row>, row: Row) {
        window.push(row);
        window.sort_by_key(|r| (r["val"].as_i64(), r["id"].as_i64()));
    }

    fn remove_id(window: &mut Vec<Row>, id: &Value) {
        window.retain(|r| &r["id"] != id);
    }

    proptest! {
        #[test]
        fn window_is_smallest_rows_per_partition(
            limit in 1usize..4,
            initial in prop::collection::vec((0..3i64, 0..20i64), 0..10),
            ops in prop::collection::vec(op(), 0..40),
        ) {
            let mut model: BTreeMap<i64, Row> = BTreeMap::new();
            let mut next_id = 0;
            for (part, val) in initial {
                model.insert(next_id, prow(next_id, part, val));
                next_id += 1;
            }
            let source = MemorySource::new("t", ["id"])
                .with_sort(vec![("val".into(), Direction::Asc), ("id".into(), Direction::Asc)])
                .with_rows(model.values().cloned())
                .unwrap();
            let mut take =
                Take::new(source, MemoryStorage::new(), limit, Some("part".into())).unwrap();

            let mut windows: BTreeMap<i64, Vec<Row>> = BTreeMap::new();
            for part in 0..3 {
                let rows = take
                    .fetch(FetchRequest::constrained("part", part))
                    .unwrap()
                    .map(|n| n.row)
                    .collect();
                windows.insert(part, rows);
            }

            for op in ops {
                let change = match op {
                    Op::Add { part, val } => {
                        let row = prow(next_id, part, val);
                        model.insert(next_id, row.clone());
                        next_id += 1;
                        add(row)
                    }
                    Op::Remove { pick } => {
                        if model.is_empty() {
                            continue;
                        }
                        let id = *model.keys().nth(pick % model.len()).unwrap();
                        remove(model.remove(&id).unwrap())
                    }
                    Op::Edit { pick, part, val } => {
                        if model.is_empty() {
                            continue;
                        }
                        let id = *model.keys().nth(pick % model.len()).unwrap();
                        let row = prow(id, part, val);
                        let old_row = model.insert(id, row.clone()).unwrap();
                        edit(old_row, row)
                    }
                };
                for change in take.push(change).unwrap() {
                    match change {
                        Change::Add { node } => {
                            let part = node.row["part"].as_i64().unwrap();
                            insert(windows.get_mut(&part).unwrap(), node.row);
                        }
                        Change::Remove { node } => {
                            let part = node.row["part"].as_i64().unwrap();
                            let window = windows.get_mut(&part).unwrap();
                            prop_assert!(window.contains(&node.row));
                            remove_id(window, &node.row["id"]);
                        }
                        Change::Edit { old_node, node } => {
                            let part = old_node.row["part"].as_i64().unwrap();
                            let window = windows.get_mut(&part).unwrap();
                            prop_assert!(window.contains(&old_node.row));
                            remove_id(window, &old_node.row["id"]);
                            insert(window, node.row);
                        }
                        Change::Child { .. } => prop_assert!(false, "unexpected child change"),
                    }
                }
                for window in windows.values() {
                    prop_assert!(window.len() <= limit);
                }
            }

            for part in 0..3 {
                let mut expected: Vec<Row> = model
                    .values()
                    .filter(|r| r["part"] == json!(part))
                    .cloned()
                    .collect();
                expected.sort_by_key(|r| (r["val"].as_i64(), r["id"].as_i64()));
                expected.truncate(limit);
                prop_assert_eq!(&windows[&part], &expected);
                let fetched: Vec<Row> = take
                    .fetch(FetchRequest::constrained("part", part))
                    .unwrap()
                    .map(|n| n.row)
                    .collect();
                prop_assert_eq!(&fetched, &expected);
            }
        }

        #[test]
        fn add_below_bound_replaces_bound(
            limit in 1usize..5,
            ids in prop::collection::btree_set(1..100i64, 1..12),
        ) {
            let rows: Vec<i64> = ids.into_iter().collect();
            let source = MemorySource::new("t", ["id"])
                .with_rows(rows.iter().copied().map(row))
                .unwrap();
            let mut take = take_ids(source, limit);
            let window: Vec<i64> = ids_of(&mut take);
            prop_assume!(window.len() == limit);
            let bound = *window.last().unwrap();

            let changes = take.push(add(row(0))).unwrap();
            prop_assert_eq!(changes, vec![Change::remove(row(bound)), Change::add(row(0))]);
            let mut expected = vec![0];
            expected.extend(&window[..limit - 1]);
            prop_assert_eq!(ids_of(&mut take), expected);
        }
    }

    fn ids_of(take: &mut Take) -> Vec<i64> {
        ids(take, FetchRequest::default())
    }
}
