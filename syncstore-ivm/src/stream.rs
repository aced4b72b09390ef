//! Sorted node streams.

use crate::data::Node;

/// Nodes in the order of the schema of the operator that produced them.
pub type Stream<'a> = Box<dyn Iterator<Item = Node> + 'a>;

/// A stream without nodes.
pub fn empty<'a>() -> Stream<'a> {
    Box::new(std::iter::empty())
}

/// A stream of `nodes`, which must already be sorted.
pub fn from_nodes<'a>(nodes: Vec<Node>) -> Stream<'a> {
    Box::new(nodes.into_iter())
}
