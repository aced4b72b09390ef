//! Changes flowing through a pipeline.

use crate::data::{Node, Row};

/// A change to the output of an operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A row was added.
    Add {
        /// The added node.
        node: Node,
    },
    /// A row was removed.
    Remove {
        /// The removed node.
        node: Node,
    },
    /// The row changed in place. Its primary key is the same.
    Edit {
        /// The node before the edit.
        old_node: Node,
        /// The node after the edit.
        node: Node,
    },
    /// Something changed among the rows related to `row`.
    Child {
        /// The row whose relationship changed.
        row: Row,
        /// What changed in the relationship.
        child: ChildChange,
    },
}

/// A change below a node, in one of its relationships.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChange {
    /// Name of the relationship the change happened in.
    pub relationship_name: String,
    /// The change to the related rows.
    pub change: Box<Change>,
}

impl Change {
    /// An addition of `row`, without relationships.
    pub fn add(row: Row) -> Self {
        Self::Add {
            node: Node::new(row),
        }
    }

    /// A removal of `row`.
    pub fn remove(row: Row) -> Self {
        Self::Remove {
            node: Node::new(row),
        }
    }

    /// An edit of `old_row` into `row`.
    pub fn edit(old_row: Row, row: Row) -> Self {
        Self::Edit {
            old_node: Node::new(old_row),
            node: Node::new(row),
        }
    }

    /// The row this change is about. For edits, the new row.
    pub fn row(&self) -> &Row {
        match self {
            Self::Add { node } | Self::Remove { node } | Self::Edit { node, .. } => &node.row,
            Self::Child { row, .. } => row,
        }
    }
}

/// A change applied to a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChange {
    /// Inserts a row. Its primary key must be new.
    Add {
        /// The new row.
        row: Row,
    },
    /// Deletes the row with the primary key of `row`.
    Remove {
        /// The row to delete.
        row: Row,
    },
    /// Replaces `old_row` with `row`.
    Edit {
        /// The row as it is in the source.
        old_row: Row,
        /// The replacement.
        row: Row,
    },
}
