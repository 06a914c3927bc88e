//! Generic directed graph infrastructure.
//!
//! The control flow graphs produced by [`crate::analysis::cfg`] are built on top of the
//! [`DirectedGraph`] defined here. Algorithms are written against the small [`Successors`]
//! and [`Predecessors`] traits so they work on any graph-shaped type.

mod directed;
mod edge;
mod node;
mod traversal;

pub use directed::DirectedGraph;
pub use edge::EdgeId;
pub use node::NodeId;
pub use traversal::{dfs, postorder, reverse_postorder, DfsIterator};

/// A graph whose outgoing neighbours can be enumerated.
pub trait Successors {
    /// Total number of nodes, used to size visited sets.
    fn node_count(&self) -> usize;

    /// Direct successors of `node`, in edge insertion order.
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_;
}

/// A graph whose incoming neighbours can be enumerated.
pub trait Predecessors {
    /// Direct predecessors of `node`, in edge insertion order.
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_;
}
