//! Shared helpers: little-endian I/O, graph infrastructure and DOT rendering.

mod dot;
pub mod graph;
pub mod io;

pub use dot::escape_dot;
