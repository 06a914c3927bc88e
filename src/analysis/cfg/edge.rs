//! Control flow edge types for the CFG.

use std::fmt;

use crate::vm::EhType;

/// The kind of control flow represented by an edge.
///
/// # Examples
///
/// ```rust
/// use vmscope::analysis::CfgEdgeKind;
///
/// let kind = CfgEdgeKind::JumpArm { index: 1 };
/// assert_eq!(kind.arm(), Some(1));
/// assert!(!kind.is_exceptional());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfgEdgeKind {
    /// Sequential flow into the block that starts where this one ends.
    ///
    /// This includes the continuation after `CALL`, `TRY`, `LEAVE` and helper calls, since
    /// none of those transfer control within the export.
    Fallthrough,

    /// One resolved candidate of `JMP`, `JZ`/`JNZ` or `SWT`.
    ///
    /// `index` is the position of the target in the jump annotation. For conditional jumps
    /// and switches the fallthrough is the last arm.
    JumpArm {
        /// Position of the target in the jump annotation
        index: usize,
    },

    /// Entry of an exception handler or filter, from the block holding the `TRY`.
    ExceptionHandler {
        /// Handler kind of the protected region
        kind: EhType,
    },
}

impl CfgEdgeKind {
    /// Arm index, if this is a jump arm.
    #[must_use]
    pub const fn arm(&self) -> Option<usize> {
        match self {
            Self::JumpArm { index } => Some(*index),
            _ => None,
        }
    }

    /// Returns `true` for exception handler entries.
    #[must_use]
    pub const fn is_exceptional(&self) -> bool {
        matches!(self, Self::ExceptionHandler { .. })
    }
}

impl fmt::Display for CfgEdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfgEdgeKind::Fallthrough => Ok(()),
            CfgEdgeKind::JumpArm { index } => write!(f, "arm {index}"),
            CfgEdgeKind::ExceptionHandler { kind } => write!(f, "{kind}"),
        }
    }
}

/// An edge in the control flow graph.
///
/// # Examples
///
/// ```rust
/// use vmscope::analysis::{CfgEdge, CfgEdgeKind};
///
/// let edge = CfgEdge::arm(0x40, 0);
/// assert_eq!(edge.target(), 0x40);
/// assert_eq!(edge.kind(), CfgEdgeKind::JumpArm { index: 0 });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CfgEdge {
    /// Start offset of the target block
    target: u64,
    kind: CfgEdgeKind,
}

impl CfgEdge {
    /// Creates an edge into the block starting at `target`.
    #[must_use]
    pub const fn new(target: u64, kind: CfgEdgeKind) -> Self {
        Self { target, kind }
    }

    /// A fallthrough edge.
    #[must_use]
    pub const fn fallthrough(target: u64) -> Self {
        Self::new(target, CfgEdgeKind::Fallthrough)
    }

    /// A jump arm edge.
    #[must_use]
    pub const fn arm(target: u64, index: usize) -> Self {
        Self::new(target, CfgEdgeKind::JumpArm { index })
    }

    /// Start offset of the target block.
    #[must_use]
    pub const fn target(&self) -> u64 {
        self.target
    }

    /// The kind of control flow this edge represents.
    #[must_use]
    pub const fn kind(&self) -> CfgEdgeKind {
        self.kind
    }
}
