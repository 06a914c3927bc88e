use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! decode_error {
    ($offset:expr, $msg:expr) => {
        crate::Error::Decode {
            offset: $offset,
            message: $msg.to_string(),
        }
    };

    ($offset:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::Decode {
            offset: $offset,
            message: format!($fmt, $($arg)*),
        }
    };
}

macro_rules! unresolvable_error {
    ($offset:expr, $msg:expr) => {
        crate::Error::Unresolvable {
            offset: $offset,
            message: $msg.to_string(),
        }
    };

    ($offset:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::Unresolvable {
            offset: $offset,
            message: format!($fmt, $($arg)*),
        }
    };
}

macro_rules! consistency_error {
    ($offset:expr, $msg:expr) => {
        crate::Error::StateConsistency {
            offset: $offset,
            message: $msg.to_string(),
        }
    };

    ($offset:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::StateConsistency {
            offset: $offset,
            message: format!($fmt, $($arg)*),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into two groups. Most errors only concern the export that is currently
/// being disassembled: the driver catches them at the export boundary and records them as an
/// [`crate::devirtualizer::ExportFailure`], while the remaining exports are still processed.
/// A small set of errors indicate that the run as a whole cannot be trusted (an incomplete
/// opcode table, or a state consistency violation which implies a systemic key or table
/// error). Those are reported by [`Error::is_fatal`] and abort the entire run.
///
/// # Error Categories
///
/// ## Per-export errors
/// - [`Error::Decode`] - Unknown opcode/register byte or truncated operand read
/// - [`Error::Unresolvable`] - A computed operand could not be reduced to a concrete value
/// - [`Error::StackUnderflow`] - An instruction pops more slots than the symbolic stack holds
/// - [`Error::IterationLimit`] - The worklist exceeded the configured iteration ceiling
/// - [`Error::ReferenceNotFound`] - A vcall refers to an unknown metadata reference
///
/// ## Fatal errors
/// - [`Error::StateConsistency`] - Stack depth or EH stack mismatch at a join point
/// - [`Error::IncompleteTable`] - The byte to semantic table is not total
///
/// ## General errors
/// - [`Error::Malformed`] - Corrupted or invalid input structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the blob boundaries
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::ExportNotFound`] - Requested export id is not part of the export table
/// - [`Error::GraphError`] - Control flow graph construction error
///
/// # Examples
///
/// ```rust,no_run
/// use vmscope::Error;
///
/// fn report(error: &Error) {
///     match error {
///         Error::Unresolvable { offset, message } => {
///             eprintln!("cannot resolve operand at 0x{offset:08x}: {message}");
///         }
///         e if e.is_fatal() => eprintln!("run aborted: {e}"),
///         e => eprintln!("export failed: {e}"),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is damaged and could not be processed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading the bytecode blob.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// The byte to semantic table is missing or duplicating an entry.
    ///
    /// Raised when the [`crate::vm::OpcodeTable`] is built, before any byte is decoded.
    /// Disassembly cannot begin without a total table.
    #[error("Incomplete opcode table - {kind}: {message}")]
    IncompleteTable {
        /// Which enumeration of the table is affected (opcode, register, ...)
        kind: &'static str,
        /// Description of the missing or conflicting entry
        message: String,
    },

    /// An instruction could not be decoded.
    ///
    /// Either the decrypted opcode or register byte has no mapping, or the stream ended in
    /// the middle of an operand.
    #[error("Decode error at 0x{offset:08x}: {message}")]
    Decode {
        /// Offset of the instruction that failed to decode
        offset: u64,
        /// Description of the failure
        message: String,
    },

    /// A computed operand (jump target, call address, vcall id, ...) could not be reduced
    /// to a concrete value by the dependency evaluator.
    #[error("Unresolvable operand at 0x{offset:08x}: {message}")]
    Unresolvable {
        /// Offset of the instruction consuming the operand
        offset: u64,
        /// Description of the failure
        message: String,
    },

    /// An instruction pops more values than the symbolic stack holds.
    #[error("Stack underflow at 0x{offset:08x}")]
    StackUnderflow {
        /// Offset of the underflowing instruction
        offset: u64,
    },

    /// Two program states that meet at the same offset disagree on stack depth or on the
    /// exception handler stack.
    ///
    /// The VM calling convention guarantees fixed stack effects, so a mismatch implies a
    /// systemic decoding or key error. This aborts the entire run.
    #[error("State consistency violation at 0x{offset:08x}: {message}")]
    StateConsistency {
        /// Offset of the join point
        offset: u64,
        /// Description of the mismatch
        message: String,
    },

    /// The inference worklist exceeded the configured iteration ceiling.
    ///
    /// The associated value shows the limit that was reached.
    #[error("Reached the maximum number of inference iterations - {0}")]
    IterationLimit(usize),

    /// A vcall refers to a metadata reference id that is not part of the reference table.
    #[error("Reference 0x{id:08x} used at 0x{offset:08x} not found")]
    ReferenceNotFound {
        /// The reference id
        id: u32,
        /// Offset of the consuming instruction
        offset: u64,
    },

    /// The requested export id is not part of the export table.
    #[error("Export {0} not found")]
    ExportNotFound(u32),

    /// Control flow graph construction error.
    #[error("{0}")]
    GraphError(String),
}

impl Error {
    /// Returns `true` if this error invalidates the entire run rather than a single export.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use vmscope::Error;
    ///
    /// assert!(!Error::StackUnderflow { offset: 4 }.is_fatal());
    /// assert!(Error::StateConsistency { offset: 4, message: String::new() }.is_fatal());
    /// ```
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StateConsistency { .. } | Error::IncompleteTable { .. }
        )
    }

    /// Returns the bytecode offset associated with this error, if any.
    #[must_use]
    pub const fn offset(&self) -> Option<u64> {
        match self {
            Error::Decode { offset, .. }
            | Error::Unresolvable { offset, .. }
            | Error::StackUnderflow { offset }
            | Error::StateConsistency { offset, .. }
            | Error::ReferenceNotFound { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}
