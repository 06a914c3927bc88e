//! Diagnostics collected during devirtualization.
//!
//! Inference over protected code runs into plenty of situations that are worth reporting
//! but should not abort the run: a callee without a known exit key, keys diverging at a join
//! point, an export that fails to resolve a branch. These are recorded as [`Diagnostic`]s in
//! a shared [`Diagnostics`] sink instead of being logged to a global logger.
//!
//! # Thread Safety
//!
//! [`Diagnostics`] appends through a lock-free `boxcar::Vec` and can be shared across the
//! rayon workers that process exports in parallel.
//!
//! # Examples
//!
//! ```rust
//! use vmscope::diagnostics::{DiagnosticCategory, DiagnosticSeverity, Diagnostics};
//!
//! let diagnostics = Diagnostics::with_min_severity(DiagnosticSeverity::Info);
//! diagnostics.debug(DiagnosticCategory::Inference, "dropped below the threshold");
//! diagnostics.warning(DiagnosticCategory::Inference, "key divergence at 0x0040");
//!
//! assert_eq!(diagnostics.count(), 1);
//! assert!(diagnostics.has_warnings());
//! ```

use std::fmt::{self, Write};

/// Severity of a diagnostic, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    /// Step-by-step tracing, e.g. every resolved branch
    Debug,
    /// Progress information, e.g. export start and finish
    Info,
    /// Suspicious but recoverable condition
    Warning,
    /// A failed export
    Error,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Debug => write!(f, "DEBUG"),
            DiagnosticSeverity::Info => write!(f, "INFO"),
            DiagnosticSeverity::Warning => write!(f, "WARN"),
            DiagnosticSeverity::Error => write!(f, "ERROR"),
        }
    }
}

/// The component that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCategory {
    /// Stream decoding
    Decoder,
    /// Worklist inference
    Inference,
    /// Dependency evaluation
    Evaluator,
    /// Control flow graph construction
    Graph,
    /// Export level processing in the driver
    Export,
    /// Anything else
    General,
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticCategory::Decoder => write!(f, "Decoder"),
            DiagnosticCategory::Inference => write!(f, "Inference"),
            DiagnosticCategory::Evaluator => write!(f, "Evaluator"),
            DiagnosticCategory::Graph => write!(f, "Graph"),
            DiagnosticCategory::Export => write!(f, "Export"),
            DiagnosticCategory::General => write!(f, "General"),
        }
    }
}

/// A single diagnostic event.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity
    pub severity: DiagnosticSeverity,
    /// Producing component
    pub category: DiagnosticCategory,
    /// Human readable message
    pub message: String,
    /// Export being processed, if any
    pub export: Option<u32>,
    /// Bytecode offset, if any
    pub offset: Option<u64>,
}

impl Diagnostic {
    /// Creates a diagnostic without export or offset context.
    pub fn new(
        severity: DiagnosticSeverity,
        category: DiagnosticCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            export: None,
            offset: None,
        }
    }

    /// Attaches the export id.
    #[must_use]
    pub fn with_export(mut self, export: u32) -> Self {
        self.export = Some(export);
        self
    }

    /// Attaches a bytecode offset.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.message)?;

        if let Some(export) = self.export {
            write!(f, " (export: {export})")?;
        }

        if let Some(offset) = self.offset {
            write!(f, " (offset: 0x{offset:08x})")?;
        }

        Ok(())
    }
}

/// Append-only, thread-safe collection of [`Diagnostic`]s.
#[derive(Debug)]
pub struct Diagnostics {
    entries: boxcar::Vec<Diagnostic>,
    min_severity: DiagnosticSeverity,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Creates a sink recording every severity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_min_severity(DiagnosticSeverity::Debug)
    }

    /// Creates a sink that drops diagnostics below `min_severity`.
    #[must_use]
    pub fn with_min_severity(min_severity: DiagnosticSeverity) -> Self {
        Self {
            entries: boxcar::Vec::new(),
            min_severity,
        }
    }

    /// Returns `true` if diagnostics of `severity` are recorded. Lets callers skip building
    /// expensive messages.
    #[must_use]
    pub fn enabled(&self, severity: DiagnosticSeverity) -> bool {
        severity >= self.min_severity
    }

    /// Records a debug diagnostic.
    pub fn debug(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticSeverity::Debug, category, message));
    }

    /// Records an info diagnostic.
    pub fn info(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticSeverity::Info, category, message));
    }

    /// Records a warning.
    pub fn warning(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Warning,
            category,
            message,
        ));
    }

    /// Records an error.
    pub fn error(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Error,
            category,
            message,
        ));
    }

    /// Records `diagnostic` unless it is below the minimum severity.
    pub fn push(&self, diagnostic: Diagnostic) {
        if self.enabled(diagnostic.severity) {
            self.entries.push(diagnostic);
        }
    }

    /// Returns `true` if anything was recorded.
    pub fn has_any(&self) -> bool {
        self.entries.count() > 0
    }

    /// Returns `true` if an error was recorded.
    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, d)| d.severity == DiagnosticSeverity::Error)
    }

    /// Returns `true` if a warning was recorded.
    pub fn has_warnings(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, d)| d.severity == DiagnosticSeverity::Warning)
    }

    /// Number of recorded diagnostics.
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    /// Number of recorded diagnostics of `severity`.
    pub fn count_of(&self, severity: DiagnosticSeverity) -> usize {
        self.entries
            .iter()
            .filter(|(_, d)| d.severity == severity)
            .count()
    }

    /// Iterates over all diagnostics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|(_, d)| d)
    }

    /// All errors.
    pub fn errors(&self) -> Vec<&Diagnostic> {
        self.by_severity(DiagnosticSeverity::Error)
    }

    /// All warnings.
    pub fn warnings(&self) -> Vec<&Diagnostic> {
        self.by_severity(DiagnosticSeverity::Warning)
    }

    /// All diagnostics of `severity`.
    pub fn by_severity(&self, severity: DiagnosticSeverity) -> Vec<&Diagnostic> {
        self.iter().filter(|d| d.severity == severity).collect()
    }

    /// All diagnostics of `category`.
    pub fn by_category(&self, category: DiagnosticCategory) -> Vec<&Diagnostic> {
        self.iter().filter(|d| d.category == category).collect()
    }

    /// All diagnostics attached to `export`.
    pub fn by_export(&self, export: u32) -> Vec<&Diagnostic> {
        self.iter().filter(|d| d.export == Some(export)).collect()
    }

    /// Renders counts followed by every error and warning.
    pub fn summary(&self) -> String {
        let mut output = String::new();

        let error_count = self.count_of(DiagnosticSeverity::Error);
        let warning_count = self.count_of(DiagnosticSeverity::Warning);
        let info_count = self.count_of(DiagnosticSeverity::Info);
        let debug_count = self.count_of(DiagnosticSeverity::Debug);

        let _ = writeln!(
            output,
            "Diagnostics: {error_count} error(s), {warning_count} warning(s), {info_count} info(s), {debug_count} debug"
        );

        if error_count > 0 {
            output.push_str("\nErrors:\n");
            for diag in self.errors() {
                let _ = writeln!(output, "  {diag}");
            }
        }

        if warning_count > 0 {
            output.push_str("\nWarnings:\n");
            for diag in self.warnings() {
                let _ = writeln!(output, "  {diag}");
            }
        }

        output
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn diagnostic_context() {
        let diag = Diagnostic::new(
            DiagnosticSeverity::Warning,
            DiagnosticCategory::Inference,
            "key divergence",
        )
        .with_export(3)
        .with_offset(0x40);

        let display = diag.to_string();
        assert!(display.contains("WARN"));
        assert!(display.contains("Inference"));
        assert!(display.contains("(export: 3)"));
        assert!(display.contains("0x00000040"));
    }

    #[test]
    fn container_counts() {
        let diagnostics = Diagnostics::new();

        diagnostics.debug(DiagnosticCategory::Evaluator, "resolved");
        diagnostics.info(DiagnosticCategory::General, "start");
        diagnostics.warning(DiagnosticCategory::Inference, "divergence");
        diagnostics.error(DiagnosticCategory::Export, "failed");

        assert_eq!(diagnostics.count(), 4);
        assert_eq!(diagnostics.count_of(DiagnosticSeverity::Debug), 1);
        assert_eq!(diagnostics.errors().len(), 1);
        assert_eq!(diagnostics.warnings().len(), 1);
        assert!(diagnostics.has_errors());
        assert!(diagnostics.summary().contains("1 error(s)"));
    }

    #[test]
    fn min_severity_filters() {
        let diagnostics = Diagnostics::with_min_severity(DiagnosticSeverity::Warning);

        diagnostics.debug(DiagnosticCategory::Inference, "dropped");
        diagnostics.info(DiagnosticCategory::Inference, "dropped");
        diagnostics.warning(DiagnosticCategory::Inference, "kept");

        assert_eq!(diagnostics.count(), 1);
        assert!(!diagnostics.enabled(DiagnosticSeverity::Info));
        assert!(diagnostics.enabled(DiagnosticSeverity::Error));
    }

    #[test]
    fn filters_by_category_and_export() {
        let diagnostics = Diagnostics::new();

        diagnostics.push(
            Diagnostic::new(DiagnosticSeverity::Info, DiagnosticCategory::Graph, "a")
                .with_export(1),
        );
        diagnostics.push(
            Diagnostic::new(DiagnosticSeverity::Info, DiagnosticCategory::Graph, "b")
                .with_export(2),
        );
        diagnostics.push(Diagnostic::new(
            DiagnosticSeverity::Info,
            DiagnosticCategory::Decoder,
            "c",
        ));

        assert_eq!(diagnostics.by_category(DiagnosticCategory::Graph).len(), 2);
        assert_eq!(diagnostics.by_export(2).len(), 1);
        assert_eq!(diagnostics.by_export(2)[0].message, "b");
    }

    #[test]
    fn thread_safety() {
        let diagnostics = Arc::new(Diagnostics::new());
        let mut handles = vec![];

        for i in 0..10 {
            let diag_clone = Arc::clone(&diagnostics);
            handles.push(thread::spawn(move || {
                diag_clone.warning(DiagnosticCategory::General, format!("thread {i}"));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(diagnostics.count(), 10);
    }
}
