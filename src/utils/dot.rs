//! DOT format helpers for Graphviz rendering.

/// Escapes a string for use inside a quoted DOT label.
///
/// # Examples
///
/// ```rust
/// use vmscope::utils::escape_dot;
///
/// assert_eq!(escape_dot("CALL \"x\""), "CALL \\\"x\\\"");
/// assert_eq!(escape_dot("List<T>"), "List\\<T\\>");
/// ```
#[must_use]
pub fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "")
        .replace('<', "\\<")
        .replace('>', "\\>")
        .replace('{', "\\{")
        .replace('}', "\\}")
        .replace('|', "\\|")
}
