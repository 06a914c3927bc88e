//! Instruction-provenance values.
//!
//! Inference does not track concrete values. Each stack slot and register instead holds the
//! set of instructions that may have produced its current value. When two paths meet, the
//! sets are unioned. An empty set means the value originates outside the function (an
//! argument, or a calling-convention register).

use std::{collections::BTreeSet, fmt};

/// The set of instruction offsets a value may originate from.
///
/// Merging only ever adds offsets, which bounds the fixpoint iteration: every export has
/// finitely many instructions, so every value can grow only finitely often.
///
/// # Examples
///
/// ```rust
/// use vmscope::analysis::SymbolicValue;
///
/// let mut value = SymbolicValue::from_offset(0x10);
/// assert!(value.merge(&SymbolicValue::from_offset(0x20)));
/// assert!(!value.merge(&SymbolicValue::from_offset(0x10)));
/// assert_eq!(value.iter().collect::<Vec<_>>(), vec![0x10, 0x20]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SymbolicValue {
    sources: BTreeSet<u64>,
}

impl SymbolicValue {
    /// A value of unknown, external origin.
    #[must_use]
    pub fn unknown() -> Self {
        Self::default()
    }

    /// A value produced by the instruction at `offset`.
    #[must_use]
    pub fn from_offset(offset: u64) -> Self {
        SymbolicValue {
            sources: BTreeSet::from([offset]),
        }
    }

    /// Unions `other` into `self`. Returns `true` if `self` grew.
    pub fn merge(&mut self, other: &SymbolicValue) -> bool {
        let before = self.sources.len();
        self.sources.extend(other.sources.iter().copied());
        self.sources.len() != before
    }

    /// Returns `true` if every source of `self` is also a source of `other`.
    #[must_use]
    pub fn is_subset(&self, other: &SymbolicValue) -> bool {
        self.sources.is_subset(&other.sources)
    }

    /// Returns `true` if nothing is known about the origin.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.sources.is_empty()
    }

    /// Returns the single source offset, if there is exactly one.
    #[must_use]
    pub fn single(&self) -> Option<u64> {
        if self.sources.len() == 1 {
            self.sources.first().copied()
        } else {
            None
        }
    }

    /// Number of possible sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if there are no sources. Same as [`SymbolicValue::is_unknown`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Source offsets in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.sources.iter().copied()
    }
}

impl FromIterator<u64> for SymbolicValue {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        SymbolicValue {
            sources: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for SymbolicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sources.is_empty() {
            return f.write_str("?");
        }

        f.write_str("{")?;
        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{source:04x}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_monotone() {
        let mut value = SymbolicValue::unknown();
        let steps = [
            SymbolicValue::from_offset(4),
            SymbolicValue::from_iter([2, 4]),
            SymbolicValue::unknown(),
            SymbolicValue::from_offset(8),
        ];

        let mut previous = value.clone();
        for step in &steps {
            value.merge(step);
            assert!(previous.is_subset(&value));
            assert!(step.is_subset(&value));
            previous = value.clone();
        }
        assert_eq!(value.len(), 3);
    }

    #[test]
    fn merge_reports_growth() {
        let mut value = SymbolicValue::from_iter([1, 2]);
        assert!(!value.merge(&SymbolicValue::from_offset(2)));
        assert!(!value.merge(&SymbolicValue::unknown()));
        assert!(value.merge(&SymbolicValue::from_offset(3)));
    }

    #[test]
    fn single_source() {
        assert_eq!(SymbolicValue::from_offset(9).single(), Some(9));
        assert_eq!(SymbolicValue::unknown().single(), None);
        assert_eq!(SymbolicValue::from_iter([1, 2]).single(), None);
    }

    #[test]
    fn display() {
        assert_eq!(SymbolicValue::unknown().to_string(), "?");
        assert_eq!(SymbolicValue::from_iter([0x20, 0x1a]).to_string(), "{001a, 0020}");
    }
}
