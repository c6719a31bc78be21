//! Built-in text collations.
//!
//! `BINARY` compares raw bytes, `NOCASE` folds ASCII case, `RTRIM` ignores
//! trailing spaces. Custom collations are registered on the database and
//! resolved by name through the collation registry; the key codec only ever
//! sees the built-ins (a custom collation encodes binary and is re-checked
//! by the residual comparator).

use std::borrow::Cow;
use std::cmp::Ordering;

/// One of the engine's built-in collations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextCollation {
    #[default]
    Binary,
    NoCase,
    RTrim,
}

impl TextCollation {
    /// Resolve a built-in collation by name (case-insensitive).
    /// Returns `None` for unknown names, which the caller resolves through
    /// the collation registry.
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("BINARY") {
            Some(TextCollation::Binary)
        } else if name.eq_ignore_ascii_case("NOCASE") {
            Some(TextCollation::NoCase)
        } else if name.eq_ignore_ascii_case("RTRIM") {
            Some(TextCollation::RTrim)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TextCollation::Binary => "BINARY",
            TextCollation::NoCase => "NOCASE",
            TextCollation::RTrim => "RTRIM",
        }
    }

    /// Normalize text so that byte comparison of the result matches this
    /// collation's order. Used by the order-preserving key codec.
    pub fn normalize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self {
            TextCollation::Binary => Cow::Borrowed(text),
            TextCollation::NoCase => {
                if text.bytes().any(|b| b.is_ascii_uppercase()) {
                    Cow::Owned(text.to_ascii_lowercase())
                } else {
                    Cow::Borrowed(text)
                }
            }
            TextCollation::RTrim => {
                let trimmed = text.trim_end_matches(' ');
                if trimmed.len() == text.len() {
                    Cow::Borrowed(text)
                } else {
                    Cow::Borrowed(trimmed)
                }
            }
        }
    }

    /// Compare two text values under this collation.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        self.normalize(a).as_bytes().cmp(self.normalize(b).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(TextCollation::parse("nocase"), Some(TextCollation::NoCase));
        assert_eq!(TextCollation::parse("BINARY"), Some(TextCollation::Binary));
        assert_eq!(TextCollation::parse("klingon"), None);
    }

    #[test]
    fn nocase_folds_ascii_only() {
        assert_eq!(TextCollation::NoCase.compare("ALICE", "alice"), Ordering::Equal);
        assert_ne!(TextCollation::NoCase.compare("Å", "å"), Ordering::Equal);
    }

    #[test]
    fn rtrim_ignores_trailing_spaces() {
        assert_eq!(TextCollation::RTrim.compare("a  ", "a"), Ordering::Equal);
        assert_ne!(TextCollation::RTrim.compare("  a", "a"), Ordering::Equal);
    }

    #[test]
    fn binary_is_bytewise() {
        assert_eq!(TextCollation::Binary.compare("a", "b"), Ordering::Less);
        assert_eq!(TextCollation::Binary.compare("B", "a"), Ordering::Less);
    }
}
