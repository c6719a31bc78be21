//! Runtime values.
//!
//! Every cell the engine moves around is a [`SqlValue`]. Booleans are
//! represented as the integers 0/1. Structural equality treats `Real` by
//! bit pattern (so NaN round-trips and hashes); SQL comparison semantics
//! (NULL never equal, collation-aware text) live in [`compare_values`].

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use num_bigint::BigInt;

use super::collation::TextCollation;

/// A single SQL value.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Integer(i64),
    BigInt(BigInt),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// An ordered sequence of values matching a table or projection schema.
pub type Row = Vec<SqlValue>;

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// The SQL `typeof()` name for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) | SqlValue::BigInt(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }

    /// Rank used for cross-type ordering: null < numeric < text < blob.
    pub fn type_rank(&self) -> u8 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Integer(_) | SqlValue::BigInt(_) | SqlValue::Real(_) => 1,
            SqlValue::Text(_) => 2,
            SqlValue::Blob(_) => 3,
        }
    }

    /// SQL truthiness: NULL is unknown, numbers by non-zero, text/blob false.
    pub fn is_truthy(&self) -> Option<bool> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(i) => Some(*i != 0),
            SqlValue::BigInt(b) => Some(*b != BigInt::ZERO),
            SqlValue::Real(f) => Some(*f != 0.0),
            SqlValue::Text(_) | SqlValue::Blob(_) => Some(false),
        }
    }

    pub fn from_bool(b: bool) -> SqlValue {
        SqlValue::Integer(if b { 1 } else { 0 })
    }

    /// Numeric view of this value, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(i) => Some(*i as f64),
            SqlValue::BigInt(b) => {
                // Precision loss past 2^53 is acceptable for residual
                // comparison; key order uses the exact encoding.
                let (sign, digits) = b.to_u64_digits();
                let mut mag = 0f64;
                for d in digits.iter().rev() {
                    mag = mag * (u64::MAX as f64 + 1.0) + *d as f64;
                }
                Some(match sign {
                    num_bigint::Sign::Minus => -mag,
                    _ => mag,
                })
            }
            SqlValue::Real(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => true,
            (SqlValue::Integer(a), SqlValue::Integer(b)) => a == b,
            (SqlValue::BigInt(a), SqlValue::BigInt(b)) => a == b,
            (SqlValue::Integer(a), SqlValue::BigInt(b))
            | (SqlValue::BigInt(b), SqlValue::Integer(a)) => BigInt::from(*a) == *b,
            // Bit-pattern equality so NaN values compare equal structurally
            (SqlValue::Real(a), SqlValue::Real(b)) => a.to_bits() == b.to_bits(),
            (SqlValue::Text(a), SqlValue::Text(b)) => a == b,
            (SqlValue::Blob(a), SqlValue::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SqlValue {}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            SqlValue::Null => 0u8.hash(state),
            SqlValue::Integer(i) => {
                1u8.hash(state);
                BigInt::from(*i).hash(state);
            }
            SqlValue::BigInt(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            SqlValue::Real(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            SqlValue::Text(t) => {
                3u8.hash(state);
                t.hash(state);
            }
            SqlValue::Blob(b) => {
                4u8.hash(state);
                b.hash(state);
            }
        }
    }
}

/// Compare two values under SQL semantics and the given text collation.
///
/// Returns `None` when either side is NULL: NULL is not equal to anything,
/// including NULL, and every ordered comparison with NULL is false.
pub fn compare_values(a: &SqlValue, b: &SqlValue, collation: TextCollation) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    let (ra, rb) = (a.type_rank(), b.type_rank());
    if ra != rb {
        return Some(ra.cmp(&rb));
    }
    Some(match (a, b) {
        (SqlValue::Integer(x), SqlValue::Integer(y)) => x.cmp(y),
        (SqlValue::BigInt(x), SqlValue::BigInt(y)) => x.cmp(y),
        (SqlValue::Integer(x), SqlValue::BigInt(y)) => BigInt::from(*x).cmp(y),
        (SqlValue::BigInt(x), SqlValue::Integer(y)) => x.cmp(&BigInt::from(*y)),
        (SqlValue::Real(x), SqlValue::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (SqlValue::Text(x), SqlValue::Text(y)) => collation.compare(x, y),
        (SqlValue::Blob(x), SqlValue::Blob(y)) => x.cmp(y),
        // Mixed integer/real within the numeric rank
        _ => {
            let (x, y) = (a.as_f64(), b.as_f64());
            match (x, y) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_compares_with_nothing() {
        assert_eq!(compare_values(&SqlValue::Null, &SqlValue::Null, TextCollation::Binary), None);
        assert_eq!(
            compare_values(&SqlValue::Integer(1), &SqlValue::Null, TextCollation::Binary),
            None
        );
    }

    #[test]
    fn cross_type_rank_order() {
        let n = SqlValue::Integer(9);
        let t = SqlValue::Text("a".into());
        let b = SqlValue::Blob(vec![0]);
        assert_eq!(compare_values(&n, &t, TextCollation::Binary), Some(Ordering::Less));
        assert_eq!(compare_values(&t, &b, TextCollation::Binary), Some(Ordering::Less));
    }

    #[test]
    fn mixed_numeric_comparison() {
        assert_eq!(
            compare_values(&SqlValue::Integer(2), &SqlValue::Real(2.5), TextCollation::Binary),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(
                &SqlValue::BigInt(BigInt::from(7)),
                &SqlValue::Integer(7),
                TextCollation::Binary
            ),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn nocase_text_comparison() {
        assert_eq!(
            compare_values(
                &SqlValue::Text("ALICE".into()),
                &SqlValue::Text("alice".into()),
                TextCollation::NoCase
            ),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn nan_is_structurally_equal() {
        let nan = SqlValue::Real(f64::NAN);
        assert_eq!(nan, nan.clone());
    }

    #[test]
    fn integer_and_bigint_equal_structurally() {
        assert_eq!(SqlValue::Integer(42), SqlValue::BigInt(BigInt::from(42)));
    }
}
