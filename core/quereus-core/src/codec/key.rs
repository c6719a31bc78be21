//! Order-preserving composite key encoding.
//!
//! Each component encodes as `tag ‖ payload` where the payload is chosen so
//! that memcmp order over the bytes equals logical order over the values:
//!
//! - integers (fixed and arbitrary precision) as a biased length byte plus
//!   a minimal big-endian magnitude, magnitude inverted for negatives;
//! - doubles via the IEEE-754 total-order bit trick (sign bit flipped for
//!   positives, all bits inverted for negatives);
//! - text as collation-normalized UTF-8 with `0x00` escaped to `0x00 0xFF`
//!   and a `0x00 0x00` terminator, which sorts before any continuation;
//! - blobs with the same escape coding;
//! - NULL as a bare tag that sorts before every value.
//!
//! A descending component inverts every encoded byte, terminator included.
//! Components are self-delimiting, so composites are injective and can be
//! skipped component-wise without decoding values.

use num_bigint::{BigInt, Sign};
use smallvec::SmallVec;

use crate::error::{QuereusError, QuereusResult};
use crate::types::{SortDirection, SqlValue, TextCollation};

/// First byte of every data key in a table's data store.
pub const DATA_PREFIX: u8 = 0x01;
/// First byte of every entry in an index store.
pub const IDX_PREFIX: u8 = 0x02;
/// Separator between the index-value composite and the pk composite.
/// Sorts before every component tag.
pub const KEY_SEP: u8 = 0x00;

const TAG_NULL: u8 = 0x05;
const TAG_INT: u8 = 0x10;
const TAG_REAL: u8 = 0x18;
const TAG_TEXT: u8 = 0x20;
const TAG_BLOB: u8 = 0x30;

/// Largest magnitude (in bytes) the biased-length integer encoding carries.
const MAX_INT_MAGNITUDE: usize = 0x7f;

/// Per-composite encoding options. Empty vectors mean "BINARY, ascending"
/// for every component.
#[derive(Debug, Clone, Default)]
pub struct KeyEncodingOptions {
    pub collations: Vec<TextCollation>,
    pub directions: Vec<SortDirection>,
    /// Reject non-finite floats instead of encoding their total order.
    pub strict: bool,
}

impl KeyEncodingOptions {
    fn collation(&self, i: usize) -> TextCollation {
        self.collations.get(i).copied().unwrap_or_default()
    }

    fn direction(&self, i: usize) -> SortDirection {
        self.directions.get(i).copied().unwrap_or_default()
    }
}

/// Half-open `[lower, upper)` byte range produced by the bound builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBounds {
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
}

/// Encode a tuple of values into one order-preserving byte string.
pub fn encode_composite(values: &[SqlValue], opts: &KeyEncodingOptions) -> QuereusResult<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * 10);
    for (i, value) in values.iter().enumerate() {
        encode_component(&mut out, value, opts.collation(i), opts.direction(i), opts.strict)?;
    }
    Ok(out)
}

/// `DATA_PREFIX ‖ encodeComposite(pk)`: the key of a row in the data store.
pub fn build_data_key(pk: &[SqlValue], opts: &KeyEncodingOptions) -> QuereusResult<Vec<u8>> {
    let mut key = Vec::with_capacity(1 + pk.len() * 10);
    key.push(DATA_PREFIX);
    for (i, value) in pk.iter().enumerate() {
        encode_component(&mut key, value, opts.collation(i), opts.direction(i), opts.strict)?;
    }
    Ok(key)
}

/// `IDX_PREFIX ‖ encodeComposite(indexValues) ‖ SEP ‖ encodeComposite(pk)`.
/// The value under this key is empty; the key *is* the entry.
pub fn build_index_key(
    index_values: &[SqlValue],
    index_opts: &KeyEncodingOptions,
    pk: &[SqlValue],
    pk_opts: &KeyEncodingOptions,
) -> QuereusResult<Vec<u8>> {
    let mut key = Vec::with_capacity(1 + (index_values.len() + pk.len()) * 10 + 1);
    key.push(IDX_PREFIX);
    for (i, value) in index_values.iter().enumerate() {
        encode_component(
            &mut key,
            value,
            index_opts.collation(i),
            index_opts.direction(i),
            index_opts.strict,
        )?;
    }
    key.push(KEY_SEP);
    for (i, value) in pk.iter().enumerate() {
        encode_component(&mut key, value, pk_opts.collation(i), pk_opts.direction(i), pk_opts.strict)?;
    }
    Ok(key)
}

/// Bounds covering every data key in a data store.
pub fn data_scan_bounds() -> ScanBounds {
    ScanBounds {
        lower: vec![DATA_PREFIX],
        upper: vec![DATA_PREFIX + 1],
    }
}

/// Bounds covering every index entry whose leading values equal `values`.
pub fn index_prefix_bounds(
    values: &[SqlValue],
    opts: &KeyEncodingOptions,
) -> QuereusResult<ScanBounds> {
    let mut lower = Vec::with_capacity(1 + values.len() * 10);
    lower.push(IDX_PREFIX);
    for (i, value) in values.iter().enumerate() {
        encode_component(&mut lower, value, opts.collation(i), opts.direction(i), opts.strict)?;
    }
    let upper = prefix_successor(&lower);
    Ok(ScanBounds { lower, upper })
}

/// Catalog key: `kind ‖ 0x00 ‖ part ‖ 0x00 ‖ …` so that all entries of one
/// kind form a contiguous range.
pub fn build_meta_key(kind: &str, parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(kind.len() + 1 + parts.iter().map(|p| p.len() + 1).sum::<usize>());
    key.extend_from_slice(kind.as_bytes());
    key.push(0x00);
    for part in parts {
        key.extend_from_slice(part.as_bytes());
        key.push(0x00);
    }
    key
}

/// Bounds covering every catalog key of one kind.
pub fn build_meta_scan_bounds(kind: &str) -> ScanBounds {
    let mut lower = Vec::with_capacity(kind.len() + 1);
    lower.extend_from_slice(kind.as_bytes());
    lower.push(0x00);
    let mut upper = Vec::with_capacity(kind.len() + 1);
    upper.extend_from_slice(kind.as_bytes());
    upper.push(0x01);
    ScanBounds { lower, upper }
}

/// Smallest byte string strictly greater than every string with `prefix`.
pub fn prefix_successor(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xff {
            upper.push(last + 1);
            return upper;
        }
    }
    // All 0xff: no finite successor; an empty upper means "unbounded"
    upper
}

/// Split an index key into its index-value bytes and pk bytes by skipping
/// `n_index_cols` self-delimiting components. Returns `(index_part, pk_part)`
/// without the leading prefix and separator.
pub fn split_index_key<'k>(
    key: &'k [u8],
    n_index_cols: usize,
    directions: &[SortDirection],
) -> QuereusResult<(&'k [u8], &'k [u8])> {
    if key.first() != Some(&IDX_PREFIX) {
        return Err(QuereusError::Internal("index key missing prefix".into()));
    }
    let body = &key[1..];
    let mut pos = 0usize;
    for i in 0..n_index_cols {
        let inverted = directions.get(i).copied().unwrap_or_default().is_desc();
        pos += component_len(&body[pos..], inverted)?;
    }
    if body.get(pos) != Some(&KEY_SEP) {
        return Err(QuereusError::Internal("index key missing separator".into()));
    }
    Ok((&body[..pos], &body[pos + 1..]))
}

fn encode_component(
    out: &mut Vec<u8>,
    value: &SqlValue,
    collation: TextCollation,
    direction: SortDirection,
    strict: bool,
) -> QuereusResult<()> {
    let start = out.len();
    match value {
        SqlValue::Null => out.push(TAG_NULL),
        SqlValue::Integer(i) => {
            out.push(TAG_INT);
            encode_int(out, &BigInt::from(*i))?;
        }
        SqlValue::BigInt(b) => {
            out.push(TAG_INT);
            encode_int(out, b)?;
        }
        SqlValue::Real(f) => {
            if strict && !f.is_finite() {
                return Err(QuereusError::Type(format!(
                    "cannot encode non-finite float {f} in a key"
                )));
            }
            out.push(TAG_REAL);
            // -0.0 and 0.0 are the same logical value; pick one encoding
            let f = if *f == 0.0 { 0.0 } else { *f };
            let bits = f.to_bits();
            let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        SqlValue::Text(t) => {
            out.push(TAG_TEXT);
            let normalized = collation.normalize(t);
            encode_escaped(out, normalized.as_bytes());
        }
        SqlValue::Blob(b) => {
            out.push(TAG_BLOB);
            encode_escaped(out, b);
        }
    }
    if direction.is_desc() {
        for byte in &mut out[start..] {
            *byte = !*byte;
        }
    }
    Ok(())
}

/// Biased length byte, then a minimal big-endian magnitude. Negative values
/// bias downward and invert the magnitude so larger magnitudes sort earlier.
fn encode_int(out: &mut Vec<u8>, value: &BigInt) -> QuereusResult<()> {
    let (sign, magnitude) = value.to_bytes_be();
    if *value == BigInt::ZERO {
        out.push(0x80);
        return Ok(());
    }
    if magnitude.len() > MAX_INT_MAGNITUDE {
        return Err(QuereusError::Type(format!(
            "integer magnitude of {} bytes exceeds the key codec limit",
            magnitude.len()
        )));
    }
    match sign {
        Sign::Minus => {
            out.push(0x80 - magnitude.len() as u8);
            out.extend(magnitude.iter().map(|b| !b));
        }
        _ => {
            out.push(0x80 + magnitude.len() as u8);
            out.extend_from_slice(&magnitude);
        }
    }
    Ok(())
}

fn encode_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xff);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Byte length of the component at the start of `bytes`.
fn component_len(bytes: &[u8], inverted: bool) -> QuereusResult<usize> {
    let raw = |i: usize| -> QuereusResult<u8> {
        let b = *bytes
            .get(i)
            .ok_or_else(|| QuereusError::Internal("truncated key component".into()))?;
        Ok(if inverted { !b } else { b })
    };
    let tag = raw(0)?;
    match tag {
        TAG_NULL => Ok(1),
        TAG_INT => {
            let prefix = raw(1)?;
            let magnitude = if prefix >= 0x80 { prefix - 0x80 } else { 0x80 - prefix } as usize;
            Ok(2 + magnitude)
        }
        TAG_REAL => Ok(1 + 8),
        TAG_TEXT | TAG_BLOB => {
            let mut i = 1;
            loop {
                if raw(i)? == 0x00 {
                    if raw(i + 1)? == 0x00 {
                        return Ok(i + 2);
                    }
                    i += 2; // escaped zero
                } else {
                    i += 1;
                }
            }
        }
        other => Err(QuereusError::Internal(format!(
            "unknown key component tag 0x{other:02x}"
        ))),
    }
}

/// Decode a composite back into values. Text decodes to its normalized form;
/// intended for diagnostics and tests, not the query path.
pub fn decode_composite(
    bytes: &[u8],
    directions: &[SortDirection],
) -> QuereusResult<Vec<SqlValue>> {
    let mut values = Vec::new();
    let mut pos = 0usize;
    let mut index = 0usize;
    while pos < bytes.len() {
        let inverted = directions.get(index).copied().unwrap_or_default().is_desc();
        let len = component_len(&bytes[pos..], inverted)?;
        let component: SmallVec<[u8; 24]> = if inverted {
            bytes[pos..pos + len].iter().map(|b| !b).collect()
        } else {
            SmallVec::from_slice(&bytes[pos..pos + len])
        };
        values.push(decode_component(&component)?);
        pos += len;
        index += 1;
    }
    Ok(values)
}

fn decode_component(bytes: &[u8]) -> QuereusResult<SqlValue> {
    match bytes[0] {
        TAG_NULL => Ok(SqlValue::Null),
        TAG_INT => {
            let prefix = bytes[1];
            if prefix == 0x80 {
                return Ok(SqlValue::Integer(0));
            }
            let negative = prefix < 0x80;
            let magnitude: Vec<u8> = if negative {
                bytes[2..].iter().map(|b| !b).collect()
            } else {
                bytes[2..].to_vec()
            };
            let big = BigInt::from_bytes_be(if negative { Sign::Minus } else { Sign::Plus }, &magnitude);
            match i64::try_from(&big) {
                Ok(i) => Ok(SqlValue::Integer(i)),
                Err(_) => Ok(SqlValue::BigInt(big)),
            }
        }
        TAG_REAL => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[1..9]);
            let ordered = u64::from_be_bytes(raw);
            let bits = if ordered & (1 << 63) != 0 { ordered & !(1 << 63) } else { !ordered };
            Ok(SqlValue::Real(f64::from_bits(bits)))
        }
        TAG_TEXT => {
            let raw = decode_escaped(&bytes[1..]);
            String::from_utf8(raw)
                .map(SqlValue::Text)
                .map_err(|_| QuereusError::Internal("invalid UTF-8 in text key".into()))
        }
        TAG_BLOB => Ok(SqlValue::Blob(decode_escaped(&bytes[1..]))),
        other => Err(QuereusError::Internal(format!(
            "unknown key component tag 0x{other:02x}"
        ))),
    }
}

fn decode_escaped(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == 0x00 {
            if bytes[i + 1] == 0x00 {
                break; // terminator
            }
            out.push(0x00);
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cmp::Ordering;
    use crate::types::compare_values;

    fn enc1(v: &SqlValue) -> Vec<u8> {
        encode_composite(std::slice::from_ref(v), &KeyEncodingOptions::default()).unwrap()
    }

    #[test]
    fn null_sorts_before_all_values() {
        let null = enc1(&SqlValue::Null);
        for v in [
            SqlValue::Integer(i64::MIN),
            SqlValue::Real(f64::NEG_INFINITY),
            SqlValue::Text(String::new()),
            SqlValue::Blob(vec![]),
        ] {
            assert!(null < enc1(&v), "null must sort before {v:?}");
        }
    }

    #[test]
    fn integer_order_across_magnitudes() {
        let samples: Vec<i64> = vec![i64::MIN, -65536, -256, -2, -1, 0, 1, 2, 255, 256, i64::MAX];
        for pair in samples.windows(2) {
            let a = enc1(&SqlValue::Integer(pair[0]));
            let b = enc1(&SqlValue::Integer(pair[1]));
            assert!(a < b, "{} must sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn bigint_and_integer_encode_identically() {
        use num_bigint::BigInt;
        let a = enc1(&SqlValue::Integer(123456789));
        let b = enc1(&SqlValue::BigInt(BigInt::from(123456789)));
        assert_eq!(a, b);
    }

    #[test]
    fn bigint_beyond_i64_sorts_after_i64_max() {
        use num_bigint::BigInt;
        let huge = SqlValue::BigInt(BigInt::from(i64::MAX) * 1000);
        assert!(enc1(&SqlValue::Integer(i64::MAX)) < enc1(&huge));
    }

    #[test]
    fn real_order_and_zero_normalization() {
        let samples = [-1e300, -1.0, -f64::MIN_POSITIVE, 0.0, f64::MIN_POSITIVE, 1.5, 1e300];
        for pair in samples.windows(2) {
            assert!(enc1(&SqlValue::Real(pair[0])) < enc1(&SqlValue::Real(pair[1])));
        }
        assert_eq!(enc1(&SqlValue::Real(-0.0)), enc1(&SqlValue::Real(0.0)));
    }

    #[test]
    fn strict_mode_rejects_non_finite() {
        let opts = KeyEncodingOptions { strict: true, ..Default::default() };
        let err = encode_composite(&[SqlValue::Real(f64::NAN)], &opts).unwrap_err();
        assert!(matches!(err, QuereusError::Type(_)));
    }

    #[test]
    fn text_prefix_sorts_first_and_embedded_zero_escapes() {
        let a = enc1(&SqlValue::Text("a".into()));
        let ab = enc1(&SqlValue::Text("ab".into()));
        let a0b = enc1(&SqlValue::Text("a\0b".into()));
        assert!(a < ab);
        assert!(a < a0b);
        assert!(a0b < ab); // 0x00 sorts before 'b'
    }

    #[test]
    fn nocase_collation_folds_for_encoding() {
        let opts = KeyEncodingOptions {
            collations: vec![TextCollation::NoCase],
            ..Default::default()
        };
        let upper = encode_composite(&[SqlValue::Text("ALICE".into())], &opts).unwrap();
        let lower = encode_composite(&[SqlValue::Text("alice".into())], &opts).unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn descending_inverts_order_within_column() {
        let opts = KeyEncodingOptions {
            directions: vec![SortDirection::Desc],
            ..Default::default()
        };
        let one = encode_composite(&[SqlValue::Integer(1)], &opts).unwrap();
        let two = encode_composite(&[SqlValue::Integer(2)], &opts).unwrap();
        assert!(two < one);

        let a = encode_composite(&[SqlValue::Text("a".into())], &opts).unwrap();
        let ab = encode_composite(&[SqlValue::Text("ab".into())], &opts).unwrap();
        assert!(ab < a);
    }

    #[test]
    fn composite_orders_lexicographically() {
        let opts = KeyEncodingOptions::default();
        let a = encode_composite(&[SqlValue::Integer(1), SqlValue::Text("z".into())], &opts).unwrap();
        let b = encode_composite(&[SqlValue::Integer(2), SqlValue::Text("a".into())], &opts).unwrap();
        assert!(a < b);
    }

    #[test]
    fn data_key_prefix_and_bounds() {
        let key = build_data_key(&[SqlValue::Integer(7)], &KeyEncodingOptions::default()).unwrap();
        let bounds = data_scan_bounds();
        assert!(key.as_slice() >= bounds.lower.as_slice());
        assert!(key.as_slice() < bounds.upper.as_slice());
    }

    #[test]
    fn index_key_splits_back_into_parts() {
        let idx_opts = KeyEncodingOptions::default();
        let pk_opts = KeyEncodingOptions::default();
        let key = build_index_key(
            &[SqlValue::Text("bob".into())],
            &idx_opts,
            &[SqlValue::Integer(2)],
            &pk_opts,
        )
        .unwrap();
        let (index_part, pk_part) = split_index_key(&key, 1, &[]).unwrap();
        assert_eq!(
            decode_composite(index_part, &[]).unwrap(),
            vec![SqlValue::Text("bob".into())]
        );
        assert_eq!(decode_composite(pk_part, &[]).unwrap(), vec![SqlValue::Integer(2)]);
    }

    #[test]
    fn split_handles_descending_index_columns() {
        let idx_opts = KeyEncodingOptions {
            directions: vec![SortDirection::Desc],
            ..Default::default()
        };
        let key = build_index_key(
            &[SqlValue::Text("a\0b".into())],
            &idx_opts,
            &[SqlValue::Integer(1)],
            &KeyEncodingOptions::default(),
        )
        .unwrap();
        let (_, pk_part) = split_index_key(&key, 1, &[SortDirection::Desc]).unwrap();
        assert_eq!(decode_composite(pk_part, &[]).unwrap(), vec![SqlValue::Integer(1)]);
    }

    #[test]
    fn meta_keys_scan_by_kind() {
        let key = build_meta_key("ddl", &["main", "users"]);
        let bounds = build_meta_scan_bounds("ddl");
        assert!(key.as_slice() >= bounds.lower.as_slice());
        assert!(key.as_slice() < bounds.upper.as_slice());
        let other = build_meta_key("index", &["main", "users", "ix_name"]);
        assert!(!(other.as_slice() >= bounds.lower.as_slice() && other.as_slice() < bounds.upper.as_slice()));
    }

    #[test]
    fn prefix_successor_carries() {
        assert_eq!(prefix_successor(&[0x01, 0xff]), vec![0x02]);
        assert_eq!(prefix_successor(&[0xff, 0xff]), Vec::<u8>::new());
    }

    fn arb_value() -> impl Strategy<Value = SqlValue> {
        prop_oneof![
            Just(SqlValue::Null),
            any::<i64>().prop_map(SqlValue::Integer),
            any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(SqlValue::Real),
            "[a-zA-Z0-9 ]{0,12}".prop_map(SqlValue::Text),
            proptest::collection::vec(any::<u8>(), 0..12).prop_map(SqlValue::Blob),
        ]
    }

    fn arb_same_kind_pair() -> impl Strategy<Value = (SqlValue, SqlValue)> {
        prop_oneof![
            (any::<i64>(), any::<i64>())
                .prop_map(|(a, b)| (SqlValue::Integer(a), SqlValue::Integer(b))),
            (any::<f64>(), any::<f64>())
                .prop_filter("finite", |(a, b)| a.is_finite() && b.is_finite())
                .prop_map(|(a, b)| (SqlValue::Real(a), SqlValue::Real(b))),
            ("[a-zA-Z0-9 ]{0,12}", "[a-zA-Z0-9 ]{0,12}")
                .prop_map(|(a, b)| (SqlValue::Text(a), SqlValue::Text(b))),
            (
                proptest::collection::vec(any::<u8>(), 0..12),
                proptest::collection::vec(any::<u8>(), 0..12)
            )
                .prop_map(|(a, b)| (SqlValue::Blob(a), SqlValue::Blob(b))),
        ]
    }

    proptest! {
        // Quantified invariant: within a column's declared kind, byte order of
        // encodings matches logical order, and equal encodings mean equal values.
        #[test]
        fn encoding_is_order_preserving((a, b) in arb_same_kind_pair()) {
            let ea = enc1(&a);
            let eb = enc1(&b);
            let logical = compare_values(&a, &b, TextCollation::Binary).unwrap();
            prop_assert_eq!(ea.cmp(&eb), logical, "logical {:?} vs {:?}", a, b);
        }

        // Across kinds, null sorts first and the remaining kinds order by rank.
        #[test]
        fn encoding_respects_type_rank(a in arb_value(), b in arb_value()) {
            prop_assume!(a.type_rank() != b.type_rank());
            let (ea, eb) = (enc1(&a), enc1(&b));
            prop_assert_eq!(ea.cmp(&eb), a.type_rank().cmp(&b.type_rank()));
        }

        #[test]
        fn composite_round_trips(values in proptest::collection::vec(arb_value(), 0..4)) {
            let encoded = encode_composite(&values, &KeyEncodingOptions::default()).unwrap();
            let decoded = decode_composite(&encoded, &[]).unwrap();
            prop_assert_eq!(decoded, values);
        }
    }
}
