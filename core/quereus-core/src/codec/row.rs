//! Row and statistics serialization.
//!
//! A self-describing tag-length-value format: a little-endian u32 value
//! count, then one tagged value per cell. Reals are stored by raw bit
//! pattern so NaN round-trips exactly. This layout is a persistent format;
//! changing it invalidates existing stores.

use num_bigint::{BigInt, Sign};

use crate::error::{QuereusError, QuereusResult};
use crate::types::{Row, SqlValue};

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_BIGINT: u8 = 2;
const TAG_REAL: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BLOB: u8 = 5;

/// The single record kept in a table's stats store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsRecord {
    pub row_count: u64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}

/// Serialize a row into its stored representation.
pub fn serialize_row(row: &[SqlValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + row.len() * 12);
    out.extend_from_slice(&(row.len() as u32).to_le_bytes());
    for value in row {
        serialize_value(&mut out, value);
    }
    out
}

/// Deserialize a stored row. Corrupt input is an [`QuereusError::Internal`]
/// failure: the store returned bytes the engine did not write.
pub fn deserialize_row(bytes: &[u8]) -> QuereusResult<Row> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u32()? as usize;
    let mut row = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        row.push(deserialize_value(&mut cursor)?);
    }
    cursor.expect_end()?;
    Ok(row)
}

/// Serialize a stats record using the row framing.
pub fn serialize_stats(stats: &StatsRecord) -> Vec<u8> {
    serialize_row(&[
        SqlValue::Integer(stats.row_count as i64),
        SqlValue::Integer(stats.updated_at),
    ])
}

/// Deserialize a stats record.
pub fn deserialize_stats(bytes: &[u8]) -> QuereusResult<StatsRecord> {
    let row = deserialize_row(bytes)?;
    match row.as_slice() {
        [SqlValue::Integer(count), SqlValue::Integer(updated)] if *count >= 0 => Ok(StatsRecord {
            row_count: *count as u64,
            updated_at: *updated,
        }),
        _ => Err(QuereusError::Internal("malformed stats record".into())),
    }
}

fn serialize_value(out: &mut Vec<u8>, value: &SqlValue) {
    match value {
        SqlValue::Null => out.push(TAG_NULL),
        SqlValue::Integer(i) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&i.to_le_bytes());
        }
        SqlValue::BigInt(b) => {
            out.push(TAG_BIGINT);
            let (sign, magnitude) = b.to_bytes_le();
            out.push(match sign {
                Sign::Minus => 0,
                _ => 1,
            });
            out.extend_from_slice(&(magnitude.len() as u32).to_le_bytes());
            out.extend_from_slice(&magnitude);
        }
        SqlValue::Real(f) => {
            out.push(TAG_REAL);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        SqlValue::Text(t) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&(t.len() as u32).to_le_bytes());
            out.extend_from_slice(t.as_bytes());
        }
        SqlValue::Blob(b) => {
            out.push(TAG_BLOB);
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
    }
}

fn deserialize_value(cursor: &mut Cursor<'_>) -> QuereusResult<SqlValue> {
    match cursor.read_u8()? {
        TAG_NULL => Ok(SqlValue::Null),
        TAG_INTEGER => Ok(SqlValue::Integer(i64::from_le_bytes(cursor.read_array()?))),
        TAG_BIGINT => {
            let sign = cursor.read_u8()?;
            let len = cursor.read_u32()? as usize;
            let magnitude = cursor.read_slice(len)?;
            let sign = if sign == 0 { Sign::Minus } else { Sign::Plus };
            Ok(SqlValue::BigInt(BigInt::from_bytes_le(sign, magnitude)))
        }
        TAG_REAL => Ok(SqlValue::Real(f64::from_bits(u64::from_le_bytes(
            cursor.read_array()?,
        )))),
        TAG_TEXT => {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.read_slice(len)?;
            String::from_utf8(bytes.to_vec())
                .map(SqlValue::Text)
                .map_err(|_| QuereusError::Internal("row deserialization failure: invalid UTF-8".into()))
        }
        TAG_BLOB => {
            let len = cursor.read_u32()? as usize;
            Ok(SqlValue::Blob(cursor.read_slice(len)?.to_vec()))
        }
        other => Err(QuereusError::Internal(format!(
            "row deserialization failure: unknown value tag {other}"
        ))),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> QuereusResult<u8> {
        let b = self
            .bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| QuereusError::Internal("row deserialization failure: truncated".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_slice(&mut self, len: usize) -> QuereusResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| QuereusError::Internal("row deserialization failure: truncated".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> QuereusResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_slice(N)?);
        Ok(out)
    }

    fn read_u32(&mut self) -> QuereusResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn expect_end(&self) -> QuereusResult<()> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(QuereusError::Internal(
                "row deserialization failure: trailing bytes".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trips_every_kind() {
        let row: Row = vec![
            SqlValue::Null,
            SqlValue::Integer(-42),
            SqlValue::BigInt(BigInt::from(i64::MAX) * 12345),
            SqlValue::Real(2.5),
            SqlValue::Text("héllo".into()),
            SqlValue::Blob(vec![0, 1, 2, 255]),
        ];
        assert_eq!(deserialize_row(&serialize_row(&row)).unwrap(), row);
    }

    #[test]
    fn nan_round_trips_by_bit_pattern() {
        let bits = 0x7ff8_dead_beef_0001u64;
        let row = vec![SqlValue::Real(f64::from_bits(bits))];
        let back = deserialize_row(&serialize_row(&row)).unwrap();
        match back[0] {
            SqlValue::Real(f) => assert_eq!(f.to_bits(), bits),
            _ => panic!("expected real"),
        }
    }

    #[test]
    fn empty_values_round_trip() {
        let row = vec![SqlValue::Text(String::new()), SqlValue::Blob(vec![])];
        assert_eq!(deserialize_row(&serialize_row(&row)).unwrap(), row);
        assert_eq!(deserialize_row(&serialize_row(&[])).unwrap(), Vec::<SqlValue>::new());
    }

    #[test]
    fn truncated_input_is_internal_error() {
        let mut bytes = serialize_row(&[SqlValue::Text("abcdef".into())]);
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            deserialize_row(&bytes),
            Err(QuereusError::Internal(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_internal_error() {
        let mut bytes = serialize_row(&[SqlValue::Integer(1)]);
        bytes.push(0xAA);
        assert!(matches!(
            deserialize_row(&bytes),
            Err(QuereusError::Internal(_))
        ));
    }

    #[test]
    fn stats_record_round_trips() {
        let stats = StatsRecord { row_count: 100, updated_at: 1_700_000_000_000 };
        assert_eq!(deserialize_stats(&serialize_stats(&stats)).unwrap(), stats);
    }

    #[test]
    fn negative_count_rejected_in_stats() {
        let bytes = serialize_row(&[SqlValue::Integer(-1), SqlValue::Integer(0)]);
        assert!(deserialize_stats(&bytes).is_err());
    }

    fn arb_value() -> impl Strategy<Value = SqlValue> {
        prop_oneof![
            Just(SqlValue::Null),
            any::<i64>().prop_map(SqlValue::Integer),
            any::<u64>().prop_map(|bits| SqlValue::Real(f64::from_bits(bits))),
            ".{0,16}".prop_map(SqlValue::Text),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(SqlValue::Blob),
        ]
    }

    proptest! {
        // Quantified invariant: deserialize(serialize(row)) == row for all
        // values, with NaN identified by bit pattern (structural equality).
        #[test]
        fn any_row_round_trips(row in proptest::collection::vec(arb_value(), 0..8)) {
            prop_assert_eq!(deserialize_row(&serialize_row(&row)).unwrap(), row);
        }
    }
}
