//! Column encodings.
//!
//! Within a row group every column is stored contiguously: an encoding tag,
//! the uncompressed and compressed lengths, a checksum, and a
//! zstd-compressed payload. Strings are dictionary encoded; scalars are
//! plain little-endian.

use siphasher::sip::SipHasher24;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::hash::Hasher;
use std::sync::Arc;

/// Zstd level for column payloads; favors speed over ratio.
const COMPRESSION_LEVEL: i32 = 1;

/// Errors raised while encoding or decoding a single column.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("column payload is truncated"))]
    Truncated,

    #[snafu(display("column checksum mismatch"))]
    ChecksumMismatch,

    #[snafu(display("unknown column encoding tag {tag}"))]
    UnknownEncoding { tag: u8 },

    #[snafu(display("column encoding tag {got} does not match expected {expected}"))]
    EncodingMismatch { got: u8, expected: u8 },

    #[snafu(display("dictionary index {index} out of bounds ({len} entries)"))]
    BadDictIndex { index: u32, len: usize },

    #[snafu(display("invalid utf-8 in string column: {source}"))]
    InvalidUtf8 { source: std::str::Utf8Error },

    #[snafu(display("zstd error: {source}"))]
    Zstd { source: std::io::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Encoding tags stored in the column header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    /// Fixed 16-byte values (trace ids).
    Fixed16 = 0,
    /// Fixed 8-byte values (span ids).
    Fixed8 = 1,
    /// Plain little-endian i64.
    I64 = 2,
    /// Plain little-endian u32.
    U32 = 3,
    /// One byte per row.
    U8 = 4,
    /// Plain little-endian f64 bit patterns.
    F64 = 5,
    /// Dictionary-encoded strings.
    DictStr = 6,
    /// Variable-length opaque bytes per row.
    VarBytes = 7,
}

impl Encoding {
    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Fixed16,
            1 => Self::Fixed8,
            2 => Self::I64,
            3 => Self::U32,
            4 => Self::U8,
            5 => Self::F64,
            6 => Self::DictStr,
            7 => Self::VarBytes,
            tag => return Err(Error::UnknownEncoding { tag }),
        })
    }
}

/// Decoded column values.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Column {
    Fixed16(Vec<[u8; 16]>),
    Fixed8(Vec<[u8; 8]>),
    I64(Vec<i64>),
    U32(Vec<u32>),
    U8(Vec<u8>),
    F64(Vec<f64>),
    /// Dictionary plus per-row indexes into it.
    DictStr {
        dict: Vec<Arc<str>>,
        values: Vec<u32>,
    },
    VarBytes(Vec<Vec<u8>>),
}

impl Column {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Self::Fixed16(v) => v.len(),
            Self::Fixed8(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::DictStr { values, .. } => values.len(),
            Self::VarBytes(v) => v.len(),
        }
    }

    /// True if the column holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encoding(&self) -> Encoding {
        match self {
            Self::Fixed16(_) => Encoding::Fixed16,
            Self::Fixed8(_) => Encoding::Fixed8,
            Self::I64(_) => Encoding::I64,
            Self::U32(_) => Encoding::U32,
            Self::U8(_) => Encoding::U8,
            Self::F64(_) => Encoding::F64,
            Self::DictStr { .. } => Encoding::DictStr,
            Self::VarBytes(_) => Encoding::VarBytes,
        }
    }

    /// The string at `row` of a dictionary column.
    pub fn str_at(&self, row: usize) -> Option<&Arc<str>> {
        match self {
            Self::DictStr { dict, values } => dict.get(*values.get(row)? as usize),
            _ => None,
        }
    }
}

/// Build a dictionary column from row values.
pub fn dict_str_column<'a>(rows: impl IntoIterator<Item = &'a str>) -> Column {
    let rows: Vec<&str> = rows.into_iter().collect();
    let mut dict: Vec<&str> = rows.clone();
    dict.sort_unstable();
    dict.dedup();
    let values = rows
        .iter()
        .map(|r| dict.binary_search(r).expect("row is in dict") as u32)
        .collect();
    Column::DictStr {
        dict: dict.into_iter().map(Arc::from).collect(),
        values,
    }
}

fn serialize_payload(column: &Column) -> Vec<u8> {
    let mut out = Vec::new();
    let push_n = |out: &mut Vec<u8>, n: usize| out.extend_from_slice(&(n as u32).to_le_bytes());

    match column {
        Column::Fixed16(rows) => {
            push_n(&mut out, rows.len());
            for row in rows {
                out.extend_from_slice(row);
            }
        }
        Column::Fixed8(rows) => {
            push_n(&mut out, rows.len());
            for row in rows {
                out.extend_from_slice(row);
            }
        }
        Column::I64(rows) => {
            push_n(&mut out, rows.len());
            for row in rows {
                out.extend_from_slice(&row.to_le_bytes());
            }
        }
        Column::U32(rows) => {
            push_n(&mut out, rows.len());
            for row in rows {
                out.extend_from_slice(&row.to_le_bytes());
            }
        }
        Column::U8(rows) => {
            push_n(&mut out, rows.len());
            out.extend_from_slice(rows);
        }
        Column::F64(rows) => {
            push_n(&mut out, rows.len());
            for row in rows {
                out.extend_from_slice(&row.to_bits().to_le_bytes());
            }
        }
        Column::DictStr { dict, values } => {
            push_n(&mut out, dict.len());
            for entry in dict {
                push_n(&mut out, entry.len());
                out.extend_from_slice(entry.as_bytes());
            }
            push_n(&mut out, values.len());
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Column::VarBytes(rows) => {
            push_n(&mut out, rows.len());
            for row in rows {
                push_n(&mut out, row.len());
                out.extend_from_slice(row);
            }
        }
    }
    out
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).context(TruncatedSnafu)?;
        ensure!(end <= self.bytes.len(), TruncatedSnafu);
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(
            self.take(4)?.try_into().expect("4 bytes"),
        ))
    }
}

fn deserialize_payload(encoding: Encoding, bytes: &[u8]) -> Result<Column> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let n = cursor.u32()? as usize;

    Ok(match encoding {
        Encoding::Fixed16 => {
            let mut rows = Vec::with_capacity(n);
            for _ in 0..n {
                rows.push(cursor.take(16)?.try_into().expect("16 bytes"));
            }
            Column::Fixed16(rows)
        }
        Encoding::Fixed8 => {
            let mut rows = Vec::with_capacity(n);
            for _ in 0..n {
                rows.push(cursor.take(8)?.try_into().expect("8 bytes"));
            }
            Column::Fixed8(rows)
        }
        Encoding::I64 => {
            let mut rows = Vec::with_capacity(n);
            for _ in 0..n {
                rows.push(i64::from_le_bytes(
                    cursor.take(8)?.try_into().expect("8 bytes"),
                ));
            }
            Column::I64(rows)
        }
        Encoding::U32 => {
            let mut rows = Vec::with_capacity(n);
            for _ in 0..n {
                rows.push(cursor.u32()?);
            }
            Column::U32(rows)
        }
        Encoding::U8 => Column::U8(cursor.take(n)?.to_vec()),
        Encoding::F64 => {
            let mut rows = Vec::with_capacity(n);
            for _ in 0..n {
                rows.push(f64::from_bits(u64::from_le_bytes(
                    cursor.take(8)?.try_into().expect("8 bytes"),
                )));
            }
            Column::F64(rows)
        }
        Encoding::DictStr => {
            let mut dict = Vec::with_capacity(n);
            for _ in 0..n {
                let len = cursor.u32()? as usize;
                let s = std::str::from_utf8(cursor.take(len)?).context(InvalidUtf8Snafu)?;
                dict.push(Arc::from(s));
            }
            let value_count = cursor.u32()? as usize;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                let index = cursor.u32()?;
                ensure!(
                    (index as usize) < dict.len(),
                    BadDictIndexSnafu {
                        index,
                        len: dict.len()
                    }
                );
                values.push(index);
            }
            Column::DictStr { dict, values }
        }
        Encoding::VarBytes => {
            let mut rows = Vec::with_capacity(n);
            for _ in 0..n {
                let len = cursor.u32()? as usize;
                rows.push(cursor.take(len)?.to_vec());
            }
            Column::VarBytes(rows)
        }
    })
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(0x636f_6c75, 0x6d6e_6b73);
    hasher.write(bytes);
    hasher.finish()
}

/// Header bytes preceding the compressed payload: tag, uncompressed length,
/// compressed length, checksum.
pub(crate) const HEADER_BYTES: usize = 1 + 4 + 4 + 8;

/// Serialize and compress a column into its on-object representation.
pub fn encode_column(column: &Column) -> Result<Vec<u8>> {
    let payload = serialize_payload(column);
    let compressed =
        zstd::bulk::compress(&payload, COMPRESSION_LEVEL).context(ZstdSnafu)?;

    let mut out = Vec::with_capacity(HEADER_BYTES + compressed.len());
    out.push(column.encoding() as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(&compressed).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Inverse of [`encode_column`]. Verifies the checksum before decompressing.
pub fn decode_column(bytes: &[u8]) -> Result<Column> {
    ensure!(bytes.len() >= HEADER_BYTES, TruncatedSnafu);
    let encoding = Encoding::from_tag(bytes[0])?;
    let uncompressed_len =
        u32::from_le_bytes(bytes[1..5].try_into().expect("4 bytes")) as usize;
    let compressed_len = u32::from_le_bytes(bytes[5..9].try_into().expect("4 bytes")) as usize;
    let expected_checksum = u64::from_le_bytes(bytes[9..17].try_into().expect("8 bytes"));

    ensure!(bytes.len() >= HEADER_BYTES + compressed_len, TruncatedSnafu);
    let compressed = &bytes[HEADER_BYTES..HEADER_BYTES + compressed_len];
    ensure!(checksum(compressed) == expected_checksum, ChecksumMismatchSnafu);

    let payload =
        zstd::bulk::decompress(compressed, uncompressed_len).context(ZstdSnafu)?;
    deserialize_payload(encoding, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(column: Column) {
        let bytes = encode_column(&column).unwrap();
        let back = decode_column(&bytes).unwrap();
        assert_eq!(column, back);
    }

    #[test]
    fn scalar_columns_round_trip() {
        round_trip(Column::I64(vec![i64::MIN, -1, 0, 42, i64::MAX]));
        round_trip(Column::U32(vec![0, 1, u32::MAX]));
        round_trip(Column::U8(vec![0, 255, 3]));
        round_trip(Column::F64(vec![0.0, -1.5, f64::INFINITY]));
        round_trip(Column::Fixed16(vec![[7u8; 16], [9u8; 16]]));
        round_trip(Column::Fixed8(vec![[1u8; 8]]));
        round_trip(Column::VarBytes(vec![vec![], vec![1, 2, 3]]));
    }

    #[test]
    fn empty_columns_round_trip() {
        round_trip(Column::I64(vec![]));
        round_trip(dict_str_column([]));
        round_trip(Column::VarBytes(vec![]));
    }

    #[test]
    fn dict_column_dedups_and_restores() {
        let column = dict_str_column(["b", "a", "b", "c", "a"]);
        match &column {
            Column::DictStr { dict, values } => {
                assert_eq!(dict.len(), 3, "dictionary holds unique entries");
                assert_eq!(values.len(), 5);
            }
            _ => unreachable!(),
        }
        assert_eq!(column.str_at(0).unwrap().as_ref(), "b");
        assert_eq!(column.str_at(4).unwrap().as_ref(), "a");
        round_trip(column);
    }

    #[test]
    fn corruption_is_detected() {
        let bytes = encode_column(&Column::I64(vec![1, 2, 3])).unwrap();

        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert!(matches!(
            decode_column(&flipped),
            Err(Error::ChecksumMismatch)
        ));

        let mut truncated = bytes;
        truncated.truncate(truncated.len() - 2);
        assert!(matches!(decode_column(&truncated), Err(Error::Truncated)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = encode_column(&Column::U8(vec![1])).unwrap();
        bytes[0] = 99;
        assert!(matches!(
            decode_column(&bytes),
            Err(Error::UnknownEncoding { tag: 99 })
        ));
    }
}
