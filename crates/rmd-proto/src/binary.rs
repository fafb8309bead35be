//! Schema-driven binary encoding.
//!
//! # Encoding
//!
//! | Type | Bytes |
//! |------|-------|
//! | int, long | zigzag varint |
//! | float, double | little-endian IEEE 754 |
//! | string, bytes | long length, then the bytes |
//! | array, map | blocks of `count, items...`, ended by a zero count |
//! | union | long branch index, then the branch value |
//! | record | fields in schema order |
//!
//! Nothing is self-describing: the reader needs the writer's schema.

use rmd_core::{Record, RecordSchema, Schema, Value};

/// Most items one block may declare when an item takes no bytes.
pub const MAX_ZERO_WIDTH_ITEMS: u64 = 1 << 16;

/// Encode `value` under `schema`, appending to `out`.
///
/// Record fields missing from `value` are written with their defaults.
///
/// # Errors
///
/// Returns error if the value does not conform to the schema.
pub fn encode_value(value: &Value, schema: &Schema, out: &mut Vec<u8>) -> Result<(), BinaryError> {
    match (schema, value) {
        (Schema::Null, Value::Null) => {}
        (Schema::Boolean, Value::Boolean(b)) => out.push(u8::from(*b)),
        (Schema::Int, Value::Int(v)) => write_long(out, i64::from(*v)),
        (Schema::Long, Value::Long(v)) => write_long(out, *v),
        (Schema::Long, Value::Int(v)) => write_long(out, i64::from(*v)),
        (Schema::Float, Value::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (Schema::Double, Value::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (Schema::String, Value::String(s)) => write_bytes(out, s.as_bytes()),
        (Schema::Bytes, Value::Bytes(b)) => write_bytes(out, b),
        (Schema::Array(items), Value::Array(values)) => {
            if !values.is_empty() {
                write_len(out, values.len());
                for v in values {
                    encode_value(v, items, out)?;
                }
            }
            write_long(out, 0);
        }
        (Schema::Map(values), Value::Map(entries)) => {
            if !entries.is_empty() {
                write_len(out, entries.len());
                for (k, v) in entries {
                    write_bytes(out, k.as_bytes());
                    encode_value(v, values, out)?;
                }
            }
            write_long(out, 0);
        }
        (Schema::Union(branches), value) => {
            let (index, branch) = branches
                .iter()
                .enumerate()
                .find(|(_, b)| conforms(value, b))
                .ok_or_else(|| mismatch("union", value))?;
            write_len(out, index);
            encode_value(value, branch, out)?;
        }
        (Schema::Record(schema), Value::Record(record)) => encode_record(record, schema, out)?,
        (schema, value) => return Err(mismatch(schema.type_name(), value)),
    }
    Ok(())
}

fn encode_record(record: &Record, schema: &RecordSchema, out: &mut Vec<u8>) -> Result<(), BinaryError> {
    if let Some((name, _)) = record.iter().find(|(name, _)| schema.field(name).is_none()) {
        return Err(BinaryError::UnknownField(name.to_string()));
    }
    for field in &schema.fields {
        let value = record
            .get(&field.name)
            .or(field.default.as_ref())
            .ok_or_else(|| BinaryError::MissingField(field.name.clone()))?;
        encode_value(value, &field.schema, out)?;
    }
    Ok(())
}

/// Whether `value` can be written under `schema` without conversion.
fn conforms(value: &Value, schema: &Schema) -> bool {
    match (schema, value) {
        (Schema::Null, Value::Null)
        | (Schema::Boolean, Value::Boolean(_))
        | (Schema::Int, Value::Int(_))
        | (Schema::Long, Value::Long(_))
        | (Schema::Float, Value::Float(_))
        | (Schema::Double, Value::Double(_))
        | (Schema::String, Value::String(_))
        | (Schema::Bytes, Value::Bytes(_))
        | (Schema::Array(_), Value::Array(_))
        | (Schema::Map(_), Value::Map(_)) => true,
        (Schema::Record(schema), Value::Record(record)) => {
            record.iter().all(|(name, _)| schema.field(name).is_some())
        }
        _ => false,
    }
}

fn mismatch(expected: &'static str, value: &Value) -> BinaryError {
    BinaryError::TypeMismatch {
        expected,
        found: value.kind(),
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn write_long(out: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n >= 0x80 {
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    write_long(out, i64::try_from(len).unwrap_or(i64::MAX));
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

/// Reads values from a byte slice.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Start reading at the beginning of `input`.
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Bytes not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Decode one value written under `schema`.
    ///
    /// # Errors
    ///
    /// Returns error if the input is truncated or inconsistent with the schema.
    pub fn read_value(&mut self, schema: &Schema) -> Result<Value, BinaryError> {
        Ok(match schema {
            Schema::Null => Value::Null,
            Schema::Boolean => match self.take(1)?[0] {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => return Err(BinaryError::InvalidBoolean(other)),
            },
            Schema::Int => {
                let v = self.read_long()?;
                Value::Int(i32::try_from(v).map_err(|_| BinaryError::IntOverflow(v))?)
            }
            Schema::Long => Value::Long(self.read_long()?),
            Schema::Float => Value::Float(f32::from_le_bytes(self.take_array()?)),
            Schema::Double => Value::Double(f64::from_le_bytes(self.take_array()?)),
            Schema::String => Value::String(self.read_string()?),
            Schema::Bytes => Value::Bytes(self.read_bytes()?.to_vec()),
            Schema::Array(items) => {
                let mut values = Vec::new();
                self.read_blocks(min_width(items), |decoder| {
                    values.push(decoder.read_value(items)?);
                    Ok(())
                })?;
                Value::Array(values)
            }
            Schema::Map(value_schema) => {
                let mut entries = Vec::new();
                self.read_blocks(1 + min_width(value_schema), |decoder| {
                    let key = decoder.read_string()?;
                    entries.push((key, decoder.read_value(value_schema)?));
                    Ok(())
                })?;
                Value::Map(entries)
            }
            Schema::Union(branches) => {
                let index = self.read_long()?;
                let branch = usize::try_from(index)
                    .ok()
                    .and_then(|i| branches.get(i))
                    .ok_or(BinaryError::InvalidUnionIndex {
                        index,
                        branches: branches.len(),
                    })?;
                self.read_value(branch)?
            }
            Schema::Record(record) => {
                let mut fields = Record::new();
                for field in &record.fields {
                    let value = self.read_value(&field.schema)?;
                    fields.set(field.name.clone(), value);
                }
                Value::Record(fields)
            }
        })
    }

    /// Read array or map blocks whose items take at least `item_width` bytes.
    fn read_blocks(
        &mut self,
        item_width: usize,
        mut read_item: impl FnMut(&mut Self) -> Result<(), BinaryError>,
    ) -> Result<(), BinaryError> {
        loop {
            let count = self.read_long()?;
            if count == 0 {
                return Ok(());
            }
            if count < 0 {
                // Negative counts are followed by the block size in bytes
                self.read_long()?;
            }
            let count = count.unsigned_abs();
            let limit = match item_width {
                0 => MAX_ZERO_WIDTH_ITEMS,
                width => (self.remaining() / width) as u64,
            };
            if count > limit {
                return Err(BinaryError::BlockTooLarge {
                    count,
                    remaining: self.remaining(),
                });
            }
            for _ in 0..count {
                read_item(self)?;
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn read_long(&mut self) -> Result<i64, BinaryError> {
        let mut n: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.take(1)?[0];
            if shift >= 64 {
                return Err(BinaryError::VarintOverflow);
            }
            n |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok((n >> 1) as i64 ^ -((n & 1) as i64))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], BinaryError> {
        let len = self.read_long()?;
        let len = usize::try_from(len).map_err(|_| BinaryError::NegativeLength(len))?;
        self.take(len)
    }

    fn read_string(&mut self) -> Result<String, BinaryError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BinaryError::InvalidUtf8)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], BinaryError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BinaryError> {
        if self.remaining() < len {
            return Err(BinaryError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

/// Fewest bytes any value of `schema` encodes to.
fn min_width(schema: &Schema) -> usize {
    match schema {
        Schema::Null => 0,
        Schema::Float => 4,
        Schema::Double => 8,
        Schema::Record(record) => record.fields.iter().map(|f| min_width(&f.schema)).sum(),
        _ => 1,
    }
}

/// Decode a value that must span all of `input`.
///
/// # Errors
///
/// Returns error if the input is truncated, inconsistent with the schema,
/// or has bytes left over.
pub fn decode_value(input: &[u8], schema: &Schema) -> Result<Value, BinaryError> {
    let mut decoder = Decoder::new(input);
    let value = decoder.read_value(schema)?;
    match decoder.remaining() {
        0 => Ok(value),
        trailing => Err(BinaryError::TrailingBytes(trailing)),
    }
}

/// Encode `value` under `schema` into a new buffer.
///
/// # Errors
///
/// Returns error if the value does not conform to the schema.
pub fn to_bytes(value: &Value, schema: &Schema) -> Result<Vec<u8>, BinaryError> {
    let mut out = Vec::new();
    encode_value(value, schema, &mut out)?;
    Ok(out)
}

/// Encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinaryError {
    /// Input ended early
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes required
        needed: usize,
        /// Bytes left
        remaining: usize,
    },
    /// Input continues after the value
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    /// Block declares more items than the input can hold
    #[error("block of {count} items exceeds the {remaining} bytes left")]
    BlockTooLarge {
        /// Declared item count
        count: u64,
        /// Bytes left
        remaining: usize,
    },
    /// Varint longer than 64 bits
    #[error("varint overflow")]
    VarintOverflow,
    /// Long does not fit an int
    #[error("int out of range: {0}")]
    IntOverflow(i64),
    /// Negative string or bytes length
    #[error("negative length {0}")]
    NegativeLength(i64),
    /// String is not UTF-8
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
    /// Boolean byte other than 0 or 1
    #[error("invalid boolean byte {0}")]
    InvalidBoolean(u8),
    /// Union index outside the branches
    #[error("union index {index} out of range for {branches} branches")]
    InvalidUnionIndex {
        /// Index read
        index: i64,
        /// Number of branches
        branches: usize,
    },
    /// Value kind differs from the schema
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        /// Schema type
        expected: &'static str,
        /// Value kind
        found: &'static str,
    },
    /// Record field without value or default
    #[error("missing field {0}")]
    MissingField(String),
    /// Record field not in the schema
    #[error("unknown field {0}")]
    UnknownField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zigzag_varints_match_reference_bytes() {
        let cases: [(i64, &[u8]); 6] = [
            (0, &[0x00]),
            (-1, &[0x01]),
            (1, &[0x02]),
            (-64, &[0x7f]),
            (64, &[0x80, 0x01]),
            (i64::MIN, &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]),
        ];
        for (value, bytes) in cases {
            let mut out = Vec::new();
            write_long(&mut out, value);
            assert_eq!(out, bytes, "encoding {value}");
            assert_eq!(Decoder::new(bytes).read_long().unwrap(), value);
        }
    }

    #[test]
    fn arrays_and_strings_layout() {
        let schema = Schema::Array(Box::new(Schema::String));
        let value = Value::Array(vec![Value::from("foo"), Value::from("bar")]);
        let bytes = to_bytes(&value, &schema).unwrap();
        assert_eq!(
            bytes,
            vec![0x04, 0x06, b'f', b'o', b'o', 0x06, b'b', b'a', b'r', 0x00]
        );
        assert_eq!(decode_value(&bytes, &schema).unwrap(), value);
    }

    #[test]
    fn union_picks_matching_branch() {
        let schema = Schema::Union(vec![Schema::Null, Schema::Map(Box::new(Schema::Int))]);
        assert_eq!(to_bytes(&Value::Null, &schema).unwrap(), vec![0x00]);
        let map = Value::Map(vec![("rex".to_string(), Value::Int(3))]);
        let bytes = to_bytes(&map, &schema).unwrap();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(decode_value(&bytes, &schema).unwrap(), map);
    }

    #[test]
    fn negative_block_counts_are_read() {
        let schema = Schema::Array(Box::new(Schema::Long));
        // count -2, block size 2 bytes, items 1 and 2, end
        let bytes = [0x03, 0x04, 0x02, 0x04, 0x00];
        assert_eq!(
            decode_value(&bytes, &schema).unwrap(),
            Value::Array(vec![Value::Long(1), Value::Long(2)])
        );
    }

    #[test]
    fn truncated_and_trailing_input_is_rejected() {
        let schema = Schema::String;
        assert!(matches!(
            decode_value(&[0x06, b'f'], &schema),
            Err(BinaryError::UnexpectedEof { needed: 3, remaining: 1 })
        ));
        assert_eq!(
            decode_value(&[0x02, b'f', 0x00], &schema),
            Err(BinaryError::TrailingBytes(1))
        );
        assert_eq!(
            decode_value(&[0x04], &Schema::Union(vec![Schema::Null])),
            Err(BinaryError::InvalidUnionIndex { index: 2, branches: 1 })
        );
    }

    #[test]
    fn record_fields_fall_back_to_defaults() {
        let schema = Schema::parse_str(
            r#"{"type": "record", "name": "R", "fields": [
                {"name": "a", "type": "int", "default": 7},
                {"name": "b", "type": "string"}
            ]}"#,
        )
        .unwrap();
        let partial = Value::Record(Record::new().with("b", "x"));
        let bytes = to_bytes(&partial, &schema).unwrap();
        assert_eq!(
            decode_value(&bytes, &schema).unwrap(),
            Value::Record(Record::new().with("a", 7).with("b", "x"))
        );

        let missing = Value::Record(Record::new().with("a", 1));
        assert_eq!(
            to_bytes(&missing, &schema),
            Err(BinaryError::MissingField("b".to_string()))
        );
    }

    #[test]
    fn oversized_block_counts_fail_fast() {
        // array<null> claiming i64::MAX items
        let nulls = Schema::Array(Box::new(Schema::Null));
        let mut bytes = Vec::new();
        write_long(&mut bytes, i64::MAX);
        bytes.push(0x00);
        assert!(matches!(
            decode_value(&bytes, &nulls),
            Err(BinaryError::BlockTooLarge { .. })
        ));

        let three_nulls = [0x06, 0x00];
        assert_eq!(
            decode_value(&three_nulls, &nulls).unwrap(),
            Value::Array(vec![Value::Null; 3])
        );

        // array<double> claiming two items with only eight bytes left
        let doubles = Schema::Array(Box::new(Schema::Double));
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&1.0_f64.to_le_bytes());
        assert_eq!(
            decode_value(&bytes, &doubles),
            Err(BinaryError::BlockTooLarge { count: 2, remaining: 8 })
        );
    }
}
