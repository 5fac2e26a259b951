//! The decode half of the BSON codec.

use super::{
    Bson, BinarySubtype, Binary, Decimal128, Document, ElementType, ObjectId, Timestamp,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("declared document length {declared} does not match buffer length {actual}")]
    LengthMismatch { declared: i32, actual: usize },
    #[error("cstring at offset {0} is missing its NUL terminator")]
    UnterminatedCString(usize),
    #[error("invalid UTF-8 in string at offset {0}")]
    InvalidUtf8(usize),
    #[error("unknown BSON type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("document is missing its trailing NUL terminator")]
    MissingTerminator,
    #[error("buffer truncated while reading {0}")]
    Truncated(&'static str),
    #[error("array keys are not the canonical \"0\",\"1\",.. sequence")]
    NonCanonicalArrayKeys,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1, "u8")?[0])
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take(4, "i32")?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.take(8, "i64")?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8, "u64")?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.take(8, "f64")?.try_into().unwrap()))
    }

    fn read_cstring(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let nul = self.buf[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedCString(start))?;
        let bytes = &self.buf[self.pos..self.pos + nul];
        let s = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::InvalidUtf8(start))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_i32()?;
        if len < 1 {
            return Err(DecodeError::Truncated("string length"));
        }
        let start = self.pos;
        let bytes = self.take(len as usize, "string body")?;
        if bytes.last() != Some(&0) {
            return Err(DecodeError::UnterminatedCString(start));
        }
        let s = std::str::from_utf8(&bytes[..bytes.len() - 1])
            .map_err(|_| DecodeError::InvalidUtf8(start))?
            .to_string();
        Ok(s)
    }
}

/// Decodes a single document from the start of `buf`. `buf` must contain
/// exactly one encoded document (no trailing bytes); callers that frame
/// multiple documents back-to-back (e.g. the wire layer) should slice first.
pub fn decode_document(buf: &[u8]) -> Result<Document, DecodeError> {
    let declared = i32::from_le_bytes(
        buf.get(0..4)
            .ok_or(DecodeError::Truncated("document length"))?
            .try_into()
            .unwrap(),
    );
    if declared < 5 || declared as usize != buf.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    if buf[buf.len() - 1] != 0 {
        return Err(DecodeError::MissingTerminator);
    }

    let mut cursor = Cursor::new(&buf[4..buf.len() - 1]);
    let mut doc = Document::new();
    while cursor.remaining() > 0 {
        let tag = cursor.read_u8()?;
        let element_type = ElementType::from_u8(tag).ok_or(DecodeError::UnknownType(tag))?;
        let key = cursor.read_cstring()?;
        let value = decode_value(&mut cursor, element_type)?;
        doc.insert_first_wins(key, value);
    }
    Ok(doc)
}

/// Decodes a BSON array, which is wire-identical to a document whose keys
/// must be the canonical decimal-string index sequence "0","1",.. in order
/// (`spec.md` §4.1): any other key sequence is a decode error, not a
/// tolerated oddity.
fn decode_array_value(buf: &[u8]) -> Result<Vec<Bson>, DecodeError> {
    let doc = decode_document(buf)?;
    let mut values = Vec::with_capacity(doc.len());
    for (i, (key, value)) in doc.iter().enumerate() {
        if key != &i.to_string() {
            return Err(DecodeError::NonCanonicalArrayKeys);
        }
        values.push(value.clone());
    }
    Ok(values)
}

fn decode_value(cursor: &mut Cursor<'_>, element_type: ElementType) -> Result<Bson, DecodeError> {
    Ok(match element_type {
        ElementType::Double => Bson::Double(cursor.read_f64()?),
        ElementType::String => Bson::String(cursor.read_string()?),
        ElementType::Document => {
            let len = peek_doc_len(cursor)?;
            let bytes = cursor.take(len, "embedded document")?;
            Bson::Document(decode_document(bytes)?)
        }
        ElementType::Array => {
            let len = peek_doc_len(cursor)?;
            let bytes = cursor.take(len, "embedded array")?;
            Bson::Array(decode_array_value(bytes)?)
        }
        ElementType::Binary => Bson::Binary(decode_binary(cursor)?),
        ElementType::Undefined => Bson::Undefined,
        ElementType::ObjectId => {
            let bytes = cursor.take(12, "object id")?;
            Bson::ObjectId(ObjectId::from_bytes(bytes.try_into().unwrap()))
        }
        ElementType::Boolean => {
            let b = cursor.read_u8()?;
            Bson::Boolean(b != 0)
        }
        ElementType::DateTime => Bson::DateTime(super::DateTime::from_millis(cursor.read_i64()?)),
        ElementType::Null => Bson::Null,
        ElementType::RegularExpression => {
            let pattern = cursor.read_cstring()?;
            let options = cursor.read_cstring()?;
            Bson::RegularExpression { pattern, options }
        }
        ElementType::DbPointer => {
            let namespace = cursor.read_string()?;
            let bytes = cursor.take(12, "dbpointer id")?;
            Bson::DbPointer {
                namespace,
                id: ObjectId::from_bytes(bytes.try_into().unwrap()),
            }
        }
        ElementType::JavaScriptCode => Bson::JavaScriptCode(cursor.read_string()?),
        ElementType::Symbol => Bson::Symbol(cursor.read_string()?),
        ElementType::JavaScriptCodeWithScope => {
            let total_len = cursor.read_i32()?;
            if total_len < 4 {
                return Err(DecodeError::Truncated("code_w_scope length"));
            }
            let start_remaining = cursor.remaining();
            let code = cursor.read_string()?;
            let doc_len = peek_doc_len(cursor)?;
            let doc_bytes = cursor.take(doc_len, "code_w_scope scope")?;
            let scope = decode_document(doc_bytes)?;
            let consumed = start_remaining - cursor.remaining() + 4;
            if consumed as i32 != total_len {
                return Err(DecodeError::LengthMismatch {
                    declared: total_len,
                    actual: consumed,
                });
            }
            Bson::JavaScriptCodeWithScope { code, scope }
        }
        ElementType::Int32 => Bson::Int32(cursor.read_i32()?),
        ElementType::Timestamp => {
            let packed = cursor.read_u64()?;
            Bson::Timestamp(Timestamp::new((packed >> 32) as u32, packed as u32))
        }
        ElementType::Int64 => Bson::Int64(cursor.read_i64()?),
        ElementType::Decimal128 => {
            let bytes = cursor.take(16, "decimal128")?;
            Bson::Decimal128(Decimal128::from_bytes(bytes.try_into().unwrap()))
        }
        ElementType::MinKey => Bson::MinKey,
        ElementType::MaxKey => Bson::MaxKey,
    })
}

fn peek_doc_len(cursor: &Cursor<'_>) -> Result<usize, DecodeError> {
    let bytes = cursor
        .buf
        .get(cursor.pos..cursor.pos + 4)
        .ok_or(DecodeError::Truncated("nested document length"))?;
    let len = i32::from_le_bytes(bytes.try_into().unwrap());
    if len < 5 {
        return Err(DecodeError::Truncated("nested document length"));
    }
    Ok(len as usize)
}

fn decode_binary(cursor: &mut Cursor<'_>) -> Result<Binary, DecodeError> {
    let declared_len = cursor.read_i32()?;
    if declared_len < 0 {
        return Err(DecodeError::Truncated("binary length"));
    }
    let subtype = BinarySubtype::from_u8(cursor.read_u8()?);
    if subtype == BinarySubtype::BinaryOld {
        let inner_len = cursor.read_i32()?;
        if inner_len < 0 || inner_len as i32 != declared_len - 4 {
            return Err(DecodeError::LengthMismatch {
                declared: declared_len,
                actual: inner_len.max(0) as usize + 4,
            });
        }
        let bytes = cursor.take(inner_len as usize, "legacy binary body")?.to_vec();
        Ok(Binary::new(subtype, bytes))
    } else {
        let bytes = cursor.take(declared_len as usize, "binary body")?.to_vec();
        Ok(Binary::new(subtype, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::ser::encode_document;
    use crate::doc;

    #[test]
    fn round_trip_scenario_from_spec() {
        let doc = doc! {
            "x" => Bson::Int32(42),
            "a" => Bson::Array(vec![Bson::String("s".into()), Bson::Boolean(true), Bson::Null]),
        };
        let bytes = encode_document(&doc);
        assert_eq!(bytes.len(), 0x24);
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(decoded, doc);

        let mut corrupted = bytes.clone();
        *corrupted.last_mut().unwrap() = 0xFF;
        assert!(decode_document(&corrupted).is_err());
    }

    #[test]
    fn duplicate_keys_keep_first_occurrence() {
        let mut doc = Document::new();
        doc.insert("k", Bson::Int32(1));
        let bytes_a = encode_document(&doc);
        let mut doc2 = Document::new();
        doc2.insert("k", Bson::Int32(2));
        let bytes_b = encode_document(&doc2);

        // manually splice two encodings of the same key together
        let mut combined_body = Vec::new();
        combined_body.extend_from_slice(&bytes_a[4..bytes_a.len() - 1]);
        combined_body.extend_from_slice(&bytes_b[4..bytes_b.len() - 1]);
        let mut combined = Vec::new();
        let total = 4 + combined_body.len() + 1;
        combined.extend_from_slice(&(total as i32).to_le_bytes());
        combined.extend_from_slice(&combined_body);
        combined.push(0);

        let decoded = decode_document(&combined).unwrap();
        assert_eq!(decoded.get_i32("k"), Some(1));
    }
}
