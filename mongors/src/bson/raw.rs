//! Zero-copy borrowed views over an already-encoded document, used by the
//! wire layer to pull out `$clusterTime`/`operationTime`/`errorLabels`
//! without paying for a full [`super::Document`] allocation when only a
//! handful of top-level fields are needed.

use super::de::DecodeError;
use super::{Bson, ElementType};

/// A borrowed view over bytes that are assumed to already be a validly
/// framed document (e.g. the immediate reply body the wire layer just
/// received). Iterating yields `(key, RawBson)` pairs in wire order; no
/// allocation happens until a scalar field is materialized.
#[derive(Clone, Copy)]
pub struct RawDocument<'a> {
    body: &'a [u8],
}

#[derive(Clone, Copy)]
pub enum RawBson<'a> {
    Double(f64),
    String(&'a str),
    Document(RawDocument<'a>),
    Array(RawDocument<'a>),
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Timestamp(super::Timestamp),
    ObjectId(super::ObjectId),
    Null,
    Other(ElementType),
}

impl<'a> RawDocument<'a> {
    /// `buf` must be exactly one encoded document, as produced by
    /// [`super::ser::encode_document`] or read off the wire with the
    /// length prefix already validated.
    pub fn new(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let declared = i32::from_le_bytes(
            buf.get(0..4)
                .ok_or(DecodeError::Truncated("document length"))?
                .try_into()
                .unwrap(),
        );
        if declared < 5 || declared as usize != buf.len() || buf[buf.len() - 1] != 0 {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        Ok(RawDocument { body: buf })
    }

    pub fn iter(&self) -> RawIter<'a> {
        RawIter {
            buf: &self.body[4..self.body.len() - 1],
            pos: 0,
        }
    }

    /// Finds the first top-level field matching `key` without decoding
    /// siblings, matching "first occurrence wins" lookup semantics.
    pub fn get(&self, key: &str) -> Option<RawBson<'a>> {
        self.iter().find_map(|r| match r {
            Ok((k, v)) if k == key => Some(v),
            _ => None,
        })
    }

    pub fn to_owned_document(&self) -> Result<super::Document, DecodeError> {
        super::de::decode_document(self.body)
    }
}

pub struct RawIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for RawIter<'a> {
    type Item = Result<(&'a str, RawBson<'a>), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        Some(self.step())
    }
}

impl<'a> RawIter<'a> {
    fn step(&mut self) -> Result<(&'a str, RawBson<'a>), DecodeError> {
        let tag = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::Truncated("raw element tag"))?;
        let element_type = ElementType::from_u8(tag).ok_or(DecodeError::UnknownType(tag))?;
        self.pos += 1;

        let key_start = self.pos;
        let nul = self.buf[key_start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedCString(key_start))?;
        let key = std::str::from_utf8(&self.buf[key_start..key_start + nul])
            .map_err(|_| DecodeError::InvalidUtf8(key_start))?;
        self.pos = key_start + nul + 1;

        let value = self.read_value(element_type)?;
        Ok((key, value))
    }

    fn read_value(&mut self, element_type: ElementType) -> Result<RawBson<'a>, DecodeError> {
        macro_rules! take {
            ($n:expr) => {{
                let slice = self
                    .buf
                    .get(self.pos..self.pos + $n)
                    .ok_or(DecodeError::Truncated("raw value"))?;
                self.pos += $n;
                slice
            }};
        }

        Ok(match element_type {
            ElementType::Double => RawBson::Double(f64::from_le_bytes(take!(8).try_into().unwrap())),
            ElementType::String => {
                let len = i32::from_le_bytes(take!(4).try_into().unwrap());
                if len < 1 {
                    return Err(DecodeError::Truncated("raw string length"));
                }
                let bytes = take!(len as usize);
                let s = std::str::from_utf8(&bytes[..bytes.len() - 1])
                    .map_err(|_| DecodeError::InvalidUtf8(self.pos))?;
                RawBson::String(s)
            }
            ElementType::Document | ElementType::Array => {
                let len = i32::from_le_bytes(
                    self.buf
                        .get(self.pos..self.pos + 4)
                        .ok_or(DecodeError::Truncated("raw nested length"))?
                        .try_into()
                        .unwrap(),
                );
                if len < 5 {
                    return Err(DecodeError::Truncated("raw nested length"));
                }
                let bytes = take!(len as usize);
                let nested = RawDocument { body: bytes };
                if element_type == ElementType::Document {
                    RawBson::Document(nested)
                } else {
                    RawBson::Array(nested)
                }
            }
            ElementType::Boolean => RawBson::Boolean(take!(1)[0] != 0),
            ElementType::Int32 => RawBson::Int32(i32::from_le_bytes(take!(4).try_into().unwrap())),
            ElementType::Int64 => RawBson::Int64(i64::from_le_bytes(take!(8).try_into().unwrap())),
            ElementType::Timestamp => {
                let packed = u64::from_le_bytes(take!(8).try_into().unwrap());
                RawBson::Timestamp(super::Timestamp::new((packed >> 32) as u32, packed as u32))
            }
            ElementType::ObjectId => {
                let bytes = take!(12);
                RawBson::ObjectId(super::ObjectId::from_bytes(bytes.try_into().unwrap()))
            }
            ElementType::Null | ElementType::Undefined | ElementType::MinKey | ElementType::MaxKey => {
                RawBson::Null
            }
            // Variable-length/rarely-consulted types aren't given a dedicated
            // fast path; still skip their bytes correctly so iteration past
            // them stays valid, falling back to `to_owned_document` when one
            // of these is actually needed.
            ElementType::Binary => {
                let len = i32::from_le_bytes(take!(4).try_into().unwrap());
                if len < 0 {
                    return Err(DecodeError::Truncated("raw binary length"));
                }
                take!(1 + len as usize);
                RawBson::Other(element_type)
            }
            ElementType::DateTime => {
                take!(8);
                RawBson::Other(element_type)
            }
            ElementType::Decimal128 => {
                take!(16);
                RawBson::Other(element_type)
            }
            ElementType::RegularExpression => {
                self.skip_cstring()?;
                self.skip_cstring()?;
                RawBson::Other(element_type)
            }
            ElementType::DbPointer => {
                let len = i32::from_le_bytes(take!(4).try_into().unwrap());
                take!(len.max(0) as usize + 12);
                RawBson::Other(element_type)
            }
            ElementType::JavaScriptCode | ElementType::Symbol => {
                let len = i32::from_le_bytes(take!(4).try_into().unwrap());
                take!(len.max(0) as usize);
                RawBson::Other(element_type)
            }
            ElementType::JavaScriptCodeWithScope => {
                let total_len = i32::from_le_bytes(take!(4).try_into().unwrap());
                take!(total_len.max(4) as usize - 4);
                RawBson::Other(element_type)
            }
        })
    }

    fn skip_cstring(&mut self) -> Result<(), DecodeError> {
        let nul = self.buf[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedCString(self.pos))?;
        self.pos += nul + 1;
        Ok(())
    }
}

impl<'a> RawBson<'a> {
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            RawBson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<RawDocument<'a>> {
        match self {
            RawBson::Document(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<RawDocument<'a>> {
        match self {
            RawBson::Array(d) => Some(*d),
            _ => None,
        }
    }

    pub fn to_owned(&self) -> Bson {
        match self {
            RawBson::Double(d) => Bson::Double(*d),
            RawBson::String(s) => Bson::String(s.to_string()),
            RawBson::Document(d) => Bson::Document(d.to_owned_document().unwrap_or_default()),
            RawBson::Array(d) => {
                let doc = d.to_owned_document().unwrap_or_default();
                Bson::Array(doc.iter().map(|(_, v)| v.clone()).collect())
            }
            RawBson::Boolean(b) => Bson::Boolean(*b),
            RawBson::Int32(v) => Bson::Int32(*v),
            RawBson::Int64(v) => Bson::Int64(*v),
            RawBson::Timestamp(t) => Bson::Timestamp(*t),
            RawBson::ObjectId(oid) => Bson::ObjectId(*oid),
            RawBson::Null => Bson::Null,
            RawBson::Other(_) => Bson::Null,
        }
    }

    pub fn as_timestamp(&self) -> Option<super::Timestamp> {
        match self {
            RawBson::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RawBson::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawBson::Int64(v) => Some(*v),
            RawBson::Int32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawBson::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RawBson::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}
