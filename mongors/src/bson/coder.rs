//! The schema-driven Coder layer (`spec.md` §4.1): maps application types to
//! [`super::Bson`]/[`super::Document`]. `#[derive(mongors::BsonSchema)]`
//! (from `mongors_derive`) generates [`BsonDocument`] impls for a struct's
//! fields; [`IntoBson`]/[`FromBson`] are the per-field conversion traits it
//! targets.

use super::{Bson, Document};
use crate::error::{Error, Result};

/// A type convertible into a [`Bson`] value for storage in a document field.
pub trait IntoBson {
    fn into_bson(self) -> Result<Bson>;
}

/// A type convertible from a [`Bson`] value read out of a document field.
pub trait FromBson: Sized {
    fn from_bson(value: Bson) -> Result<Self>;
}

/// A whole-document mapping, implemented by `#[derive(mongors::BsonSchema)]`
/// for application structs. Not implemented manually in ordinary use.
pub trait BsonDocument: Sized {
    fn from_document(doc: Document) -> Result<Self>;
    fn into_document(self) -> Result<Document>;
}

macro_rules! impl_primitive {
    ($ty:ty, $variant:ident) => {
        impl IntoBson for $ty {
            fn into_bson(self) -> Result<Bson> {
                Ok(Bson::$variant(self))
            }
        }
    };
}

impl_primitive!(f64, Double);
impl_primitive!(bool, Boolean);
impl_primitive!(i32, Int32);
impl_primitive!(i64, Int64);

impl FromBson for bool {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::Boolean(v) => Ok(v),
            other => Err(Error::InvalidArgument(format!(
                "expected bool, found {:?}",
                other.element_type()
            ))),
        }
    }
}

// `spec.md` §4.1 "Numbers: lossless-only (reject narrowing that loses
// value)": a numeric field accepts any of the three wire number types as
// long as the value survives the trip exactly, rather than only the one
// variant matching the Rust type. A document built by an older schema
// version, or returned by the server for a field the driver declared `i32`
// but the server stores as `int64`/`double`, should still decode as long as
// the value itself fits.

impl FromBson for i32 {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::Int32(v) => Ok(v),
            Bson::Int64(v) => i32::try_from(v)
                .map_err(|_| Error::InvalidArgument(format!("int64 {v} does not fit losslessly in i32"))),
            Bson::Double(v) => {
                if v.fract() == 0.0 && v >= i32::MIN as f64 && v <= i32::MAX as f64 {
                    Ok(v as i32)
                } else {
                    Err(Error::InvalidArgument(format!(
                        "double {v} does not convert losslessly to i32"
                    )))
                }
            }
            other => Err(Error::InvalidArgument(format!(
                "expected a number, found {:?}",
                other.element_type()
            ))),
        }
    }
}

impl FromBson for i64 {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::Int64(v) => Ok(v),
            Bson::Int32(v) => Ok(v as i64),
            Bson::Double(v) => {
                if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 && (v as i64) as f64 == v {
                    Ok(v as i64)
                } else {
                    Err(Error::InvalidArgument(format!(
                        "double {v} does not convert losslessly to i64"
                    )))
                }
            }
            other => Err(Error::InvalidArgument(format!(
                "expected a number, found {:?}",
                other.element_type()
            ))),
        }
    }
}

impl FromBson for f64 {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::Double(v) => Ok(v),
            Bson::Int32(v) => Ok(v as f64),
            Bson::Int64(v) => {
                if (v as f64) as i64 == v {
                    Ok(v as f64)
                } else {
                    Err(Error::InvalidArgument(format!(
                        "int64 {v} does not convert losslessly to f64"
                    )))
                }
            }
            other => Err(Error::InvalidArgument(format!(
                "expected a number, found {:?}",
                other.element_type()
            ))),
        }
    }
}

impl IntoBson for String {
    fn into_bson(self) -> Result<Bson> {
        Ok(Bson::String(self))
    }
}

impl FromBson for String {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::String(s) => Ok(s),
            other => Err(Error::InvalidArgument(format!(
                "expected string, found {:?}",
                other.element_type()
            ))),
        }
    }
}

impl IntoBson for Document {
    fn into_bson(self) -> Result<Bson> {
        Ok(Bson::Document(self))
    }
}

impl FromBson for Document {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::Document(d) => Ok(d),
            other => Err(Error::InvalidArgument(format!(
                "expected document, found {:?}",
                other.element_type()
            ))),
        }
    }
}

impl IntoBson for Bson {
    fn into_bson(self) -> Result<Bson> {
        Ok(self)
    }
}

impl FromBson for Bson {
    fn from_bson(value: Bson) -> Result<Self> {
        Ok(value)
    }
}

impl<T: IntoBson> IntoBson for Option<T> {
    fn into_bson(self) -> Result<Bson> {
        match self {
            Some(v) => v.into_bson(),
            None => Ok(Bson::Null),
        }
    }
}

impl<T: FromBson> FromBson for Option<T> {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::Null | Bson::Undefined => Ok(None),
            other => Ok(Some(T::from_bson(other)?)),
        }
    }
}

impl<T: IntoBson> IntoBson for Vec<T> {
    fn into_bson(self) -> Result<Bson> {
        let values = self
            .into_iter()
            .map(IntoBson::into_bson)
            .collect::<Result<Vec<_>>>()?;
        Ok(Bson::Array(values))
    }
}

impl<T: FromBson> FromBson for Vec<T> {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::Array(values) => values.into_iter().map(T::from_bson).collect(),
            other => Err(Error::InvalidArgument(format!(
                "expected array, found {:?}",
                other.element_type()
            ))),
        }
    }
}

impl IntoBson for super::ObjectId {
    fn into_bson(self) -> Result<Bson> {
        Ok(Bson::ObjectId(self))
    }
}

impl FromBson for super::ObjectId {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::ObjectId(oid) => Ok(oid),
            other => Err(Error::InvalidArgument(format!(
                "expected object id, found {:?}",
                other.element_type()
            ))),
        }
    }
}

impl IntoBson for super::DateTime {
    fn into_bson(self) -> Result<Bson> {
        Ok(Bson::DateTime(self))
    }
}

impl FromBson for super::DateTime {
    fn from_bson(value: Bson) -> Result<Self> {
        match value {
            Bson::DateTime(dt) => Ok(dt),
            other => Err(Error::InvalidArgument(format!(
                "expected date, found {:?}",
                other.element_type()
            ))),
        }
    }
}

/// The per-field conversion functions `mongors_derive` calls into for
/// `#[mongors(date = "...")]` / `#[mongors(uuid = "...")]` / `#[mongors(bytes
/// = "...")]`, implementing the strategy table in `spec.md` §4.1. Not meant
/// to be called directly in ordinary use; the derive macro is the intended
/// caller, which is why the strategy name arrives as a plain `&str` rather
/// than an enum — it's a string the field attribute literal is passed through
/// verbatim.
pub mod strategies {
    use super::{Bson, Error, Result};
    use crate::bson::{Binary, BinarySubtype, DateTime as WireDateTime};
    use base64::Engine;

    fn unknown_strategy(aspect: &str, strategy: &str) -> Error {
        Error::InvalidArgument(format!("unknown {aspect} strategy `{strategy}`"))
    }

    fn expected(what: &str, value: &Bson) -> Error {
        Error::InvalidArgument(format!("expected {what}, found {:?}", value.element_type()))
    }

    pub fn date_to_bson(dt: chrono::DateTime<chrono::Utc>, strategy: &str) -> Result<Bson> {
        match strategy {
            "wire_date_time" => Ok(Bson::DateTime(WireDateTime::from(dt))),
            "ms_i64" => Ok(Bson::Int64(dt.timestamp_millis())),
            "s_i64" => Ok(Bson::Int64(dt.timestamp())),
            "ms_f64" => Ok(Bson::Double(dt.timestamp_millis() as f64)),
            "s_f64" => Ok(Bson::Double(dt.timestamp() as f64)),
            "iso8601_string" => Ok(Bson::String(dt.to_rfc3339())),
            other => Err(unknown_strategy("date", other)),
        }
    }

    pub fn date_from_bson(value: Bson, strategy: &str) -> Result<chrono::DateTime<chrono::Utc>> {
        match strategy {
            "wire_date_time" => match value {
                Bson::DateTime(dt) => Ok(dt.into()),
                other => Err(expected("a date", &other)),
            },
            "ms_i64" => match value {
                Bson::Int64(ms) => Ok(WireDateTime::from_millis(ms).into()),
                Bson::Int32(ms) => Ok(WireDateTime::from_millis(ms as i64).into()),
                other => Err(expected("an int64 millisecond timestamp", &other)),
            },
            "s_i64" => match value {
                Bson::Int64(s) => Ok(WireDateTime::from_millis(s.saturating_mul(1000)).into()),
                Bson::Int32(s) => Ok(WireDateTime::from_millis(s as i64 * 1000).into()),
                other => Err(expected("an int64 second timestamp", &other)),
            },
            "ms_f64" => match value {
                Bson::Double(ms) => Ok(WireDateTime::from_millis(ms as i64).into()),
                other => Err(expected("a double millisecond timestamp", &other)),
            },
            "s_f64" => match value {
                Bson::Double(s) => Ok(WireDateTime::from_millis((s * 1000.0) as i64).into()),
                other => Err(expected("a double second timestamp", &other)),
            },
            "iso8601_string" => match value {
                Bson::String(s) => chrono::DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .map_err(|e| Error::InvalidArgument(format!("invalid ISO-8601 date `{s}`: {e}"))),
                other => Err(expected("an ISO-8601 date string", &other)),
            },
            other => Err(unknown_strategy("date", other)),
        }
    }

    pub fn uuid_to_bson(id: uuid::Uuid, strategy: &str) -> Result<Bson> {
        match strategy {
            "binary" => Ok(Bson::Binary(Binary::uuid(*id.as_bytes()))),
            "binary_legacy" => Ok(Bson::Binary(Binary::new(BinarySubtype::UuidOld, id.as_bytes().to_vec()))),
            "string" => Ok(Bson::String(id.to_string())),
            other => Err(unknown_strategy("uuid", other)),
        }
    }

    pub fn uuid_from_bson(value: Bson, strategy: &str) -> Result<uuid::Uuid> {
        match strategy {
            "binary" | "binary_legacy" => match value {
                Bson::Binary(b) if b.bytes.len() == 16 => {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(&b.bytes);
                    Ok(uuid::Uuid::from_bytes(bytes))
                }
                Bson::Binary(b) => Err(Error::InvalidArgument(format!(
                    "uuid binary must be 16 bytes, found {}",
                    b.bytes.len()
                ))),
                other => Err(expected("binary", &other)),
            },
            "string" => match value {
                Bson::String(s) => {
                    uuid::Uuid::parse_str(&s).map_err(|e| Error::InvalidArgument(format!("invalid uuid `{s}`: {e}")))
                }
                other => Err(expected("a uuid string", &other)),
            },
            other => Err(unknown_strategy("uuid", other)),
        }
    }

    pub fn bytes_to_bson(bytes: Vec<u8>, strategy: &str) -> Result<Bson> {
        match strategy {
            "binary" => Ok(Bson::Binary(Binary::generic(bytes))),
            "base64" => Ok(Bson::String(base64::engine::general_purpose::STANDARD.encode(bytes))),
            other => Err(unknown_strategy("bytes", other)),
        }
    }

    pub fn bytes_from_bson(value: Bson, strategy: &str) -> Result<Vec<u8>> {
        match strategy {
            "binary" => match value {
                Bson::Binary(b) => Ok(b.bytes),
                other => Err(expected("binary", &other)),
            },
            "base64" => match value {
                Bson::String(s) => base64::engine::general_purpose::STANDARD
                    .decode(&s)
                    .map_err(|e| Error::InvalidArgument(format!("invalid base64 `{s}`: {e}"))),
                other => Err(expected("a base64 string", &other)),
            },
            other => Err(unknown_strategy("bytes", other)),
        }
    }
}
