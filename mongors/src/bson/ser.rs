//! The encode half of the BSON codec. No I/O: works over an in-memory
//! `Vec<u8>`, matching `spec.md` §4.1's "no I/O" framing for the codec layer.
//! The wire layer (`crate::wire`) is what actually puts these bytes on a
//! socket.

use super::{Bson, BinarySubtype, Document};

/// Encodes a document to its canonical wire representation:
/// `int32 totalLength | (type:u8 | key:cstring | value-body)* | 0x00`.
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, value) in doc.iter() {
        encode_element(&mut body, key, value);
    }
    let total_len = 4 + body.len() + 1;
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as i32).to_le_bytes());
    out.extend_from_slice(&body);
    out.push(0x00);
    out
}

fn encode_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0x00);
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&((bytes.len() + 1) as i32).to_le_bytes());
    out.extend_from_slice(bytes);
    out.push(0x00);
}

fn array_as_document(values: &[Bson]) -> Document {
    let mut doc = Document::new();
    for (i, v) in values.iter().enumerate() {
        doc.insert(i.to_string(), v.clone());
    }
    doc
}

fn encode_element(out: &mut Vec<u8>, key: &str, value: &Bson) {
    out.push(value.element_type() as u8);
    encode_cstring(out, key);
    encode_value(out, value);
}

fn encode_value(out: &mut Vec<u8>, value: &Bson) {
    match value {
        Bson::Double(d) => out.extend_from_slice(&d.to_le_bytes()),
        Bson::String(s) => encode_string(out, s),
        Bson::Document(d) => out.extend_from_slice(&encode_document(d)),
        Bson::Array(values) => out.extend_from_slice(&encode_document(&array_as_document(values))),
        Bson::Binary(b) => encode_binary(out, b),
        Bson::Undefined => {}
        Bson::ObjectId(oid) => out.extend_from_slice(&oid.bytes()),
        Bson::Boolean(b) => out.push(if *b { 0x01 } else { 0x00 }),
        Bson::DateTime(dt) => out.extend_from_slice(&dt.millis().to_le_bytes()),
        Bson::Null => {}
        Bson::RegularExpression { pattern, options } => {
            encode_cstring(out, pattern);
            encode_cstring(out, options);
        }
        Bson::DbPointer { namespace, id } => {
            encode_string(out, namespace);
            out.extend_from_slice(&id.bytes());
        }
        Bson::JavaScriptCode(code) => encode_string(out, code),
        Bson::Symbol(s) => encode_string(out, s),
        Bson::JavaScriptCodeWithScope { code, scope } => {
            let mut inner = Vec::new();
            encode_string(&mut inner, code);
            inner.extend_from_slice(&encode_document(scope));
            let total_len = 4 + inner.len();
            out.extend_from_slice(&(total_len as i32).to_le_bytes());
            out.extend_from_slice(&inner);
        }
        Bson::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Bson::Timestamp(t) => {
            let packed = ((t.seconds as u64) << 32) | t.increment as u64;
            out.extend_from_slice(&packed.to_le_bytes());
        }
        Bson::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Bson::Decimal128(d) => out.extend_from_slice(&d.bytes()),
        Bson::MinKey => {}
        Bson::MaxKey => {}
    }
}

fn encode_binary(out: &mut Vec<u8>, binary: &super::Binary) {
    if binary.subtype == BinarySubtype::BinaryOld {
        // Legacy subtype 0x02 carries a second, inner length prefix ahead of
        // the payload; preserved for byte-identical round-trip per
        // `spec.md` §4.1.
        let declared_len = 4 + binary.bytes.len();
        out.extend_from_slice(&(declared_len as i32).to_le_bytes());
        out.push(binary.subtype.to_u8());
        out.extend_from_slice(&(binary.bytes.len() as i32).to_le_bytes());
        out.extend_from_slice(&binary.bytes);
    } else {
        out.extend_from_slice(&(binary.bytes.len() as i32).to_le_bytes());
        out.push(binary.subtype.to_u8());
        out.extend_from_slice(&binary.bytes);
    }
}
