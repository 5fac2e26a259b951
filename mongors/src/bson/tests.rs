use super::*;
use crate::doc;

#[test]
fn nested_documents_and_arrays_share_framing() {
    let mut inner = Document::new();
    inner.insert("y", Bson::Int64(7));
    let doc = doc! {
        "nested" => Bson::Document(inner.clone()),
        "list" => Bson::Array(vec![Bson::Document(inner)]),
    };
    let bytes = ser::encode_document(&doc);
    let back = de::decode_document(&bytes).unwrap();
    assert_eq!(doc, back);
}

#[test]
fn array_with_non_canonical_keys_is_rejected() {
    // hand-build a document whose "array" actually has keys "0","2" (a gap),
    // which must not decode as an array.
    let mut fake_array_doc = Document::new();
    fake_array_doc.insert("0", Bson::Int32(1));
    fake_array_doc.insert("2", Bson::Int32(2));
    let inner_bytes = ser::encode_document(&fake_array_doc);

    let mut body = Vec::new();
    body.push(ElementType::Array as u8);
    body.extend_from_slice(b"a\0");
    body.extend_from_slice(&inner_bytes);
    let total = 4 + body.len() + 1;
    let mut out = Vec::new();
    out.extend_from_slice(&(total as i32).to_le_bytes());
    out.extend_from_slice(&body);
    out.push(0);

    assert!(de::decode_document(&out).is_err());
}

#[test]
fn legacy_binary_subtype_round_trips_inner_length() {
    let bin = Binary::new(BinarySubtype::BinaryOld, vec![1, 2, 3, 4]);
    let doc = doc! { "b" => Bson::Binary(bin.clone()) };
    let bytes = ser::encode_document(&doc);
    let back = de::decode_document(&bytes).unwrap();
    match back.get("b").unwrap() {
        Bson::Binary(b) => assert_eq!(b, &bin),
        _ => panic!("expected binary"),
    }
}

#[test]
fn raw_document_reads_top_level_field_without_full_decode() {
    let doc = doc! { "operationTime" => Bson::Timestamp(Timestamp::new(5, 1)), "ok" => Bson::Double(1.0) };
    let bytes = ser::encode_document(&doc);
    let raw = RawDocument::new(&bytes).unwrap();
    assert_eq!(raw.get("operationTime").and_then(|v| v.as_timestamp()), Some(Timestamp::new(5, 1)));
    assert_eq!(raw.get("ok").and_then(|v| v.as_f64()), Some(1.0));
}
