//! Counted-sequence encoding and its caps.

use crate::encoding::*;

#[test]
fn roundtrip_string_sequence() {
    let names = vec![String::from("users"), String::from("orders")];
    let mut out = Vec::new();
    encode_slice(&names, &mut out).unwrap();

    let mut r = Reader::new(&out);
    let decoded: Vec<String> = decode_seq(&mut r).unwrap();
    assert_eq!(decoded, names);
    assert_eq!(r.remaining(), 0);
}

#[test]
fn roundtrip_empty_sequence() {
    let names: Vec<String> = Vec::new();
    let mut out = Vec::new();
    encode_slice(&names, &mut out).unwrap();
    assert_eq!(out.len(), 4);

    let mut r = Reader::new(&out);
    let decoded: Vec<String> = decode_seq(&mut r).unwrap();
    assert!(decoded.is_empty());
}

#[test]
fn sequence_count_cap_enforced() {
    let bytes = (MAX_SEQ_ITEMS + 1).to_le_bytes();

    let mut r = Reader::new(&bytes);
    assert!(matches!(
        decode_seq::<String>(&mut r).unwrap_err(),
        EncodingError::OverCap { .. }
    ));
}

#[test]
fn truncated_item_surfaces_as_truncated() {
    let names = vec![String::from("alpha"), String::from("beta")];
    let mut out = Vec::new();
    encode_slice(&names, &mut out).unwrap();
    out.truncate(out.len() - 3);

    let mut r = Reader::new(&out);
    assert!(matches!(
        decode_seq::<String>(&mut r).unwrap_err(),
        EncodingError::Truncated { .. }
    ));
}

#[test]
fn sequence_leaves_trailing_bytes_for_caller() {
    let names = vec![String::from("solo")];
    let mut out = Vec::new();
    encode_slice(&names, &mut out).unwrap();
    out.extend_from_slice(b"tail");

    let mut r = Reader::new(&out);
    let decoded: Vec<String> = decode_seq(&mut r).unwrap();
    assert_eq!(decoded, names);
    assert_eq!(r.remaining(), 4);
}
