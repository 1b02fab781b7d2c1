//! Order-preserving key codec.
//!
//! Every key is `index tag byte ++ encoded components` in the index's
//! component order, where each component encoding compares bytewise the
//! same way the decoded values compare. That property is what lets the
//! matcher run prefix scans and `[lo, hi)` range scans (time-range
//! pushdown) directly against the KV store.
//!
//! Values are encoded with a leading type-ordinal byte, then:
//!
//! - `Int64`: sign bit flipped, big-endian
//! - `Float64`: IEEE bits, negated when negative, sign bit set when
//!   positive, big-endian (IEEE total order)
//! - `Bytes`/`String`/`Keyword` name: `0x00` escaped as `0x00 0xff`,
//!   terminated by `0x00 0x00`
//! - `Time`: seconds sign-flipped big-endian, then subsecond nanos
//! - `Identity`: the raw 20 hash bytes (fixed length)
//!
//! The stored entry payload is the bincode-serialized datom itself, so
//! decoding a scan hit never reverses the key encoding.

use super::{Component, Index};
use crate::datom::Datom;
use crate::error::{QueryError, Result};
use crate::value::{Identity, Keyword, Value};

const TERMINATOR: [u8; 2] = [0x00, 0x00];
const ESCAPED_ZERO: [u8; 2] = [0x00, 0xff];

/// Append an order-preserving encoding of `value`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) {
    out.push(value.type_ordinal());
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Int64(i) => out.extend_from_slice(&(*i as u64 ^ (1 << 63)).to_be_bytes()),
        Value::Float64(f) => out.extend_from_slice(&order_float_bits(*f).to_be_bytes()),
        Value::Bytes(b) => encode_terminated(b, out),
        Value::String(s) => encode_terminated(s.as_bytes(), out),
        Value::Time(t) => {
            out.extend_from_slice(&(t.timestamp() as u64 ^ (1 << 63)).to_be_bytes());
            out.extend_from_slice(&t.timestamp_subsec_nanos().to_be_bytes());
        }
        Value::Keyword(k) => encode_terminated(k.name().as_bytes(), out),
        Value::Identity(id) => out.extend_from_slice(id.bytes()),
    }
}

fn order_float_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn encode_terminated(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            out.extend_from_slice(&ESCAPED_ZERO);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&TERMINATOR);
}

/// Append an encoded transaction id.
pub fn encode_tx(tx: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&tx.to_be_bytes());
}

/// One bound component handed to [`encode_key_prefix`].
#[derive(Debug, Clone)]
pub enum KeyPart {
    Entity(Identity),
    Attribute(Keyword),
    Value(Value),
    Tx(u64),
}

impl KeyPart {
    fn component(&self) -> Component {
        match self {
            KeyPart::Entity(_) => Component::Entity,
            KeyPart::Attribute(_) => Component::Attribute,
            KeyPart::Value(_) => Component::Value,
            KeyPart::Tx(_) => Component::Tx,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            KeyPart::Entity(id) => encode_value(&Value::Identity(id.clone()), out),
            KeyPart::Attribute(a) => encode_value(&Value::Keyword(*a), out),
            KeyPart::Value(v) => encode_value(v, out),
            KeyPart::Tx(tx) => encode_tx(*tx, out),
        }
    }
}

/// Encode a key prefix for `index` from leading bound components.
///
/// `parts` must follow the index's component order; stopping early yields
/// a prefix suitable for a prefix scan.
pub fn encode_key_prefix(index: Index, parts: &[KeyPart]) -> Result<Vec<u8>> {
    let order = index.components();
    let mut out = vec![index.tag()];
    for (i, part) in parts.iter().enumerate() {
        if order.get(i) != Some(&part.component()) {
            return Err(QueryError::storage(format!(
                "key part {i} out of order for index {}",
                index.name()
            )));
        }
        part.encode(&mut out);
    }
    Ok(out)
}

/// Encode the full key for a datom in `index`.
pub fn encode_datom_key(index: Index, datom: &Datom) -> Vec<u8> {
    let mut out = vec![index.tag()];
    for component in index.components() {
        match component {
            Component::Entity => encode_value(&Value::Identity(datom.e.clone()), &mut out),
            Component::Attribute => encode_value(&Value::Keyword(datom.a), &mut out),
            Component::Value => encode_value(&datom.v, &mut out),
            Component::Tx => encode_tx(datom.tx, &mut out),
        }
    }
    out
}

/// Serialize a datom as the stored entry payload.
pub fn encode_datom(datom: &Datom) -> Result<Vec<u8>> {
    bincode::serialize(datom).map_err(|e| QueryError::storage(format!("encode datom: {e}")))
}

/// Decode a stored entry payload.
pub fn decode_datom(bytes: &[u8]) -> Result<Datom> {
    bincode::deserialize(bytes).map_err(|e| QueryError::storage(format!("decode datom: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn encoded(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        encode_value(value, &mut out);
        out
    }

    #[test]
    fn test_int_order() {
        let values = [-5i64, -1, 0, 1, 42, i64::MAX];
        for pair in values.windows(2) {
            assert!(
                encoded(&Value::Int64(pair[0])) < encoded(&Value::Int64(pair[1])),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_float_order() {
        let values = [-1.5f64, -0.0, 0.5, 1.0, 1e300];
        for pair in values.windows(2) {
            assert!(encoded(&Value::Float64(pair[0])) < encoded(&Value::Float64(pair[1])));
        }
    }

    #[test]
    fn test_string_order_with_embedded_zero() {
        let a = Value::String("a\0b".into());
        let b = Value::String("a\0c".into());
        let short = Value::String("a".into());
        assert!(encoded(&short) < encoded(&a));
        assert!(encoded(&a) < encoded(&b));
    }

    #[test]
    fn test_time_order() {
        let early = Value::Time(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap());
        let late = Value::Time(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert!(encoded(&early) < encoded(&late));
    }

    #[test]
    fn test_prefix_of_avet_key() {
        let attr = Keyword::intern(":event/time");
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let datom = Datom::new(Identity::of("e1"), attr, Value::Time(t), 7);
        let key = encode_datom_key(Index::Avet, &datom);
        let prefix =
            encode_key_prefix(Index::Avet, &[KeyPart::Attribute(attr)]).expect("prefix");
        assert!(key.starts_with(&prefix));
        let longer = encode_key_prefix(
            Index::Avet,
            &[KeyPart::Attribute(attr), KeyPart::Value(Value::Time(t))],
        )
        .expect("prefix");
        assert!(key.starts_with(&longer));
    }

    #[test]
    fn test_out_of_order_parts_rejected() {
        let attr = Keyword::intern(":a");
        assert!(encode_key_prefix(Index::Avet, &[KeyPart::Value(Value::Int64(1))]).is_err());
        assert!(encode_key_prefix(Index::Eavt, &[KeyPart::Attribute(attr)]).is_err());
    }

    #[test]
    fn test_datom_payload_round_trip() {
        let datom = Datom::new(
            Identity::of("entity"),
            Keyword::intern(":person/age"),
            Value::Int64(30),
            12,
        );
        let bytes = encode_datom(&datom).expect("encode");
        assert_eq!(decode_datom(&bytes).expect("decode"), datom);
    }
}
