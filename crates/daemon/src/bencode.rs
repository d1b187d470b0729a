//! Canonical bencode encoding for torrent descriptors.
//!
//! Dictionaries are kept in a `BTreeMap` so keys are always emitted in raw
//! byte order, which makes the encoding (and therefore the info hash) canonical.

use std::collections::BTreeMap;

/// A bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    /// Builds a dictionary from `(key, value)` pairs.
    pub fn dict<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }
}

/// Encodes a value into a fresh buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Appends the encoding of `value` to `out`.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => encode_bytes(bytes, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                encode_bytes(key, out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Int(42)), b"i42e");
        assert_eq!(encode(&Value::Int(-3)), b"i-3e");
        assert_eq!(encode(&Value::Int(0)), b"i0e");
        assert_eq!(encode(&Value::str("spam")), b"4:spam");
        assert_eq!(encode(&Value::Bytes(Vec::new())), b"0:");
    }

    #[test]
    fn test_encode_nested() {
        let value = Value::List(vec![
            Value::List(vec![Value::str("udp://a")]),
            Value::List(vec![Value::str("udp://b")]),
        ]);
        assert_eq!(encode(&value), b"ll7:udp://ael7:udp://bee");
    }

    #[test]
    fn test_dict_keys_sorted_by_bytes() {
        let value = Value::dict([
            ("piece length", Value::Int(16384)),
            ("name", Value::str("a")),
            ("length", Value::Int(1)),
            ("pieces", Value::Bytes(vec![0u8; 2])),
        ]);
        let encoded = encode(&value);
        let expected: &[u8] = b"d6:lengthi1e4:name1:a12:piece lengthi16384e6:pieces2:\x00\x00e";
        assert_eq!(encoded, expected);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_insertion_order_does_not_change_encoding(
            keys in prop::collection::btree_set("[a-z ]{1,12}", 1..8),
        ) {
            let forward: BTreeMap<Vec<u8>, Value> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| (k.as_bytes().to_vec(), Value::Int(i as i64)))
                .collect();
            let mut reversed = BTreeMap::new();
            for (i, k) in keys.iter().enumerate().rev() {
                reversed.insert(k.as_bytes().to_vec(), Value::Int(i as i64));
            }

            prop_assert_eq!(
                encode(&Value::Dict(forward)),
                encode(&Value::Dict(reversed))
            );
        }
    }
}
