//! Byte-stable JSON serialization used for cache keys and stored metadata.

use crate::{
    error::{Error, Result},
    Digest,
};
use serde::Serialize;
use serde_json::Value;

/// Serialize `value` into canonical JSON bytes.
///
/// Object keys are emitted in lexicographic order with no insignificant
/// whitespace, so equal logical values always produce equal bytes. Optional
/// fields must be omitted by the caller's serde attributes rather than encoded
/// as `null`. Floats are rejected since their textual form is not stable.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    reject_floats(&value)?;
    // serde_json orders map keys lexicographically unless `preserve_order`
    // is enabled, which this crate does not use.
    Ok(serde_json::to_vec(&value)?)
}

/// SHA-256 digest of the canonical JSON form of `value`.
pub fn digest_of<T: Serialize>(value: &T) -> Result<Digest> {
    Ok(Digest::from_buf_sha256(&to_canonical_json(value)?))
}

fn reject_floats(value: &Value) -> Result<()> {
    match value {
        Value::Number(n) if n.as_i64().is_none() && n.as_u64().is_none() => {
            Err(Error::FloatInCanonicalJson)
        }
        Value::Array(items) => items.iter().try_for_each(reject_floats),
        Value::Object(map) => map.values().try_for_each(reject_floats),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        zebra: String,
        apple: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        missing: Option<String>,
        map: BTreeMap<String, String>,
    }

    #[test]
    fn keys_are_sorted_and_none_omitted() -> Result<()> {
        let sample = Sample {
            zebra: "z".to_string(),
            apple: 1,
            missing: None,
            map: BTreeMap::from([("b".to_string(), "2".to_string())]),
        };
        let bytes = to_canonical_json(&sample)?;
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"apple":1,"map":{"b":"2"},"zebra":"z"}"#
        );
        Ok(())
    }

    #[test]
    fn round_trip_is_identity() -> Result<()> {
        let sample = Sample {
            zebra: "z".to_string(),
            apple: 7,
            missing: None,
            map: BTreeMap::new(),
        };
        let bytes = to_canonical_json(&sample)?;
        let back: Sample = serde_json::from_slice(&bytes)?;
        assert_eq!(to_canonical_json(&back)?, bytes);
        Ok(())
    }

    #[test]
    fn floats_are_rejected() {
        let err = to_canonical_json(&serde_json::json!({"x": 1.5})).unwrap_err();
        assert!(matches!(err, Error::FloatInCanonicalJson));
    }

    #[test]
    fn digest_is_stable() -> Result<()> {
        let a = BTreeMap::from([("k".to_string(), "v".to_string())]);
        assert_eq!(digest_of(&a)?, digest_of(&a)?);
        Ok(())
    }
}
