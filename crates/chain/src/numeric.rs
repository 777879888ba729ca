//! The numeric coercion sum type (§8 S6, §9 Design Notes).
//!
//! `getPaymasterStatus`-shaped data can arrive with a quantity expressed as a JSON number, a
//! decimal string, a `0x`-prefixed hex string, or an object carrying the value under one of a few
//! conventional keys (`_hex`, `hex`, `value`). [`Numeric`] accepts all four and exposes exactly
//! one conversion, [`Numeric::to_big_uint`], so call sites never have to know which shape they
//! received or call a method that only exists on one of them.

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Numeric {
    /// A plain JSON number (the "bigint as JS number" shape, only safe for small values).
    Integer(u128),
    /// A base-10 string, e.g. `"10"`.
    DecimalString(String),
    /// A `0x`-prefixed hex string, e.g. `"0x0a"`.
    HexString(String),
    /// An object carrying the value under a conventional key (`_hex`, `hex`, or `value`),
    /// matching ethers.js-style `BigNumber` JSON and similar "object exposing toBigInt()" shapes.
    Object(Map<String, Value>),
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_big_uint() {
            Ok(v) => write!(f, "{v}"),
            Err(_) => write!(f, "<invalid numeric>"),
        }
    }
}

impl Numeric {
    /// The single conversion method every shape funnels through.
    pub fn to_big_uint(&self) -> anyhow::Result<U256> {
        match self {
            Numeric::Integer(n) => Ok(U256::from(*n)),
            Numeric::DecimalString(s) => parse_decimal(s),
            Numeric::HexString(s) => parse_hex(s),
            Numeric::Object(map) => object_to_big_uint(map),
        }
    }

    pub fn from_u256(value: U256) -> Self {
        Numeric::DecimalString(value.to_string())
    }
}

fn parse_decimal(s: &str) -> anyhow::Result<U256> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return parse_hex_digits(hex);
    }
    U256::from_str_radix(trimmed, 10).map_err(|e| anyhow::anyhow!("invalid decimal quantity {trimmed:?}: {e}"))
}

fn parse_hex(s: &str) -> anyhow::Result<U256> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| anyhow::anyhow!("hex quantity missing 0x prefix: {trimmed:?}"))?;
    parse_hex_digits(digits)
}

fn parse_hex_digits(digits: &str) -> anyhow::Result<U256> {
    let digits = if digits.is_empty() { "0" } else { digits };
    U256::from_str_radix(digits, 16).map_err(|e| anyhow::anyhow!("invalid hex quantity {digits:?}: {e}"))
}

fn object_to_big_uint(map: &Map<String, Value>) -> anyhow::Result<U256> {
    for key in ["_hex", "hex"] {
        if let Some(Value::String(s)) = map.get(key) {
            return parse_hex(s);
        }
    }
    if let Some(value) = map.get("value") {
        return Numeric::try_from(value.clone())?.to_big_uint();
    }
    anyhow::bail!("unsupported numeric object shape: {:?}", map.keys().collect::<Vec<_>>())
}

impl TryFrom<Value> for Numeric {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Ok(Numeric::Integer(u as u128))
                } else if let Some(s) = n.as_str_big() {
                    Ok(Numeric::DecimalString(s))
                } else {
                    anyhow::bail!("numeric field is not representable: {n}")
                }
            }
            Value::String(s) => {
                if s.trim_start().starts_with("0x") || s.trim_start().starts_with("0X") {
                    Ok(Numeric::HexString(s))
                } else {
                    Ok(Numeric::DecimalString(s))
                }
            }
            Value::Object(map) => Ok(Numeric::Object(map)),
            other => anyhow::bail!("unsupported numeric json shape: {other}"),
        }
    }
}

// serde_json's `Number` has no public "as arbitrary-precision string" accessor across all
// feature configurations; fall back to its own Display which already renders the exact digits.
trait NumberExt {
    fn as_str_big(&self) -> Option<String>;
}

impl NumberExt for serde_json::Number {
    fn as_str_big(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl<'de> Deserialize<'de> for Numeric {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Numeric::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Numeric {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let decimal = self.to_big_uint().map_err(serde::ser::Error::custom)?;
        serializer.collect_str(&decimal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_shape() {
        let n: Numeric = serde_json::from_value(serde_json::json!(10)).unwrap();
        assert_eq!(n.to_big_uint().unwrap(), U256::from(10u64));
    }

    #[test]
    fn decimal_string_shape() {
        let n: Numeric = serde_json::from_value(serde_json::json!("10")).unwrap();
        assert_eq!(n.to_big_uint().unwrap(), U256::from(10u64));
    }

    #[test]
    fn hex_string_shape() {
        let n: Numeric = serde_json::from_value(serde_json::json!("0x0a")).unwrap();
        assert_eq!(n.to_big_uint().unwrap(), U256::from(10u64));
    }

    #[test]
    fn hex_object_shape() {
        let n: Numeric = serde_json::from_value(serde_json::json!({"_hex": "0x0a"})).unwrap();
        assert_eq!(n.to_big_uint().unwrap(), U256::from(10u64));
    }

    #[test]
    fn nested_value_object_shape() {
        // Models the "object exposing toBigInt()" shape as a tagged value carrier.
        let n: Numeric =
            serde_json::from_value(serde_json::json!({"type": "BigInt", "value": "10"})).unwrap();
        assert_eq!(n.to_big_uint().unwrap(), U256::from(10u64));
    }

    #[test]
    fn all_four_shapes_serialize_identically() {
        let shapes = vec![
            serde_json::json!(10),
            serde_json::json!("10"),
            serde_json::json!("0x0a"),
            serde_json::json!({"_hex": "0x0a"}),
        ];
        for shape in shapes {
            let n: Numeric = serde_json::from_value(shape.clone()).unwrap();
            let rendered = serde_json::to_value(&n).unwrap();
            assert_eq!(rendered, serde_json::json!("10"), "shape {shape:?} must render as \"10\"");
        }
    }

    #[test]
    fn unsupported_object_shape_errors() {
        let n: Result<Numeric, _> = serde_json::from_value(serde_json::json!({"foo": "bar"}));
        let n = n.unwrap();
        assert!(n.to_big_uint().is_err());
    }
}
