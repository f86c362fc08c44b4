//! Conversion between the in-memory map and DynamoDB attribute values.
//!
//! | JSON     | DynamoDB |
//! |----------|----------|
//! | `null`   | `NULL`   |
//! | bool     | `BOOL`   |
//! | number   | `N`      |
//! | string   | `S`      |
//! | array    | `L`      |
//! | object   | `M`      |
//!
//! String and number sets (`SS`, `NS`) are read as arrays. Binary attributes
//! have no JSON form and are rejected, as is a row whose value is not a map.
//!
//! DynamoDB normalizes numbers (`1.0` is stored as `1`), so a float with an
//! integral value comes back as an integer.
//!
//! Application values enter the map through [`to_json`], which rejects NaN
//! and infinities instead of letting `serde_json` store them as `null`.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use serde::ser::{self, Serialize};
use serde_json::{Map, Number, Value};

use crate::errors::PersistenceError;

pub fn to_json<V: Serialize + ?Sized>(value: &V) -> Result<Value, PersistenceError> {
    value.serialize(FiniteFloats).map_err(|e| PersistenceError::Serialization(e.0))?;
    Ok(serde_json::to_value(value)?)
}

/// Text DynamoDB keeps for a number: trailing fractional zeros dropped.
pub fn normalize_number(text: &str) -> String {
    if !text.contains('.') || text.contains(['e', 'E']) {
        return text.to_string();
    }
    match text.trim_end_matches('0').trim_end_matches('.') {
        "-0" => "0".to_string(),
        trimmed => trimmed.to_string(),
    }
}

pub fn to_store_value(map: &Map<String, Value>) -> AttributeValue {
    AttributeValue::M(encode_object(map))
}

pub fn from_store_value(value: &AttributeValue) -> Result<Map<String, Value>, PersistenceError> {
    match value {
        AttributeValue::M(m) => decode_object(m),
        other => Err(PersistenceError::serialization(format!(
            "stored row value must be a map, found {}",
            type_name(other)
        ))),
    }
}

fn encode_object(map: &Map<String, Value>) -> HashMap<String, AttributeValue> {
    map.iter().map(|(k, v)| (k.clone(), encode(v))).collect()
}

fn encode(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(encode).collect()),
        Value::Object(map) => AttributeValue::M(encode_object(map)),
    }
}

fn decode_object(map: &HashMap<String, AttributeValue>) -> Result<Map<String, Value>, PersistenceError> {
    map.iter()
        .map(|(k, v)| decode(v).map(|v| (k.clone(), v)))
        .collect()
}

fn decode(value: &AttributeValue) -> Result<Value, PersistenceError> {
    Ok(match value {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::N(n) => Value::Number(parse_number(n)?),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::L(items) => Value::Array(items.iter().map(decode).collect::<Result<_, _>>()?),
        AttributeValue::M(map) => Value::Object(decode_object(map)?),
        AttributeValue::Ss(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
        AttributeValue::Ns(items) => Value::Array(
            items
                .iter()
                .map(|n| parse_number(n).map(Value::Number))
                .collect::<Result<_, _>>()?,
        ),
        other => {
            return Err(PersistenceError::serialization(format!(
                "unsupported attribute type {}",
                type_name(other)
            )))
        }
    })
}

fn parse_number(text: &str) -> Result<Number, PersistenceError> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(i.into());
    }
    if let Ok(u) = text.parse::<u64>() {
        return Ok(u.into());
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| PersistenceError::serialization(format!("invalid number `{text}`")))
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Unrepresentable(String);

impl ser::Error for Unrepresentable {
    fn custom<T: std::fmt::Display>(msg: T) -> Self { Self(msg.to_string()) }
}

fn finite(v: f64) -> Result<(), Unrepresentable> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(Unrepresentable(format!("non-finite number {v} cannot be stored")))
    }
}

/// Walks a value without building anything; fails on NaN and infinities.
struct FiniteFloats;

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_i8(self, _: i8) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_i16(self, _: i16) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_i32(self, _: i32) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_i64(self, _: i64) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_i128(self, _: i128) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_u8(self, _: u8) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_u16(self, _: u16) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_u32(self, _: u32) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_u64(self, _: u64) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_u128(self, _: u128) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_f32(self, v: f32) -> Result<(), Unrepresentable> { finite(v.into()) }
    fn serialize_f64(self, v: f64) -> Result<(), Unrepresentable> { finite(v) }
    fn serialize_char(self, _: char) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_str(self, _: &str) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_none(self) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_unit(self) -> Result<(), Unrepresentable> { Ok(()) }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), Unrepresentable> { Ok(()) }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), Unrepresentable> {
        value.serialize(self)
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), Unrepresentable> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Unrepresentable> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), Unrepresentable> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self, Unrepresentable> { Ok(self) }
    fn serialize_tuple(self, _: usize) -> Result<Self, Unrepresentable> { Ok(self) }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, Unrepresentable> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Unrepresentable> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self, Unrepresentable> { Ok(self) }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, Unrepresentable> { Ok(self) }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, Unrepresentable> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unrepresentable> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Unrepresentable> { Ok(()) }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unrepresentable> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Unrepresentable> { Ok(()) }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unrepresentable> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Unrepresentable> { Ok(()) }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unrepresentable> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Unrepresentable> { Ok(()) }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Unrepresentable> {
        key.serialize(FiniteFloats)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Unrepresentable> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Unrepresentable> { Ok(()) }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Unrepresentable> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Unrepresentable> { Ok(()) }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = Unrepresentable;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), Unrepresentable> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), Unrepresentable> { Ok(()) }
}

fn type_name(value: &AttributeValue) -> &'static str {
    match value {
        AttributeValue::B(_) => "B",
        AttributeValue::Bool(_) => "BOOL",
        AttributeValue::Bs(_) => "BS",
        AttributeValue::L(_) => "L",
        AttributeValue::M(_) => "M",
        AttributeValue::N(_) => "N",
        AttributeValue::Ns(_) => "NS",
        AttributeValue::Null(_) => "NULL",
        AttributeValue::S(_) => "S",
        AttributeValue::Ss(_) => "SS",
        _ => "unknown",
    }
}
