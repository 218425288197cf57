//! Declared types of decoder fields, and conversion of field text to typed values

use crate::duration::Duration;
use serde::Serialize;
use std::collections::HashMap;
use std::io::BufRead;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    UInt,
    Float,
    Bool,
    Time,
}

impl FieldType {
    /// Map a decoder type name (`FT_*`) to a converter. Unknown names are strings.
    pub fn from_decoder_type(s: &str) -> FieldType {
        match s {
            "FT_BOOLEAN" => FieldType::Bool,
            "FT_INT8" | "FT_INT16" | "FT_INT24" | "FT_INT32" | "FT_INT40" | "FT_INT48"
            | "FT_INT56" | "FT_INT64" => FieldType::Int,
            "FT_UINT8" | "FT_UINT16" | "FT_UINT24" | "FT_UINT32" | "FT_UINT40" | "FT_UINT48"
            | "FT_UINT56" | "FT_UINT64" | "FT_FRAMENUM" => FieldType::UInt,
            "FT_FLOAT" | "FT_DOUBLE" => FieldType::Float,
            "FT_ABSOLUTE_TIME" | "FT_RELATIVE_TIME" => FieldType::Time,
            _ => FieldType::String,
        }
    }

    /// Convert the `show` / `value` attributes of a field.
    ///
    /// Numbers are read from the display text (decimal or `0x` hex), falling
    /// back to the raw value as hex. Times are read from the raw value first,
    /// which holds seconds since the epoch for absolute times.
    pub fn convert(self, show: Option<&str>, value: Option<&str>) -> Option<FieldValue> {
        match self {
            FieldType::String => show.or(value).map(|s| FieldValue::String(s.to_owned())),
            FieldType::Int => show
                .and_then(parse_i64)
                .or_else(|| value.and_then(|v| u64::from_str_radix(v, 16).ok()).map(|v| v as i64))
                .map(FieldValue::Int),
            FieldType::UInt => show
                .and_then(parse_u64)
                .or_else(|| value.and_then(|v| u64::from_str_radix(v, 16).ok()))
                .map(FieldValue::UInt),
            FieldType::Float => show
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(FieldValue::Float),
            FieldType::Bool => show.or(value).and_then(parse_bool).map(FieldValue::Bool),
            FieldType::Time => value
                .and_then(Duration::parse_secs)
                .or_else(|| show.and_then(Duration::parse_secs))
                .map(FieldValue::Time),
        }
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_i64(s: &str) -> Option<i64> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok().map(|v| v as i64),
        None => s.parse().ok(),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "True" | "true" => Some(true),
        "False" | "false" => Some(false),
        other => parse_u64(other).map(|v| v > 0),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Time(Duration),
}

/// Mapping from raw field name (abbreviation) to declared type
#[derive(Clone, Debug, Default)]
pub struct FieldTypes {
    map: HashMap<String, FieldType>,
}

impl FieldTypes {
    /// Empty mapping: no field gets a typed value
    pub fn new() -> Self {
        FieldTypes::default()
    }

    /// Mapping holding only the fixed overrides for general information fields
    pub fn with_overrides() -> Self {
        let mut types = FieldTypes::new();
        types.add_overrides();
        types
    }

    fn add_overrides(&mut self) {
        self.insert("num", FieldType::UInt);
        self.insert("len", FieldType::UInt);
        self.insert("caplen", FieldType::UInt);
        self.insert("timestamp", FieldType::Time);
        self.insert("data", FieldType::String);
    }

    /// Parse the field listing of the decoder (`-G fields`).
    ///
    /// Only lines starting with `F\t` describe fields; the abbreviation is the
    /// third column and the type the fourth.
    pub fn parse_listing<R: BufRead>(listing: R) -> Result<Self, std::io::Error> {
        let mut types = FieldTypes::new();
        for line in listing.lines() {
            let line = line?;
            if !line.starts_with("F\t") {
                continue;
            }
            let mut cols = line.split('\t').skip(2);
            if let (Some(abbrev), Some(ty)) = (cols.next(), cols.next()) {
                types.insert(abbrev, FieldType::from_decoder_type(ty.trim_end()));
            }
        }
        types.add_overrides();
        Ok(types)
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, ty: FieldType) {
        self.map.insert(name.into(), ty);
    }

    pub fn get(&self, name: &str) -> Option<FieldType> {
        self.map.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Typed value of field `name`, if its type is known and the text converts
    pub fn convert(&self, name: &str, show: Option<&str>, value: Option<&str>) -> Option<FieldValue> {
        self.get(name).and_then(|ty| ty.convert(show, value))
    }
}
