use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::str::FromStr;

/// Metadata for a single gateway tag.
///
/// `tag_id` is the primary key; `plc_id` names the logical controller the
/// tag is polled from (`compactlogix` and `slc500` are wired in-core, other
/// values are stored but never polled).
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub tag_id: String,
    pub name: String,
    pub plc_id: String,
    pub address: String,
    pub data_type: String,
    pub group_id: String,
    pub project_id: Option<String>,
    pub scale_mul: f64,
    pub scale_add: f64,
    pub decimals: Option<u32>,
    pub writable: bool,
    pub description: Option<String>,
    pub enabled: bool,
    pub client_visible: Vec<String>,
}

impl Tag {
    /// A tag with default metadata, as created by the REST surface when the
    /// payload carries only an id.
    pub fn new(tag_id: impl Into<String>) -> Self {
        let tag_id = tag_id.into();
        Tag {
            name: tag_id.clone(),
            tag_id,
            plc_id: "plc_1".to_string(),
            address: String::new(),
            data_type: "Double".to_string(),
            group_id: "default".to_string(),
            project_id: None,
            scale_mul: 1.0,
            scale_add: 0.0,
            decimals: None,
            writable: false,
            description: None,
            enabled: true,
            client_visible: Vec::new(),
        }
    }

    pub fn is_boolean(&self) -> bool {
        self.data_type.to_ascii_lowercase().starts_with("bool")
    }
}

/// A raw stored tag value.
///
/// Decimal values preserve their scale bit-for-bit so that a value stored
/// as `1.2300` serializes with its trailing zeros intact.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
}

impl TagValue {
    /// Default initial value for a tag of the given data type.
    pub fn default_for(data_type: &str) -> TagValue {
        let dt = data_type.to_ascii_lowercase();
        if dt.starts_with("bool") {
            TagValue::Bool(false)
        } else if dt.contains("int") {
            TagValue::Int(0)
        } else if dt.contains("string") || dt.contains("str") {
            TagValue::Text(String::new())
        } else {
            TagValue::Float(0.0)
        }
    }

    /// Convert to decimal through the canonical string form, mirroring how
    /// values travel between the driver layer and the scaler. Booleans and
    /// non-numeric text do not convert.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            TagValue::Bool(_) => None,
            TagValue::Int(i) => Decimal::from_i64(*i),
            TagValue::UInt(u) => Decimal::from_u64(*u),
            TagValue::Float(f) => Decimal::from_str(&f.to_string()).ok(),
            TagValue::Decimal(d) => Some(*d),
            TagValue::Text(s) => Decimal::from_str(s.trim()).ok(),
        }
    }

    /// Parse a JSON payload value (REST `initial_value` / `value` fields).
    pub fn from_json(value: &JsonValue) -> Option<TagValue> {
        match value {
            JsonValue::Bool(b) => Some(TagValue::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(TagValue::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Some(TagValue::UInt(u))
                } else {
                    n.as_f64().map(TagValue::Float)
                }
            }
            JsonValue::String(s) => Some(TagValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Serialize as a JSON number where possible: integral decimals become
    /// JSON integers, other decimals JSON numbers. Trailing-zero
    /// preservation is the caller's concern (see the single-tag endpoint).
    pub fn to_json(&self) -> JsonValue {
        match self {
            TagValue::Bool(b) => json!(b),
            TagValue::Int(i) => json!(i),
            TagValue::UInt(u) => json!(u),
            TagValue::Float(f) => json!(f),
            TagValue::Decimal(d) => decimal_to_json(d),
            TagValue::Text(s) => json!(s),
        }
    }
}

fn decimal_to_json(d: &Decimal) -> JsonValue {
    if d.fract().is_zero() {
        if let Some(i) = d.to_i64() {
            return json!(i);
        }
    }
    match d.to_f64() {
        Some(f) => json!(f),
        None => json!(d.to_string()),
    }
}

/// Quantize to `10^-decimals` with half-up rounding, padding trailing
/// zeros so the requested number of decimal places is always present.
pub fn quantize_half_up(value: Decimal, decimals: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(decimals);
    rounded
}
