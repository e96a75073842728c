//! Turns a decoded account into the flat JSON field map the upserter writes.
use serde_json::{Map, Value};

use crate::decoder::Decoded;

/// Wide integers are rendered as decimal text so no precision is lost on the
/// way to a NUMERIC column.
const MAX_JSON_NUMBER_BITS: u8 = 32;

/// Field map keyed by column name.
pub type FieldMap = Map<String, Value>;

/// Sanitizes the top level of a decoded account into a column map. Anything
/// that is not a struct yields an empty map.
pub fn sanitize_account(decoded: &Decoded) -> FieldMap {
    match decoded {
        Decoded::Struct(fields) => fields
            .iter()
            .map(|(name, value)| (to_snake_case(name), sanitize(value)))
            .collect(),
        _ => FieldMap::new(),
    }
}

pub fn sanitize(decoded: &Decoded) -> Value {
    match decoded {
        Decoded::Bool(value) => Value::Bool(*value),
        Decoded::Unsigned { value, bits } if *bits <= MAX_JSON_NUMBER_BITS => {
            Value::from(*value as u64)
        }
        Decoded::Unsigned { value, .. } => Value::String(value.to_string()),
        Decoded::Signed { value, bits } if *bits <= MAX_JSON_NUMBER_BITS => {
            Value::from(*value as i64)
        }
        Decoded::Signed { value, .. } => Value::String(value.to_string()),
        Decoded::Float(value) => serde_json::Number::from_f64(*value)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Decoded::String(value) => Value::String(value.clone()),
        Decoded::PublicKey(key) => Value::String(bs58::encode(key).into_string()),
        Decoded::Bytes(bytes) => Value::String(to_pg_hex(bytes)),
        Decoded::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Decoded::Option(None) => Value::Null,
        Decoded::Option(Some(inner)) => sanitize(inner),
        Decoded::Struct(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (to_snake_case(name), sanitize(value)))
                .collect(),
        ),
        Decoded::Tuple(items) => Value::Array(items.iter().map(sanitize).collect()),
        Decoded::Enum { variant, fields } => {
            let tag = variant_tag(variant);
            match fields.as_deref().map(sanitize) {
                None => Value::String(tag),
                Some(value) if is_empty_structure(&value) => Value::String(tag),
                Some(value) => {
                    let mut object = Map::new();
                    object.insert(tag, value);
                    Value::Object(object)
                }
            }
        }
    }
}

fn is_empty_structure(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Postgres bytea hex input format.
pub fn to_pg_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn from_pg_hex(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut previous: Option<char> = None;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if matches!(previous, Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        previous = Some(c);
    }
    out
}

/// Variant names in camelCase, lowering a leading acronym as a whole
/// (`UTF8` to `utf8`, `HTTPServer` to `httpServer`).
fn variant_tag(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let run = chars.iter().take_while(|c| c.is_ascii_uppercase()).count();
    let keep_last = run > 1 && chars.get(run).is_some_and(|c| c.is_ascii_lowercase());
    let lowered = if keep_last { run - 1 } else { run };

    chars
        .iter()
        .enumerate()
        .map(|(i, c)| if i < lowered { c.to_ascii_lowercase() } else { *c })
        .collect()
}

/// Compares a stored value with a freshly sanitized one, treating numbers and
/// their decimal text as equal, stored rows carry numbers as text.
pub fn values_equivalent(stored: &Value, fresh: &Value) -> bool {
    match (stored, fresh) {
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => {
            decimal_text_equal(&a.to_string(), b)
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equivalent(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    b.get(key)
                        .map(|other| values_equivalent(value, other))
                        .unwrap_or(false)
                })
        }
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => stored == fresh,
    }
}

/// Integers compare by their digits, anything else as a float.
fn decimal_text_equal(a: &str, b: &str) -> bool {
    match (integer_digits(a), integer_digits(b)) {
        (Some(a), Some(b)) => a == b,
        _ => matches!((a.parse::<f64>(), b.parse::<f64>()), (Ok(a), Ok(b)) if a == b),
    }
}

/// Sign and digits of plain integer text, leading zeros removed.
fn integer_digits(text: &str) -> Option<(bool, &str)> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits = digits.trim_start_matches('0');
    Some((negative && !digits.is_empty(), digits))
}
