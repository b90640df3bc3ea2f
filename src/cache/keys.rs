//! Body key derivation.
//!
//! A body key selects one cache entry under a handler. Two bodies that are
//! equal as JSON values always map to the same key, whatever order their
//! object fields were built in. Integral floats are written as integers, so
//! `1.0` and `1` select the same slot.

use std::fmt::{self, Write as _};

use serde_json::{Number, Value};

// Largest magnitude below which every integral f64 is exact.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Canonical string form of a request body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyKey(String);

impl BodyKey {
    /// Derive the key for `body`.
    pub fn of(body: &Value) -> Self {
        let mut out = String::new();
        write_canonical(body, &mut out);
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BodyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The body used when a caller supplies none.
pub fn default_body() -> Value {
    Value::Object(serde_json::Map::new())
}

// Objects are emitted with their keys sorted so the output does not depend on
// whether serde_json was built with `preserve_order`.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (name, field)) in fields.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(number) => write_number(number, out),
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_number(number: &Number, out: &mut String) {
    if number.is_f64()
        && let Some(float) = number.as_f64()
        && float.fract() == 0.0
        && float.abs() < MAX_EXACT_INTEGER
    {
        // `as` is exact here; `-0.0` becomes `0`.
        let _ = write!(out, "{}", float as i64);
    } else {
        let _ = write!(out, "{number}");
    }
}

fn write_string(s: &str, out: &mut String) {
    // Display on a Value::String yields the escaped, quoted JSON literal.
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}
