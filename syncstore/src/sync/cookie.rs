//! Server issued version markers.
//!
//! A cookie is `null`, a string, a number, or an object with an `order`
//! field that is itself a string or a number. Cookies are totally ordered by
//! [`compare_cookies`].

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{InvalidCookieSnafu, SyncError};

/// An opaque, ordered, server issued token.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cookie(Value);

impl Cookie {
    /// The cookie of a client that never pulled.
    pub const NULL: Cookie = Cookie(Value::Null);

    /// Wraps a JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Whether this is the null cookie.
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// The JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for Cookie {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for Cookie {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<u64> for Cookie {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum CompareValue<'a> {
    Str(&'a str),
    Num(f64),
}

impl CompareValue<'_> {
    fn to_text(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            Self::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
        }
    }
}

fn compare_value(cookie: &Cookie) -> Result<CompareValue<'_>, SyncError> {
    let value = match &cookie.0 {
        Value::Object(obj) => obj.get("order").unwrap_or(&Value::Null),
        other => other,
    };
    match value {
        Value::String(s) => Ok(CompareValue::Str(s)),
        Value::Number(n) => match n.as_f64() {
            Some(n) => Ok(CompareValue::Num(n)),
            None => InvalidCookieSnafu {
                cookie: cookie.to_string(),
            }
            .fail(),
        },
        _ => InvalidCookieSnafu {
            cookie: cookie.to_string(),
        }
        .fail(),
    }
}

/// Orders two cookies.
///
/// Equal cookies compare equal, `null` sorts first. Otherwise the string or
/// number (or the `order` field of an object) is compared; when either side
/// is a string both sides are compared as strings.
pub fn compare_cookies(a: &Cookie, b: &Cookie) -> Result<Ordering, SyncError> {
    if a == b {
        return Ok(Ordering::Equal);
    }
    if a.is_null() {
        return Ok(Ordering::Less);
    }
    if b.is_null() {
        return Ok(Ordering::Greater);
    }
    let ca = compare_value(a)?;
    let cb = compare_value(b)?;
    Ok(match (&ca, &cb) {
        (CompareValue::Num(x), CompareValue::Num(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        _ => ca.to_text().cmp(&cb.to_text()),
    })
}
