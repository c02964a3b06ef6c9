use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::DecodeError;

/// A single claim value.
///
/// Scalars are kept typed. Arrays and objects are not interpreted by this
/// crate and are preserved as their JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Raw(String),
}

impl ClaimValue {
    /// Returns the string value, if this claim is a JSON string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ClaimValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, ClaimValue::Null)
    }
}

impl From<Value> for ClaimValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ClaimValue::Null,
            Value::Bool(b) => ClaimValue::Bool(b),
            Value::Number(n) => ClaimValue::Number(n),
            Value::String(s) => ClaimValue::String(s),
            composite @ (Value::Array(_) | Value::Object(_)) => {
                ClaimValue::Raw(composite.to_string())
            }
        }
    }
}

/// Claims decoded from a token payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    entries: BTreeMap<String, ClaimValue>,
}

impl Claims {
    /// Parse a decoded token payload.
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidClaims`] if the payload is not a JSON object.
    pub fn parse(payload: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| DecodeError::InvalidClaims(e.to_string()))?;

        let Value::Object(map) = value else {
            return Err(DecodeError::InvalidClaims(
                "top-level value must be an object".to_owned(),
            ));
        };

        Ok(Self {
            entries: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClaimValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
