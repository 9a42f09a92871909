use serde::{Deserialize, Serialize};

/// A dynamic attribute value carried on events and intervals. Trace dumps are
/// untyped text, so attributes are parsed into the narrowest shape that fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    /// Parse a raw attribute string: integer first, then float, then text.
    pub fn parse(raw: &str) -> AttrValue {
        let trimmed = raw.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return AttrValue::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return AttrValue::Float(f);
        }
        AttrValue::Str(trimmed.to_string())
    }

    /// Canonical string form, used when an attribute value becomes a map key
    /// (GUID lookups compare values coming from different line shapes).
    pub fn as_key(&self) -> String {
        match self {
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Str(s) => s.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}
