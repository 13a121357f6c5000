use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// A single reported or requested status value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Accepts JSON scalars only; `null`, arrays and objects are not field values.
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FieldValue::Bool(b)),
            serde_json::Value::Number(n) => Some(FieldValue::Number(n)),
            serde_json::Value::String(s) => Some(FieldValue::Text(s)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Number(v.into())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Field name -> value. Ordered so published payloads are stable.
pub type FieldMap = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Delta,
    Full,
}

/// What the publisher emits on a device status topic.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub device_id: String,
    pub kind: UpdateKind,
    pub fields: FieldMap,
}

impl StatusUpdate {
    pub fn to_payload(&self) -> StatusPayload {
        StatusPayload {
            name: self.device_id.clone(),
            status: self.fields.clone(),
        }
    }
}

/// Wire shape shared by status publications and device commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status")]
    pub status: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerPayload {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Power")]
    pub power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub watts: f64,
    pub at: OffsetDateTime,
}

/// A validated request for one device, forwarded to the cloud in a single call.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub device_id: String,
    pub fields: FieldMap,
}

/// Why an inbound command payload could not be turned into fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not UTF-8")]
    NotUtf8,
    #[error("payload is not JSON: {0}")]
    NotJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Result of parsing a command payload: the usable fields plus the names that
/// carried a non-scalar value.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedFields {
    pub fields: FieldMap,
    pub rejected: Vec<String>,
}

/// Parses a command payload. Accepts the status envelope (`{"Name", "Status"}`)
/// or a bare field mapping; a `name`/`Name` key in a bare mapping is skipped.
pub fn parse_field_payload(payload: &[u8]) -> Result<ParsedFields, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| PayloadError::NotJson(e.to_string()))?;

    let mut object = match value {
        serde_json::Value::Object(map) => map,
        _ => return Err(PayloadError::NotAnObject),
    };

    let entries = match object.remove("Status") {
        Some(serde_json::Value::Object(inner)) => inner,
        Some(_) => return Err(PayloadError::NotAnObject),
        None => object,
    };

    let mut parsed = ParsedFields::default();
    for (name, raw) in entries {
        if name == "name" || name == "Name" {
            continue;
        }
        match FieldValue::from_json(raw) {
            Some(value) => {
                parsed.fields.insert(name, value);
            }
            None => parsed.rejected.push(name),
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_payload_shape() {
        let mut fields = FieldMap::new();
        fields.insert("power".into(), 500.into());
        fields.insert("mode".into(), "cool".into());
        let update =
            StatusUpdate { device_id: "living-room".into(), kind: UpdateKind::Full, fields };

        let json = serde_json::to_value(update.to_payload()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Name": "living-room", "Status": {"mode": "cool", "power": 500}})
        );
    }

    #[test]
    fn test_parse_envelope_and_bare_mapping_agree() {
        let envelope = br#"{"Name": "den", "Status": {"mode": "heat", "setpoint": 21}}"#;
        let bare = br#"{"name": "den", "mode": "heat", "setpoint": 21}"#;

        let a = parse_field_payload(envelope).unwrap();
        let b = parse_field_payload(bare).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fields.len(), 2);
        assert_eq!(a.fields["setpoint"].as_i64(), Some(21));
    }

    #[test]
    fn test_parse_rejects_non_scalar_values() {
        let parsed =
            parse_field_payload(br#"{"mode": "cool", "extra": [1, 2], "gone": null}"#).unwrap();
        assert_eq!(parsed.fields.len(), 1);
        assert_eq!(parsed.rejected, vec!["extra".to_string(), "gone".to_string()]);
    }

    #[test]
    fn test_parse_malformed_payloads() {
        assert_eq!(parse_field_payload(&[0xff, 0xfe]), Err(PayloadError::NotUtf8));
        assert!(matches!(parse_field_payload(b"{mode"), Err(PayloadError::NotJson(_))));
        assert_eq!(parse_field_payload(b"[1]"), Err(PayloadError::NotAnObject));
        assert_eq!(parse_field_payload(br#"{"Status": 3}"#), Err(PayloadError::NotAnObject));
    }
}
