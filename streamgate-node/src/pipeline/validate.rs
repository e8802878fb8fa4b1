//! Declarative input validation, evaluated before the business handler.
//!
//! Each endpoint declares rules for its query parameters and body fields.
//! Failures reject the request with `invalid_input` and field-level detail;
//! the handler is never invoked.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::error::ServiceError;

/// Where a field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Query,
    Body,
}

/// What the field must look like.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// UTF-8 string with inclusive length bounds.
    Str { min: usize, max: usize },
    /// Integer within inclusive bounds.
    Int { min: i64, max: i64 },
    /// `local@domain` with a dotted domain.
    Email,
    /// `0x`-prefixed hex account address.
    HexAddress,
    Uuid,
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: String,
    pub source: FieldSource,
    pub required: bool,
    pub kind: FieldKind,
}

impl FieldRule {
    pub fn new(field: impl Into<String>, source: FieldSource, required: bool, kind: FieldKind) -> Self {
        Self {
            field: field.into(),
            source,
            required,
            kind,
        }
    }

    pub fn required_body(field: impl Into<String>, kind: FieldKind) -> Self {
        Self::new(field, FieldSource::Body, true, kind)
    }

    pub fn optional_query(field: impl Into<String>, kind: FieldKind) -> Self {
        Self::new(field, FieldSource::Query, false, kind)
    }
}

/// Check `rules` against the request inputs. The first failure per field is
/// collected; all failing fields are reported together.
pub fn validate(
    rules: &[FieldRule],
    query: &BTreeMap<String, String>,
    body: Option<&Value>,
) -> Result<(), ServiceError> {
    let mut failures: Vec<(String, String)> = Vec::new();

    for rule in rules {
        let value: Option<Value> = match rule.source {
            FieldSource::Query => query.get(&rule.field).map(|s| Value::String(s.clone())),
            FieldSource::Body => body
                .and_then(|b| b.get(&rule.field))
                .filter(|v| !v.is_null())
                .cloned(),
        };
        match value {
            None => {
                if rule.required {
                    failures.push((rule.field.clone(), "required".to_string()));
                }
            }
            Some(value) => {
                if let Err(reason) = check_kind(&rule.kind, &value) {
                    failures.push((rule.field.clone(), reason));
                }
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    let details: Value = failures
        .iter()
        .map(|(field, reason)| json!({"field": field, "reason": reason}))
        .collect();
    Err(ServiceError::InvalidInput {
        message: format!(
            "validation failed for {}",
            failures
                .iter()
                .map(|(f, _)| f.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        details: Some(details),
    })
}

fn check_kind(kind: &FieldKind, value: &Value) -> Result<(), String> {
    match kind {
        FieldKind::Str { min, max } => {
            let s = value.as_str().ok_or("must be a string")?;
            if s.len() < *min {
                return Err(format!("shorter than {min}"));
            }
            if s.len() > *max {
                return Err(format!("longer than {max}"));
            }
            Ok(())
        }
        FieldKind::Int { min, max } => {
            let n = match value {
                Value::Number(n) => n.as_i64().ok_or("must be an integer")?,
                Value::String(s) => s.parse::<i64>().map_err(|_| "must be an integer")?,
                _ => return Err("must be an integer".to_string()),
            };
            if n < *min || n > *max {
                return Err(format!("must be between {min} and {max}"));
            }
            Ok(())
        }
        FieldKind::Email => {
            let s = value.as_str().ok_or("must be a string")?;
            let (local, domain) = s.split_once('@').ok_or("must be an email address")?;
            if local.is_empty() || domain.is_empty() || !domain.contains('.') {
                return Err("must be an email address".to_string());
            }
            Ok(())
        }
        FieldKind::HexAddress => {
            let s = value.as_str().ok_or("must be a string")?;
            let hex = s.strip_prefix("0x").ok_or("must start with 0x")?;
            if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("must be hex digits after 0x".to_string());
            }
            Ok(())
        }
        FieldKind::Uuid => {
            let s = value.as_str().ok_or("must be a string")?;
            uuid::Uuid::parse_str(s)
                .map(|_| ())
                .map_err(|_| "must be a UUID".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_query() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn missing_required_field_fails() {
        let rules = [FieldRule::required_body(
            "wallet",
            FieldKind::HexAddress,
        )];
        let err = validate(&rules, &no_query(), Some(&json!({}))).unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn missing_optional_field_passes() {
        let rules = [FieldRule::optional_query(
            "limit",
            FieldKind::Int { min: 1, max: 100 },
        )];
        validate(&rules, &no_query(), None).unwrap();
    }

    #[test]
    fn hex_address_accepts_and_rejects() {
        let rules = [FieldRule::required_body("wallet", FieldKind::HexAddress)];
        validate(
            &rules,
            &no_query(),
            Some(&json!({"wallet": "0xAbCd1234"})),
        )
        .unwrap();
        assert!(validate(&rules, &no_query(), Some(&json!({"wallet": "abcd"}))).is_err());
        assert!(validate(&rules, &no_query(), Some(&json!({"wallet": "0xZZ"}))).is_err());
    }

    #[test]
    fn int_bounds_apply_to_query_strings() {
        let rules = [FieldRule::new(
            "x",
            FieldSource::Query,
            true,
            FieldKind::Int { min: 0, max: 10 },
        )];
        let mut query = BTreeMap::new();
        query.insert("x".to_string(), "7".to_string());
        validate(&rules, &query, None).unwrap();

        query.insert("x".to_string(), "11".to_string());
        assert!(validate(&rules, &query, None).is_err());
        query.insert("x".to_string(), "seven".to_string());
        assert!(validate(&rules, &query, None).is_err());
    }

    #[test]
    fn email_and_uuid_shapes() {
        let rules = [
            FieldRule::required_body("email", FieldKind::Email),
            FieldRule::required_body("id", FieldKind::Uuid),
        ];
        validate(
            &rules,
            &no_query(),
            Some(&json!({
                "email": "creator@example.com",
                "id": "7f6c3a4e-1f8a-4a8e-9f6e-0a1b2c3d4e5f",
            })),
        )
        .unwrap();
        let err = validate(
            &rules,
            &no_query(),
            Some(&json!({"email": "nope", "id": "also-nope"})),
        )
        .unwrap_err();
        let body = err.body();
        assert_eq!(body["error"]["details"].as_array().unwrap().len(), 2);
    }
}
