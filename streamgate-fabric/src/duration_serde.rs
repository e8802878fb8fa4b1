//! Serde support for human-readable duration strings in configuration.
//!
//! Accepts `"250ms"`, `"30s"`, `"1.5s"`, `"5m"`, `"2h"` or a raw
//! `{secs, nanos}` object; serializes back to the most compact unit.

use serde::{Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let text = if duration.subsec_nanos() != 0 {
        format!("{}ms", duration.as_millis())
    } else {
        let secs = duration.as_secs();
        if secs % 3600 == 0 && secs != 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 && secs != 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    };
    serializer.serialize_str(&text)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde::Deserialize;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => parse(&s).map_err(Error::custom),
        Value::Number(n) => {
            // Bare numbers are seconds.
            let secs = n
                .as_f64()
                .ok_or_else(|| Error::custom("invalid duration number"))?;
            if secs < 0.0 {
                return Err(Error::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(secs))
        }
        Value::Object(obj) => {
            let secs = obj
                .get("secs")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::custom("missing 'secs' field"))?;
            let nanos = obj.get("nanos").and_then(|v| v.as_u64()).unwrap_or(0);
            Ok(Duration::new(secs, nanos as u32))
        }
        _ => Err(Error::custom("invalid duration format")),
    }
}

/// Optional-duration variant for config fields that may be absent.
pub mod option {
    use super::*;
    use serde::Deserialize;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => super::parse(&s).map(Some).map_err(Error::custom),
            Some(other) => {
                let wrapped = serde_json::from_value::<DurationWrapper>(other)
                    .map_err(|e| Error::custom(e.to_string()))?;
                Ok(Some(wrapped.0))
            }
        }
    }

    #[derive(Deserialize)]
    struct DurationWrapper(#[serde(with = "crate::duration_serde")] Duration);
}

fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Some(stripped) = s.strip_suffix("ms") {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_millis(num));
    }
    if let Some(stripped) = s.strip_suffix('s') {
        if !stripped.ends_with('m') && !stripped.ends_with('h') {
            let num: f64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            if num < 0.0 {
                return Err("duration must be non-negative".to_string());
            }
            return Ok(Duration::from_secs_f64(num));
        }
    }
    if let Some(stripped) = s.strip_suffix('m') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 60));
    }
    if let Some(stripped) = s.strip_suffix('h') {
        let num: u64 = stripped
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 3600));
    }
    Err(format!("unknown duration unit: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_units() {
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("fast").is_err());
        assert!(parse("-3s").is_err());
    }

    #[test]
    fn serializes_compact_units() {
        #[derive(serde::Serialize)]
        struct Wrap(#[serde(with = "crate::duration_serde")] Duration);

        let json = serde_json::to_string(&Wrap(Duration::from_secs(120))).unwrap();
        assert_eq!(json, "\"2m\"");
        let json = serde_json::to_string(&Wrap(Duration::from_millis(1500))).unwrap();
        assert_eq!(json, "\"1500ms\"");
    }
}
