//! HTTP-polled sensors.
//!
//! Remote analysers (lab instruments, plant gateways) expose their latest
//! reading over HTTP. The body may be a bare number or a JSON object; for
//! JSON the configured channel-field name is looked up, defaulting to
//! `value`. These reads ride the HTTP worker, never the tick thread.

use std::time::Duration;

use wt_common::consts::TIMEOUT_HTTP_MS;
use wt_common::error::{RtuError, RtuResult};

/// A bound web-poll sensor.
pub struct WebPoll {
    client: reqwest::blocking::Client,
    url: String,
    /// JSON field carrying the value; `None` parses the body as a number.
    field: Option<String>,
}

impl WebPoll {
    /// Bind a URL. `field` selects a JSON member; `None` expects a bare
    /// numeric body (JSON objects still fall back to `"value"`).
    pub fn new(url: &str, field: Option<String>) -> RtuResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(TIMEOUT_HTTP_MS))
            .build()
            .map_err(|e| RtuError::Io(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            field,
        })
    }

    /// Fetch and parse one reading.
    pub fn read(&self) -> RtuResult<f32> {
        let response = self.client.get(&self.url).send().map_err(|e| {
            if e.is_timeout() {
                RtuError::Timeout(format!("web poll {}", self.url))
            } else {
                RtuError::Io(format!("web poll {}: {e}", self.url))
            }
        })?;
        if !response.status().is_success() {
            return Err(RtuError::Io(format!(
                "web poll {}: HTTP {}",
                self.url,
                response.status()
            )));
        }
        let body = response
            .text()
            .map_err(|e| RtuError::Io(format!("web poll {}: {e}", self.url)))?;
        parse_body(&body, self.field.as_deref())
    }
}

/// Parse a response body into a value.
pub fn parse_body(body: &str, field: Option<&str>) -> RtuResult<f32> {
    let trimmed = body.trim();

    // Bare numeric body.
    if let Ok(value) = trimmed.parse::<f32>() {
        return finite(value);
    }

    // JSON object with the configured (or default) field.
    let json: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| RtuError::Io(format!("web poll body is neither number nor JSON: {e}")))?;
    let field = field.unwrap_or("value");
    let member = json
        .get(field)
        .ok_or_else(|| RtuError::Io(format!("web poll JSON has no field '{field}'")))?;
    let value = member
        .as_f64()
        .ok_or_else(|| RtuError::Io(format!("web poll field '{field}' is not numeric")))?;
    finite(value as f32)
}

fn finite(value: f32) -> RtuResult<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RtuError::InvalidParam(format!(
            "web poll produced non-finite value {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_bodies_parse() {
        assert_eq!(parse_body("7.25", None).unwrap(), 7.25);
        assert_eq!(parse_body("  -3 \n", None).unwrap(), -3.0);
    }

    #[test]
    fn json_default_field() {
        assert_eq!(parse_body(r#"{"value": 4.5}"#, None).unwrap(), 4.5);
    }

    #[test]
    fn json_named_field() {
        let body = r#"{"turbidity_ntu": 1.8, "value": 99.0}"#;
        assert_eq!(parse_body(body, Some("turbidity_ntu")).unwrap(), 1.8);
    }

    #[test]
    fn missing_field_is_error() {
        assert!(parse_body(r#"{"other": 1}"#, None).is_err());
    }

    #[test]
    fn garbage_body_is_error() {
        assert!(parse_body("<html>oops</html>", None).is_err());
    }

    #[test]
    fn non_finite_rejected() {
        assert!(parse_body("NaN", None).is_err());
        assert!(parse_body("inf", None).is_err());
    }
}
