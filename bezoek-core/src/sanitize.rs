//! Redaction of request and response payloads before they reach a log line.
//!
//! Raw provider payloads carry credentials, session tokens, license plates,
//! and account holder details. Nothing may be traced or dumped without first
//! passing through [`sanitize_json`] or [`sanitize_headers`].

use std::collections::BTreeMap;

use reqwest::header::HeaderMap;
use serde_json::{Map, Value};

use crate::normalize::mask_license_plate;

const REDACTED: &str = "***";

/// Keys whose values are secrets and are always replaced with `***`.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "authorization",
    "access_token",
    "refresh_token",
    "secret",
    "pin",
    "identifier",
    "code",
    "permitmediacode",
    "permit_media_code",
    "permitmediatypeid",
    "permit_media_type_id",
];

/// Keys that identify the account holder rather than the session.
const PII_KEYS: &[&str] = &[
    "email",
    "phone",
    "username",
    "user_name",
    "first_name",
    "last_name",
    "name",
];

/// Keys whose values are license plates, masked rather than fully redacted.
const PLATE_KEYS: &[&str] = &[
    "license_plate",
    "licenseplate",
    "license_plates",
    "licenseplates",
    "vehicle_plate",
    "vrn",
    "plate",
];

/// Header names whose values never appear in logs.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "token",
];

/// Return a copy of `value` safe to log: secrets and PII replaced with
/// `***`, license plates masked, everything else untouched.
#[must_use]
pub fn sanitize_json(value: &Value) -> Value {
    sanitize_value(value, false)
}

/// Render headers as a sorted name/value map with sensitive values redacted.
#[must_use]
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(header_name, header_value)| {
            let name = header_name.as_str().to_owned();
            let value = match header_value.to_str() {
                Ok(text) if !SENSITIVE_HEADERS.contains(&name.as_str()) => text.to_owned(),
                _ => String::from(REDACTED),
            };
            (name, value)
        })
        .collect()
}

fn sanitize_value(value: &Value, plate_context: bool) -> Value {
    match value {
        Value::Object(fields) => {
            let mut sanitized = Map::with_capacity(fields.len());
            for (key, field) in fields {
                sanitized.insert(key.clone(), sanitize_field(key, field, plate_context));
            }
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, plate_context))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sanitize_field(key: &str, value: &Value, plate_context: bool) -> Value {
    let lowered = key.to_lowercase();
    if SENSITIVE_KEYS.contains(&lowered.as_str()) || PII_KEYS.contains(&lowered.as_str()) {
        return Value::String(String::from(REDACTED));
    }
    if PLATE_KEYS.contains(&lowered.as_str()) {
        return match value {
            Value::String(plate) => Value::String(mask_license_plate(plate)),
            nested => sanitize_value(nested, true),
        };
    }
    // Inside a plate-keyed object the raw plate sits under value/displayValue.
    if plate_context
        && matches!(lowered.as_str(), "value" | "displayvalue")
        && let Value::String(plate) = value
    {
        return Value::String(mask_license_plate(plate));
    }
    sanitize_value(value, plate_context)
}
