//! Field-extraction helpers for provider webhook payloads.
//!
//! Providers disagree about whether identifiers arrive as strings or numbers,
//! so the string helpers accept both. Every failure becomes a
//! `MalformedPayload` connector error naming the missing field.

use chrono::DateTime;
use serde_json::{Map, Value};

use crate::connector_contract::{ChannelProvider, ConnectorError, ConnectorResult};

pub(crate) fn parse_json_payload(
    raw_body: &[u8],
    provider: ChannelProvider,
) -> ConnectorResult<Value> {
    serde_json::from_slice(raw_body).map_err(|error| {
        ConnectorError::malformed_payload(provider, format!("payload is not valid JSON: {error}"))
    })
}

pub(crate) fn as_object<'a>(
    value: &'a Value,
    provider: ChannelProvider,
    detail: &str,
) -> ConnectorResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ConnectorError::malformed_payload(provider, format!("{detail} must be an object")))
}

pub(crate) fn object_field<'a>(
    parent: &'a Map<String, Value>,
    key: &str,
    provider: ChannelProvider,
    field_name: &str,
) -> ConnectorResult<&'a Map<String, Value>> {
    let value = parent.get(key).ok_or_else(|| {
        ConnectorError::malformed_payload(provider, format!("{field_name} is required"))
    })?;
    as_object(value, provider, field_name)
}

pub(crate) fn array_field<'a>(
    parent: &'a Map<String, Value>,
    key: &str,
    provider: ChannelProvider,
    field_name: &str,
) -> ConnectorResult<&'a Vec<Value>> {
    parent
        .get(key)
        .ok_or_else(|| {
            ConnectorError::malformed_payload(provider, format!("{field_name} is required"))
        })?
        .as_array()
        .ok_or_else(|| {
            ConnectorError::malformed_payload(provider, format!("{field_name} must be an array"))
        })
}

pub(crate) fn required_string_field(
    object: &Map<String, Value>,
    key: &str,
    provider: ChannelProvider,
    field_name: &str,
) -> ConnectorResult<String> {
    let parsed = optional_string_field(object, key);
    let Some(parsed) = parsed else {
        return Err(ConnectorError::malformed_payload(
            provider,
            format!("{field_name} is required"),
        ));
    };
    if parsed.trim().is_empty() {
        return Err(ConnectorError::malformed_payload(
            provider,
            format!("{field_name} cannot be empty"),
        ));
    }
    Ok(parsed)
}

pub(crate) fn optional_string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    optional_string_value(object.get(key))
}

pub(crate) fn optional_string_value(value: Option<&Value>) -> Option<String> {
    let value = value?;
    match value {
        Value::String(raw) => Some(raw.trim().to_string()),
        Value::Number(raw) => Some(raw.to_string()),
        _ => None,
    }
}

pub(crate) fn optional_u64_value(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    match value {
        Value::Number(raw) => raw.as_u64(),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    }
}

pub(crate) fn parse_rfc3339_to_unix_ms(raw: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}
