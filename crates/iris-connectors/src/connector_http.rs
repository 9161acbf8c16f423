//! Shared HTTP plumbing for the REST-backed providers.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::connector_contract::{ChannelProvider, ConnectorError, ConnectorResult};

pub(crate) const DEFAULT_SEND_TIMEOUT_MS: u64 = 15_000;

pub(crate) fn build_provider_client(provider: ChannelProvider) -> ConnectorResult<Client> {
    Client::builder()
        .timeout(Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS))
        .build()
        .map_err(|error| {
            ConnectorError::invalid_config(
                provider,
                format!("failed to initialize http client: {error}"),
            )
        })
}

/// Posts `body` as JSON and returns the decoded response on 2xx. Transport
/// failures and non-success statuses come back as the error string a
/// `SendResult::rejected` carries; provider-side failures never escape as
/// typed errors.
pub(crate) async fn post_json_for_send(
    client: &Client,
    url: &str,
    bearer_token: Option<&str>,
    body: &Value,
    provider: ChannelProvider,
) -> Result<Value, String> {
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer_token {
        request = request.bearer_auth(token);
    }
    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            return Err(format!(
                "{} transport error: {error}",
                provider.as_str()
            ));
        }
    };

    let status = response.status();
    let raw_body = response.text().await.unwrap_or_default();
    if status.is_success() {
        return serde_json::from_str(&raw_body).map_err(|error| {
            format!("{} response parse error: {error}", provider.as_str())
        });
    }
    Err(send_failure_detail(provider, status, &raw_body))
}

pub(crate) fn send_failure_detail(
    provider: ChannelProvider,
    status: StatusCode,
    raw_body: &str,
) -> String {
    format!(
        "{} request failed with status {}: {}",
        provider.as_str(),
        status.as_u16(),
        truncate_detail(raw_body)
    )
}

pub(crate) fn truncate_detail(raw: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = raw.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let mut output = String::new();
    for ch in trimmed.chars().take(LIMIT) {
        output.push(ch);
    }
    output.push_str("...");
    output
}
