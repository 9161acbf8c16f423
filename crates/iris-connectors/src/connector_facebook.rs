//! Facebook Messenger and page-feed connector.
//!
//! One webhook carries two event families: `entry[].messaging[]` for direct
//! messages and `entry[].changes[]` for page feed comments. Comments thread
//! under a synthetic `post-<post_id>` conversation id so replies land on the
//! comment rather than in Messenger.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::connector_contract::{
    read_unpoisoned, write_unpoisoned, ChannelConnector, ChannelProvider, ConnectorError,
    ConnectorResult, MessageKind, OutboundMessage, ParsedMessage, SendResult,
    SignatureEnforcement, PARSED_MESSAGE_SCHEMA_VERSION,
};
use crate::connector_http::{build_provider_client, post_json_for_send};
use crate::connector_payload::{
    array_field, as_object, object_field, optional_string_field, optional_u64_value,
    parse_json_payload,
};
use crate::connector_signature::verify_graph_signature;

pub const FACEBOOK_API_BASE: &str = "https://graph.facebook.com/v18.0";

/// Synthetic thread prefix for page feed comment conversations.
pub const FEED_THREAD_PREFIX: &str = "post-";

const PROVIDER: ChannelProvider = ChannelProvider::Facebook;

#[derive(Debug, Clone, Default, Deserialize)]
struct RawFacebookChannelConfig {
    #[serde(default)]
    page_access_token: Option<String>,
    #[serde(default)]
    app_secret: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
}

#[derive(Debug, Clone)]
struct FacebookChannelConfig {
    page_access_token: String,
    app_secret: Option<String>,
    api_base: String,
}

/// Public struct `FacebookConnector` used across Iris components.
pub struct FacebookConnector {
    config: RwLock<Option<FacebookChannelConfig>>,
    client: Client,
}

impl FacebookConnector {
    pub fn new() -> ConnectorResult<Self> {
        Ok(Self {
            config: RwLock::new(None),
            client: build_provider_client(PROVIDER)?,
        })
    }

    fn config_snapshot(&self) -> ConnectorResult<FacebookChannelConfig> {
        read_unpoisoned(&self.config).clone().ok_or_else(|| {
            ConnectorError::missing_config(PROVIDER, "facebook connector is not initialized")
        })
    }

    fn parse_config(config: &Value) -> ConnectorResult<FacebookChannelConfig> {
        let raw: RawFacebookChannelConfig =
            serde_json::from_value(config.clone()).map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("facebook channel config is not an object: {error}"),
                )
            })?;
        let page_access_token = raw
            .page_access_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ConnectorError::missing_config(
                    PROVIDER,
                    "facebook channel config requires page_access_token",
                )
            })?
            .to_string();
        let api_base = raw
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(FACEBOOK_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Ok(FacebookChannelConfig {
            page_access_token,
            app_secret: raw
                .app_secret
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            api_base,
        })
    }

    fn parse_messaging_event(event: &serde_json::Map<String, Value>) -> ConnectorResult<ParsedMessage> {
        let message = object_field(event, "message", PROVIDER, "messaging[0].message")?;
        if message
            .get("is_echo")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(ConnectorError::malformed_payload(
                PROVIDER,
                "webhook contains no inbound message (echo event)",
            ));
        }
        let sender = object_field(event, "sender", PROVIDER, "messaging[0].sender")?;
        let sender_id = optional_string_field(sender, "id").ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "messaging[0].sender.id is required")
        })?;

        let mut media_urls = Vec::new();
        let mut attachment_label = None;
        if let Some(attachments) = message.get("attachments").and_then(Value::as_array) {
            for attachment in attachments {
                let kind = attachment
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("file");
                if attachment_label.is_none() {
                    attachment_label = Some(match kind {
                        "image" => "[Image]".to_string(),
                        "video" => "[Video]".to_string(),
                        "audio" => "[Audio Message]".to_string(),
                        other => format!("[{}]", capitalize(other)),
                    });
                }
                if let Some(url) = attachment
                    .get("payload")
                    .and_then(|payload| payload.get("url"))
                    .and_then(Value::as_str)
                {
                    media_urls.push(url.to_string());
                }
            }
        }
        let content = message
            .get("text")
            .and_then(Value::as_str)
            .map(|text| text.to_string())
            .filter(|text| !text.is_empty())
            .or(attachment_label)
            .unwrap_or_default();

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "platform".to_string(),
            Value::String("facebook".to_string()),
        );

        Ok(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            external_message_id: optional_string_field(message, "mid")
                .unwrap_or_else(|| iris_core::mint_unique_id("fb")),
            external_thread_id: sender_id.clone(),
            sender_name: sender_id.clone(),
            sender_address: Some(sender_id),
            content,
            message_kind: MessageKind::Message,
            post_id: None,
            media_urls,
            timestamp_unix_ms: optional_u64_value(event.get("timestamp"))
                .unwrap_or_else(iris_core::current_unix_timestamp_ms),
            metadata,
        })
    }

    fn parse_feed_change(change: &serde_json::Map<String, Value>) -> ConnectorResult<ParsedMessage> {
        let value = object_field(change, "value", PROVIDER, "changes[0].value")?;
        let item = optional_string_field(value, "item").unwrap_or_default();
        if item != "comment" {
            return Err(ConnectorError::malformed_payload(
                PROVIDER,
                format!("webhook contains no inbound message (feed item {item:?})"),
            ));
        }
        let comment_id = optional_string_field(value, "comment_id").ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "changes[0].value.comment_id is required")
        })?;
        let post_id = optional_string_field(value, "post_id").ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "changes[0].value.post_id is required")
        })?;
        let from = object_field(value, "from", PROVIDER, "changes[0].value.from")?;
        let sender_id = optional_string_field(from, "id").ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "changes[0].value.from.id is required")
        })?;
        let sender_name =
            optional_string_field(from, "name").unwrap_or_else(|| sender_id.clone());

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "platform".to_string(),
            Value::String("facebook".to_string()),
        );
        metadata.insert("comment_id".to_string(), Value::String(comment_id.clone()));

        Ok(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            external_message_id: comment_id,
            external_thread_id: format!("{FEED_THREAD_PREFIX}{post_id}"),
            sender_name,
            sender_address: Some(sender_id),
            content: optional_string_field(value, "message").unwrap_or_default(),
            message_kind: MessageKind::Comment,
            post_id: Some(post_id),
            media_urls: Vec::new(),
            timestamp_unix_ms: optional_u64_value(value.get("created_time"))
                .map(|seconds| seconds.saturating_mul(1_000))
                .unwrap_or_else(iris_core::current_unix_timestamp_ms),
            metadata,
        })
    }
}

#[async_trait]
impl ChannelConnector for FacebookConnector {
    fn provider(&self) -> ChannelProvider {
        PROVIDER
    }

    fn init(&self, config: &Value) -> ConnectorResult<()> {
        let parsed = Self::parse_config(config)?;
        *write_unpoisoned(&self.config) = Some(parsed);
        Ok(())
    }

    fn verify_signature(
        &self,
        headers: &BTreeMap<String, String>,
        raw_body: &[u8],
        enforcement: SignatureEnforcement,
    ) -> bool {
        let app_secret = read_unpoisoned(&self.config)
            .as_ref()
            .and_then(|config| config.app_secret.clone());
        verify_graph_signature(PROVIDER, app_secret.as_deref(), headers, raw_body, enforcement)
    }

    fn parse_webhook(&self, raw_body: &[u8]) -> ConnectorResult<ParsedMessage> {
        let payload = parse_json_payload(raw_body, PROVIDER)?;
        let payload = as_object(&payload, PROVIDER, "facebook webhook payload")?;
        let entries = array_field(payload, "entry", PROVIDER, "entry")?;
        let entry = entries.first().ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "entry must not be empty")
        })?;
        let entry = as_object(entry, PROVIDER, "entry[0]")?;

        if let Some(event) = entry
            .get("messaging")
            .and_then(Value::as_array)
            .and_then(|events| events.first())
            .and_then(Value::as_object)
        {
            return Self::parse_messaging_event(event);
        }
        if let Some(change) = entry
            .get("changes")
            .and_then(Value::as_array)
            .and_then(|changes| changes.first())
            .and_then(Value::as_object)
        {
            return Self::parse_feed_change(change);
        }
        Err(ConnectorError::malformed_payload(
            PROVIDER,
            "entry[0] carries neither messaging nor changes events",
        ))
    }

    async fn send(&self, outbound: &OutboundMessage) -> ConnectorResult<SendResult> {
        let config = self.config_snapshot()?;
        let is_feed_thread = outbound.external_thread_id.starts_with(FEED_THREAD_PREFIX);
        // Graph page endpoints authenticate with the token as a query
        // parameter rather than a bearer header.
        let (url, body, id_key) = if is_feed_thread {
            let comment_id = outbound
                .metadata
                .get("comment_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ConnectorError::invalid_config(
                        PROVIDER,
                        "feed reply requires comment_id metadata from the inbound comment",
                    )
                })?;
            (
                format!(
                    "{}/{}/comments?access_token={}",
                    config.api_base, comment_id, config.page_access_token
                ),
                json!({ "message": outbound.content }),
                "id",
            )
        } else {
            (
                format!(
                    "{}/me/messages?access_token={}",
                    config.api_base, config.page_access_token
                ),
                json!({
                    "recipient": { "id": outbound.external_thread_id },
                    "messaging_type": "RESPONSE",
                    "message": { "text": outbound.content },
                }),
                "message_id",
            )
        };
        match post_json_for_send(&self.client, &url, None, &body, PROVIDER).await
        {
            Ok(response) => Ok(SendResult {
                success: true,
                external_message_id: response
                    .get(id_key)
                    .and_then(Value::as_str)
                    .map(|id| id.to_string()),
                error: None,
            }),
            Err(detail) => Ok(SendResult::rejected(detail)),
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
