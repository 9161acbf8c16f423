//! Instagram messaging connector.
//!
//! Instagram rides the same Graph webhook envelope as Facebook but with its
//! own event families: `messaging[]` carries DMs and story replies,
//! `changes[]` carries media comments (`field: "comments"`) and caption
//! mentions (`field: "mentions"`). Comment replies go through the dedicated
//! `/{comment_id}/replies` edge.

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
use crate::connector_facebook::FEED_THREAD_PREFIX;
use crate::connector_http::{build_provider_client, post_json_for_send};
use crate::connector_payload::{
    array_field, as_object, object_field, optional_string_field, optional_u64_value,
    parse_json_payload,
};
use crate::connector_signature::verify_graph_signature;

pub const INSTAGRAM_API_BASE: &str = "https://graph.facebook.com/v18.0";

const PROVIDER: ChannelProvider = ChannelProvider::Instagram;

#[derive(Debug, Clone, Default, Deserialize)]
struct RawInstagramChannelConfig {
    #[serde(default)]
    page_access_token: Option<String>,
    #[serde(default)]
    app_secret: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
}

#[derive(Debug, Clone)]
struct InstagramChannelConfig {
    page_access_token: String,
    app_secret: Option<String>,
    api_base: String,
}

/// Public struct `InstagramConnector` used across Iris components.
pub struct InstagramConnector {
    config: RwLock<Option<InstagramChannelConfig>>,
    client: Client,
}

impl InstagramConnector {
    pub fn new() -> ConnectorResult<Self> {
        Ok(Self {
            config: RwLock::new(None),
            client: build_provider_client(PROVIDER)?,
        })
    }

    fn config_snapshot(&self) -> ConnectorResult<InstagramChannelConfig> {
        read_unpoisoned(&self.config).clone().ok_or_else(|| {
            ConnectorError::missing_config(PROVIDER, "instagram connector is not initialized")
        })
    }

    fn parse_config(config: &Value) -> ConnectorResult<InstagramChannelConfig> {
        let raw: RawInstagramChannelConfig =
            serde_json::from_value(config.clone()).map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("instagram channel config is not an object: {error}"),
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
                    "instagram channel config requires page_access_token",
                )
            })?
            .to_string();
        let api_base = raw
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(INSTAGRAM_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Ok(InstagramChannelConfig {
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

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "platform".to_string(),
            Value::String("instagram".to_string()),
        );
        let story_url = message
            .get("reply_to")
            .and_then(|reply_to| reply_to.get("story"))
            .and_then(|story| story.get("url"))
            .and_then(Value::as_str)
            .map(|url| url.to_string());
        let message_kind = if let Some(url) = story_url {
            metadata.insert("story_url".to_string(), Value::String(url));
            MessageKind::StoryReply
        } else {
            MessageKind::Message
        };

        let mut media_urls = Vec::new();
        if let Some(attachments) = message.get("attachments").and_then(Value::as_array) {
            for attachment in attachments {
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
            .unwrap_or_else(|| {
                if media_urls.is_empty() {
                    String::new()
                } else {
                    "[Media]".to_string()
                }
            });

        Ok(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            external_message_id: optional_string_field(message, "mid")
                .unwrap_or_else(|| iris_core::mint_unique_id("ig")),
            external_thread_id: sender_id.clone(),
            sender_name: sender_id.clone(),
            sender_address: Some(sender_id),
            content,
            message_kind,
            post_id: None,
            media_urls,
            timestamp_unix_ms: optional_u64_value(event.get("timestamp"))
                .unwrap_or_else(iris_core::current_unix_timestamp_ms),
            metadata,
        })
    }

    fn parse_change_event(change: &serde_json::Map<String, Value>) -> ConnectorResult<ParsedMessage> {
        let field = optional_string_field(change, "field").unwrap_or_default();
        let value = object_field(change, "value", PROVIDER, "changes[0].value")?;
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "platform".to_string(),
            Value::String("instagram".to_string()),
        );
        match field.as_str() {
            "comments" => {
                let comment_id = optional_string_field(value, "id").ok_or_else(|| {
                    ConnectorError::malformed_payload(
                        PROVIDER,
                        "changes[0].value.id is required for comments",
                    )
                })?;
                let media_id = value
                    .get("media")
                    .and_then(|media| media.get("id"))
                    .and_then(Value::as_str)
                    .map(|id| id.to_string())
                    .ok_or_else(|| {
                        ConnectorError::malformed_payload(
                            PROVIDER,
                            "changes[0].value.media.id is required for comments",
                        )
                    })?;
                let from = object_field(value, "from", PROVIDER, "changes[0].value.from")?;
                let sender_id = optional_string_field(from, "id").ok_or_else(|| {
                    ConnectorError::malformed_payload(
                        PROVIDER,
                        "changes[0].value.from.id is required",
                    )
                })?;
                let sender_name = optional_string_field(from, "username")
                    .unwrap_or_else(|| sender_id.clone());
                metadata.insert(
                    "comment_id".to_string(),
                    Value::String(comment_id.clone()),
                );
                Ok(ParsedMessage {
                    schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
                    external_message_id: comment_id,
                    external_thread_id: format!("{FEED_THREAD_PREFIX}{media_id}"),
                    sender_name,
                    sender_address: Some(sender_id),
                    content: optional_string_field(value, "text").unwrap_or_default(),
                    message_kind: MessageKind::Comment,
                    post_id: Some(media_id),
                    media_urls: Vec::new(),
                    timestamp_unix_ms: iris_core::current_unix_timestamp_ms(),
                    metadata,
                })
            }
            "mentions" => {
                let comment_id = optional_string_field(value, "comment_id").ok_or_else(|| {
                    ConnectorError::malformed_payload(
                        PROVIDER,
                        "changes[0].value.comment_id is required for mentions",
                    )
                })?;
                let media_id = optional_string_field(value, "media_id").ok_or_else(|| {
                    ConnectorError::malformed_payload(
                        PROVIDER,
                        "changes[0].value.media_id is required for mentions",
                    )
                })?;
                metadata.insert(
                    "comment_id".to_string(),
                    Value::String(comment_id.clone()),
                );
                Ok(ParsedMessage {
                    schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
                    external_message_id: comment_id.clone(),
                    external_thread_id: format!("{FEED_THREAD_PREFIX}{media_id}"),
                    sender_name: "Instagram user".to_string(),
                    sender_address: None,
                    content: format!("[Mentioned in comment {comment_id}]"),
                    message_kind: MessageKind::Mention,
                    post_id: Some(media_id),
                    media_urls: Vec::new(),
                    timestamp_unix_ms: iris_core::current_unix_timestamp_ms(),
                    metadata,
                })
            }
            other => Err(ConnectorError::malformed_payload(
                PROVIDER,
                format!("webhook contains no inbound message (change field {other:?})"),
            )),
        }
    }
}

#[async_trait]
impl ChannelConnector for InstagramConnector {
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
        let payload = as_object(&payload, PROVIDER, "instagram webhook payload")?;
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
            return Self::parse_change_event(change);
        }
        Err(ConnectorError::malformed_payload(
            PROVIDER,
            "entry[0] carries neither messaging nor changes events",
        ))
    }

    async fn send(&self, outbound: &OutboundMessage) -> ConnectorResult<SendResult> {
        let config = self.config_snapshot()?;
        let is_feed_thread = outbound.external_thread_id.starts_with(FEED_THREAD_PREFIX);
        // Same query-parameter auth as the Facebook page endpoints.
        let (url, body, id_key) = if is_feed_thread {
            let comment_id = outbound
                .metadata
                .get("comment_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ConnectorError::invalid_config(
                        PROVIDER,
                        "comment reply requires comment_id metadata from the inbound comment",
                    )
                })?;
            (
                format!(
                    "{}/{}/replies?access_token={}",
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

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn initialized_connector(api_base: &str) -> InstagramConnector {
        let connector = InstagramConnector::new().expect("connector");
        connector
            .init(&json!({
                "page_access_token": "token-ig",
                "api_base": api_base,
            }))
            .expect("init");
        connector
    }

    #[test]
    fn functional_parse_webhook_flags_story_replies() {
        let connector = initialized_connector("https://graph.test");
        let payload = json!({
            "entry": [{
                "messaging": [{
                    "sender": { "id": "778" },
                    "timestamp": 1_700_000_111_000_u64,
                    "message": {
                        "mid": "ig.m1",
                        "text": "love this",
                        "reply_to": { "story": { "url": "https://cdn.ig/story/5" } }
                    }
                }]
            }]
        });
        let parsed = connector
            .parse_webhook(payload.to_string().as_bytes())
            .expect("parse");
        assert_eq!(parsed.message_kind, MessageKind::StoryReply);
        assert_eq!(parsed.external_thread_id, "778");
        assert_eq!(
            parsed.metadata.get("story_url"),
            Some(&Value::String("https://cdn.ig/story/5".to_string()))
        );
    }

    #[test]
    fn functional_parse_webhook_handles_comments_and_mentions() {
        let connector = initialized_connector("https://graph.test");
        let comment = json!({
            "entry": [{
                "changes": [{
                    "field": "comments",
                    "value": {
                        "id": "igc-5",
                        "text": "where to buy?",
                        "media": { "id": "media-3" },
                        "from": { "id": "778", "username": "shopper" }
                    }
                }]
            }]
        });
        let parsed = connector
            .parse_webhook(comment.to_string().as_bytes())
            .expect("parse comment");
        assert_eq!(parsed.message_kind, MessageKind::Comment);
        assert_eq!(parsed.external_thread_id, "post-media-3");
        assert_eq!(parsed.sender_name, "shopper");
        assert_eq!(parsed.post_id.as_deref(), Some("media-3"));

        let mention = json!({
            "entry": [{
                "changes": [{
                    "field": "mentions",
                    "value": { "comment_id": "igc-6", "media_id": "media-9" }
                }]
            }]
        });
        let parsed = connector
            .parse_webhook(mention.to_string().as_bytes())
            .expect("parse mention");
        assert_eq!(parsed.message_kind, MessageKind::Mention);
        assert_eq!(parsed.external_thread_id, "post-media-9");
        assert_eq!(parsed.post_id.as_deref(), Some("media-9"));
    }

    #[test]
    fn unit_parse_webhook_rejects_unknown_change_fields() {
        let connector = initialized_connector("https://graph.test");
        let payload = json!({
            "entry": [{
                "changes": [{ "field": "story_insights", "value": {} }]
            }]
        });
        connector
            .parse_webhook(payload.to_string().as_bytes())
            .expect_err("insights are dropped");
    }

    #[tokio::test]
    async fn functional_send_comment_reply_uses_replies_edge() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/igc-5/replies")
                    .query_param("access_token", "token-ig")
                    .json_body(json!({ "message": "DM us your zip code" }));
                then.status(200).json_body(json!({ "id": "igc-7" }));
            })
            .await;

        let connector = initialized_connector(&server.base_url());
        let mut metadata = BTreeMap::new();
        metadata.insert("comment_id".to_string(), Value::String("igc-5".to_string()));
        let result = connector
            .send(&OutboundMessage {
                ticket_id: "12".to_string(),
                external_thread_id: "post-media-3".to_string(),
                content: "DM us your zip code".to_string(),
                sender_name: "Agent".to_string(),
                metadata,
            })
            .await
            .expect("send");
        mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.external_message_id.as_deref(), Some("igc-7"));
    }

    #[tokio::test]
    async fn functional_send_direct_message_uses_messaging_endpoint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/me/messages")
                    .query_param("access_token", "token-ig")
                    .json_body(json!({
                        "recipient": { "id": "778" },
                        "message": { "text": "hello" },
                    }));
                then.status(200).json_body(json!({ "message_id": "ig.out" }));
            })
            .await;

        let connector = initialized_connector(&server.base_url());
        let result = connector
            .send(&OutboundMessage {
                ticket_id: "12".to_string(),
                external_thread_id: "778".to_string(),
                content: "hello".to_string(),
                sender_name: "Agent".to_string(),
                metadata: BTreeMap::new(),
            })
            .await
            .expect("send");
        mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.external_message_id.as_deref(), Some("ig.out"));
    }
}
