//! Telegram Bot API connector.
//!
//! Webhook updates carry `message` or `edited_message`; the chat id is the
//! conversation thread. Telegram is the one provider that registers its own
//! webhook URL through an API call (`setWebhook`) and authenticates deliveries
//! with the optional `X-Telegram-Bot-Api-Secret-Token` shared-secret header
//! instead of an HMAC signature.

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
    as_object, object_field, optional_string_field, optional_string_value, optional_u64_value,
    parse_json_payload,
};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Header Telegram echoes back when a `secret_token` was set on the webhook.
pub const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

const PROVIDER: ChannelProvider = ChannelProvider::Telegram;

#[derive(Debug, Clone, Default, Deserialize)]
struct RawTelegramChannelConfig {
    #[serde(default)]
    bot_token: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
}

#[derive(Debug, Clone)]
struct TelegramChannelConfig {
    bot_token: String,
    webhook_secret: Option<String>,
    api_base: String,
}

/// Public struct `TelegramConnector` used across Iris components.
pub struct TelegramConnector {
    config: RwLock<Option<TelegramChannelConfig>>,
    client: Client,
}

impl TelegramConnector {
    pub fn new() -> ConnectorResult<Self> {
        Ok(Self {
            config: RwLock::new(None),
            client: build_provider_client(PROVIDER)?,
        })
    }

    fn config_snapshot(&self) -> ConnectorResult<TelegramChannelConfig> {
        read_unpoisoned(&self.config).clone().ok_or_else(|| {
            ConnectorError::missing_config(PROVIDER, "telegram connector is not initialized")
        })
    }

    fn parse_config(config: &Value) -> ConnectorResult<TelegramChannelConfig> {
        let raw: RawTelegramChannelConfig =
            serde_json::from_value(config.clone()).map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("telegram channel config is not an object: {error}"),
                )
            })?;
        let bot_token = raw
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ConnectorError::missing_config(
                    PROVIDER,
                    "telegram channel config requires bot_token",
                )
            })?
            .to_string();
        let api_base = raw
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(TELEGRAM_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Ok(TelegramChannelConfig {
            bot_token,
            webhook_secret: raw
                .webhook_secret
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            api_base,
        })
    }

    async fn call_bot_api(
        &self,
        config: &TelegramChannelConfig,
        method: &str,
        body: &Value,
    ) -> Result<Value, String> {
        let url = format!("{}/bot{}/{}", config.api_base, config.bot_token, method);
        let response = post_json_for_send(&self.client, &url, None, body, PROVIDER).await?;
        if response.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(response)
        } else {
            let description = response
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("bot API reported ok=false");
            Err(format!("telegram {method} failed: {description}"))
        }
    }
}

#[async_trait]
impl ChannelConnector for TelegramConnector {
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
        let _ = raw_body;
        let expected = read_unpoisoned(&self.config)
            .as_ref()
            .and_then(|config| config.webhook_secret.clone());
        let Some(secret) = expected.as_deref() else {
            // No secret registered with setWebhook, so Telegram sends no
            // header and there is nothing to check.
            return true;
        };
        match headers.get(TELEGRAM_SECRET_HEADER) {
            Some(header) if header == secret => true,
            Some(_) => {
                tracing::warn!(
                    provider = PROVIDER.as_str(),
                    "webhook secret token mismatch; rejecting"
                );
                false
            }
            None => match enforcement {
                SignatureEnforcement::Strict => {
                    tracing::warn!(
                        provider = PROVIDER.as_str(),
                        "webhook secret token header absent under strict signature policy; rejecting"
                    );
                    false
                }
                SignatureEnforcement::Permissive => {
                    tracing::warn!(
                        provider = PROVIDER.as_str(),
                        "accepting unverified webhook under permissive signature policy"
                    );
                    true
                }
            },
        }
    }

    fn parse_webhook(&self, raw_body: &[u8]) -> ConnectorResult<ParsedMessage> {
        let payload = parse_json_payload(raw_body, PROVIDER)?;
        let payload = as_object(&payload, PROVIDER, "telegram update")?;
        let message = payload
            .get("message")
            .or_else(|| payload.get("edited_message"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ConnectorError::malformed_payload(
                    PROVIDER,
                    "update carries neither message nor edited_message",
                )
            })?;

        let chat = object_field(message, "chat", PROVIDER, "message.chat")?;
        let chat_id = optional_string_value(chat.get("id")).ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "message.chat.id is required")
        })?;
        let message_id = optional_string_value(message.get("message_id")).ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "message.message_id is required")
        })?;

        let from = message.get("from").and_then(Value::as_object);
        let first_name = from.and_then(|from| optional_string_field(from, "first_name"));
        let last_name = from.and_then(|from| optional_string_field(from, "last_name"));
        let username = from.and_then(|from| optional_string_field(from, "username"));
        let sender_name = match (first_name, last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first,
            _ => username
                .clone()
                .unwrap_or_else(|| "Telegram user".to_string()),
        };

        let mut media_urls = Vec::new();
        let content = if let Some(text) = optional_string_field(message, "text") {
            text
        } else if let Some(photos) = message.get("photo").and_then(Value::as_array) {
            // Telegram lists every resolution; the last entry is the largest.
            if let Some(file_id) = photos
                .last()
                .and_then(|photo| photo.get("file_id"))
                .and_then(Value::as_str)
            {
                media_urls.push(file_id.to_string());
            }
            optional_string_field(message, "caption").unwrap_or_else(|| "[Photo]".to_string())
        } else if let Some(video) = message.get("video").and_then(Value::as_object) {
            if let Some(file_id) = optional_string_field(video, "file_id") {
                media_urls.push(file_id);
            }
            optional_string_field(message, "caption").unwrap_or_else(|| "[Video]".to_string())
        } else if let Some(document) = message.get("document").and_then(Value::as_object) {
            if let Some(file_id) = optional_string_field(document, "file_id") {
                media_urls.push(file_id);
            }
            let file_name =
                optional_string_field(document, "file_name").unwrap_or_else(|| "unnamed".to_string());
            format!("[Document: {file_name}]")
        } else if let Some(voice) = message.get("voice").and_then(Value::as_object) {
            if let Some(file_id) = optional_string_field(voice, "file_id") {
                media_urls.push(file_id);
            }
            "[Audio Message]".to_string()
        } else if let Some(sticker) = message.get("sticker").and_then(Value::as_object) {
            optional_string_field(sticker, "emoji").unwrap_or_else(|| "[Sticker]".to_string())
        } else {
            return Err(ConnectorError::malformed_payload(
                PROVIDER,
                "update carries no supported message content",
            ));
        };

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "platform".to_string(),
            Value::String("telegram".to_string()),
        );
        if let Some(username) = username.as_ref() {
            metadata.insert(
                "username".to_string(),
                Value::String(username.clone()),
            );
        }
        if payload.contains_key("edited_message") {
            metadata.insert("edited".to_string(), Value::Bool(true));
        }

        Ok(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            // message_id restarts per chat, so scope it by the chat to keep
            // the dedup key unique across the whole bot.
            external_message_id: format!("{chat_id}:{message_id}"),
            external_thread_id: chat_id,
            sender_name,
            sender_address: username,
            content,
            message_kind: MessageKind::Message,
            post_id: None,
            media_urls,
            timestamp_unix_ms: optional_u64_value(message.get("date"))
                .map(|seconds| seconds.saturating_mul(1_000))
                .unwrap_or_else(iris_core::current_unix_timestamp_ms),
            metadata,
        })
    }

    async fn send(&self, outbound: &OutboundMessage) -> ConnectorResult<SendResult> {
        let config = self.config_snapshot()?;
        let body = json!({
            "chat_id": outbound.external_thread_id,
            "text": outbound.content,
            "parse_mode": "HTML",
        });
        match self.call_bot_api(&config, "sendMessage", &body).await {
            Ok(response) => {
                let external_message_id = response
                    .get("result")
                    .and_then(|result| result.get("message_id"))
                    .and_then(Value::as_u64)
                    .map(|id| id.to_string());
                Ok(SendResult {
                    success: true,
                    external_message_id,
                    error: None,
                })
            }
            Err(detail) => Ok(SendResult::rejected(detail)),
        }
    }

    async fn register_webhook(&self, callback_url: &str) -> ConnectorResult<()> {
        let config = self.config_snapshot()?;
        let mut body = json!({
            "url": callback_url,
            "allowed_updates": ["message", "edited_message"],
        });
        if let Some(secret) = config.webhook_secret.as_ref() {
            body["secret_token"] = Value::String(secret.clone());
        }
        self.call_bot_api(&config, "setWebhook", &body)
            .await
            .map(|_| ())
            .map_err(|detail| ConnectorError::invalid_config(PROVIDER, detail))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn initialized_connector(api_base: &str, webhook_secret: Option<&str>) -> TelegramConnector {
        let connector = TelegramConnector::new().expect("connector");
        let mut config = json!({ "bot_token": "12:abc", "api_base": api_base });
        if let Some(secret) = webhook_secret {
            config["webhook_secret"] = Value::String(secret.to_string());
        }
        connector.init(&config).expect("init");
        connector
    }

    #[test]
    fn unit_init_requires_bot_token() {
        let connector = TelegramConnector::new().expect("connector");
        let error = connector
            .init(&json!({ "webhook_secret": "s" }))
            .expect_err("missing bot_token");
        assert!(error.message.contains("bot_token"));
    }

    #[test]
    fn functional_parse_webhook_reads_text_update() {
        let connector = initialized_connector("https://api.test", None);
        let payload = json!({
            "update_id": 700,
            "message": {
                "message_id": 55,
                "date": 1_700_000_000,
                "chat": { "id": 8812, "type": "private" },
                "from": { "id": 8812, "first_name": "Lena", "last_name": "K", "username": "lenak" },
                "text": "order status?"
            }
        });
        let parsed = connector
            .parse_webhook(payload.to_string().as_bytes())
            .expect("parse");
        assert_eq!(parsed.external_thread_id, "8812");
        assert_eq!(parsed.external_message_id, "8812:55");
        assert_eq!(parsed.sender_name, "Lena K");
        assert_eq!(parsed.sender_address.as_deref(), Some("lenak"));
        assert_eq!(parsed.content, "order status?");
        assert_eq!(parsed.timestamp_unix_ms, 1_700_000_000_000);
    }

    #[test]
    fn functional_parse_webhook_covers_media_and_edits() {
        let connector = initialized_connector("https://api.test", None);
        let photo = json!({
            "message": {
                "message_id": 56,
                "chat": { "id": 8812 },
                "from": { "first_name": "Lena" },
                "photo": [
                    { "file_id": "small" },
                    { "file_id": "big" }
                ]
            }
        });
        let parsed = connector
            .parse_webhook(photo.to_string().as_bytes())
            .expect("parse photo");
        assert_eq!(parsed.content, "[Photo]");
        assert_eq!(parsed.media_urls, vec!["big".to_string()]);

        let edited = json!({
            "edited_message": {
                "message_id": 56,
                "chat": { "id": 8812 },
                "from": { "first_name": "Lena" },
                "text": "order status please"
            }
        });
        let parsed = connector
            .parse_webhook(edited.to_string().as_bytes())
            .expect("parse edit");
        assert_eq!(parsed.content, "order status please");
        assert_eq!(parsed.metadata.get("edited"), Some(&Value::Bool(true)));
    }

    #[test]
    fn unit_verify_signature_checks_shared_secret_header() {
        let connector = initialized_connector("https://api.test", Some("hook-secret"));
        let mut headers = BTreeMap::new();
        headers.insert(
            TELEGRAM_SECRET_HEADER.to_string(),
            "hook-secret".to_string(),
        );
        assert!(connector.verify_signature(&headers, b"{}", SignatureEnforcement::Strict));

        headers.insert(TELEGRAM_SECRET_HEADER.to_string(), "wrong".to_string());
        assert!(!connector.verify_signature(&headers, b"{}", SignatureEnforcement::Strict));
        assert!(!connector.verify_signature(&headers, b"{}", SignatureEnforcement::Permissive));
    }

    #[test]
    fn unit_verify_signature_passes_without_configured_secret() {
        let connector = initialized_connector("https://api.test", None);
        let headers = BTreeMap::new();
        assert!(connector.verify_signature(&headers, b"{}", SignatureEnforcement::Strict));
    }

    #[test]
    fn unit_verify_signature_policy_split_when_header_absent() {
        let connector = initialized_connector("https://api.test", Some("hook-secret"));
        let headers = BTreeMap::new();
        assert!(!connector.verify_signature(&headers, b"{}", SignatureEnforcement::Strict));
        assert!(connector.verify_signature(&headers, b"{}", SignatureEnforcement::Permissive));
    }

    #[tokio::test]
    async fn functional_send_calls_send_message_and_reads_result_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/bot12:abc/sendMessage")
                    .json_body(json!({
                        "chat_id": "8812",
                        "text": "on its way",
                        "parse_mode": "HTML",
                    }));
                then.status(200)
                    .json_body(json!({ "ok": true, "result": { "message_id": 57 } }));
            })
            .await;

        let connector = initialized_connector(&server.base_url(), None);
        let result = connector
            .send(&OutboundMessage {
                ticket_id: "3".to_string(),
                external_thread_id: "8812".to_string(),
                content: "on its way".to_string(),
                sender_name: "Agent".to_string(),
                metadata: BTreeMap::new(),
            })
            .await
            .expect("send");
        mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.external_message_id.as_deref(), Some("57"));
    }

    #[tokio::test]
    async fn functional_send_surfaces_bot_api_rejection() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/bot12:abc/sendMessage");
                then.status(403)
                    .json_body(json!({ "ok": false, "description": "bot was blocked by the user" }));
            })
            .await;

        let connector = initialized_connector(&server.base_url(), None);
        let result = connector
            .send(&OutboundMessage {
                ticket_id: "3".to_string(),
                external_thread_id: "8812".to_string(),
                content: "hello?".to_string(),
                sender_name: "Agent".to_string(),
                metadata: BTreeMap::new(),
            })
            .await
            .expect("send returns a result");
        assert!(!result.success);
        assert!(result.error.expect("detail").contains("403"));
    }

    #[tokio::test]
    async fn functional_register_webhook_sets_url_and_secret() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/bot12:abc/setWebhook")
                    .json_body(json!({
                        "url": "https://iris.example/webhook/9",
                        "allowed_updates": ["message", "edited_message"],
                        "secret_token": "hook-secret",
                    }));
                then.status(200).json_body(json!({ "ok": true, "result": true }));
            })
            .await;

        let connector = initialized_connector(&server.base_url(), Some("hook-secret"));
        connector
            .register_webhook("https://iris.example/webhook/9")
            .await
            .expect("register");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unit_register_webhook_failure_is_a_config_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/bot12:abc/setWebhook");
                then.status(200)
                    .json_body(json!({ "ok": false, "description": "bad webhook: HTTPS url required" }));
            })
            .await;

        let connector = initialized_connector(&server.base_url(), None);
        let error = connector
            .register_webhook("http://insecure.example/webhook/9")
            .await
            .expect_err("registration fails");
        assert!(error.message.contains("HTTPS url required"));
    }
}
