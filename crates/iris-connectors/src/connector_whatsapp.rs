//! WhatsApp Cloud API connector.
//!
//! Parses the Graph webhook envelope (`entry[].changes[].value`) plus the
//! simplified smoke-test format local tooling posts, and sends text messages
//! through the phone-number message endpoint.

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
    array_field, as_object, object_field, optional_string_field, parse_json_payload,
    required_string_field,
};
use crate::connector_signature::verify_graph_signature;

pub const WHATSAPP_API_BASE: &str = "https://graph.facebook.com/v18.0";

const PROVIDER: ChannelProvider = ChannelProvider::Whatsapp;

#[derive(Debug, Clone, Default, Deserialize)]
struct RawWhatsappChannelConfig {
    #[serde(default)]
    phone_number_id: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    app_secret: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
}

#[derive(Debug, Clone)]
struct WhatsappChannelConfig {
    phone_number_id: String,
    access_token: String,
    app_secret: Option<String>,
    api_base: String,
}

/// Public struct `WhatsappConnector` used across Iris components.
pub struct WhatsappConnector {
    config: RwLock<Option<WhatsappChannelConfig>>,
    client: Client,
}

impl WhatsappConnector {
    pub fn new() -> ConnectorResult<Self> {
        Ok(Self {
            config: RwLock::new(None),
            client: build_provider_client(PROVIDER)?,
        })
    }

    fn config_snapshot(&self) -> ConnectorResult<WhatsappChannelConfig> {
        read_unpoisoned(&self.config).clone().ok_or_else(|| {
            ConnectorError::missing_config(PROVIDER, "whatsapp connector is not initialized")
        })
    }

    fn parse_config(config: &Value) -> ConnectorResult<WhatsappChannelConfig> {
        let raw: RawWhatsappChannelConfig =
            serde_json::from_value(config.clone()).map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("whatsapp channel config is not an object: {error}"),
                )
            })?;
        let phone_number_id = raw
            .phone_number_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ConnectorError::missing_config(
                    PROVIDER,
                    "whatsapp channel config requires phone_number_id",
                )
            })?
            .to_string();
        let access_token = raw
            .access_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ConnectorError::missing_config(
                    PROVIDER,
                    "whatsapp channel config requires access_token",
                )
            })?
            .to_string();
        let api_base = raw
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(WHATSAPP_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Ok(WhatsappChannelConfig {
            phone_number_id,
            access_token,
            app_secret: raw
                .app_secret
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            api_base,
        })
    }

    fn parse_smoke_payload(payload: &serde_json::Map<String, Value>) -> Option<ParsedMessage> {
        let sender_phone = optional_string_field(payload, "senderPhone")?;
        let content = optional_string_field(payload, "message")?;
        let mut metadata = BTreeMap::new();
        if let Some(extra) = payload.get("metadata").and_then(Value::as_object) {
            for (key, value) in extra {
                metadata.insert(key.clone(), value.clone());
            }
        }
        metadata
            .entry("platform".to_string())
            .or_insert_with(|| Value::String("whatsapp".to_string()));
        Some(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            external_message_id: optional_string_field(payload, "messageId")
                .unwrap_or_else(|| iris_core::mint_unique_id("wa")),
            external_thread_id: sender_phone.clone(),
            sender_name: optional_string_field(payload, "senderName")
                .unwrap_or_else(|| sender_phone.clone()),
            sender_address: Some(sender_phone),
            content,
            message_kind: MessageKind::Message,
            post_id: None,
            media_urls: Vec::new(),
            timestamp_unix_ms: iris_core::current_unix_timestamp_ms(),
            metadata,
        })
    }
}

#[async_trait]
impl ChannelConnector for WhatsappConnector {
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
        let payload = as_object(&payload, PROVIDER, "whatsapp webhook payload")?;

        if let Some(smoke) = Self::parse_smoke_payload(payload) {
            return Ok(smoke);
        }

        let entries = array_field(payload, "entry", PROVIDER, "entry")?;
        let entry = entries.first().ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "entry must not be empty")
        })?;
        let entry = as_object(entry, PROVIDER, "entry[0]")?;
        let changes = array_field(entry, "changes", PROVIDER, "entry[0].changes")?;
        let change = changes.first().ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "entry[0].changes must not be empty")
        })?;
        let change = as_object(change, PROVIDER, "entry[0].changes[0]")?;
        let value = object_field(change, "value", PROVIDER, "entry[0].changes[0].value")?;

        let message = value
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| messages.first())
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ConnectorError::malformed_payload(PROVIDER, "value.messages[0] is required")
            })?;
        let contact = value
            .get("contacts")
            .and_then(Value::as_array)
            .and_then(|contacts| contacts.first())
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ConnectorError::malformed_payload(PROVIDER, "value.contacts[0] is required")
            })?;

        let message_type =
            optional_string_field(message, "type").unwrap_or_else(|| "text".to_string());
        let mut media_urls = Vec::new();
        let content = match message_type.as_str() {
            "text" => message
                .get("text")
                .and_then(|text| text.get("body"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            "image" => {
                collect_media_id(message, "image", &mut media_urls);
                media_caption(message, "image").unwrap_or_else(|| "[Image]".to_string())
            }
            "video" => {
                collect_media_id(message, "video", &mut media_urls);
                media_caption(message, "video").unwrap_or_else(|| "[Video]".to_string())
            }
            "document" => {
                collect_media_id(message, "document", &mut media_urls);
                media_caption(message, "document").unwrap_or_else(|| {
                    let file_name = message
                        .get("document")
                        .and_then(|document| document.get("filename"))
                        .and_then(Value::as_str)
                        .unwrap_or("unnamed");
                    format!("[Document: {file_name}]")
                })
            }
            "audio" => {
                collect_media_id(message, "audio", &mut media_urls);
                "[Audio Message]".to_string()
            }
            other => format!("[{other} message]"),
        };

        let wa_id = required_string_field(contact, "wa_id", PROVIDER, "contacts[0].wa_id")?;
        let sender_name = contact
            .get("profile")
            .and_then(|profile| profile.get("name"))
            .and_then(Value::as_str)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| wa_id.clone());

        let timestamp_unix_ms = optional_string_field(message, "timestamp")
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(|seconds| seconds.saturating_mul(1_000))
            .unwrap_or_else(iris_core::current_unix_timestamp_ms);

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "platform".to_string(),
            Value::String("whatsapp".to_string()),
        );
        metadata.insert("type".to_string(), Value::String(message_type));
        if let Some(status) = optional_string_field(message, "status") {
            metadata.insert("status".to_string(), Value::String(status));
        }

        Ok(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            external_message_id: required_string_field(
                message,
                "id",
                PROVIDER,
                "messages[0].id",
            )?,
            external_thread_id: required_string_field(
                message,
                "from",
                PROVIDER,
                "messages[0].from",
            )?,
            sender_name,
            sender_address: Some(wa_id),
            content,
            message_kind: MessageKind::Message,
            post_id: None,
            media_urls,
            timestamp_unix_ms,
            metadata,
        })
    }

    async fn send(&self, outbound: &OutboundMessage) -> ConnectorResult<SendResult> {
        let config = self.config_snapshot()?;
        let url = format!(
            "{}/{}/messages",
            config.api_base, config.phone_number_id
        );
        let body = json!({
            "messaging_product": "whatsapp",
            "to": outbound.external_thread_id,
            "type": "text",
            "text": { "body": outbound.content },
        });
        match post_json_for_send(
            &self.client,
            &url,
            Some(config.access_token.as_str()),
            &body,
            PROVIDER,
        )
        .await
        {
            Ok(response) => {
                let external_message_id = response
                    .get("messages")
                    .and_then(Value::as_array)
                    .and_then(|messages| messages.first())
                    .and_then(|message| message.get("id"))
                    .and_then(Value::as_str)
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
}

fn collect_media_id(
    message: &serde_json::Map<String, Value>,
    key: &str,
    media_urls: &mut Vec<String>,
) {
    if let Some(id) = message
        .get(key)
        .and_then(|media| media.get("id"))
        .and_then(Value::as_str)
    {
        media_urls.push(id.to_string());
    }
}

fn media_caption(message: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    message
        .get(key)
        .and_then(|media| media.get("caption"))
        .and_then(Value::as_str)
        .map(|caption| caption.trim().to_string())
        .filter(|caption| !caption.is_empty())
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn initialized_connector(api_base: &str) -> WhatsappConnector {
        let connector = WhatsappConnector::new().expect("connector");
        connector
            .init(&json!({
                "phone_number_id": "1050001",
                "access_token": "token-wa",
                "app_secret": "shh",
                "api_base": api_base,
            }))
            .expect("init");
        connector
    }

    #[test]
    fn unit_init_requires_phone_number_id_and_access_token() {
        let connector = WhatsappConnector::new().expect("connector");
        let error = connector
            .init(&json!({ "access_token": "token" }))
            .expect_err("missing phone_number_id");
        assert!(error.message.contains("phone_number_id"));
        let error = connector
            .init(&json!({ "phone_number_id": "1" }))
            .expect_err("missing access_token");
        assert!(error.message.contains("access_token"));
    }

    #[test]
    fn unit_init_is_idempotent_and_replaces_config() {
        let connector = initialized_connector("https://graph.test");
        connector
            .init(&json!({
                "phone_number_id": "222",
                "access_token": "rotated",
            }))
            .expect("re-init");
        let config = connector.config_snapshot().expect("config");
        assert_eq!(config.phone_number_id, "222");
        assert_eq!(config.access_token, "rotated");
        assert_eq!(config.api_base, WHATSAPP_API_BASE);
    }

    #[test]
    fn functional_parse_webhook_handles_graph_text_message() {
        let connector = initialized_connector("https://graph.test");
        let payload = json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "id": "wamid.A1",
                            "from": "15551230000",
                            "timestamp": "1700000000",
                            "type": "text",
                            "text": { "body": "hello there" }
                        }],
                        "contacts": [{
                            "wa_id": "15551230000",
                            "profile": { "name": "Dana" }
                        }]
                    }
                }]
            }]
        });
        let parsed = connector
            .parse_webhook(payload.to_string().as_bytes())
            .expect("parse");
        assert_eq!(parsed.external_message_id, "wamid.A1");
        assert_eq!(parsed.external_thread_id, "15551230000");
        assert_eq!(parsed.sender_name, "Dana");
        assert_eq!(parsed.content, "hello there");
        assert_eq!(parsed.timestamp_unix_ms, 1_700_000_000_000);
        assert_eq!(parsed.message_kind, MessageKind::Message);
    }

    #[test]
    fn functional_parse_webhook_handles_media_and_smoke_formats() {
        let connector = initialized_connector("https://graph.test");
        let media = json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "id": "wamid.B2",
                            "from": "15551230000",
                            "type": "image",
                            "image": { "id": "media-9", "caption": "receipt" }
                        }],
                        "contacts": [{ "wa_id": "15551230000" }]
                    }
                }]
            }]
        });
        let parsed = connector
            .parse_webhook(media.to_string().as_bytes())
            .expect("parse media");
        assert_eq!(parsed.content, "receipt");
        assert_eq!(parsed.media_urls, vec!["media-9".to_string()]);

        let smoke = json!({ "senderPhone": "+1555", "message": "hi" });
        let parsed = connector
            .parse_webhook(smoke.to_string().as_bytes())
            .expect("parse smoke");
        assert_eq!(parsed.external_thread_id, "+1555");
        assert_eq!(parsed.sender_name, "+1555");
        assert_eq!(parsed.content, "hi");
    }

    #[test]
    fn unit_parse_webhook_rejects_missing_message_or_contact() {
        let connector = initialized_connector("https://graph.test");
        let payload = json!({
            "entry": [{ "changes": [{ "value": { "messages": [] } }] }]
        });
        let error = connector
            .parse_webhook(payload.to_string().as_bytes())
            .expect_err("empty messages");
        assert_eq!(error.code, crate::connector_contract::ConnectorErrorCode::MalformedPayload);
    }

    #[test]
    fn unit_parse_webhook_thread_id_is_stable_across_deliveries() {
        let connector = initialized_connector("https://graph.test");
        let payload = json!({ "senderPhone": "+1555", "message": "first" }).to_string();
        let first = connector.parse_webhook(payload.as_bytes()).expect("first");
        let second = connector.parse_webhook(payload.as_bytes()).expect("second");
        assert_eq!(first.external_thread_id, second.external_thread_id);
    }

    #[tokio::test]
    async fn functional_send_posts_message_and_reads_provider_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/1050001/messages")
                    .header("authorization", "Bearer token-wa")
                    .json_body(json!({
                        "messaging_product": "whatsapp",
                        "to": "15551230000",
                        "type": "text",
                        "text": { "body": "hello" },
                    }));
                then.status(200)
                    .json_body(json!({ "messages": [{ "id": "wamid.OUT" }] }));
            })
            .await;

        let connector = initialized_connector(&server.base_url());
        let result = connector
            .send(&OutboundMessage {
                ticket_id: "41".to_string(),
                external_thread_id: "15551230000".to_string(),
                content: "hello".to_string(),
                sender_name: "Agent".to_string(),
                metadata: BTreeMap::new(),
            })
            .await
            .expect("send");
        mock.assert_async().await;
        assert!(result.success);
        assert_eq!(result.external_message_id.as_deref(), Some("wamid.OUT"));
    }

    #[tokio::test]
    async fn functional_send_maps_provider_rejection_to_failed_result() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/1050001/messages");
                then.status(401).body(r#"{"error":"bad token"}"#);
            })
            .await;

        let connector = initialized_connector(&server.base_url());
        let result = connector
            .send(&OutboundMessage {
                ticket_id: "41".to_string(),
                external_thread_id: "15551230000".to_string(),
                content: "hello".to_string(),
                sender_name: "Agent".to_string(),
                metadata: BTreeMap::new(),
            })
            .await
            .expect("send returns a result, not an error");
        assert!(!result.success);
        let detail = result.error.expect("error detail");
        assert!(detail.contains("401"));
        assert!(detail.contains("bad token"));
    }

    #[tokio::test]
    async fn unit_send_without_init_is_a_configuration_error() {
        let connector = WhatsappConnector::new().expect("connector");
        let error = connector
            .send(&OutboundMessage {
                ticket_id: "41".to_string(),
                external_thread_id: "x".to_string(),
                content: "hello".to_string(),
                sender_name: "Agent".to_string(),
                metadata: BTreeMap::new(),
            })
            .await
            .expect_err("uninitialized send");
        assert!(error.is_configuration_error());
    }
}
