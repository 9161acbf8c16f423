//! Mock connector for local smoke testing.
//!
//! Accepts the simplified `{senderPhone, message}` payload, never talks to a
//! network, and records every outbound send in an in-process log so tests can
//! assert on delivery order and content. A `fail_contacts` config list makes
//! sends to chosen contacts fail, which is how partial campaign failures are
//! exercised end to end.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::connector_contract::{
    lock_unpoisoned, read_unpoisoned, write_unpoisoned, ChannelConnector, ChannelProvider,
    ConnectorError, ConnectorResult, MessageKind, OutboundMessage, ParsedMessage, SendResult,
    SignatureEnforcement, PARSED_MESSAGE_SCHEMA_VERSION,
};
use crate::connector_payload::{as_object, optional_string_field, parse_json_payload};

/// Thread prefix for conversations created through the mock provider.
pub const MOCK_THREAD_PREFIX: &str = "mock-thread-";

const PROVIDER: ChannelProvider = ChannelProvider::Mock;

#[derive(Debug, Clone, Default, Deserialize)]
struct MockChannelConfig {
    #[serde(default)]
    fail_contacts: Vec<String>,
}

/// One delivery recorded by [`MockConnector::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSentMessage {
    pub to: String,
    pub content: String,
    pub sender_name: String,
}

/// Public struct `MockConnector` used across Iris components.
pub struct MockConnector {
    config: RwLock<MockChannelConfig>,
    sent: Mutex<Vec<MockSentMessage>>,
}

impl MockConnector {
    pub fn new() -> ConnectorResult<Self> {
        Ok(Self {
            config: RwLock::new(MockChannelConfig::default()),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of everything sent through this connector, oldest first.
    pub fn sent_messages(&self) -> Vec<MockSentMessage> {
        lock_unpoisoned(&self.sent).clone()
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    fn provider(&self) -> ChannelProvider {
        PROVIDER
    }

    fn init(&self, config: &Value) -> ConnectorResult<()> {
        let parsed = if config.is_null() {
            MockChannelConfig::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("mock channel config is not an object: {error}"),
                )
            })?
        };
        *write_unpoisoned(&self.config) = parsed;
        Ok(())
    }

    fn verify_signature(
        &self,
        _headers: &BTreeMap<String, String>,
        _raw_body: &[u8],
        _enforcement: SignatureEnforcement,
    ) -> bool {
        true
    }

    fn parse_webhook(&self, raw_body: &[u8]) -> ConnectorResult<ParsedMessage> {
        let payload = parse_json_payload(raw_body, PROVIDER)?;
        let payload = as_object(&payload, PROVIDER, "mock webhook payload")?;
        let sender_phone = optional_string_field(payload, "senderPhone").ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "senderPhone is required")
        })?;
        let content = optional_string_field(payload, "message").ok_or_else(|| {
            ConnectorError::malformed_payload(PROVIDER, "message is required")
        })?;

        let mut metadata = BTreeMap::new();
        metadata.insert("platform".to_string(), Value::String("mock".to_string()));

        Ok(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            external_message_id: optional_string_field(payload, "messageId")
                .unwrap_or_else(|| iris_core::mint_unique_id("mock")),
            external_thread_id: format!("{MOCK_THREAD_PREFIX}{sender_phone}"),
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

    async fn send(&self, outbound: &OutboundMessage) -> ConnectorResult<SendResult> {
        let contact = outbound
            .external_thread_id
            .strip_prefix(MOCK_THREAD_PREFIX)
            .unwrap_or(&outbound.external_thread_id)
            .to_string();
        let should_fail = read_unpoisoned(&self.config)
            .fail_contacts
            .iter()
            .any(|failing| failing == &contact);
        if should_fail {
            return Ok(SendResult::rejected(format!(
                "mock connector is configured to fail sends to {contact}"
            )));
        }
        lock_unpoisoned(&self.sent).push(MockSentMessage {
            to: contact,
            content: outbound.content.clone(),
            sender_name: outbound.sender_name.clone(),
        });
        Ok(SendResult {
            success: true,
            external_message_id: Some(iris_core::mint_unique_id("mock-msg")),
            error: None,
        })
    }
}
