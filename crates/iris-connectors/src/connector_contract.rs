//! Canonical message model and the connector capability contract.
//!
//! Every provider adapter translates its wire format into [`ParsedMessage`]
//! and accepts [`OutboundMessage`] for delivery, so ingress and the pipeline
//! workers never see provider-specific shapes.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSED_MESSAGE_SCHEMA_VERSION: u32 = 1;

/// Environment variable selecting the webhook signature policy.
pub const WEBHOOK_SIGNATURE_POLICY_ENV: &str = "IRIS_WEBHOOK_SIGNATURE_POLICY";

fn parsed_message_schema_version() -> u32 {
    PARSED_MESSAGE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ChannelProvider` values.
pub enum ChannelProvider {
    Whatsapp,
    Instagram,
    Facebook,
    Telegram,
    Email,
    Mock,
}

impl ChannelProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
            Self::Telegram => "telegram",
            Self::Email => "email",
            Self::Mock => "mock",
        }
    }

    pub const ALL: [ChannelProvider; 6] = [
        Self::Whatsapp,
        Self::Instagram,
        Self::Facebook,
        Self::Telegram,
        Self::Email,
        Self::Mock,
    ];
}

impl std::fmt::Display for ChannelProvider {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Parses a provider identifier; unknown providers fail here, at the admin
/// boundary, never at dispatch time.
pub fn parse_channel_provider(value: &str) -> Result<ChannelProvider> {
    match value.trim().to_ascii_lowercase().as_str() {
        "whatsapp" => Ok(ChannelProvider::Whatsapp),
        "instagram" => Ok(ChannelProvider::Instagram),
        "facebook" => Ok(ChannelProvider::Facebook),
        "telegram" => Ok(ChannelProvider::Telegram),
        "email" => Ok(ChannelProvider::Email),
        "mock" => Ok(ChannelProvider::Mock),
        other => bail!("unknown channel provider '{other}'"),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageKind` values.
pub enum MessageKind {
    #[default]
    Message,
    Comment,
    Mention,
    StoryReply,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Comment => "comment",
            Self::Mention => "mention",
            Self::StoryReply => "story_reply",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `ParsedMessage` used across Iris components.
///
/// The canonical inbound unit: produced exclusively by a connector from raw
/// webhook bytes, consumed exclusively by the inbound worker.
pub struct ParsedMessage {
    #[serde(default = "parsed_message_schema_version")]
    pub schema_version: u32,
    pub external_message_id: String,
    pub external_thread_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_address: Option<String>,
    pub content: String,
    #[serde(default)]
    pub message_kind: MessageKind,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub timestamp_unix_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `OutboundMessage` used across Iris components.
pub struct OutboundMessage {
    pub ticket_id: String,
    pub external_thread_id: String,
    pub content: String,
    pub sender_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `SendResult` used across Iris components.
///
/// Terminal outcome of one provider send attempt; never mutated after
/// creation.
pub struct SendResult {
    pub success: bool,
    #[serde(default)]
    pub external_message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SendResult {
    pub fn delivered(external_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            external_message_id: Some(external_message_id.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_message_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ConnectorErrorCode` values.
pub enum ConnectorErrorCode {
    MissingConfig,
    InvalidConfig,
    MalformedPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `ConnectorError` used across Iris components.
pub struct ConnectorError {
    pub code: ConnectorErrorCode,
    pub provider: ChannelProvider,
    pub message: String,
}

impl ConnectorError {
    pub fn missing_config(provider: ChannelProvider, message: impl Into<String>) -> Self {
        Self {
            code: ConnectorErrorCode::MissingConfig,
            provider,
            message: message.into(),
        }
    }

    pub fn invalid_config(provider: ChannelProvider, message: impl Into<String>) -> Self {
        Self {
            code: ConnectorErrorCode::InvalidConfig,
            provider,
            message: message.into(),
        }
    }

    pub fn malformed_payload(provider: ChannelProvider, message: impl Into<String>) -> Self {
        Self {
            code: ConnectorErrorCode::MalformedPayload,
            provider,
            message: message.into(),
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self.code,
            ConnectorErrorCode::MissingConfig | ConnectorErrorCode::InvalidConfig
        )
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "connector error: provider={} code={:?} message={}",
            self.provider.as_str(),
            self.code,
            self.message
        )
    }
}

impl std::error::Error for ConnectorError {}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SignatureEnforcement` values.
///
/// Strict rejects webhooks whose authenticity cannot be established;
/// Permissive accepts them with a logged warning. The permissive mode exists
/// for local development and must be selected explicitly.
pub enum SignatureEnforcement {
    Strict,
    Permissive,
}

impl SignatureEnforcement {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Permissive => "permissive",
        }
    }
}

pub fn parse_signature_enforcement(value: &str) -> Result<SignatureEnforcement> {
    match value.trim().to_ascii_lowercase().as_str() {
        "strict" => Ok(SignatureEnforcement::Strict),
        "permissive" => Ok(SignatureEnforcement::Permissive),
        other => bail!("unsupported signature policy '{other}' (expected strict|permissive)"),
    }
}

/// Resolves the signature policy from `IRIS_WEBHOOK_SIGNATURE_POLICY`.
///
/// Absent or unrecognized values resolve to Strict; the permissive mode is
/// never a silent default.
pub fn resolve_signature_enforcement_from_env() -> SignatureEnforcement {
    match std::env::var(WEBHOOK_SIGNATURE_POLICY_ENV) {
        Ok(raw) => match parse_signature_enforcement(&raw) {
            Ok(policy) => policy,
            Err(_) => {
                tracing::warn!(
                    value = raw.trim(),
                    "unrecognized {WEBHOOK_SIGNATURE_POLICY_ENV} value; falling back to strict"
                );
                SignatureEnforcement::Strict
            }
        },
        Err(_) => SignatureEnforcement::Strict,
    }
}

#[async_trait]
/// Trait contract for `ChannelConnector` behavior.
///
/// One implementation per provider. `init` validates and caches channel
/// credentials, `verify_signature` and `parse_webhook` run at the ingress
/// boundary, and `send` performs the provider API call. Implementations
/// snapshot cached config out of their interior lock before any network
/// call so no guard is held across a suspension point.
pub trait ChannelConnector: Send + Sync {
    fn provider(&self) -> ChannelProvider;

    /// Validates `config` and replaces any previously cached credentials.
    /// Idempotent; fails fast when mandatory fields are absent.
    fn init(&self, config: &Value) -> ConnectorResult<()>;

    /// Provider-specific authenticity check over the raw request body.
    /// Header keys are expected lowercased.
    fn verify_signature(
        &self,
        headers: &BTreeMap<String, String>,
        raw_body: &[u8],
        enforcement: SignatureEnforcement,
    ) -> bool;

    /// Normalizes raw webhook bytes; rejects the provider's own malformed
    /// payloads with a `MalformedPayload` error.
    fn parse_webhook(&self, raw_body: &[u8]) -> ConnectorResult<ParsedMessage>;

    /// Performs the provider API call. Ordinary provider-side failures come
    /// back as `SendResult { success: false, .. }`; only missing credentials
    /// error before a network call is attempted.
    async fn send(&self, outbound: &OutboundMessage) -> ConnectorResult<SendResult>;

    /// Registers `callback_url` with the provider so webhooks start flowing.
    /// Most providers take this from their dashboard; Telegram exposes it as
    /// an API call, so only that connector overrides the default no-op.
    async fn register_webhook(&self, callback_url: &str) -> ConnectorResult<()> {
        let _ = callback_url;
        Ok(())
    }
}

pub(crate) fn read_unpoisoned<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_unpoisoned<T>(
    lock: &std::sync::RwLock<T>,
) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Validates the invariants every connector-produced message must satisfy.
pub fn validate_parsed_message(message: &ParsedMessage) -> Result<()> {
    if message.external_message_id.trim().is_empty() {
        bail!("parsed message requires a non-empty external_message_id");
    }
    if message.external_thread_id.trim().is_empty() {
        bail!("parsed message requires a non-empty external_thread_id");
    }
    if message.sender_name.trim().is_empty() {
        bail!("parsed message requires a non-empty sender_name");
    }
    if message.message_kind == MessageKind::Comment && message.post_id.is_none() {
        bail!("comment messages must carry the originating post_id");
    }
    Ok(())
}
