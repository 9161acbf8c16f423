//! Email connector.
//!
//! Inbound mail arrives as JSON from the mail gateway (already parsed from
//! MIME), threaded by the gateway's `threadId` or, failing that, the subject
//! line. Outbound replies go out over SMTP through `lettre`; the transport is
//! built, used, and dropped inside a single `send` call so no SMTP session
//! outlives a job.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::Value;

use crate::connector_contract::{
    read_unpoisoned, write_unpoisoned, ChannelConnector, ChannelProvider, ConnectorError,
    ConnectorResult, MessageKind, OutboundMessage, ParsedMessage, SendResult,
    SignatureEnforcement, PARSED_MESSAGE_SCHEMA_VERSION,
};
use crate::connector_payload::{
    as_object, optional_string_field, parse_json_payload, parse_rfc3339_to_unix_ms,
    required_string_field,
};

/// Subject used when a reply has no stored inbound subject to thread under.
pub const FALLBACK_REPLY_SUBJECT: &str = "Re: Support Ticket";

const SMTPS_PORT: u16 = 465;

const PROVIDER: ChannelProvider = ChannelProvider::Email;

#[derive(Debug, Clone, Default, Deserialize)]
struct RawEmailChannelConfig {
    #[serde(default)]
    smtp_host: Option<String>,
    #[serde(default)]
    smtp_port: Option<Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    from_name: Option<String>,
}

#[derive(Debug, Clone)]
struct EmailChannelConfig {
    smtp_host: String,
    smtp_port: u16,
    email: String,
    password: String,
    from_name: Option<String>,
}

/// Public struct `EmailConnector` used across Iris components.
pub struct EmailConnector {
    config: RwLock<Option<EmailChannelConfig>>,
}

impl EmailConnector {
    pub fn new() -> ConnectorResult<Self> {
        Ok(Self {
            config: RwLock::new(None),
        })
    }

    fn config_snapshot(&self) -> ConnectorResult<EmailChannelConfig> {
        read_unpoisoned(&self.config).clone().ok_or_else(|| {
            ConnectorError::missing_config(PROVIDER, "email connector is not initialized")
        })
    }

    fn parse_config(config: &Value) -> ConnectorResult<EmailChannelConfig> {
        let raw: RawEmailChannelConfig =
            serde_json::from_value(config.clone()).map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("email channel config is not an object: {error}"),
                )
            })?;
        let smtp_host = required_config_string(raw.smtp_host, "smtp_host")?;
        let email = required_config_string(raw.email, "email")?;
        let password = raw.password.filter(|value| !value.is_empty()).ok_or_else(|| {
            ConnectorError::missing_config(PROVIDER, "email channel config requires password")
        })?;
        let smtp_port = match raw.smtp_port {
            Some(Value::Number(number)) => number.as_u64().and_then(|port| u16::try_from(port).ok()),
            Some(Value::String(text)) => text.trim().parse::<u16>().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            ConnectorError::missing_config(
                PROVIDER,
                "email channel config requires smtp_port (1-65535)",
            )
        })?;
        Ok(EmailChannelConfig {
            smtp_host,
            smtp_port,
            email,
            password,
            from_name: raw
                .from_name
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        })
    }

    fn build_transport(
        config: &EmailChannelConfig,
    ) -> ConnectorResult<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = if config.smtp_port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
        }
        .map_err(|error| {
            ConnectorError::invalid_config(
                PROVIDER,
                format!("smtp relay for {} is invalid: {error}", config.smtp_host),
            )
        })?;
        Ok(builder
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.email.clone(),
                config.password.clone(),
            ))
            .build())
    }
}

fn required_config_string(value: Option<String>, field: &str) -> ConnectorResult<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ConnectorError::missing_config(
                PROVIDER,
                format!("email channel config requires {field}"),
            )
        })
}

/// Splits an RFC 5322-ish `From` value ("Ada L <ada@example.com>") into a
/// display name and a bare address. Falls back to the whole string when no
/// angle brackets are present.
fn split_from_header(from: &str) -> (String, String) {
    if let (Some(open), Some(close)) = (from.find('<'), from.rfind('>')) {
        if open < close {
            let address = from[open + 1..close].trim().to_string();
            let name = from[..open].trim().trim_matches('"').trim().to_string();
            if name.is_empty() {
                return (address.clone(), address);
            }
            return (name, address);
        }
    }
    let address = from.trim().to_string();
    (address.clone(), address)
}

fn html_body_from_text(text: &str) -> String {
    text.replace('\n', "<br>")
}

#[async_trait]
impl ChannelConnector for EmailConnector {
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
        _headers: &BTreeMap<String, String>,
        _raw_body: &[u8],
        _enforcement: SignatureEnforcement,
    ) -> bool {
        // The mail gateway has no signature scheme; authenticity rests on the
        // deployment keeping the ingress URL private to it.
        true
    }

    fn parse_webhook(&self, raw_body: &[u8]) -> ConnectorResult<ParsedMessage> {
        let payload = parse_json_payload(raw_body, PROVIDER)?;
        let payload = as_object(&payload, PROVIDER, "email gateway payload")?;

        let from = required_string_field(payload, "from", PROVIDER, "from")?;
        let subject = required_string_field(payload, "subject", PROVIDER, "subject")?;
        let text = required_string_field(payload, "text", PROVIDER, "text")?;
        let (sender_name, sender_address) = split_from_header(&from);

        let external_thread_id =
            optional_string_field(payload, "threadId").unwrap_or_else(|| subject.clone());

        let mut metadata = BTreeMap::new();
        metadata.insert("platform".to_string(), Value::String("email".to_string()));
        metadata.insert("subject".to_string(), Value::String(subject));
        if let Some(html) = optional_string_field(payload, "html") {
            metadata.insert("html".to_string(), Value::String(html));
        }
        if let Some(message_id) = optional_string_field(payload, "messageId") {
            metadata.insert("message_id".to_string(), Value::String(message_id));
        }
        if let Some(references) = optional_string_field(payload, "references") {
            metadata.insert("references".to_string(), Value::String(references));
        }

        Ok(ParsedMessage {
            schema_version: PARSED_MESSAGE_SCHEMA_VERSION,
            external_message_id: optional_string_field(payload, "messageId")
                .unwrap_or_else(|| iris_core::mint_unique_id("email")),
            external_thread_id,
            sender_name,
            sender_address: Some(sender_address),
            content: text,
            message_kind: MessageKind::Message,
            post_id: None,
            media_urls: Vec::new(),
            timestamp_unix_ms: optional_string_field(payload, "date")
                .and_then(|date| parse_rfc3339_to_unix_ms(&date))
                .unwrap_or_else(iris_core::current_unix_timestamp_ms),
            metadata,
        })
    }

    async fn send(&self, outbound: &OutboundMessage) -> ConnectorResult<SendResult> {
        let config = self.config_snapshot()?;

        let display_name = if outbound.sender_name.trim().is_empty() {
            config
                .from_name
                .clone()
                .unwrap_or_else(|| config.email.clone())
        } else {
            outbound.sender_name.trim().to_string()
        };
        let from: Mailbox = format!("{display_name} <{}>", config.email)
            .parse()
            .or_else(|_| config.email.parse())
            .map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("configured sender address is invalid: {error}"),
                )
            })?;
        let to: Mailbox = match outbound.external_thread_id.parse() {
            Ok(mailbox) => mailbox,
            Err(error) => {
                return Ok(SendResult::rejected(format!(
                    "email recipient {:?} is not a valid address: {error}",
                    outbound.external_thread_id
                )));
            }
        };

        let subject = outbound
            .metadata
            .get("subject")
            .and_then(Value::as_str)
            .map(|subject| subject.to_string())
            .unwrap_or_else(|| FALLBACK_REPLY_SUBJECT.to_string());

        let mut builder = Message::builder().from(from).to(to).subject(subject);
        if let Some(message_id) = outbound.metadata.get("message_id").and_then(Value::as_str) {
            builder = builder.in_reply_to(message_id.to_string());
            let references = match outbound.metadata.get("references").and_then(Value::as_str) {
                Some(references) => format!("{references} {message_id}"),
                None => message_id.to_string(),
            };
            builder = builder.references(references);
        }
        let email = builder
            .multipart(MultiPart::alternative_plain_html(
                outbound.content.clone(),
                html_body_from_text(&outbound.content),
            ))
            .map_err(|error| {
                ConnectorError::invalid_config(
                    PROVIDER,
                    format!("failed to assemble outbound email: {error}"),
                )
            })?;

        let transport = Self::build_transport(&config)?;
        match transport.send(email).await {
            Ok(_) => Ok(SendResult {
                success: true,
                external_message_id: Some(iris_core::mint_unique_id("email")),
                error: None,
            }),
            Err(error) => Ok(SendResult::rejected(format!(
                "email smtp submission failed: {error}"
            ))),
        }
    }
}
