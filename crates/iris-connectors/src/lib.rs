//! Channel connectors for the Iris helpdesk.
//!
//! Every supported messaging provider implements the [`ChannelConnector`]
//! contract: validate channel credentials, authenticate webhook deliveries,
//! normalize provider payloads into the canonical [`ParsedMessage`], and
//! deliver agent replies back out. The [`ConnectorRegistry`] hands out one
//! lazily-built singleton per provider.
//!
//! The provider set is closed: adding a provider means adding a
//! `ChannelProvider` variant, a `connector_<name>` module, and a registry
//! arm, so dispatch stays exhaustive and cannot be misspelled at runtime.

pub mod connector_contract;
pub mod connector_email;
pub mod connector_facebook;
pub mod connector_http;
pub mod connector_instagram;
pub mod connector_mock;
pub mod connector_payload;
pub mod connector_registry;
pub mod connector_signature;
pub mod connector_telegram;
pub mod connector_whatsapp;

pub use connector_contract::{
    parse_channel_provider, parse_signature_enforcement, resolve_signature_enforcement_from_env,
    validate_parsed_message,
    ChannelConnector, ChannelProvider, ConnectorError, ConnectorErrorCode, ConnectorResult,
    MessageKind, OutboundMessage, ParsedMessage, SendResult, SignatureEnforcement,
    PARSED_MESSAGE_SCHEMA_VERSION, WEBHOOK_SIGNATURE_POLICY_ENV,
};
pub use connector_email::EmailConnector;
pub use connector_facebook::{FacebookConnector, FEED_THREAD_PREFIX};
pub use connector_instagram::InstagramConnector;
pub use connector_mock::{MockConnector, MockSentMessage, MOCK_THREAD_PREFIX};
pub use connector_registry::ConnectorRegistry;
pub use connector_signature::{
    compute_sha256_hmac_signature_header, verify_sha256_hmac_signature, SIGNATURE_HEADER,
};
pub use connector_telegram::{TelegramConnector, TELEGRAM_SECRET_HEADER};
pub use connector_whatsapp::WhatsappConnector;
