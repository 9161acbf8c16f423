//! Record types persisted by the helpdesk store.

use anyhow::{bail, Result};
use iris_connectors::ChannelProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TicketStatus` values.
pub enum TicketStatus {
    Open,
    Pending,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Pending => "pending",
            TicketStatus::Closed => "closed",
        }
    }
}

pub fn parse_ticket_status(raw: &str) -> Result<TicketStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "open" => Ok(TicketStatus::Open),
        "pending" => Ok(TicketStatus::Pending),
        "closed" => Ok(TicketStatus::Closed),
        other => bail!("unsupported ticket status {other:?}"),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TicketPriority` values.
pub enum TicketPriority {
    Low,
    Medium,
    High,
}

impl TicketPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketPriority::Low => "low",
            TicketPriority::Medium => "medium",
            TicketPriority::High => "high",
        }
    }
}

pub fn parse_ticket_priority(raw: &str) -> Result<TicketPriority> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" => Ok(TicketPriority::Low),
        "medium" => Ok(TicketPriority::Medium),
        "high" => Ok(TicketPriority::High),
        other => bail!("unsupported ticket priority {other:?}"),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageDirection` values.
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }
}

pub fn parse_message_direction(raw: &str) -> Result<MessageDirection> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "inbound" => Ok(MessageDirection::Inbound),
        "outbound" => Ok(MessageDirection::Outbound),
        other => bail!("unsupported message direction {other:?}"),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `CampaignStatus` values.
pub enum CampaignStatus {
    Draft,
    Sending,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Completed => "completed",
        }
    }
}

pub fn parse_campaign_status(raw: &str) -> Result<CampaignStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "draft" => Ok(CampaignStatus::Draft),
        "sending" => Ok(CampaignStatus::Sending),
        "completed" => Ok(CampaignStatus::Completed),
        other => bail!("unsupported campaign status {other:?}"),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `RecipientStatus` values.
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }
}

pub fn parse_recipient_status(raw: &str) -> Result<RecipientStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pending" => Ok(RecipientStatus::Pending),
        "sent" => Ok(RecipientStatus::Sent),
        "failed" => Ok(RecipientStatus::Failed),
        other => bail!("unsupported recipient status {other:?}"),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `NotificationKind` values.
pub enum NotificationKind {
    NewMessage,
    NewComment,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::NewMessage => "new_message",
            NotificationKind::NewComment => "new_comment",
        }
    }
}

pub fn parse_notification_kind(raw: &str) -> Result<NotificationKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "new_message" => Ok(NotificationKind::NewMessage),
        "new_comment" => Ok(NotificationKind::NewComment),
        other => bail!("unsupported notification kind {other:?}"),
    }
}

/// Public struct `ChannelRecord` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRecord {
    pub id: i64,
    pub org_id: String,
    pub provider: ChannelProvider,
    pub display_name: String,
    pub config: Value,
    pub active: bool,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

/// Public struct `CustomerRecord` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerRecord {
    pub id: i64,
    pub org_id: String,
    pub platform: ChannelProvider,
    pub external_id: String,
    pub display_name: String,
    pub last_message: Option<String>,
    pub last_message_at_unix_ms: Option<i64>,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

/// Public struct `TicketRecord` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketRecord {
    pub id: i64,
    pub org_id: String,
    pub channel_id: i64,
    pub customer_id: i64,
    pub external_thread_id: String,
    pub subject: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

/// Public struct `MessageRecord` used across Iris components.
///
/// Immutable once written except for the outbound delivery stamps
/// (`external_message_id`, `sent_at_unix_ms`, `failed_at_unix_ms`,
/// `delivery_error`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub ticket_id: i64,
    pub direction: MessageDirection,
    pub content: String,
    pub sender_name: String,
    pub external_message_id: Option<String>,
    pub delivery_error: Option<String>,
    pub sent_at_unix_ms: Option<i64>,
    pub failed_at_unix_ms: Option<i64>,
    pub metadata: Value,
    pub created_at_unix_ms: i64,
}

/// Public struct `CampaignRecord` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignRecord {
    pub id: i64,
    pub org_id: String,
    pub channel_id: i64,
    pub name: String,
    pub message_template: String,
    pub status: CampaignStatus,
    pub created_at_unix_ms: i64,
    pub updated_at_unix_ms: i64,
}

/// Public struct `CampaignRecipientRecord` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignRecipientRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub contact: String,
    pub status: RecipientStatus,
    pub error: Option<String>,
    pub sent_at_unix_ms: Option<i64>,
    pub created_at_unix_ms: i64,
}

/// Public struct `NotificationRecord` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub id: i64,
    pub org_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub ticket_id: Option<i64>,
    pub customer_id: Option<i64>,
    pub platform: Option<ChannelProvider>,
    pub created_at_unix_ms: i64,
}

/// Per-status recipient counts for one campaign.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_status_parsers_round_trip_and_reject_unknown() {
        assert_eq!(
            parse_ticket_status(TicketStatus::Pending.as_str()).expect("round trip"),
            TicketStatus::Pending
        );
        assert_eq!(
            parse_campaign_status(" SENDING ").expect("case-insensitive"),
            CampaignStatus::Sending
        );
        assert!(parse_ticket_status("archived").is_err());
        assert!(parse_recipient_status("skipped").is_err());
        assert!(parse_notification_kind("digest").is_err());
    }

    #[test]
    fn unit_notification_kind_serde_names_are_snake_case() {
        let rendered = serde_json::to_string(&NotificationKind::NewComment).expect("serialize");
        assert_eq!(rendered, "\"new_comment\"");
    }
}
