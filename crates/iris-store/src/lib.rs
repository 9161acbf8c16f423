//! SQLite persistence for the Iris helpdesk.
//!
//! Holds the durable record of channels, customers, tickets, messages,
//! campaigns, and notifications. Uniqueness constraints carry the
//! idempotency guarantees the at-least-once pipeline leans on: replayed
//! webhooks and retried jobs resolve to existing rows instead of minting
//! duplicates.

pub mod store_records;
pub mod store_sqlite;

pub use store_records::{
    parse_campaign_status, parse_message_direction, parse_notification_kind,
    parse_recipient_status, parse_ticket_priority, parse_ticket_status, CampaignRecord,
    CampaignRecipientRecord, CampaignStats, CampaignStatus, ChannelRecord, CustomerRecord,
    MessageDirection, MessageRecord, NotificationKind, NotificationRecord, RecipientStatus,
    TicketPriority, TicketRecord, TicketStatus,
};
pub use store_sqlite::{HelpdeskStore, StoreLookupError};
