//! SQLite-backed helpdesk store.
//!
//! One store instance per process, one short-lived connection per operation.
//! Concurrent workers coordinate exclusively through the database: uniqueness
//! constraints on channels/customers/tickets/recipients resolve creation
//! races, and `busy_timeout` absorbs writer contention under WAL.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use iris_connectors::{parse_channel_provider, ChannelProvider};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::store_records::{
    parse_campaign_status, parse_message_direction, parse_notification_kind,
    parse_recipient_status, parse_ticket_priority, parse_ticket_status, CampaignRecord,
    CampaignRecipientRecord, CampaignStats, CampaignStatus, ChannelRecord, CustomerRecord,
    MessageDirection, MessageRecord, NotificationKind, NotificationRecord, RecipientStatus,
    TicketPriority, TicketRecord, TicketStatus,
};

/// Lookup failure split into the two cases workers treat differently:
/// a row that never existed (permanent, park the job) versus an operational
/// failure reading it (transient, retry).
#[derive(Debug)]
pub enum StoreLookupError {
    Missing { entity: &'static str, key: String },
    Transient(anyhow::Error),
}

impl StoreLookupError {
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreLookupError::Missing { .. })
    }
}

impl fmt::Display for StoreLookupError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLookupError::Missing { entity, key } => {
                write!(formatter, "{entity} {key} does not exist")
            }
            StoreLookupError::Transient(error) => {
                write!(formatter, "store lookup failed: {error}")
            }
        }
    }
}

impl std::error::Error for StoreLookupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreLookupError::Missing { .. } => None,
            StoreLookupError::Transient(error) => Some(error.as_ref()),
        }
    }
}

/// Public struct `HelpdeskStore` used across Iris components.
pub struct HelpdeskStore {
    db_path: PathBuf,
}

impl HelpdeskStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }
        let connection = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open helpdesk store {}", self.db_path.display()))?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        initialize_helpdesk_schema(&connection)?;
        Ok(connection)
    }

    // ---- channels -------------------------------------------------------

    pub fn create_channel(
        &self,
        org_id: &str,
        provider: ChannelProvider,
        display_name: &str,
        config: &Value,
    ) -> Result<ChannelRecord> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        let config_text = serde_json::to_string(config)?;
        let inserted = connection.execute(
            "INSERT INTO channels (org_id, provider, display_name, config, active, \
             created_at_unix_ms, updated_at_unix_ms) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![org_id, provider.as_str(), display_name, config_text, now],
        );
        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                bail!("a {provider} channel already exists for organisation {org_id}")
            }
            Err(error) => {
                return Err(error).context("failed to insert channel");
            }
        }
        Ok(ChannelRecord {
            id: connection.last_insert_rowid(),
            org_id: org_id.to_string(),
            provider,
            display_name: display_name.to_string(),
            config: config.clone(),
            active: true,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        })
    }

    pub fn get_channel(&self, channel_id: i64) -> Result<ChannelRecord, StoreLookupError> {
        let connection = self.open_connection().map_err(StoreLookupError::Transient)?;
        let record = connection
            .query_row(
                "SELECT id, org_id, provider, display_name, config, active, \
                 created_at_unix_ms, updated_at_unix_ms FROM channels WHERE id = ?1",
                params![channel_id],
                channel_from_row,
            )
            .optional()
            .map_err(|error| StoreLookupError::Transient(error.into()))?;
        record.ok_or_else(|| StoreLookupError::Missing {
            entity: "channel",
            key: channel_id.to_string(),
        })
    }

    pub fn list_channels(&self, org_id: &str) -> Result<Vec<ChannelRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT id, org_id, provider, display_name, config, active, \
             created_at_unix_ms, updated_at_unix_ms FROM channels \
             WHERE org_id = ?1 ORDER BY id",
        )?;
        let rows = statement.query_map(params![org_id], channel_from_row)?;
        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    pub fn update_channel(
        &self,
        channel_id: i64,
        display_name: Option<&str>,
        active: Option<bool>,
    ) -> Result<ChannelRecord> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE channels SET display_name = COALESCE(?2, display_name), \
             active = COALESCE(?3, active), updated_at_unix_ms = ?4 WHERE id = ?1",
            params![
                channel_id,
                display_name,
                active.map(|flag| if flag { 1_i64 } else { 0 }),
                now_unix_ms()
            ],
        )?;
        if changed == 0 {
            bail!("channel {channel_id} does not exist");
        }
        drop(connection);
        self.get_channel(channel_id)
            .context("failed to re-read updated channel")
    }

    pub fn delete_channel(&self, channel_id: i64) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute("DELETE FROM channels WHERE id = ?1", params![channel_id])?;
        if changed == 0 {
            bail!("channel {channel_id} does not exist");
        }
        Ok(())
    }

    // ---- customers ------------------------------------------------------

    /// Insert-or-touch keyed by (org, platform, external id). Loses no race:
    /// concurrent first contacts collapse onto one row via the uniqueness
    /// constraint and the conflict arm updates the activity fields.
    pub fn find_or_create_customer(
        &self,
        org_id: &str,
        platform: ChannelProvider,
        external_id: &str,
        display_name: &str,
        last_message: &str,
        last_message_at_unix_ms: i64,
    ) -> Result<CustomerRecord> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        connection
            .execute(
                "INSERT INTO customers (org_id, platform, external_id, display_name, \
                 last_message, last_message_at_unix_ms, created_at_unix_ms, updated_at_unix_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
                 ON CONFLICT(org_id, platform, external_id) DO UPDATE SET \
                 last_message = excluded.last_message, \
                 last_message_at_unix_ms = excluded.last_message_at_unix_ms, \
                 updated_at_unix_ms = excluded.updated_at_unix_ms",
                params![
                    org_id,
                    platform.as_str(),
                    external_id,
                    display_name,
                    last_message,
                    last_message_at_unix_ms,
                    now
                ],
            )
            .context("failed to upsert customer")?;
        let record = connection
            .query_row(
                "SELECT id, org_id, platform, external_id, display_name, last_message, \
                 last_message_at_unix_ms, created_at_unix_ms, updated_at_unix_ms \
                 FROM customers WHERE org_id = ?1 AND platform = ?2 AND external_id = ?3",
                params![org_id, platform.as_str(), external_id],
                customer_from_row,
            )
            .context("failed to read back upserted customer")?;
        Ok(record)
    }

    pub fn touch_customer_last_message(
        &self,
        customer_id: i64,
        last_message: &str,
        last_message_at_unix_ms: i64,
    ) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE customers SET last_message = ?2, last_message_at_unix_ms = ?3, \
             updated_at_unix_ms = ?3 WHERE id = ?1",
            params![customer_id, last_message, last_message_at_unix_ms],
        )?;
        if changed == 0 {
            bail!("customer {customer_id} does not exist");
        }
        Ok(())
    }

    pub fn list_customers(&self, org_id: &str) -> Result<Vec<CustomerRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT id, org_id, platform, external_id, display_name, last_message, \
             last_message_at_unix_ms, created_at_unix_ms, updated_at_unix_ms \
             FROM customers WHERE org_id = ?1 \
             ORDER BY (last_message_at_unix_ms IS NULL), last_message_at_unix_ms DESC, id DESC",
        )?;
        let rows = statement.query_map(params![org_id], customer_from_row)?;
        let mut customers = Vec::new();
        for row in rows {
            customers.push(row?);
        }
        Ok(customers)
    }

    // ---- tickets --------------------------------------------------------

    /// Insert-if-absent keyed by (org, channel, external thread id). Returns
    /// the surviving row and whether this call created it. New tickets start
    /// OPEN with MEDIUM priority.
    pub fn find_or_create_ticket(
        &self,
        org_id: &str,
        channel_id: i64,
        customer_id: i64,
        external_thread_id: &str,
        subject: &str,
    ) -> Result<(TicketRecord, bool)> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        let inserted = connection
            .execute(
                "INSERT INTO tickets (org_id, channel_id, customer_id, external_thread_id, \
                 subject, status, priority, created_at_unix_ms, updated_at_unix_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                 ON CONFLICT(org_id, channel_id, external_thread_id) DO NOTHING",
                params![
                    org_id,
                    channel_id,
                    customer_id,
                    external_thread_id,
                    subject,
                    TicketStatus::Open.as_str(),
                    TicketPriority::Medium.as_str(),
                    now
                ],
            )
            .context("failed to insert ticket")?;
        let record = connection
            .query_row(
                "SELECT id, org_id, channel_id, customer_id, external_thread_id, subject, \
                 status, priority, created_at_unix_ms, updated_at_unix_ms \
                 FROM tickets WHERE org_id = ?1 AND channel_id = ?2 AND external_thread_id = ?3",
                params![org_id, channel_id, external_thread_id],
                ticket_from_row,
            )
            .context("failed to read back ticket")?;
        Ok((record, inserted > 0))
    }

    pub fn get_ticket(&self, ticket_id: i64) -> Result<TicketRecord, StoreLookupError> {
        let connection = self.open_connection().map_err(StoreLookupError::Transient)?;
        let record = connection
            .query_row(
                "SELECT id, org_id, channel_id, customer_id, external_thread_id, subject, \
                 status, priority, created_at_unix_ms, updated_at_unix_ms \
                 FROM tickets WHERE id = ?1",
                params![ticket_id],
                ticket_from_row,
            )
            .optional()
            .map_err(|error| StoreLookupError::Transient(error.into()))?;
        record.ok_or_else(|| StoreLookupError::Missing {
            entity: "ticket",
            key: ticket_id.to_string(),
        })
    }

    pub fn set_ticket_status(&self, ticket_id: i64, status: TicketStatus) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE tickets SET status = ?2, updated_at_unix_ms = ?3 WHERE id = ?1",
            params![ticket_id, status.as_str(), now_unix_ms()],
        )?;
        if changed == 0 {
            bail!("ticket {ticket_id} does not exist");
        }
        Ok(())
    }

    // ---- messages -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn append_message(
        &self,
        ticket_id: i64,
        direction: MessageDirection,
        content: &str,
        sender_name: &str,
        external_message_id: Option<&str>,
        metadata: &Value,
        created_at_unix_ms: i64,
    ) -> Result<MessageRecord> {
        let connection = self.open_connection()?;
        let metadata_text = serde_json::to_string(metadata)?;
        connection
            .execute(
                "INSERT INTO messages (ticket_id, direction, content, sender_name, \
                 external_message_id, metadata, created_at_unix_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ticket_id,
                    direction.as_str(),
                    content,
                    sender_name,
                    external_message_id,
                    metadata_text,
                    created_at_unix_ms
                ],
            )
            .context("failed to append message")?;
        Ok(MessageRecord {
            id: connection.last_insert_rowid(),
            ticket_id,
            direction,
            content: content.to_string(),
            sender_name: sender_name.to_string(),
            external_message_id: external_message_id.map(|id| id.to_string()),
            delivery_error: None,
            sent_at_unix_ms: None,
            failed_at_unix_ms: None,
            metadata: metadata.clone(),
            created_at_unix_ms,
        })
    }

    pub fn get_message(&self, message_id: i64) -> Result<MessageRecord, StoreLookupError> {
        let connection = self.open_connection().map_err(StoreLookupError::Transient)?;
        let record = connection
            .query_row(
                "SELECT id, ticket_id, direction, content, sender_name, external_message_id, \
                 delivery_error, sent_at_unix_ms, failed_at_unix_ms, metadata, created_at_unix_ms \
                 FROM messages WHERE id = ?1",
                params![message_id],
                message_from_row,
            )
            .optional()
            .map_err(|error| StoreLookupError::Transient(error.into()))?;
        record.ok_or_else(|| StoreLookupError::Missing {
            entity: "message",
            key: message_id.to_string(),
        })
    }

    pub fn list_messages(&self, ticket_id: i64) -> Result<Vec<MessageRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT id, ticket_id, direction, content, sender_name, external_message_id, \
             delivery_error, sent_at_unix_ms, failed_at_unix_ms, metadata, created_at_unix_ms \
             FROM messages WHERE ticket_id = ?1 ORDER BY created_at_unix_ms, id",
        )?;
        let rows = statement.query_map(params![ticket_id], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn mark_message_sent(
        &self,
        message_id: i64,
        external_message_id: Option<&str>,
        sent_at_unix_ms: i64,
    ) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE messages SET external_message_id = COALESCE(?2, external_message_id), \
             sent_at_unix_ms = ?3, delivery_error = NULL WHERE id = ?1",
            params![message_id, external_message_id, sent_at_unix_ms],
        )?;
        if changed == 0 {
            bail!("message {message_id} does not exist");
        }
        Ok(())
    }

    pub fn mark_message_failed(
        &self,
        message_id: i64,
        delivery_error: &str,
        failed_at_unix_ms: i64,
    ) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE messages SET delivery_error = ?2, failed_at_unix_ms = ?3 WHERE id = ?1",
            params![message_id, delivery_error, failed_at_unix_ms],
        )?;
        if changed == 0 {
            bail!("message {message_id} does not exist");
        }
        Ok(())
    }

    // ---- campaigns ------------------------------------------------------

    pub fn create_campaign(
        &self,
        org_id: &str,
        channel_id: i64,
        name: &str,
        message_template: &str,
    ) -> Result<CampaignRecord> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        connection
            .execute(
                "INSERT INTO campaigns (org_id, channel_id, name, message_template, status, \
                 created_at_unix_ms, updated_at_unix_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    org_id,
                    channel_id,
                    name,
                    message_template,
                    CampaignStatus::Draft.as_str(),
                    now
                ],
            )
            .context("failed to insert campaign")?;
        Ok(CampaignRecord {
            id: connection.last_insert_rowid(),
            org_id: org_id.to_string(),
            channel_id,
            name: name.to_string(),
            message_template: message_template.to_string(),
            status: CampaignStatus::Draft,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        })
    }

    pub fn get_campaign(&self, campaign_id: i64) -> Result<CampaignRecord, StoreLookupError> {
        let connection = self.open_connection().map_err(StoreLookupError::Transient)?;
        let record = connection
            .query_row(
                "SELECT id, org_id, channel_id, name, message_template, status, \
                 created_at_unix_ms, updated_at_unix_ms FROM campaigns WHERE id = ?1",
                params![campaign_id],
                campaign_from_row,
            )
            .optional()
            .map_err(|error| StoreLookupError::Transient(error.into()))?;
        record.ok_or_else(|| StoreLookupError::Missing {
            entity: "campaign",
            key: campaign_id.to_string(),
        })
    }

    pub fn set_campaign_status(&self, campaign_id: i64, status: CampaignStatus) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE campaigns SET status = ?2, updated_at_unix_ms = ?3 WHERE id = ?1",
            params![campaign_id, status.as_str(), now_unix_ms()],
        )?;
        if changed == 0 {
            bail!("campaign {campaign_id} does not exist");
        }
        Ok(())
    }

    /// Adds recipients with status PENDING, skipping duplicates through the
    /// (campaign, contact) uniqueness constraint. Returns how many were new.
    pub fn add_campaign_recipients(&self, campaign_id: i64, contacts: &[String]) -> Result<u64> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        let mut added = 0_u64;
        for contact in contacts {
            let contact = contact.trim();
            if contact.is_empty() {
                continue;
            }
            let inserted = connection
                .execute(
                    "INSERT INTO campaign_recipients (campaign_id, contact, status, \
                     created_at_unix_ms) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(campaign_id, contact) DO NOTHING",
                    params![campaign_id, contact, RecipientStatus::Pending.as_str(), now],
                )
                .context("failed to insert campaign recipient")?;
            added += inserted as u64;
        }
        Ok(added)
    }

    pub fn pending_recipients(
        &self,
        campaign_id: i64,
        limit: u32,
    ) -> Result<Vec<CampaignRecipientRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT id, campaign_id, contact, status, error, sent_at_unix_ms, \
             created_at_unix_ms FROM campaign_recipients \
             WHERE campaign_id = ?1 AND status = ?2 ORDER BY id LIMIT ?3",
        )?;
        let rows = statement.query_map(
            params![campaign_id, RecipientStatus::Pending.as_str(), limit],
            recipient_from_row,
        )?;
        let mut recipients = Vec::new();
        for row in rows {
            recipients.push(row?);
        }
        Ok(recipients)
    }

    /// Status guard keeps recipient transitions monotonic: only a PENDING
    /// row can move to SENT, so re-processing a finished recipient is a no-op.
    pub fn mark_recipient_sent(&self, recipient_id: i64, sent_at_unix_ms: i64) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE campaign_recipients SET status = ?2, sent_at_unix_ms = ?3, error = NULL \
             WHERE id = ?1 AND status = ?4",
            params![
                recipient_id,
                RecipientStatus::Sent.as_str(),
                sent_at_unix_ms,
                RecipientStatus::Pending.as_str()
            ],
        )?;
        if changed == 0 {
            tracing::warn!(
                recipient_id,
                "skipping sent stamp for recipient that is no longer pending"
            );
        }
        Ok(())
    }

    pub fn mark_recipient_failed(&self, recipient_id: i64, error: &str) -> Result<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE campaign_recipients SET status = ?2, error = ?3 \
             WHERE id = ?1 AND status = ?4",
            params![
                recipient_id,
                RecipientStatus::Failed.as_str(),
                error,
                RecipientStatus::Pending.as_str()
            ],
        )?;
        if changed == 0 {
            tracing::warn!(
                recipient_id,
                "skipping failure stamp for recipient that is no longer pending"
            );
        }
        Ok(())
    }

    pub fn count_pending_recipients(&self, campaign_id: i64) -> Result<u64> {
        let connection = self.open_connection()?;
        let count: u64 = connection.query_row(
            "SELECT COUNT(1) FROM campaign_recipients WHERE campaign_id = ?1 AND status = ?2",
            params![campaign_id, RecipientStatus::Pending.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn campaign_stats(&self, campaign_id: i64) -> Result<CampaignStats> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT status, COUNT(1) FROM campaign_recipients WHERE campaign_id = ?1 \
             GROUP BY status",
        )?;
        let rows = statement.query_map(params![campaign_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut stats = CampaignStats::default();
        for row in rows {
            let (status_raw, count) = row?;
            match parse_recipient_status(&status_raw)? {
                RecipientStatus::Pending => stats.pending = count,
                RecipientStatus::Sent => stats.sent = count,
                RecipientStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Marks every remaining PENDING recipient FAILED with `error`. Used by
    /// campaign cancellation; returns how many recipients were affected.
    pub fn fail_pending_recipients(&self, campaign_id: i64, error: &str) -> Result<u64> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE campaign_recipients SET status = ?2, error = ?3 \
             WHERE campaign_id = ?1 AND status = ?4",
            params![
                campaign_id,
                RecipientStatus::Failed.as_str(),
                error,
                RecipientStatus::Pending.as_str()
            ],
        )?;
        Ok(changed as u64)
    }

    // ---- notifications --------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn append_notification(
        &self,
        org_id: &str,
        kind: NotificationKind,
        title: &str,
        body: &str,
        ticket_id: Option<i64>,
        customer_id: Option<i64>,
        platform: Option<ChannelProvider>,
    ) -> Result<NotificationRecord> {
        let connection = self.open_connection()?;
        let now = now_unix_ms();
        connection
            .execute(
                "INSERT INTO notifications (org_id, kind, title, body, ticket_id, customer_id, \
                 platform, created_at_unix_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    org_id,
                    kind.as_str(),
                    title,
                    body,
                    ticket_id,
                    customer_id,
                    platform.map(|provider| provider.as_str()),
                    now
                ],
            )
            .context("failed to append notification")?;
        Ok(NotificationRecord {
            id: connection.last_insert_rowid(),
            org_id: org_id.to_string(),
            kind,
            title: title.to_string(),
            body: body.to_string(),
            ticket_id,
            customer_id,
            platform,
            created_at_unix_ms: now,
        })
    }

    pub fn list_notifications(&self, org_id: &str, limit: u32) -> Result<Vec<NotificationRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT id, org_id, kind, title, body, ticket_id, customer_id, platform, \
             created_at_unix_ms FROM notifications WHERE org_id = ?1 \
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = statement.query_map(params![org_id, limit], notification_from_row)?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }
}

fn initialize_helpdesk_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            display_name TEXT NOT NULL,
            config TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at_unix_ms INTEGER NOT NULL,
            updated_at_unix_ms INTEGER NOT NULL,
            UNIQUE(org_id, provider)
        );
        CREATE TABLE IF NOT EXISTS customers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            external_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            last_message TEXT NULL,
            last_message_at_unix_ms INTEGER NULL,
            created_at_unix_ms INTEGER NOT NULL,
            updated_at_unix_ms INTEGER NOT NULL,
            UNIQUE(org_id, platform, external_id)
        );
        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            customer_id INTEGER NOT NULL,
            external_thread_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            status TEXT NOT NULL,
            priority TEXT NOT NULL,
            created_at_unix_ms INTEGER NOT NULL,
            updated_at_unix_ms INTEGER NOT NULL,
            UNIQUE(org_id, channel_id, external_thread_id)
        );
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id INTEGER NOT NULL,
            direction TEXT NOT NULL,
            content TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            external_message_id TEXT NULL,
            delivery_error TEXT NULL,
            sent_at_unix_ms INTEGER NULL,
            failed_at_unix_ms INTEGER NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at_unix_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_ticket
            ON messages(ticket_id, created_at_unix_ms);
        CREATE TABLE IF NOT EXISTS campaigns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            message_template TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at_unix_ms INTEGER NOT NULL,
            updated_at_unix_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS campaign_recipients (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id INTEGER NOT NULL,
            contact TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT NULL,
            sent_at_unix_ms INTEGER NULL,
            created_at_unix_ms INTEGER NOT NULL,
            UNIQUE(campaign_id, contact)
        );
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            ticket_id INTEGER NULL,
            customer_id INTEGER NULL,
            platform TEXT NULL,
            created_at_unix_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn now_unix_ms() -> i64 {
    iris_core::current_unix_timestamp_ms() as i64
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn parsed_text_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Result<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, error.into())
    })
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(error),
        )
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelRecord> {
    Ok(ChannelRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        provider: parsed_text_column(row, 2, parse_channel_provider)?,
        display_name: row.get(3)?,
        config: json_column(row, 4)?,
        active: row.get::<_, i64>(5)? != 0,
        created_at_unix_ms: row.get(6)?,
        updated_at_unix_ms: row.get(7)?,
    })
}

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<CustomerRecord> {
    Ok(CustomerRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        platform: parsed_text_column(row, 2, parse_channel_provider)?,
        external_id: row.get(3)?,
        display_name: row.get(4)?,
        last_message: row.get(5)?,
        last_message_at_unix_ms: row.get(6)?,
        created_at_unix_ms: row.get(7)?,
        updated_at_unix_ms: row.get(8)?,
    })
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<TicketRecord> {
    Ok(TicketRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        channel_id: row.get(2)?,
        customer_id: row.get(3)?,
        external_thread_id: row.get(4)?,
        subject: row.get(5)?,
        status: parsed_text_column(row, 6, parse_ticket_status)?,
        priority: parsed_text_column(row, 7, parse_ticket_priority)?,
        created_at_unix_ms: row.get(8)?,
        updated_at_unix_ms: row.get(9)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        direction: parsed_text_column(row, 2, parse_message_direction)?,
        content: row.get(3)?,
        sender_name: row.get(4)?,
        external_message_id: row.get(5)?,
        delivery_error: row.get(6)?,
        sent_at_unix_ms: row.get(7)?,
        failed_at_unix_ms: row.get(8)?,
        metadata: json_column(row, 9)?,
        created_at_unix_ms: row.get(10)?,
    })
}

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<CampaignRecord> {
    Ok(CampaignRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        channel_id: row.get(2)?,
        name: row.get(3)?,
        message_template: row.get(4)?,
        status: parsed_text_column(row, 5, parse_campaign_status)?,
        created_at_unix_ms: row.get(6)?,
        updated_at_unix_ms: row.get(7)?,
    })
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<CampaignRecipientRecord> {
    Ok(CampaignRecipientRecord {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        contact: row.get(2)?,
        status: parsed_text_column(row, 3, parse_recipient_status)?,
        error: row.get(4)?,
        sent_at_unix_ms: row.get(5)?,
        created_at_unix_ms: row.get(6)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let platform_raw: Option<String> = row.get(7)?;
    let platform = match platform_raw {
        Some(text) => Some(parse_channel_provider(&text).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, error.into())
        })?),
        None => None,
    };
    Ok(NotificationRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        kind: parsed_text_column(row, 2, parse_notification_kind)?,
        title: row.get(3)?,
        body: row.get(4)?,
        ticket_id: row.get(5)?,
        customer_id: row.get(6)?,
        platform,
        created_at_unix_ms: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn scratch_store() -> (TempDir, HelpdeskStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = HelpdeskStore::new(dir.path().join("helpdesk.sqlite3"));
        (dir, store)
    }

    #[test]
    fn unit_create_channel_enforces_one_per_org_and_provider() {
        let (_dir, store) = scratch_store();
        let created = store
            .create_channel("org-1", ChannelProvider::Mock, "Mock line", &json!({}))
            .expect("create");
        assert!(created.active);
        assert_eq!(created.provider, ChannelProvider::Mock);

        let error = store
            .create_channel("org-1", ChannelProvider::Mock, "Second mock", &json!({}))
            .expect_err("duplicate (org, provider)");
        assert!(error.to_string().contains("already exists"));

        // A different org may hold the same provider.
        store
            .create_channel("org-2", ChannelProvider::Mock, "Other org", &json!({}))
            .expect("other org");
    }

    #[test]
    fn unit_channel_lookup_update_and_delete() {
        let (_dir, store) = scratch_store();
        let created = store
            .create_channel(
                "org-1",
                ChannelProvider::Telegram,
                "TG",
                &json!({ "bot_token": "12:abc" }),
            )
            .expect("create");

        let fetched = store.get_channel(created.id).expect("get");
        assert_eq!(fetched.config, json!({ "bot_token": "12:abc" }));

        let updated = store
            .update_channel(created.id, Some("Telegram support"), Some(false))
            .expect("update");
        assert_eq!(updated.display_name, "Telegram support");
        assert!(!updated.active);

        store.delete_channel(created.id).expect("delete");
        let missing = store.get_channel(created.id).expect_err("gone");
        assert!(missing.is_missing());
    }

    #[test]
    fn functional_find_or_create_customer_collapses_duplicates() {
        let (_dir, store) = scratch_store();
        let first = store
            .find_or_create_customer(
                "org-1",
                ChannelProvider::Whatsapp,
                "+1555",
                "Dana",
                "hi",
                1_000,
            )
            .expect("create");
        let second = store
            .find_or_create_customer(
                "org-1",
                ChannelProvider::Whatsapp,
                "+1555",
                "Dana renamed",
                "are you there?",
                2_000,
            )
            .expect("resolve");
        assert_eq!(first.id, second.id);
        // Activity fields move, the original display name stays.
        assert_eq!(second.display_name, "Dana");
        assert_eq!(second.last_message.as_deref(), Some("are you there?"));
        assert_eq!(second.last_message_at_unix_ms, Some(2_000));

        assert_eq!(store.list_customers("org-1").expect("list").len(), 1);
    }

    #[test]
    fn unit_touch_customer_updates_activity_fields_only() {
        let (_dir, store) = scratch_store();
        let customer = store
            .find_or_create_customer("org-1", ChannelProvider::Mock, "+1555", "Dana", "hi", 1_000)
            .expect("create");
        store
            .touch_customer_last_message(customer.id, "anything new?", 3_000)
            .expect("touch");

        let listed = store.list_customers("org-1").expect("list");
        assert_eq!(listed[0].display_name, "Dana");
        assert_eq!(listed[0].last_message.as_deref(), Some("anything new?"));
        assert_eq!(listed[0].last_message_at_unix_ms, Some(3_000));

        assert!(store
            .touch_customer_last_message(9_999, "ghost", 4_000)
            .is_err());
    }

    #[test]
    fn functional_find_or_create_ticket_is_single_per_thread() {
        let (_dir, store) = scratch_store();
        let channel = store
            .create_channel("org-1", ChannelProvider::Mock, "Mock", &json!({}))
            .expect("channel");
        let customer = store
            .find_or_create_customer("org-1", ChannelProvider::Mock, "+1555", "Dana", "hi", 1_000)
            .expect("customer");

        let (ticket, created) = store
            .find_or_create_ticket("org-1", channel.id, customer.id, "mock-thread-+1555", "Message from Dana")
            .expect("create ticket");
        assert!(created);
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.priority, TicketPriority::Medium);

        let (same, created_again) = store
            .find_or_create_ticket("org-1", channel.id, customer.id, "mock-thread-+1555", "Message from Dana")
            .expect("resolve ticket");
        assert!(!created_again);
        assert_eq!(same.id, ticket.id);
    }

    #[test]
    fn unit_ticket_status_updates_and_missing_lookup() {
        let (_dir, store) = scratch_store();
        let channel = store
            .create_channel("org-1", ChannelProvider::Mock, "Mock", &json!({}))
            .expect("channel");
        let customer = store
            .find_or_create_customer("org-1", ChannelProvider::Mock, "x", "X", "hi", 1)
            .expect("customer");
        let (ticket, _) = store
            .find_or_create_ticket("org-1", channel.id, customer.id, "t", "s")
            .expect("ticket");

        store
            .set_ticket_status(ticket.id, TicketStatus::Closed)
            .expect("close");
        assert_eq!(
            store.get_ticket(ticket.id).expect("get").status,
            TicketStatus::Closed
        );

        let missing = store.get_ticket(9_999).expect_err("missing");
        assert!(missing.is_missing());
        assert!(missing.to_string().contains("ticket 9999"));
    }

    #[test]
    fn functional_message_append_and_delivery_stamps() {
        let (_dir, store) = scratch_store();
        let channel = store
            .create_channel("org-1", ChannelProvider::Mock, "Mock", &json!({}))
            .expect("channel");
        let customer = store
            .find_or_create_customer("org-1", ChannelProvider::Mock, "x", "X", "hi", 1)
            .expect("customer");
        let (ticket, _) = store
            .find_or_create_ticket("org-1", channel.id, customer.id, "t", "s")
            .expect("ticket");

        let inbound = store
            .append_message(
                ticket.id,
                MessageDirection::Inbound,
                "hi",
                "Dana",
                Some("m-1"),
                &json!({ "platform": "mock" }),
                1_000,
            )
            .expect("inbound");
        let outbound = store
            .append_message(
                ticket.id,
                MessageDirection::Outbound,
                "hello back",
                "Agent",
                None,
                &json!({}),
                2_000,
            )
            .expect("outbound");

        store
            .mark_message_failed(outbound.id, "provider 500", 2_100)
            .expect("fail stamp");
        store
            .mark_message_sent(outbound.id, Some("prov-9"), 2_200)
            .expect("sent stamp");

        let listed = store.list_messages(ticket.id).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, inbound.id);
        let delivered = &listed[1];
        assert_eq!(delivered.external_message_id.as_deref(), Some("prov-9"));
        assert_eq!(delivered.sent_at_unix_ms, Some(2_200));
        // The retry that eventually succeeded clears the error but keeps the
        // failed stamp for audit.
        assert_eq!(delivered.delivery_error, None);
        assert_eq!(delivered.failed_at_unix_ms, Some(2_100));
    }

    #[test]
    fn functional_campaign_recipients_dedup_stats_and_monotonic_status() {
        let (_dir, store) = scratch_store();
        let campaign = store
            .create_campaign("org-1", 1, "Spring promo", "Hi {name}!")
            .expect("campaign");
        assert_eq!(campaign.status, CampaignStatus::Draft);

        let added = store
            .add_campaign_recipients(
                campaign.id,
                &[
                    "+1".to_string(),
                    "+2".to_string(),
                    "+1".to_string(),
                    "  ".to_string(),
                ],
            )
            .expect("add");
        assert_eq!(added, 2);

        let pending = store.pending_recipients(campaign.id, 10).expect("pending");
        assert_eq!(pending.len(), 2);

        store
            .mark_recipient_sent(pending[0].id, 5_000)
            .expect("sent");
        store
            .mark_recipient_failed(pending[1].id, "blocked")
            .expect("failed");
        // Finished recipients never move again.
        store
            .mark_recipient_failed(pending[0].id, "late failure")
            .expect("no-op");

        let stats = store.campaign_stats(campaign.id).expect("stats");
        assert_eq!(stats, CampaignStats { pending: 0, sent: 1, failed: 1 });
        assert_eq!(store.count_pending_recipients(campaign.id).expect("count"), 0);
    }

    #[test]
    fn unit_fail_pending_recipients_marks_only_pending() {
        let (_dir, store) = scratch_store();
        let campaign = store
            .create_campaign("org-1", 1, "Promo", "hi")
            .expect("campaign");
        store
            .add_campaign_recipients(campaign.id, &["+1".to_string(), "+2".to_string(), "+3".to_string()])
            .expect("add");
        let pending = store.pending_recipients(campaign.id, 1).expect("first");
        store.mark_recipient_sent(pending[0].id, 1).expect("sent");

        let failed = store
            .fail_pending_recipients(campaign.id, "cancelled before send")
            .expect("cancel");
        assert_eq!(failed, 2);
        let stats = store.campaign_stats(campaign.id).expect("stats");
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn unit_notifications_append_and_list_newest_first() {
        let (_dir, store) = scratch_store();
        store
            .append_notification(
                "org-1",
                NotificationKind::NewMessage,
                "New message from Dana",
                "hi",
                Some(1),
                Some(2),
                Some(ChannelProvider::Mock),
            )
            .expect("first");
        store
            .append_notification(
                "org-1",
                NotificationKind::NewComment,
                "New comment from Pat",
                "nice post",
                Some(3),
                None,
                Some(ChannelProvider::Facebook),
            )
            .expect("second");

        let listed = store.list_notifications("org-1", 10).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].kind, NotificationKind::NewComment);
        assert_eq!(listed[1].platform, Some(ChannelProvider::Mock));
        assert!(store.list_notifications("org-2", 10).expect("other org").is_empty());
    }
}
