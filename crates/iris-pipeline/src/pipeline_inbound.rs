//! Inbound pipeline worker.
//!
//! Turns a connector-normalized [`InboundJob`] into durable helpdesk state:
//! customer, ticket, message, notification, ticket-status transition. Every
//! step is idempotent under redelivery because customer and ticket creation
//! resolve through uniqueness constraints instead of read-then-write.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use iris_connectors::{MessageKind, ParsedMessage};
use iris_queue::{JobHandler, JobOutcome, JobRecord};
use iris_store::{
    ChannelRecord, HelpdeskStore, MessageDirection, NotificationKind, TicketStatus,
};

use crate::pipeline_jobs::InboundJob;

/// Public struct `InboundWorker` used across Iris components.
pub struct InboundWorker {
    store: Arc<HelpdeskStore>,
}

impl InboundWorker {
    pub fn new(store: Arc<HelpdeskStore>) -> Self {
        Self { store }
    }

    fn apply_message(&self, channel: &ChannelRecord, message: &ParsedMessage) -> Result<()> {
        let timestamp = message.timestamp_unix_ms as i64;
        let customer = self.store.find_or_create_customer(
            &channel.org_id,
            channel.provider,
            &message.external_thread_id,
            &message.sender_name,
            &message.content,
            timestamp,
        )?;

        let subject = format!("Message from {}", message.sender_name);
        let (ticket, created) = self.store.find_or_create_ticket(
            &channel.org_id,
            channel.id,
            customer.id,
            &message.external_thread_id,
            &subject,
        )?;

        let metadata = serde_json::to_value(&message.metadata)?;
        self.store.append_message(
            ticket.id,
            MessageDirection::Inbound,
            &message.content,
            &message.sender_name,
            Some(&message.external_message_id),
            &metadata,
            timestamp,
        )?;

        let kind = if message.message_kind == MessageKind::Comment {
            NotificationKind::NewComment
        } else {
            NotificationKind::NewMessage
        };
        let title = format!(
            "New {} from {}",
            message.message_kind.as_str(),
            message.sender_name
        );
        self.store.append_notification(
            &channel.org_id,
            kind,
            &title,
            &message.content,
            Some(ticket.id),
            Some(customer.id),
            Some(channel.provider),
        )?;

        // A customer writing into a closed conversation reopens it for
        // triage rather than full handling.
        if ticket.status == TicketStatus::Closed {
            self.store.set_ticket_status(ticket.id, TicketStatus::Pending)?;
        }

        tracing::info!(
            channel_id = channel.id,
            ticket_id = ticket.id,
            customer_id = customer.id,
            ticket_created = created,
            kind = message.message_kind.as_str(),
            "inbound message applied"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for InboundWorker {
    async fn handle(&self, job: &JobRecord) -> JobOutcome {
        let inbound = match InboundJob::from_payload(&job.payload) {
            Ok(inbound) => inbound,
            Err(error) => return JobOutcome::Fatal(format!("{error:#}")),
        };
        let channel = match self.store.get_channel(inbound.channel_id) {
            Ok(channel) => channel,
            Err(error) if error.is_missing() => return JobOutcome::Fatal(error.to_string()),
            Err(error) => return JobOutcome::Retry(error.to_string()),
        };
        match self.apply_message(&channel, &inbound.parsed_message) {
            Ok(()) => JobOutcome::Completed,
            Err(error) => JobOutcome::Retry(format!("{error:#}")),
        }
    }
}
