//! Operator-facing service layer.
//!
//! Thin orchestration over the store, the queue, and the connector registry:
//! channel administration, the agent reply path, and campaign lifecycle.
//! Workers stay ignorant of these flows; everything here talks to them
//! through enqueued jobs only.

use std::sync::Arc;

use anyhow::{bail, Result};
use iris_connectors::{ChannelProvider, ConnectorRegistry};
use iris_queue::JobQueue;
use iris_store::{
    CampaignRecord, CampaignStats, CampaignStatus, ChannelRecord, CustomerRecord, HelpdeskStore,
    MessageDirection, MessageRecord, NotificationRecord, TicketStatus,
};
use serde_json::{json, Value};

use crate::pipeline_jobs::{
    CampaignJob, OutboundJob, CAMPAIGN_JOB_KIND, CAMPAIGN_QUEUE, JOB_SCHEMA_VERSION,
    OUTBOUND_JOB_KIND, OUTBOUND_QUEUE,
};

/// Public struct `HelpdeskServices` used across Iris components.
pub struct HelpdeskServices {
    store: Arc<HelpdeskStore>,
    queue: Arc<JobQueue>,
    registry: Arc<ConnectorRegistry>,
    public_base_url: String,
}

/// Public struct `CreatedChannel` used across Iris components.
#[derive(Debug, Clone)]
pub struct CreatedChannel {
    pub channel: ChannelRecord,
    pub webhook_url: String,
}

impl HelpdeskServices {
    pub fn new(
        store: Arc<HelpdeskStore>,
        queue: Arc<JobQueue>,
        registry: Arc<ConnectorRegistry>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            public_base_url: public_base_url.into(),
        }
    }

    pub fn webhook_url(&self, channel_id: i64) -> String {
        format!(
            "{}/webhook/{channel_id}",
            self.public_base_url.trim_end_matches('/')
        )
    }

    /// Creates a channel after the connector has accepted its config, then
    /// registers the derived webhook URL with the provider. Registration is
    /// best-effort: most providers take the URL from a dashboard instead, and
    /// a failed registration leaves a working channel plus a warning.
    pub async fn create_channel(
        &self,
        org_id: &str,
        provider: ChannelProvider,
        display_name: &str,
        config: &Value,
    ) -> Result<CreatedChannel> {
        let connector = self.registry.resolve(provider)?;
        connector.init(config)?;
        let channel = self
            .store
            .create_channel(org_id, provider, display_name, config)?;
        let webhook_url = self.webhook_url(channel.id);
        if let Err(error) = connector.register_webhook(&webhook_url).await {
            tracing::warn!(
                channel_id = channel.id,
                provider = provider.as_str(),
                "webhook registration failed: {error}"
            );
        }
        Ok(CreatedChannel {
            channel,
            webhook_url,
        })
    }

    pub fn update_channel(
        &self,
        channel_id: i64,
        display_name: Option<&str>,
        active: Option<bool>,
    ) -> Result<ChannelRecord> {
        self.store.update_channel(channel_id, display_name, active)
    }

    pub fn delete_channel(&self, channel_id: i64) -> Result<()> {
        self.store.delete_channel(channel_id)
    }

    pub fn get_channel(&self, channel_id: i64) -> Result<ChannelRecord> {
        Ok(self.store.get_channel(channel_id)?)
    }

    pub fn list_channels(&self, org_id: &str) -> Result<Vec<ChannelRecord>> {
        self.store.list_channels(org_id)
    }

    /// Appends an OUTBOUND message to the ticket and enqueues its delivery.
    /// An agent writing into a CLOSED ticket reopens it as OPEN.
    pub fn create_agent_reply(
        &self,
        org_id: &str,
        ticket_id: i64,
        content: &str,
        sender_name: &str,
    ) -> Result<MessageRecord> {
        let ticket = self.store.get_ticket(ticket_id)?;
        if ticket.org_id != org_id {
            bail!("ticket {ticket_id} does not belong to organisation {org_id}");
        }
        let message = self.store.append_message(
            ticket.id,
            MessageDirection::Outbound,
            content,
            sender_name,
            None,
            &json!({}),
            now_unix_ms(),
        )?;
        let job = OutboundJob {
            schema_version: JOB_SCHEMA_VERSION,
            message_id: message.id,
            ticket_id: ticket.id,
            channel_id: ticket.channel_id,
            external_thread_id: ticket.external_thread_id.clone(),
            content: content.to_string(),
            sender_name: sender_name.to_string(),
        };
        self.queue
            .enqueue(OUTBOUND_QUEUE, OUTBOUND_JOB_KIND, &job.to_payload()?)?;
        if ticket.status == TicketStatus::Closed {
            self.store.set_ticket_status(ticket.id, TicketStatus::Open)?;
        }
        Ok(message)
    }

    pub fn create_campaign(
        &self,
        org_id: &str,
        channel_id: i64,
        name: &str,
        message_template: &str,
    ) -> Result<CampaignRecord> {
        let channel = self.store.get_channel(channel_id)?;
        if channel.org_id != org_id {
            bail!("channel {channel_id} does not belong to organisation {org_id}");
        }
        self.store
            .create_campaign(org_id, channel_id, name, message_template)
    }

    pub fn add_recipients(&self, campaign_id: i64, contacts: &[String]) -> Result<u64> {
        self.store.get_campaign(campaign_id)?;
        self.store.add_campaign_recipients(campaign_id, contacts)
    }

    /// Moves a DRAFT campaign to SENDING and enqueues its first batch job.
    pub fn start_campaign(&self, campaign_id: i64) -> Result<()> {
        let campaign = self.store.get_campaign(campaign_id)?;
        if campaign.status != CampaignStatus::Draft {
            bail!(
                "campaign {campaign_id} is {}; only draft campaigns can start",
                campaign.status.as_str()
            );
        }
        self.store
            .set_campaign_status(campaign.id, CampaignStatus::Sending)?;
        let job = CampaignJob::new(campaign.id, campaign.org_id.clone());
        self.queue
            .enqueue(CAMPAIGN_QUEUE, CAMPAIGN_JOB_KIND, &job.to_payload()?)?;
        Ok(())
    }

    pub fn campaign_stats(&self, campaign_id: i64) -> Result<CampaignStats> {
        self.store.get_campaign(campaign_id)?;
        self.store.campaign_stats(campaign_id)
    }

    /// Fails every recipient still PENDING with `"cancelled before send"` and
    /// completes the campaign once none remain. Returns the number cancelled.
    /// Already-sent recipients keep their SENT status; status stays monotonic.
    pub fn cancel_campaign(&self, campaign_id: i64) -> Result<u64> {
        let campaign = self.store.get_campaign(campaign_id)?;
        let cancelled = self
            .store
            .fail_pending_recipients(campaign.id, "cancelled before send")?;
        if self.store.count_pending_recipients(campaign.id)? == 0 {
            self.store
                .set_campaign_status(campaign.id, CampaignStatus::Completed)?;
        }
        Ok(cancelled)
    }

    pub fn list_notifications(&self, org_id: &str, limit: u32) -> Result<Vec<NotificationRecord>> {
        self.store.list_notifications(org_id, limit)
    }

    pub fn list_customers(&self, org_id: &str) -> Result<Vec<CustomerRecord>> {
        self.store.list_customers(org_id)
    }
}

fn now_unix_ms() -> i64 {
    iris_core::current_unix_timestamp_ms() as i64
}
