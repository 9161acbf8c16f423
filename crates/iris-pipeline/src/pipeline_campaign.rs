//! Campaign pipeline worker.
//!
//! Processes one batch of PENDING recipients per job, then chains the next
//! batch by re-enqueueing itself with a delay. Recipient status is monotonic
//! (PENDING to SENT or FAILED, stamped per recipient), so a redelivered or
//! overlapping job can never re-send anyone: the PENDING filter already
//! excludes finished recipients.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iris_connectors::{ConnectorRegistry, OutboundMessage};
use iris_queue::{JobHandler, JobOutcome, JobQueue, JobRecord};
use iris_store::{CampaignRecord, CampaignStatus, ChannelRecord, HelpdeskStore};

use crate::pipeline_jobs::{CampaignJob, CAMPAIGN_JOB_KIND, CAMPAIGN_QUEUE};

pub const CAMPAIGN_BATCH_SIZE: u32 = 10;
pub const CAMPAIGN_BATCH_DELAY_MS: u64 = 1_000;

/// Public struct `CampaignWorker` used across Iris components.
pub struct CampaignWorker {
    store: Arc<HelpdeskStore>,
    queue: Arc<JobQueue>,
    registry: Arc<ConnectorRegistry>,
    recipient_delay_ms: u64,
}

impl CampaignWorker {
    pub fn new(
        store: Arc<HelpdeskStore>,
        queue: Arc<JobQueue>,
        registry: Arc<ConnectorRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            recipient_delay_ms: CAMPAIGN_BATCH_DELAY_MS / u64::from(CAMPAIGN_BATCH_SIZE),
        }
    }

    /// Overrides the pause between recipient sends. Tests run with zero.
    pub fn with_recipient_delay_ms(mut self, recipient_delay_ms: u64) -> Self {
        self.recipient_delay_ms = recipient_delay_ms;
        self
    }

    async fn process_batch(
        &self,
        campaign: &CampaignRecord,
        channel: &ChannelRecord,
    ) -> JobOutcome {
        let connector = match self.registry.resolve(channel.provider) {
            Ok(connector) => connector,
            Err(error) => return JobOutcome::Fatal(error.to_string()),
        };
        if let Err(error) = connector.init(&channel.config) {
            return JobOutcome::Fatal(error.to_string());
        }
        let recipients = match self
            .store
            .pending_recipients(campaign.id, CAMPAIGN_BATCH_SIZE)
        {
            Ok(recipients) => recipients,
            Err(error) => return JobOutcome::Retry(format!("{error:#}")),
        };

        let batch_size = recipients.len();
        for recipient in &recipients {
            let message = OutboundMessage {
                ticket_id: format!("campaign-{}", campaign.id),
                external_thread_id: recipient.contact.clone(),
                content: campaign.message_template.clone(),
                sender_name: channel.display_name.clone(),
                metadata: BTreeMap::new(),
            };
            let now = now_unix_ms();
            let stamp = match connector.send(&message).await {
                Ok(result) if result.success => {
                    self.store.mark_recipient_sent(recipient.id, now)
                }
                Ok(result) => self.store.mark_recipient_failed(
                    recipient.id,
                    result
                        .error
                        .as_deref()
                        .unwrap_or("provider rejected the message"),
                ),
                Err(error) => self
                    .store
                    .mark_recipient_failed(recipient.id, &error.to_string()),
            };
            if let Err(error) = stamp {
                tracing::warn!(
                    campaign_id = campaign.id,
                    recipient_id = recipient.id,
                    "failed to stamp recipient outcome: {error:#}"
                );
            }
            // Provider-side rate pacing, applied regardless of outcome.
            if self.recipient_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.recipient_delay_ms)).await;
            }
        }

        let remaining = match self.store.count_pending_recipients(campaign.id) {
            Ok(remaining) => remaining,
            Err(error) => return JobOutcome::Retry(format!("{error:#}")),
        };
        tracing::info!(
            campaign_id = campaign.id,
            batch = batch_size,
            remaining,
            "campaign batch processed"
        );
        if remaining > 0 {
            let chained = CampaignJob::new(campaign.id, campaign.org_id.clone());
            let payload = match chained.to_payload() {
                Ok(payload) => payload,
                Err(error) => return JobOutcome::Retry(format!("{error:#}")),
            };
            if let Err(error) = self.queue.enqueue_at(
                CAMPAIGN_QUEUE,
                CAMPAIGN_JOB_KIND,
                &payload,
                now_unix_ms().saturating_add(CAMPAIGN_BATCH_DELAY_MS as i64),
            ) {
                return JobOutcome::Retry(format!("failed to chain next batch: {error:#}"));
            }
        } else if let Err(error) = self
            .store
            .set_campaign_status(campaign.id, CampaignStatus::Completed)
        {
            return JobOutcome::Retry(format!("{error:#}"));
        }
        JobOutcome::Completed
    }
}

#[async_trait]
impl JobHandler for CampaignWorker {
    async fn handle(&self, job: &JobRecord) -> JobOutcome {
        let campaign_job = match CampaignJob::from_payload(&job.payload) {
            Ok(campaign_job) => campaign_job,
            Err(error) => return JobOutcome::Fatal(format!("{error:#}")),
        };
        let campaign = match self.store.get_campaign(campaign_job.campaign_id) {
            Ok(campaign) => campaign,
            Err(error) if error.is_missing() => return JobOutcome::Fatal(error.to_string()),
            Err(error) => return JobOutcome::Retry(error.to_string()),
        };
        if campaign.status != CampaignStatus::Sending {
            tracing::info!(
                campaign_id = campaign.id,
                status = campaign.status.as_str(),
                "campaign is not sending; dropping stale batch job"
            );
            return JobOutcome::Completed;
        }
        let channel = match self.store.get_channel(campaign.channel_id) {
            Ok(channel) => channel,
            Err(error) if error.is_missing() => return JobOutcome::Fatal(error.to_string()),
            Err(error) => return JobOutcome::Retry(error.to_string()),
        };
        self.process_batch(&campaign, &channel).await
    }
}

fn now_unix_ms() -> i64 {
    iris_core::current_unix_timestamp_ms() as i64
}
