//! Outbound pipeline worker.
//!
//! Delivers agent replies through the channel's connector. The channel
//! config is re-applied on every delivery so rotated credentials take effect
//! without touching queued jobs. Send failures stamp the message row and
//! fail the job; the queue's bounded retry does the redelivery. `send` is
//! safely re-callable, so a lost lease at worst duplicates a provider call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use iris_connectors::{ConnectorRegistry, OutboundMessage};
use iris_queue::{JobHandler, JobOutcome, JobRecord};
use iris_store::{HelpdeskStore, MessageDirection};
use serde_json::Value;

use crate::pipeline_jobs::OutboundJob;

/// Public struct `OutboundWorker` used across Iris components.
pub struct OutboundWorker {
    store: Arc<HelpdeskStore>,
    registry: Arc<ConnectorRegistry>,
}

impl OutboundWorker {
    pub fn new(store: Arc<HelpdeskStore>, registry: Arc<ConnectorRegistry>) -> Self {
        Self { store, registry }
    }

    /// Reply routing context lives in the latest inbound message's provider
    /// metadata: Graph comment ids for feed replies, subject and references
    /// for email threading. DM-style threads yield an empty map.
    fn latest_inbound_metadata(&self, ticket_id: i64) -> anyhow::Result<BTreeMap<String, Value>> {
        let metadata = self
            .store
            .list_messages(ticket_id)?
            .into_iter()
            .rev()
            .find(|message| message.direction == MessageDirection::Inbound)
            .map(|message| metadata_map(&message.metadata))
            .unwrap_or_default();
        Ok(metadata)
    }
}

#[async_trait]
impl JobHandler for OutboundWorker {
    async fn handle(&self, job: &JobRecord) -> JobOutcome {
        let outbound = match OutboundJob::from_payload(&job.payload) {
            Ok(outbound) => outbound,
            Err(error) => return JobOutcome::Fatal(format!("{error:#}")),
        };
        let channel = match self.store.get_channel(outbound.channel_id) {
            Ok(channel) => channel,
            Err(error) if error.is_missing() => return JobOutcome::Fatal(error.to_string()),
            Err(error) => return JobOutcome::Retry(error.to_string()),
        };
        let connector = match self.registry.resolve(channel.provider) {
            Ok(connector) => connector,
            Err(error) => return JobOutcome::Fatal(error.to_string()),
        };
        if let Err(error) = connector.init(&channel.config) {
            return JobOutcome::Fatal(error.to_string());
        }
        let metadata = match self.latest_inbound_metadata(outbound.ticket_id) {
            Ok(metadata) => metadata,
            Err(error) => return JobOutcome::Retry(format!("{error:#}")),
        };

        let message = OutboundMessage {
            ticket_id: outbound.ticket_id.to_string(),
            external_thread_id: outbound.external_thread_id.clone(),
            content: outbound.content.clone(),
            sender_name: outbound.sender_name.clone(),
            metadata,
        };
        let now = now_unix_ms();
        match connector.send(&message).await {
            Ok(result) if result.success => {
                if let Err(error) = self.store.mark_message_sent(
                    outbound.message_id,
                    result.external_message_id.as_deref(),
                    now,
                ) {
                    return JobOutcome::Retry(format!("delivered but unstamped: {error:#}"));
                }
                tracing::info!(
                    message_id = outbound.message_id,
                    ticket_id = outbound.ticket_id,
                    provider = channel.provider.as_str(),
                    external_message_id = result.external_message_id.as_deref().unwrap_or(""),
                    "outbound message delivered"
                );
                JobOutcome::Completed
            }
            Ok(result) => {
                let reason = result
                    .error
                    .unwrap_or_else(|| "provider rejected the message".to_string());
                if let Err(error) = self.store.mark_message_failed(outbound.message_id, &reason, now)
                {
                    tracing::warn!(
                        message_id = outbound.message_id,
                        "failed to stamp delivery error: {error:#}"
                    );
                }
                JobOutcome::Retry(reason)
            }
            Err(error) => {
                // Configuration problems do not heal through redelivery; an
                // operator has to fix the channel first.
                let reason = error.to_string();
                if let Err(stamp_error) =
                    self.store.mark_message_failed(outbound.message_id, &reason, now)
                {
                    tracing::warn!(
                        message_id = outbound.message_id,
                        "failed to stamp delivery error: {stamp_error:#}"
                    );
                }
                JobOutcome::Fatal(reason)
            }
        }
    }
}

fn metadata_map(value: &Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn now_unix_ms() -> i64 {
    iris_core::current_unix_timestamp_ms() as i64
}
