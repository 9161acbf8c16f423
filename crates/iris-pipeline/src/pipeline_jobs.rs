//! Durable job payloads exchanged between enqueuers and workers.
//!
//! Payloads are versioned serde JSON so a deploy can change a worker without
//! stranding jobs already in the queue. Queue names are the coordination
//! points: ingress feeds `inbound`, the agent-reply service feeds `outbound`,
//! campaign start feeds `campaigns`.

use anyhow::{Context, Result};
use iris_connectors::ParsedMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const INBOUND_QUEUE: &str = "inbound";
pub const OUTBOUND_QUEUE: &str = "outbound";
pub const CAMPAIGN_QUEUE: &str = "campaigns";

pub const INBOUND_JOB_KIND: &str = "inbound_message";
pub const OUTBOUND_JOB_KIND: &str = "outbound_message";
pub const CAMPAIGN_JOB_KIND: &str = "campaign_batch";

pub const JOB_SCHEMA_VERSION: u32 = 1;

fn job_schema_version() -> u32 {
    JOB_SCHEMA_VERSION
}

/// Public struct `InboundJob` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundJob {
    #[serde(default = "job_schema_version")]
    pub schema_version: u32,
    pub channel_id: i64,
    pub org_id: String,
    pub parsed_message: ParsedMessage,
}

impl InboundJob {
    pub fn new(channel_id: i64, org_id: impl Into<String>, parsed_message: ParsedMessage) -> Self {
        Self {
            schema_version: JOB_SCHEMA_VERSION,
            channel_id,
            org_id: org_id.into(),
            parsed_message,
        }
    }

    pub fn to_payload(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to encode inbound job payload")
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone()).context("failed to decode inbound job payload")
    }
}

/// Public struct `OutboundJob` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundJob {
    #[serde(default = "job_schema_version")]
    pub schema_version: u32,
    pub message_id: i64,
    pub ticket_id: i64,
    pub channel_id: i64,
    pub external_thread_id: String,
    pub content: String,
    pub sender_name: String,
}

impl OutboundJob {
    pub fn to_payload(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to encode outbound job payload")
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone()).context("failed to decode outbound job payload")
    }
}

/// Public struct `CampaignJob` used across Iris components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignJob {
    #[serde(default = "job_schema_version")]
    pub schema_version: u32,
    pub campaign_id: i64,
    pub org_id: String,
}

impl CampaignJob {
    pub fn new(campaign_id: i64, org_id: impl Into<String>) -> Self {
        Self {
            schema_version: JOB_SCHEMA_VERSION,
            campaign_id,
            org_id: org_id.into(),
        }
    }

    pub fn to_payload(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to encode campaign job payload")
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone()).context("failed to decode campaign job payload")
    }
}
