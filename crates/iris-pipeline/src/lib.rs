//! Message pipeline for the Iris helpdesk.
//!
//! Three queue-driven workers move conversations through the system: the
//! inbound worker turns normalized webhook messages into customers, tickets,
//! messages, and notifications; the outbound worker delivers agent replies
//! through the channel connector and stamps the outcome on the stored
//! message; the campaign worker sends bulk batches and chains itself until
//! no recipients remain. [`HelpdeskServices`] is the operator surface that
//! feeds them.
//!
//! Every worker is an [`iris_queue::JobHandler`]; redelivery safety comes
//! from the store's uniqueness constraints and monotonic status stamps, not
//! from the queue delivering exactly once.

pub mod pipeline_campaign;
pub mod pipeline_inbound;
pub mod pipeline_jobs;
pub mod pipeline_outbound;
pub mod pipeline_services;

pub use pipeline_campaign::{CampaignWorker, CAMPAIGN_BATCH_DELAY_MS, CAMPAIGN_BATCH_SIZE};
pub use pipeline_inbound::InboundWorker;
pub use pipeline_jobs::{
    CampaignJob, InboundJob, OutboundJob, CAMPAIGN_JOB_KIND, CAMPAIGN_QUEUE, INBOUND_JOB_KIND,
    INBOUND_QUEUE, JOB_SCHEMA_VERSION, OUTBOUND_JOB_KIND, OUTBOUND_QUEUE,
};
pub use pipeline_outbound::OutboundWorker;
pub use pipeline_services::{CreatedChannel, HelpdeskServices};
