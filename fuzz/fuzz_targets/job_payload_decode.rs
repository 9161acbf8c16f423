#![no_main]

use iris_pipeline::{CampaignJob, InboundJob, OutboundJob};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    match InboundJob::from_payload(&payload) {
        Ok(job) => assert!(job.to_payload().is_ok()),
        Err(error) => assert!(error.to_string().contains("inbound job")),
    }
    match OutboundJob::from_payload(&payload) {
        Ok(job) => assert!(job.to_payload().is_ok()),
        Err(error) => assert!(error.to_string().contains("outbound job")),
    }
    match CampaignJob::from_payload(&payload) {
        Ok(job) => assert!(job.to_payload().is_ok()),
        Err(error) => assert!(error.to_string().contains("campaign job")),
    }
});
