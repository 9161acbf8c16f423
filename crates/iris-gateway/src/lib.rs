//! HTTP ingress for the Iris helpdesk.
//!
//! Receives provider webhooks, authenticates them against each channel's
//! stored credentials, and hands normalized events to the durable inbound
//! queue. The gateway never touches tickets directly; a 200 here means
//! "accepted for processing", nothing more.

pub mod gateway_server;

pub use gateway_server::{
    build_gateway_router, run_gateway_server, GatewayState, HEALTHZ_ROUTE, WEBHOOK_ROUTE,
};
