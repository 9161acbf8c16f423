//! End-to-end flows driven only through public surfaces: the HTTP gateway,
//! the durable queues, and the operator services. Workers run with the
//! drain-until-idle harness so retry and batch delays collapse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use iris_connectors::{ChannelProvider, ConnectorRegistry, SignatureEnforcement};
use iris_gateway::{build_gateway_router, GatewayState};
use iris_pipeline::{
    CampaignWorker, HelpdeskServices, InboundWorker, OutboundWorker, CAMPAIGN_QUEUE,
    INBOUND_QUEUE, OUTBOUND_QUEUE,
};
use iris_queue::{run_queue_until_idle, JobQueue};
use iris_store::{CampaignStatus, HelpdeskStore, MessageDirection, NotificationKind, TicketStatus};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Deployment {
    _dir: TempDir,
    store: Arc<HelpdeskStore>,
    queue: Arc<JobQueue>,
    registry: Arc<ConnectorRegistry>,
    services: HelpdeskServices,
}

fn deployment() -> Deployment {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(HelpdeskStore::new(dir.path().join("helpdesk.sqlite3")));
    let queue = Arc::new(JobQueue::new(dir.path().join("jobs.sqlite3")));
    let registry = Arc::new(ConnectorRegistry::new());
    let services = HelpdeskServices::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&registry),
        "https://iris.example",
    );
    Deployment {
        _dir: dir,
        store,
        queue,
        registry,
        services,
    }
}

async fn spawn_gateway(deployment: &Deployment) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let state = Arc::new(GatewayState::new(
        Arc::clone(&deployment.store),
        Arc::clone(&deployment.queue),
        Arc::clone(&deployment.registry),
        SignatureEnforcement::Strict,
    ));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let addr = listener.local_addr().expect("resolve listener addr");
    let app = build_gateway_router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, handle)
}

#[tokio::test]
async fn functional_webhook_becomes_ticket_and_agent_reply_is_delivered() {
    let deployment = deployment();
    let channel = deployment
        .services
        .create_channel("org-1", ChannelProvider::Mock, "Support line", &json!({}))
        .await
        .expect("channel");
    let (addr, gateway) = spawn_gateway(&deployment).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/webhook/{}", channel.channel.id))
        .json(&json!({
            "senderPhone": "+15550001",
            "senderName": "Dana",
            "message": "My order is late"
        }))
        .send()
        .await
        .expect("post webhook");
    assert_eq!(response.status().as_u16(), 200);

    let inbound_worker = InboundWorker::new(Arc::clone(&deployment.store));
    let inbound_deliveries =
        run_queue_until_idle(&deployment.queue, INBOUND_QUEUE, &inbound_worker)
            .await
            .expect("drain inbound");
    assert_eq!(inbound_deliveries, 1);

    let customers = deployment.store.list_customers("org-1").expect("customers");
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].display_name, "Dana");
    let (ticket, created) = deployment
        .store
        .find_or_create_ticket(
            "org-1",
            channel.channel.id,
            customers[0].id,
            "mock-thread-+15550001",
            "unused",
        )
        .expect("ticket lookup");
    assert!(!created, "the inbound worker must have created the ticket");
    assert_eq!(ticket.status, TicketStatus::Open);
    assert_eq!(ticket.subject, "Message from Dana");

    let notifications = deployment
        .services
        .list_notifications("org-1", 10)
        .expect("notifications");
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::NewMessage);

    let reply = deployment
        .services
        .create_agent_reply("org-1", ticket.id, "We are on it, Dana.", "Agent Sam")
        .expect("agent reply");
    let outbound_worker = OutboundWorker::new(
        Arc::clone(&deployment.store),
        Arc::clone(&deployment.registry),
    );
    let outbound_deliveries =
        run_queue_until_idle(&deployment.queue, OUTBOUND_QUEUE, &outbound_worker)
            .await
            .expect("drain outbound");
    assert_eq!(outbound_deliveries, 1);

    let sent = deployment.registry.mock().expect("mock").sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "+15550001");
    assert_eq!(sent[0].content, "We are on it, Dana.");
    assert_eq!(sent[0].sender_name, "Agent Sam");

    let delivered = deployment.store.get_message(reply.id).expect("message");
    assert_eq!(delivered.direction, MessageDirection::Outbound);
    assert!(delivered.sent_at_unix_ms.is_some());
    assert!(delivered
        .external_message_id
        .as_deref()
        .is_some_and(|id| id.starts_with("mock-msg-")));
    gateway.abort();
}

#[tokio::test]
async fn functional_replayed_webhook_never_duplicates_customer_or_ticket() {
    let deployment = deployment();
    let channel = deployment
        .services
        .create_channel("org-1", ChannelProvider::Mock, "Support line", &json!({}))
        .await
        .expect("channel");
    let (addr, gateway) = spawn_gateway(&deployment).await;

    let body = json!({
        "senderPhone": "+15550002",
        "senderName": "Pat",
        "message": "hello?",
        "messageId": "mock-replayed-1"
    });
    for _ in 0..2 {
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/{}", channel.channel.id))
            .json(&body)
            .send()
            .await
            .expect("post webhook");
        assert_eq!(response.status().as_u16(), 200);
    }

    let inbound_worker = InboundWorker::new(Arc::clone(&deployment.store));
    let deliveries = run_queue_until_idle(&deployment.queue, INBOUND_QUEUE, &inbound_worker)
        .await
        .expect("drain inbound");
    assert_eq!(deliveries, 2);

    // Customer and ticket collapse onto one row each; the replayed message
    // itself appends twice, which is the documented at-least-once tradeoff.
    let customers = deployment.store.list_customers("org-1").expect("customers");
    assert_eq!(customers.len(), 1);
    let (ticket, created) = deployment
        .store
        .find_or_create_ticket(
            "org-1",
            channel.channel.id,
            customers[0].id,
            "mock-thread-+15550002",
            "unused",
        )
        .expect("ticket lookup");
    assert!(!created);
    assert_eq!(
        deployment
            .store
            .list_messages(ticket.id)
            .expect("messages")
            .len(),
        2
    );
    gateway.abort();
}

#[tokio::test]
async fn functional_campaign_runs_to_completion_through_operator_services() {
    let deployment = deployment();
    let channel = deployment
        .services
        .create_channel("org-1", ChannelProvider::Mock, "Promo line", &json!({}))
        .await
        .expect("channel");

    let campaign = deployment
        .services
        .create_campaign("org-1", channel.channel.id, "Spring promo", "Big sale!")
        .expect("campaign");
    let contacts: Vec<String> = (1..=12).map(|n| format!("+14165550{n:03}")).collect();
    let added = deployment
        .services
        .add_recipients(campaign.id, &contacts)
        .expect("recipients");
    assert_eq!(added, 12);
    deployment
        .services
        .start_campaign(campaign.id)
        .expect("start");

    let campaign_worker = CampaignWorker::new(
        Arc::clone(&deployment.store),
        Arc::clone(&deployment.queue),
        Arc::clone(&deployment.registry),
    )
    .with_recipient_delay_ms(0);
    let deliveries = run_queue_until_idle(&deployment.queue, CAMPAIGN_QUEUE, &campaign_worker)
        .await
        .expect("drain campaigns");
    // 12 recipients at batch size 10 means one full batch plus the remainder.
    assert_eq!(deliveries, 2);

    let stats = deployment
        .services
        .campaign_stats(campaign.id)
        .expect("stats");
    assert_eq!(stats.sent, 12);
    assert_eq!(stats.pending, 0);
    assert_eq!(
        deployment
            .store
            .get_campaign(campaign.id)
            .expect("campaign")
            .status,
        CampaignStatus::Completed
    );
    assert_eq!(
        deployment.registry.mock().expect("mock").sent_messages().len(),
        12
    );
}
