//! SNS/SQS host integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_sns_sqs --features sns-sqs -- --ignored --nocapture
//!
//! Uses LocalStack to emulate SNS and SQS. Tests share a single container
//! to avoid rootless port conflicts; Docker is required, so the tests are
//! ignored by default.

use std::sync::Arc;
use std::time::Duration;

use courier::bus::{consumer_fn, ConsumeContext, Consumer};
use courier::transport::registry::{TransportHostProvider, TransportRegistry};
use courier::transport::settings::{SnsSqsSettings, TransportSettings};
use courier::{Bus, Message};
use serde::{Deserialize, Serialize};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IssueInvoice {
    customer: String,
    amount_cents: u64,
}

impl Message for IssueInvoice {
    const MESSAGE_TYPE: &'static str = "billing.issue-invoice";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InvoiceIssued {
    customer: String,
}

impl Message for InvoiceIssued {
    const MESSAGE_TYPE: &'static str = "billing.invoice-issued";
}

/// Shared LocalStack container and endpoint URL.
static LOCALSTACK: OnceCell<(ContainerAsync<GenericImage>, String)> = OnceCell::const_new();

/// Get the shared LocalStack endpoint, starting the container if needed.
async fn localstack_endpoint() -> String {
    let (_, endpoint) = LOCALSTACK
        .get_or_init(|| async { start_localstack().await })
        .await;
    endpoint.clone()
}

async fn start_localstack() -> (ContainerAsync<GenericImage>, String) {
    println!("Starting shared LocalStack container...");
    let image = GenericImage::new("localstack/localstack", "latest")
        .with_exposed_port(4566.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready."));

    let container = image
        .with_env_var("SERVICES", "sns,sqs")
        .with_env_var("AWS_DEFAULT_REGION", "us-east-1")
        .with_env_var("EAGER_SERVICE_LOADING", "1")
        .with_env_var("DISABLE_EVENTS", "1")
        .with_env_var("SKIP_INFRA_DOWNLOADS", "1")
        .with_env_var("LOCALSTACK_HOST", "localhost")
        .with_startup_timeout(Duration::from_secs(180))
        .start()
        .await
        .expect("Failed to start localstack container");

    // SNS/SQS need extra time after the ready banner
    tokio::time::sleep(Duration::from_secs(5)).await;

    let host_port = container
        .get_host_port_ipv4(4566)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let endpoint_url = format!("http://{}:{}", host, host_port);
    println!("LocalStack (SNS/SQS) available at: {}", endpoint_url);
    (container, endpoint_url)
}

async fn aws_hosts() -> Arc<TransportHostProvider> {
    let endpoint = localstack_endpoint().await;
    // LocalStack accepts any static credentials.
    std::env::set_var("AWS_ACCESS_KEY_ID", "test");
    std::env::set_var("AWS_SECRET_ACCESS_KEY", "test");

    let settings = TransportSettings::SnsSqs(SnsSqsSettings {
        address: "sqs://local".to_string(),
        region: Some("us-east-1".to_string()),
        endpoint_url: Some(endpoint),
        topic_prefix: Some(format!("t{}", uuid::Uuid::new_v4().simple())),
        wait_time_secs: 1,
        ..SnsSqsSettings::default()
    });
    let hosts = TransportHostProvider::from_settings(&TransportRegistry::with_builtin(), &[settings])
        .await
        .expect("Failed to create SNS/SQS host");
    Arc::new(hosts)
}

fn queue(name: &str) -> Url {
    Url::parse(&format!("sqs://local/{}-{}", name, uuid::Uuid::new_v4().simple()))
        .expect("valid url")
}

fn forwarding<M: Message + Clone>() -> (impl Consumer<M>, UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let consumer = consumer_fn(move |context: ConsumeContext<M>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(context.into_message());
            Ok(())
        }
    });
    (consumer, rx)
}

async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(20), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_send_and_consume() {
    println!("=== SQS Send and Consume Test ===");
    let hosts = aws_hosts().await;
    let input = queue("billing");

    let (consumer, mut rx) = forwarding::<IssueInvoice>();
    let bus = Bus::builder(queue("billing-service"), hosts)
        .endpoint(input.clone(), |e| {
            e.consumer::<IssueInvoice, _>(consumer);
        })
        .build()
        .await
        .expect("Failed to build bus");
    bus.start().await.expect("Failed to start bus");

    let command = IssueInvoice {
        customer: "acme".to_string(),
        amount_cents: 12_500,
    };
    bus.send(&input, &command, &CancellationToken::new())
        .await
        .expect("Failed to send");

    assert_eq!(recv(&mut rx).await, Some(command));
    bus.stop().await.expect("Failed to stop bus");
    println!("=== SQS Send and Consume Test PASSED ===");
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_sns_fan_out_to_subscribed_queues() {
    println!("=== SNS Fan-out Test ===");
    let hosts = aws_hosts().await;

    let (ledger, mut ledger_rx) = forwarding::<InvoiceIssued>();
    let (mailer, mut mailer_rx) = forwarding::<InvoiceIssued>();
    let bus = Bus::builder(queue("billing-service"), hosts)
        .endpoint(queue("ledger"), |e| {
            e.consumer::<InvoiceIssued, _>(ledger);
        })
        .endpoint(queue("mailer"), |e| {
            e.consumer::<InvoiceIssued, _>(mailer);
        })
        .build()
        .await
        .expect("Failed to build bus");
    bus.start().await.expect("Failed to start bus");

    let event = InvoiceIssued {
        customer: "acme".to_string(),
    };
    bus.publish(&event, &CancellationToken::new())
        .await
        .expect("Failed to publish");

    assert_eq!(recv(&mut ledger_rx).await, Some(event.clone()));
    assert_eq!(recv(&mut mailer_rx).await, Some(event));
    bus.stop().await.expect("Failed to stop bus");
    println!("=== SNS Fan-out Test PASSED ===");
}
