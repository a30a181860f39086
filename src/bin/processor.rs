//! Processor - host process for one owner's finance stream
//!
//! Wires the ledger, the gateway clients, the workflow orchestrator and the
//! real-time pipeline together:
//! - Requests are read from stdin as JSON lines: `{"topic": "...", "payload": {...}}`
//! - Every outbound bus message is written to stdout as a JSON line
//! - Without a bridge URL, persisted transactions and analytics updates are
//!   fed back into an in-process change feed so the pipeline sees them.
//!   Notifications are not fed back; the pipeline derives its own.
//!
//! Usage:
//!   cargo run --release --bin processor < requests.jsonl
//!
//! Environment variables:
//!   SPENDSTREAM_OWNER_ID - Owner whose events the pipeline follows (required)
//!   SPENDSTREAM_COMPLETION_URL, SPENDSTREAM_OCR_URL - Gateway endpoints (required)
//!   See `CoreConfig::from_env` for the rest.

use dotenv::dotenv;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use spendstream::bus::{BusMessage, ChannelBus};
use spendstream::clients::{GatewayCompletionClient, GatewayOcrClient};
use spendstream::stream::{ChangeFeed, ChangeRecord, ChangeTable, MemoryChangeFeed};
use spendstream::{
    BreakerRegistry, Collaborators, CoreConfig, EventSourceAdapter, FinancePipeline, LedgerStore,
    SqliteLedgerStore, Topics, WorkflowOrchestrator,
};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const BUS_BUFFER: usize = 1024;

#[derive(Debug, Deserialize)]
struct InboundRequest {
    topic: String,
    payload: Value,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = CoreConfig::from_env()?;
    let owner_id = env::var("SPENDSTREAM_OWNER_ID").map_err(|_| "SPENDSTREAM_OWNER_ID is required")?;
    let completion_url = config
        .completion_url
        .clone()
        .ok_or("SPENDSTREAM_COMPLETION_URL is required")?;
    let ocr_url = config.ocr_url.clone().ok_or("SPENDSTREAM_OCR_URL is required")?;

    info!("🚀 spendstream processor");
    info!("   ├─ Owner: {}", owner_id);
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Transport: {}", config.bridge_url.as_deref().unwrap_or("in-process change feed"));
    info!("   └─ Max in-flight workflows: {}", config.max_in_flight);

    let store: Arc<dyn LedgerStore> = Arc::new(SqliteLedgerStore::open(&config.db_path)?);
    let breakers = Arc::new(BreakerRegistry::new(&config.resilience));
    let (bus, bus_rx) = ChannelBus::new(BUS_BUFFER);

    let orchestrator = Arc::new(WorkflowOrchestrator::new(
        Collaborators {
            store: store.clone(),
            completion: Arc::new(GatewayCompletionClient::new(completion_url, config.api_key.clone())?),
            ocr: Arc::new(GatewayOcrClient::new(ocr_url, config.api_key.clone())?),
            bus: Arc::new(bus),
        },
        breakers,
        config.topics.clone(),
        config.max_in_flight,
    ));

    let feed = Arc::new(MemoryChangeFeed::default());
    let adapter = match &config.bridge_url {
        Some(url) => EventSourceAdapter::bridged(owner_id.as_str(), url.as_str())?,
        None => EventSourceAdapter::direct(owner_id.as_str(), feed.clone() as Arc<dyn ChangeFeed>),
    };
    let loopback = config.bridge_url.is_none().then(|| feed.clone());
    let bus_task = tokio::spawn(drain_bus(bus_rx, config.topics.clone(), loopback));

    let mut pipeline = FinancePipeline::new(adapter, store);
    pipeline.add_anomaly_listener(|result| {
        warn!("🚨 {:?} anomaly: {}", result.severity, result.reason);
    });
    pipeline.add_budget_alert_listener(|alert| {
        warn!("💰 {}", alert.message());
    });
    pipeline.add_notification_listener(|n| {
        info!("🔔 {}: {}", n.title, n.message);
    });
    pipeline.start().await?;

    let (request_tx, mut request_rx) = mpsc::channel::<InboundRequest>(BUS_BUFFER);
    tokio::spawn(read_requests(request_tx));

    loop {
        tokio::select! {
            request = request_rx.recv() => {
                let request = match request {
                    Some(request) => request,
                    None => {
                        info!("📭 Request input closed");
                        break;
                    }
                };
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.handle_request(&request.topic, request.payload).await;
                });
            }

            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Ctrl-C received, shutting down");
                break;
            }
        }
    }

    if let Some(stats) = pipeline.shutdown().await {
        info!("📊 Final: {} events | {} anomalies | {} budget alerts", stats.events, stats.anomalies, stats.budget_alerts);
    }
    drop(orchestrator);
    bus_task.abort();

    info!("✅ Processor stopped");
    Ok(())
}

/// One JSON request per stdin line
async fn read_requests(tx: mpsc::Sender<InboundRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<InboundRequest>(&line) {
                Ok(request) => {
                    if tx.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("⚠️  Skipping malformed request line: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                error!("❌ Failed to read stdin: {}", e);
                break;
            }
        }
    }
}

/// Print every bus message and, for the in-process transport, replay
/// persisted rows into the change feed
async fn drain_bus(
    mut rx: mpsc::Receiver<BusMessage>,
    topics: Topics,
    loopback: Option<Arc<MemoryChangeFeed>>,
) {
    while let Some(message) = rx.recv().await {
        match serde_json::to_string(&serde_json::json!({"topic": &message.topic, "payload": &message.payload})) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("❌ Failed to encode bus message: {}", e),
        }

        let feed = match &loopback {
            Some(feed) => feed,
            None => continue,
        };
        let table = if message.topic == topics.transactions {
            ChangeTable::Transactions
        } else if message.topic == topics.analytics {
            ChangeTable::Analytics
        } else {
            continue;
        };
        let owner = message.payload.get("user_id").and_then(Value::as_str).map(str::to_string);
        if let Some(owner) = owner {
            feed.publish(&owner, ChangeRecord::insert(table, message.payload)).await;
        }
    }
}
