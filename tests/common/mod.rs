//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use spendstream::bus::{BusMessage, ChannelBus};
use spendstream::clients::{CompletionRequest, CompletionService, OcrService};
use spendstream::{
    BreakerRegistry, CallError, Category, Collaborators, LedgerStore, SqliteLedgerStore, Topics,
    TransactionDraft, WorkflowOrchestrator,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Completion service that replays scripted replies
#[derive(Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String, CallError>>>,
    chunks: Vec<String>,
    stream_failure: Option<CallError>,
    delay: Duration,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn replying(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
            ..Default::default()
        }
    }

    pub fn streaming(chunks: &[&str], failure: Option<CallError>) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            stream_failure: failure,
            ..Default::default()
        }
    }

    /// Hold every `complete` call open for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most `complete` calls seen running at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CallError::Permanent("no scripted reply".to_string())))
    }

    async fn stream(&self, request: &CompletionRequest, chunks: mpsc::Sender<String>) -> Result<(), CallError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        for chunk in &self.chunks {
            chunks.send(chunk.clone()).await.map_err(|_| CallError::Cancelled)?;
        }
        match &self.stream_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// OCR service with a fixed outcome
pub struct FixedOcr {
    outcome: Result<Option<String>, CallError>,
    pub calls: AtomicUsize,
}

impl FixedOcr {
    pub fn text(text: &str) -> Self {
        Self {
            outcome: Ok(Some(text.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: CallError) -> Self {
        Self {
            outcome: Err(err),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrService for FixedOcr {
    async fn extract_text(&self, _document_url: &str) -> Result<Option<String>, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

pub struct Harness {
    pub store: Arc<dyn LedgerStore>,
    pub completion: Arc<ScriptedCompletion>,
    pub ocr: Arc<FixedOcr>,
    pub orchestrator: WorkflowOrchestrator,
    pub bus_rx: mpsc::Receiver<BusMessage>,
}

impl Harness {
    pub fn new(completion: ScriptedCompletion, ocr: FixedOcr) -> Self {
        Self::with_max_in_flight(completion, ocr, 4)
    }

    pub fn with_max_in_flight(completion: ScriptedCompletion, ocr: FixedOcr, max_in_flight: usize) -> Self {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
        let completion = Arc::new(completion);
        let ocr = Arc::new(ocr);
        let (bus, bus_rx) = ChannelBus::new(256);

        let orchestrator = WorkflowOrchestrator::new(
            Collaborators {
                store: store.clone(),
                completion: completion.clone(),
                ocr: ocr.clone(),
                bus: Arc::new(bus),
            },
            Arc::new(BreakerRegistry::default()),
            Topics::default(),
            max_in_flight,
        );

        Self {
            store,
            completion,
            ocr,
            orchestrator,
            bus_rx,
        }
    }

    /// Everything published so far
    pub fn published(&mut self) -> Vec<BusMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.bus_rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn draft(amount: f64, category: Category, on: NaiveDate) -> TransactionDraft {
    TransactionDraft {
        amount,
        category,
        date: on,
        merchant: Some("Test Merchant".to_string()),
        description: None,
    }
}

/// Poll `condition` until it holds or about a second has passed
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
