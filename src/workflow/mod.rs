//! Multi-step workflow orchestration
//!
//! Workflows and their steps:
//!
//! | Workflow             | Steps                                           |
//! |----------------------|-------------------------------------------------|
//! | `transaction-ingest` | persist → notify → analyze                      |
//! | `ocr-extract`        | extract → transform → [suggest-budget]          |
//! | `budget-suggest`     | validate → generate → parse                     |
//! | `chat-stream`        | retrieve-context → stream → persist             |
//!
//! Every external call inside a step goes through the injected
//! [`BreakerRegistry`], i.e. `CircuitBreaker(RetryExecutor(call))`.

mod budget;
mod chat;
mod ingest;
pub mod messages;
mod ocr;
pub mod parse;

pub use chat::ChatOutcome;
pub use ingest::IngestOutcome;
pub use messages::{
    BudgetRequest, BudgetSuggestion, ChatEvent, ChatEventKind, ChatRequest, IngestRequest, OcrOutcome,
    OcrRequest, WorkflowResponse,
};

use crate::bus::{publish_json, MessageBus};
use crate::clients::{CompletionRequest, CompletionService, OcrService};
use crate::config::{ServiceKey, Topics};
use crate::resilience::{BreakerRegistry, CallError};
use crate::signals::{AnomalyDetector, BudgetMonitor};
use crate::store::LedgerStore;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowName {
    TransactionIngest,
    OcrExtract,
    BudgetSuggest,
    ChatStream,
}

impl WorkflowName {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowName::TransactionIngest => "transaction-ingest",
            WorkflowName::OcrExtract => "ocr-extract",
            WorkflowName::BudgetSuggest => "budget-suggest",
            WorkflowName::ChatStream => "chat-stream",
        }
    }
}

impl fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Persist,
    Notify,
    Analyze,
    Extract,
    Transform,
    SuggestBudget,
    Validate,
    Generate,
    Parse,
    RetrieveContext,
    Stream,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Persist => "persist",
            Step::Notify => "notify",
            Step::Analyze => "analyze",
            Step::Extract => "extract",
            Step::Transform => "transform",
            Step::SuggestBudget => "suggest-budget",
            Step::Validate => "validate",
            Step::Generate => "generate",
            Step::Parse => "parse",
            Step::RetrieveContext => "retrieve-context",
            Step::Stream => "stream",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step failed; the remaining steps of that run were skipped
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStepError {
    pub correlation_id: String,
    pub workflow: WorkflowName,
    pub step: Step,
    pub completed_steps: Vec<Step>,
    pub error: CallError,
}

impl fmt::Display for WorkflowStepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let completed: Vec<&str> = self.completed_steps.iter().map(Step::as_str).collect();
        write!(
            f,
            "{} [{}] failed at {}: {} (completed: [{}])",
            self.workflow,
            self.correlation_id,
            self.step,
            self.error,
            completed.join(", ")
        )
    }
}

impl std::error::Error for WorkflowStepError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Bookkeeping for one in-flight request
#[derive(Debug)]
pub struct WorkflowRun {
    pub correlation_id: String,
    pub workflow: WorkflowName,
    pub completed_steps: Vec<Step>,
    pub status: RunStatus,
}

impl WorkflowRun {
    pub fn start(workflow: WorkflowName, correlation_id: Option<String>) -> Self {
        let correlation_id = correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        log::debug!("▶️  {} [{}] started", workflow, correlation_id);
        Self {
            correlation_id,
            workflow,
            completed_steps: Vec::new(),
            status: RunStatus::Running,
        }
    }

    /// Run one step. On failure the run is marked failed and the error
    /// carries everything completed so far.
    pub async fn step<T, Fut>(&mut self, step: Step, fut: Fut) -> Result<T, WorkflowStepError>
    where
        Fut: Future<Output = Result<T, CallError>>,
    {
        match fut.await {
            Ok(value) => {
                log::debug!("   ├─ {} [{}] {} ✓", self.workflow, self.correlation_id, step);
                self.completed_steps.push(step);
                Ok(value)
            }
            Err(error) => {
                self.status = RunStatus::Failed;
                Err(self.failure(step, error))
            }
        }
    }

    pub fn failure(&self, step: Step, error: CallError) -> WorkflowStepError {
        WorkflowStepError {
            correlation_id: self.correlation_id.clone(),
            workflow: self.workflow,
            step,
            completed_steps: self.completed_steps.clone(),
            error,
        }
    }

    pub fn finish(&mut self) {
        self.status = RunStatus::Succeeded;
        log::debug!(
            "   └─ {} [{}] completed {} steps",
            self.workflow,
            self.correlation_id,
            self.completed_steps.len()
        );
    }

    fn response(&self, outcome: Result<Value, &WorkflowStepError>) -> WorkflowResponse {
        match outcome {
            Ok(result) => WorkflowResponse {
                correlation_id: self.correlation_id.clone(),
                workflow: self.workflow,
                success: true,
                result: Some(result),
                error: None,
                failed_step: None,
                completed_steps: self.completed_steps.clone(),
            },
            Err(e) => WorkflowResponse {
                correlation_id: e.correlation_id.clone(),
                workflow: e.workflow,
                success: false,
                result: None,
                error: Some(e.error.to_string()),
                failed_step: Some(e.step),
                completed_steps: e.completed_steps.clone(),
            },
        }
    }
}

/// External collaborators the orchestrator calls
pub struct Collaborators {
    pub store: Arc<dyn LedgerStore>,
    pub completion: Arc<dyn CompletionService>,
    pub ocr: Arc<dyn OcrService>,
    pub bus: Arc<dyn MessageBus>,
}

/// Executes named workflows for inbound requests
///
/// Delivery is at-least-once and best effort. When a step fails the
/// remaining steps are skipped, but side effects of steps that already
/// completed (persisted rows, published messages) are **not** rolled back.
/// Callers that retry a failed request may therefore see duplicates of
/// whatever the completed steps produced.
///
/// At most `max_in_flight` runs execute at once; further requests wait for a
/// permit.
pub struct WorkflowOrchestrator {
    store: Arc<dyn LedgerStore>,
    completion: Arc<dyn CompletionService>,
    ocr: Arc<dyn OcrService>,
    bus: Arc<dyn MessageBus>,
    breakers: Arc<BreakerRegistry>,
    detector: AnomalyDetector,
    monitor: BudgetMonitor,
    topics: Topics,
    permits: Semaphore,
    max_in_flight: usize,
}

impl WorkflowOrchestrator {
    pub fn new(
        collaborators: Collaborators,
        breakers: Arc<BreakerRegistry>,
        topics: Topics,
        max_in_flight: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        log::info!("🧭 Workflow orchestrator ready");
        log::info!("   ├─ Max in-flight runs: {}", max_in_flight);
        log::info!("   └─ Response topics: {}, {}, {}", topics.chat_responses, topics.budget_responses, topics.ocr_responses);

        Self {
            detector: AnomalyDetector::new(collaborators.store.clone()),
            monitor: BudgetMonitor::new(collaborators.store.clone()),
            store: collaborators.store,
            completion: collaborators.completion,
            ocr: collaborators.ocr,
            bus: collaborators.bus,
            breakers,
            topics,
            permits: Semaphore::new(max_in_flight),
            max_in_flight,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Runs currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Route a bus request by topic. Every routed request produces exactly
    /// one terminal response (chat: a terminal [`ChatEvent`]).
    pub async fn handle_request(&self, topic: &str, payload: Value) {
        if topic == self.topics.chat_requests {
            match serde_json::from_value::<ChatRequest>(payload.clone()) {
                Ok(request) => self.handle_chat_request(request).await,
                Err(e) => self.reject(WorkflowName::ChatStream, Step::RetrieveContext, &payload, e).await,
            }
        } else if topic == self.topics.budget_requests {
            match serde_json::from_value::<BudgetRequest>(payload.clone()) {
                Ok(request) => {
                    let _ = self.suggest_budget(request).await;
                }
                Err(e) => self.reject(WorkflowName::BudgetSuggest, Step::Validate, &payload, e).await,
            }
        } else if topic == self.topics.ocr_requests {
            match serde_json::from_value::<OcrRequest>(payload.clone()) {
                Ok(request) => {
                    let _ = self.extract_document(request).await;
                }
                Err(e) => self.reject(WorkflowName::OcrExtract, Step::Extract, &payload, e).await,
            }
        } else if topic == self.topics.transactions {
            match serde_json::from_value::<IngestRequest>(payload) {
                Ok(request) => {
                    if let Err(e) = self.ingest_transaction(request).await {
                        log::error!("❌ {}", e);
                    }
                }
                Err(e) => log::warn!("⚠️  Dropping malformed ingest request: {}", e),
            }
        } else {
            log::debug!("Ignoring message on unrouted topic {}", topic);
        }
    }

    async fn handle_chat_request(&self, request: ChatRequest) {
        let (tx, mut rx) = mpsc::channel::<ChatEvent>(64);
        let forward = async {
            while let Some(event) = rx.recv().await {
                self.publish(&self.topics.chat_responses, &event).await;
            }
        };
        let run = async move {
            let _ = self.chat_stream(request, tx).await;
        };
        tokio::join!(run, forward);
    }

    async fn reject(&self, workflow: WorkflowName, step: Step, payload: &Value, error: serde_json::Error) {
        let correlation_id = payload
            .get("correlationId")
            .or_else(|| payload.get("correlation_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let run = WorkflowRun::start(workflow, correlation_id);
        let failure = run.failure(step, CallError::Validation(error.to_string()));
        log::warn!("⚠️  {}", failure);

        if workflow == WorkflowName::ChatStream {
            let event = ChatEvent::error(&run.correlation_id, failure.error.to_string());
            self.publish(&self.topics.chat_responses, &event).await;
        } else if let Some(topic) = self.response_topic(workflow) {
            let response = run.response(Err(&failure));
            self.publish(topic, &response).await;
        }
    }

    fn response_topic(&self, workflow: WorkflowName) -> Option<&str> {
        match workflow {
            WorkflowName::BudgetSuggest => Some(&self.topics.budget_responses),
            WorkflowName::OcrExtract => Some(&self.topics.ocr_responses),
            WorkflowName::ChatStream => Some(&self.topics.chat_responses),
            WorkflowName::TransactionIngest => None,
        }
    }

    /// Publish the terminal response for a request/response workflow
    async fn respond<T: Serialize>(&self, run: &WorkflowRun, outcome: &Result<T, WorkflowStepError>) {
        let topic = match self.response_topic(run.workflow) {
            Some(topic) => topic,
            None => return,
        };
        let response = match outcome {
            Ok(value) => run.response(Ok(serde_json::to_value(value).unwrap_or(Value::Null))),
            Err(e) => run.response(Err(e)),
        };
        self.publish(topic, &response).await;
    }

    /// Fire-and-forget publish; failures are logged
    async fn publish<M: Serialize + ?Sized>(&self, topic: &str, message: &M) {
        if let Err(e) = publish_json(self.bus.as_ref(), topic, message).await {
            log::error!("❌ Failed to publish on {}: {}", topic, e);
        }
    }

    /// Publish as part of a step; failures fail the step
    async fn publish_step<M: Serialize + ?Sized>(&self, topic: &str, message: &M) -> Result<(), CallError> {
        publish_json(self.bus.as_ref(), topic, message)
            .await
            .map_err(|e| CallError::Transient(e.to_string()))
    }

    async fn admit(&self) -> Option<SemaphorePermit<'_>> {
        match self.permits.acquire().await {
            Ok(permit) => Some(permit),
            Err(_) => None,
        }
    }

    /// Guarded store call
    async fn store_call<T, F, Fut>(&self, op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.breakers.call(ServiceKey::Store, op).await
    }

    /// Guarded one-shot completion
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CallError> {
        let completion = &self.completion;
        self.breakers
            .call(ServiceKey::Completion, move || async move { completion.complete(request).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tracks_completed_steps() {
        let mut run = WorkflowRun::start(WorkflowName::BudgetSuggest, Some("c-1".to_string()));
        run.step(Step::Validate, async { Ok::<_, CallError>(()) }).await.unwrap();
        let err = run
            .step(Step::Generate, async { Err::<(), _>(CallError::CircuitOpen(ServiceKey::Completion)) })
            .await
            .unwrap_err();

        assert_eq!(err.correlation_id, "c-1");
        assert_eq!(err.step, Step::Generate);
        assert_eq!(err.completed_steps, vec![Step::Validate]);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            err.to_string(),
            "budget-suggest [c-1] failed at generate: completion service temporarily unavailable (circuit open) (completed: [validate])"
        );
    }

    #[test]
    fn test_generated_correlation_id() {
        let run = WorkflowRun::start(WorkflowName::ChatStream, None);
        assert!(uuid::Uuid::parse_str(&run.correlation_id).is_ok());
        let blank = WorkflowRun::start(WorkflowName::ChatStream, Some("  ".to_string()));
        assert_ne!(blank.correlation_id.trim(), "");
    }

    #[test]
    fn test_failure_response_shape() {
        let mut run = WorkflowRun::start(WorkflowName::OcrExtract, Some("c-9".to_string()));
        run.completed_steps.push(Step::Extract);
        let failure = run.failure(Step::Transform, CallError::Transient("503".to_string()));
        let json = serde_json::to_value(run.response(Err(&failure))).unwrap();

        assert_eq!(json["correlationId"], "c-9");
        assert_eq!(json["workflow"], "ocr-extract");
        assert_eq!(json["success"], false);
        assert_eq!(json["failedStep"], "transform");
        assert_eq!(json["completedSteps"], serde_json::json!(["extract"]));
    }
}
