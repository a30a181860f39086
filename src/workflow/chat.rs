//! chat-stream: retrieve-context → stream → persist

use super::{ChatEvent, ChatRequest, Step, WorkflowName, WorkflowOrchestrator, WorkflowRun, WorkflowStepError};
use crate::clients::CompletionRequest;
use crate::config::ServiceKey;
use crate::resilience::CallError;
use crate::store::{ChatRole, StoreError};
use crate::types::{Budget, Transaction};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

const CONTEXT_TRANSACTIONS: usize = 50;
const CONTEXT_MESSAGES: usize = 20;
const CHUNK_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatOutcome {
    pub correlation_id: String,
    pub reply: String,
    pub chunks: usize,
}

/// Owner data the assistant answers from
struct ChatContext {
    income: f64,
    budget: Option<Budget>,
    transactions: Vec<Transaction>,
}

impl WorkflowOrchestrator {
    /// Stream an assistant reply into `sink`
    ///
    /// The sink receives zero or more chunk events followed by exactly one
    /// terminal event (`done` or `error`). If the sink is closed the run is
    /// cancelled and no terminal event is sent.
    ///
    /// A transient failure before any chunk was forwarded is retried. Once
    /// output has reached the caller a retry would repeat it, so the failure
    /// is surfaced as a dependency error instead.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<ChatEvent>,
    ) -> Result<ChatOutcome, WorkflowStepError> {
        let mut run = WorkflowRun::start(WorkflowName::ChatStream, request.correlation_id.clone());
        let outcome = self.run_chat(&mut run, &request, &sink).await;

        match &outcome {
            Ok(o) => {
                log::debug!("💬 Chat [{}] streamed {} chunks", o.correlation_id, o.chunks);
                let _ = sink.send(ChatEvent::done(&run.correlation_id)).await;
            }
            Err(e) if e.error == CallError::Cancelled => {
                log::info!("💬 Chat [{}] cancelled by caller", e.correlation_id);
            }
            Err(e) => {
                log::warn!("⚠️  {}", e);
                let _ = sink.send(ChatEvent::error(&run.correlation_id, e.error.to_string())).await;
            }
        }
        outcome
    }

    async fn run_chat(
        &self,
        run: &mut WorkflowRun,
        request: &ChatRequest,
        sink: &mpsc::Sender<ChatEvent>,
    ) -> Result<ChatOutcome, WorkflowStepError> {
        let _permit = match self.admit().await {
            Some(permit) => permit,
            None => return Err(run.failure(Step::RetrieveContext, CallError::Cancelled)),
        };
        let correlation_id = run.correlation_id.clone();

        let completion_request = run.step(Step::RetrieveContext, self.retrieve_context(request)).await?;
        let chunks = AtomicUsize::new(0);
        let reply = run
            .step(Step::Stream, self.stream_reply(&correlation_id, &completion_request, sink, &chunks))
            .await?;
        run.step(Step::Persist, self.persist_exchange(&request.owner_id, &request.message, &reply))
            .await?;
        run.finish();

        Ok(ChatOutcome {
            correlation_id,
            reply,
            chunks: chunks.load(Ordering::SeqCst),
        })
    }

    async fn retrieve_context(&self, request: &ChatRequest) -> Result<CompletionRequest, CallError> {
        if request.owner_id.trim().is_empty() {
            return Err(CallError::Validation("userId is required".to_string()));
        }
        if request.message.trim().is_empty() {
            return Err(CallError::Validation("message is required".to_string()));
        }

        let store = &self.store;
        let owner_id = request.owner_id.as_str();
        let (context, history) = self
            .store_call(move || async move {
                let load = async {
                    let context = ChatContext {
                        income: store.total_income(owner_id).await?,
                        budget: store.active_budget(owner_id).await?,
                        transactions: store.latest_transactions(owner_id, CONTEXT_TRANSACTIONS).await?,
                    };
                    let history = store.recent_chat(owner_id, CONTEXT_MESSAGES).await?;
                    Ok::<_, StoreError>((context, history))
                };
                load.await.map_err(CallError::from)
            })
            .await?;

        Ok(CompletionRequest {
            prompt: chat_prompt(&context, &request.message),
            history,
        })
    }

    /// Guarded streaming call; returns the full reply text
    async fn stream_reply(
        &self,
        correlation_id: &str,
        request: &CompletionRequest,
        sink: &mpsc::Sender<ChatEvent>,
        forwarded: &AtomicUsize,
    ) -> Result<String, CallError> {
        let completion = &self.completion;

        self.breakers
            .call(ServiceKey::Completion, move || async move {
                let (tx, mut rx) = mpsc::channel::<String>(CHUNK_BUFFER);
                let produce = completion.stream(request, tx);
                let forward = async move {
                    let mut reply = String::new();
                    while let Some(chunk) = rx.recv().await {
                        reply.push_str(&chunk);
                        if sink.send(ChatEvent::chunk(correlation_id, chunk)).await.is_err() {
                            return Err(CallError::Cancelled);
                        }
                        forwarded.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(reply)
                };

                let (produced, reply) = tokio::join!(produce, forward);
                let reply = reply?;
                match produced {
                    Ok(()) => Ok(reply),
                    Err(CallError::Transient(msg)) if forwarded.load(Ordering::SeqCst) > 0 => {
                        Err(CallError::Permanent(format!("stream interrupted after output: {}", msg)))
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    async fn persist_exchange(&self, owner_id: &str, message: &str, reply: &str) -> Result<(), CallError> {
        let store = &self.store;
        for (role, text) in [(ChatRole::User, message), (ChatRole::Model, reply)] {
            self.store_call(move || async move { store.append_chat(owner_id, role, text).await.map_err(CallError::from) })
                .await?;
        }
        Ok(())
    }
}

fn chat_prompt(context: &ChatContext, message: &str) -> String {
    let mut prompt = String::from(
        "You are a personal finance assistant. Answer using the user's data below. Amounts are in rupees.\n\n",
    );
    let _ = writeln!(prompt, "Total income: ₹{:.2}", context.income);

    match &context.budget {
        Some(budget) => {
            let _ = writeln!(prompt, "Active {} budget:", budget.period.as_str());
            for (category, amount) in budget.allocations.iter().filter(|(_, a)| **a > 0.0) {
                let _ = writeln!(prompt, "- {}: ₹{:.2}", category.as_str(), amount);
            }
        }
        None => prompt.push_str("No active budget.\n"),
    }

    if context.transactions.is_empty() {
        prompt.push_str("No recorded transactions.\n");
    } else {
        let _ = writeln!(prompt, "Recent transactions (newest first):");
        for t in &context.transactions {
            let _ = writeln!(
                prompt,
                "- {} {} ₹{:.2} {}",
                t.date.format("%Y-%m-%d"),
                t.category.as_str(),
                t.amount,
                t.merchant.as_deref().unwrap_or("")
            );
        }
    }

    let _ = write!(prompt, "\nUser question: {}", message.trim());
    prompt
}
