//! ocr-extract: extract → transform → [suggest-budget]

use super::parse::{parse_budget_suggestion, parse_document_kind, parse_transaction_drafts, DocumentKind};
use super::{OcrOutcome, OcrRequest, Step, WorkflowName, WorkflowOrchestrator, WorkflowRun, WorkflowStepError};
use crate::clients::CompletionRequest;
use crate::config::ServiceKey;
use crate::resilience::CallError;
use crate::types::{BudgetDraft, BudgetPeriod, Category, Notification, NotificationKind};
use chrono::{NaiveDate, Utc};

const NO_TEXT: &str = "No text extracted from document";
const UNSUPPORTED: &str = "This app can only extract transactions from receipts or bank statements. \
                           For other documents, it can only help with budgeting.";

impl WorkflowOrchestrator {
    /// Turn an uploaded document into transactions, then suggest a first
    /// budget if the owner has income on record but no active budget.
    ///
    /// Documents classified as neither receipt nor bank statement complete
    /// successfully with zero transactions and an informational notification.
    pub async fn extract_document(&self, request: OcrRequest) -> Result<OcrOutcome, WorkflowStepError> {
        let mut run = WorkflowRun::start(WorkflowName::OcrExtract, request.correlation_id.clone());
        let outcome = self.run_ocr_extract(&mut run, &request).await;

        match &outcome {
            Ok(o) => log::info!(
                "📄 Document {} processed: {} transactions{}",
                o.document_id,
                o.transaction_count,
                o.skipped.as_deref().map(|s| format!(" (skipped: {})", s)).unwrap_or_default()
            ),
            Err(e) => log::warn!("⚠️  {}", e),
        }
        self.respond(&run, &outcome).await;
        outcome
    }

    async fn run_ocr_extract(&self, run: &mut WorkflowRun, request: &OcrRequest) -> Result<OcrOutcome, WorkflowStepError> {
        let _permit = match self.admit().await {
            Some(permit) => permit,
            None => return Err(run.failure(Step::Extract, CallError::Cancelled)),
        };

        let text = run.step(Step::Extract, self.extract_text(request)).await?;
        let (transaction_count, skipped) = run.step(Step::Transform, self.transform_text(request, &text)).await?;
        let suggested_budget_id = run
            .step(Step::SuggestBudget, self.suggest_initial_budget(&request.owner_id))
            .await?;
        run.finish();

        Ok(OcrOutcome {
            document_id: request.document_id.clone(),
            transaction_count,
            skipped,
            suggested_budget_id,
        })
    }

    async fn extract_text(&self, request: &OcrRequest) -> Result<String, CallError> {
        for (name, value) in [
            ("userId", &request.owner_id),
            ("documentId", &request.document_id),
            ("fileUrl", &request.file_url),
        ] {
            if value.trim().is_empty() {
                return Err(CallError::Validation(format!("{} is required", name)));
            }
        }

        let ocr = &self.ocr;
        let url = request.file_url.as_str();
        let text = self
            .breakers
            .call(ServiceKey::Ocr, move || async move { ocr.extract_text(url).await })
            .await?
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CallError::Permanent(NO_TEXT.to_string()))?;

        let store = &self.store;
        let owner_id = request.owner_id.as_str();
        let document_id = request.document_id.as_str();
        let stored = text.as_str();
        self.store_call(move || async move {
            store
                .mark_document_processed(owner_id, document_id, stored)
                .await
                .map_err(CallError::from)
        })
        .await?;

        Ok(text)
    }

    /// Classify, parse and persist. Returns the inserted count and a skip
    /// reason for unsupported documents.
    async fn transform_text(&self, request: &OcrRequest, text: &str) -> Result<(usize, Option<String>), CallError> {
        let kind = parse_document_kind(&self.complete(&CompletionRequest::prompt(classify_prompt(text))).await?);
        if !kind.is_supported() {
            let notice = Notification::new(request.owner_id.as_str(), NotificationKind::SystemAlert, UNSUPPORTED);
            self.publish_step(&self.topics.notifications, &notice).await?;
            return Ok((0, Some("unsupported_document".to_string())));
        }

        let today = Utc::now().date_naive();
        let parsed = self
            .complete(&CompletionRequest::prompt(extract_prompt(kind, text, today)))
            .await?;
        let drafts = parse_transaction_drafts(&parsed, today);

        let store = &self.store;
        let owner_id = request.owner_id.as_str();
        let document_id = Some(request.document_id.as_str());
        let drafts = drafts.as_slice();
        let inserted = self
            .store_call(move || async move {
                store
                    .insert_transactions(owner_id, drafts, document_id)
                    .await
                    .map_err(CallError::from)
            })
            .await?;

        // Extracted rows get the same signals and analytics as ingested ones
        for transaction in &inserted {
            self.publish_step(&self.topics.transactions, transaction).await?;
            self.notify_signals(transaction).await?;
            self.record_analytics(transaction).await?;
        }

        let ready = Notification::new(
            request.owner_id.as_str(),
            NotificationKind::DocumentReady,
            format!("Extracted {} transactions from your document", inserted.len()),
        );
        self.publish_step(&self.topics.notifications, &ready).await?;

        Ok((inserted.len(), None))
    }

    /// Activated budget id, or `None` when no suggestion was needed
    async fn suggest_initial_budget(&self, owner_id: &str) -> Result<Option<String>, CallError> {
        let store = &self.store;
        let (income, active) = self
            .store_call(move || async move {
                let income = store.total_income(owner_id).await.map_err(CallError::from)?;
                let active = store.active_budget(owner_id).await.map_err(CallError::from)?;
                Ok::<_, CallError>((income, active))
            })
            .await?;

        if income <= 0.0 || active.is_some() {
            log::debug!("   ├─ No budget suggestion for {} (income: {:.2}, active budget: {})", owner_id, income, active.is_some());
            return Ok(None);
        }

        let text = self.generate_budget_text(owner_id, income, BudgetPeriod::Monthly).await?;
        let allocations = parse_budget_suggestion(&text)?;
        let draft = BudgetDraft {
            owner_id: owner_id.to_string(),
            period: BudgetPeriod::Monthly,
            allocations,
        };
        let draft = &draft;
        let budget = self
            .store_call(move || async move { store.activate_budget(draft.clone()).await.map_err(CallError::from) })
            .await?;

        log::info!("💰 Activated suggested budget {} for {}", budget.id, owner_id);
        Ok(Some(budget.id))
    }
}

fn classify_prompt(text: &str) -> String {
    format!(
        "Classify the following document text as a receipt, a bank statement or something else.\n\
         Respond with a single JSON object: {{\"type\": \"receipt\" | \"bank_statement\" | \"other\"}}.\n\n\
         Document text:\n{}",
        text
    )
}

fn extract_prompt(kind: DocumentKind, text: &str, today: NaiveDate) -> String {
    let source = match kind {
        DocumentKind::BankStatement => "bank statement (list every debit)",
        _ => "receipt (one transaction for the total unless items were paid separately)",
    };
    let categories: Vec<&str> = Category::all().iter().map(|c| c.as_str()).collect();
    format!(
        "Extract the transactions from this {}.\n\
         Respond with a JSON array of objects with fields amount (number, rupees), date (YYYY-MM-DD, \
         use {} if unknown), merchant, category (one of: {}) and description.\n\n\
         Document text:\n{}",
        source,
        today.format("%Y-%m-%d"),
        categories.join(", "),
        text
    )
}
