//! budget-suggest: validate → generate → parse

use super::parse::parse_budget_suggestion;
use super::{BudgetRequest, BudgetSuggestion, Step, WorkflowName, WorkflowOrchestrator, WorkflowRun, WorkflowStepError};
use crate::clients::CompletionRequest;
use crate::resilience::CallError;
use crate::types::{BudgetPeriod, Category, Transaction};
use std::collections::BTreeMap;

/// Transactions sampled for spending patterns
const PATTERN_SAMPLE: usize = 100;

impl WorkflowOrchestrator {
    /// Generate a budget allocation for the owner's income. Nothing is persisted.
    pub async fn suggest_budget(&self, request: BudgetRequest) -> Result<BudgetSuggestion, WorkflowStepError> {
        let mut run = WorkflowRun::start(WorkflowName::BudgetSuggest, request.correlation_id.clone());
        let outcome = self.run_budget_suggest(&mut run, &request).await;

        if let Err(e) = &outcome {
            log::warn!("⚠️  {}", e);
        }
        self.respond(&run, &outcome).await;
        outcome
    }

    async fn run_budget_suggest(
        &self,
        run: &mut WorkflowRun,
        request: &BudgetRequest,
    ) -> Result<BudgetSuggestion, WorkflowStepError> {
        let _permit = match self.admit().await {
            Some(permit) => permit,
            None => return Err(run.failure(Step::Validate, CallError::Cancelled)),
        };

        let (income, period) = run.step(Step::Validate, async { validate_budget_request(request) }).await?;
        let text = run
            .step(Step::Generate, self.generate_budget_text(&request.owner_id, income, period))
            .await?;
        let suggestion = run.step(Step::Parse, async { parse_budget_suggestion(&text) }).await?;
        run.finish();

        Ok(BudgetSuggestion {
            suggestion,
            total_income: income,
            period: period.as_str().to_string(),
        })
    }

    /// Spending patterns from the store, then one completion call
    pub(super) async fn generate_budget_text(
        &self,
        owner_id: &str,
        income: f64,
        period: BudgetPeriod,
    ) -> Result<String, CallError> {
        let store = &self.store;
        let history = self
            .store_call(move || async move {
                store
                    .latest_transactions(owner_id, PATTERN_SAMPLE)
                    .await
                    .map_err(CallError::from)
            })
            .await?;

        let request = CompletionRequest::prompt(budget_prompt(income, period, &average_by_category(&history)));
        self.complete(&request).await
    }
}

fn validate_budget_request(request: &BudgetRequest) -> Result<(f64, BudgetPeriod), CallError> {
    if request.owner_id.trim().is_empty() {
        return Err(CallError::Validation("userId is required".to_string()));
    }
    let income = match request.total_income {
        Some(income) if income.is_finite() && income > 0.0 => income,
        Some(income) => return Err(CallError::Validation(format!("totalIncome must be positive, got {}", income))),
        None => return Err(CallError::Validation("totalIncome is required".to_string())),
    };
    let period = request
        .period
        .as_deref()
        .ok_or_else(|| CallError::Validation("period is required".to_string()))?
        .parse::<BudgetPeriod>()
        .map_err(CallError::Validation)?;
    Ok((income, period))
}

pub(super) fn average_by_category(history: &[Transaction]) -> BTreeMap<Category, f64> {
    let mut sums: BTreeMap<Category, (f64, usize)> = BTreeMap::new();
    for t in history {
        let entry = sums.entry(t.category).or_insert((0.0, 0));
        entry.0 += t.amount;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(category, (sum, count))| (category, sum / count as f64))
        .collect()
}

fn budget_prompt(income: f64, period: BudgetPeriod, averages: &BTreeMap<Category, f64>) -> String {
    let categories: Vec<&str> = Category::all().iter().map(|c| c.as_str()).collect();
    let patterns = if averages.is_empty() {
        "No past spending data is available.".to_string()
    } else {
        format!(
            "Average past spending per category:\n{}",
            serde_json::to_string_pretty(averages).unwrap_or_default()
        )
    };

    format!(
        "Create a {} budget for a total income of ₹{:.2}.\n\n{}\n\n\
         Allocate across exactly these categories: {}.\n\
         Respond with a single JSON object mapping each category to a non-negative amount in rupees. \
         The total must not exceed the income.",
        period.as_str(),
        income,
        patterns,
        categories.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn request(income: Option<f64>, period: Option<&str>) -> BudgetRequest {
        BudgetRequest {
            correlation_id: None,
            owner_id: "u1".to_string(),
            total_income: income,
            period: period.map(str::to_string),
        }
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            validate_budget_request(&request(Some(50000.0), Some("monthly"))).unwrap(),
            (50000.0, BudgetPeriod::Monthly)
        );
        assert!(matches!(
            validate_budget_request(&request(Some(0.0), Some("monthly"))),
            Err(CallError::Validation(_))
        ));
        assert!(validate_budget_request(&request(None, Some("monthly"))).is_err());
        assert!(validate_budget_request(&request(Some(10.0), None)).is_err());
        assert!(validate_budget_request(&request(Some(10.0), Some("weekly"))).is_err());
    }

    #[test]
    fn test_average_by_category() {
        let t = |amount: f64, category: Category| Transaction {
            id: "t".to_string(),
            owner_id: "u1".to_string(),
            amount,
            category,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            merchant: None,
            description: None,
            document_id: None,
        };
        let averages = average_by_category(&[
            t(100.0, Category::Dining),
            t(300.0, Category::Dining),
            t(50.0, Category::Transport),
        ]);
        assert_eq!(averages[&Category::Dining], 200.0);
        assert_eq!(averages[&Category::Transport], 50.0);

        let prompt = budget_prompt(40000.0, BudgetPeriod::Monthly, &averages);
        assert!(prompt.contains("₹40000.00"));
        assert!(prompt.contains("emergency_fund"));
    }
}
