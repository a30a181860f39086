//! Fan-out of canonical events and derived signals
//!
//! One registry per event type. Budget alerts are also folded into a bounded
//! recent-alerts window that keeps only the newest alert per category.

use super::registry::{SubscriberRegistry, Subscription};
use crate::types::{
    AnalyticsEvent, AnomalyResult, Budget, BudgetAlert, Category, DocumentEvent, Notification,
    PipelineEvent, Transaction,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

pub const RECENT_ALERTS_CAPACITY: usize = 10;

/// Newest-first window of budget alerts, at most one per category
#[derive(Debug, Clone)]
pub struct RecentAlerts {
    capacity: usize,
    alerts: VecDeque<BudgetAlert>,
}

impl RecentAlerts {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            alerts: VecDeque::new(),
        }
    }

    /// Insert `alert`, replacing any previous alert for its category
    pub fn push(&mut self, alert: BudgetAlert) {
        self.alerts.retain(|a| a.category != alert.category);
        self.alerts.push_front(alert);
        self.alerts.truncate(self.capacity);
    }

    pub fn get(&self, category: Category) -> Option<&BudgetAlert> {
        self.alerts.iter().find(|a| a.category == category)
    }

    pub fn to_vec(&self) -> Vec<BudgetAlert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn clear(&mut self) {
        self.alerts.clear();
    }
}

impl Default for RecentAlerts {
    fn default() -> Self {
        Self::new(RECENT_ALERTS_CAPACITY)
    }
}

#[derive(Default)]
pub struct AlertDispatcher {
    transactions: SubscriberRegistry<Transaction>,
    budgets: SubscriberRegistry<Budget>,
    documents: SubscriberRegistry<DocumentEvent>,
    notifications: SubscriberRegistry<Notification>,
    analytics: SubscriberRegistry<AnalyticsEvent>,
    anomalies: SubscriberRegistry<AnomalyResult>,
    budget_alerts: SubscriberRegistry<BudgetAlert>,
    recent: Mutex<RecentAlerts>,
}

impl AlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        self.transactions.add(f)
    }

    pub fn add_budget_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Budget) + Send + Sync + 'static,
    {
        self.budgets.add(f)
    }

    pub fn add_document_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&DocumentEvent) + Send + Sync + 'static,
    {
        self.documents.add(f)
    }

    pub fn add_notification_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.notifications.add(f)
    }

    pub fn add_analytics_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&AnalyticsEvent) + Send + Sync + 'static,
    {
        self.analytics.add(f)
    }

    pub fn add_anomaly_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&AnomalyResult) + Send + Sync + 'static,
    {
        self.anomalies.add(f)
    }

    pub fn add_budget_alert_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&BudgetAlert) + Send + Sync + 'static,
    {
        self.budget_alerts.add(f)
    }

    /// Deliver a raw canonical event to its type's listeners
    pub fn dispatch_event(&self, event: &PipelineEvent) -> usize {
        match event {
            PipelineEvent::Transaction(t) => self.transactions.dispatch(t),
            PipelineEvent::Budget(b) => self.budgets.dispatch(b),
            PipelineEvent::DocumentProcessed(d) => self.documents.dispatch(d),
            PipelineEvent::Notification(n) => self.notifications.dispatch(n),
            PipelineEvent::Analytics(a) => self.analytics.dispatch(a),
        }
    }

    /// Deliver an anomaly and its derived notification. Non-anomalous results are ignored.
    pub fn dispatch_anomaly(&self, result: &AnomalyResult) {
        if !result.is_anomaly {
            return;
        }
        self.anomalies.dispatch(result);
        self.notifications.dispatch(&Notification::from(result));
    }

    /// Record the alert in the recent window, then deliver it and its derived notification
    pub fn dispatch_budget_alert(&self, alert: &BudgetAlert) {
        self.recent().push(alert.clone());
        self.budget_alerts.dispatch(alert);
        self.notifications.dispatch(&Notification::from(alert));
    }

    pub fn recent_alerts(&self) -> Vec<BudgetAlert> {
        self.recent().to_vec()
    }

    /// Drop every listener and the recent window
    pub fn clear(&self) {
        self.transactions.clear();
        self.budgets.clear();
        self.documents.clear();
        self.notifications.clear();
        self.analytics.clear();
        self.anomalies.clear();
        self.budget_alerts.clear();
        self.recent().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.transactions.len()
            + self.budgets.len()
            + self.documents.len()
            + self.notifications.len()
            + self.analytics.len()
            + self.anomalies.len()
            + self.budget_alerts.len()
    }

    fn recent(&self) -> MutexGuard<'_, RecentAlerts> {
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertStatus, NotificationKind};
    use std::sync::Arc;

    fn alert(category: Category, percent: f64) -> BudgetAlert {
        BudgetAlert {
            owner_id: "u1".to_string(),
            category,
            budgeted: 1000.0,
            spent: percent * 10.0,
            percent_used: percent,
            status: if percent >= 100.0 {
                AlertStatus::Exceeded
            } else {
                AlertStatus::Warning
            },
        }
    }

    #[test]
    fn test_dedup_keeps_newest_per_category() {
        let dispatcher = AlertDispatcher::new();
        dispatcher.dispatch_budget_alert(&alert(Category::Groceries, 85.0));
        dispatcher.dispatch_budget_alert(&alert(Category::Groceries, 120.0));

        let recent = dispatcher.recent_alerts();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].category, Category::Groceries);
        assert_eq!(recent[0].status, AlertStatus::Exceeded);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = RecentAlerts::new(3);
        for category in [Category::Rent, Category::Dining, Category::Shopping, Category::Transport] {
            window.push(alert(category, 90.0));
        }
        assert_eq!(window.len(), 3);
        assert!(window.get(Category::Rent).is_none());
        assert_eq!(window.to_vec()[0].category, Category::Transport);
    }

    #[test]
    fn test_alert_fans_out_notification() {
        let dispatcher = AlertDispatcher::new();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        let _sub = dispatcher.add_notification_listener(move |n| sink.lock().unwrap().push(n.kind));

        dispatcher.dispatch_budget_alert(&alert(Category::Dining, 101.0));
        assert_eq!(*kinds.lock().unwrap(), vec![NotificationKind::BudgetExceeded]);
    }

    #[test]
    fn test_clear_removes_listeners() {
        let dispatcher = AlertDispatcher::new();
        let _a = dispatcher.add_budget_alert_listener(|_| {});
        let _b = dispatcher.add_anomaly_listener(|_| {});
        assert_eq!(dispatcher.listener_count(), 2);
        dispatcher.clear();
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
