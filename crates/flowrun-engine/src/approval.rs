use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use flowrun_core::types::ExecutionId;

/// A human decision on a suspended approval step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
}

/// A step waiting for a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub execution_id: ExecutionId,
    pub step_id: String,
    pub message: String,
    pub requested_at: DateTime<Utc>,
}

struct Waiter {
    request: PendingApproval,
    tx: oneshot::Sender<ApprovalDecision>,
}

/// Manages pending approval requests with oneshot channels.
///
/// Requests are kept per execution in arrival order so that a decision
/// without an explicit step goes to the oldest waiting step.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<ExecutionId, Vec<Waiter>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiting step and return the receiver the scheduler awaits.
    pub async fn request(
        &self,
        execution_id: &ExecutionId,
        step_id: &str,
        message: &str,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let request = PendingApproval {
            execution_id: execution_id.clone(),
            step_id: step_id.to_string(),
            message: message.to_string(),
            requested_at: Utc::now(),
        };
        self.pending
            .lock()
            .await
            .entry(execution_id.clone())
            .or_default()
            .push(Waiter { request, tx });
        rx
    }

    /// Resolve a waiting step. Returns the resolved step id, or `None` when
    /// nothing (matching) is waiting.
    pub async fn respond(
        &self,
        execution_id: &ExecutionId,
        step_id: Option<&str>,
        decision: ApprovalDecision,
    ) -> Option<String> {
        let waiter = {
            let mut pending = self.pending.lock().await;
            let waiters = pending.get_mut(execution_id)?;
            let idx = match step_id {
                Some(id) => waiters.iter().position(|w| w.request.step_id == id)?,
                None if waiters.is_empty() => return None,
                None => 0,
            };
            let waiter = waiters.remove(idx);
            if waiters.is_empty() {
                pending.remove(execution_id);
            }
            waiter
        };

        // Ignore send error (the execution may have ended meanwhile)
        let _ = waiter.tx.send(decision);
        Some(waiter.request.step_id)
    }

    /// Pending approvals of one execution, oldest first.
    pub async fn pending(&self, execution_id: &ExecutionId) -> Vec<PendingApproval> {
        self.pending
            .lock()
            .await
            .get(execution_id)
            .map(|waiters| waiters.iter().map(|w| w.request.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop every waiter of an execution; their receivers observe closure.
    pub async fn discard(&self, execution_id: &ExecutionId) {
        self.pending.lock().await.remove(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respond_approve() {
        let broker = ApprovalBroker::new();
        let id = ExecutionId::new();

        let rx = broker.request(&id, "gate", "ok?").await;
        assert_eq!(
            broker.respond(&id, None, ApprovalDecision::Approved).await,
            Some("gate".to_string())
        );
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn respond_reject_by_step() {
        let broker = ApprovalBroker::new();
        let id = ExecutionId::new();

        let rx_a = broker.request(&id, "a", "first").await;
        let rx_b = broker.request(&id, "b", "second").await;
        let decision = ApprovalDecision::Rejected {
            reason: "too risky".into(),
        };
        assert_eq!(
            broker.respond(&id, Some("b"), decision.clone()).await,
            Some("b".to_string())
        );
        assert_eq!(rx_b.await.unwrap(), decision);

        // The oldest remaining waiter gets an untargeted decision.
        assert_eq!(
            broker.respond(&id, None, ApprovalDecision::Approved).await,
            Some("a".to_string())
        );
        assert_eq!(rx_a.await.unwrap(), ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn respond_nothing_pending() {
        let broker = ApprovalBroker::new();
        let id = ExecutionId::new();
        assert!(broker
            .respond(&id, None, ApprovalDecision::Approved)
            .await
            .is_none());

        let _rx = broker.request(&id, "a", "m").await;
        assert!(broker
            .respond(&id, Some("zz"), ApprovalDecision::Approved)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn pending_listed_and_discarded() {
        let broker = ApprovalBroker::new();
        let id = ExecutionId::new();

        let _rx1 = broker.request(&id, "a", "m1").await;
        let rx2 = broker.request(&id, "b", "m2").await;
        let pending = broker.pending(&id).await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].step_id, "a");

        broker.discard(&id).await;
        assert!(broker.pending(&id).await.is_empty());
        assert!(rx2.await.is_err());
    }
}
