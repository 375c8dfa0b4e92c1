//! Notification requests derived from balance transitions.
//!
//! The engine only emits requests; delivery (and its guarantees) belongs to
//! the external notification collaborator behind [`NotificationSink`].

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Credits, Feature, OrgId, UserId};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification delivery failed: {message}")]
    Delivery { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CreditsAllocated,
    LowBalance,
}

/// One request handed to the notification collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: UserId,
    pub org_id: OrgId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
}

impl NotificationRequest {
    pub fn credits_allocated(
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
        amount: Credits,
    ) -> Self {
        Self {
            user_id,
            org_id,
            kind: NotificationKind::CreditsAllocated,
            title: "Credits allocated".to_string(),
            body: format!("{amount} credits were allocated to you for {feature}"),
            link: Some("/settings/credits".to_string()),
        }
    }

    pub fn low_balance(
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
        remaining: Credits,
        allocated: Credits,
    ) -> Self {
        Self {
            user_id,
            org_id,
            kind: NotificationKind::LowBalance,
            title: "Credit allocation running low".to_string(),
            body: format!("{remaining} of {allocated} credits remain for {feature}"),
            link: Some("/settings/credits".to_string()),
        }
    }
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, request: NotificationRequest) -> Result<(), NotifyError>;
}

/// Deliver a request, logging and swallowing failures.
///
/// A missed notice must never roll back the balance mutation that caused it.
pub async fn emit(sink: &dyn NotificationSink, request: NotificationRequest) {
    let kind = request.kind;
    if let Err(e) = sink.deliver(request).await {
        tracing::warn!(error = %e, kind = ?kind, "notification delivery failed");
    }
}

/// Discards every request.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl NotificationSink for NullSink {
    async fn deliver(&self, _request: NotificationRequest) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Collects requests for assertions in tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemorySink {
    requests: Mutex<Vec<NotificationRequest>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<NotificationRequest> {
        self.requests.lock().expect("sink lock poisoned").clone()
    }

    pub fn take(&self) -> Vec<NotificationRequest> {
        std::mem::take(&mut *self.requests.lock().expect("sink lock poisoned"))
    }
}

#[async_trait::async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, request: NotificationRequest) -> Result<(), NotifyError> {
        self.requests
            .lock()
            .map_err(|_| NotifyError::Delivery {
                message: "sink lock poisoned".to_string(),
            })?
            .push(request);
        Ok(())
    }
}

/// Edge-triggered low-balance check.
///
/// Fires only when a deduction moves `remaining` from at-or-above the
/// threshold to below it, so repeated deductions under the line do not
/// renotify.
pub fn crossed_low_threshold(before: Credits, after: Credits, allocated: Credits, pct: f64) -> bool {
    if allocated <= 0 {
        return false;
    }
    let cut = allocated as f64 * pct;
    (after as f64) < cut && (before as f64) >= cut
}
