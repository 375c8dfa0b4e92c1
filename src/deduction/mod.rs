//! The deduction hot path.
//!
//! Routes a charge to the right pool by actor role, applies it atomically,
//! and derives low-balance notices from the resulting transition. Member
//! deductions also append a zero-delta mirror entry at the organization
//! level so org-wide usage reporting stays complete without double-charging
//! the pool.

use std::sync::Arc;

use crate::config::RetryConfig;
use crate::directory::OrgDirectory;
use crate::ledger::{
    EntryKind, LedgerEntry, LedgerError, LedgerResult, LedgerStore, Transfer, TransferItem,
    TransferOp, with_conflict_retry,
};
use crate::notify::{NotificationRequest, NotificationSink, crossed_low_threshold, emit};
use crate::types::{ActorContext, ActorRole, Credits, Feature, UsageFactId};

pub struct DeductionProcessor {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn NotificationSink>,
    directory: Arc<dyn OrgDirectory>,
    low_balance_threshold: f64,
    retry: RetryConfig,
}

impl DeductionProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn NotificationSink>,
        directory: Arc<dyn OrgDirectory>,
        low_balance_threshold: f64,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            sink,
            directory,
            low_balance_threshold,
            retry,
        }
    }

    /// Atomically check sufficiency and debit the pool the actor's role
    /// routes to.
    ///
    /// Super-admins always succeed and may drive the org pool negative;
    /// owners and admins spend the org pool within its effective balance;
    /// ordinary members spend their own per-feature allocation. A missing
    /// allocation row counts as zero remaining.
    pub async fn deduct(
        &self,
        ctx: &ActorContext,
        feature: &Feature,
        amount: Credits,
        description: &str,
        usage_fact_id: Option<UsageFactId>,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }

        match ctx.role {
            ActorRole::SuperAdmin => {
                self.deduct_org(ctx, amount, description, usage_fact_id, true)
                    .await
            }
            ActorRole::Owner | ActorRole::Admin => {
                self.deduct_org(ctx, amount, description, usage_fact_id, false)
                    .await
            }
            ActorRole::Member => {
                self.deduct_member(ctx, feature, amount, description, usage_fact_id)
                    .await
            }
        }
    }

    async fn deduct_org(
        &self,
        ctx: &ActorContext,
        amount: Credits,
        description: &str,
        usage_fact_id: Option<UsageFactId>,
        allow_negative: bool,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        with_conflict_retry(&self.retry, || {
            let mut item = TransferItem::new(
                TransferOp::SpendOrg {
                    amount,
                    allow_negative,
                },
                EntryKind::UsageDeduction,
                description,
            );
            if let Some(id) = usage_fact_id {
                item = item.with_usage_fact(id);
            }
            self.store
                .transfer(Transfer::new(ctx.org_id, ctx.user_id).item(item))
        })
        .await
    }

    async fn deduct_member(
        &self,
        ctx: &ActorContext,
        feature: &Feature,
        amount: Credits,
        description: &str,
        usage_fact_id: Option<UsageFactId>,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let entries = with_conflict_retry(&self.retry, || {
            let mut spend = TransferItem::new(
                TransferOp::SpendMember {
                    user_id: ctx.user_id,
                    feature: feature.clone(),
                    amount,
                },
                EntryKind::UsageDeduction,
                description,
            );
            let mut mirror = TransferItem::new(
                TransferOp::RecordOnly { amount: -amount },
                EntryKind::UsageDeduction,
                format!("[Team] {description}"),
            );
            if let Some(id) = usage_fact_id {
                spend = spend.with_usage_fact(id);
                mirror = mirror.with_usage_fact(id);
            }
            self.store
                .transfer(Transfer::new(ctx.org_id, ctx.user_id).item(spend).item(mirror))
        })
        .await?;

        self.notify_if_low(ctx, feature, &entries[0]).await;
        Ok(entries)
    }

    async fn notify_if_low(&self, ctx: &ActorContext, feature: &Feature, entry: &LedgerEntry) {
        let allocated = match self
            .store
            .member_allocation(ctx.org_id, ctx.user_id, feature)
            .await
        {
            Ok(Some(balance)) => balance.allocated,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "skipping low-balance check after deduction");
                return;
            }
        };

        if !crossed_low_threshold(
            entry.balance_before,
            entry.balance_after,
            allocated,
            self.low_balance_threshold,
        ) {
            return;
        }

        let remaining = entry.balance_after;
        let mut recipients = vec![ctx.user_id];
        recipients.extend(self.directory.admins(ctx.org_id).await);
        recipients.dedup();

        let notices = recipients.into_iter().map(|user| {
            emit(
                self.sink.as_ref(),
                NotificationRequest::low_balance(ctx.org_id, user, feature, remaining, allocated),
            )
        });
        futures::future::join_all(notices).await;
    }
}
