//! Moving credits between the org pool and member allocations.
//!
//! Allocate carves credits out of the pool into a member's per-feature
//! allocation; reclaim is its inverse. Each direction is one transfer, so
//! the paired ledger entries land atomically or not at all. Reclaimed
//! credits return to the top-up tier: the monthly tier is cycle-scoped and
//! re-crediting it could resurrect credits past their expiry.

use std::sync::Arc;

use crate::config::RetryConfig;
use crate::ledger::{
    EntryKind, LedgerEntry, LedgerError, LedgerResult, LedgerStore, Transfer, TransferItem,
    TransferOp, with_conflict_retry,
};
use crate::notify::{NotificationRequest, NotificationSink, emit};
use crate::types::{ActorContext, Credits, Feature, UserId};

pub struct AllocationManager {
    store: Arc<dyn LedgerStore>,
    sink: Arc<dyn NotificationSink>,
    retry: RetryConfig,
}

impl AllocationManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        sink: Arc<dyn NotificationSink>,
        retry: RetryConfig,
    ) -> Self {
        Self { store, sink, retry }
    }

    /// Carve `amount` credits out of the org pool into `target_user`'s
    /// allocation for `feature`.
    ///
    /// Fails with `InsufficientOrgCredits` when the pool's effective
    /// balance cannot cover the amount; nothing is applied in that case.
    pub async fn allocate(
        &self,
        ctx: &ActorContext,
        target_user: UserId,
        feature: &Feature,
        amount: Credits,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        require_positive(amount)?;
        require_org_manager(ctx, "allocate credits")?;

        let entries = with_conflict_retry(&self.retry, || {
            let transfer = Transfer::new(ctx.org_id, ctx.user_id)
                .item(TransferItem::new(
                    TransferOp::SpendOrg {
                        amount,
                        allow_negative: false,
                    },
                    EntryKind::AllocationOut,
                    format!("Allocated {amount} credits to member for {feature}"),
                ))
                .item(TransferItem::new(
                    TransferOp::AllocateMember {
                        user_id: target_user,
                        feature: feature.clone(),
                        amount,
                    },
                    EntryKind::AllocationIn,
                    format!("Received {amount} credits for {feature}"),
                ));
            self.store.transfer(transfer)
        })
        .await?;

        emit(
            self.sink.as_ref(),
            NotificationRequest::credits_allocated(ctx.org_id, target_user, feature, amount),
        )
        .await;

        Ok(entries)
    }

    /// Return `amount` unused credits from `target_user`'s allocation to
    /// the org pool's top-up tier.
    pub async fn reclaim(
        &self,
        ctx: &ActorContext,
        target_user: UserId,
        feature: &Feature,
        amount: Credits,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        require_positive(amount)?;
        require_org_manager(ctx, "reclaim credits")?;

        with_conflict_retry(&self.retry, || {
            let transfer = Transfer::new(ctx.org_id, ctx.user_id)
                .item(TransferItem::new(
                    TransferOp::ReclaimMember {
                        user_id: target_user,
                        feature: feature.clone(),
                        amount,
                    },
                    EntryKind::ReclaimOut,
                    format!("Reclaimed {amount} credits from member for {feature}"),
                ))
                .item(TransferItem::new(
                    TransferOp::GrantTopup { amount },
                    EntryKind::ReclaimIn,
                    format!("Returned {amount} reclaimed credits to top-up balance"),
                ));
            self.store.transfer(transfer)
        })
        .await
    }
}

fn require_positive(amount: Credits) -> LedgerResult<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount { amount });
    }
    Ok(())
}

fn require_org_manager(ctx: &ActorContext, action: &str) -> LedgerResult<()> {
    if !ctx.role.spends_org_pool() {
        return Err(LedgerError::Unauthorized {
            message: format!("only owners and admins may {action}"),
        });
    }
    Ok(())
}
