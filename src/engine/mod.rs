//! The credit engine facade.
//!
//! Composes the ledger store, pricing catalog, allocation manager,
//! deduction processor, metering bridge, and aggregator behind one API for
//! the surrounding product. Role never comes from ambient session state:
//! every call takes an explicit [`ActorContext`] resolved by the caller.

use std::sync::Arc;

use chrono::Utc;

use crate::allocation::AllocationManager;
use crate::config::EngineConfig;
#[cfg(feature = "jsonl")]
use crate::ledger::{JournalConfig, JsonlJournal};
use crate::deduction::DeductionProcessor;
use crate::directory::{MemoryDirectory, OrgDirectory};
use crate::ledger::{
    Divergence, EntryKind, LedgerEntry, LedgerError, LedgerResult, LedgerStore, MemberBalance,
    MemoryLedgerStore, OrgBalance, Transfer, TransferItem, TransferOp, replay, with_conflict_retry,
};
use crate::metering::{CompletedCall, MeteredUsage, UsageMeteringBridge};
use crate::notify::{NotificationSink, NullSink};
use crate::pricing::PricingCatalog;
use crate::report::{CostAggregator, CostReport};
use crate::types::{ActorContext, Credits, Feature, OrgId, TimeWindow, UsageFactId, UserId};

pub struct CreditEngine {
    store: Arc<dyn LedgerStore>,
    config: EngineConfig,
    allocation: AllocationManager,
    deduction: Arc<DeductionProcessor>,
    metering: UsageMeteringBridge,
    aggregator: CostAggregator,
    #[cfg(feature = "jsonl")]
    journal: Option<JsonlJournal>,
}

impl CreditEngine {
    pub fn builder() -> CreditEngineBuilder {
        CreditEngineBuilder::default()
    }

    /// Credit an organization's monthly tier, creating the pool on first
    /// grant and resetting remaining to the new total on renewal.
    ///
    /// Called by the payment webhook; always permitted.
    pub async fn grant_monthly_credits(
        &self,
        org_id: OrgId,
        amount: Credits,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let kind = match self.store.org_balance(org_id).await? {
            Some(_) => EntryKind::SubscriptionRenewal,
            None => EntryKind::Grant,
        };
        let period_end = Utc::now() + chrono::Duration::days(self.config.billing_cycle_days);

        let entries = with_conflict_retry(&self.config.retry, || {
            let description = match kind {
                EntryKind::Grant => format!("Subscription activated with {amount} monthly credits"),
                _ => format!("Monthly credits renewed to {amount}"),
            };
            self.store.transfer(
                Transfer::new(org_id, UserId::system()).item(TransferItem::new(
                    TransferOp::GrantMonthly {
                        amount,
                        period_end: Some(period_end),
                    },
                    kind,
                    description,
                )),
            )
        })
        .await?;

        self.mirror(&entries).await;
        Ok(entries)
    }

    /// Credit an organization's top-up tier and record the paid invoice.
    ///
    /// Called by the payment webhook; always permitted.
    pub async fn grant_topup(
        &self,
        org_id: OrgId,
        amount: Credits,
        invoice_id: impl Into<String>,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let invoice_id = invoice_id.into();
        let entries = with_conflict_retry(&self.config.retry, || {
            self.store.transfer(
                Transfer::new(org_id, UserId::system()).item(TransferItem::new(
                    TransferOp::GrantTopup { amount },
                    EntryKind::Topup,
                    format!("Top-up of {amount} credits (invoice {invoice_id})"),
                )),
            )
        })
        .await?;

        self.store
            .record_invoice(crate::ledger::TopupInvoice {
                id: invoice_id,
                org_id,
                amount_cents: amount,
                paid_at: Utc::now(),
            })
            .await?;

        self.mirror(&entries).await;
        Ok(entries)
    }

    /// Carve credits out of the org pool for one member and feature.
    pub async fn allocate(
        &self,
        ctx: &ActorContext,
        target_user: UserId,
        feature: &Feature,
        amount: Credits,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let entries = self
            .allocation
            .allocate(ctx, target_user, feature, amount)
            .await?;
        self.mirror(&entries).await;
        Ok(entries)
    }

    /// Return unused member credits to the org pool's top-up tier.
    pub async fn reclaim(
        &self,
        ctx: &ActorContext,
        target_user: UserId,
        feature: &Feature,
        amount: Credits,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let entries = self
            .allocation
            .reclaim(ctx, target_user, feature, amount)
            .await?;
        self.mirror(&entries).await;
        Ok(entries)
    }

    /// Deduct credits from the pool the actor's role routes to.
    pub async fn deduct(
        &self,
        ctx: &ActorContext,
        feature: &Feature,
        amount: Credits,
        description: &str,
        usage_fact_id: Option<UsageFactId>,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let entries = self
            .deduction
            .deduct(ctx, feature, amount, description, usage_fact_id)
            .await?;
        self.mirror(&entries).await;
        Ok(entries)
    }

    /// Meter one completed AI call: price it, record the fact, deduct.
    pub async fn meter(
        &self,
        ctx: &ActorContext,
        call: CompletedCall,
    ) -> LedgerResult<MeteredUsage> {
        let metered = self.metering.meter(ctx, call).await?;
        if let crate::metering::ChargeOutcome::Applied(entries) = &metered.outcome {
            self.mirror(entries).await;
        }
        Ok(metered)
    }

    pub async fn balance(&self, org_id: OrgId) -> LedgerResult<Option<OrgBalance>> {
        self.store.org_balance(org_id).await
    }

    pub async fn member_allocation(
        &self,
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
    ) -> LedgerResult<Option<MemberBalance>> {
        self.store.member_allocation(org_id, user_id, feature).await
    }

    /// Every member allocation row of the organization, for admin views.
    pub async fn member_allocations(
        &self,
        org_id: OrgId,
    ) -> LedgerResult<Vec<(UserId, Feature, MemberBalance)>> {
        self.store.all_member_allocations(org_id).await
    }

    /// Cost, revenue, and margin for a window, optionally scoped to one org.
    pub async fn cost_report(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<CostReport> {
        self.aggregator.report(window, org_id).await
    }

    /// Zero every tier of an organization's pool on cancellation.
    ///
    /// The pool row survives so history and a later reactivation keep
    /// working.
    pub async fn cancel_subscription(&self, org_id: OrgId) -> LedgerResult<Vec<LedgerEntry>> {
        let entries = with_conflict_retry(&self.config.retry, || {
            self.store.transfer(
                Transfer::new(org_id, UserId::system()).item(TransferItem::new(
                    TransferOp::ZeroPool,
                    EntryKind::AdminAdjustment,
                    "Subscription cancelled, credits zeroed",
                )),
            )
        })
        .await?;
        self.mirror(&entries).await;
        Ok(entries)
    }

    /// Manual balance correction. Super-admin only.
    pub async fn admin_adjust(
        &self,
        ctx: &ActorContext,
        org_id: OrgId,
        monthly_delta: Credits,
        topup_delta: Credits,
        description: &str,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        if !ctx.role.is_super_admin() {
            return Err(LedgerError::Unauthorized {
                message: "only platform super-admins may adjust balances".to_string(),
            });
        }

        let entries = with_conflict_retry(&self.config.retry, || {
            self.store.transfer(
                Transfer::new(org_id, ctx.user_id).item(TransferItem::new(
                    TransferOp::AdminAdjust {
                        monthly_delta,
                        topup_delta,
                    },
                    EntryKind::AdminAdjustment,
                    description,
                )),
            )
        })
        .await?;
        self.mirror(&entries).await;
        Ok(entries)
    }

    /// Replay an organization's ledger and report counters that disagree
    /// with the materialized balances. Empty means consistent.
    pub async fn verify_consistency(&self, org_id: OrgId) -> LedgerResult<Vec<Divergence>> {
        replay::verify_consistency(self.store.as_ref(), org_id).await
    }

    /// The organization's full append-only history, oldest first.
    pub async fn ledger_history(&self, org_id: OrgId) -> LedgerResult<Vec<LedgerEntry>> {
        self.store.entries_for_org(org_id).await
    }

    #[cfg(feature = "jsonl")]
    async fn mirror(&self, entries: &[LedgerEntry]) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.append(entries).await
        {
            // The store already committed; the journal is an audit mirror
            // and must not fail the request.
            tracing::warn!(error = %e, "ledger journal append failed");
        }
    }

    #[cfg(not(feature = "jsonl"))]
    async fn mirror(&self, _entries: &[LedgerEntry]) {}
}

/// Builder for [`CreditEngine`].
#[derive(Default)]
pub struct CreditEngineBuilder {
    store: Option<Arc<dyn LedgerStore>>,
    catalog: Option<PricingCatalog>,
    sink: Option<Arc<dyn NotificationSink>>,
    directory: Option<Arc<dyn OrgDirectory>>,
    config: Option<EngineConfig>,
    #[cfg(feature = "jsonl")]
    journal: Option<JournalConfig>,
}

impl CreditEngineBuilder {
    pub fn store(mut self, store: impl LedgerStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn store_arc(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn catalog(mut self, catalog: PricingCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn notification_sink(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn notification_sink_arc(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn directory(mut self, directory: impl OrgDirectory + 'static) -> Self {
        self.directory = Some(Arc::new(directory));
        self
    }

    pub fn directory_arc(mut self, directory: Arc<dyn OrgDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Mirror every appended ledger entry to a JSONL audit journal.
    #[cfg(feature = "jsonl")]
    pub fn journal(mut self, config: JournalConfig) -> Self {
        self.journal = Some(config);
        self
    }

    pub fn build(self) -> CreditEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryLedgerStore::new()));
        let catalog = Arc::new(self.catalog.unwrap_or_default());
        let sink = self.sink.unwrap_or_else(|| Arc::new(NullSink));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(MemoryDirectory::new()));
        let config = self.config.unwrap_or_default();

        let allocation = AllocationManager::new(store.clone(), sink.clone(), config.retry);
        let deduction = Arc::new(DeductionProcessor::new(
            store.clone(),
            sink,
            directory,
            config.low_balance_threshold,
            config.retry,
        ));
        let metering = UsageMeteringBridge::new(catalog.clone(), store.clone(), deduction.clone());
        let aggregator = CostAggregator::new(store.clone(), catalog);

        CreditEngine {
            store,
            config,
            allocation,
            deduction,
            metering,
            aggregator,
            #[cfg(feature = "jsonl")]
            journal: self.journal.map(JsonlJournal::new),
        }
    }
}
