//! Ledger Store Backends
//!
//! Provides different storage backends for the append-only ledger and its
//! materialized balance projections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::{Feature, OrgId, TimeWindow, UserId};

use super::entry::{BalanceRef, LedgerEntry, MemberBalance, OrgBalance, TopupInvoice, UsageFact};
use super::transfer::{Transfer, apply_transfer};
use super::LedgerResult;

/// Trait for ledger storage backends.
///
/// `transfer` is the only mutation path for balances; implementations must
/// apply a whole transfer atomically so an error leaves no partial effect
/// and entries for one balance stay linearized.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &str;

    async fn transfer(&self, transfer: Transfer) -> LedgerResult<Vec<LedgerEntry>>;

    async fn org_balance(&self, org_id: OrgId) -> LedgerResult<Option<OrgBalance>>;

    async fn member_allocation(
        &self,
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
    ) -> LedgerResult<Option<MemberBalance>>;

    async fn all_member_allocations(
        &self,
        org_id: OrgId,
    ) -> LedgerResult<Vec<(UserId, Feature, MemberBalance)>>;

    async fn entries_for_org(&self, org_id: OrgId) -> LedgerResult<Vec<LedgerEntry>>;

    async fn entries_for_balance(&self, balance: &BalanceRef) -> LedgerResult<Vec<LedgerEntry>>;

    async fn record_usage_fact(&self, fact: UsageFact) -> LedgerResult<()>;

    async fn usage_facts_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<UsageFact>>;

    async fn record_invoice(&self, invoice: TopupInvoice) -> LedgerResult<()>;

    async fn invoices_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<TopupInvoice>>;
}

#[derive(Debug, Default)]
struct LedgerState {
    pools: HashMap<OrgId, OrgBalance>,
    allocations: HashMap<(OrgId, UserId, Feature), MemberBalance>,
    entries: Vec<LedgerEntry>,
    facts: Vec<UsageFact>,
    invoices: Vec<TopupInvoice>,
}

/// In-memory ledger store (for testing and single-instance deployments).
///
/// A single `RwLock` over the whole state is the row-lock equivalent:
/// transfers hold the write lock for their entire read-modify-write, so no
/// optimistic conflict is ever observed.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all organizations.
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn transfer(&self, transfer: Transfer) -> LedgerResult<Vec<LedgerEntry>> {
        let mut state = self.state.write().await;
        let org_id = transfer.org_id;

        let pool = state.pools.get(&org_id).copied();
        let applied = apply_transfer(
            &transfer,
            pool,
            |user_id, feature| {
                state
                    .allocations
                    .get(&(org_id, user_id, feature.clone()))
                    .copied()
            },
            chrono::Utc::now(),
        )?;

        if let Some(pool) = applied.pool {
            state.pools.insert(org_id, pool);
        }
        for ((user_id, feature), balance) in applied.allocations {
            state.allocations.insert((org_id, user_id, feature), balance);
        }
        state.entries.extend(applied.entries.iter().cloned());

        tracing::debug!(
            org = %org_id,
            entries = applied.entries.len(),
            "applied ledger transfer"
        );
        Ok(applied.entries)
    }

    async fn org_balance(&self, org_id: OrgId) -> LedgerResult<Option<OrgBalance>> {
        Ok(self.state.read().await.pools.get(&org_id).copied())
    }

    async fn member_allocation(
        &self,
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
    ) -> LedgerResult<Option<MemberBalance>> {
        Ok(self
            .state
            .read()
            .await
            .allocations
            .get(&(org_id, user_id, feature.clone()))
            .copied())
    }

    async fn all_member_allocations(
        &self,
        org_id: OrgId,
    ) -> LedgerResult<Vec<(UserId, Feature, MemberBalance)>> {
        Ok(self
            .state
            .read()
            .await
            .allocations
            .iter()
            .filter(|((org, _, _), _)| *org == org_id)
            .map(|((_, user, feature), balance)| (*user, feature.clone(), *balance))
            .collect())
    }

    async fn entries_for_org(&self, org_id: OrgId) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn entries_for_balance(&self, balance: &BalanceRef) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.balance == *balance)
            .cloned()
            .collect())
    }

    async fn record_usage_fact(&self, fact: UsageFact) -> LedgerResult<()> {
        self.state.write().await.facts.push(fact);
        Ok(())
    }

    async fn usage_facts_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<UsageFact>> {
        Ok(self
            .state
            .read()
            .await
            .facts
            .iter()
            .filter(|f| window.contains(f.recorded_at))
            .filter(|f| org_id.is_none_or(|org| f.org_id == org))
            .cloned()
            .collect())
    }

    async fn record_invoice(&self, invoice: TopupInvoice) -> LedgerResult<()> {
        self.state.write().await.invoices.push(invoice);
        Ok(())
    }

    async fn invoices_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<TopupInvoice>> {
        Ok(self
            .state
            .read()
            .await
            .invoices
            .iter()
            .filter(|i| window.contains(i.paid_at))
            .filter(|i| org_id.is_none_or(|org| i.org_id == org))
            .cloned()
            .collect())
    }
}
