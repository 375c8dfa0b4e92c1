//! Cost & margin reporting over recorded usage facts.
//!
//! A read-side batch report, not a ledger mutator: it scans usage facts in
//! a time window, recomputes true provider cost from the catalog current at
//! report time (never the charge stored with the fact, so corrected pricing
//! flows into historical reports), and rolls the results up by
//! organization, model, and feature. Credits charged are treated as cents
//! of revenue. Reads take no locks; eventual consistency is acceptable.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::ledger::{LedgerResult, LedgerStore, UsageFact};
use crate::pricing::PricingCatalog;
use crate::types::{Credits, Feature, OrgId, TimeWindow};

/// Aggregated usage with derived margin figures.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRollup {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Provider cost in USD, recomputed from the catalog at report time.
    pub provider_cost_usd: Decimal,
    pub credits_charged: Credits,
}

impl UsageRollup {
    fn absorb(&mut self, fact: &UsageFact, provider_cost: Decimal) {
        self.calls += 1;
        self.input_tokens += fact.input_tokens;
        self.output_tokens += fact.output_tokens;
        self.provider_cost_usd += provider_cost;
        self.credits_charged += fact.credits_charged;
    }

    /// Credits charged expressed in USD (1 credit = 1 cent).
    pub fn revenue_usd(&self) -> Decimal {
        Decimal::from(self.credits_charged) / dec!(100)
    }

    pub fn profit_usd(&self) -> Decimal {
        self.revenue_usd() - self.provider_cost_usd
    }

    /// Margin as a percentage of revenue; `None` when there is no revenue.
    pub fn margin_pct(&self) -> Option<Decimal> {
        if self.credits_charged == 0 {
            return None;
        }
        Some(self.profit_usd() / self.revenue_usd() * dec!(100))
    }
}

/// Cost, revenue, and margin for one time window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CostReport {
    pub window: TimeWindow,
    pub totals: UsageRollup,
    pub by_org: BTreeMap<OrgId, UsageRollup>,
    /// Every catalog model appears here, active or not, plus any model
    /// observed in usage facts that the catalog no longer lists.
    pub by_model: BTreeMap<String, UsageRollup>,
    pub by_feature: BTreeMap<Feature, UsageRollup>,
    /// Paid top-up invoices in the window, for the revenue cross-check.
    pub topup_invoice_count: usize,
    pub topup_invoice_cents: Credits,
}

pub struct CostAggregator {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PricingCatalog>,
}

impl CostAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Arc<PricingCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Build the report for a window, optionally scoped to one organization.
    pub async fn report(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<CostReport> {
        let facts = self.store.usage_facts_between(window, org_id).await?;
        let invoices = self.store.invoices_between(window, org_id).await?;

        let mut totals = UsageRollup::default();
        let mut by_org: BTreeMap<OrgId, UsageRollup> = BTreeMap::new();
        let mut by_feature: BTreeMap<Feature, UsageRollup> = BTreeMap::new();
        let mut by_model: BTreeMap<String, UsageRollup> = self
            .catalog
            .model_ids()
            .into_iter()
            .map(|id| (id, UsageRollup::default()))
            .collect();

        for fact in &facts {
            // Models missing from the catalog contribute zero cost, the
            // same fail-open rule metering applied when they were charged.
            let provider_cost = self
                .catalog
                .provider_cost(&fact.model, fact.input_tokens, fact.output_tokens)
                .unwrap_or(Decimal::ZERO);

            totals.absorb(fact, provider_cost);
            by_org
                .entry(fact.org_id)
                .or_default()
                .absorb(fact, provider_cost);
            by_model
                .entry(fact.model.clone())
                .or_default()
                .absorb(fact, provider_cost);
            by_feature
                .entry(fact.feature.clone())
                .or_default()
                .absorb(fact, provider_cost);
        }

        Ok(CostReport {
            window,
            totals,
            by_org,
            by_model,
            by_feature,
            topup_invoice_count: invoices.len(),
            topup_invoice_cents: invoices.iter().map(|i| i.amount_cents).sum(),
        })
    }
}
