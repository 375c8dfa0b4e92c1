//! Usage metering bridge between provider adapters and the ledger.
//!
//! Consumes one completed AI call, prices it through the catalog, records
//! the immutable usage fact, then hands the charge to the deduction
//! processor. Pricing lookups fail open: an unknown model charges zero and
//! the fact is still recorded, because metering must never block the
//! underlying AI call from completing.

use std::sync::Arc;

use chrono::Utc;

use crate::deduction::DeductionProcessor;
use crate::ledger::{LedgerEntry, LedgerError, LedgerResult, LedgerStore, UsageFact};
use crate::pricing::PricingCatalog;
use crate::types::{ActorContext, Credits, Feature, UsageFactId};

/// One completed AI call as reported by a provider adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedCall {
    pub model: String,
    pub provider: String,
    pub feature: Feature,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What happened to the computed charge.
#[derive(Debug)]
pub enum ChargeOutcome {
    /// The deduction landed; entries include the member's and, for
    /// member-routed charges, the org-level mirror.
    Applied(Vec<LedgerEntry>),
    /// The pool could not cover the charge. The usage fact is still
    /// recorded; the caller decides how to surface the shortfall.
    Insufficient(LedgerError),
}

impl ChargeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Result of metering one call: the recorded fact plus the charge outcome.
#[derive(Debug)]
pub struct MeteredUsage {
    pub fact: UsageFact,
    pub outcome: ChargeOutcome,
}

impl MeteredUsage {
    pub fn credits_charged(&self) -> Credits {
        self.fact.credits_charged
    }
}

pub struct UsageMeteringBridge {
    catalog: Arc<PricingCatalog>,
    store: Arc<dyn LedgerStore>,
    deduction: Arc<DeductionProcessor>,
}

impl UsageMeteringBridge {
    pub fn new(
        catalog: Arc<PricingCatalog>,
        store: Arc<dyn LedgerStore>,
        deduction: Arc<DeductionProcessor>,
    ) -> Self {
        Self {
            catalog,
            store,
            deduction,
        }
    }

    /// Meter one completed call: price, record the fact, deduct.
    ///
    /// Only a persistence failure is an `Err`; insufficiency is reported
    /// inside [`MeteredUsage::outcome`] with the fact already recorded.
    pub async fn meter(
        &self,
        ctx: &ActorContext,
        call: CompletedCall,
    ) -> LedgerResult<MeteredUsage> {
        let (credits_charged, free_model) = match self.catalog.get(&call.model) {
            Some(price) => (
                price.charge_cents(call.input_tokens, call.output_tokens),
                price.free,
            ),
            None => {
                tracing::warn!(
                    model = %call.model,
                    provider = %call.provider,
                    "Unknown model in pricing catalog, charging zero credits"
                );
                (0, false)
            }
        };

        let fact = UsageFact {
            id: UsageFactId::new(),
            org_id: ctx.org_id,
            user_id: ctx.user_id,
            model: call.model.clone(),
            provider: call.provider.clone(),
            feature: call.feature.clone(),
            input_tokens: call.input_tokens,
            output_tokens: call.output_tokens,
            free_model,
            credits_charged,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.store.record_usage_fact(fact.clone()).await {
            // The AI call already completed; losing its fact needs an alert,
            // not a silent drop.
            tracing::error!(
                model = %fact.model,
                org = %fact.org_id,
                error = %e,
                "Failed to persist usage fact"
            );
            return Err(e);
        }

        let description = format!(
            "{} usage: {} ({} in / {} out tokens)",
            call.feature, call.model, call.input_tokens, call.output_tokens
        );
        let outcome = match self
            .deduction
            .deduct(ctx, &call.feature, credits_charged, &description, Some(fact.id))
            .await
        {
            Ok(entries) => ChargeOutcome::Applied(entries),
            Err(e) if e.is_insufficient() => ChargeOutcome::Insufficient(e),
            Err(e) => return Err(e),
        };

        Ok(MeteredUsage { fact, outcome })
    }
}
