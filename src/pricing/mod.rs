//! Model pricing catalog for charge computation and cost reporting.
//!
//! Prices are USD per million tokens. The catalog is versionless: the latest
//! registered entry for a model id wins, and reports recompute provider cost
//! from the catalog current at report time.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::Credits;

/// Markup applied over provider cost when none is configured explicitly.
pub const DEFAULT_MARKUP: Decimal = dec!(1.5);

const TOKENS_PER_UNIT: Decimal = dec!(1_000_000);
const CENTS_PER_USD: Decimal = dec!(100);

/// Pricing for one model id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// USD per million input tokens.
    pub input_per_mtok: Decimal,
    /// USD per million output tokens.
    pub output_per_mtok: Decimal,
    /// Revenue multiplier over provider cost.
    pub markup: Decimal,
    /// Free-tier models always charge zero credits.
    pub free: bool,
}

impl ModelPrice {
    pub fn new(input_per_mtok: Decimal, output_per_mtok: Decimal, markup: Decimal) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
            markup,
            free: false,
        }
    }

    pub fn free_tier() -> Self {
        Self {
            input_per_mtok: Decimal::ZERO,
            output_per_mtok: Decimal::ZERO,
            markup: Decimal::ONE,
            free: true,
        }
    }

    /// True provider cost in USD for a token volume.
    pub fn provider_cost(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        Decimal::from(input_tokens) / TOKENS_PER_UNIT * self.input_per_mtok
            + Decimal::from(output_tokens) / TOKENS_PER_UNIT * self.output_per_mtok
    }

    /// Credits to charge for a token volume: markup-priced cost in cents,
    /// rounded up so fractional cents are never given away.
    pub fn charge_cents(&self, input_tokens: u64, output_tokens: u64) -> Credits {
        if self.free {
            return 0;
        }
        let cents = self.provider_cost(input_tokens, output_tokens) * self.markup * CENTS_PER_USD;
        cents.ceil().to_i64().unwrap_or(i64::MAX)
    }
}

/// Lookup table of model prices.
#[derive(Debug, Clone, Default)]
pub struct PricingCatalog {
    models: HashMap<String, ModelPrice>,
}

impl PricingCatalog {
    pub fn builder() -> PricingCatalogBuilder {
        PricingCatalogBuilder::new()
    }

    /// `None` means the model is unknown; callers fail open (zero charge).
    pub fn get(&self, model: &str) -> Option<&ModelPrice> {
        self.models.get(model)
    }

    pub fn provider_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<Decimal> {
        self.get(model)
            .map(|p| p.provider_cost(input_tokens, output_tokens))
    }

    pub fn charge_for(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<Credits> {
        self.get(model)
            .map(|p| p.charge_cents(input_tokens, output_tokens))
    }

    /// All known model ids, sorted. Reports list every model, active or not.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[derive(Debug)]
pub struct PricingCatalogBuilder {
    models: HashMap<String, ModelPrice>,
    default_markup: Decimal,
}

impl Default for PricingCatalogBuilder {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            default_markup: DEFAULT_MARKUP,
        }
    }
}

impl PricingCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Markup used by [`Self::model_base`] registrations that follow.
    pub fn default_markup(mut self, markup: Decimal) -> Self {
        self.default_markup = markup;
        self
    }

    pub fn model(mut self, id: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(id.into(), price);
        self
    }

    pub fn model_base(self, id: impl Into<String>, input: Decimal, output: Decimal) -> Self {
        let markup = self.default_markup;
        self.model(id, ModelPrice::new(input, output, markup))
    }

    pub fn free_model(self, id: impl Into<String>) -> Self {
        self.model(id, ModelPrice::free_tier())
    }

    /// Override the default markup from `CREDIT_ENGINE_MARKUP` when set.
    pub fn from_env(mut self) -> Self {
        if let Some(markup) = std::env::var("CREDIT_ENGINE_MARKUP")
            .ok()
            .and_then(|raw| raw.parse::<Decimal>().ok())
        {
            self.default_markup = markup;
        }
        self
    }

    pub fn build(self) -> PricingCatalog {
        PricingCatalog {
            models: self.models,
        }
    }
}
