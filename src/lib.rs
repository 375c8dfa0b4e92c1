//! # credit-engine
//!
//! Multi-tenant AI-credit accounting and allocation engine.
//!
//! Tracks how many credits (prepaid AI-usage budget, 1 credit = 1 cent)
//! each organization owns, how organizations carve credits out for
//! individual members per feature, how metered usage is deducted, and how
//! raw usage reconciles into cost, revenue, and margin figures. Every
//! mutation is one atomic ledger transfer, so balances never go negative
//! for ordinary actors and the append-only ledger always reproduces the
//! materialized counters.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use credit_engine::{ActorContext, CreditEngine, Feature, OrgId, UserId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), credit_engine::LedgerError> {
//!     let engine = CreditEngine::builder().build();
//!
//!     let org = OrgId::new();
//!     let owner = ActorContext::owner(org, UserId::new());
//!     let member = UserId::new();
//!     let feature = Feature::from("content_generation");
//!
//!     engine.grant_monthly_credits(org, 10_000).await?;
//!     engine.allocate(&owner, member, &feature, 1_000).await?;
//!
//!     let member_ctx = ActorContext::member(org, member);
//!     engine
//!         .deduct(&member_ctx, &feature, 250, "Generated article", None)
//!         .await?;
//!
//!     let balance = engine.balance(org).await?.unwrap();
//!     println!("effective org balance: {}", balance.effective());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres`: row-locking [`ledger::PostgresLedgerStore`] backend via sqlx.
//! - `jsonl`: append-only [`ledger::JsonlJournal`] audit mirror.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod allocation;
pub mod config;
pub mod deduction;
pub mod directory;
pub mod engine;
pub mod ledger;
pub mod metering;
pub mod notify;
pub mod prelude;
pub mod pricing;
pub mod report;
pub mod types;

// Re-exports for convenience
pub use allocation::AllocationManager;
pub use config::{EngineConfig, EngineConfigBuilder, RetryConfig};
pub use deduction::DeductionProcessor;
pub use directory::{MemoryDirectory, OrgDirectory};
pub use engine::{CreditEngine, CreditEngineBuilder};
#[cfg(feature = "jsonl")]
pub use ledger::{JournalConfig, JournalConfigBuilder, JsonlJournal, SyncMode};
pub use ledger::{
    BalanceDelta, BalanceRef, Divergence, EntryId, EntryKind, LedgerEntry, LedgerError,
    LedgerResult, LedgerStore, MemberBalance, MemoryLedgerStore, OrgBalance, TopupInvoice,
    Transfer, TransferItem, TransferOp, UsageFact, with_conflict_retry,
};
#[cfg(feature = "postgres")]
pub use ledger::PostgresLedgerStore;
pub use metering::{ChargeOutcome, CompletedCall, MeteredUsage, UsageMeteringBridge};
pub use notify::{
    MemorySink, NotificationKind, NotificationRequest, NotificationSink, NullSink,
    crossed_low_threshold,
};
pub use pricing::{ModelPrice, PricingCatalog, PricingCatalogBuilder};
pub use report::{CostAggregator, CostReport, UsageRollup};
pub use types::{
    ActorContext, ActorRole, Credits, Feature, OrgId, TimeWindow, UsageFactId, UserId,
};
