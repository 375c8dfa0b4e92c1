//! Prelude module for convenient imports.
//!
//! Re-exports the types most callers need to grant, allocate, meter, and
//! report on credits.
//!
//! # Usage
//!
//! ```rust
//! use credit_engine::prelude::*;
//! ```

// Engine
pub use crate::CreditEngine;
pub use crate::CreditEngineBuilder;
pub use crate::EngineConfig;

// Identifiers and context
pub use crate::types::{ActorContext, ActorRole, Credits, Feature, OrgId, TimeWindow, UserId};

// Ledger
pub use crate::ledger::{
    EntryKind, LedgerEntry, LedgerError, LedgerResult, LedgerStore, MemberBalance,
    MemoryLedgerStore, OrgBalance,
};

// Metering and pricing
pub use crate::metering::{ChargeOutcome, CompletedCall, MeteredUsage};
pub use crate::pricing::{ModelPrice, PricingCatalog};

// Notifications
pub use crate::notify::{NotificationRequest, NotificationSink};

// Reporting
pub use crate::report::CostReport;
