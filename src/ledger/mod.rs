//! Append-only ledger with materialized balance projections.

pub mod entry;
#[cfg(feature = "jsonl")]
pub mod journal_jsonl;
pub mod replay;
pub mod store;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod transfer;

pub use entry::{
    BalanceDelta, BalanceRef, EntryId, EntryKind, LedgerEntry, MemberBalance, OrgBalance,
    TopupInvoice, UsageFact,
};
#[cfg(feature = "jsonl")]
pub use journal_jsonl::{JournalConfig, JournalConfigBuilder, JsonlJournal, SyncMode};
pub use replay::{Divergence, ReplayedBalances, replay, verify_consistency};
pub use store::{LedgerStore, MemoryLedgerStore};
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresLedgerStore;
pub use transfer::{AppliedTransfer, Transfer, TransferItem, TransferOp, apply_transfer};

use thiserror::Error;

use crate::config::RetryConfig;
use crate::types::Credits;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient organization credits: requested {requested}, available {available}")]
    InsufficientOrgCredits {
        requested: Credits,
        available: Credits,
    },

    #[error("Insufficient member credits: requested {requested}, available {available}")]
    InsufficientMemberCredits {
        requested: Credits,
        available: Credits,
    },

    #[error("Invalid credit amount: {amount}")]
    InvalidAmount { amount: Credits },

    #[error("Not permitted: {message}")]
    Unauthorized { message: String },

    #[error("Write conflict persisted after {retries} retries")]
    Conflict { retries: u32 },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Expected, frequent outcome surfaced to the caller as an upgrade or
    /// top-up prompt, never treated as exceptional.
    pub fn is_insufficient(&self) -> bool {
        matches!(
            self,
            Self::InsufficientOrgCredits { .. } | Self::InsufficientMemberCredits { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Run a transfer-shaped operation, retrying write conflicts with bounded
/// exponential backoff and symmetrical 10% jitter.
///
/// Lock-based backends never conflict; optimistic backends surface
/// `Conflict`, which is retried up to the configured bound and only then
/// returned to the caller as a transient failure.
pub async fn with_conflict_retry<F, Fut, T>(retry: &RetryConfig, operation: F) -> LedgerResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = LedgerResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = retry.initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && attempt < retry.max_retries => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying transfer after write conflict"
                );
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(retry.max_backoff);
            }
            Err(e) if e.is_conflict() => {
                return Err(LedgerError::Conflict { retries: attempt });
            }
            Err(e) => return Err(e),
        }
    }
}
