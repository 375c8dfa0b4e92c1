//! Ledger replay and balance reconciliation.
//!
//! Balances are materialized counters for performance, but the ledger is the
//! source of truth: folding an organization's entries in order must
//! reproduce the stored rows exactly. [`verify_consistency`] is the repair
//! tool that checks for divergence.

use std::collections::HashMap;

use crate::types::{Credits, Feature, OrgId, UserId};

use super::entry::{BalanceDelta, BalanceRef, LedgerEntry, MemberBalance, OrgBalance};
use super::store::LedgerStore;
use super::LedgerResult;

/// Balances reconstructed by folding ledger entries.
#[derive(Debug, Default, PartialEq)]
pub struct ReplayedBalances {
    pub pool: OrgBalance,
    pub allocations: HashMap<(UserId, Feature), MemberBalance>,
}

/// Fold entries in order into balance state.
///
/// Entries carry the exact per-tier delta they applied, so replay is a pure
/// sum, independent of tier-routing rules in force when they were written.
pub fn replay(entries: &[LedgerEntry]) -> ReplayedBalances {
    let mut replayed = ReplayedBalances::default();

    for entry in entries {
        match (&entry.balance, &entry.delta) {
            (
                BalanceRef::Org { .. },
                BalanceDelta::Org {
                    monthly_total,
                    monthly,
                    topup,
                    period_end,
                },
            ) => {
                replayed.pool.monthly_total += monthly_total;
                replayed.pool.monthly_remaining += monthly;
                replayed.pool.topup_remaining += topup;
                if period_end.is_some() {
                    replayed.pool.period_end = *period_end;
                }
            }
            (
                BalanceRef::Member {
                    user_id, feature, ..
                },
                BalanceDelta::Member {
                    allocated,
                    remaining,
                },
            ) => {
                let balance = replayed
                    .allocations
                    .entry((*user_id, feature.clone()))
                    .or_default();
                balance.allocated += allocated;
                balance.remaining += remaining;
            }
            (balance, _) => {
                // An org delta on a member row (or vice versa) means the
                // writer was broken; surface it loudly in reconciliation runs.
                tracing::error!(balance = ?balance, entry = %entry.id, "ledger entry delta scope mismatch");
            }
        }
    }

    replayed
}

/// One counter that disagrees between ledger replay and the stored row.
#[derive(Clone, Debug, PartialEq)]
pub struct Divergence {
    pub balance: BalanceRef,
    pub field: &'static str,
    pub ledger: Credits,
    pub materialized: Credits,
}

/// Replay an organization's ledger and compare against its stored balances.
///
/// Returns one [`Divergence`] per disagreeing counter; an empty result means
/// the materialized rows are exactly reconstructible.
pub async fn verify_consistency(
    store: &dyn LedgerStore,
    org_id: OrgId,
) -> LedgerResult<Vec<Divergence>> {
    let entries = store.entries_for_org(org_id).await?;
    let replayed = replay(&entries);

    let mut divergences = Vec::new();
    let org_ref = BalanceRef::org(org_id);

    let stored_pool = store.org_balance(org_id).await?.unwrap_or_default();
    for (field, ledger, materialized) in [
        (
            "monthly_total",
            replayed.pool.monthly_total,
            stored_pool.monthly_total,
        ),
        (
            "monthly_remaining",
            replayed.pool.monthly_remaining,
            stored_pool.monthly_remaining,
        ),
        (
            "topup_remaining",
            replayed.pool.topup_remaining,
            stored_pool.topup_remaining,
        ),
    ] {
        if ledger != materialized {
            divergences.push(Divergence {
                balance: org_ref.clone(),
                field,
                ledger,
                materialized,
            });
        }
    }

    let mut stored_allocations: HashMap<(UserId, Feature), MemberBalance> = store
        .all_member_allocations(org_id)
        .await?
        .into_iter()
        .map(|(user, feature, balance)| ((user, feature), balance))
        .collect();

    for ((user, feature), ledger_balance) in &replayed.allocations {
        let stored = stored_allocations
            .remove(&(*user, feature.clone()))
            .unwrap_or_default();
        push_member_divergences(
            &mut divergences,
            org_id,
            *user,
            feature,
            *ledger_balance,
            stored,
        );
    }
    // Rows the ledger never mentions should not exist with credit in them.
    for ((user, feature), stored) in stored_allocations {
        push_member_divergences(
            &mut divergences,
            org_id,
            user,
            &feature,
            MemberBalance::default(),
            stored,
        );
    }

    Ok(divergences)
}

fn push_member_divergences(
    divergences: &mut Vec<Divergence>,
    org_id: OrgId,
    user: UserId,
    feature: &Feature,
    ledger: MemberBalance,
    materialized: MemberBalance,
) {
    let balance_ref = BalanceRef::member(org_id, user, feature.clone());
    if ledger.allocated != materialized.allocated {
        divergences.push(Divergence {
            balance: balance_ref.clone(),
            field: "allocated",
            ledger: ledger.allocated,
            materialized: materialized.allocated,
        });
    }
    if ledger.remaining != materialized.remaining {
        divergences.push(Divergence {
            balance: balance_ref,
            field: "remaining",
            ledger: ledger.remaining,
            materialized: materialized.remaining,
        });
    }
}
