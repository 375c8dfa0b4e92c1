//! The atomic transfer primitive.
//!
//! Every credit mutation is a [`Transfer`]: a list of operations applied
//! all-or-nothing against one organization's balances. Backends hold their
//! lock (or row-lock transaction) for the duration of [`apply_transfer`],
//! so insufficiency aborts the whole transfer with no partial effect.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{Credits, Feature, OrgId, UsageFactId, UserId};

use super::entry::{
    BalanceDelta, BalanceRef, EntryId, EntryKind, LedgerEntry, MemberBalance, OrgBalance,
};
use super::{LedgerError, LedgerResult};

/// One balance mutation within a transfer.
///
/// Org-scoped operations target the transfer's organization pool; member
/// operations name the allocation row they touch.
#[derive(Clone, Debug, PartialEq)]
pub enum TransferOp {
    /// Set the monthly tier: total and remaining become `amount`.
    GrantMonthly {
        amount: Credits,
        period_end: Option<DateTime<Utc>>,
    },
    /// Credit the non-expiring top-up tier.
    GrantTopup { amount: Credits },
    /// Debit the org pool, monthly tier first.
    ///
    /// With `allow_negative` the top-up tier absorbs the excess below zero;
    /// otherwise the op fails on insufficient effective balance.
    SpendOrg { amount: Credits, allow_negative: bool },
    /// Debit a member allocation's remaining credits.
    SpendMember {
        user_id: UserId,
        feature: Feature,
        amount: Credits,
    },
    /// Grow a member allocation (allocated and remaining both rise).
    AllocateMember {
        user_id: UserId,
        feature: Feature,
        amount: Credits,
    },
    /// Shrink a member allocation (allocated and remaining both fall).
    ReclaimMember {
        user_id: UserId,
        feature: Feature,
        amount: Credits,
    },
    /// Manual correction of the org tiers, unchecked.
    AdminAdjust {
        monthly_delta: Credits,
        topup_delta: Credits,
    },
    /// Zero every org tier, e.g. on subscription cancellation.
    ZeroPool,
    /// Append an org-level entry with zero delta. Carries the signed
    /// amount for reporting without touching the balance.
    RecordOnly { amount: Credits },
}

/// Entry draft paired with the operation that produces it.
#[derive(Clone, Debug)]
pub struct TransferItem {
    pub op: TransferOp,
    pub kind: EntryKind,
    pub description: String,
    pub usage_fact_id: Option<UsageFactId>,
}

impl TransferItem {
    pub fn new(op: TransferOp, kind: EntryKind, description: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            description: description.into(),
            usage_fact_id: None,
        }
    }

    pub fn with_usage_fact(mut self, id: UsageFactId) -> Self {
        self.usage_fact_id = Some(id);
        self
    }
}

/// A logical transaction against one organization's balances.
#[derive(Clone, Debug)]
pub struct Transfer {
    pub org_id: OrgId,
    pub actor_id: UserId,
    pub items: Vec<TransferItem>,
}

impl Transfer {
    pub fn new(org_id: OrgId, actor_id: UserId) -> Self {
        Self {
            org_id,
            actor_id,
            items: Vec::new(),
        }
    }

    pub fn item(mut self, item: TransferItem) -> Self {
        self.items.push(item);
        self
    }
}

/// Balances as a transfer left them, plus the entries it appended.
#[derive(Debug)]
pub struct AppliedTransfer {
    pub entries: Vec<LedgerEntry>,
    /// New org pool state, when any op touched it.
    pub pool: Option<OrgBalance>,
    /// New member allocation rows, keyed by (user, feature).
    pub allocations: HashMap<(UserId, Feature), MemberBalance>,
}

/// Apply a transfer against a snapshot of the org's balances.
///
/// Pure with respect to storage: the caller supplies the current pool row
/// and a lookup for member rows, and commits the returned state under
/// whatever atomicity it guarantees. Errors leave nothing to commit.
pub fn apply_transfer<F>(
    transfer: &Transfer,
    pool: Option<OrgBalance>,
    mut member_lookup: F,
    now: DateTime<Utc>,
) -> LedgerResult<AppliedTransfer>
where
    F: FnMut(UserId, &Feature) -> Option<MemberBalance>,
{
    let mut pool = pool.unwrap_or_default();
    let mut pool_touched = false;
    let mut members: HashMap<(UserId, Feature), (MemberBalance, bool)> = HashMap::new();
    let mut entries = Vec::with_capacity(transfer.items.len());

    for item in &transfer.items {
        let entry = match &item.op {
            TransferOp::GrantMonthly { amount, period_end } => {
                require_non_negative(*amount)?;
                pool_touched = true;
                let before = pool.effective();
                let total_delta = amount - pool.monthly_total;
                let monthly_delta = amount - pool.monthly_remaining;
                pool.monthly_total = *amount;
                pool.monthly_remaining = *amount;
                if period_end.is_some() {
                    pool.period_end = *period_end;
                }
                org_entry(
                    transfer,
                    item,
                    monthly_delta,
                    before,
                    pool.effective(),
                    BalanceDelta::Org {
                        monthly_total: total_delta,
                        monthly: monthly_delta,
                        topup: 0,
                        period_end: *period_end,
                    },
                    now,
                )
            }
            TransferOp::GrantTopup { amount } => {
                require_non_negative(*amount)?;
                pool_touched = true;
                let before = pool.effective();
                pool.topup_remaining += amount;
                org_entry(
                    transfer,
                    item,
                    *amount,
                    before,
                    pool.effective(),
                    BalanceDelta::Org {
                        monthly_total: 0,
                        monthly: 0,
                        topup: *amount,
                        period_end: None,
                    },
                    now,
                )
            }
            TransferOp::SpendOrg {
                amount,
                allow_negative,
            } => {
                require_non_negative(*amount)?;
                pool_touched = true;
                let before = pool.effective();
                if !allow_negative && before < *amount {
                    return Err(LedgerError::InsufficientOrgCredits {
                        requested: *amount,
                        available: before,
                    });
                }
                // Monthly first; top-up is the overflow tier and holds
                // any negative excess a super-admin is allowed to create.
                let from_monthly = pool.monthly_remaining.min(*amount).max(0);
                let from_topup = amount - from_monthly;
                pool.monthly_remaining -= from_monthly;
                pool.topup_remaining -= from_topup;
                org_entry(
                    transfer,
                    item,
                    -amount,
                    before,
                    pool.effective(),
                    BalanceDelta::Org {
                        monthly_total: 0,
                        monthly: -from_monthly,
                        topup: -from_topup,
                        period_end: None,
                    },
                    now,
                )
            }
            TransferOp::SpendMember {
                user_id,
                feature,
                amount,
            } => {
                require_non_negative(*amount)?;
                let balance = member_mut(&mut members, &mut member_lookup, *user_id, feature);
                if balance.remaining < *amount {
                    return Err(LedgerError::InsufficientMemberCredits {
                        requested: *amount,
                        available: balance.remaining,
                    });
                }
                let before = balance.remaining;
                balance.remaining -= amount;
                member_entry(
                    transfer,
                    item,
                    *user_id,
                    feature,
                    -amount,
                    before,
                    balance.remaining,
                    BalanceDelta::Member {
                        allocated: 0,
                        remaining: -amount,
                    },
                    now,
                )
            }
            TransferOp::AllocateMember {
                user_id,
                feature,
                amount,
            } => {
                require_non_negative(*amount)?;
                let balance = member_mut(&mut members, &mut member_lookup, *user_id, feature);
                let before = balance.remaining;
                balance.allocated += amount;
                balance.remaining += amount;
                member_entry(
                    transfer,
                    item,
                    *user_id,
                    feature,
                    *amount,
                    before,
                    balance.remaining,
                    BalanceDelta::Member {
                        allocated: *amount,
                        remaining: *amount,
                    },
                    now,
                )
            }
            TransferOp::ReclaimMember {
                user_id,
                feature,
                amount,
            } => {
                require_non_negative(*amount)?;
                let balance = member_mut(&mut members, &mut member_lookup, *user_id, feature);
                if balance.remaining < *amount {
                    return Err(LedgerError::InsufficientMemberCredits {
                        requested: *amount,
                        available: balance.remaining,
                    });
                }
                let before = balance.remaining;
                balance.allocated -= amount;
                balance.remaining -= amount;
                member_entry(
                    transfer,
                    item,
                    *user_id,
                    feature,
                    -amount,
                    before,
                    balance.remaining,
                    BalanceDelta::Member {
                        allocated: -amount,
                        remaining: -amount,
                    },
                    now,
                )
            }
            TransferOp::AdminAdjust {
                monthly_delta,
                topup_delta,
            } => {
                pool_touched = true;
                let before = pool.effective();
                pool.monthly_remaining += monthly_delta;
                pool.topup_remaining += topup_delta;
                // Adjustments never leave remaining above total.
                let total_delta = if pool.monthly_remaining > pool.monthly_total {
                    let d = pool.monthly_remaining - pool.monthly_total;
                    pool.monthly_total = pool.monthly_remaining;
                    d
                } else {
                    0
                };
                org_entry(
                    transfer,
                    item,
                    monthly_delta + topup_delta,
                    before,
                    pool.effective(),
                    BalanceDelta::Org {
                        monthly_total: total_delta,
                        monthly: *monthly_delta,
                        topup: *topup_delta,
                        period_end: None,
                    },
                    now,
                )
            }
            TransferOp::ZeroPool => {
                pool_touched = true;
                let before = pool.effective();
                let delta = BalanceDelta::Org {
                    monthly_total: -pool.monthly_total,
                    monthly: -pool.monthly_remaining,
                    topup: -pool.topup_remaining,
                    period_end: None,
                };
                pool = OrgBalance {
                    period_end: pool.period_end,
                    ..OrgBalance::default()
                };
                org_entry(transfer, item, -before, before, 0, delta, now)
            }
            TransferOp::RecordOnly { amount } => {
                let balance = pool.effective();
                org_entry(
                    transfer,
                    item,
                    *amount,
                    balance,
                    balance,
                    BalanceDelta::zero_org(),
                    now,
                )
            }
        };
        entries.push(entry);
    }

    let allocations = members
        .into_iter()
        .filter(|(_, (balance, existed))| *existed || *balance != MemberBalance::default())
        .map(|(key, (balance, _))| (key, balance))
        .collect();

    Ok(AppliedTransfer {
        entries,
        pool: pool_touched.then_some(pool),
        allocations,
    })
}

fn require_non_negative(amount: Credits) -> LedgerResult<()> {
    if amount < 0 {
        return Err(LedgerError::InvalidAmount { amount });
    }
    Ok(())
}

fn member_mut<'a, F>(
    members: &'a mut HashMap<(UserId, Feature), (MemberBalance, bool)>,
    lookup: &mut F,
    user_id: UserId,
    feature: &Feature,
) -> &'a mut MemberBalance
where
    F: FnMut(UserId, &Feature) -> Option<MemberBalance>,
{
    let (balance, _) = members
        .entry((user_id, feature.clone()))
        .or_insert_with(|| match lookup(user_id, feature) {
            Some(existing) => (existing, true),
            None => (MemberBalance::default(), false),
        });
    balance
}

#[allow(clippy::too_many_arguments)]
fn org_entry(
    transfer: &Transfer,
    item: &TransferItem,
    amount: Credits,
    before: Credits,
    after: Credits,
    delta: BalanceDelta,
    now: DateTime<Utc>,
) -> LedgerEntry {
    LedgerEntry {
        id: EntryId::new(),
        org_id: transfer.org_id,
        actor_id: transfer.actor_id,
        balance: BalanceRef::org(transfer.org_id),
        kind: item.kind,
        amount,
        balance_before: before,
        balance_after: after,
        delta,
        description: item.description.clone(),
        usage_fact_id: item.usage_fact_id,
        created_at: now,
    }
}

#[allow(clippy::too_many_arguments)]
fn member_entry(
    transfer: &Transfer,
    item: &TransferItem,
    user_id: UserId,
    feature: &Feature,
    amount: Credits,
    before: Credits,
    after: Credits,
    delta: BalanceDelta,
    now: DateTime<Utc>,
) -> LedgerEntry {
    LedgerEntry {
        id: EntryId::new(),
        org_id: transfer.org_id,
        actor_id: transfer.actor_id,
        balance: BalanceRef::member(transfer.org_id, user_id, feature.clone()),
        kind: item.kind,
        amount,
        balance_before: before,
        balance_after: after,
        delta,
        description: item.description.clone(),
        usage_fact_id: item.usage_fact_id,
        created_at: now,
    }
}
