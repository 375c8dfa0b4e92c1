//! Ledger entry and balance types.
//!
//! Entries are append-only and immutable once written; the materialized
//! balance rows are projections that must stay derivable from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Credits, Feature, OrgId, UsageFactId, UserId};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of balance-affecting event an entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// Initial monthly grant on subscription activation.
    Grant,
    /// Monthly credits reset to total on cycle renewal.
    SubscriptionRenewal,
    /// Non-expiring credits purchased outside the cycle.
    Topup,
    /// Org-pool debit backing a member allocation.
    AllocationOut,
    /// Member-allocation credit carved out of the org pool.
    AllocationIn,
    /// Member-allocation debit returning credits to the org.
    ReclaimOut,
    /// Org-pool credit from a reclaimed allocation.
    ReclaimIn,
    /// Metered AI usage charged against a pool.
    UsageDeduction,
    /// Manual correction or cancellation zeroing.
    AdminAdjustment,
}

/// Which balance row an entry applies to.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum BalanceRef {
    Org {
        org_id: OrgId,
    },
    Member {
        org_id: OrgId,
        user_id: UserId,
        feature: Feature,
    },
}

impl BalanceRef {
    pub fn org(org_id: OrgId) -> Self {
        Self::Org { org_id }
    }

    pub fn member(org_id: OrgId, user_id: UserId, feature: Feature) -> Self {
        Self::Member {
            org_id,
            user_id,
            feature,
        }
    }

    pub fn org_id(&self) -> OrgId {
        match self {
            Self::Org { org_id } | Self::Member { org_id, .. } => *org_id,
        }
    }
}

/// Exact per-tier change an entry applied to its balance row.
///
/// Stored alongside the signed amount so replay reconstructs balances from
/// recorded deltas instead of re-deriving tier routing. Mirror entries carry
/// a zero delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum BalanceDelta {
    Org {
        monthly_total: Credits,
        monthly: Credits,
        topup: Credits,
        /// New cycle boundary when a grant moved it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        period_end: Option<DateTime<Utc>>,
    },
    Member {
        allocated: Credits,
        remaining: Credits,
    },
}

impl BalanceDelta {
    pub fn zero_org() -> Self {
        Self::Org {
            monthly_total: 0,
            monthly: 0,
            topup: 0,
            period_end: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Self::Org {
                monthly_total,
                monthly,
                topup,
                ..
            } => *monthly_total == 0 && *monthly == 0 && *topup == 0,
            Self::Member {
                allocated,
                remaining,
            } => *allocated == 0 && *remaining == 0,
        }
    }
}

/// Organization-level credit pool.
///
/// The monthly tier is cycle-scoped and stays within `[0, monthly_total]`;
/// the top-up tier never expires and absorbs the negative excess a
/// super-admin deduction is allowed to create.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgBalance {
    pub monthly_total: Credits,
    pub monthly_remaining: Credits,
    pub topup_remaining: Credits,
    pub period_end: Option<DateTime<Utc>>,
}

impl OrgBalance {
    /// Spendable balance across both tiers.
    pub fn effective(&self) -> Credits {
        self.monthly_remaining + self.topup_remaining
    }
}

/// Per-member, per-feature carve-out of the org pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberBalance {
    pub allocated: Credits,
    pub remaining: Credits,
}

/// One immutable record of a balance-affecting event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub org_id: OrgId,
    /// User the event is attributed to; `UserId::system()` for webhook grants.
    pub actor_id: UserId,
    pub balance: BalanceRef,
    pub kind: EntryKind,
    /// Signed credit amount: grants positive, debits negative.
    pub amount: Credits,
    /// Effective balance of the referenced row before this entry.
    pub balance_before: Credits,
    /// Effective balance of the referenced row after this entry.
    pub balance_after: Credits,
    pub delta: BalanceDelta,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_fact_id: Option<UsageFactId>,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one metered AI call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageFact {
    pub id: UsageFactId,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub model: String,
    pub provider: String,
    pub feature: Feature,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub free_model: bool,
    pub credits_charged: Credits,
    pub recorded_at: DateTime<Utc>,
}

/// Paid top-up invoice, recorded for the aggregator's revenue cross-check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopupInvoice {
    /// External invoice id as reported by the payment webhook.
    pub id: String,
    pub org_id: OrgId,
    pub amount_cents: Credits,
    pub paid_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind_serde_kebab_case() {
        let json = serde_json::to_string(&EntryKind::SubscriptionRenewal).unwrap();
        assert_eq!(json, "\"subscription-renewal\"");
        let json = serde_json::to_string(&EntryKind::UsageDeduction).unwrap();
        assert_eq!(json, "\"usage-deduction\"");
    }

    #[test]
    fn test_effective_balance_spans_tiers() {
        let pool = OrgBalance {
            monthly_total: 1000,
            monthly_remaining: 400,
            topup_remaining: 250,
            period_end: None,
        };
        assert_eq!(pool.effective(), 650);
    }

    #[test]
    fn test_zero_delta_detection() {
        assert!(BalanceDelta::zero_org().is_zero());
        assert!(
            BalanceDelta::Member {
                allocated: 0,
                remaining: 0
            }
            .is_zero()
        );
        assert!(
            !BalanceDelta::Member {
                allocated: 0,
                remaining: -5
            }
            .is_zero()
        );
    }

    #[test]
    fn test_balance_ref_org_id() {
        let org = OrgId::new();
        let member = BalanceRef::member(org, UserId::new(), Feature::from("chat"));
        assert_eq!(member.org_id(), org);
        assert_eq!(BalanceRef::org(org).org_id(), org);
    }
}
