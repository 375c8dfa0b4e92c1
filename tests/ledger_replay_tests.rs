//! Ledger replay and linearizability properties.

use std::collections::HashMap;

use credit_engine::ledger::replay::replay;
use credit_engine::{
    ActorContext, BalanceRef, CreditEngine, Feature, LedgerEntry, OrgId, UserId,
};

async fn busy_engine() -> (CreditEngine, OrgId) {
    let engine = CreditEngine::builder().build();
    let org = OrgId::new();
    let owner = ActorContext::owner(org, UserId::new());
    let member = UserId::new();
    let member_ctx = ActorContext::member(org, member);
    let feature = Feature::from("content_generation");

    engine.grant_monthly_credits(org, 5_000).await.unwrap();
    engine.grant_topup(org, 500, "in_1").await.unwrap();
    engine.allocate(&owner, member, &feature, 600).await.unwrap();
    engine
        .deduct(&member_ctx, &feature, 450, "usage", None)
        .await
        .unwrap();
    engine.reclaim(&owner, member, &feature, 100).await.unwrap();
    engine
        .deduct(&owner, &feature, 1_200, "usage", None)
        .await
        .unwrap();
    engine
        .deduct(
            &ActorContext::super_admin(org, UserId::new()),
            &feature,
            9_000,
            "platform usage",
            None,
        )
        .await
        .unwrap();
    engine.grant_monthly_credits(org, 5_000).await.unwrap();

    (engine, org)
}

#[tokio::test]
async fn test_folding_the_ledger_reproduces_materialized_balances() {
    let (engine, org) = busy_engine().await;

    let replayed = replay(&engine.ledger_history(org).await.unwrap());
    let stored = engine.balance(org).await.unwrap().unwrap();

    assert_eq!(replayed.pool.monthly_total, stored.monthly_total);
    assert_eq!(replayed.pool.monthly_remaining, stored.monthly_remaining);
    assert_eq!(replayed.pool.topup_remaining, stored.topup_remaining);

    for (user, feature, stored_balance) in engine.member_allocations(org).await.unwrap() {
        let replayed_balance = replayed.allocations.get(&(user, feature)).unwrap();
        assert_eq!(replayed_balance.allocated, stored_balance.allocated);
        assert_eq!(replayed_balance.remaining, stored_balance.remaining);
    }
}

#[tokio::test]
async fn test_verify_consistency_is_clean_after_heavy_use() {
    let (engine, org) = busy_engine().await;
    let divergences = engine.verify_consistency(org).await.unwrap();
    assert!(divergences.is_empty(), "unexpected: {divergences:?}");
}

#[tokio::test]
async fn test_entries_per_balance_are_linearized() {
    let (engine, org) = busy_engine().await;
    let history = engine.ledger_history(org).await.unwrap();

    // Per balance row, each entry picks up exactly where the previous one
    // left off. Zero-delta mirrors participate without moving the chain.
    let mut last_after: HashMap<BalanceRef, i64> = HashMap::new();
    for entry in &history {
        if let Some(previous) = last_after.get(&entry.balance) {
            assert_eq!(
                entry.balance_before, *previous,
                "chain broken at {}: {:?}",
                entry.id, entry
            );
        }
        last_after.insert(entry.balance.clone(), entry.balance_after);
    }
}

#[tokio::test]
async fn test_signed_amounts_reconcile_with_balance_steps() {
    let (engine, org) = busy_engine().await;
    let history = engine.ledger_history(org).await.unwrap();

    for entry in history.iter().filter(|e| !e.delta.is_zero()) {
        assert_eq!(
            entry.balance_after - entry.balance_before,
            effective_delta(entry),
            "amount disagrees with step at {}",
            entry.id
        );
    }
}

fn effective_delta(entry: &LedgerEntry) -> i64 {
    match entry.delta {
        credit_engine::BalanceDelta::Org {
            monthly, topup, ..
        } => monthly + topup,
        credit_engine::BalanceDelta::Member { remaining, .. } => remaining,
    }
}
