//! End-to-end scenarios through the engine facade.

use std::sync::Arc;

use rust_decimal_macros::dec;

use credit_engine::{
    ActorContext, ChargeOutcome, CompletedCall, CreditEngine, Credits, EntryKind, Feature,
    LedgerError, MemoryDirectory, MemorySink, NotificationKind, OrgId, PricingCatalog, TimeWindow,
    UserId,
};

struct Harness {
    engine: CreditEngine,
    sink: Arc<MemorySink>,
    directory: Arc<MemoryDirectory>,
    org: OrgId,
    owner: ActorContext,
}

fn harness() -> Harness {
    let sink = Arc::new(MemorySink::new());
    let directory = Arc::new(MemoryDirectory::new());
    let org = OrgId::new();
    let owner = ActorContext::owner(org, UserId::new());
    directory.add_admin(org, owner.user_id);

    let catalog = PricingCatalog::builder()
        .default_markup(dec!(1.5))
        .model_base("gpt-test-large", dec!(1), dec!(2))
        .free_model("gpt-test-mini")
        .build();

    let engine = CreditEngine::builder()
        .catalog(catalog)
        .notification_sink_arc(sink.clone())
        .directory_arc(directory.clone())
        .build();

    Harness {
        engine,
        sink,
        directory,
        org,
        owner,
    }
}

/// Conserved quantity: org tiers plus every member allocation's remaining.
async fn org_total(h: &Harness) -> Credits {
    let pool = h.engine.balance(h.org).await.unwrap().unwrap();
    let allocations: Credits = h
        .engine
        .member_allocations(h.org)
        .await
        .unwrap()
        .iter()
        .map(|(_, _, balance)| balance.remaining)
        .sum();
    pool.effective() + allocations
}

#[tokio::test]
async fn test_scenario_owner_deductions_against_monthly_pool() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 1000).await.unwrap();
    let feature = Feature::from("chat");

    // Over-deduction rejected, balance untouched.
    let err = h
        .engine
        .deduct(&h.owner, &feature, 1200, "usage", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientOrgCredits {
            requested: 1200,
            available: 1000
        }
    ));
    assert_eq!(h.engine.balance(h.org).await.unwrap().unwrap().effective(), 1000);

    // Exact drain succeeds.
    h.engine
        .deduct(&h.owner, &feature, 1000, "usage", None)
        .await
        .unwrap();
    let pool = h.engine.balance(h.org).await.unwrap().unwrap();
    assert_eq!(pool.monthly_remaining, 0);

    // One more credit is one too many.
    let err = h
        .engine
        .deduct(&h.owner, &feature, 1, "usage", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientOrgCredits { .. }));
}

#[tokio::test]
async fn test_scenario_low_balance_notices_fire_on_crossing_only() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 1000).await.unwrap();
    let member = UserId::new();
    let member_ctx = ActorContext::member(h.org, member);
    let feature = Feature::from("content_generation");

    h.engine
        .allocate(&h.owner, member, &feature, 100)
        .await
        .unwrap();
    let allocated_notice = h.sink.take();
    assert_eq!(allocated_notice.len(), 1);
    assert_eq!(allocated_notice[0].kind, NotificationKind::CreditsAllocated);

    // 100 -> 15 crosses the 20% line: member and each admin notified.
    h.engine
        .deduct(&member_ctx, &feature, 85, "usage", None)
        .await
        .unwrap();
    let low_notices = h.sink.take();
    assert_eq!(low_notices.len(), 2);
    assert!(
        low_notices
            .iter()
            .all(|r| r.kind == NotificationKind::LowBalance)
    );
    assert!(low_notices.iter().any(|r| r.user_id == member));
    assert!(low_notices.iter().any(|r| r.user_id == h.owner.user_id));

    // Further deductions below the line stay silent.
    h.engine
        .deduct(&member_ctx, &feature, 1, "usage", None)
        .await
        .unwrap();
    assert!(h.sink.take().is_empty());

    let allocation = h
        .engine
        .member_allocation(h.org, member, &feature)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocation.remaining, 14);
}

#[tokio::test]
async fn test_scenario_reclaim_returns_to_topup_tier() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 1000).await.unwrap();
    let member = UserId::new();
    let feature = Feature::from("content_generation");

    h.engine
        .allocate(&h.owner, member, &feature, 100)
        .await
        .unwrap();
    h.engine
        .deduct(
            &ActorContext::member(h.org, member),
            &feature,
            85,
            "usage",
            None,
        )
        .await
        .unwrap();

    h.engine
        .reclaim(&h.owner, member, &feature, 15)
        .await
        .unwrap();

    let allocation = h
        .engine
        .member_allocation(h.org, member, &feature)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocation.remaining, 0);

    let pool = h.engine.balance(h.org).await.unwrap().unwrap();
    assert_eq!(pool.topup_remaining, 15);
    assert_eq!(pool.monthly_remaining, 900);
}

#[tokio::test]
async fn test_scenario_metered_usage_reconciles_in_report() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 10_000).await.unwrap();

    let metered = h
        .engine
        .meter(
            &h.owner,
            CompletedCall {
                model: "gpt-test-large".to_string(),
                provider: "openai".to_string(),
                feature: Feature::from("content_generation"),
                input_tokens: 2_000_000,
                output_tokens: 500_000,
            },
        )
        .await
        .unwrap();

    // $3.00 provider cost at 1.5 markup = 450 credits.
    assert_eq!(metered.credits_charged(), 450);
    assert!(matches!(metered.outcome, ChargeOutcome::Applied(_)));

    let report = h
        .engine
        .cost_report(TimeWindow::last_days(1), Some(h.org))
        .await
        .unwrap();
    assert_eq!(report.totals.provider_cost_usd, dec!(3.00));
    assert_eq!(report.totals.credits_charged, 450);
    assert_eq!(report.totals.profit_usd(), dec!(1.50));
    // The full catalog shows up even where usage touched one model.
    assert!(report.by_model.contains_key("gpt-test-mini"));
}

#[tokio::test]
async fn test_monthly_tier_spends_before_topup() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 100).await.unwrap();
    h.engine.grant_topup(h.org, 100, "in_1").await.unwrap();

    h.engine
        .deduct(&h.owner, &Feature::from("chat"), 120, "usage", None)
        .await
        .unwrap();

    let pool = h.engine.balance(h.org).await.unwrap().unwrap();
    assert_eq!(pool.monthly_remaining, 0);
    assert_eq!(pool.topup_remaining, 80);
}

#[tokio::test]
async fn test_member_mirror_entry_keeps_org_reporting_complete() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 1000).await.unwrap();
    let member = UserId::new();
    let feature = Feature::from("chat");
    h.engine
        .allocate(&h.owner, member, &feature, 200)
        .await
        .unwrap();

    h.engine
        .deduct(
            &ActorContext::member(h.org, member),
            &feature,
            50,
            "usage",
            None,
        )
        .await
        .unwrap();

    let history = h.engine.ledger_history(h.org).await.unwrap();
    let mirror = history
        .iter()
        .find(|e| e.description.starts_with("[Team] "))
        .expect("mirror entry");
    assert_eq!(mirror.kind, EntryKind::UsageDeduction);
    assert_eq!(mirror.amount, -50);
    assert!(mirror.delta.is_zero());

    // The org pool paid once, at allocation time.
    let pool = h.engine.balance(h.org).await.unwrap().unwrap();
    assert_eq!(pool.effective(), 800);
}

#[tokio::test]
async fn test_conservation_across_mixed_operations() {
    let h = harness();
    let feature = Feature::from("content_generation");
    let member_a = UserId::new();
    let member_b = UserId::new();

    h.engine.grant_monthly_credits(h.org, 5_000).await.unwrap();
    h.engine.grant_topup(h.org, 1_000, "in_1").await.unwrap();
    assert_eq!(org_total(&h).await, 6_000);

    // Moving credits between tiers conserves the total.
    h.engine
        .allocate(&h.owner, member_a, &feature, 800)
        .await
        .unwrap();
    h.engine
        .allocate(&h.owner, member_b, &feature, 400)
        .await
        .unwrap();
    assert_eq!(org_total(&h).await, 6_000);

    h.engine
        .reclaim(&h.owner, member_b, &feature, 100)
        .await
        .unwrap();
    assert_eq!(org_total(&h).await, 6_000);

    // Only usage deductions shrink it, by exactly their sum.
    h.engine
        .deduct(
            &ActorContext::member(h.org, member_a),
            &feature,
            300,
            "usage",
            None,
        )
        .await
        .unwrap();
    h.engine
        .deduct(&h.owner, &feature, 700, "usage", None)
        .await
        .unwrap();
    assert_eq!(org_total(&h).await, 5_000);

    // Failed operations change nothing.
    assert!(
        h.engine
            .deduct(&h.owner, &feature, 100_000, "usage", None)
            .await
            .is_err()
    );
    assert_eq!(org_total(&h).await, 5_000);

    assert!(h.engine.verify_consistency(h.org).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_non_negativity_for_ordinary_actors() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 100).await.unwrap();
    let member = UserId::new();
    let feature = Feature::from("chat");
    h.engine
        .allocate(&h.owner, member, &feature, 60)
        .await
        .unwrap();
    let member_ctx = ActorContext::member(h.org, member);

    for _ in 0..5 {
        let _ = h.engine.deduct(&h.owner, &feature, 35, "usage", None).await;
        let _ = h
            .engine
            .deduct(&member_ctx, &feature, 25, "usage", None)
            .await;
    }

    let pool = h.engine.balance(h.org).await.unwrap().unwrap();
    assert!(pool.effective() >= 0);
    assert!(pool.monthly_remaining >= 0);
    let allocation = h
        .engine
        .member_allocation(h.org, member, &feature)
        .await
        .unwrap()
        .unwrap();
    assert!(allocation.remaining >= 0);
}

#[tokio::test]
async fn test_super_admin_usage_may_overdraw_org() {
    let h = harness();
    h.engine.grant_monthly_credits(h.org, 100).await.unwrap();
    let super_admin = ActorContext::super_admin(h.org, UserId::new());

    h.engine
        .deduct(
            &super_admin,
            &Feature::from("chat"),
            400,
            "platform usage",
            None,
        )
        .await
        .unwrap();

    let pool = h.engine.balance(h.org).await.unwrap().unwrap();
    assert_eq!(pool.effective(), -300);
    // Monthly stays in range; the top-up tier carries the overdraft.
    assert_eq!(pool.monthly_remaining, 0);
    assert_eq!(pool.topup_remaining, -300);
    assert!(h.engine.verify_consistency(h.org).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_allocation_notice_survives_sink_failures() {
    struct FailingSink;

    #[async_trait::async_trait]
    impl credit_engine::NotificationSink for FailingSink {
        async fn deliver(
            &self,
            _request: credit_engine::NotificationRequest,
        ) -> Result<(), credit_engine::notify::NotifyError> {
            Err(credit_engine::notify::NotifyError::Delivery {
                message: "downstream unavailable".to_string(),
            })
        }
    }

    let org = OrgId::new();
    let owner = ActorContext::owner(org, UserId::new());
    let engine = CreditEngine::builder()
        .notification_sink(FailingSink)
        .build();

    engine.grant_monthly_credits(org, 1000).await.unwrap();
    // Delivery failure is swallowed; the allocation still lands.
    engine
        .allocate(&owner, UserId::new(), &Feature::from("chat"), 100)
        .await
        .unwrap();
    assert_eq!(engine.balance(org).await.unwrap().unwrap().effective(), 900);
}

#[tokio::test]
async fn test_directory_drives_admin_fanout() {
    let h = harness();
    let second_admin = UserId::new();
    h.directory.add_admin(h.org, second_admin);
    h.engine.grant_monthly_credits(h.org, 1000).await.unwrap();

    let member = UserId::new();
    let feature = Feature::from("chat");
    h.engine
        .allocate(&h.owner, member, &feature, 100)
        .await
        .unwrap();
    h.sink.take();

    h.engine
        .deduct(
            &ActorContext::member(h.org, member),
            &feature,
            85,
            "usage",
            None,
        )
        .await
        .unwrap();

    // Member plus both admins.
    let notices = h.sink.take();
    assert_eq!(notices.len(), 3);
    assert!(notices.iter().any(|r| r.user_id == second_admin));
}
