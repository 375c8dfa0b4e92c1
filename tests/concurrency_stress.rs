//! Concurrent deduction stress tests.
//!
//! The core correctness property: racing deductions against one balance
//! must serialize, so with `remaining = R` and a per-call charge `c`,
//! exactly `floor(R / c)` calls succeed regardless of interleaving.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use credit_engine::{
    ActorContext, BalanceRef, CreditEngine, EngineConfig, Feature, LedgerEntry, LedgerError,
    LedgerResult, LedgerStore, MemberBalance, MemoryLedgerStore, OrgBalance, OrgId, TimeWindow,
    TopupInvoice, Transfer, UsageFact, UserId,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn run_deductions(
    engine: Arc<CreditEngine>,
    ctx: ActorContext,
    feature: Feature,
    tasks: usize,
    charge: i64,
) -> (usize, usize) {
    let mut handles = Vec::with_capacity(tasks);
    for _ in 0..tasks {
        let engine = engine.clone();
        let feature = feature.clone();
        handles.push(tokio::spawn(async move {
            engine
                .deduct(&ctx, &feature, charge, "concurrent usage", None)
                .await
        }));
    }

    let mut successes = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) if e.is_insufficient() => insufficient += 1,
            Err(e) => panic!("unexpected failure: {e}"),
        }
    }
    (successes, insufficient)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_member_deductions_never_overdraw() {
    init_tracing();
    let engine = Arc::new(CreditEngine::builder().build());
    let org = OrgId::new();
    let owner = ActorContext::owner(org, UserId::new());
    let member = UserId::new();
    let feature = Feature::from("content_generation");

    engine.grant_monthly_credits(org, 10_000).await.unwrap();
    engine.allocate(&owner, member, &feature, 100).await.unwrap();

    // R = 100, c = 7: exactly 14 of 40 racing calls may land.
    let (successes, insufficient) = run_deductions(
        engine.clone(),
        ActorContext::member(org, member),
        feature.clone(),
        40,
        7,
    )
    .await;

    assert_eq!(successes, 14);
    assert_eq!(insufficient, 26);

    let allocation = engine
        .member_allocation(org, member, &feature)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocation.remaining, 100 - 14 * 7);
    assert!(engine.verify_consistency(org).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_org_deductions_never_overdraw() {
    let engine = Arc::new(CreditEngine::builder().build());
    let org = OrgId::new();
    let owner = ActorContext::owner(org, UserId::new());

    engine.grant_monthly_credits(org, 1_000).await.unwrap();

    let (successes, insufficient) = run_deductions(
        engine.clone(),
        owner,
        Feature::from("chat"),
        50,
        30,
    )
    .await;

    assert_eq!(successes, 33);
    assert_eq!(insufficient, 17);

    let pool = engine.balance(org).await.unwrap().unwrap();
    assert_eq!(pool.effective(), 1_000 - 33 * 30);
    assert!(pool.effective() >= 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_allocate_and_deduct_conserve_credits() {
    let engine = Arc::new(CreditEngine::builder().build());
    let org = OrgId::new();
    let owner = ActorContext::owner(org, UserId::new());
    let member = UserId::new();
    let feature = Feature::from("chat");

    engine.grant_monthly_credits(org, 1_000).await.unwrap();
    engine.allocate(&owner, member, &feature, 200).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..30 {
        let engine = engine.clone();
        let feature = feature.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine
                    .allocate(&owner, member, &feature, 20)
                    .await
                    .map(|_| ())
            } else {
                engine
                    .deduct(
                        &ActorContext::member(org, member),
                        &feature,
                        15,
                        "usage",
                        None,
                    )
                    .await
                    .map(|_| ())
            }
        }));
    }
    let mut deductions = 0;
    for (i, handle) in handles.into_iter().enumerate() {
        if handle.await.unwrap().is_ok() && i % 2 == 1 {
            deductions += 1;
        }
    }

    let pool = engine.balance(org).await.unwrap().unwrap();
    let allocation = engine
        .member_allocation(org, member, &feature)
        .await
        .unwrap()
        .unwrap();
    // Whatever interleaving happened, credits only left through deductions.
    assert_eq!(
        pool.effective() + allocation.remaining,
        1_000 - deductions * 15
    );
    assert!(engine.verify_consistency(org).await.unwrap().is_empty());
}

/// Wraps the memory store and fails the first `failures` transfers with a
/// write conflict, imitating an optimistic backend under contention.
struct ConflictingStore {
    inner: MemoryLedgerStore,
    remaining_failures: AtomicU32,
}

impl ConflictingStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryLedgerStore::new(),
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait::async_trait]
impl LedgerStore for ConflictingStore {
    fn name(&self) -> &str {
        "conflicting"
    }

    async fn transfer(&self, transfer: Transfer) -> LedgerResult<Vec<LedgerEntry>> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .remaining_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(LedgerError::Conflict { retries: 0 });
        }
        self.inner.transfer(transfer).await
    }

    async fn org_balance(&self, org_id: OrgId) -> LedgerResult<Option<OrgBalance>> {
        self.inner.org_balance(org_id).await
    }

    async fn member_allocation(
        &self,
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
    ) -> LedgerResult<Option<MemberBalance>> {
        self.inner.member_allocation(org_id, user_id, feature).await
    }

    async fn all_member_allocations(
        &self,
        org_id: OrgId,
    ) -> LedgerResult<Vec<(UserId, Feature, MemberBalance)>> {
        self.inner.all_member_allocations(org_id).await
    }

    async fn entries_for_org(&self, org_id: OrgId) -> LedgerResult<Vec<LedgerEntry>> {
        self.inner.entries_for_org(org_id).await
    }

    async fn entries_for_balance(&self, balance: &BalanceRef) -> LedgerResult<Vec<LedgerEntry>> {
        self.inner.entries_for_balance(balance).await
    }

    async fn record_usage_fact(&self, fact: UsageFact) -> LedgerResult<()> {
        self.inner.record_usage_fact(fact).await
    }

    async fn usage_facts_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<UsageFact>> {
        self.inner.usage_facts_between(window, org_id).await
    }

    async fn record_invoice(&self, invoice: TopupInvoice) -> LedgerResult<()> {
        self.inner.record_invoice(invoice).await
    }

    async fn invoices_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<TopupInvoice>> {
        self.inner.invoices_between(window, org_id).await
    }
}

#[tokio::test]
async fn test_transient_conflicts_are_retried_to_success() {
    let engine = CreditEngine::builder()
        .store(ConflictingStore::new(2))
        .build();
    let org = OrgId::new();

    // Two injected conflicts sit inside the default retry budget.
    engine.grant_monthly_credits(org, 1000).await.unwrap();
    assert_eq!(engine.balance(org).await.unwrap().unwrap().effective(), 1000);
}

#[tokio::test]
async fn test_persistent_conflicts_surface_after_retries_exhaust() {
    let engine = CreditEngine::builder()
        .store(ConflictingStore::new(100))
        .config(
            EngineConfig::builder()
                .max_retries(2)
                .initial_backoff(std::time::Duration::from_millis(1))
                .build(),
        )
        .build();
    let org = OrgId::new();

    let err = engine.grant_monthly_credits(org, 1000).await.unwrap_err();
    assert!(matches!(err, LedgerError::Conflict { retries: 2 }));
}
