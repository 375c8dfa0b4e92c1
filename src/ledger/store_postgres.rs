//! PostgreSQL ledger store backend.
//!
//! Enable with the `postgres` feature flag. Transfers run inside one
//! transaction that row-locks the balances they touch (`SELECT ... FOR
//! UPDATE`), which is the serializable read-modify-write the engine
//! requires. Serialization failures surface as `Conflict` so the engine's
//! bounded retry can re-run the transfer.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{Feature, OrgId, TimeWindow, UserId};

use super::entry::{BalanceRef, LedgerEntry, MemberBalance, OrgBalance, TopupInvoice, UsageFact};
use super::store::LedgerStore;
use super::transfer::{Transfer, TransferOp, apply_transfer};
use super::{LedgerError, LedgerResult};

/// PostgreSQL ledger store backend.
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    table_prefix: String,
}

impl PostgresLedgerStore {
    /// Create a new PostgreSQL ledger store.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    /// Create with an existing connection pool.
    pub fn with_pool(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            table_prefix: "credit".to_string(),
        }
    }

    /// Set a custom table name prefix.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    fn table(&self, suffix: &str) -> String {
        format!("{}_{}", self.table_prefix, suffix)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {pools} (
                org_id UUID PRIMARY KEY,
                monthly_total BIGINT NOT NULL DEFAULT 0,
                monthly_remaining BIGINT NOT NULL DEFAULT 0,
                topup_remaining BIGINT NOT NULL DEFAULT 0,
                period_end TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS {allocations} (
                org_id UUID NOT NULL,
                user_id UUID NOT NULL,
                feature VARCHAR(255) NOT NULL,
                allocated BIGINT NOT NULL DEFAULT 0,
                remaining BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (org_id, user_id, feature)
            );
            CREATE TABLE IF NOT EXISTS {ledger} (
                id UUID PRIMARY KEY,
                org_id UUID NOT NULL,
                balance_key TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{ledger}_org ON {ledger} (org_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_{ledger}_balance ON {ledger} (balance_key, created_at);
            CREATE TABLE IF NOT EXISTS {facts} (
                id UUID PRIMARY KEY,
                org_id UUID NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{facts}_org ON {facts} (org_id, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_{facts}_time ON {facts} (recorded_at);
            CREATE TABLE IF NOT EXISTS {invoices} (
                id VARCHAR(255) PRIMARY KEY,
                org_id UUID NOT NULL,
                amount_cents BIGINT NOT NULL,
                paid_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{invoices}_org ON {invoices} (org_id, paid_at);
            "#,
            pools = self.table("pools"),
            allocations = self.table("allocations"),
            ledger = self.table("ledger"),
            facts = self.table("facts"),
            invoices = self.table("invoices"),
        );
        sqlx::query(&query).execute(&*self.pool).await?;
        Ok(())
    }

    async fn lock_pool(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        org_id: OrgId,
    ) -> LedgerResult<Option<OrgBalance>> {
        let query = format!(
            "SELECT monthly_total, monthly_remaining, topup_remaining, period_end
             FROM {} WHERE org_id = $1 FOR UPDATE",
            self.table("pools")
        );
        let row = sqlx::query(&query)
            .bind(org_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|row| OrgBalance {
            monthly_total: row.get("monthly_total"),
            monthly_remaining: row.get("monthly_remaining"),
            topup_remaining: row.get("topup_remaining"),
            period_end: row.get("period_end"),
        }))
    }

    async fn lock_allocation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
    ) -> LedgerResult<Option<MemberBalance>> {
        let query = format!(
            "SELECT allocated, remaining FROM {}
             WHERE org_id = $1 AND user_id = $2 AND feature = $3 FOR UPDATE",
            self.table("allocations")
        );
        let row = sqlx::query(&query)
            .bind(org_id.as_uuid())
            .bind(user_id.as_uuid())
            .bind(feature.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|row| MemberBalance {
            allocated: row.get("allocated"),
            remaining: row.get("remaining"),
        }))
    }
}

fn storage_err(e: sqlx::Error) -> LedgerError {
    // 40001 = serialization_failure, 40P01 = deadlock_detected; both are
    // safe to retry as a fresh transfer.
    if let sqlx::Error::Database(ref db) = e
        && matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
    {
        return LedgerError::Conflict { retries: 0 };
    }
    LedgerError::Storage {
        message: e.to_string(),
    }
}

fn balance_key(balance: &BalanceRef) -> LedgerResult<String> {
    Ok(serde_json::to_string(balance)?)
}

/// Member rows a transfer's items will touch, in item order, deduplicated.
fn member_keys(transfer: &Transfer) -> Vec<(UserId, Feature)> {
    let mut keys: Vec<(UserId, Feature)> = Vec::new();
    for item in &transfer.items {
        let key = match &item.op {
            TransferOp::SpendMember {
                user_id, feature, ..
            }
            | TransferOp::AllocateMember {
                user_id, feature, ..
            }
            | TransferOp::ReclaimMember {
                user_id, feature, ..
            } => (*user_id, feature.clone()),
            _ => continue,
        };
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn transfer(&self, transfer: Transfer) -> LedgerResult<Vec<LedgerEntry>> {
        let org_id = transfer.org_id;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let pool = self.lock_pool(&mut tx, org_id).await?;
        let mut members: HashMap<(UserId, Feature), MemberBalance> = HashMap::new();
        for (user_id, feature) in member_keys(&transfer) {
            if let Some(balance) = self
                .lock_allocation(&mut tx, org_id, user_id, &feature)
                .await?
            {
                members.insert((user_id, feature), balance);
            }
        }

        let applied = apply_transfer(
            &transfer,
            pool,
            |user_id, feature| members.get(&(user_id, feature.clone())).copied(),
            chrono::Utc::now(),
        )?;

        if let Some(pool) = applied.pool {
            let query = format!(
                "INSERT INTO {} (org_id, monthly_total, monthly_remaining, topup_remaining, period_end, updated_at)
                 VALUES ($1, $2, $3, $4, $5, NOW())
                 ON CONFLICT (org_id) DO UPDATE SET
                     monthly_total = $2,
                     monthly_remaining = $3,
                     topup_remaining = $4,
                     period_end = $5,
                     updated_at = NOW()",
                self.table("pools")
            );
            sqlx::query(&query)
                .bind(org_id.as_uuid())
                .bind(pool.monthly_total)
                .bind(pool.monthly_remaining)
                .bind(pool.topup_remaining)
                .bind(pool.period_end)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        for ((user_id, feature), balance) in &applied.allocations {
            let query = format!(
                "INSERT INTO {} (org_id, user_id, feature, allocated, remaining, updated_at)
                 VALUES ($1, $2, $3, $4, $5, NOW())
                 ON CONFLICT (org_id, user_id, feature) DO UPDATE SET
                     allocated = $4,
                     remaining = $5,
                     updated_at = NOW()",
                self.table("allocations")
            );
            sqlx::query(&query)
                .bind(org_id.as_uuid())
                .bind(user_id.as_uuid())
                .bind(feature.as_str())
                .bind(balance.allocated)
                .bind(balance.remaining)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        let insert = format!(
            "INSERT INTO {} (id, org_id, balance_key, data, created_at) VALUES ($1, $2, $3, $4, $5)",
            self.table("ledger")
        );
        for entry in &applied.entries {
            let data = serde_json::to_value(entry)?;
            sqlx::query(&insert)
                .bind(entry.id.0)
                .bind(org_id.as_uuid())
                .bind(balance_key(&entry.balance)?)
                .bind(&data)
                .bind(entry.created_at)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(applied.entries)
    }

    async fn org_balance(&self, org_id: OrgId) -> LedgerResult<Option<OrgBalance>> {
        let query = format!(
            "SELECT monthly_total, monthly_remaining, topup_remaining, period_end
             FROM {} WHERE org_id = $1",
            self.table("pools")
        );
        let row = sqlx::query(&query)
            .bind(org_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|row| OrgBalance {
            monthly_total: row.get("monthly_total"),
            monthly_remaining: row.get("monthly_remaining"),
            topup_remaining: row.get("topup_remaining"),
            period_end: row.get("period_end"),
        }))
    }

    async fn member_allocation(
        &self,
        org_id: OrgId,
        user_id: UserId,
        feature: &Feature,
    ) -> LedgerResult<Option<MemberBalance>> {
        let query = format!(
            "SELECT allocated, remaining FROM {}
             WHERE org_id = $1 AND user_id = $2 AND feature = $3",
            self.table("allocations")
        );
        let row = sqlx::query(&query)
            .bind(org_id.as_uuid())
            .bind(user_id.as_uuid())
            .bind(feature.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|row| MemberBalance {
            allocated: row.get("allocated"),
            remaining: row.get("remaining"),
        }))
    }

    async fn all_member_allocations(
        &self,
        org_id: OrgId,
    ) -> LedgerResult<Vec<(UserId, Feature, MemberBalance)>> {
        let query = format!(
            "SELECT user_id, feature, allocated, remaining FROM {} WHERE org_id = $1",
            self.table("allocations")
        );
        let rows = sqlx::query(&query)
            .bind(org_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    UserId::from(row.get::<uuid::Uuid, _>("user_id")),
                    Feature::from(row.get::<String, _>("feature")),
                    MemberBalance {
                        allocated: row.get("allocated"),
                        remaining: row.get("remaining"),
                    },
                )
            })
            .collect())
    }

    async fn entries_for_org(&self, org_id: OrgId) -> LedgerResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT data FROM {} WHERE org_id = $1 ORDER BY created_at, id",
            self.table("ledger")
        );
        let rows = sqlx::query(&query)
            .bind(org_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter()
            .map(|row| Ok(serde_json::from_value(row.get("data"))?))
            .collect()
    }

    async fn entries_for_balance(&self, balance: &BalanceRef) -> LedgerResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT data FROM {} WHERE balance_key = $1 ORDER BY created_at, id",
            self.table("ledger")
        );
        let rows = sqlx::query(&query)
            .bind(balance_key(balance)?)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter()
            .map(|row| Ok(serde_json::from_value(row.get("data"))?))
            .collect()
    }

    async fn record_usage_fact(&self, fact: UsageFact) -> LedgerResult<()> {
        let query = format!(
            "INSERT INTO {} (id, org_id, recorded_at, data) VALUES ($1, $2, $3, $4)",
            self.table("facts")
        );
        let data = serde_json::to_value(&fact)?;
        sqlx::query(&query)
            .bind(fact.id.0)
            .bind(fact.org_id.as_uuid())
            .bind(fact.recorded_at)
            .bind(&data)
            .execute(&*self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn usage_facts_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<UsageFact>> {
        let query = match org_id {
            Some(_) => format!(
                "SELECT data FROM {} WHERE org_id = $1 AND recorded_at >= $2 AND recorded_at < $3
                 ORDER BY recorded_at",
                self.table("facts")
            ),
            None => format!(
                "SELECT data FROM {} WHERE recorded_at >= $1 AND recorded_at < $2
                 ORDER BY recorded_at",
                self.table("facts")
            ),
        };

        let rows = match org_id {
            Some(org) => {
                sqlx::query(&query)
                    .bind(org.as_uuid())
                    .bind(window.start)
                    .bind(window.end)
                    .fetch_all(&*self.pool)
                    .await
            }
            None => {
                sqlx::query(&query)
                    .bind(window.start)
                    .bind(window.end)
                    .fetch_all(&*self.pool)
                    .await
            }
        }
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| Ok(serde_json::from_value(row.get("data"))?))
            .collect()
    }

    async fn record_invoice(&self, invoice: TopupInvoice) -> LedgerResult<()> {
        let query = format!(
            "INSERT INTO {} (id, org_id, amount_cents, paid_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
            self.table("invoices")
        );
        sqlx::query(&query)
            .bind(&invoice.id)
            .bind(invoice.org_id.as_uuid())
            .bind(invoice.amount_cents)
            .bind(invoice.paid_at)
            .execute(&*self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn invoices_between(
        &self,
        window: TimeWindow,
        org_id: Option<OrgId>,
    ) -> LedgerResult<Vec<TopupInvoice>> {
        let query = match org_id {
            Some(_) => format!(
                "SELECT id, org_id, amount_cents, paid_at FROM {}
                 WHERE org_id = $1 AND paid_at >= $2 AND paid_at < $3 ORDER BY paid_at",
                self.table("invoices")
            ),
            None => format!(
                "SELECT id, org_id, amount_cents, paid_at FROM {}
                 WHERE paid_at >= $1 AND paid_at < $2 ORDER BY paid_at",
                self.table("invoices")
            ),
        };

        let rows = match org_id {
            Some(org) => {
                sqlx::query(&query)
                    .bind(org.as_uuid())
                    .bind(window.start)
                    .bind(window.end)
                    .fetch_all(&*self.pool)
                    .await
            }
            None => {
                sqlx::query(&query)
                    .bind(window.start)
                    .bind(window.end)
                    .fetch_all(&*self.pool)
                    .await
            }
        }
        .map_err(storage_err)?;

        Ok(rows
            .iter()
            .map(|row| TopupInvoice {
                id: row.get("id"),
                org_id: OrgId::from(row.get::<uuid::Uuid, _>("org_id")),
                amount_cents: row.get("amount_cents"),
                paid_at: row.get("paid_at"),
            })
            .collect())
    }
}
