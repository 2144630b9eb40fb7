//! PostgreSQL store
//!
//! Runtime queries only (no compile-time database connection). Conditional
//! updates are `UPDATE ... WHERE <precondition>` checked via
//! `rows_affected()`; unique-key races use `ON CONFLICT DO NOTHING` with a
//! follow-up read of the winner. All filters are explicit equality binds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};

use crate::config::DatabaseConfig;
use crate::core_types::{AccountType, BalanceState, EntryType, Timestamp};
use crate::error::PointsError;
use crate::idempotency::{EventScope, IdempotencyRecord};
use crate::ingest::types::{DlqEntry, IngestEvent, IngestStatus};
use crate::ledger::entry::LedgerEntry;
use crate::ledger::query::{LedgerFilter, LedgerPage, SortField, SortOrder};
use crate::reservation::{Reservation, ReservationStatus};
use crate::wallet::escrow::{EscrowItem, EscrowStatus};
use crate::wallet::models::{ModelWallet, ModelWalletType, Wallet};

use super::{
    EscrowStore, IdempotencyStore, IngestStore, InsertOutcome, LedgerEntryStore, ReservationStore,
    WalletStore,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PointsError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> Result<(), PointsError> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS wallets (
                user_id            TEXT PRIMARY KEY,
                available_balance  BIGINT NOT NULL CHECK (available_balance >= 0),
                escrow_balance     BIGINT NOT NULL CHECK (escrow_balance >= 0),
                version            BIGINT NOT NULL,
                created_at         TIMESTAMPTZ NOT NULL,
                updated_at         TIMESTAMPTZ NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_wallets_available ON wallets(available_balance)",
            "CREATE INDEX IF NOT EXISTS idx_wallets_escrow ON wallets(escrow_balance)",
            r#"CREATE TABLE IF NOT EXISTS model_wallets (
                model_id       TEXT PRIMARY KEY,
                earned_balance BIGINT NOT NULL CHECK (earned_balance >= 0),
                version        BIGINT NOT NULL,
                wallet_type    TEXT NOT NULL,
                created_at     TIMESTAMPTZ NOT NULL,
                updated_at     TIMESTAMPTZ NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_model_wallets_earned ON model_wallets(earned_balance)",
            "CREATE INDEX IF NOT EXISTS idx_model_wallets_type_earned ON model_wallets(wallet_type, earned_balance)",
            r#"CREATE TABLE IF NOT EXISTS escrow_items (
                escrow_id     TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                amount        BIGINT NOT NULL CHECK (amount > 0),
                status        TEXT NOT NULL,
                queue_item_id TEXT NOT NULL UNIQUE,
                feature_type  TEXT NOT NULL,
                reason        TEXT NOT NULL,
                created_at    TIMESTAMPTZ NOT NULL,
                processed_at  TIMESTAMPTZ,
                model_id      TEXT,
                metadata      JSONB NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_escrow_user_status ON escrow_items(user_id, status, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_escrow_model_status ON escrow_items(model_id, status, processed_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_escrow_status_created ON escrow_items(status, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_escrow_feature_status ON escrow_items(feature_type, status)",
            r#"CREATE TABLE IF NOT EXISTS ledger_entries (
                entry_id        TEXT PRIMARY KEY,
                transaction_id  TEXT NOT NULL,
                account_id      TEXT NOT NULL,
                account_type    TEXT NOT NULL,
                amount          BIGINT NOT NULL,
                entry_type      TEXT NOT NULL,
                balance_state   TEXT NOT NULL,
                state_transition TEXT NOT NULL,
                reason          TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                request_id      TEXT NOT NULL,
                balance_before  BIGINT NOT NULL CHECK (balance_before >= 0),
                balance_after   BIGINT NOT NULL CHECK (balance_after >= 0),
                ts              TIMESTAMPTZ NOT NULL,
                currency        TEXT NOT NULL,
                escrow_id       TEXT,
                queue_item_id   TEXT,
                feature_type    TEXT,
                correlation_id  TEXT,
                metadata        JSONB NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_ledger_account_ts ON ledger_entries(account_id, ts DESC)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_account_type_ts ON ledger_entries(account_id, entry_type, ts DESC)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_account_state_ts ON ledger_entries(account_id, balance_state, ts DESC)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_transaction ON ledger_entries(transaction_id)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_escrow ON ledger_entries(escrow_id)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_queue_item ON ledger_entries(queue_item_id)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_correlation ON ledger_entries(correlation_id)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_ts ON ledger_entries(ts)",
            r#"CREATE TABLE IF NOT EXISTS idempotency_records (
                points_idempotency_key TEXT NOT NULL,
                event_scope            TEXT NOT NULL,
                result_hash            TEXT NOT NULL,
                stored_result          JSONB NOT NULL,
                status_code            INT NOT NULL,
                created_at             TIMESTAMPTZ NOT NULL,
                expires_at             TIMESTAMPTZ NOT NULL,
                retention_until        TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (points_idempotency_key, event_scope)
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_idempotency_retention ON idempotency_records(retention_until)",
            r#"CREATE TABLE IF NOT EXISTS points_reservations (
                reservation_id         TEXT PRIMARY KEY,
                user_id                TEXT NOT NULL,
                amount                 BIGINT NOT NULL CHECK (amount > 0),
                status                 TEXT NOT NULL,
                ttl_seconds            BIGINT NOT NULL,
                created_at             TIMESTAMPTZ NOT NULL,
                expires_at             TIMESTAMPTZ NOT NULL,
                processed_at           TIMESTAMPTZ,
                hold_transaction_id    TEXT NOT NULL,
                resolve_transaction_id TEXT
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_reservations_user ON points_reservations(user_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_reservations_status_expiry ON points_reservations(status, expires_at)",
            r#"CREATE TABLE IF NOT EXISTS ingest_events (
                event_id           TEXT PRIMARY KEY,
                event_type         TEXT NOT NULL,
                status             TEXT NOT NULL,
                attempts           INT NOT NULL,
                next_attempt_at    TIMESTAMPTZ,
                payload            JSONB NOT NULL,
                last_error_code    TEXT,
                last_error_message TEXT,
                replayable         BOOLEAN NOT NULL,
                received_at        TIMESTAMPTZ NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_ingest_status_next ON ingest_events(status, next_attempt_at)",
            "CREATE INDEX IF NOT EXISTS idx_ingest_received ON ingest_events(received_at)",
            "CREATE INDEX IF NOT EXISTS idx_ingest_type_received ON ingest_events(event_type, received_at)",
            r#"CREATE TABLE IF NOT EXISTS dlq_events (
                event_id           TEXT PRIMARY KEY,
                event_type         TEXT NOT NULL,
                payload            JSONB NOT NULL,
                attempts           INT NOT NULL,
                last_error_code    TEXT NOT NULL,
                last_error_message TEXT NOT NULL,
                moved_to_dlq_at    TIMESTAMPTZ NOT NULL,
                replayable         BOOLEAN NOT NULL,
                replayed_at        TIMESTAMPTZ,
                replay_result      TEXT
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_dlq_moved ON dlq_events(moved_to_dlq_at)",
            "CREATE INDEX IF NOT EXISTS idx_dlq_type_moved ON dlq_events(event_type, moved_to_dlq_at)",
            "CREATE INDEX IF NOT EXISTS idx_dlq_replayable_moved ON dlq_events(replayable, moved_to_dlq_at)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ============================================================
    // ROW MAPPERS
    // ============================================================

    fn row_to_wallet(row: &PgRow) -> Wallet {
        Wallet::restore(
            row.get("user_id"),
            row.get::<i64, _>("available_balance") as u64,
            row.get::<i64, _>("escrow_balance") as u64,
            row.get::<i64, _>("version") as u64,
            row.get("created_at"),
            row.get("updated_at"),
        )
    }

    fn row_to_model_wallet(row: &PgRow) -> Result<ModelWallet, PointsError> {
        let wallet_type: String = row.get("wallet_type");
        let wallet_type = ModelWalletType::from_str(&wallet_type)
            .ok_or_else(|| PointsError::Storage(format!("bad wallet_type {wallet_type}")))?;
        Ok(ModelWallet::restore(
            row.get("model_id"),
            row.get::<i64, _>("earned_balance") as u64,
            row.get::<i64, _>("version") as u64,
            wallet_type,
            row.get("created_at"),
            row.get("updated_at"),
        ))
    }

    fn row_to_escrow(row: &PgRow) -> Result<EscrowItem, PointsError> {
        let status: String = row.get("status");
        Ok(EscrowItem {
            escrow_id: row.get("escrow_id"),
            user_id: row.get("user_id"),
            amount: row.get::<i64, _>("amount") as u64,
            status: EscrowStatus::from_str(&status)
                .ok_or_else(|| PointsError::Storage(format!("bad escrow status {status}")))?,
            queue_item_id: row.get("queue_item_id"),
            feature_type: row.get("feature_type"),
            reason: row.get("reason"),
            created_at: row.get("created_at"),
            processed_at: row.get("processed_at"),
            model_id: row.get("model_id"),
            metadata: row.get("metadata"),
        })
    }

    fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, PointsError> {
        let account_type: String = row.get("account_type");
        let entry_type: String = row.get("entry_type");
        let balance_state: String = row.get("balance_state");
        Ok(LedgerEntry {
            entry_id: row.get("entry_id"),
            transaction_id: row.get("transaction_id"),
            account_id: row.get("account_id"),
            account_type: match account_type.as_str() {
                "user" => AccountType::User,
                "model" => AccountType::Model,
                other => {
                    return Err(PointsError::Storage(format!("bad account_type {other}")));
                }
            },
            amount: row.get("amount"),
            entry_type: EntryType::from_str(&entry_type)
                .ok_or_else(|| PointsError::Storage(format!("bad entry_type {entry_type}")))?,
            balance_state: BalanceState::from_str(&balance_state)
                .ok_or_else(|| PointsError::Storage(format!("bad balance_state {balance_state}")))?,
            state_transition: row.get("state_transition"),
            reason: row.get("reason"),
            idempotency_key: row.get("idempotency_key"),
            request_id: row.get("request_id"),
            balance_before: row.get::<i64, _>("balance_before") as u64,
            balance_after: row.get::<i64, _>("balance_after") as u64,
            timestamp: row.get("ts"),
            currency: row.get("currency"),
            escrow_id: row.get("escrow_id"),
            queue_item_id: row.get("queue_item_id"),
            feature_type: row.get("feature_type"),
            correlation_id: row.get("correlation_id"),
            metadata: row.get("metadata"),
        })
    }

    fn row_to_reservation(row: &PgRow) -> Result<Reservation, PointsError> {
        let status: String = row.get("status");
        Ok(Reservation {
            reservation_id: row.get("reservation_id"),
            user_id: row.get("user_id"),
            amount: row.get::<i64, _>("amount") as u64,
            status: ReservationStatus::from_str(&status)
                .ok_or_else(|| PointsError::Storage(format!("bad reservation status {status}")))?,
            ttl_seconds: row.get::<i64, _>("ttl_seconds") as u64,
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            processed_at: row.get("processed_at"),
            hold_transaction_id: row.get("hold_transaction_id"),
            resolve_transaction_id: row.get("resolve_transaction_id"),
        })
    }

    fn row_to_ingest_event(row: &PgRow) -> Result<IngestEvent, PointsError> {
        let status: String = row.get("status");
        Ok(IngestEvent {
            event_id: row.get("event_id"),
            event_type: row.get("event_type"),
            status: IngestStatus::from_str(&status)
                .ok_or_else(|| PointsError::Storage(format!("bad ingest status {status}")))?,
            attempts: row.get::<i32, _>("attempts") as u32,
            next_attempt_at: row.get("next_attempt_at"),
            payload: row.get("payload"),
            last_error_code: row.get("last_error_code"),
            last_error_message: row.get("last_error_message"),
            replayable: row.get("replayable"),
            received_at: row.get("received_at"),
        })
    }

    fn row_to_dlq(row: &PgRow) -> DlqEntry {
        DlqEntry {
            event_id: row.get("event_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            attempts: row.get::<i32, _>("attempts") as u32,
            last_error_code: row.get("last_error_code"),
            last_error_message: row.get("last_error_message"),
            moved_to_dlq_at: row.get("moved_to_dlq_at"),
            replayable: row.get("replayable"),
            replayed_at: row.get("replayed_at"),
            replay_result: row.get("replay_result"),
        }
    }

    const ENTRY_COLUMNS: &'static str = "entry_id, transaction_id, account_id, account_type, amount, entry_type, balance_state, state_transition, reason, idempotency_key, request_id, balance_before, balance_after, ts, currency, escrow_id, queue_item_id, feature_type, correlation_id, metadata";

    fn push_entry_filters<'a>(qb: &mut QueryBuilder<'a, sqlx::Postgres>, filter: &'a LedgerFilter) {
        if let Some(ref v) = filter.account_id {
            qb.push(" AND account_id = ").push_bind(v);
        }
        if let Some(v) = filter.account_type {
            qb.push(" AND account_type = ").push_bind(v.as_str());
        }
        if let Some(v) = filter.entry_type {
            qb.push(" AND entry_type = ").push_bind(v.as_str());
        }
        if let Some(ref v) = filter.reason {
            qb.push(" AND reason = ").push_bind(v);
        }
        if let Some(v) = filter.balance_state {
            qb.push(" AND balance_state = ").push_bind(v.as_str());
        }
        if let Some(ref v) = filter.transaction_id {
            qb.push(" AND transaction_id = ").push_bind(v);
        }
        if let Some(ref v) = filter.escrow_id {
            qb.push(" AND escrow_id = ").push_bind(v);
        }
        if let Some(ref v) = filter.queue_item_id {
            qb.push(" AND queue_item_id = ").push_bind(v);
        }
        if let Some(ref v) = filter.feature_type {
            qb.push(" AND feature_type = ").push_bind(v);
        }
        if let Some(ref v) = filter.correlation_id {
            qb.push(" AND correlation_id = ").push_bind(v);
        }
        if let Some(v) = filter.from {
            qb.push(" AND ts >= ").push_bind(v);
        }
        if let Some(v) = filter.to {
            qb.push(" AND ts <= ").push_bind(v);
        }
    }
}

#[async_trait]
impl WalletStore for PgStore {
    async fn get_wallet(&self, user_id: &str) -> Result<Option<Wallet>, PointsError> {
        let row = sqlx::query("SELECT * FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_wallet))
    }

    async fn create_wallet_if_absent(&self, wallet: Wallet) -> Result<Wallet, PointsError> {
        sqlx::query(
            r#"INSERT INTO wallets
               (user_id, available_balance, escrow_balance, version, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (user_id) DO NOTHING"#,
        )
        .bind(&wallet.user_id)
        .bind(wallet.available() as i64)
        .bind(wallet.escrow() as i64)
        .bind(wallet.version() as i64)
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_wallet(&wallet.user_id)
            .await?
            .ok_or_else(|| PointsError::Storage("wallet vanished after insert".into()))
    }

    async fn update_wallet_if_version(
        &self,
        wallet: &Wallet,
        expected_version: u64,
    ) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"UPDATE wallets
               SET available_balance = $1, escrow_balance = $2, version = $3, updated_at = $4
               WHERE user_id = $5 AND version = $6"#,
        )
        .bind(wallet.available() as i64)
        .bind(wallet.escrow() as i64)
        .bind(wallet.version() as i64)
        .bind(wallet.updated_at)
        .bind(&wallet.user_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_model_wallet(&self, model_id: &str) -> Result<Option<ModelWallet>, PointsError> {
        let row = sqlx::query("SELECT * FROM model_wallets WHERE model_id = $1")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_model_wallet).transpose()
    }

    async fn create_model_wallet_if_absent(
        &self,
        wallet: ModelWallet,
    ) -> Result<ModelWallet, PointsError> {
        sqlx::query(
            r#"INSERT INTO model_wallets
               (model_id, earned_balance, version, wallet_type, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (model_id) DO NOTHING"#,
        )
        .bind(&wallet.model_id)
        .bind(wallet.earned() as i64)
        .bind(wallet.version() as i64)
        .bind(wallet.wallet_type.as_str())
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_model_wallet(&wallet.model_id)
            .await?
            .ok_or_else(|| PointsError::Storage("model wallet vanished after insert".into()))
    }

    async fn update_model_wallet_if_version(
        &self,
        wallet: &ModelWallet,
        expected_version: u64,
    ) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"UPDATE model_wallets
               SET earned_balance = $1, version = $2, updated_at = $3
               WHERE model_id = $4 AND version = $5"#,
        )
        .bind(wallet.earned() as i64)
        .bind(wallet.version() as i64)
        .bind(wallet.updated_at)
        .bind(&wallet.model_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EscrowStore for PgStore {
    async fn insert_escrow(
        &self,
        item: EscrowItem,
    ) -> Result<InsertOutcome<EscrowItem>, PointsError> {
        let inserted = sqlx::query(
            r#"INSERT INTO escrow_items
               (escrow_id, user_id, amount, status, queue_item_id, feature_type, reason,
                created_at, processed_at, model_id, metadata)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (queue_item_id) DO NOTHING"#,
        )
        .bind(&item.escrow_id)
        .bind(&item.user_id)
        .bind(item.amount as i64)
        .bind(item.status.as_str())
        .bind(&item.queue_item_id)
        .bind(&item.feature_type)
        .bind(&item.reason)
        .bind(item.created_at)
        .bind(item.processed_at)
        .bind(&item.model_id)
        .bind(&item.metadata)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            Ok(InsertOutcome::Created(item))
        } else {
            let winner = self
                .get_escrow_by_queue_item(&item.queue_item_id)
                .await?
                .ok_or_else(|| PointsError::Storage("escrow vanished after conflict".into()))?;
            Ok(InsertOutcome::Duplicate(winner))
        }
    }

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowItem>, PointsError> {
        let row = sqlx::query("SELECT * FROM escrow_items WHERE escrow_id = $1")
            .bind(escrow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_escrow).transpose()
    }

    async fn get_escrow_by_queue_item(
        &self,
        queue_item_id: &str,
    ) -> Result<Option<EscrowItem>, PointsError> {
        let row = sqlx::query("SELECT * FROM escrow_items WHERE queue_item_id = $1")
            .bind(queue_item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_escrow).transpose()
    }

    async fn transition_escrow(
        &self,
        escrow_id: &str,
        to: EscrowStatus,
        model_id: Option<&str>,
        processed_at: Timestamp,
    ) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"UPDATE escrow_items
               SET status = $1, processed_at = $2, model_id = COALESCE($3, model_id)
               WHERE escrow_id = $4 AND status = 'held'"#,
        )
        .bind(to.as_str())
        .bind(processed_at)
        .bind(model_id)
        .bind(escrow_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_escrow_if_held(&self, escrow_id: &str) -> Result<bool, PointsError> {
        let result = sqlx::query("DELETE FROM escrow_items WHERE escrow_id = $1 AND status = 'held'")
            .bind(escrow_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_escrows(
        &self,
        user_id: &str,
        status: Option<EscrowStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<EscrowItem>, PointsError> {
        let mut qb = QueryBuilder::new("SELECT * FROM escrow_items WHERE user_id = ");
        qb.push_bind(user_id);
        if let Some(s) = status {
            qb.push(" AND status = ").push_bind(s.as_str());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_escrow).collect()
    }
}

#[async_trait]
impl LedgerEntryStore for PgStore {
    async fn insert_entry(
        &self,
        entry: LedgerEntry,
    ) -> Result<InsertOutcome<LedgerEntry>, PointsError> {
        let inserted = sqlx::query(
            r#"INSERT INTO ledger_entries
               (entry_id, transaction_id, account_id, account_type, amount, entry_type,
                balance_state, state_transition, reason, idempotency_key, request_id,
                balance_before, balance_after, ts, currency, escrow_id, queue_item_id,
                feature_type, correlation_id, metadata)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                       $16, $17, $18, $19, $20)
               ON CONFLICT (idempotency_key) DO NOTHING"#,
        )
        .bind(&entry.entry_id)
        .bind(&entry.transaction_id)
        .bind(&entry.account_id)
        .bind(entry.account_type.as_str())
        .bind(entry.amount)
        .bind(entry.entry_type.as_str())
        .bind(entry.balance_state.as_str())
        .bind(&entry.state_transition)
        .bind(&entry.reason)
        .bind(&entry.idempotency_key)
        .bind(&entry.request_id)
        .bind(entry.balance_before as i64)
        .bind(entry.balance_after as i64)
        .bind(entry.timestamp)
        .bind(&entry.currency)
        .bind(&entry.escrow_id)
        .bind(&entry.queue_item_id)
        .bind(&entry.feature_type)
        .bind(&entry.correlation_id)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            Ok(InsertOutcome::Created(entry))
        } else {
            let winner = self
                .get_entry_by_idempotency_key(&entry.idempotency_key)
                .await?
                .ok_or_else(|| PointsError::Storage("entry vanished after conflict".into()))?;
            Ok(InsertOutcome::Duplicate(winner))
        }
    }

    async fn get_entry(&self, entry_id: &str) -> Result<Option<LedgerEntry>, PointsError> {
        let row = sqlx::query("SELECT * FROM ledger_entries WHERE entry_id = $1")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn get_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerEntry>, PointsError> {
        let row = sqlx::query("SELECT * FROM ledger_entries WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn query_entries(&self, filter: &LedgerFilter) -> Result<LedgerPage, PointsError> {
        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM ledger_entries WHERE 1=1");
        Self::push_entry_filters(&mut count_qb, filter);
        let total_count: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM ledger_entries WHERE 1=1",
            Self::ENTRY_COLUMNS
        ));
        Self::push_entry_filters(&mut qb, filter);
        let order = match (filter.sort_field, filter.sort_order) {
            (SortField::Timestamp, SortOrder::Asc) => " ORDER BY ts ASC, entry_id ASC",
            (SortField::Timestamp, SortOrder::Desc) => " ORDER BY ts DESC, entry_id DESC",
            (SortField::Amount, SortOrder::Asc) => " ORDER BY amount ASC, entry_id ASC",
            (SortField::Amount, SortOrder::Desc) => " ORDER BY amount DESC, entry_id DESC",
        };
        qb.push(order);
        qb.push(" LIMIT ")
            .push_bind(filter.effective_limit() as i64)
            .push(" OFFSET ")
            .push_bind(filter.effective_offset() as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let entries: Vec<LedgerEntry> = rows
            .iter()
            .map(Self::row_to_entry)
            .collect::<Result<_, _>>()?;
        let has_more =
            (filter.effective_offset() as u64 + entries.len() as u64) < total_count as u64;

        Ok(LedgerPage {
            entries,
            total_count: total_count as u64,
            has_more,
        })
    }

    async fn entries_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<LedgerEntry>, PointsError> {
        let rows = sqlx::query(
            "SELECT * FROM ledger_entries WHERE transaction_id = $1 ORDER BY ts ASC, entry_id ASC",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn entries_for_account(
        &self,
        account_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerEntry>, PointsError> {
        let mut qb = QueryBuilder::new("SELECT * FROM ledger_entries WHERE account_id = ");
        qb.push_bind(account_id);
        if let Some(t) = as_of {
            qb.push(" AND ts <= ").push_bind(t);
        }
        qb.push(" ORDER BY ts ASC, entry_id ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }
}

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn put_idempotency_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, PointsError> {
        let inserted = sqlx::query(
            r#"INSERT INTO idempotency_records
               (points_idempotency_key, event_scope, result_hash, stored_result, status_code,
                created_at, expires_at, retention_until)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (points_idempotency_key, event_scope) DO NOTHING"#,
        )
        .bind(&record.key)
        .bind(record.scope.as_str())
        .bind(&record.result_hash)
        .bind(&record.stored_result)
        .bind(record.status_code as i32)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.retention_until)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            Ok(None)
        } else {
            self.get_idempotency(&record.key, record.scope).await
        }
    }

    async fn get_idempotency(
        &self,
        key: &str,
        scope: EventScope,
    ) -> Result<Option<IdempotencyRecord>, PointsError> {
        let row = sqlx::query(
            r#"SELECT * FROM idempotency_records
               WHERE points_idempotency_key = $1 AND event_scope = $2"#,
        )
        .bind(key)
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let scope_str: String = r.get("event_scope");
            let scope = EventScope::from_str(&scope_str)
                .ok_or_else(|| PointsError::Storage(format!("bad event_scope {scope_str}")))?;
            Ok(IdempotencyRecord {
                key: r.get("points_idempotency_key"),
                scope,
                result_hash: r.get("result_hash"),
                stored_result: r.get("stored_result"),
                status_code: r.get::<i32, _>("status_code") as u16,
                created_at: r.get("created_at"),
                expires_at: r.get("expires_at"),
                retention_until: r.get("retention_until"),
            })
        })
        .transpose()
    }

    async fn purge_idempotency_past_retention(&self, now: Timestamp) -> Result<u64, PointsError> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE retention_until <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReservationStore for PgStore {
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), PointsError> {
        sqlx::query(
            r#"INSERT INTO points_reservations
               (reservation_id, user_id, amount, status, ttl_seconds, created_at, expires_at,
                processed_at, hold_transaction_id, resolve_transaction_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&reservation.reservation_id)
        .bind(&reservation.user_id)
        .bind(reservation.amount as i64)
        .bind(reservation.status.as_str())
        .bind(reservation.ttl_seconds as i64)
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .bind(reservation.processed_at)
        .bind(&reservation.hold_transaction_id)
        .bind(&reservation.resolve_transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<Reservation>, PointsError> {
        let row = sqlx::query("SELECT * FROM points_reservations WHERE reservation_id = $1")
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn transition_reservation(
        &self,
        reservation_id: &str,
        to: ReservationStatus,
        processed_at: Timestamp,
        resolve_transaction_id: Option<&str>,
    ) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"UPDATE points_reservations
               SET status = $1, processed_at = $2,
                   resolve_transaction_id = COALESCE($3, resolve_transaction_id)
               WHERE reservation_id = $4 AND status = 'active'"#,
        )
        .bind(to.as_str())
        .bind(processed_at)
        .bind(resolve_transaction_id)
        .bind(reservation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_expired_reservations(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Reservation>, PointsError> {
        let rows = sqlx::query(
            r#"SELECT * FROM points_reservations
               WHERE status = 'active' AND expires_at <= $1
               ORDER BY expires_at ASC LIMIT $2"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn list_reservations(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Reservation>, PointsError> {
        let rows = sqlx::query(
            r#"SELECT * FROM points_reservations
               WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn purge_reservations_before(&self, cutoff: Timestamp) -> Result<u64, PointsError> {
        let result = sqlx::query(
            r#"DELETE FROM points_reservations
               WHERE status IN ('committed', 'released', 'expired') AND created_at < $1"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn enqueue_event(&self, event: IngestEvent) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"INSERT INTO ingest_events
               (event_id, event_type, status, attempts, next_attempt_at, payload,
                last_error_code, last_error_message, replayable, received_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (event_id) DO NOTHING"#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.status.as_str())
        .bind(event.attempts as i32)
        .bind(event.next_attempt_at)
        .bind(&event.payload)
        .bind(&event.last_error_code)
        .bind(&event.last_error_message)
        .bind(event.replayable)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<IngestEvent>, PointsError> {
        let row = sqlx::query("SELECT * FROM ingest_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_ingest_event).transpose()
    }

    async fn claim_due_events(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<IngestEvent>, PointsError> {
        // SKIP LOCKED keeps concurrent workers from claiming the same rows
        let rows = sqlx::query(
            r#"UPDATE ingest_events
               SET status = 'processing', attempts = attempts + 1, next_attempt_at = NULL
               WHERE event_id IN (
                   SELECT event_id FROM ingest_events
                   WHERE (status = 'queued' AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
                      OR (status = 'processing' AND next_attempt_at <= $1)
                   ORDER BY received_at ASC
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING *"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_ingest_event).collect()
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"UPDATE ingest_events
               SET status = 'processed', last_error_code = NULL, last_error_message = NULL
               WHERE event_id = $1 AND status = 'processing'"#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_event_rejected(
        &self,
        event_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"UPDATE ingest_events
               SET status = 'rejected', last_error_code = $2, last_error_message = $3
               WHERE event_id = $1 AND status = 'processing'"#,
        )
        .bind(event_id)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_event(
        &self,
        event_id: &str,
        next_attempt_at: Timestamp,
        error_code: &str,
        error_message: &str,
    ) -> Result<bool, PointsError> {
        let result = sqlx::query(
            r#"UPDATE ingest_events
               SET status = 'queued', next_attempt_at = $2, last_error_code = $3,
                   last_error_message = $4
               WHERE event_id = $1 AND status = 'processing'"#,
        )
        .bind(event_id)
        .bind(next_attempt_at)
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn move_event_to_dlq(&self, entry: DlqEntry) -> Result<(), PointsError> {
        sqlx::query(
            r#"UPDATE ingest_events
               SET status = 'dlq', last_error_code = $2, last_error_message = $3
               WHERE event_id = $1"#,
        )
        .bind(&entry.event_id)
        .bind(&entry.last_error_code)
        .bind(&entry.last_error_message)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"INSERT INTO dlq_events
               (event_id, event_type, payload, attempts, last_error_code, last_error_message,
                moved_to_dlq_at, replayable, replayed_at, replay_result)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (event_id) DO UPDATE
               SET attempts = EXCLUDED.attempts,
                   last_error_code = EXCLUDED.last_error_code,
                   last_error_message = EXCLUDED.last_error_message,
                   moved_to_dlq_at = EXCLUDED.moved_to_dlq_at"#,
        )
        .bind(&entry.event_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.attempts as i32)
        .bind(&entry.last_error_code)
        .bind(&entry.last_error_message)
        .bind(entry.moved_to_dlq_at)
        .bind(entry.replayable)
        .bind(entry.replayed_at)
        .bind(&entry.replay_result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_dlq_entry(&self, event_id: &str) -> Result<Option<DlqEntry>, PointsError> {
        let row = sqlx::query("SELECT * FROM dlq_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_dlq))
    }

    async fn list_dlq_entries(
        &self,
        event_type: Option<&str>,
        replayable: Option<bool>,
        moved_after: Option<Timestamp>,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, PointsError> {
        let mut qb = QueryBuilder::new("SELECT * FROM dlq_events WHERE 1=1");
        if let Some(t) = event_type {
            qb.push(" AND event_type = ").push_bind(t);
        }
        if let Some(r) = replayable {
            qb.push(" AND replayable = ").push_bind(r);
        }
        if let Some(m) = moved_after {
            qb.push(" AND moved_to_dlq_at >= ").push_bind(m);
        }
        qb.push(" ORDER BY moved_to_dlq_at DESC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::row_to_dlq).collect())
    }

    async fn reset_event_for_replay(
        &self,
        event_id: &str,
    ) -> Result<Option<IngestEvent>, PointsError> {
        let row = sqlx::query(
            r#"UPDATE ingest_events
               SET status = 'queued', attempts = 0, next_attempt_at = NULL,
                   last_error_code = NULL, last_error_message = NULL
               WHERE event_id = $1 AND status = 'dlq'
               RETURNING *"#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_ingest_event).transpose()
    }

    async fn record_dlq_replay(
        &self,
        event_id: &str,
        replayed_at: Timestamp,
        result: &str,
    ) -> Result<bool, PointsError> {
        let updated = sqlx::query(
            "UPDATE dlq_events SET replayed_at = $2, replay_result = $3 WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(replayed_at)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }
}

// Integration tests require a live database; they skip when DATABASE_URL
// is absent, the same way the transfer-layer tests do.
#[cfg(test)]
mod tests {
    use super::*;

    async fn connect() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()?;
        let store = PgStore::from_pool(pool);
        store.init_schema().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn test_wallet_roundtrip_and_cas() {
        let Some(store) = connect().await else {
            eprintln!("Skipping test - database not available");
            return;
        };

        let user_id = format!("pgtest-{}", uuid::Uuid::new_v4());
        let mut wallet = Wallet::new(user_id.clone());
        wallet.credit(1000).unwrap();
        let wallet = store.create_wallet_if_absent(wallet).await.unwrap();
        let version = wallet.version();

        let mut updated = wallet.clone();
        updated.hold(100).unwrap();
        assert!(store.update_wallet_if_version(&updated, version).await.unwrap());

        // stale writer loses
        let mut stale = wallet.clone();
        stale.hold(50).unwrap();
        assert!(!store.update_wallet_if_version(&stale, version).await.unwrap());

        let current = store.get_wallet(&user_id).await.unwrap().unwrap();
        assert_eq!(current.available(), 900);
        assert_eq!(current.escrow(), 100);
    }

    #[tokio::test]
    async fn test_escrow_insert_and_transition() {
        let Some(store) = connect().await else {
            eprintln!("Skipping test - database not available");
            return;
        };

        let queue_item = format!("pgq-{}", uuid::Uuid::new_v4());
        let item = EscrowItem::held(
            crate::core_types::new_id("esc"),
            "pgtest-user".into(),
            100,
            queue_item.clone(),
            "slot_machine".into(),
            "wager".into(),
            serde_json::json!({"tier": "gold"}),
        );
        let escrow_id = item.escrow_id.clone();

        let first = store.insert_escrow(item.clone()).await.unwrap();
        assert!(!first.is_duplicate());

        // same queue item, different escrow id: the winner comes back
        let mut rival = item.clone();
        rival.escrow_id = crate::core_types::new_id("esc");
        let outcome = store.insert_escrow(rival).await.unwrap();
        assert!(outcome.is_duplicate());
        assert_eq!(outcome.into_record().escrow_id, escrow_id);

        assert!(
            store
                .transition_escrow(&escrow_id, EscrowStatus::Settled, Some("m1"), Utc::now())
                .await
                .unwrap()
        );
        assert!(
            !store
                .transition_escrow(&escrow_id, EscrowStatus::Refunded, None, Utc::now())
                .await
                .unwrap()
        );

        let stored = store.get_escrow(&escrow_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscrowStatus::Settled);
        assert_eq!(stored.model_id.as_deref(), Some("m1"));
        assert_eq!(stored.metadata["tier"], serde_json::json!("gold"));
    }

    #[tokio::test]
    async fn test_idempotency_first_writer_wins() {
        let Some(store) = connect().await else {
            eprintln!("Skipping test - database not available");
            return;
        };

        let key = format!("pgidem-{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        let record = IdempotencyRecord {
            key: key.clone(),
            scope: EventScope::HoldEscrow,
            result_hash: "abc".into(),
            stored_result: serde_json::json!({"winner": true}),
            status_code: 201,
            created_at: now,
            expires_at: now + chrono::Duration::hours(24),
            retention_until: now + chrono::Duration::days(365),
        };

        assert!(store.put_idempotency_if_absent(record.clone()).await.unwrap().is_none());

        let mut loser = record.clone();
        loser.stored_result = serde_json::json!({"winner": false});
        let existing = store
            .put_idempotency_if_absent(loser)
            .await
            .unwrap()
            .expect("second writer must observe the first record");
        assert_eq!(existing.stored_result, serde_json::json!({"winner": true}));

        // same key under a different scope is a fresh slot
        let mut other_scope = record.clone();
        other_scope.scope = EventScope::SettleEscrow;
        assert!(store.put_idempotency_if_absent(other_scope).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_claim_and_requeue() {
        let Some(store) = connect().await else {
            eprintln!("Skipping test - database not available");
            return;
        };

        let event_id = format!("pgevt-{}", uuid::Uuid::new_v4());
        assert!(
            store
                .enqueue_event(IngestEvent::queued(
                    event_id.clone(),
                    "points.award".into(),
                    serde_json::json!({"user_id": "u1"}),
                ))
                .await
                .unwrap()
        );
        // duplicate id refused
        assert!(
            !store
                .enqueue_event(IngestEvent::queued(
                    event_id.clone(),
                    "points.award".into(),
                    serde_json::json!({}),
                ))
                .await
                .unwrap()
        );

        let claimed = store.claim_due_events(Utc::now(), 1000).await.unwrap();
        let ours = claimed
            .iter()
            .find(|e| e.event_id == event_id)
            .expect("enqueued event must be claimable");
        assert_eq!(ours.status, IngestStatus::Processing, "claim sets processing");
        assert_eq!(ours.attempts, 1);

        // requeue with a future deadline: not due yet
        store
            .requeue_event(
                &event_id,
                Utc::now() + chrono::Duration::hours(1),
                "HANDLER_FAILED",
                "transient",
            )
            .await
            .unwrap();
        let reclaimed = store.claim_due_events(Utc::now(), 1000).await.unwrap();
        assert!(reclaimed.iter().all(|e| e.event_id != event_id));
    }

    #[tokio::test]
    async fn test_reservation_cas_and_expiry_scan() {
        let Some(store) = connect().await else {
            eprintln!("Skipping test - database not available");
            return;
        };

        let reservation = Reservation::active(
            crate::core_types::new_id("res"),
            "pgtest-user".into(),
            100,
            0,
            "tx".into(),
        );
        let id = reservation.reservation_id.clone();
        store.insert_reservation(reservation).await.unwrap();

        let due = store
            .find_expired_reservations(Utc::now() + chrono::Duration::seconds(1), 100)
            .await
            .unwrap();
        assert!(due.iter().any(|r| r.reservation_id == id));

        assert!(
            store
                .transition_reservation(&id, ReservationStatus::Expired, Utc::now(), Some("tx2"))
                .await
                .unwrap()
        );
        // terminal rows never transition again
        assert!(
            !store
                .transition_reservation(&id, ReservationStatus::Committed, Utc::now(), None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_ledger_unique_key() {
        let Some(store) = connect().await else {
            eprintln!("Skipping test - database not available");
            return;
        };

        let key = format!("pgkey-{}", uuid::Uuid::new_v4());
        let entry = LedgerEntry {
            entry_id: crate::core_types::new_id("led"),
            transaction_id: "tx".into(),
            account_id: "pgtest-user".into(),
            account_type: AccountType::User,
            amount: 100,
            entry_type: EntryType::Credit,
            balance_state: BalanceState::Available,
            state_transition: "none->available".into(),
            reason: "test".into(),
            idempotency_key: key.clone(),
            request_id: "req".into(),
            balance_before: 0,
            balance_after: 100,
            timestamp: Utc::now(),
            currency: "points".into(),
            escrow_id: None,
            queue_item_id: None,
            feature_type: None,
            correlation_id: None,
            metadata: serde_json::json!({}),
        };

        let first = store.insert_entry(entry.clone()).await.unwrap();
        assert!(!first.is_duplicate());

        let mut second = entry.clone();
        second.entry_id = crate::core_types::new_id("led");
        let outcome = store.insert_entry(second).await.unwrap();
        assert!(outcome.is_duplicate());
        assert_eq!(outcome.into_record().entry_id, entry.entry_id);
    }
}
