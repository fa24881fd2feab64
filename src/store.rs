// =============================================================================
// PositionStore — transactional, crash-safe persistence for Position/Trade
// =============================================================================
//
// Grounded on the vault_db.rs idiom: a single Connection behind a
// tokio::sync::Mutex (because callers hold it across awaits in some call
// sites even though rusqlite itself is synchronous), WAL + NORMAL pragmas,
// `prepare_cached` + `query_map` for reads, `ON CONFLICT ... DO UPDATE` for
// upserts. The single-active-row invariant (P1/P2) is enforced by a partial
// unique index at the SQL layer, not only in application code.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::types::{ExitReason, MarginMode, OrderType, PositionStatus, Side};

#[derive(Debug, Clone)]
pub struct Position {
    pub id: i64,
    pub profile_id: String,
    pub pos_key: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub sl_price: Decimal,
    pub tp_price: Decimal,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub timeframe: String,
    pub status: PositionStatus,
    pub order_type: OrderType,
    pub entry_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub entry_time: i64,
    pub entry_confidence: f64,
    pub feature_snapshot: Value,
    pub config_version: i64,
    pub profit_lock_active: bool,
    pub tp_extended: bool,
    pub emergency_tightened: bool,
    pub protective_last_created_at: i64,
}

impl Position {
    pub fn pos_key_for(profile_id: &str, exchange: &str, symbol: &str, timeframe: &str) -> String {
        // {BASE}_{QUOTE} split isn't needed at this layer — `symbol` already
        // arrives canonical (e.g. "BTCUSDT"); venues differ only in how they
        // spell it, which the adapter handles.
        format!("P{profile_id}_{exchange}_{symbol}_{timeframe}")
    }
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub pos_key: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub qty: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub exit_reason: ExitReason,
    pub entry_time: i64,
    pub exit_time: i64,
    pub feature_snapshot: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("an active or pending position already exists for this key")]
    ConflictActiveExists,
    #[error("position not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct PositionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PositionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening position store at {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS profiles (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                environment TEXT NOT NULL,
                exchange    TEXT NOT NULL,
                active      INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS positions (
                id                          INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_id                  TEXT NOT NULL,
                pos_key                     TEXT NOT NULL,
                symbol                      TEXT NOT NULL,
                side                        TEXT NOT NULL,
                qty                         TEXT NOT NULL,
                entry_price                 TEXT NOT NULL,
                sl_price                    TEXT NOT NULL,
                tp_price                    TEXT NOT NULL,
                leverage                    INTEGER NOT NULL,
                margin_mode                 TEXT NOT NULL,
                timeframe                   TEXT NOT NULL,
                status                      TEXT NOT NULL,
                order_type                  TEXT NOT NULL,
                entry_order_id              TEXT,
                sl_order_id                 TEXT,
                tp_order_id                 TEXT,
                entry_time                  INTEGER NOT NULL,
                entry_confidence            REAL NOT NULL,
                feature_snapshot            TEXT NOT NULL,
                config_version              INTEGER NOT NULL DEFAULT 0,
                profit_lock_active          INTEGER NOT NULL DEFAULT 0,
                tp_extended                 INTEGER NOT NULL DEFAULT 0,
                emergency_tightened         INTEGER NOT NULL DEFAULT 0,
                protective_last_created_at  INTEGER NOT NULL DEFAULT 0,
                waiting_sync_reason         TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_active_key
                ON positions(profile_id, pos_key)
                WHERE status IN ('ACTIVE', 'PENDING');

            CREATE INDEX IF NOT EXISTS idx_positions_profile_symbol
                ON positions(profile_id, symbol);

            CREATE TABLE IF NOT EXISTS trades (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                pos_key          TEXT NOT NULL,
                symbol           TEXT NOT NULL,
                side             TEXT NOT NULL,
                entry_price      TEXT NOT NULL,
                exit_price       TEXT NOT NULL,
                qty              TEXT NOT NULL,
                pnl              TEXT NOT NULL,
                fees             TEXT NOT NULL,
                exit_reason      TEXT NOT NULL,
                entry_time       INTEGER NOT NULL,
                exit_time        INTEGER NOT NULL,
                feature_snapshot TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cooldowns (
                profile_id  TEXT NOT NULL,
                symbol      TEXT NOT NULL,
                expiry_epoch INTEGER NOT NULL,
                PRIMARY KEY (profile_id, symbol)
            );

            CREATE TABLE IF NOT EXISTS risk_metrics (
                profile_id       TEXT PRIMARY KEY,
                peak_balance     TEXT NOT NULL,
                daily_loss       TEXT NOT NULL,
                daily_reset_date TEXT NOT NULL,
                starting_balance TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ohlcv_cache (
                symbol    TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                payload   TEXT NOT NULL,
                PRIMARY KEY (symbol, timeframe, ts)
            );
            ",
        )?;
        Ok(())
    }

    fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
        let side_str: String = row.get("side")?;
        let status_str: String = row.get("status")?;
        let order_type_str: String = row.get("order_type")?;
        let qty_str: String = row.get("qty")?;
        let entry_price_str: String = row.get("entry_price")?;
        let sl_price_str: String = row.get("sl_price")?;
        let tp_price_str: String = row.get("tp_price")?;
        let feature_str: String = row.get("feature_snapshot")?;

        Ok(Position {
            id: row.get("id")?,
            profile_id: row.get("profile_id")?,
            pos_key: row.get("pos_key")?,
            symbol: row.get("symbol")?,
            side: side_str.parse().unwrap_or(Side::Long),
            qty: qty_str.parse().unwrap_or_default(),
            entry_price: entry_price_str.parse().unwrap_or_default(),
            sl_price: sl_price_str.parse().unwrap_or_default(),
            tp_price: tp_price_str.parse().unwrap_or_default(),
            leverage: row.get::<_, i64>("leverage")? as u32,
            margin_mode: MarginMode::Isolated,
            timeframe: row.get("timeframe")?,
            status: status_str.parse().unwrap_or(PositionStatus::Pending),
            order_type: order_type_str.parse().unwrap_or(OrderType::Market),
            entry_order_id: row.get("entry_order_id")?,
            sl_order_id: row.get("sl_order_id")?,
            tp_order_id: row.get("tp_order_id")?,
            entry_time: row.get("entry_time")?,
            entry_confidence: row.get("entry_confidence")?,
            feature_snapshot: serde_json::from_str(&feature_str).unwrap_or(Value::Null),
            config_version: row.get("config_version")?,
            profit_lock_active: row.get::<_, i64>("profit_lock_active")? != 0,
            tp_extended: row.get::<_, i64>("tp_extended")? != 0,
            emergency_tightened: row.get::<_, i64>("emergency_tightened")? != 0,
            protective_last_created_at: row.get("protective_last_created_at")?,
        })
    }

    /// Insert a new PENDING/ACTIVE position. Fails with `ConflictActiveExists`
    /// if another open row already exists for `(profile_id, pos_key)`.
    pub async fn upsert_active(&self, pos: &Position) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM positions WHERE profile_id = ?1 AND pos_key = ?2 AND status IN ('ACTIVE','PENDING')",
                params![pos.profile_id, pos.pos_key],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Other(e.into()))?;

        if let Some(existing_id) = existing {
            if existing_id != pos.id {
                return Err(StoreError::ConflictActiveExists);
            }
            conn.execute(
                "UPDATE positions SET qty=?1, entry_price=?2, sl_price=?3, tp_price=?4,
                    status=?5, entry_order_id=?6, sl_order_id=?7, tp_order_id=?8,
                    profit_lock_active=?9, tp_extended=?10, emergency_tightened=?11,
                    protective_last_created_at=?12
                 WHERE id=?13",
                params![
                    pos.qty.to_string(),
                    pos.entry_price.to_string(),
                    pos.sl_price.to_string(),
                    pos.tp_price.to_string(),
                    pos.status.to_string(),
                    pos.entry_order_id,
                    pos.sl_order_id,
                    pos.tp_order_id,
                    pos.profit_lock_active as i64,
                    pos.tp_extended as i64,
                    pos.emergency_tightened as i64,
                    pos.protective_last_created_at,
                    existing_id,
                ],
            )
            .map_err(|e| StoreError::Other(e.into()))?;
            return Ok(existing_id);
        }

        conn.execute(
            "INSERT INTO positions (
                profile_id, pos_key, symbol, side, qty, entry_price, sl_price, tp_price,
                leverage, margin_mode, timeframe, status, order_type,
                entry_order_id, sl_order_id, tp_order_id, entry_time, entry_confidence,
                feature_snapshot, config_version, protective_last_created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            params![
                pos.profile_id,
                pos.pos_key,
                pos.symbol,
                pos.side.to_string(),
                pos.qty.to_string(),
                pos.entry_price.to_string(),
                pos.sl_price.to_string(),
                pos.tp_price.to_string(),
                pos.leverage,
                pos.margin_mode.to_string(),
                pos.timeframe,
                pos.status.to_string(),
                pos.order_type.to_string(),
                pos.entry_order_id,
                pos.sl_order_id,
                pos.tp_order_id,
                pos.entry_time,
                pos.entry_confidence,
                serde_json::to_string(&pos.feature_snapshot).unwrap_or_default(),
                pos.config_version,
                pos.protective_last_created_at,
            ],
        )
        .map_err(|e| {
            if let rusqlite::Error::SqliteFailure(ref sqlite_err, _) = e {
                if sqlite_err.code == rusqlite::ErrorCode::ConstraintViolation {
                    return StoreError::ConflictActiveExists;
                }
            }
            StoreError::Other(e.into())
        })?;

        Ok(conn.last_insert_rowid())
    }

    pub async fn get_active(&self, profile_id: &str, pos_key: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM positions WHERE profile_id = ?1 AND pos_key = ?2 AND status IN ('ACTIVE','PENDING')",
        )?;
        let pos = stmt
            .query_row(params![profile_id, pos_key], Self::row_to_position)
            .optional()?;
        Ok(pos)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM positions WHERE id = ?1")?;
        Ok(stmt.query_row(params![id], Self::row_to_position).optional()?)
    }

    pub async fn list_active(&self, profile_id: &str) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM positions WHERE profile_id = ?1 AND status IN ('ACTIVE','PENDING')",
        )?;
        let rows = stmt
            .query_map(params![profile_id], Self::row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub async fn list_all_active(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT * FROM positions WHERE status IN ('ACTIVE','PENDING')")?;
        let rows = stmt
            .query_map([], Self::row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Returns true if any ACTIVE|PENDING position exists for `symbol` on
    /// `profile_id`, across all timeframes (global symbol guard, §4.3.1/§4.5).
    pub async fn has_any_open_for_symbol(&self, profile_id: &str, symbol: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE profile_id = ?1 AND symbol = ?2 AND status IN ('ACTIVE','PENDING')",
            params![profile_id, symbol],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Atomic transition to CLOSED/CANCELLED plus trade-ledger append.
    pub async fn finalize(
        &self,
        pos_id: i64,
        status: PositionStatus,
        trade: Option<&Trade>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE positions SET status = ?1 WHERE id = ?2",
            params![status.to_string(), pos_id],
        )?;
        if let Some(t) = trade {
            tx.execute(
                "INSERT INTO trades (
                    pos_key, symbol, side, entry_price, exit_price, qty, pnl, fees,
                    exit_reason, entry_time, exit_time, feature_snapshot
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    t.pos_key,
                    t.symbol,
                    t.side.to_string(),
                    t.entry_price.to_string(),
                    t.exit_price.to_string(),
                    t.qty.to_string(),
                    t.pnl.to_string(),
                    t.fees.to_string(),
                    t.exit_reason.to_string(),
                    t.entry_time,
                    t.exit_time,
                    serde_json::to_string(&t.feature_snapshot).unwrap_or_default(),
                ],
            )?;
        }
        tx.execute(
            "UPDATE positions SET waiting_sync_reason = NULL WHERE id = ?1",
            params![pos_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Parks a position in `WAITING_SYNC` pending the reconciler's retry
    /// (spec §4.2/§4.4) — `reason` is diagnostic, surfaced to operators only.
    pub async fn mark_waiting_sync(&self, pos_id: i64, reason: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET status = 'WAITING_SYNC', waiting_sync_reason = ?1 WHERE id = ?2",
            params![reason, pos_id],
        )?;
        Ok(())
    }

    /// Transitions a `WAITING_SYNC` row out of limbo: `Active` on a false
    /// alarm (the exchange position reappeared healthy), or a terminal status
    /// once the reconciler resolves the outcome.
    pub async fn clear_waiting_sync(&self, pos_id: i64, outcome: PositionStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET status = ?1, waiting_sync_reason = NULL WHERE id = ?2",
            params![outcome.to_string(), pos_id],
        )?;
        Ok(())
    }

    pub async fn list_waiting_sync(&self, profile_id: &str) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM positions WHERE profile_id = ?1 AND status = 'WAITING_SYNC'",
        )?;
        let rows = stmt
            .query_map(params![profile_id], Self::row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Persists a partial-fill resize (spec §9 Decided) ahead of placing
    /// protective orders sized to the quantity actually filled.
    pub async fn resize_qty(&self, pos_id: i64, qty: Decimal) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET qty = ?1 WHERE id = ?2",
            params![qty.to_string(), pos_id],
        )?;
        Ok(())
    }

    pub async fn update_protective_orders(
        &self,
        pos_id: i64,
        sl_price: Decimal,
        tp_price: Decimal,
        sl_order_id: Option<&str>,
        tp_order_id: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET sl_price=?1, tp_price=?2, sl_order_id=?3, tp_order_id=?4,
                protective_last_created_at=?5 WHERE id=?6",
            params![
                sl_price.to_string(),
                tp_price.to_string(),
                sl_order_id,
                tp_order_id,
                now,
                pos_id
            ],
        )?;
        Ok(())
    }

    pub async fn set_flags(
        &self,
        pos_id: i64,
        profit_lock_active: Option<bool>,
        tp_extended: Option<bool>,
        emergency_tightened: Option<bool>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        if let Some(v) = profit_lock_active {
            conn.execute(
                "UPDATE positions SET profit_lock_active = ?1 WHERE id = ?2",
                params![v as i64, pos_id],
            )?;
        }
        if let Some(v) = tp_extended {
            conn.execute(
                "UPDATE positions SET tp_extended = ?1 WHERE id = ?2",
                params![v as i64, pos_id],
            )?;
        }
        if let Some(v) = emergency_tightened {
            conn.execute(
                "UPDATE positions SET emergency_tightened = ?1 WHERE id = ?2",
                params![v as i64, pos_id],
            )?;
        }
        Ok(())
    }

    pub async fn mark_active(&self, pos_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET status = 'ACTIVE' WHERE id = ?1",
            params![pos_id],
        )?;
        Ok(())
    }

    // -- cooldowns ----------------------------------------------------------

    pub async fn set_cooldown(&self, profile_id: &str, symbol: &str, expiry_epoch: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cooldowns (profile_id, symbol, expiry_epoch) VALUES (?1,?2,?3)
             ON CONFLICT(profile_id, symbol) DO UPDATE SET expiry_epoch = excluded.expiry_epoch",
            params![profile_id, symbol, expiry_epoch],
        )?;
        Ok(())
    }

    pub async fn get_cooldown(&self, profile_id: &str, symbol: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let v: Option<i64> = conn
            .query_row(
                "SELECT expiry_epoch FROM cooldowns WHERE profile_id = ?1 AND symbol = ?2",
                params![profile_id, symbol],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    // -- risk metrics ---------------------------------------------------------

    pub async fn load_risk_metrics(
        &self,
        profile_id: &str,
    ) -> Result<Option<(Decimal, Decimal, String, Decimal)>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT peak_balance, daily_loss, daily_reset_date, starting_balance FROM risk_metrics WHERE profile_id = ?1",
                params![profile_id],
                |r| {
                    let peak: String = r.get(0)?;
                    let loss: String = r.get(1)?;
                    let date: String = r.get(2)?;
                    let start: String = r.get(3)?;
                    Ok((peak, loss, date, start))
                },
            )
            .optional()?;
        Ok(row.map(|(p, l, d, s)| {
            (
                p.parse().unwrap_or_default(),
                l.parse().unwrap_or_default(),
                d,
                s.parse().unwrap_or_default(),
            )
        }))
    }

    pub async fn save_risk_metrics(
        &self,
        profile_id: &str,
        peak_balance: Decimal,
        daily_loss: Decimal,
        daily_reset_date: &str,
        starting_balance: Decimal,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO risk_metrics (profile_id, peak_balance, daily_loss, daily_reset_date, starting_balance)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(profile_id) DO UPDATE SET
                peak_balance = excluded.peak_balance,
                daily_loss = excluded.daily_loss,
                daily_reset_date = excluded.daily_reset_date,
                starting_balance = excluded.starting_balance",
            params![
                profile_id,
                peak_balance.to_string(),
                daily_loss.to_string(),
                daily_reset_date,
                starting_balance.to_string(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position(profile_id: &str, pos_key: &str) -> Position {
        Position {
            id: 0,
            profile_id: profile_id.to_string(),
            pos_key: pos_key.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty: dec!(0.1),
            entry_price: dec!(100),
            sl_price: dec!(95),
            tp_price: dec!(110),
            leverage: 10,
            margin_mode: MarginMode::Isolated,
            timeframe: "5m".to_string(),
            status: PositionStatus::Active,
            order_type: OrderType::Market,
            entry_order_id: Some("e1".to_string()),
            sl_order_id: Some("s1".to_string()),
            tp_order_id: Some("t1".to_string()),
            entry_time: 1000,
            entry_confidence: 0.9,
            feature_snapshot: Value::Null,
            config_version: 1,
            profit_lock_active: false,
            tp_extended: false,
            emergency_tightened: false,
            protective_last_created_at: 1000,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_active_round_trips() {
        let store = PositionStore::open_in_memory().unwrap();
        let pos = sample_position("p1", "P1_BINANCE_BTCUSDT_5m");
        let id = store.upsert_active(&pos).await.unwrap();
        assert!(id > 0);

        let fetched = store.get_active("p1", "P1_BINANCE_BTCUSDT_5m").await.unwrap().unwrap();
        assert_eq!(fetched.symbol, "BTCUSDT");
        assert_eq!(fetched.qty, dec!(0.1));
    }

    #[tokio::test]
    async fn duplicate_active_key_is_rejected_p1() {
        let store = PositionStore::open_in_memory().unwrap();
        let pos_a = sample_position("p1", "P1_BINANCE_BTCUSDT_5m");
        store.upsert_active(&pos_a).await.unwrap();

        let pos_b = sample_position("p1", "P1_BINANCE_BTCUSDT_5m");
        let result = store.upsert_active(&pos_b).await;
        assert!(matches!(result, Err(StoreError::ConflictActiveExists)));
    }

    #[tokio::test]
    async fn finalize_moves_to_closed_and_appends_trade() {
        let store = PositionStore::open_in_memory().unwrap();
        let pos = sample_position("p1", "P1_BINANCE_BTCUSDT_5m");
        let id = store.upsert_active(&pos).await.unwrap();

        let trade = Trade {
            pos_key: pos.pos_key.clone(),
            symbol: pos.symbol.clone(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price: dec!(110),
            qty: pos.qty,
            pnl: dec!(1),
            fees: dec!(0.01),
            exit_reason: ExitReason::Tp,
            entry_time: pos.entry_time,
            exit_time: 2000,
            feature_snapshot: Value::Null,
        };
        store
            .finalize(id, PositionStatus::Closed, Some(&trade))
            .await
            .unwrap();

        assert!(store.get_active("p1", "P1_BINANCE_BTCUSDT_5m").await.unwrap().is_none());

        // After closing, a new position may be opened for the same key (P1
        // only restricts ACTIVE|PENDING rows).
        let pos2 = sample_position("p1", "P1_BINANCE_BTCUSDT_5m");
        let id2 = store.upsert_active(&pos2).await.unwrap();
        assert_ne!(id2, id);
    }

    #[tokio::test]
    async fn has_any_open_for_symbol_detects_cross_timeframe_collisions_p2() {
        let store = PositionStore::open_in_memory().unwrap();
        let pos = sample_position("p1", "P1_BINANCE_BTCUSDT_5m");
        store.upsert_active(&pos).await.unwrap();

        assert!(store.has_any_open_for_symbol("p1", "BTCUSDT").await.unwrap());
        assert!(!store.has_any_open_for_symbol("p1", "ETHUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn cooldown_round_trips() {
        let store = PositionStore::open_in_memory().unwrap();
        store.set_cooldown("p1", "SOLUSDT", 5000).await.unwrap();
        let v = store.get_cooldown("p1", "SOLUSDT").await.unwrap();
        assert_eq!(v, Some(5000));
    }

    #[tokio::test]
    async fn risk_metrics_upsert_overwrites() {
        let store = PositionStore::open_in_memory().unwrap();
        store
            .save_risk_metrics("p1", dec!(1000), dec!(10), "2026-07-30", dec!(1000))
            .await
            .unwrap();
        store
            .save_risk_metrics("p1", dec!(1100), dec!(0), "2026-07-31", dec!(1000))
            .await
            .unwrap();
        let (peak, loss, date, start) = store.load_risk_metrics("p1").await.unwrap().unwrap();
        assert_eq!(peak, dec!(1100));
        assert_eq!(loss, dec!(0));
        assert_eq!(date, "2026-07-31");
        assert_eq!(start, dec!(1000));
    }
}
