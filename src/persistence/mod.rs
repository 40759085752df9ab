//! SQLite trade ledger.
//!
//! Persists the trader's state to survive restarts:
//! - Coin universe and ordered coin pairs with their committed ratios
//! - Current holding history (the latest row is authoritative)
//! - Trade records and their lifecycle
//! - Scout history, pruned by age

mod models;

pub use models::{Asset, Pair, ScoutRecord, TradeDirection, TradeRecord, TradeState};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const TRADE_COLUMNS: &str = "id, origin, target, direction, state, origin_balance, target_balance, \
     quantity, cumulative_quote_qty, created_at, ordered_at, completed_at";

/// SQLite-backed ledger of coins, pairs, holdings and trades.
pub struct Ledger {
    conn: Mutex<Connection>,
}

fn parse_decimal(value: Option<String>) -> Option<Decimal> {
    value.and_then(|v| Decimal::from_str(&v).ok())
}

fn parse_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Latest trade with an order on the exchange.
fn query_in_flight(conn: &Connection) -> Result<Option<TradeRecord>> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {TRADE_COLUMNS} FROM trade_history WHERE state = ?1 ORDER BY id DESC LIMIT 1"
            ),
            params![TradeState::Ordered.as_str()],
            trade_from_row,
        )
        .optional()?;
    Ok(record)
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    let direction: String = row.get(3)?;
    let state: String = row.get(4)?;
    Ok(TradeRecord {
        id: row.get(0)?,
        origin: row.get(1)?,
        target: row.get(2)?,
        direction: TradeDirection::parse(&direction)
            .unwrap_or(TradeDirection::BuyOriginWithTarget),
        state: TradeState::parse(&state).unwrap_or(TradeState::Starting),
        origin_balance: parse_decimal(row.get(5)?),
        target_balance: parse_decimal(row.get(6)?),
        quantity: parse_decimal(row.get(7)?),
        cumulative_quote_qty: parse_decimal(row.get(8)?),
        created_at: parse_datetime(row.get(9)?).unwrap_or_else(Utc::now),
        ordered_at: parse_datetime(row.get(10)?),
        completed_at: parse_datetime(row.get(11)?),
    })
}

impl Ledger {
    /// Open (or create) a ledger database, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;

        info!("Ledger initialized at {:?}", path);
        Ok(ledger)
    }

    /// In-memory ledger, mostly for tests and paper trading.
    pub fn in_memory() -> Result<Self> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("ledger connection mutex poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS coins (
                symbol TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pairs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_coin TEXT NOT NULL REFERENCES coins(symbol),
                to_coin TEXT NOT NULL REFERENCES coins(symbol),
                ratio TEXT,
                ratio_updated_at TEXT,
                UNIQUE (from_coin, to_coin)
            );

            CREATE TABLE IF NOT EXISTS current_coin_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                datetime TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trade_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT NOT NULL,
                target TEXT NOT NULL,
                direction TEXT NOT NULL,
                state TEXT NOT NULL,
                origin_balance TEXT,
                target_balance TEXT,
                quantity TEXT,
                cumulative_quote_qty TEXT,
                created_at TEXT NOT NULL,
                ordered_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trade_state ON trade_history(state);

            CREATE TABLE IF NOT EXISTS scout_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_coin TEXT NOT NULL,
                to_coin TEXT NOT NULL,
                target_ratio TEXT NOT NULL,
                current_coin_price TEXT NOT NULL,
                other_coin_price TEXT NOT NULL,
                datetime TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scout_datetime ON scout_history(datetime);
            "#,
        )?;

        debug!("Ledger schema initialized");
        Ok(())
    }

    // ==================== Coins & Pairs ====================

    /// Sync the coin universe.
    ///
    /// Listed coins are enabled, unlisted ones disabled (never deleted), and
    /// every missing ordered pair between enabled coins is created.
    pub fn set_coins(&self, symbols: &[String]) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute("UPDATE coins SET enabled = 0", [])?;
        for symbol in symbols {
            tx.execute(
                "INSERT INTO coins (symbol, enabled) VALUES (?1, 1)
                 ON CONFLICT(symbol) DO UPDATE SET enabled = 1",
                params![symbol],
            )?;
        }

        let created = tx.execute(
            r#"
            INSERT OR IGNORE INTO pairs (from_coin, to_coin)
            SELECT a.symbol, b.symbol FROM coins a, coins b
            WHERE a.enabled = 1 AND b.enabled = 1 AND a.symbol != b.symbol
            "#,
            [],
        )?;

        tx.commit()?;
        info!(coins = symbols.len(), new_pairs = created, "Coin list synced");
        Ok(())
    }

    /// All known coins, enabled or not.
    pub fn coins(&self) -> Result<Vec<Asset>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT symbol, enabled FROM coins ORDER BY symbol")?;
        let coins = stmt
            .query_map([], |row| {
                Ok(Asset {
                    symbol: row.get(0)?,
                    enabled: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(coins)
    }

    /// Look up a coin by symbol.
    pub fn coin(&self, symbol: &str) -> Result<Option<Asset>> {
        let conn = self.conn()?;
        let coin = conn
            .query_row(
                "SELECT symbol, enabled FROM coins WHERE symbol = ?1",
                params![symbol],
                |row| {
                    Ok(Asset {
                        symbol: row.get(0)?,
                        enabled: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(coin)
    }

    /// All pairs starting at `from`, including ones to disabled coins.
    pub fn pairs_from(&self, from: &str) -> Result<Vec<Pair>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, p.from_coin, f.enabled, p.to_coin, t.enabled, p.ratio, p.ratio_updated_at
            FROM pairs p
            JOIN coins f ON f.symbol = p.from_coin
            JOIN coins t ON t.symbol = p.to_coin
            WHERE p.from_coin = ?1
            ORDER BY p.to_coin
            "#,
        )?;

        let pairs = stmt
            .query_map(params![from], |row| {
                Ok(Pair {
                    id: row.get(0)?,
                    from: Asset {
                        symbol: row.get(1)?,
                        enabled: row.get(2)?,
                    },
                    to: Asset {
                        symbol: row.get(3)?,
                        enabled: row.get(4)?,
                    },
                    ratio: parse_decimal(row.get(5)?),
                    ratio_updated_at: parse_datetime(row.get(6)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Commit a new baseline ratio for a pair.
    pub fn update_pair_ratio(&self, from: &str, to: &str, ratio: Decimal) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE pairs SET ratio = ?1, ratio_updated_at = ?2 WHERE from_coin = ?3 AND to_coin = ?4",
            params![ratio.to_string(), Utc::now().to_rfc3339(), from, to],
        )?;
        if updated == 0 {
            bail!("no pair {from} -> {to}");
        }
        debug!(%from, %to, %ratio, "Pair ratio committed");
        Ok(())
    }

    // ==================== Current Holding ====================

    /// The asset currently held, if one was ever recorded.
    pub fn current_holding(&self) -> Result<Option<Asset>> {
        let conn = self.conn()?;
        let holding = conn
            .query_row(
                r#"
                SELECT h.symbol, COALESCE(c.enabled, 0)
                FROM current_coin_history h
                LEFT JOIN coins c ON c.symbol = h.symbol
                ORDER BY h.id DESC LIMIT 1
                "#,
                [],
                |row| {
                    Ok(Asset {
                        symbol: row.get(0)?,
                        enabled: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(holding)
    }

    /// Record a new current holding.
    pub fn set_current_holding(&self, asset: &Asset) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO current_coin_history (symbol, datetime) VALUES (?1, ?2)",
            params![asset.symbol, Utc::now().to_rfc3339()],
        )?;
        info!(holding = %asset, "Current holding updated");
        Ok(())
    }

    // ==================== Trades ====================

    /// Record the intent to trade `origin` against `target`.
    ///
    /// Fails while another trade has an order on the exchange. The check and the
    /// insert share one lock and one transaction.
    pub fn start_trade(
        &self,
        origin: &Asset,
        target: &Asset,
        is_liquidation: bool,
    ) -> Result<TradeRecord> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        if let Some(open) = query_in_flight(&tx)? {
            bail!(
                "trade {} ({} -> {}) is still in flight",
                open.id,
                open.origin,
                open.target
            );
        }

        let direction = if is_liquidation {
            TradeDirection::SellOriginForTarget
        } else {
            TradeDirection::BuyOriginWithTarget
        };
        let created_at = Utc::now();

        tx.execute(
            "INSERT INTO trade_history (origin, target, direction, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                origin.symbol,
                target.symbol,
                direction.as_str(),
                TradeState::Starting.as_str(),
                created_at.to_rfc3339(),
            ],
        )?;

        let id = tx.last_insert_rowid();
        tx.commit()?;

        let record = TradeRecord {
            id,
            origin: origin.symbol.clone(),
            target: target.symbol.clone(),
            direction,
            state: TradeState::Starting,
            origin_balance: None,
            target_balance: None,
            quantity: None,
            cumulative_quote_qty: None,
            created_at,
            ordered_at: None,
            completed_at: None,
        };

        debug!(trade_id = record.id, origin = %origin, target = %target, direction = direction.as_str(), "Trade started");
        Ok(record)
    }

    /// Update the stored state of `record` if it still matches what we hold in memory.
    fn transition(
        &self,
        record: &TradeRecord,
        next: TradeState,
        assignments: &str,
        values: &[&dyn rusqlite::ToSql],
    ) -> Result<()> {
        if !record.state.can_transition_to(next) {
            bail!(
                "invalid trade transition {} -> {} for trade {}",
                record.state,
                next,
                record.id
            );
        }

        let sql = format!(
            "UPDATE trade_history SET state = ?1{assignments} WHERE id = ?2 AND state = ?3"
        );
        let mut all: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(values.len() + 3);
        let next_str = next.as_str();
        let current_str = record.state.as_str();
        all.push(&next_str);
        all.push(&record.id);
        all.push(&current_str);
        all.extend_from_slice(values);

        let updated = self.conn()?.execute(&sql, all.as_slice())?;
        if updated != 1 {
            bail!("trade {} is no longer {}", record.id, record.state);
        }
        Ok(())
    }

    /// Mark the order as placed, recording pre-order balances and quantity.
    pub fn set_ordered(
        &self,
        record: &mut TradeRecord,
        origin_balance: Decimal,
        target_balance: Decimal,
        quantity: Decimal,
    ) -> Result<()> {
        let now = Utc::now();
        self.transition(
            record,
            TradeState::Ordered,
            ", origin_balance = ?4, target_balance = ?5, quantity = ?6, ordered_at = ?7",
            &[
                &origin_balance.to_string(),
                &target_balance.to_string(),
                &quantity.to_string(),
                &now.to_rfc3339(),
            ],
        )?;

        record.state = TradeState::Ordered;
        record.origin_balance = Some(origin_balance);
        record.target_balance = Some(target_balance);
        record.quantity = Some(quantity);
        record.ordered_at = Some(now);
        Ok(())
    }

    /// Mark the trade filled with the quote quantity actually exchanged.
    pub fn set_complete(&self, record: &mut TradeRecord, cumulative_quote_qty: Decimal) -> Result<()> {
        let now = Utc::now();
        self.transition(
            record,
            TradeState::Complete,
            ", cumulative_quote_qty = ?4, completed_at = ?5",
            &[&cumulative_quote_qty.to_string(), &now.to_rfc3339()],
        )?;

        record.state = TradeState::Complete;
        record.cumulative_quote_qty = Some(cumulative_quote_qty);
        record.completed_at = Some(now);
        Ok(())
    }

    /// Mark the order canceled (by us or by anyone else).
    pub fn set_canceled(&self, record: &mut TradeRecord) -> Result<()> {
        self.finish_without_fill(record, TradeState::Canceled)
    }

    /// Mark the order as timed out with its cancellation unconfirmed.
    pub fn set_timed_out(&self, record: &mut TradeRecord) -> Result<()> {
        self.finish_without_fill(record, TradeState::Timeout)
    }

    fn finish_without_fill(&self, record: &mut TradeRecord, next: TradeState) -> Result<()> {
        let now = Utc::now();
        self.transition(record, next, ", completed_at = ?4", &[&now.to_rfc3339()])?;
        record.state = next;
        record.completed_at = Some(now);
        Ok(())
    }

    /// Look up a trade by id.
    pub fn trade(&self, id: i64) -> Result<Option<TradeRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {TRADE_COLUMNS} FROM trade_history WHERE id = ?1"),
                params![id],
                trade_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// The trade whose order is still on the exchange, if any.
    pub fn in_flight_trade(&self) -> Result<Option<TradeRecord>> {
        let conn = self.conn()?;
        query_in_flight(&conn)
    }

    /// Most recent trades first.
    pub fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trade_history ORDER BY id DESC LIMIT ?1"
        ))?;
        let trades = stmt
            .query_map(params![limit as i64], trade_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trades)
    }

    // ==================== Scout History ====================

    /// Append a scouting observation.
    pub fn log_scout(&self, record: &ScoutRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO scout_history (from_coin, to_coin, target_ratio, current_coin_price,
                                       other_coin_price, datetime)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.from_coin,
                record.to_coin,
                record.target_ratio.to_string(),
                record.current_coin_price.to_string(),
                record.other_coin_price.to_string(),
                record.datetime.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete scout history older than `hours`. Returns the number of rows removed.
    pub fn prune_scout_history(&self, hours: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(hours as i64);
        let removed = self.conn()?.execute(
            "DELETE FROM scout_history WHERE datetime < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        if removed > 0 {
            debug!(removed, hours, "Pruned scout history");
        }
        Ok(removed)
    }

    /// Number of stored scout observations.
    pub fn scout_history_len(&self) -> Result<usize> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM scout_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
