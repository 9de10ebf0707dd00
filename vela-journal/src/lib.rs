//! Order journal: durable record of every order the controller touches.
//!
//! Reconciliation reads open orders back from here, so the journal is also
//! the source of truth for crash recovery between runs.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use thiserror::Error;

use vela_core::{Order, OrderStatus, OrderType, Side};

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("order {0} not found")]
    OrderNotFound(i64),
    /// Terminal statuses never move back to an open state.
    #[error("order {id}: illegal transition {from} -> {to}")]
    TerminalTransition {
        id: i64,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for JournalError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Status and attribute filters for journal queries.
#[derive(Clone, Debug, Default)]
pub struct OrderQuery {
    statuses: Vec<OrderStatus>,
    pair: Option<String>,
    updated_before: Option<DateTime<Utc>>,
}

impl OrderQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_status_in(mut self, statuses: impl IntoIterator<Item = OrderStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    #[must_use]
    pub fn with_pair(mut self, pair: impl Into<String>) -> Self {
        self.pair = Some(pair.into());
        self
    }

    #[must_use]
    pub fn with_updated_before_or_equal(mut self, time: DateTime<Utc>) -> Self {
        self.updated_before = Some(time);
        self
    }

    fn matches(&self, order: &Order) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&order.status) {
            return false;
        }
        if let Some(pair) = &self.pair {
            if &order.pair != pair {
                return false;
            }
        }
        if let Some(limit) = self.updated_before {
            if order.updated_at > limit {
                return false;
            }
        }
        true
    }
}

/// Insert/update/query access to persisted orders.
pub trait Journal: Send + Sync {
    /// Persist a new order, assigning its journal `id`.
    fn create_order(&self, order: &mut Order) -> JournalResult<()>;

    /// Update an existing order by journal `id`.
    fn update_order(&self, order: &Order) -> JournalResult<()>;

    /// Orders matching the query, in insertion order.
    fn orders(&self, query: &OrderQuery) -> JournalResult<Vec<Order>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange_id INTEGER NOT NULL,
    pair TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    status TEXT NOT NULL,
    price REAL NOT NULL,
    quantity REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stop REAL,
    group_id INTEGER,
    ref_price REAL NOT NULL DEFAULT 0,
    profit_pct REAL NOT NULL DEFAULT 0,
    profit_value REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);
";

/// [`Journal`] backed by a SQLite database file.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    /// Open (or create) the journal database at `path`.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, mainly useful in tests.
    pub fn open_in_memory() -> JournalResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn current_status(conn: &Connection, id: i64) -> JournalResult<OrderStatus> {
        let status: Option<String> = conn
            .query_row("SELECT status FROM orders WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let status = status.ok_or(JournalError::OrderNotFound(id))?;
        OrderStatus::from_str(&status).map_err(JournalError::Storage)
    }
}

fn decode_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let side: String = row.get("side")?;
    let order_type: String = row.get("order_type")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let invalid = |err: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            err.into(),
        )
    };
    Ok(Order {
        id: row.get("id")?,
        exchange_id: row.get("exchange_id")?,
        pair: row.get("pair")?,
        side: Side::from_str(&side).map_err(invalid)?,
        order_type: OrderType::from_str(&order_type).map_err(invalid)?,
        status: OrderStatus::from_str(&status).map_err(invalid)?,
        price: row.get("price")?,
        quantity: row.get("quantity")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|err| invalid(err.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|err| invalid(err.to_string()))?
            .with_timezone(&Utc),
        stop: row.get("stop")?,
        group_id: row.get("group_id")?,
        ref_price: row.get("ref_price")?,
        profit_pct: row.get("profit_pct")?,
        profit_value: row.get("profit_value")?,
    })
}

impl Journal for SqliteJournal {
    fn create_order(&self, order: &mut Order) -> JournalResult<()> {
        let conn = self.conn.lock().expect("journal poisoned");
        conn.execute(
            "INSERT INTO orders (
                exchange_id, pair, side, order_type, status, price, quantity,
                created_at, updated_at, stop, group_id, ref_price, profit_pct, profit_value
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                order.exchange_id,
                order.pair,
                order.side.as_str(),
                order.order_type.as_str(),
                order.status.as_str(),
                order.price,
                order.quantity,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
                order.stop,
                order.group_id,
                order.ref_price,
                order.profit_pct,
                order.profit_value,
            ],
        )?;
        order.id = conn.last_insert_rowid();
        Ok(())
    }

    fn update_order(&self, order: &Order) -> JournalResult<()> {
        let conn = self.conn.lock().expect("journal poisoned");
        let current = Self::current_status(&conn, order.id)?;
        if current.is_terminal() && current != order.status {
            return Err(JournalError::TerminalTransition {
                id: order.id,
                from: current,
                to: order.status,
            });
        }
        conn.execute(
            "UPDATE orders SET
                exchange_id = ?1, pair = ?2, side = ?3, order_type = ?4, status = ?5,
                price = ?6, quantity = ?7, created_at = ?8, updated_at = ?9, stop = ?10,
                group_id = ?11, ref_price = ?12, profit_pct = ?13, profit_value = ?14
             WHERE id = ?15",
            params![
                order.exchange_id,
                order.pair,
                order.side.as_str(),
                order.order_type.as_str(),
                order.status.as_str(),
                order.price,
                order.quantity,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
                order.stop,
                order.group_id,
                order.ref_price,
                order.profit_pct,
                order.profit_value,
                order.id,
            ],
        )?;
        Ok(())
    }

    fn orders(&self, query: &OrderQuery) -> JournalResult<Vec<Order>> {
        let conn = self.conn.lock().expect("journal poisoned");
        let mut sql = String::from("SELECT * FROM orders");
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if !query.statuses.is_empty() {
            let placeholders = query
                .statuses
                .iter()
                .enumerate()
                .map(|(idx, _)| format!("?{}", idx + 1))
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("status IN ({placeholders})"));
            for status in &query.statuses {
                args.push(Box::new(status.as_str().to_string()));
            }
        }
        if let Some(pair) = &query.pair {
            clauses.push(format!("pair = ?{}", args.len() + 1));
            args.push(Box::new(pair.clone()));
        }
        if let Some(limit) = query.updated_before {
            clauses.push(format!("updated_at <= ?{}", args.len() + 1));
            args.push(Box::new(limit.to_rfc3339()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");

        let mut statement = conn.prepare(&sql)?;
        let params = args.iter().map(|arg| arg.as_ref()).collect::<Vec<_>>();
        let rows = statement.query_map(params.as_slice(), decode_order)?;
        let mut orders = Vec::new();
        for order in rows {
            orders.push(order?);
        }
        Ok(orders)
    }
}

/// [`Journal`] kept entirely in memory; the default for backtests.
#[derive(Default)]
pub struct MemoryJournal {
    orders: Mutex<Vec<Order>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn create_order(&self, order: &mut Order) -> JournalResult<()> {
        let mut orders = self.orders.lock().expect("journal poisoned");
        order.id = orders.len() as i64 + 1;
        orders.push(order.clone());
        Ok(())
    }

    fn update_order(&self, order: &Order) -> JournalResult<()> {
        let mut orders = self.orders.lock().expect("journal poisoned");
        let stored = orders
            .iter_mut()
            .find(|stored| stored.id == order.id)
            .ok_or(JournalError::OrderNotFound(order.id))?;
        if stored.status.is_terminal() && stored.status != order.status {
            return Err(JournalError::TerminalTransition {
                id: order.id,
                from: stored.status,
                to: order.status,
            });
        }
        *stored = order.clone();
        Ok(())
    }

    fn orders(&self, query: &OrderQuery) -> JournalResult<Vec<Order>> {
        let orders = self.orders.lock().expect("journal poisoned");
        Ok(orders
            .iter()
            .filter(|order| query.matches(order))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_order() -> Order {
        Order {
            id: 0,
            exchange_id: 11,
            pair: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            status: OrderStatus::New,
            price: 100.0,
            quantity: 2.0,
            created_at: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            stop: None,
            group_id: None,
            ref_price: 99.0,
            profit_pct: 0.0,
            profit_value: 0.0,
        }
    }

    fn journals() -> Vec<Box<dyn Journal>> {
        vec![
            Box::new(MemoryJournal::new()),
            Box::new(SqliteJournal::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn create_assigns_sequential_ids() {
        for journal in journals() {
            let mut first = sample_order();
            let mut second = sample_order();
            journal.create_order(&mut first).unwrap();
            journal.create_order(&mut second).unwrap();
            assert_eq!(first.id, 1);
            assert_eq!(second.id, 2);
        }
    }

    #[test]
    fn round_trips_all_fields() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        let mut order = sample_order();
        order.stop = Some(95.5);
        order.group_id = Some(3);
        journal.create_order(&mut order).unwrap();

        let stored = journal.orders(&OrderQuery::new()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], order);
    }

    #[test]
    fn filters_by_status_and_pair() {
        for journal in journals() {
            let mut open = sample_order();
            journal.create_order(&mut open).unwrap();
            let mut filled = sample_order();
            filled.pair = "ETHUSDT".into();
            filled.status = OrderStatus::Filled;
            journal.create_order(&mut filled).unwrap();

            let open_orders = journal
                .orders(&OrderQuery::new().with_status_in([
                    OrderStatus::New,
                    OrderStatus::PartiallyFilled,
                    OrderStatus::PendingCancel,
                ]))
                .unwrap();
            assert_eq!(open_orders.len(), 1);
            assert_eq!(open_orders[0].id, open.id);

            let eth = journal
                .orders(&OrderQuery::new().with_pair("ETHUSDT"))
                .unwrap();
            assert_eq!(eth.len(), 1);
            assert_eq!(eth[0].status, OrderStatus::Filled);
        }
    }

    #[test]
    fn rejects_terminal_to_open_transition() {
        for journal in journals() {
            let mut order = sample_order();
            order.status = OrderStatus::Filled;
            journal.create_order(&mut order).unwrap();

            order.status = OrderStatus::New;
            let err = journal.update_order(&order).unwrap_err();
            assert!(matches!(err, JournalError::TerminalTransition { .. }));
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db");
        {
            let journal = SqliteJournal::open(&path).unwrap();
            let mut order = sample_order();
            journal.create_order(&mut order).unwrap();
        }
        let journal = SqliteJournal::open(&path).unwrap();
        assert_eq!(journal.orders(&OrderQuery::new()).unwrap().len(), 1);
    }
}
