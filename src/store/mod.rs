//! Row-Locked Store Operations
//!
//! The storage contract the engine relies on, expressed as free functions
//! over a `PgConnection` borrowed from the engine's transaction. Every
//! mutation path locks the owning row (`SELECT ... FOR UPDATE`) before the
//! value it will base its write on is read; executions are append-only and
//! take no read lock.

use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::models::{Account, Execution, Order, OrderStatus, Position, Side};

/// Read an account under a row-exclusive lock.
pub async fn lock_account(
    conn: &mut PgConnection,
    account_id: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        "SELECT account_id, balance FROM accounts WHERE account_id = $1 FOR UPDATE",
    )
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Point read of an account without a lock, for the query paths.
pub async fn get_account(
    conn: &mut PgConnection,
    account_id: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>("SELECT account_id, balance FROM accounts WHERE account_id = $1")
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await
}

pub async fn insert_account(
    conn: &mut PgConnection,
    account_id: &str,
    balance: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO accounts (account_id, balance) VALUES ($1, $2)")
        .bind(account_id)
        .bind(balance)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply a signed delta to an account balance. The UPDATE itself takes the
/// row lock; callers that first inspect the balance must hold the lock from
/// `lock_account`. The caller is responsible for 2-decimal rounding.
pub async fn adjust_balance(
    conn: &mut PgConnection,
    account_id: &str,
    delta: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE accounts SET balance = balance + $1 WHERE account_id = $2")
        .bind(delta)
        .bind(account_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Read a position under a row-exclusive lock.
pub async fn lock_position(
    conn: &mut PgConnection,
    account_id: &str,
    symbol: &str,
) -> Result<Option<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>(
        "SELECT account_id, symbol, quantity FROM positions \
         WHERE account_id = $1 AND symbol = $2 FOR UPDATE",
    )
    .bind(account_id)
    .bind(symbol)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn get_position(
    conn: &mut PgConnection,
    account_id: &str,
    symbol: &str,
) -> Result<Option<Position>, sqlx::Error> {
    sqlx::query_as::<_, Position>(
        "SELECT account_id, symbol, quantity FROM positions WHERE account_id = $1 AND symbol = $2",
    )
    .bind(account_id)
    .bind(symbol)
    .fetch_optional(&mut *conn)
    .await
}

/// Credit shares to a position, creating the row when absent.
pub async fn credit_position(
    conn: &mut PgConnection,
    account_id: &str,
    symbol: &str,
    shares: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO positions (account_id, symbol, quantity) VALUES ($1, $2, $3) \
         ON CONFLICT (account_id, symbol) \
         DO UPDATE SET quantity = positions.quantity + EXCLUDED.quantity",
    )
    .bind(account_id)
    .bind(symbol)
    .bind(shares)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Remove shares from an existing position. Returns the number of rows
/// touched so callers can detect a vanished row.
pub async fn debit_position(
    conn: &mut PgConnection,
    account_id: &str,
    symbol: &str,
    shares: Decimal,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE positions SET quantity = quantity - $1 WHERE account_id = $2 AND symbol = $3",
    )
    .bind(shares)
    .bind(account_id)
    .bind(symbol)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Insert a new order and return the server-assigned monotonic id.
pub async fn insert_order(
    conn: &mut PgConnection,
    account_id: &str,
    symbol: &str,
    amount: Decimal,
    limit_price: Decimal,
    creation_time: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO orders (account_id, symbol, amount, limit_price, status, creation_time) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING order_id",
    )
    .bind(account_id)
    .bind(symbol)
    .bind(amount)
    .bind(limit_price)
    .bind(OrderStatus::Open)
    .bind(creation_time)
    .fetch_one(&mut *conn)
    .await
}

pub async fn get_order(
    conn: &mut PgConnection,
    order_id: i64,
) -> Result<Option<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>(
        "SELECT order_id, account_id, symbol, amount, limit_price, status, creation_time \
         FROM orders WHERE order_id = $1",
    )
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Read an order under a row-exclusive lock, for cancellation.
pub async fn lock_order(
    conn: &mut PgConnection,
    order_id: i64,
) -> Result<Option<Order>, sqlx::Error> {
    sqlx::query_as::<_, Order>(
        "SELECT order_id, account_id, symbol, amount, limit_price, status, creation_time \
         FROM orders WHERE order_id = $1 FOR UPDATE",
    )
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn set_order_status(
    conn: &mut PgConnection,
    order_id: i64,
    status: OrderStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE orders SET status = $1 WHERE order_id = $2")
        .bind(status)
        .bind(order_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Lock and return the best resting order opposite `incoming_side` for a
/// symbol: best price first (descending limit for resting buys, ascending
/// for resting sells), then earliest creation_time, then lowest order id.
/// This is the globally defined priority order; locking counterparties in
/// this order across all concurrent placements keeps lock acquisition
/// deadlock-free.
pub async fn best_counter_order(
    conn: &mut PgConnection,
    symbol: &str,
    incoming_side: Side,
) -> Result<Option<Order>, sqlx::Error> {
    let sql = match incoming_side.opposite() {
        Side::Buy => {
            "SELECT order_id, account_id, symbol, amount, limit_price, status, creation_time \
             FROM orders WHERE symbol = $1 AND status = $2 AND amount > 0 \
             ORDER BY limit_price DESC, creation_time ASC, order_id ASC \
             LIMIT 1 FOR UPDATE"
        }
        Side::Sell => {
            "SELECT order_id, account_id, symbol, amount, limit_price, status, creation_time \
             FROM orders WHERE symbol = $1 AND status = $2 AND amount < 0 \
             ORDER BY limit_price ASC, creation_time ASC, order_id ASC \
             LIMIT 1 FOR UPDATE"
        }
    };
    sqlx::query_as::<_, Order>(sql)
        .bind(symbol)
        .bind(OrderStatus::Open)
        .fetch_optional(&mut *conn)
        .await
}

pub async fn insert_execution(
    conn: &mut PgConnection,
    order_id: i64,
    shares: Decimal,
    price: Decimal,
    exec_time: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO executions (order_id, shares, price, exec_time) VALUES ($1, $2, $3, $4)")
        .bind(order_id)
        .bind(shares)
        .bind(price)
        .bind(exec_time)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Total shares filled against an order so far.
pub async fn filled_shares(conn: &mut PgConnection, order_id: i64) -> Result<Decimal, sqlx::Error> {
    sqlx::query_scalar::<_, Decimal>(
        "SELECT COALESCE(SUM(shares), 0) FROM executions WHERE order_id = $1",
    )
    .bind(order_id)
    .fetch_one(&mut *conn)
    .await
}

/// All executions for an order, oldest first. Same-second ties resolve by
/// insertion order.
pub async fn executions_for_order(
    conn: &mut PgConnection,
    order_id: i64,
) -> Result<Vec<Execution>, sqlx::Error> {
    sqlx::query_as::<_, Execution>(
        "SELECT shares, price, exec_time FROM executions \
         WHERE order_id = $1 ORDER BY exec_time ASC, exec_id ASC",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await
}
