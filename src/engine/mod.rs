//! Matching Engine
//!
//! Owns the invariants that tie cash, shares, orders, and executions
//! together. Every operation runs inside a single store transaction whose
//! boundary belongs to the engine, not the caller: on any failure after the
//! reservation step the transaction is dropped and rolls back, so no
//! reservation side effect can outlive a failed call.
//!
//! There is no in-memory book. The book for a symbol is the set of OPEN
//! order rows, and matching walks it under row locks taken in the global
//! price-time priority order.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use crate::models::{round_money, Execution, Order, OrderStatus};
use crate::store;

/// Bounded retry for serialization conflicts surfaced by the store.
const MAX_TX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("account {0} already exists")]
    AccountExists(String),

    #[error("unknown order {0}")]
    UnknownOrder(i64),

    #[error("unknown position {account_id}/{symbol}")]
    UnknownPosition { account_id: String, symbol: String },

    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("insufficient shares: need {required}, have {available}")]
    InsufficientShares {
        required: Decimal,
        available: Decimal,
    },

    #[error("order {0} is not open")]
    NotCancellable(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl EngineError {
    fn is_retryable(&self) -> bool {
        match self {
            EngineError::Storage(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}

/// Outcome of a cancellation: the recorded fills, the unfilled remainder
/// whose reservation was just released, and when the release happened.
#[derive(Debug, Clone)]
pub struct CancelResult {
    pub order_id: i64,
    pub executions: Vec<Execution>,
    pub leftover: Decimal,
    pub cancel_time: i64,
}

/// Snapshot of an order's committed state for the query path.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub order_id: i64,
    pub status: OrderStatus,
    pub open_shares: Decimal,
    pub executions: Vec<Execution>,
}

#[derive(Clone)]
pub struct MatchingEngine {
    pool: PgPool,
}

impl MatchingEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Create a new account with an initial balance.
    pub async fn create_account(
        &self,
        account_id: &str,
        balance: Decimal,
    ) -> Result<(), EngineError> {
        if account_id.is_empty() {
            return Err(EngineError::InvalidRequest("account id is empty".to_string()));
        }
        if balance < Decimal::ZERO {
            return Err(EngineError::InvalidRequest(
                "initial balance must not be negative".to_string(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        match store::insert_account(&mut tx, account_id, round_money(balance)).await {
            Ok(()) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(EngineError::AccountExists(account_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;
        info!("created account {}", account_id);
        Ok(())
    }

    /// Credit shares of a symbol to an account, creating the position row
    /// when absent.
    pub async fn credit_shares(
        &self,
        symbol: &str,
        account_id: &str,
        shares: Decimal,
    ) -> Result<(), EngineError> {
        if symbol.is_empty() {
            return Err(EngineError::InvalidRequest("symbol is empty".to_string()));
        }
        if shares <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(
                "share credit must be positive".to_string(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        if store::get_account(&mut tx, account_id).await?.is_none() {
            return Err(EngineError::UnknownAccount(account_id.to_string()));
        }
        store::credit_position(&mut tx, account_id, symbol, shares).await?;
        tx.commit().await?;
        info!("credited {} {} to account {}", shares, symbol, account_id);
        Ok(())
    }

    /// Whether an account exists, for the router's batch-level check.
    pub async fn account_exists(&self, account_id: &str) -> Result<bool, EngineError> {
        let mut conn = self.pool.acquire().await?;
        Ok(store::get_account(&mut conn, account_id).await?.is_some())
    }

    // ========================================================================
    // Order operations
    // ========================================================================

    /// Place a limit order: reserve funds or shares, insert the order, then
    /// match it against the opposite side of the book. Returns the persisted
    /// order with its assigned id and final status.
    pub async fn place_order(
        &self,
        account_id: &str,
        symbol: &str,
        amount: Decimal,
        limit_price: Decimal,
    ) -> Result<Order, EngineError> {
        if symbol.is_empty() {
            return Err(EngineError::InvalidRequest("symbol is empty".to_string()));
        }
        if amount.is_zero() {
            return Err(EngineError::InvalidRequest(
                "order amount must be nonzero".to_string(),
            ));
        }
        if limit_price <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(
                "limit price must be positive".to_string(),
            ));
        }

        let mut attempt = 1;
        loop {
            match self.try_place(account_id, symbol, amount, limit_price).await {
                Err(e) if e.is_retryable() && attempt < MAX_TX_ATTEMPTS => {
                    warn!(
                        "placement for {} conflicted (attempt {}), retrying: {}",
                        account_id, attempt, e
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_place(
        &self,
        account_id: &str,
        symbol: &str,
        amount: Decimal,
        limit_price: Decimal,
    ) -> Result<Order, EngineError> {
        let mut tx = self.pool.begin().await?;

        // Reservation. The account row lock serializes concurrent placements
        // by the same account.
        let account = store::lock_account(&mut tx, account_id)
            .await?
            .ok_or_else(|| EngineError::UnknownAccount(account_id.to_string()))?;

        let shares = amount.abs();
        if amount > Decimal::ZERO {
            let required = shares * limit_price;
            if account.balance < required {
                return Err(EngineError::InsufficientFunds {
                    required: round_money(required),
                    available: account.balance,
                });
            }
            store::adjust_balance(&mut tx, account_id, -round_money(required)).await?;
        } else {
            let position = store::lock_position(&mut tx, account_id, symbol).await?;
            let held = position.map(|p| p.quantity).unwrap_or(Decimal::ZERO);
            if held < shares {
                return Err(EngineError::InsufficientShares {
                    required: shares,
                    available: held,
                });
            }
            let touched = store::debit_position(&mut tx, account_id, symbol, shares).await?;
            if touched == 0 {
                return Err(EngineError::UnknownPosition {
                    account_id: account_id.to_string(),
                    symbol: symbol.to_string(),
                });
            }
        }

        // Insertion. Whole-second creation times can tie; the assigned id
        // breaks the tie in the book ordering.
        let creation_time = Utc::now().timestamp();
        let order_id =
            store::insert_order(&mut tx, account_id, symbol, amount, limit_price, creation_time)
                .await?;
        let mut order = Order {
            order_id,
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            amount,
            limit_price,
            status: OrderStatus::Open,
            creation_time,
        };

        self.match_incoming(&mut tx, &mut order).await?;

        tx.commit().await?;
        info!(
            "opened order {} for {}: {} {} @ {} ({})",
            order.order_id, account_id, amount, symbol, limit_price, order.status
        );
        Ok(order)
    }

    /// Walk the opposite side of the book for the just-placed order.
    ///
    /// Each iteration locks the current best counterparty in the global
    /// priority order and either trades with it or proves that no resting
    /// order can cross, which ends the walk. The counterparty, being older
    /// with a lower id, is always the resting order and dictates the price.
    async fn match_incoming(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        incoming: &mut Order,
    ) -> Result<(), EngineError> {
        let mut open = incoming.total_shares();

        while open > Decimal::ZERO {
            let Some(counter) =
                store::best_counter_order(tx, &incoming.symbol, incoming.side()).await?
            else {
                break;
            };

            let (buy_limit, sell_limit) = pair_limits(incoming, &counter);
            if !crosses(buy_limit, sell_limit) {
                break;
            }
            let exec_price = counter.limit_price;

            let counter_open = counter.remaining(store::filled_shares(tx, counter.order_id).await?);
            if counter_open <= Decimal::ZERO {
                // A fully filled order left OPEN should not exist; repair the
                // status and move to the next candidate.
                warn!("order {} is open with nothing left, marking executed", counter.order_id);
                store::set_order_status(tx, counter.order_id, OrderStatus::Executed).await?;
                continue;
            }

            let quantity = open.min(counter_open);
            let exec_time = Utc::now().timestamp();
            store::insert_execution(tx, incoming.order_id, quantity, exec_price, exec_time).await?;
            store::insert_execution(tx, counter.order_id, quantity, exec_price, exec_time).await?;

            // Settle each side once per fill. The buyer receives shares plus
            // the incremental refund of the over-reserved cash; the seller
            // receives proceeds at the execution price, shares having been
            // debited at reservation.
            let (buyer, seller) = if incoming.is_buy() {
                (&*incoming, &counter)
            } else {
                (&counter, &*incoming)
            };
            store::credit_position(tx, &buyer.account_id, &incoming.symbol, quantity).await?;
            let refund = buyer_refund(buyer.limit_price, exec_price, quantity);
            if refund > Decimal::ZERO {
                store::adjust_balance(tx, &buyer.account_id, round_money(refund)).await?;
            }
            store::adjust_balance(tx, &seller.account_id, round_money(quantity * exec_price))
                .await?;

            if counter_open == quantity {
                store::set_order_status(tx, counter.order_id, OrderStatus::Executed).await?;
            }
            open -= quantity;

            debug!(
                "filled {} {} @ {} between orders {} and {}",
                quantity, incoming.symbol, exec_price, incoming.order_id, counter.order_id
            );
        }

        if open.is_zero() {
            store::set_order_status(tx, incoming.order_id, OrderStatus::Executed).await?;
            incoming.status = OrderStatus::Executed;
        }
        Ok(())
    }

    /// Cancel an OPEN order and release the reservation for its unfilled
    /// remainder. Already-filled shares are not reversed.
    pub async fn cancel_order(&self, order_id: i64) -> Result<CancelResult, EngineError> {
        let mut attempt = 1;
        loop {
            match self.try_cancel(order_id).await {
                Err(e) if e.is_retryable() && attempt < MAX_TX_ATTEMPTS => {
                    warn!(
                        "cancel of order {} conflicted (attempt {}), retrying: {}",
                        order_id, attempt, e
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_cancel(&self, order_id: i64) -> Result<CancelResult, EngineError> {
        let mut tx = self.pool.begin().await?;

        let order = store::lock_order(&mut tx, order_id)
            .await?
            .ok_or(EngineError::UnknownOrder(order_id))?;
        if !order.status.is_open() {
            return Err(EngineError::NotCancellable(order_id));
        }

        let filled = store::filled_shares(&mut tx, order_id).await?;
        let leftover = order.remaining(filled);
        if leftover > Decimal::ZERO {
            if order.is_buy() {
                // Refund at the order's own limit price: that is the rate the
                // reservation was taken at.
                store::adjust_balance(
                    &mut tx,
                    &order.account_id,
                    round_money(leftover * order.limit_price),
                )
                .await?;
            } else {
                store::credit_position(&mut tx, &order.account_id, &order.symbol, leftover).await?;
            }
        }
        store::set_order_status(&mut tx, order_id, OrderStatus::Canceled).await?;
        let executions = store::executions_for_order(&mut tx, order_id).await?;
        let cancel_time = Utc::now().timestamp();

        tx.commit().await?;
        info!("canceled order {} with {} unfilled", order_id, leftover);
        Ok(CancelResult {
            order_id,
            executions,
            leftover,
            cancel_time,
        })
    }

    /// Report an order's committed status, open shares, and executions in
    /// ascending execution time. Does not mutate.
    pub async fn query_order(&self, order_id: i64) -> Result<QueryResult, EngineError> {
        let mut tx = self.pool.begin().await?;
        let order = store::get_order(&mut tx, order_id)
            .await?
            .ok_or(EngineError::UnknownOrder(order_id))?;
        let filled = store::filled_shares(&mut tx, order_id).await?;
        let executions = store::executions_for_order(&mut tx, order_id).await?;
        tx.commit().await?;
        Ok(QueryResult {
            order_id,
            status: order.status,
            open_shares: order.remaining(filled),
            executions,
        })
    }
}

// ============================================================================
// Fill arithmetic
// ============================================================================

/// The buy and sell limits of a matched pair, in that order.
fn pair_limits(incoming: &Order, counter: &Order) -> (Decimal, Decimal) {
    if incoming.is_buy() {
        (incoming.limit_price, counter.limit_price)
    } else {
        (counter.limit_price, incoming.limit_price)
    }
}

/// A pair crosses when someone is willing to pay at least what the other
/// asks.
fn crosses(buy_limit: Decimal, sell_limit: Decimal) -> bool {
    sell_limit <= buy_limit
}

/// Cash returned to the buyer for one fill: the reservation was taken at the
/// buyer's limit, the trade happened at the resting price. Never negative
/// because matching only fills at `exec_price <= buy_limit`.
fn buyer_refund(buy_limit: Decimal, exec_price: Decimal, shares: Decimal) -> Decimal {
    shares * (buy_limit - exec_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use rust_decimal_macros::dec;

    fn order(id: i64, amount: Decimal, limit: Decimal) -> Order {
        Order {
            order_id: id,
            account_id: format!("acct{}", id),
            symbol: "TEST".to_string(),
            amount,
            limit_price: limit,
            status: OrderStatus::Open,
            creation_time: 1000 + id,
        }
    }

    #[test]
    fn crossing_requires_sell_at_or_below_buy() {
        assert!(crosses(dec!(50), dec!(45)));
        assert!(crosses(dec!(50), dec!(50)));
        assert!(!crosses(dec!(40), dec!(45)));
    }

    #[test]
    fn pair_limits_ignore_arrival_order() {
        let buy = order(2, dec!(100), dec!(50));
        let sell = order(1, dec!(-100), dec!(45));
        assert_eq!(pair_limits(&buy, &sell), (dec!(50), dec!(45)));
        assert_eq!(pair_limits(&sell, &buy), (dec!(50), dec!(45)));
    }

    #[test]
    fn refund_is_spread_times_shares() {
        // A buyer at 50 filled at 45 gets the 5-per-share spread back.
        assert_eq!(buyer_refund(dec!(50), dec!(45), dec!(50)), dec!(250));
        // Filling at the buyer's own limit refunds nothing.
        assert_eq!(buyer_refund(dec!(50), dec!(50), dec!(100)), dec!(0));
    }

    #[test]
    fn refund_rounds_only_at_the_balance_write() {
        let refund = buyer_refund(dec!(10.01), dec!(10.00), dec!(0.5));
        assert_eq!(refund, dec!(0.005));
        assert_eq!(round_money(refund), dec!(0.01));
    }

    #[test]
    fn retryable_errors_are_serialization_failures_only() {
        let err = EngineError::UnknownOrder(7);
        assert!(!err.is_retryable());
        let err = EngineError::Storage(sqlx::Error::PoolTimedOut);
        assert!(!err.is_retryable());
    }
}
