//! Exchange Data Model
//!
//! Row types for the four persisted entities plus the monetary arithmetic
//! rules shared by the engine and the wire layer.
//!
//! An order's sign carries its side: positive `amount` is a BUY, negative a
//! SELL. The original amount is never mutated after insertion; the remaining
//! open quantity is always derived as `|amount| - filled`.

use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::FromRow;
use std::fmt;

/// Order side, derived from the sign of the order amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order lifecycle state. OPEN orders form the book; EXECUTED and CANCELED
/// are both terminal. A partially filled order stays OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Open,
    Executed,
    Canceled,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Open)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::Canceled => "CANCELED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(OrderStatus::Open),
            "EXECUTED" => Ok(OrderStatus::Executed),
            "CANCELED" => Ok(OrderStatus::Canceled),
            _ => Err(format!("invalid order status: {}", s)),
        }
    }
}

/// A funded trading account. `balance` is exact decimal currency, kept at
/// 2 decimal places and never negative.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub account_id: String,
    pub balance: Decimal,
}

/// Shares of one symbol held by one account. Short positions are forbidden,
/// so `quantity` is never negative.
#[derive(Debug, Clone, FromRow)]
pub struct Position {
    pub account_id: String,
    pub symbol: String,
    pub quantity: Decimal,
}

/// A limit order as persisted. `amount` keeps its placement-time value for
/// the whole lifetime of the row.
#[derive(Debug, Clone, FromRow)]
pub struct Order {
    pub order_id: i64,
    pub account_id: String,
    pub symbol: String,
    pub amount: Decimal,
    pub limit_price: Decimal,
    pub status: OrderStatus,
    pub creation_time: i64,
}

impl Order {
    pub fn side(&self) -> Side {
        if self.amount > Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn is_buy(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    /// Total shares originally placed, regardless of side.
    pub fn total_shares(&self) -> Decimal {
        self.amount.abs()
    }

    /// Shares still unfilled given the executed total.
    pub fn remaining(&self, filled: Decimal) -> Decimal {
        self.amount.abs() - filled
    }
}

/// One fill recorded against one order. A trade between two orders produces
/// two of these, one per side, sharing shares, price, and time.
#[derive(Debug, Clone, FromRow)]
pub struct Execution {
    pub shares: Decimal,
    pub price: Decimal,
    pub exec_time: i64,
}

// ============================================================================
// Monetary arithmetic
// ============================================================================

/// Round a currency value to 2 decimal places, half-up. Applied only when a
/// balance field is written; intermediate products keep full precision.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Canonical wire rendering of a currency value: plain decimal, exactly two
/// decimal places, no exponent.
pub fn fmt_money(value: Decimal) -> String {
    format!("{:.2}", round_money(value))
}

/// Canonical wire rendering of a share quantity: plain decimal with trailing
/// zeros stripped.
pub fn fmt_shares(value: Decimal) -> String {
    value.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(amount: Decimal) -> Order {
        Order {
            order_id: 1,
            account_id: "acct".to_string(),
            symbol: "TEST".to_string(),
            amount,
            limit_price: dec!(50),
            status: OrderStatus::Open,
            creation_time: 1000,
        }
    }

    #[test]
    fn side_follows_amount_sign() {
        assert_eq!(order(dec!(100)).side(), Side::Buy);
        assert_eq!(order(dec!(-100)).side(), Side::Sell);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn remaining_is_derived_from_magnitude() {
        let o = order(dec!(-100));
        assert_eq!(o.total_shares(), dec!(100));
        assert_eq!(o.remaining(dec!(30)), dec!(70));
        assert_eq!(o.remaining(dec!(100)), dec!(0));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [OrderStatus::Open, OrderStatus::Executed, OrderStatus::Canceled] {
            assert_eq!(status.to_string().parse::<OrderStatus>(), Ok(status));
        }
        assert!("filled".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn money_rounds_half_up_at_two_decimals() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(1.004)), dec!(1.00));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
        assert_eq!(round_money(dec!(250)), dec!(250));
    }

    #[test]
    fn wire_formats_are_canonical() {
        assert_eq!(fmt_money(dec!(5500)), "5500.00");
        assert_eq!(fmt_money(dec!(45.5)), "45.50");
        assert_eq!(fmt_shares(dec!(100.00)), "100");
        assert_eq!(fmt_shares(dec!(0.5000)), "0.5");
    }
}
