//! End-to-end matching scenarios against a live PostgreSQL.
//!
//! These tests exercise the engine through real transactions and are ignored
//! by default; run them with a database reachable through the `DB_*`
//! environment variables:
//!
//! ```text
//! cargo test --test matching -- --ignored
//! ```
//!
//! Every test provisions its own accounts and symbols, so the suite can run
//! against a shared database repeatedly.

use std::sync::atomic::{AtomicU32, Ordering};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;

use exchange_server::config::AppConfig;
use exchange_server::db::Database;
use exchange_server::engine::{EngineError, MatchingEngine};
use exchange_server::models::OrderStatus;
use exchange_server::router::Router;

static SEQ: AtomicU32 = AtomicU32::new(0);

fn unique(prefix: &str) -> String {
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, std::process::id(), n)
}

async fn engine() -> (MatchingEngine, PgPool) {
    let config = AppConfig::load().expect("config");
    let db = Database::connect(&config).await.expect("database");
    db.init_schema().await.expect("schema");
    let pool = db.pool.clone();
    (MatchingEngine::new(pool.clone()), pool)
}

async fn balance(pool: &PgPool, account_id: &str) -> Decimal {
    sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = $1")
        .bind(account_id)
        .fetch_one(pool)
        .await
        .expect("balance")
}

async fn position(pool: &PgPool, account_id: &str, symbol: &str) -> Decimal {
    sqlx::query_scalar("SELECT quantity FROM positions WHERE account_id = $1 AND symbol = $2")
        .bind(account_id)
        .bind(symbol)
        .fetch_optional(pool)
        .await
        .expect("position")
        .unwrap_or(Decimal::ZERO)
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn s1_full_fill_buyer_crosses_up() {
    let (engine, pool) = engine().await;
    let sym = unique("TEST");
    let seller = unique("seller");
    let buyer = unique("buyer");

    engine.create_account(&seller, dec!(5000)).await.unwrap();
    engine.credit_shares(&sym, &seller, dec!(200)).await.unwrap();
    engine.create_account(&buyer, dec!(10000)).await.unwrap();

    let sell = engine.place_order(&seller, &sym, dec!(-100), dec!(45)).await.unwrap();
    let buy = engine.place_order(&buyer, &sym, dec!(100), dec!(50)).await.unwrap();

    // One execution at the resting price, both orders terminal.
    assert_eq!(buy.status, OrderStatus::Executed);
    let buy_query = engine.query_order(buy.order_id).await.unwrap();
    assert_eq!(buy_query.status, OrderStatus::Executed);
    assert_eq!(buy_query.open_shares, dec!(0));
    assert_eq!(buy_query.executions.len(), 1);
    assert_eq!(buy_query.executions[0].shares, dec!(100));
    assert_eq!(buy_query.executions[0].price, dec!(45));

    let sell_query = engine.query_order(sell.order_id).await.unwrap();
    assert_eq!(sell_query.status, OrderStatus::Executed);
    assert_eq!(sell_query.executions.len(), 1);

    // Conservation: buyer paid 100 * 45 net of the refund, seller received
    // exactly that, and the traded shares moved once.
    assert_eq!(balance(&pool, &buyer).await, dec!(5500));
    assert_eq!(position(&pool, &buyer, &sym).await, dec!(100));
    assert_eq!(balance(&pool, &seller).await, dec!(9500));
    assert_eq!(position(&pool, &seller, &sym).await, dec!(100));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn s2_cancel_buy_with_no_fills_refunds_the_reservation() {
    let (engine, pool) = engine().await;
    let sym = unique("TEST");
    let buyer = unique("buyer");

    engine.create_account(&buyer, dec!(8000)).await.unwrap();
    let order = engine.place_order(&buyer, &sym, dec!(100), dec!(60)).await.unwrap();
    assert_eq!(balance(&pool, &buyer).await, dec!(2000));

    let cancel = engine.cancel_order(order.order_id).await.unwrap();
    assert_eq!(cancel.leftover, dec!(100));
    assert!(cancel.executions.is_empty());
    assert_eq!(balance(&pool, &buyer).await, dec!(8000));

    let query = engine.query_order(order.order_id).await.unwrap();
    assert_eq!(query.status, OrderStatus::Canceled);
    assert_eq!(query.open_shares, dec!(100));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn s3_cancel_sell_with_no_fills_returns_the_shares() {
    let (engine, pool) = engine().await;
    let sym = unique("TEST");
    let seller = unique("seller");

    engine.create_account(&seller, dec!(0)).await.unwrap();
    engine.credit_shares(&sym, &seller, dec!(200)).await.unwrap();

    let order = engine.place_order(&seller, &sym, dec!(-100), dec!(40)).await.unwrap();
    assert_eq!(position(&pool, &seller, &sym).await, dec!(100));

    engine.cancel_order(order.order_id).await.unwrap();
    assert_eq!(position(&pool, &seller, &sym).await, dec!(200));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn s4_partial_fill_leaves_the_incoming_order_open() {
    let (engine, pool) = engine().await;
    let sym = unique("TEST");
    let seller = unique("seller");
    let buyer = unique("buyer");

    engine.create_account(&seller, dec!(0)).await.unwrap();
    engine.credit_shares(&sym, &seller, dec!(50)).await.unwrap();
    engine.create_account(&buyer, dec!(10000)).await.unwrap();

    engine.place_order(&seller, &sym, dec!(-50), dec!(45)).await.unwrap();
    let buy = engine.place_order(&buyer, &sym, dec!(100), dec!(50)).await.unwrap();

    assert_eq!(buy.status, OrderStatus::Open);
    let query = engine.query_order(buy.order_id).await.unwrap();
    assert_eq!(query.status, OrderStatus::Open);
    assert_eq!(query.open_shares, dec!(50));
    assert_eq!(query.executions.len(), 1);
    assert_eq!(query.executions[0].shares, dec!(50));
    assert_eq!(query.executions[0].price, dec!(45));

    // 10000 - 5000 reserved + 250 refunded on the fill.
    assert_eq!(balance(&pool, &buyer).await, dec!(5250));
    assert_eq!(position(&pool, &buyer, &sym).await, dec!(50));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn s5_multi_level_walk_follows_price_priority() {
    let (engine, pool) = engine().await;
    let sym = unique("TEST");
    let seller = unique("seller");
    let buyer = unique("buyer");

    engine.create_account(&seller, dec!(0)).await.unwrap();
    engine.credit_shares(&sym, &seller, dec!(230)).await.unwrap();
    engine.create_account(&buyer, dec!(15000)).await.unwrap();

    engine.place_order(&seller, &sym, dec!(-80), dec!(45)).await.unwrap();
    engine.place_order(&seller, &sym, dec!(-100), dec!(48)).await.unwrap();
    engine.place_order(&seller, &sym, dec!(-50), dec!(47)).await.unwrap();

    let buy = engine.place_order(&buyer, &sym, dec!(250), dec!(50)).await.unwrap();
    assert_eq!(buy.status, OrderStatus::Open);

    // The walk sweeps by price, not arrival: 80@45, then 50@47, then 100@48,
    // leaving 20 unfilled.
    let query = engine.query_order(buy.order_id).await.unwrap();
    assert_eq!(query.open_shares, dec!(20));
    let fills: Vec<(Decimal, Decimal)> =
        query.executions.iter().map(|e| (e.shares, e.price)).collect();
    assert_eq!(
        fills,
        vec![
            (dec!(80), dec!(45)),
            (dec!(50), dec!(47)),
            (dec!(100), dec!(48)),
        ]
    );

    // 15000 - 12500 reserved + (80*5 + 50*3 + 100*2) refunded.
    assert_eq!(balance(&pool, &buyer).await, dec!(3250));
    assert_eq!(position(&pool, &buyer, &sym).await, dec!(230));
    assert_eq!(balance(&pool, &seller).await, dec!(10750));
    assert_eq!(position(&pool, &seller, &sym).await, dec!(0));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn s6_non_crossing_orders_rest_on_the_book() {
    let (engine, pool) = engine().await;
    let sym = unique("TEST");
    let seller = unique("seller");
    let buyer = unique("buyer");

    engine.create_account(&seller, dec!(0)).await.unwrap();
    engine.credit_shares(&sym, &seller, dec!(100)).await.unwrap();
    engine.create_account(&buyer, dec!(10000)).await.unwrap();

    let sell = engine.place_order(&seller, &sym, dec!(-100), dec!(45)).await.unwrap();
    let buy = engine.place_order(&buyer, &sym, dec!(100), dec!(40)).await.unwrap();

    assert_eq!(sell.status, OrderStatus::Open);
    assert_eq!(buy.status, OrderStatus::Open);
    assert!(engine.query_order(buy.order_id).await.unwrap().executions.is_empty());
    assert_eq!(balance(&pool, &buyer).await, dec!(6000));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn place_then_query_round_trip() {
    let (engine, _pool) = engine().await;
    let sym = unique("TEST");
    let buyer = unique("buyer");

    engine.create_account(&buyer, dec!(10000)).await.unwrap();
    let order = engine.place_order(&buyer, &sym, dec!(100), dec!(50)).await.unwrap();

    let query = engine.query_order(order.order_id).await.unwrap();
    assert_eq!(query.status, OrderStatus::Open);
    assert_eq!(query.open_shares, dec!(100));
    assert!(query.executions.is_empty());
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn equal_prices_fill_in_arrival_order() {
    let (engine, _pool) = engine().await;
    let sym = unique("TEST");
    let first = unique("first");
    let second = unique("second");
    let buyer = unique("buyer");

    for seller in [&first, &second] {
        engine.create_account(seller, dec!(0)).await.unwrap();
        engine.credit_shares(&sym, seller, dec!(50)).await.unwrap();
    }
    engine.create_account(&buyer, dec!(10000)).await.unwrap();

    let older = engine.place_order(&first, &sym, dec!(-50), dec!(45)).await.unwrap();
    let newer = engine.place_order(&second, &sym, dec!(-50), dec!(45)).await.unwrap();
    engine.place_order(&buyer, &sym, dec!(50), dec!(45)).await.unwrap();

    assert_eq!(
        engine.query_order(older.order_id).await.unwrap().status,
        OrderStatus::Executed
    );
    assert_eq!(
        engine.query_order(newer.order_id).await.unwrap().status,
        OrderStatus::Open
    );
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn reservation_failures_leave_no_trace() {
    let (engine, pool) = engine().await;
    let sym = unique("TEST");
    let trader = unique("trader");

    engine.create_account(&trader, dec!(100)).await.unwrap();

    let err = engine.place_order(&trader, &sym, dec!(100), dec!(50)).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    assert_eq!(balance(&pool, &trader).await, dec!(100));

    let err = engine.place_order(&trader, &sym, dec!(-10), dec!(50)).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientShares { .. }));
    assert_eq!(position(&pool, &trader, &sym).await, dec!(0));

    let err = engine
        .place_order(&unique("ghost"), &sym, dec!(10), dec!(50))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownAccount(_)));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn terminal_orders_cannot_be_canceled() {
    let (engine, _pool) = engine().await;
    let sym = unique("TEST");
    let seller = unique("seller");
    let buyer = unique("buyer");

    engine.create_account(&seller, dec!(0)).await.unwrap();
    engine.credit_shares(&sym, &seller, dec!(100)).await.unwrap();
    engine.create_account(&buyer, dec!(10000)).await.unwrap();

    let sell = engine.place_order(&seller, &sym, dec!(-100), dec!(45)).await.unwrap();
    engine.place_order(&buyer, &sym, dec!(100), dec!(50)).await.unwrap();

    let err = engine.cancel_order(sell.order_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable(_)));

    let err = engine.cancel_order(i64::MAX).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownOrder(_)));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (DB_* env)"]
async fn router_serves_a_full_session_over_documents() {
    let (engine, _pool) = engine().await;
    let router = Router::new(engine);
    let sym = unique("TEST");
    let alice = unique("alice");
    let bob = unique("bob");

    let create = format!(
        r#"<create>
            <account id="{alice}" balance="10000"/>
            <account id="{bob}" balance="0"/>
            <symbol sym="{sym}"><account id="{bob}">100</account></symbol>
            <account id="{alice}" balance="10000"/>
        </create>"#
    );
    let response = router.dispatch(&create).await;
    assert!(response.starts_with("<results>"));
    assert!(response.contains(&format!("<created id=\"{alice}\"/>")));
    assert!(response.contains(&format!("<created sym=\"{sym}\" id=\"{bob}\"/>")));
    // The duplicate account fails alone, in position.
    assert!(response.contains(&format!("<error id=\"{alice}\">")));

    let sells = format!(
        r#"<transactions id="{bob}"><order sym="{sym}" amount="-100" limit="45"/></transactions>"#
    );
    let response = router.dispatch(&sells).await;
    assert!(response.contains("<opened"));

    let buys = format!(
        r#"<transactions id="{alice}">
            <order sym="{sym}" amount="100" limit="50"/>
            <order sym="{sym}" amount="bogus" limit="50"/>
        </transactions>"#
    );
    let response = router.dispatch(&buys).await;
    assert!(response.contains(&format!(
        "<opened sym=\"{sym}\" amount=\"100\" limit=\"50.00\""
    )));
    assert!(response.contains("<error sym=\"") && response.contains("amount=\"bogus\""));

    let unknown = format!(
        r#"<transactions id="{ghost}"><query id="1"/></transactions>"#,
        ghost = unique("ghost")
    );
    let response = router.dispatch(&unknown).await;
    assert!(response.contains("<error id=\"1\">unknown account"));
}
