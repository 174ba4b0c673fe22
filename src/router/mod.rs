//! Request Router
//!
//! Stateless translation of a parsed request document into engine calls and
//! of engine results into response elements. Each child is dispatched in
//! document order, and a failing child contributes an `<error>` element in
//! its position without aborting its siblings.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;

use crate::engine::{EngineError, MatchingEngine};
use crate::protocol::{
    self, CreateItem, ProtocolError, Request, ResponseItem, TxItem,
};

pub struct Router {
    engine: MatchingEngine,
}

impl Router {
    pub fn new(engine: MatchingEngine) -> Self {
        Self { engine }
    }

    /// Handle one request frame end to end: parse, dispatch, render. Parse
    /// failures at document scope become a single top-level error element.
    pub async fn dispatch(&self, payload: &str) -> String {
        let request = match protocol::parse_request(payload) {
            Ok(request) => request,
            Err(ProtocolError::UnknownRoot(tag)) => {
                return protocol::render_fatal(&format!("unknown root element <{}>", tag));
            }
            Err(e) => {
                return protocol::render_fatal(&format!("XML parse error: {}", e));
            }
        };
        let items = self.route(request).await;
        protocol::render_results(&items)
            .unwrap_or_else(|e| protocol::render_fatal(&format!("response error: {}", e)))
    }

    async fn route(&self, request: Request) -> Vec<ResponseItem> {
        match request {
            Request::Create(items) => self.route_create(items).await,
            Request::Transactions { account_id, items } => {
                self.route_transactions(&account_id, items).await
            }
        }
    }

    async fn route_create(&self, items: Vec<CreateItem>) -> Vec<ResponseItem> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = match item {
                CreateItem::Account { id, balance } => self.create_account(id, balance).await,
                CreateItem::Symbol { sym, account_id, shares } => {
                    self.credit_shares(sym, account_id, shares).await
                }
                CreateItem::Unknown { tag } => ResponseItem::Error {
                    attrs: Vec::new(),
                    message: format!("unknown create child <{}>", tag),
                },
            };
            results.push(result);
        }
        results
    }

    async fn create_account(&self, id: String, balance: String) -> ResponseItem {
        let attrs = vec![("id".to_string(), id.clone())];
        let balance = match parse_decimal(&balance) {
            Ok(balance) => balance,
            Err(message) => return ResponseItem::Error { attrs, message },
        };
        match self.engine.create_account(&id, balance).await {
            Ok(()) => ResponseItem::AccountCreated { id },
            Err(e) => ResponseItem::Error { attrs, message: e.to_string() },
        }
    }

    async fn credit_shares(&self, sym: String, account_id: String, shares: String) -> ResponseItem {
        let attrs = vec![
            ("sym".to_string(), sym.clone()),
            ("id".to_string(), account_id.clone()),
        ];
        let shares = match parse_decimal(&shares) {
            Ok(shares) => shares,
            Err(message) => return ResponseItem::Error { attrs, message },
        };
        match self.engine.credit_shares(&sym, &account_id, shares).await {
            Ok(()) => ResponseItem::PositionCreated { sym, id: account_id },
            Err(e) => ResponseItem::Error { attrs, message: e.to_string() },
        }
    }

    async fn route_transactions(
        &self,
        account_id: &str,
        items: Vec<TxItem>,
    ) -> Vec<ResponseItem> {
        // An unknown acting account fails every child, shape preserved.
        match self.engine.account_exists(account_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("transactions for unknown account {}", account_id);
                let message = EngineError::UnknownAccount(account_id.to_string()).to_string();
                return items
                    .into_iter()
                    .map(|item| ResponseItem::Error {
                        attrs: tx_item_attrs(&item),
                        message: message.clone(),
                    })
                    .collect();
            }
            Err(e) => {
                let message = e.to_string();
                return items
                    .into_iter()
                    .map(|item| ResponseItem::Error {
                        attrs: tx_item_attrs(&item),
                        message: message.clone(),
                    })
                    .collect();
            }
        }

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let attrs = tx_item_attrs(&item);
            let result = match item {
                TxItem::Order { sym, amount, limit } => {
                    self.place_order(account_id, sym, amount, limit).await
                }
                TxItem::Cancel { id } => self.cancel_order(attrs.clone(), id).await,
                TxItem::Query { id } => self.query_order(attrs.clone(), id).await,
                TxItem::Unknown { tag } => ResponseItem::Error {
                    attrs: Vec::new(),
                    message: format!("unknown transactions child <{}>", tag),
                },
            };
            results.push(result);
        }
        results
    }

    async fn place_order(
        &self,
        account_id: &str,
        sym: String,
        amount: String,
        limit: String,
    ) -> ResponseItem {
        let attrs = vec![
            ("sym".to_string(), sym.clone()),
            ("amount".to_string(), amount.clone()),
            ("limit".to_string(), limit.clone()),
        ];
        let (amount, limit) = match (parse_decimal(&amount), parse_decimal(&limit)) {
            (Ok(amount), Ok(limit)) => (amount, limit),
            (Err(message), _) | (_, Err(message)) => {
                return ResponseItem::Error { attrs, message };
            }
        };
        match self.engine.place_order(account_id, &sym, amount, limit).await {
            Ok(order) => ResponseItem::Opened {
                sym,
                amount: order.amount,
                limit: order.limit_price,
                id: order.order_id,
            },
            Err(e) => ResponseItem::Error { attrs, message: e.to_string() },
        }
    }

    async fn cancel_order(&self, attrs: Vec<(String, String)>, id: String) -> ResponseItem {
        let order_id = match parse_order_id(&id) {
            Ok(order_id) => order_id,
            Err(message) => return ResponseItem::Error { attrs, message },
        };
        match self.engine.cancel_order(order_id).await {
            Ok(result) => ResponseItem::Canceled {
                id: result.order_id,
                executions: result.executions,
                leftover: (result.leftover > Decimal::ZERO)
                    .then_some((result.leftover, result.cancel_time)),
            },
            Err(e) => ResponseItem::Error { attrs, message: e.to_string() },
        }
    }

    async fn query_order(&self, attrs: Vec<(String, String)>, id: String) -> ResponseItem {
        let order_id = match parse_order_id(&id) {
            Ok(order_id) => order_id,
            Err(message) => return ResponseItem::Error { attrs, message },
        };
        match self.engine.query_order(order_id).await {
            Ok(result) => ResponseItem::Status {
                id: result.order_id,
                status: result.status,
                open_shares: result.open_shares,
                query_time: Utc::now().timestamp(),
                executions: result.executions,
            },
            Err(e) => ResponseItem::Error { attrs, message: e.to_string() },
        }
    }
}

/// The identifying attributes to echo back when a child fails.
fn tx_item_attrs(item: &TxItem) -> Vec<(String, String)> {
    match item {
        TxItem::Order { sym, amount, limit } => vec![
            ("sym".to_string(), sym.clone()),
            ("amount".to_string(), amount.clone()),
            ("limit".to_string(), limit.clone()),
        ],
        TxItem::Cancel { id } | TxItem::Query { id } => {
            vec![("id".to_string(), id.clone())]
        }
        TxItem::Unknown { .. } => Vec::new(),
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|_| format!("invalid request: malformed number \"{}\"", raw))
}

fn parse_order_id(raw: &str) -> Result<i64, String> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| format!("invalid request: malformed order id \"{}\"", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_attrs_echo_the_raw_strings() {
        let item = TxItem::Order {
            sym: "TEST".into(),
            amount: "abc".into(),
            limit: "".into(),
        };
        assert_eq!(
            tx_item_attrs(&item),
            vec![
                ("sym".to_string(), "TEST".to_string()),
                ("amount".to_string(), "abc".to_string()),
                ("limit".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_numbers_are_rejected_per_child() {
        assert!(parse_decimal("100.5").is_ok());
        assert!(parse_decimal("").is_err());
        assert!(parse_decimal("1e3").is_err());
        assert!(parse_order_id("42").is_ok());
        assert!(parse_order_id("forty-two").is_err());
    }
}
