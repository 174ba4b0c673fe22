//! Wire Documents
//!
//! Parsing of `<create>` / `<transactions>` request documents and rendering
//! of the single `<results>` response document. This layer is a thin
//! translation: it keeps every child in document order, carries malformed
//! values through as raw strings for the router to reject individually, and
//! knows nothing about the engine.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use rust_decimal::Decimal;

use crate::models::{fmt_money, fmt_shares, Execution, OrderStatus};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed document: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("unknown root element <{0}>")]
    UnknownRoot(String),

    #[error("unexpected end of document")]
    Truncated,

    #[error("response write failed: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Requests
// ============================================================================

/// A parsed request frame. Attribute and text values stay raw strings so a
/// malformed number fails exactly one child, not the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create(Vec<CreateItem>),
    Transactions {
        account_id: String,
        items: Vec<TxItem>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateItem {
    Account { id: String, balance: String },
    Symbol { sym: String, account_id: String, shares: String },
    Unknown { tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxItem {
    Order { sym: String, amount: String, limit: String },
    Cancel { id: String },
    Query { id: String },
    Unknown { tag: String },
}

/// Parse one request document.
pub fn parse_request(input: &str) -> Result<Request, ProtocolError> {
    let mut reader = Reader::from_str(input);
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let tag = tag_name(&e);
                return match tag.as_str() {
                    "create" => parse_create(&mut reader),
                    "transactions" => {
                        let account_id = attr_value(&e, "id")?.unwrap_or_default();
                        parse_transactions(&mut reader, account_id)
                    }
                    _ => Err(ProtocolError::UnknownRoot(tag)),
                };
            }
            Event::Empty(e) => {
                let tag = tag_name(&e);
                return match tag.as_str() {
                    "create" => Ok(Request::Create(Vec::new())),
                    "transactions" => Ok(Request::Transactions {
                        account_id: attr_value(&e, "id")?.unwrap_or_default(),
                        items: Vec::new(),
                    }),
                    _ => Err(ProtocolError::UnknownRoot(tag)),
                };
            }
            Event::Text(t) => {
                if !t.unescape()?.trim().is_empty() {
                    return Err(ProtocolError::UnknownRoot("#text".to_string()));
                }
            }
            Event::Eof => return Err(ProtocolError::Truncated),
            _ => {}
        }
    }
}

fn parse_create(reader: &mut Reader<&[u8]>) -> Result<Request, ProtocolError> {
    let mut items = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Empty(e) => match tag_name(&e).as_str() {
                "account" => items.push(account_item(&e)?),
                "symbol" => {} // a symbol with no children credits nothing
                tag => items.push(CreateItem::Unknown { tag: tag.to_string() }),
            },
            Event::Start(e) => match tag_name(&e).as_str() {
                "account" => {
                    items.push(account_item(&e)?);
                    skip_subtree(reader, &e)?;
                }
                "symbol" => {
                    let sym = attr_value(&e, "sym")?.unwrap_or_default();
                    parse_symbol_children(reader, sym, &mut items)?;
                }
                tag => {
                    items.push(CreateItem::Unknown { tag: tag.to_string() });
                    skip_subtree(reader, &e)?;
                }
            },
            Event::End(_) => return Ok(Request::Create(items)),
            Event::Eof => return Err(ProtocolError::Truncated),
            _ => {}
        }
    }
}

fn account_item(e: &BytesStart) -> Result<CreateItem, ProtocolError> {
    Ok(CreateItem::Account {
        id: attr_value(e, "id")?.unwrap_or_default(),
        balance: attr_value(e, "balance")?.unwrap_or_default(),
    })
}

/// Flatten `<symbol sym><account id>QTY</account>...</symbol>` into one item
/// per listed account, preserving order.
fn parse_symbol_children(
    reader: &mut Reader<&[u8]>,
    sym: String,
    items: &mut Vec<CreateItem>,
) -> Result<(), ProtocolError> {
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if tag_name(&e) == "account" {
                    let account_id = attr_value(&e, "id")?.unwrap_or_default();
                    let shares = read_element_text(reader)?;
                    items.push(CreateItem::Symbol {
                        sym: sym.clone(),
                        account_id,
                        shares,
                    });
                } else {
                    skip_subtree(reader, &e)?;
                }
            }
            Event::Empty(e) => {
                if tag_name(&e) == "account" {
                    items.push(CreateItem::Symbol {
                        sym: sym.clone(),
                        account_id: attr_value(&e, "id")?.unwrap_or_default(),
                        shares: String::new(),
                    });
                }
            }
            Event::End(_) => return Ok(()),
            Event::Eof => return Err(ProtocolError::Truncated),
            _ => {}
        }
    }
}

fn parse_transactions(
    reader: &mut Reader<&[u8]>,
    account_id: String,
) -> Result<Request, ProtocolError> {
    let mut items = Vec::new();
    loop {
        let event = reader.read_event()?;
        match event {
            Event::Empty(ref e) | Event::Start(ref e) => {
                let item = match tag_name(e).as_str() {
                    "order" => TxItem::Order {
                        sym: attr_value(e, "sym")?.unwrap_or_default(),
                        amount: attr_value(e, "amount")?.unwrap_or_default(),
                        limit: attr_value(e, "limit")?.unwrap_or_default(),
                    },
                    "cancel" => TxItem::Cancel {
                        id: attr_value(e, "id")?.unwrap_or_default(),
                    },
                    "query" => TxItem::Query {
                        id: attr_value(e, "id")?.unwrap_or_default(),
                    },
                    tag => TxItem::Unknown { tag: tag.to_string() },
                };
                if let Event::Start(ref e) = event {
                    skip_subtree(reader, e)?;
                }
                items.push(item);
            }
            Event::End(_) => return Ok(Request::Transactions { account_id, items }),
            Event::Eof => return Err(ProtocolError::Truncated),
            _ => {}
        }
    }
}

fn tag_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attr_value(e: &BytesStart, name: &str) -> Result<Option<String>, ProtocolError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == name.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Consume everything up to the matching end tag of `e`.
fn skip_subtree(reader: &mut Reader<&[u8]>, e: &BytesStart) -> Result<(), ProtocolError> {
    let name = e.name().as_ref().to_vec();
    reader.read_to_end(QName(&name))?;
    Ok(())
}

/// Collect the trimmed text content of the current element.
fn read_element_text(reader: &mut Reader<&[u8]>) -> Result<String, ProtocolError> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(t) => text.push_str(t.unescape()?.trim()),
            Event::Start(e) => skip_subtree(reader, &e)?,
            Event::End(_) => return Ok(text),
            Event::Eof => return Err(ProtocolError::Truncated),
            _ => {}
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// One child of the `<results>` response, in the order the request children
/// arrived.
#[derive(Debug, Clone)]
pub enum ResponseItem {
    AccountCreated {
        id: String,
    },
    PositionCreated {
        sym: String,
        id: String,
    },
    Opened {
        sym: String,
        amount: Decimal,
        limit: Decimal,
        id: i64,
    },
    Canceled {
        id: i64,
        executions: Vec<Execution>,
        /// Unfilled remainder and the time it was released, when any.
        leftover: Option<(Decimal, i64)>,
    },
    Status {
        id: i64,
        status: OrderStatus,
        open_shares: Decimal,
        /// Render time for the canceled-remainder child; the store keeps no
        /// cancellation timestamp.
        query_time: i64,
        executions: Vec<Execution>,
    },
    /// Any per-child failure, echoing the identifying attributes of the
    /// request child verbatim.
    Error {
        attrs: Vec<(String, String)>,
        message: String,
    },
}

/// Render the aggregate response document for one request frame.
pub fn render_results(items: &[ResponseItem]) -> Result<String, ProtocolError> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Start(BytesStart::new("results")))?;
    for item in items {
        write_item(&mut writer, item)?;
    }
    writer.write_event(Event::End(BytesEnd::new("results")))?;
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

/// Connection-scope failure: a single `<error>` inside `<results>`.
pub fn render_fatal(message: &str) -> String {
    render_results(&[ResponseItem::Error {
        attrs: Vec::new(),
        message: message.to_string(),
    }])
    .unwrap_or_else(|_| "<results><error>internal error</error></results>".to_string())
}

fn write_item(writer: &mut Writer<Vec<u8>>, item: &ResponseItem) -> Result<(), ProtocolError> {
    match item {
        ResponseItem::AccountCreated { id } => {
            let mut el = BytesStart::new("created");
            el.push_attribute(("id", id.as_str()));
            writer.write_event(Event::Empty(el))?;
        }
        ResponseItem::PositionCreated { sym, id } => {
            let mut el = BytesStart::new("created");
            el.push_attribute(("sym", sym.as_str()));
            el.push_attribute(("id", id.as_str()));
            writer.write_event(Event::Empty(el))?;
        }
        ResponseItem::Opened { sym, amount, limit, id } => {
            let mut el = BytesStart::new("opened");
            el.push_attribute(("sym", sym.as_str()));
            el.push_attribute(("amount", fmt_shares(*amount).as_str()));
            el.push_attribute(("limit", fmt_money(*limit).as_str()));
            el.push_attribute(("id", id.to_string().as_str()));
            writer.write_event(Event::Empty(el))?;
        }
        ResponseItem::Canceled { id, executions, leftover } => {
            let mut el = BytesStart::new("canceled");
            el.push_attribute(("id", id.to_string().as_str()));
            writer.write_event(Event::Start(el))?;
            for exec in executions {
                write_execution(writer, exec)?;
            }
            if let Some((shares, time)) = leftover {
                let mut part = BytesStart::new("canceled");
                part.push_attribute(("shares", fmt_shares(*shares).as_str()));
                part.push_attribute(("time", time.to_string().as_str()));
                writer.write_event(Event::Empty(part))?;
            }
            writer.write_event(Event::End(BytesEnd::new("canceled")))?;
        }
        ResponseItem::Status { id, status, open_shares, query_time, executions } => {
            let mut el = BytesStart::new("status");
            el.push_attribute(("id", id.to_string().as_str()));
            writer.write_event(Event::Start(el))?;
            if *open_shares > Decimal::ZERO {
                match status {
                    OrderStatus::Open => {
                        let mut open = BytesStart::new("open");
                        open.push_attribute(("shares", fmt_shares(*open_shares).as_str()));
                        writer.write_event(Event::Empty(open))?;
                    }
                    OrderStatus::Canceled => {
                        let mut canceled = BytesStart::new("canceled");
                        canceled.push_attribute(("shares", fmt_shares(*open_shares).as_str()));
                        canceled.push_attribute(("time", query_time.to_string().as_str()));
                        writer.write_event(Event::Empty(canceled))?;
                    }
                    OrderStatus::Executed => {}
                }
            }
            for exec in executions {
                write_execution(writer, exec)?;
            }
            writer.write_event(Event::End(BytesEnd::new("status")))?;
        }
        ResponseItem::Error { attrs, message } => {
            let mut el = BytesStart::new("error");
            for (key, value) in attrs {
                el.push_attribute((key.as_str(), value.as_str()));
            }
            writer.write_event(Event::Start(el))?;
            writer.write_event(Event::Text(BytesText::new(message)))?;
            writer.write_event(Event::End(BytesEnd::new("error")))?;
        }
    }
    Ok(())
}

fn write_execution(writer: &mut Writer<Vec<u8>>, exec: &Execution) -> Result<(), ProtocolError> {
    let mut el = BytesStart::new("executed");
    el.push_attribute(("shares", fmt_shares(exec.shares).as_str()));
    el.push_attribute(("price", fmt_money(exec.price).as_str()));
    el.push_attribute(("time", exec.exec_time.to_string().as_str()));
    writer.write_event(Event::Empty(el))?;
    Ok(())
}
