//! Decoded book updates
//!
//! These are the shapes an external codec hands to the sequencer: one message
//! per instrument, carrying either price-level or order-level diffs.

use std::fmt;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Side::Bid),
            1 => Some(Side::Ask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateAction {
    #[default]
    Undefined,
    New,
    Change,
    Delete,
}

impl UpdateAction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(UpdateAction::Undefined),
            1 => Some(UpdateAction::New),
            2 => Some(UpdateAction::Change),
            3 => Some(UpdateAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateKind {
    #[default]
    Undefined,
    Snapshot,
    Incremental,
    Stale,
}

impl UpdateKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(UpdateKind::Undefined),
            1 => Some(UpdateKind::Snapshot),
            2 => Some(UpdateKind::Incremental),
            3 => Some(UpdateKind::Stale),
            _ => None,
        }
    }
}

/// (exchange, symbol); case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    pub exchange: String,
    pub symbol: String,
}

impl InstrumentKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        InstrumentKey {
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// One price level diff
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
    pub implied_quantity: Option<f64>,
    pub number_of_orders: Option<u32>,
    pub update_action: UpdateAction,
    /// Rank of the level within its side, 0 = best
    pub price_level: u32,
}

impl PriceLevel {
    pub fn new(price: f64, quantity: f64, update_action: UpdateAction) -> Self {
        PriceLevel {
            price,
            quantity,
            update_action,
            ..PriceLevel::default()
        }
    }
}

/// One order diff
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLevel {
    pub price: f64,
    pub quantity: f64,
    /// Time/price ranking token; lower ranks first within a price
    pub priority: u64,
    /// Unique per side
    pub order_id: String,
    pub side: Side,
    pub action: UpdateAction,
    pub reason: Option<u8>,
}

impl OrderLevel {
    pub fn new(
        side: Side,
        order_id: impl Into<String>,
        price: f64,
        quantity: f64,
        priority: u64,
        action: UpdateAction,
    ) -> Self {
        OrderLevel {
            price,
            quantity,
            priority,
            order_id: order_id.into(),
            side,
            action,
            reason: None,
        }
    }
}

/// Fields shared by every update message the sequencer handles
pub trait BookUpdate {
    fn instrument(&self) -> InstrumentKey;
    fn update_kind(&self) -> UpdateKind;
    fn exchange_sequence(&self) -> u64;
}

/// Price-level (L2) update
#[derive(Debug, Clone, PartialEq)]
pub struct MarketByPriceUpdate {
    pub exchange: String,
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub update_kind: UpdateKind,
    pub exchange_sequence: u64,
    pub exchange_time: Option<SystemTime>,
    pub local_time: Option<SystemTime>,
}

impl MarketByPriceUpdate {
    pub fn new(key: &InstrumentKey, update_kind: UpdateKind, exchange_sequence: u64) -> Self {
        MarketByPriceUpdate {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            bids: Vec::new(),
            asks: Vec::new(),
            update_kind,
            exchange_sequence,
            exchange_time: None,
            local_time: None,
        }
    }

    pub fn with_bid(mut self, price: f64, quantity: f64, action: UpdateAction) -> Self {
        self.bids.push(PriceLevel::new(price, quantity, action));
        self
    }

    pub fn with_ask(mut self, price: f64, quantity: f64, action: UpdateAction) -> Self {
        self.asks.push(PriceLevel::new(price, quantity, action));
        self
    }
}

impl BookUpdate for MarketByPriceUpdate {
    fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.exchange.as_str(), self.symbol.as_str())
    }

    fn update_kind(&self) -> UpdateKind {
        self.update_kind
    }

    fn exchange_sequence(&self) -> u64 {
        self.exchange_sequence
    }
}

/// Order-level (L3) update
#[derive(Debug, Clone, PartialEq)]
pub struct MarketByOrderUpdate {
    pub exchange: String,
    pub symbol: String,
    pub orders: Vec<OrderLevel>,
    pub update_kind: UpdateKind,
    pub exchange_sequence: u64,
    pub exchange_time: Option<SystemTime>,
    pub local_time: Option<SystemTime>,
}

impl MarketByOrderUpdate {
    pub fn new(key: &InstrumentKey, update_kind: UpdateKind, exchange_sequence: u64) -> Self {
        MarketByOrderUpdate {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            orders: Vec::new(),
            update_kind,
            exchange_sequence,
            exchange_time: None,
            local_time: None,
        }
    }

    pub fn with_order(mut self, order: OrderLevel) -> Self {
        self.orders.push(order);
        self
    }
}

impl BookUpdate for MarketByOrderUpdate {
    fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.exchange.as_str(), self.symbol.as_str())
    }

    fn update_kind(&self) -> UpdateKind {
        self.update_kind
    }

    fn exchange_sequence(&self) -> u64 {
        self.exchange_sequence
    }
}
