//! Order book caches
//!
//! Two books behind one trait: `MarketByPrice` keeps one entry per price
//! level, `MarketByOrder` keeps every resting order and derives levels by
//! aggregating the orders at each price. Prices are keyed in fixed point so
//! the `BTreeMap` ordering is exact.
//!
//! An update is all-or-nothing: if any diff in it fails, or the result would
//! leave the book inverted while inversion is disallowed, every change made
//! by that update is rolled back before the error is returned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::SystemTime;

use crate::config::BookConfig;
use crate::error::BookError;
use crate::protocol::{price_from_fixed, price_to_fixed};
use crate::update::{
    BookUpdate, InstrumentKey, MarketByOrderUpdate, MarketByPriceUpdate, OrderLevel, PriceLevel,
    Side, UpdateAction, UpdateKind,
};

/// Aggregated level as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub price: f64,
    pub quantity: f64,
    pub order_count: u32,
}

/// Best `n` levels per side, most aggressive first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookDepth {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// One row of a two-sided depth ladder; an absent side reads as zero
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Layer {
    pub bid_price: f64,
    pub bid_quantity: f64,
    pub ask_price: f64,
    pub ask_quantity: f64,
}

impl BookDepth {
    pub fn layers(&self) -> Vec<Layer> {
        let rows = self.bids.len().max(self.asks.len());
        (0..rows)
            .map(|i| {
                let mut layer = Layer::default();
                if let Some(bid) = self.bids.get(i) {
                    layer.bid_price = bid.price;
                    layer.bid_quantity = bid.quantity;
                }
                if let Some(ask) = self.asks.get(i) {
                    layer.ask_price = ask.price;
                    layer.ask_quantity = ask.quantity;
                }
                layer
            })
            .collect()
    }
}

/// Book state for one instrument
pub trait BookCache {
    type Update: BookUpdate + Clone;

    fn create(key: InstrumentKey, config: BookConfig) -> Self
    where
        Self: Sized;

    /// Apply a snapshot (replace) or incremental (diff) update.
    /// A stale update clears the book.
    fn apply(&mut self, update: &Self::Update) -> Result<(), BookError>;

    fn extract(&self, depth: usize) -> BookDepth;

    fn layers(&self, depth: usize) -> Vec<Layer> {
        self.extract(depth).layers()
    }

    fn clear(&mut self);

    /// Rebuild the full book as a snapshot message
    fn snapshot(&self) -> Self::Update;

    fn best_bid(&self) -> Option<Level>;

    fn best_ask(&self) -> Option<Level>;

    fn is_empty(&self) -> bool;

    /// Best ask minus best bid; `None` when a side is empty or the book is crossed
    fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid.price < ask.price => Some(ask.price - bid.price),
            _ => None,
        }
    }
}

fn fixed_price(price: f64) -> Result<i64, BookError> {
    if !price.is_finite() {
        return Err(BookError::InvalidPrice(price));
    }
    Ok(price_to_fixed(price))
}

fn check_inversion<B, A>(
    bids: &BTreeMap<i64, B>,
    asks: &BTreeMap<i64, A>,
    config: &BookConfig,
) -> Result<(), BookError> {
    if config.allow_inversion {
        return Ok(());
    }
    match (bids.keys().next_back(), asks.keys().next()) {
        (Some(&bid), Some(&ask)) if bid >= ask => Err(BookError::Inverted {
            bid: price_from_fixed(bid),
            ask: price_from_fixed(ask),
        }),
        _ => Ok(()),
    }
}

fn best_n<V, F>(levels: &BTreeMap<i64, V>, side: Side, n: usize, to_level: F) -> Vec<Level>
where
    F: Fn(i64, &V) -> Level,
{
    match side {
        Side::Bid => levels.iter().rev().take(n).map(|(&p, v)| to_level(p, v)).collect(),
        Side::Ask => levels.iter().take(n).map(|(&p, v)| to_level(p, v)).collect(),
    }
}

fn write_ladder(f: &mut fmt::Formatter<'_>, depth: &BookDepth) -> fmt::Result {
    for layer in depth.layers() {
        writeln!(
            f,
            "  {:>14.8} {:>14.8} | {:<14.8} {:<14.8}",
            layer.bid_quantity, layer.bid_price, layer.ask_price, layer.ask_quantity
        )?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    quantity: f64,
    implied_quantity: Option<f64>,
    number_of_orders: Option<u32>,
}

/// Price-level book
#[derive(Debug, Clone)]
pub struct MarketByPrice {
    key: InstrumentKey,
    config: BookConfig,
    bids: BTreeMap<i64, Entry>,
    asks: BTreeMap<i64, Entry>,
    exchange_sequence: u64,
    exchange_time: Option<SystemTime>,
}

type PriceUndo = Vec<(Side, i64, Option<Entry>)>;

impl MarketByPrice {
    pub fn new(key: InstrumentKey, config: BookConfig) -> Self {
        MarketByPrice {
            key,
            config,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            exchange_sequence: 0,
            exchange_time: None,
        }
    }

    pub fn key(&self) -> &InstrumentKey {
        &self.key
    }

    /// Exchange sequence of the last update applied
    pub fn exchange_sequence(&self) -> u64 {
        self.exchange_sequence
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    fn levels_mut(&mut self, side: Side) -> &mut BTreeMap<i64, Entry> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn apply_level(&mut self, side: Side, level: &PriceLevel, undo: &mut PriceUndo) -> Result<(), BookError> {
        let price = fixed_price(level.price)?;
        let levels = self.levels_mut(side);
        let previous = match level.update_action {
            UpdateAction::Delete => match levels.remove(&price) {
                Some(previous) => Some(previous),
                None => {
                    return Err(BookError::LevelNotFound {
                        side,
                        price: level.price,
                    })
                }
            },
            UpdateAction::New | UpdateAction::Change | UpdateAction::Undefined => {
                if level.quantity > 0.0 {
                    levels.insert(
                        price,
                        Entry {
                            quantity: level.quantity,
                            implied_quantity: level.implied_quantity,
                            number_of_orders: level.number_of_orders,
                        },
                    )
                } else {
                    levels.remove(&price)
                }
            }
        };
        undo.push((side, price, previous));
        Ok(())
    }

    fn rollback(&mut self, undo: PriceUndo) {
        for (side, price, previous) in undo.into_iter().rev() {
            let levels = self.levels_mut(side);
            match previous {
                Some(entry) => {
                    levels.insert(price, entry);
                }
                None => {
                    levels.remove(&price);
                }
            }
        }
    }

    fn apply_diffs(&mut self, update: &MarketByPriceUpdate, undo: &mut PriceUndo) -> Result<(), BookError> {
        for level in &update.bids {
            self.apply_level(Side::Bid, level, undo)?;
        }
        for level in &update.asks {
            self.apply_level(Side::Ask, level, undo)?;
        }
        check_inversion(&self.bids, &self.asks, &self.config)
    }

    fn apply_incremental(&mut self, update: &MarketByPriceUpdate) -> Result<(), BookError> {
        let mut undo = PriceUndo::new();
        let result = self.apply_diffs(update, &mut undo);
        if result.is_err() {
            self.rollback(undo);
        }
        result
    }

    fn replace(&mut self, update: &MarketByPriceUpdate) -> Result<(), BookError> {
        let mut fresh = MarketByPrice::new(self.key.clone(), self.config);
        let mut undo = PriceUndo::new();
        for level in update.bids.iter().filter(|l| l.update_action != UpdateAction::Delete) {
            fresh.apply_level(Side::Bid, level, &mut undo)?;
        }
        for level in update.asks.iter().filter(|l| l.update_action != UpdateAction::Delete) {
            fresh.apply_level(Side::Ask, level, &mut undo)?;
        }
        check_inversion(&fresh.bids, &fresh.asks, &self.config)?;
        self.bids = fresh.bids;
        self.asks = fresh.asks;
        Ok(())
    }

    fn to_level(price: i64, entry: &Entry) -> Level {
        Level {
            price: price_from_fixed(price),
            quantity: entry.quantity,
            order_count: entry.number_of_orders.unwrap_or(0),
        }
    }

    fn to_price_levels<'a>(iter: impl Iterator<Item = (&'a i64, &'a Entry)>) -> Vec<PriceLevel> {
        iter.enumerate()
            .map(|(rank, (&price, entry))| PriceLevel {
                price: price_from_fixed(price),
                quantity: entry.quantity,
                implied_quantity: entry.implied_quantity,
                number_of_orders: entry.number_of_orders,
                update_action: UpdateAction::New,
                price_level: rank as u32,
            })
            .collect()
    }
}

impl BookCache for MarketByPrice {
    type Update = MarketByPriceUpdate;

    fn create(key: InstrumentKey, config: BookConfig) -> Self {
        MarketByPrice::new(key, config)
    }

    fn apply(&mut self, update: &MarketByPriceUpdate) -> Result<(), BookError> {
        match update.update_kind {
            UpdateKind::Snapshot => self.replace(update)?,
            UpdateKind::Stale => {
                self.clear();
                return Ok(());
            }
            UpdateKind::Incremental | UpdateKind::Undefined => self.apply_incremental(update)?,
        }
        self.exchange_sequence = update.exchange_sequence;
        self.exchange_time = update.exchange_time;
        Ok(())
    }

    fn extract(&self, depth: usize) -> BookDepth {
        BookDepth {
            bids: best_n(&self.bids, Side::Bid, depth, Self::to_level),
            asks: best_n(&self.asks, Side::Ask, depth, Self::to_level),
        }
    }

    fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    fn snapshot(&self) -> MarketByPriceUpdate {
        let mut update = MarketByPriceUpdate::new(&self.key, UpdateKind::Snapshot, self.exchange_sequence);
        update.bids = Self::to_price_levels(self.bids.iter().rev());
        update.asks = Self::to_price_levels(self.asks.iter());
        update.exchange_time = self.exchange_time;
        update
    }

    fn best_bid(&self) -> Option<Level> {
        self.bids.iter().next_back().map(|(&p, e)| Self::to_level(p, e))
    }

    fn best_ask(&self) -> Option<Level> {
        self.asks.iter().next().map(|(&p, e)| Self::to_level(p, e))
    }

    fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl fmt::Display for MarketByPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} seq={} bids={} asks={}",
            self.key,
            self.exchange_sequence,
            self.bids.len(),
            self.asks.len()
        )?;
        write_ladder(f, &self.extract(usize::MAX))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Order {
    price: i64,
    quantity: f64,
    priority: u64,
    reason: Option<u8>,
}

/// Orders resting at one price, in priority order
#[derive(Debug, Clone, Default)]
struct Queue {
    /// Sum of the resting quantities, fixed point so it never drifts
    quantity: i64,
    orders: BTreeSet<(u64, String)>,
}

/// Order-level book
#[derive(Debug, Clone)]
pub struct MarketByOrder {
    key: InstrumentKey,
    config: BookConfig,
    orders: HashMap<(Side, String), Order>,
    bids: BTreeMap<i64, Queue>,
    asks: BTreeMap<i64, Queue>,
    exchange_sequence: u64,
    exchange_time: Option<SystemTime>,
}

type OrderUndo = Vec<(Side, String, Option<Order>)>;

impl MarketByOrder {
    pub fn new(key: InstrumentKey, config: BookConfig) -> Self {
        MarketByOrder {
            key,
            config,
            orders: HashMap::new(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            exchange_sequence: 0,
            exchange_time: None,
        }
    }

    pub fn key(&self) -> &InstrumentKey {
        &self.key
    }

    pub fn exchange_sequence(&self) -> u64 {
        self.exchange_sequence
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Order ids resting at `price`, in priority order
    pub fn queue(&self, side: Side, price: f64) -> Vec<&str> {
        let levels = match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        };
        levels
            .get(&price_to_fixed(price))
            .map(|queue| queue.orders.iter().map(|(_, id)| id.as_str()).collect())
            .unwrap_or_default()
    }

    fn levels_mut(&mut self, side: Side) -> &mut BTreeMap<i64, Queue> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn insert_order(&mut self, side: Side, order_id: String, order: Order) {
        let queue = self.levels_mut(side).entry(order.price).or_default();
        queue.quantity += price_to_fixed(order.quantity);
        queue.orders.insert((order.priority, order_id.clone()));
        self.orders.insert((side, order_id), order);
    }

    fn remove_order(&mut self, side: Side, order_id: &str) -> Option<Order> {
        let order = self.orders.remove(&(side, order_id.to_string()))?;
        let levels = self.levels_mut(side);
        if let Some(queue) = levels.get_mut(&order.price) {
            queue.orders.remove(&(order.priority, order_id.to_string()));
            queue.quantity -= price_to_fixed(order.quantity);
            if queue.orders.is_empty() {
                levels.remove(&order.price);
            }
        }
        Some(order)
    }

    fn apply_order(&mut self, level: &OrderLevel, undo: &mut OrderUndo) -> Result<(), BookError> {
        let side = level.side;
        let price = fixed_price(level.price)?;
        let replacement = Order {
            price,
            quantity: level.quantity,
            priority: level.priority,
            reason: level.reason,
        };

        match level.action {
            UpdateAction::New => {
                if self.orders.contains_key(&(side, level.order_id.clone())) {
                    return Err(BookError::DuplicateOrder {
                        side,
                        order_id: level.order_id.clone(),
                    });
                }
                self.insert_order(side, level.order_id.clone(), replacement);
                undo.push((side, level.order_id.clone(), None));
            }
            UpdateAction::Change | UpdateAction::Delete => {
                let previous = self.remove_order(side, &level.order_id).ok_or_else(|| {
                    BookError::OrderNotFound {
                        side,
                        order_id: level.order_id.clone(),
                    }
                })?;
                undo.push((side, level.order_id.clone(), Some(previous)));
                if level.action == UpdateAction::Change && level.quantity > 0.0 {
                    self.insert_order(side, level.order_id.clone(), replacement);
                }
            }
            UpdateAction::Undefined => {
                let previous = self.remove_order(side, &level.order_id);
                undo.push((side, level.order_id.clone(), previous));
                if level.quantity > 0.0 {
                    self.insert_order(side, level.order_id.clone(), replacement);
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self, undo: OrderUndo) {
        for (side, order_id, previous) in undo.into_iter().rev() {
            self.remove_order(side, &order_id);
            if let Some(order) = previous {
                self.insert_order(side, order_id, order);
            }
        }
    }

    fn apply_diffs(&mut self, update: &MarketByOrderUpdate, undo: &mut OrderUndo) -> Result<(), BookError> {
        for level in &update.orders {
            self.apply_order(level, undo)?;
        }
        check_inversion(&self.bids, &self.asks, &self.config)
    }

    fn apply_incremental(&mut self, update: &MarketByOrderUpdate) -> Result<(), BookError> {
        let mut undo = OrderUndo::new();
        let result = self.apply_diffs(update, &mut undo);
        if result.is_err() {
            self.rollback(undo);
        }
        result
    }

    fn replace(&mut self, update: &MarketByOrderUpdate) -> Result<(), BookError> {
        let mut fresh = MarketByOrder::new(self.key.clone(), self.config);
        let mut undo = OrderUndo::new();
        for order in update.orders.iter().filter(|o| o.action != UpdateAction::Delete) {
            let order = OrderLevel {
                action: UpdateAction::New,
                ..order.clone()
            };
            if order.quantity > 0.0 {
                fresh.apply_order(&order, &mut undo)?;
            }
        }
        check_inversion(&fresh.bids, &fresh.asks, &self.config)?;
        self.orders = fresh.orders;
        self.bids = fresh.bids;
        self.asks = fresh.asks;
        Ok(())
    }

    fn to_level(price: i64, queue: &Queue) -> Level {
        Level {
            price: price_from_fixed(price),
            quantity: price_from_fixed(queue.quantity),
            order_count: queue.orders.len() as u32,
        }
    }

    fn side_orders<'a>(
        &'a self,
        side: Side,
        levels: impl Iterator<Item = (&'a i64, &'a Queue)> + 'a,
    ) -> impl Iterator<Item = OrderLevel> + 'a {
        levels.flat_map(move |(&price, queue)| {
            queue.orders.iter().filter_map(move |(_, order_id)| {
                let order = self.orders.get(&(side, order_id.clone()))?;
                Some(OrderLevel {
                    price: price_from_fixed(price),
                    quantity: order.quantity,
                    priority: order.priority,
                    order_id: order_id.clone(),
                    side,
                    action: UpdateAction::New,
                    reason: order.reason,
                })
            })
        })
    }
}

impl BookCache for MarketByOrder {
    type Update = MarketByOrderUpdate;

    fn create(key: InstrumentKey, config: BookConfig) -> Self {
        MarketByOrder::new(key, config)
    }

    fn apply(&mut self, update: &MarketByOrderUpdate) -> Result<(), BookError> {
        match update.update_kind {
            UpdateKind::Snapshot => self.replace(update)?,
            UpdateKind::Stale => {
                self.clear();
                return Ok(());
            }
            UpdateKind::Incremental | UpdateKind::Undefined => self.apply_incremental(update)?,
        }
        self.exchange_sequence = update.exchange_sequence;
        self.exchange_time = update.exchange_time;
        Ok(())
    }

    fn extract(&self, depth: usize) -> BookDepth {
        BookDepth {
            bids: best_n(&self.bids, Side::Bid, depth, Self::to_level),
            asks: best_n(&self.asks, Side::Ask, depth, Self::to_level),
        }
    }

    fn clear(&mut self) {
        self.orders.clear();
        self.bids.clear();
        self.asks.clear();
    }

    fn snapshot(&self) -> MarketByOrderUpdate {
        let mut update = MarketByOrderUpdate::new(&self.key, UpdateKind::Snapshot, self.exchange_sequence);
        update.orders = self
            .side_orders(Side::Bid, self.bids.iter().rev())
            .chain(self.side_orders(Side::Ask, self.asks.iter()))
            .collect();
        update.exchange_time = self.exchange_time;
        update
    }

    fn best_bid(&self) -> Option<Level> {
        self.bids.iter().next_back().map(|(&p, q)| Self::to_level(p, q))
    }

    fn best_ask(&self) -> Option<Level> {
        self.asks.iter().next().map(|(&p, q)| Self::to_level(p, q))
    }

    fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

impl fmt::Display for MarketByOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} seq={} orders={} bids={} asks={}",
            self.key,
            self.exchange_sequence,
            self.orders.len(),
            self.bids.len(),
            self.asks.len()
        )?;
        write_ladder(f, &self.extract(usize::MAX))
    }
}
