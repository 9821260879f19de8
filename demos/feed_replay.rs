//! Lossy feed replay
//!
//! Simulates a venue publishing price-level updates for a few instruments
//! over a transport that reorders and drops datagrams, and a consumer that
//! answers recovery requests with fresh snapshots. At the end each rebuilt
//! book is compared with the venue's own.
//!
//! Usage: feed_replay [updates] [loss_percent]
//! Run with `RUST_LOG=feed_sequencer=debug` to see the sequencers at work.

use std::env;
use std::io;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feed_sequencer::protocol::{price_from_fixed, price_to_fixed, CONTROL_INCREMENTAL};
use feed_sequencer::{
    BookCache, BookConfig, Channel, FeedConfig, FeedEvent, FeedHandler, HeaderDecoder, InstrumentKey, MarketByPrice,
    MarketByPriceUpdate, ObjectType, PacketHeader, PriceLevel, SequenceSource, UpdateAction, UpdateDecoder,
    UpdateKind, HEADER_SIZE,
};

const SYMBOLS: [&str; 3] = ["ESZ6", "NQZ6", "RTYZ6"];
const UPDATE_HEADER: usize = 12;
const LEVEL_SIZE: usize = 18;
const REORDER_SPAN: usize = 4;

fn symbol_key(index: usize) -> InstrumentKey {
    InstrumentKey::new("demo", SYMBOLS[index % SYMBOLS.len()])
}

/// Payload layout, big endian:
/// symbol index u8, kind u8, exchange_sequence u64, level_count u16,
/// then per level: side u8, action u8, price i64, quantity i64
struct DemoCodec;

impl UpdateDecoder for DemoCodec {
    type Update = MarketByPriceUpdate;
    type Error = io::Error;

    fn decode(
        &mut self,
        _header: &PacketHeader,
        payload: &[u8],
        out: &mut Vec<MarketByPriceUpdate>,
    ) -> Result<(), io::Error> {
        let truncated = || io::Error::new(io::ErrorKind::UnexpectedEof, "truncated update");
        if payload.len() < UPDATE_HEADER {
            return Err(truncated());
        }
        let count = BigEndian::read_u16(&payload[10..12]) as usize;
        if payload.len() < UPDATE_HEADER + count * LEVEL_SIZE {
            return Err(truncated());
        }

        let kind = UpdateKind::from_u8(payload[1]).unwrap_or_default();
        let sequence = BigEndian::read_u64(&payload[2..10]);
        let mut update = MarketByPriceUpdate::new(&symbol_key(payload[0] as usize), kind, sequence);
        for chunk in payload[UPDATE_HEADER..].chunks_exact(LEVEL_SIZE).take(count) {
            let level = PriceLevel::new(
                price_from_fixed(BigEndian::read_i64(&chunk[2..10])),
                price_from_fixed(BigEndian::read_i64(&chunk[10..18])),
                UpdateAction::from_u8(chunk[1]).unwrap_or_default(),
            );
            match chunk[0] {
                0 => update.bids.push(level),
                _ => update.asks.push(level),
            }
        }
        out.push(update);
        Ok(())
    }
}

fn encode(symbol: usize, update: &MarketByPriceUpdate) -> Vec<u8> {
    let levels = update.bids.len() + update.asks.len();
    let mut payload = vec![0u8; UPDATE_HEADER + levels * LEVEL_SIZE];
    payload[0] = symbol as u8;
    payload[1] = match update.update_kind {
        UpdateKind::Snapshot => 1,
        _ => 2,
    };
    BigEndian::write_u64(&mut payload[2..10], update.exchange_sequence);
    BigEndian::write_u16(&mut payload[10..12], levels as u16);

    let sides = update.bids.iter().map(|l| (0u8, l)).chain(update.asks.iter().map(|l| (1u8, l)));
    for ((side, level), chunk) in sides.zip(payload[UPDATE_HEADER..].chunks_exact_mut(LEVEL_SIZE)) {
        chunk[0] = side;
        chunk[1] = match level.update_action {
            UpdateAction::Delete => 3,
            UpdateAction::Change => 2,
            _ => 1,
        };
        BigEndian::write_i64(&mut chunk[2..10], price_to_fixed(level.price));
        BigEndian::write_i64(&mut chunk[10..18], price_to_fixed(level.quantity));
    }
    payload
}

/// Publishes updates and keeps the reference books
struct Venue {
    rng: StdRng,
    books: Vec<MarketByPrice>,
    exchange_sequence: Vec<u64>,
    packet_sequence: [u64; 2],
}

impl Venue {
    fn new(seed: u64) -> Self {
        let books = (0..SYMBOLS.len())
            .map(|i| MarketByPrice::new(symbol_key(i), BookConfig::default()))
            .collect();
        Venue {
            rng: StdRng::seed_from_u64(seed),
            books,
            exchange_sequence: vec![0; SYMBOLS.len()],
            packet_sequence: [0; 2],
        }
    }

    fn datagram(&mut self, channel: Channel, symbol: usize, update: &MarketByPriceUpdate) -> Vec<u8> {
        let lane = match channel {
            Channel::Snapshot => 0,
            Channel::Incremental => 1,
        };
        self.packet_sequence[lane] += 1;
        let header = PacketHeader {
            control: if lane == 1 { CONTROL_INCREMENTAL } else { 0 },
            object_type: ObjectType::MarketByPrice,
            session_id: 1,
            sequence_number: self.packet_sequence[lane],
            object_id: symbol as u64,
            last_sequence_number: update.exchange_sequence,
            ..PacketHeader::default()
        };
        let mut datagram = vec![0u8; HEADER_SIZE];
        // the buffer is always HEADER_SIZE long
        let _ = HeaderDecoder::encode(&header, &mut datagram);
        datagram.extend_from_slice(&encode(symbol, update));
        datagram
    }

    /// One random level change around a fixed mid of 100
    fn next_incremental(&mut self) -> Vec<u8> {
        let symbol = self.rng.gen_range(0..SYMBOLS.len());
        self.exchange_sequence[symbol] += 1;
        let mut update = MarketByPriceUpdate::new(
            &symbol_key(symbol),
            UpdateKind::Incremental,
            self.exchange_sequence[symbol],
        );

        let ticks = self.rng.gen_range(1..=10) as f64 * 0.25;
        let quantity = self.rng.gen_range(0..20) as f64;
        let action = if quantity == 0.0 {
            UpdateAction::Change
        } else {
            UpdateAction::New
        };
        update = if self.rng.gen_bool(0.5) {
            update.with_bid(100.0 - ticks, quantity, action)
        } else {
            update.with_ask(100.0 + ticks, quantity, action)
        };

        if let Err(err) = self.books[symbol].apply(&update) {
            warn!(%err, "venue rejected its own update");
        }
        self.datagram(Channel::Incremental, symbol, &update)
    }

    fn snapshot(&mut self, key: &InstrumentKey) -> Option<Vec<u8>> {
        let symbol = SYMBOLS.iter().position(|s| *s == key.symbol)?;
        let mut snapshot = self.books[symbol].snapshot();
        snapshot.exchange_sequence = self.exchange_sequence[symbol];
        Some(self.datagram(Channel::Snapshot, symbol, &snapshot))
    }
}

/// Reorders within a small span and drops a share of datagrams
struct Transport {
    rng: StdRng,
    in_flight: Vec<Vec<u8>>,
    loss: f64,
    dropped: usize,
}

impl Transport {
    fn send(&mut self, datagram: Vec<u8>) -> Option<Vec<u8>> {
        if self.rng.gen_bool(self.loss) {
            self.dropped += 1;
            return None;
        }
        self.in_flight.push(datagram);
        if self.in_flight.len() < REORDER_SPAN {
            return None;
        }
        let pick = self.rng.gen_range(0..self.in_flight.len());
        Some(self.in_flight.swap_remove(pick))
    }

    fn flush(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.in_flight)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let updates: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(20_000);
    let loss: f64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0.5);

    let config = FeedConfig::default()
        .with_depth(16)
        .with_sequence_source(SequenceSource::Exchange)
        .with_timeout(Duration::from_millis(50));
    let mut feed: FeedHandler<DemoCodec, MarketByPrice> = match FeedHandler::new(config, DemoCodec) {
        Ok(feed) => feed,
        Err(err) => {
            warn!(%err, "invalid configuration");
            return;
        }
    };

    let mut venue = Venue::new(7);
    let mut transport = Transport {
        rng: StdRng::seed_from_u64(11),
        in_flight: Vec::new(),
        loss: (loss / 100.0).clamp(0.0, 1.0),
        dropped: 0,
    };
    let start = Instant::now();
    let mut snapshots_sent = 0;

    info!(updates, loss_percent = loss, "replaying");
    for step in 0..updates {
        let now = start + Duration::from_millis(step as u64);
        let datagram = venue.next_incremental();
        if let Some(datagram) = transport.send(datagram) {
            if let Err(err) = feed.on_packet(&datagram, now) {
                warn!(%err, "bad datagram");
            }
        }
        if step % 10 == 0 {
            feed.poll(now);
        }

        // answer recovery requests on the snapshot channel
        let requests: Vec<InstrumentKey> = feed
            .drain_events()
            .filter_map(|event| match event {
                FeedEvent::RecoveryRequested { instrument, .. } => Some(instrument),
                _ => None,
            })
            .collect();
        for key in requests {
            if let Some(datagram) = venue.snapshot(&key) {
                snapshots_sent += 1;
                if let Err(err) = feed.on_packet(&datagram, now) {
                    warn!(%err, "bad snapshot datagram");
                }
            }
        }
    }

    let end = start + Duration::from_millis(updates as u64);
    for datagram in transport.flush() {
        let _ = feed.on_packet(&datagram, end);
    }
    let pending: Vec<InstrumentKey> = feed
        .instruments()
        .filter(|key| feed.state(key) != Some(feed_sequencer::SyncState::Synced))
        .cloned()
        .collect();
    for key in pending {
        if let Some(datagram) = venue.snapshot(&key) {
            snapshots_sent += 1;
            let _ = feed.on_packet(&datagram, end);
        }
    }

    feed.stats().log_summary();
    info!(dropped = transport.dropped, snapshots_sent, "transport");

    for (symbol, reference) in venue.books.iter().enumerate() {
        let key = symbol_key(symbol);
        let Some(instrument) = feed.instrument(&key) else {
            warn!(instrument = %key, "never seen by the consumer");
            continue;
        };
        // packets stuck behind a loss at the very end leave a book behind
        info!(
            instrument = %key,
            state = ?instrument.state(),
            applied_through = instrument.sequencer().last_sequence(),
            published = venue.exchange_sequence[symbol],
            matches = instrument.book().extract(10) == reference.extract(10),
            "\n{}",
            instrument.book()
        );
    }
}
