//! Feed wiring
//!
//! `FeedHandler` owns the whole path for one feed: header decode, one reorder
//! window per channel, fragment reassembly, the payload codec, and one
//! `InstrumentFeed` (sequencer plus book) per instrument seen on the wire.
//! Everything the caller may want to react to is queued as a `FeedEvent`.

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error as StdError;
use std::time::Instant;

use tracing::{debug, debug_span, info, warn};

use crate::book::BookCache;
use crate::config::{FeedConfig, OverflowPolicy, SequenceSource};
use crate::decoder::{FragmentAssembler, HeaderDecoder};
use crate::error::{BookError, ConfigError, FeedError};
use crate::protocol::{Channel, PacketHeader};
use crate::reorder::{Dispatch, PacketHandler, ReorderBuffer, ResetReason};
use crate::sequencer::{Outcome, SequenceInfo, Sequencer, SequencerHandler, SyncState};
use crate::stats::FeedStats;
use crate::update::{BookUpdate, InstrumentKey, UpdateKind};

/// Payload codec: turns one reassembled message into book updates.
pub trait UpdateDecoder {
    type Update: BookUpdate;
    type Error: StdError;

    /// Append the updates carried by `payload` to `out`.
    fn decode(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        out: &mut Vec<Self::Update>,
    ) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Fetch a new snapshot for the instrument out-of-band
    RecoveryRequested { instrument: InstrumentKey, retries: u32 },
    /// A snapshot was applied
    Synced { instrument: InstrumentKey, sequence: u64 },
    /// The book was cleared and waits for a new snapshot
    Stale { instrument: InstrumentKey },
    /// The recovery buffer overflowed
    Overflow { instrument: InstrumentKey, policy: OverflowPolicy },
    /// A reorder window gave up on its session
    Reset { channel: Channel, reason: ResetReason },
    /// An update was rejected by the book and rolled back
    BookAnomaly { instrument: InstrumentKey, error: BookError },
    /// Payload could not be reassembled, decoded or sequenced; nothing in it
    /// reached a book
    DecodeFailed { channel: Channel, sequence: u64, error: FeedError },
}

/// Applies sequencer callbacks to a book and reports what happened.
struct Applier<'a, B> {
    key: &'a InstrumentKey,
    book: &'a mut B,
    events: &'a mut Vec<FeedEvent>,
}

impl<B: BookCache> Applier<'_, B> {
    fn anomaly(&mut self, error: &BookError) {
        warn!(instrument = %self.key, %error, "book anomaly");
        self.events.push(FeedEvent::BookAnomaly {
            instrument: self.key.clone(),
            error: error.clone(),
        });
    }
}

impl<B: BookCache> SequencerHandler<B::Update> for Applier<'_, B> {
    fn apply_update(&mut self, update: &B::Update) -> Result<(), BookError> {
        let result = self.book.apply(update);
        if let Err(error) = &result {
            self.anomaly(error);
        }
        result
    }

    fn apply_snapshot(&mut self, snapshot: &B::Update, sequence: u64) -> Result<(), BookError> {
        if let Err(error) = self.book.apply(snapshot) {
            self.anomaly(&error);
            return Err(error);
        }
        self.events.push(FeedEvent::Synced {
            instrument: self.key.clone(),
            sequence,
        });
        Ok(())
    }

    fn request_recovery(&mut self, retries: u32) {
        self.events.push(FeedEvent::RecoveryRequested {
            instrument: self.key.clone(),
            retries,
        });
    }

    fn clear(&mut self) {
        self.book.clear();
        self.events.push(FeedEvent::Stale {
            instrument: self.key.clone(),
        });
    }
}

/// Sequencer and book for one instrument.
///
/// Usable on its own when the caller already has decoded updates and their
/// sequence numbers; `FeedHandler` keeps one per instrument.
pub struct InstrumentFeed<B: BookCache> {
    key: InstrumentKey,
    sequencer: Sequencer<B::Update>,
    book: B,
    events: Vec<FeedEvent>,
}

impl<B: BookCache> InstrumentFeed<B> {
    pub fn new(key: InstrumentKey, config: &FeedConfig) -> Result<Self, ConfigError> {
        let sequencer = Sequencer::with_config(config.sequencer.clone())?;
        let book = B::create(key.clone(), config.book);
        Ok(InstrumentFeed {
            key,
            sequencer,
            book,
            events: Vec::new(),
        })
    }

    pub fn apply(
        &mut self,
        update: B::Update,
        info: SequenceInfo,
        now: Instant,
    ) -> crate::error::Result<Outcome> {
        let _span = debug_span!("instrument", key = %self.key).entered();
        let mut applier = Applier {
            key: &self.key,
            book: &mut self.book,
            events: &mut self.events,
        };
        let outcome = self.sequencer.apply(update, info, now, &mut applier)?;
        if let Outcome::Overflow { policy } = outcome {
            self.events.push(FeedEvent::Overflow {
                instrument: self.key.clone(),
                policy,
            });
        }
        Ok(outcome)
    }

    /// Drive the recovery timeout; returns the retry count when recovery was re-requested.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        let mut applier = Applier {
            key: &self.key,
            book: &mut self.book,
            events: &mut self.events,
        };
        self.sequencer.poll(now, &mut applier)
    }

    /// Clear the book and wait for a new snapshot
    pub fn reset(&mut self) {
        let mut applier = Applier {
            key: &self.key,
            book: &mut self.book,
            events: &mut self.events,
        };
        self.sequencer.reset(&mut applier);
    }

    pub fn key(&self) -> &InstrumentKey {
        &self.key
    }

    pub fn book(&self) -> &B {
        &self.book
    }

    pub fn sequencer(&self) -> &Sequencer<B::Update> {
        &self.sequencer
    }

    pub fn state(&self) -> SyncState {
        self.sequencer.state()
    }

    pub fn drain_events(&mut self) -> std::vec::Drain<'_, FeedEvent> {
        self.events.drain(..)
    }
}

fn sequence_info<U: BookUpdate>(header: &PacketHeader, update: &U, source: SequenceSource) -> SequenceInfo {
    let sequence = match source {
        SequenceSource::Exchange => update.exchange_sequence(),
        SequenceSource::Packet if update.update_kind() == UpdateKind::Snapshot => {
            header.last_sequence_number
        }
        SequenceSource::Packet => header.sequence_number,
    };
    SequenceInfo::new(sequence, header.channel())
}

#[derive(Debug)]
struct Lane {
    reorder: ReorderBuffer,
    assembler: FragmentAssembler,
    session: Option<u64>,
}

impl Lane {
    fn new(config: &FeedConfig) -> Result<Self, ConfigError> {
        Ok(Lane {
            reorder: ReorderBuffer::new(config.reorder.clone())?,
            // a reassembled message may span the whole window
            assembler: FragmentAssembler::new(config.reorder.depth.saturating_mul(config.reorder.max_packet_size)),
            session: None,
        })
    }
}

/// First instrument carried by more than one update
fn repeated_instrument<U: BookUpdate>(updates: &[U]) -> Option<InstrumentKey> {
    let mut seen = BTreeSet::new();
    updates
        .iter()
        .map(BookUpdate::instrument)
        .find(|key| !seen.insert(key.clone()))
}

/// Everything the router touches besides the fragment assembler.
struct Sink<'a, D: UpdateDecoder, B: BookCache> {
    channel: Channel,
    now: Instant,
    config: &'a FeedConfig,
    decoder: &'a mut D,
    scratch: &'a mut Vec<D::Update>,
    instruments: &'a mut BTreeMap<InstrumentKey, InstrumentFeed<B>>,
    stats: &'a mut FeedStats,
    events: &'a mut Vec<FeedEvent>,
}

impl<D, B> Sink<'_, D, B>
where
    D: UpdateDecoder<Update = B::Update>,
    B: BookCache,
{
    fn push(&mut self, event: FeedEvent) {
        self.stats.record_event(&event);
        self.events.push(event);
    }

    fn fail(&mut self, sequence: u64, error: FeedError) {
        warn!(channel = ?self.channel, sequence, %error, "message dropped");
        self.push(FeedEvent::DecodeFailed {
            channel: self.channel,
            sequence,
            error,
        });
    }

    fn deliver(&mut self, header: &PacketHeader, message: &[u8]) {
        self.scratch.clear();
        if let Err(err) = self.decoder.decode(header, message, self.scratch) {
            self.fail(header.sequence_number, FeedError::Payload(err.to_string()));
            return;
        }

        // one packet sequence cannot order two diffs for the same book; the
        // instrument's sequencer sees the dropped message as a gap
        if self.config.sequencer.source == SequenceSource::Packet {
            if let Some(instrument) = repeated_instrument(&self.scratch[..]) {
                let sequence = header.sequence_number;
                self.fail(sequence, FeedError::SharedSequence { instrument, sequence });
                return;
            }
        }

        let mut updates = std::mem::take(self.scratch);
        for update in updates.drain(..) {
            self.route(header, update);
        }
        *self.scratch = updates;
    }

    fn route(&mut self, header: &PacketHeader, update: D::Update) {
        let key = update.instrument();
        if !self.instruments.contains_key(&key) {
            match InstrumentFeed::new(key.clone(), self.config) {
                Ok(feed) => {
                    info!(instrument = %key, "tracking new instrument");
                    self.instruments.insert(key.clone(), feed);
                }
                Err(err) => {
                    warn!(instrument = %key, %err, "cannot track instrument");
                    return;
                }
            }
        }
        let Some(feed) = self.instruments.get_mut(&key) else {
            return;
        };

        let info = sequence_info(header, &update, self.config.sequencer.source);
        let started = Instant::now();
        let result = feed.apply(update, info, self.now);
        self.stats.record_apply_latency(started.elapsed());

        for event in feed.events.drain(..) {
            self.stats.record_event(&event);
            self.events.push(event);
        }
        match result {
            Ok(outcome) => self.stats.record_outcome(outcome),
            Err(err) => self.fail(info.sequence, err),
        }
    }

    /// A new session on the incremental channel restarts packet sequence
    /// numbers, so sequencers keyed on them must start over too.
    fn rollover(&mut self) {
        if self.channel != Channel::Incremental || self.config.sequencer.source != SequenceSource::Packet {
            return;
        }
        for feed in self.instruments.values_mut() {
            feed.reset();
            for event in feed.events.drain(..) {
                self.stats.record_event(&event);
                self.events.push(event);
            }
        }
    }
}

/// `PacketHandler` for one channel's reorder window.
struct Router<'a, D: UpdateDecoder, B: BookCache> {
    assembler: &'a mut FragmentAssembler,
    sink: Sink<'a, D, B>,
}

impl<D, B> PacketHandler for Router<'_, D, B>
where
    D: UpdateDecoder<Update = B::Update>,
    B: BookCache,
{
    fn initial_sequence(&mut self, first: u64) -> u64 {
        debug!(channel = ?self.sink.channel, first, "channel session started");
        first
    }

    fn parse(&mut self, sequence: u64, datagram: &[u8]) {
        let (header, payload) = match HeaderDecoder::decode(datagram) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.sink.fail(sequence, err.into());
                return;
            }
        };

        let sink = &mut self.sink;
        let pushed = self
            .assembler
            .push(&header, payload, |message| sink.deliver(&header, message));
        if let Err(err) = pushed {
            self.sink.fail(sequence, err.into());
        }
    }

    fn reset(&mut self, reason: ResetReason) {
        self.assembler.clear();
        self.sink.push(FeedEvent::Reset {
            channel: self.sink.channel,
            reason,
        });
        if let ResetReason::SessionRollover { .. } = reason {
            self.sink.rollover();
        }
    }
}

/// Full packet-to-book pipeline for one feed
pub struct FeedHandler<D: UpdateDecoder, B: BookCache> {
    config: FeedConfig,
    decoder: D,
    snapshot: Lane,
    incremental: Lane,
    instruments: BTreeMap<InstrumentKey, InstrumentFeed<B>>,
    scratch: Vec<D::Update>,
    stats: FeedStats,
    events: Vec<FeedEvent>,
}

impl<D, B> FeedHandler<D, B>
where
    D: UpdateDecoder<Update = B::Update>,
    B: BookCache,
{
    pub fn new(config: FeedConfig, decoder: D) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(FeedHandler {
            snapshot: Lane::new(&config)?,
            incremental: Lane::new(&config)?,
            config,
            decoder,
            instruments: BTreeMap::new(),
            scratch: Vec::new(),
            stats: FeedStats::new(),
            events: Vec::new(),
        })
    }

    /// Process one datagram. Only a malformed header is an error; everything
    /// downstream of the reorder window is reported through events.
    pub fn on_packet(&mut self, datagram: &[u8], now: Instant) -> Result<Dispatch, FeedError> {
        let (header, _) = HeaderDecoder::decode(datagram)?;
        self.stats.record_packet(datagram.len());

        let channel = header.channel();
        let lane = match channel {
            Channel::Snapshot => &mut self.snapshot,
            Channel::Incremental => &mut self.incremental,
        };
        let mut router = Router {
            assembler: &mut lane.assembler,
            sink: Sink {
                channel,
                now,
                config: &self.config,
                decoder: &mut self.decoder,
                scratch: &mut self.scratch,
                instruments: &mut self.instruments,
                stats: &mut self.stats,
                events: &mut self.events,
            },
        };

        if let Some(from) = lane.session {
            if from != header.session_id {
                let reason = ResetReason::SessionRollover {
                    from,
                    to: header.session_id,
                };
                warn!(?channel, ?reason, "session rollover");
                lane.reorder.reset();
                router.reset(reason);
            }
        }
        lane.session = Some(header.session_id);

        let dispatch = lane.reorder.dispatch(header.sequence_number, datagram, &mut router);
        self.stats.record_dispatch(dispatch);
        Ok(dispatch)
    }

    /// Drive every instrument's recovery timeout
    pub fn poll(&mut self, now: Instant) {
        for feed in self.instruments.values_mut() {
            feed.poll(now);
            for event in feed.events.drain(..) {
                self.stats.record_event(&event);
                self.events.push(event);
            }
        }
    }

    pub fn book(&self, key: &InstrumentKey) -> Option<&B> {
        self.instruments.get(key).map(InstrumentFeed::book)
    }

    pub fn state(&self, key: &InstrumentKey) -> Option<SyncState> {
        self.instruments.get(key).map(InstrumentFeed::state)
    }

    pub fn instrument(&self, key: &InstrumentKey) -> Option<&InstrumentFeed<B>> {
        self.instruments.get(key)
    }

    /// Instruments seen so far, in key order
    pub fn instruments(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.instruments.keys()
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn drain_events(&mut self) -> std::vec::Drain<'_, FeedEvent> {
        self.events.drain(..)
    }
}
