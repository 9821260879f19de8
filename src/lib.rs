//! Feed Sequencer - Market Data Resequencing and Book Reconstruction
//!
//! Turns an unreliable, possibly reordered datagram feed into a consistent
//! per-instrument order book:
//! - Bounded-window packet resequencing per channel
//! - Snapshot/incremental sequencing with gap recovery
//! - Price-level and order-level book caches with atomic updates
//! - Deterministic, caller-driven recovery timeouts
//! - Feed statistics and events

pub mod book;
pub mod config;
pub mod decoder;
pub mod error;
pub mod feed;
pub mod protocol;
pub mod reorder;
pub mod sequencer;
pub mod stats;
pub mod update;

pub use book::{BookCache, BookDepth, Layer, Level, MarketByOrder, MarketByPrice};
pub use config::{BookConfig, FeedConfig, OverflowPolicy, ReorderConfig, SequenceSource, SequencerConfig};
pub use decoder::{DecodeError, FragmentAssembler, FragmentError, HeaderDecoder};
pub use error::{BookError, ConfigError, FeedError, Result, SequencerError};
pub use feed::{FeedEvent, FeedHandler, InstrumentFeed, UpdateDecoder};
pub use protocol::{Channel, ObjectType, PacketHeader, HEADER_SIZE};
pub use reorder::{Dispatch, PacketHandler, ReorderBuffer, ResetReason};
pub use sequencer::{
    IncrementalChannelOnly, Outcome, SequenceInfo, Sequencer, SequencerHandler, SnapshotFilter, SyncState,
};
pub use stats::{FeedStats, LatencyStats};
pub use update::{
    BookUpdate, InstrumentKey, MarketByOrderUpdate, MarketByPriceUpdate, OrderLevel, PriceLevel, Side,
    UpdateAction, UpdateKind,
};
