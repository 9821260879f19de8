//! Configuration values.
//!
//! Everything is validated once, when the component using it is built.

use crate::error::ConfigError;
use std::time::Duration;

/// Reorder window for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderConfig {
    /// Number of packets that may be held while waiting for a missing one.
    pub depth: usize,
    /// Largest payload that can be buffered, in bytes.
    pub max_packet_size: usize,
    /// Lowest legal sequence number of the session.
    pub min_sequence: u64,
    /// Highest legal sequence number of the session.
    pub max_sequence: u64,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        ReorderConfig {
            depth: 64,
            max_packet_size: 1472,
            min_sequence: 1,
            max_sequence: u64::MAX,
        }
    }
}

impl ReorderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::ZeroPacketSize);
        }
        if self.max_sequence < self.min_sequence {
            return Err(ConfigError::InvertedBounds {
                min: self.min_sequence,
                max: self.max_sequence,
            });
        }
        Ok(())
    }
}

/// What to do when the recovery buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered update and keep waiting for the snapshot.
    #[default]
    DropOldest,
    /// Drop everything, clear the book and fall back to unsynced.
    HardReset,
}

/// Where the sequencer reads sequence numbers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceSource {
    /// Packet header: `sequence_number` for incrementals, `last_sequence_number`
    /// for snapshots. Suits channels carrying a single instrument.
    #[default]
    Packet,
    /// The update's own `exchange_sequence`, for channels multiplexing
    /// several instruments.
    Exchange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    /// How long to wait for a snapshot before asking again.
    pub timeout: Duration,
    /// Incrementals held while recovery is outstanding.
    pub max_updates: usize,
    pub overflow: OverflowPolicy,
    pub source: SequenceSource,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        SequencerConfig {
            timeout: Duration::from_secs(1),
            max_updates: 1024,
            overflow: OverflowPolicy::default(),
            source: SequenceSource::default(),
        }
    }
}

impl SequencerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_updates == 0 {
            return Err(ConfigError::ZeroMaxUpdates);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BookConfig {
    /// Accept a crossed or locked book instead of rejecting the update.
    pub allow_inversion: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedConfig {
    pub reorder: ReorderConfig,
    pub sequencer: SequencerConfig,
    pub book: BookConfig,
}

impl FeedConfig {
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.reorder.depth = depth;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.reorder.max_packet_size = size;
        self
    }

    pub fn with_sequence_bounds(mut self, min: u64, max: u64) -> Self {
        self.reorder.min_sequence = min;
        self.reorder.max_sequence = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.sequencer.timeout = timeout;
        self
    }

    pub fn with_max_updates(mut self, max_updates: usize) -> Self {
        self.sequencer.max_updates = max_updates;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.sequencer.overflow = overflow;
        self
    }

    pub fn with_sequence_source(mut self, source: SequenceSource) -> Self {
        self.sequencer.source = source;
        self
    }

    pub fn with_inversion(mut self, allow: bool) -> Self {
        self.book.allow_inversion = allow;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reorder.validate()?;
        self.sequencer.validate()
    }
}
