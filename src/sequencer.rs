//! Snapshot/incremental sequencer
//!
//! Gates decoded updates for one instrument so the book only ever sees a
//! gap-free run of diffs on top of a snapshot. Gaps park incoming
//! incrementals and ask the consumer for a new snapshot; when it arrives the
//! parked updates are replayed through the normal incremental path.
//!
//! Nothing here reads a clock. Recovery timeouts are driven by the caller
//! through [`Sequencer::poll`].

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::{OverflowPolicy, SequencerConfig};
use crate::error::{BookError, ConfigError, SequencerError};
use crate::protocol::Channel;
use crate::update::{BookUpdate, UpdateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No usable baseline; waiting for any snapshot.
    Unsynced,
    /// Applying incrementals as they arrive.
    Synced,
    /// Gap detected; incrementals are parked until a snapshot arrives.
    AwaitingRecovery,
}

/// Transport facts the sequencer needs alongside an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceInfo {
    /// Incremental: its own sequence number. Snapshot: the trailing sequence it covers.
    pub sequence: u64,
    pub channel: Channel,
}

impl SequenceInfo {
    pub fn new(sequence: u64, channel: Channel) -> Self {
        SequenceInfo { sequence, channel }
    }

    pub fn incremental(sequence: u64) -> Self {
        SequenceInfo::new(sequence, Channel::Incremental)
    }
}

/// Decides whether a snapshot received while synced should replace the book.
pub trait SnapshotFilter {
    fn accept(&self, info: &SequenceInfo) -> bool;
}

/// Accept only snapshots interleaved on the incremental channel; a snapshot
/// from the snapshot channel is a bootstrap we no longer need.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementalChannelOnly;

impl SnapshotFilter for IncrementalChannelOnly {
    fn accept(&self, info: &SequenceInfo) -> bool {
        info.channel == Channel::Incremental
    }
}

impl<F> SnapshotFilter for F
where
    F: Fn(&SequenceInfo) -> bool,
{
    fn accept(&self, info: &SequenceInfo) -> bool {
        self(info)
    }
}

/// Consumer side of the sequencer
pub trait SequencerHandler<U> {
    /// Gap-free incremental, in order. On error the book must be left as it
    /// was before the call.
    fn apply_update(&mut self, update: &U) -> Result<(), BookError>;

    /// Full book replacement covering everything up to `sequence`. On error
    /// the book must be left as it was before the call.
    fn apply_snapshot(&mut self, snapshot: &U, sequence: u64) -> Result<(), BookError>;

    /// Fetch a new snapshot out-of-band. `retries` counts requests since the
    /// last applied snapshot, starting at 1.
    fn request_recovery(&mut self, retries: u32);

    /// Drop the book; it no longer reflects the feed
    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    SnapshotApplied { replayed: usize },
    SnapshotSkipped,
    Buffered,
    RecoveryRequested { retries: u32 },
    /// The book refused the update or snapshot; recovery was requested
    Rejected { retries: u32 },
    /// Stale or duplicate incremental
    Discarded,
    /// Recovery buffer was full; `policy` says what gave way
    Overflow { policy: OverflowPolicy },
    /// Book cleared, back to unsynced
    Cleared,
}

#[derive(Debug)]
pub struct Sequencer<U, F = IncrementalChannelOnly> {
    config: SequencerConfig,
    filter: F,
    state: SyncState,
    ready: bool,
    last_sequence: u64,
    retries: u32,
    requested_at: Option<Instant>,
    buffer: VecDeque<(u64, U)>,
    dropped: u64,
}

impl<U: BookUpdate> Sequencer<U, IncrementalChannelOnly> {
    pub fn with_config(config: SequencerConfig) -> Result<Self, ConfigError> {
        Sequencer::new(config, IncrementalChannelOnly)
    }
}

impl<U: BookUpdate, F: SnapshotFilter> Sequencer<U, F> {
    pub fn new(config: SequencerConfig, filter: F) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Sequencer {
            config,
            filter,
            state: SyncState::Unsynced,
            ready: false,
            last_sequence: 0,
            retries: 0,
            requested_at: None,
            buffer: VecDeque::new(),
            dropped: 0,
        })
    }

    /// Classify one update and act on it
    pub fn apply<H>(
        &mut self,
        update: U,
        info: SequenceInfo,
        now: Instant,
        handler: &mut H,
    ) -> Result<Outcome, SequencerError>
    where
        H: SequencerHandler<U> + ?Sized,
    {
        match update.update_kind() {
            UpdateKind::Undefined => Err(SequencerError::UndefinedUpdateKind(info.sequence)),
            UpdateKind::Snapshot => Ok(self.on_snapshot(update, info, now, handler)),
            UpdateKind::Incremental => Ok(self.on_incremental(update, info.sequence, now, handler)),
            UpdateKind::Stale => {
                self.reset(handler);
                Ok(Outcome::Cleared)
            }
        }
    }

    /// Re-request recovery once the timeout has elapsed.
    /// Returns the new retry count when a request was made.
    pub fn poll<H>(&mut self, now: Instant, handler: &mut H) -> Option<u32>
    where
        H: SequencerHandler<U> + ?Sized,
    {
        if self.state != SyncState::AwaitingRecovery {
            return None;
        }
        let requested_at = self.requested_at?;
        if now.saturating_duration_since(requested_at) < self.config.timeout {
            return None;
        }
        warn!(retries = self.retries, buffered = self.buffer.len(), "recovery timed out");
        Some(self.request_recovery(now, handler))
    }

    /// Drop everything and go back to unsynced; the book is cleared.
    pub fn reset<H>(&mut self, handler: &mut H)
    where
        H: SequencerHandler<U> + ?Sized,
    {
        info!(last_sequence = self.last_sequence, "book is stale, waiting for snapshot");
        self.buffer.clear();
        handler.clear();
        self.state = SyncState::Unsynced;
        self.ready = false;
        self.last_sequence = 0;
        self.retries = 0;
        self.requested_at = None;
    }

    fn on_snapshot<H>(&mut self, update: U, info: SequenceInfo, now: Instant, handler: &mut H) -> Outcome
    where
        H: SequencerHandler<U> + ?Sized,
    {
        let accept = match self.state {
            SyncState::Unsynced => true,
            // a repeat of the snapshot we recovered from must not rewind the book
            SyncState::AwaitingRecovery => !self.ready || info.sequence > self.last_sequence,
            SyncState::Synced => self.filter.accept(&info) && info.sequence > self.last_sequence,
        };
        if !accept {
            debug!(sequence = info.sequence, last_sequence = self.last_sequence, "snapshot skipped");
            return Outcome::SnapshotSkipped;
        }

        if let Err(error) = handler.apply_snapshot(&update, info.sequence) {
            warn!(sequence = info.sequence, %error, "snapshot rejected by book");
            return self.reject(now, handler);
        }
        info!(sequence = info.sequence, retries = self.retries, "snapshot applied");
        self.state = SyncState::Synced;
        self.ready = true;
        self.last_sequence = info.sequence;
        self.retries = 0;
        self.requested_at = None;

        let replayed = self.replay(now, handler);
        Outcome::SnapshotApplied { replayed }
    }

    /// Push parked incrementals back through the incremental path, oldest
    /// sequence first. Anything at or below the snapshot is discarded; a
    /// sequence still missing re-enters recovery.
    fn replay<H>(&mut self, now: Instant, handler: &mut H) -> usize
    where
        H: SequencerHandler<U> + ?Sized,
    {
        let mut parked = std::mem::take(&mut self.buffer);
        parked.make_contiguous().sort_by_key(|(sequence, _)| *sequence);

        let mut replayed = 0;
        for (sequence, update) in parked {
            if self.on_incremental(update, sequence, now, handler) == Outcome::Applied {
                replayed += 1;
            }
        }
        if replayed > 0 {
            debug!(replayed, last_sequence = self.last_sequence, "replayed parked updates");
        }
        replayed
    }

    fn on_incremental<H>(&mut self, update: U, sequence: u64, now: Instant, handler: &mut H) -> Outcome
    where
        H: SequencerHandler<U> + ?Sized,
    {
        match self.state {
            SyncState::Synced => {
                if sequence <= self.last_sequence {
                    trace!(sequence, last_sequence = self.last_sequence, "stale incremental discarded");
                    return Outcome::Discarded;
                }
                if sequence == self.last_sequence + 1 {
                    if let Err(error) = handler.apply_update(&update) {
                        warn!(sequence, %error, "incremental rejected by book");
                        return self.reject(now, handler);
                    }
                    self.last_sequence = sequence;
                    return Outcome::Applied;
                }
                warn!(expected = self.last_sequence + 1, got = sequence, "sequence gap");
                self.buffer.push_back((sequence, update));
                self.state = SyncState::AwaitingRecovery;
                Outcome::RecoveryRequested {
                    retries: self.request_recovery(now, handler),
                }
            }
            SyncState::Unsynced => {
                debug!(sequence, "incremental before any snapshot");
                self.buffer.push_back((sequence, update));
                self.state = SyncState::AwaitingRecovery;
                Outcome::RecoveryRequested {
                    retries: self.request_recovery(now, handler),
                }
            }
            SyncState::AwaitingRecovery => {
                if self.ready && sequence <= self.last_sequence {
                    return Outcome::Discarded;
                }
                self.park(sequence, update, handler)
            }
        }
    }

    fn park<H>(&mut self, sequence: u64, update: U, handler: &mut H) -> Outcome
    where
        H: SequencerHandler<U> + ?Sized,
    {
        if self.buffer.len() < self.config.max_updates {
            self.buffer.push_back((sequence, update));
            return Outcome::Buffered;
        }

        let policy = self.config.overflow;
        match policy {
            OverflowPolicy::DropOldest => {
                if let Some((oldest, _)) = self.buffer.pop_front() {
                    warn!(oldest, sequence, "recovery buffer full, dropping oldest");
                }
                self.dropped += 1;
                self.buffer.push_back((sequence, update));
            }
            OverflowPolicy::HardReset => {
                warn!(sequence, buffered = self.buffer.len(), "recovery buffer full, hard reset");
                self.dropped += self.buffer.len() as u64 + 1;
                self.buffer.clear();
                handler.clear();
                self.state = SyncState::Unsynced;
                self.ready = false;
                self.last_sequence = 0;
                self.requested_at = None;
            }
        }
        Outcome::Overflow { policy }
    }

    /// The book rolled back a diff it could not take, so it is stuck at
    /// `last_sequence`. Park what follows until a newer snapshot arrives.
    fn reject<H>(&mut self, now: Instant, handler: &mut H) -> Outcome
    where
        H: SequencerHandler<U> + ?Sized,
    {
        self.state = SyncState::AwaitingRecovery;
        Outcome::Rejected {
            retries: self.request_recovery(now, handler),
        }
    }

    fn request_recovery<H>(&mut self, now: Instant, handler: &mut H) -> u32
    where
        H: SequencerHandler<U> + ?Sized,
    {
        self.retries = self.retries.saturating_add(1);
        self.requested_at = Some(now);
        info!(retries = self.retries, "requesting recovery");
        handler.request_recovery(self.retries);
        self.retries
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// True once a snapshot has been applied since the last reset
    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Recovery requests since the last applied snapshot
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Incrementals parked while waiting for recovery
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Incrementals lost to buffer overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
