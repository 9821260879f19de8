//! Bounded-window packet resequencer
//!
//! Holds packets that arrive ahead of the expected sequence number in a
//! fixed ring of `depth` slots and releases them in order once the gap in
//! front of them fills. Anything that cannot be bridged inside the window is
//! a reset: the consumer drops partial state and waits for a new baseline.

use crate::config::ReorderConfig;
use crate::error::ConfigError;
use tracing::{trace, warn};

/// Why the window gave up on the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Sequence number behind the expected one.
    Stale { expected: u64, got: u64 },
    /// Sequence number more than `depth` ahead of the expected one.
    WindowOverflow { expected: u64, got: u64 },
    /// Sequence number outside the configured session bounds.
    OutOfBounds { sequence: u64 },
    /// Payload had to be buffered but exceeds the slot size.
    PacketTooLarge { size: usize, limit: usize },
    /// The feed started a new session on this channel.
    SessionRollover { from: u64, to: u64 },
}

/// What happened to a dispatched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The packet, plus any buffered successors, went to `parse`.
    Delivered(usize),
    /// Held until the gap in front of it fills.
    Buffered,
    /// Already buffered; ignored.
    Duplicate,
    /// The window was cleared.
    Reset(ResetReason),
}

/// Consumer side of the reorder buffer.
pub trait PacketHandler {
    /// Sequence number the session starts from. Called on the first packet
    /// of a session, which includes the first packet after every reset.
    fn initial_sequence(&mut self, first: u64) -> u64;

    /// In-order payload. The slice is only valid for the duration of the call.
    fn parse(&mut self, sequence: u64, payload: &[u8]);

    /// Partial state must be discarded.
    fn reset(&mut self, reason: ResetReason);
}

#[derive(Debug)]
struct Slot {
    sequence: Option<u64>,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct ReorderBuffer {
    config: ReorderConfig,
    slots: Vec<Slot>,
    expected: Option<u64>,
    pending: usize,
}

impl ReorderBuffer {
    pub fn new(config: ReorderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        // slots are sized once; buffered payloads never grow them
        let slots = (0..config.depth)
            .map(|_| Slot {
                sequence: None,
                data: Vec::with_capacity(config.max_packet_size),
            })
            .collect();
        Ok(ReorderBuffer {
            config,
            slots,
            expected: None,
            pending: 0,
        })
    }

    /// Process one packet
    pub fn dispatch<H>(&mut self, sequence: u64, payload: &[u8], handler: &mut H) -> Dispatch
    where
        H: PacketHandler + ?Sized,
    {
        if sequence < self.config.min_sequence || sequence > self.config.max_sequence {
            return self.fail(ResetReason::OutOfBounds { sequence }, handler);
        }

        let expected = match self.expected {
            Some(expected) => expected,
            None => {
                let expected = handler.initial_sequence(sequence);
                trace!(expected, first = sequence, "reorder session started");
                self.expected = Some(expected);
                expected
            }
        };

        if sequence == expected {
            handler.parse(sequence, payload);
            self.expected = sequence.checked_add(1);
            return Dispatch::Delivered(1 + self.drain(handler));
        }

        if sequence < expected {
            return self.fail(
                ResetReason::Stale {
                    expected,
                    got: sequence,
                },
                handler,
            );
        }

        if sequence - expected > self.depth() as u64 {
            return self.fail(
                ResetReason::WindowOverflow {
                    expected,
                    got: sequence,
                },
                handler,
            );
        }

        let index = self.index(sequence);
        if self.slots[index].sequence == Some(sequence) {
            trace!(sequence, "duplicate packet ignored");
            return Dispatch::Duplicate;
        }

        if payload.len() > self.config.max_packet_size {
            return self.fail(
                ResetReason::PacketTooLarge {
                    size: payload.len(),
                    limit: self.config.max_packet_size,
                },
                handler,
            );
        }

        let slot = &mut self.slots[index];
        debug_assert!(slot.sequence.is_none());
        slot.data.clear();
        slot.data.extend_from_slice(payload);
        slot.sequence = Some(sequence);
        self.pending += 1;
        trace!(sequence, expected, pending = self.pending, "packet buffered");
        Dispatch::Buffered
    }

    /// Release every buffered packet that is now contiguous
    fn drain<H>(&mut self, handler: &mut H) -> usize
    where
        H: PacketHandler + ?Sized,
    {
        let mut count = 0;
        while let Some(next) = self.expected {
            if self.pending == 0 {
                break;
            }
            let index = self.index(next);
            let slot = &mut self.slots[index];
            if slot.sequence != Some(next) {
                break;
            }
            slot.sequence = None;
            self.pending -= 1;
            handler.parse(next, &slot.data);
            self.expected = next.checked_add(1);
            count += 1;
        }
        count
    }

    fn fail<H>(&mut self, reason: ResetReason, handler: &mut H) -> Dispatch
    where
        H: PacketHandler + ?Sized,
    {
        warn!(?reason, dropped = self.pending, "reorder window reset");
        self.reset();
        handler.reset(reason);
        Dispatch::Reset(reason)
    }

    /// Forget the session: clear buffered packets and the expected sequence.
    /// The next packet starts a new session.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.sequence = None;
        }
        self.pending = 0;
        self.expected = None;
    }

    fn index(&self, sequence: u64) -> usize {
        (sequence % self.depth() as u64) as usize
    }

    /// Next sequence number to be delivered, once a session has started
    pub fn expected(&self) -> Option<u64> {
        self.expected
    }

    /// Number of packets waiting for a gap to fill
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn depth(&self) -> usize {
        self.config.depth
    }

    /// Bytes currently allocated for buffered payloads
    pub fn allocated_bytes(&self) -> usize {
        self.slots.iter().map(|slot| slot.data.capacity()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        start: u64,
        starts: usize,
        parsed: Vec<(u64, Vec<u8>)>,
        resets: Vec<ResetReason>,
    }

    impl PacketHandler for Recorder {
        fn initial_sequence(&mut self, _first: u64) -> u64 {
            self.starts += 1;
            self.start
        }

        fn parse(&mut self, sequence: u64, payload: &[u8]) {
            self.parsed.push((sequence, payload.to_vec()));
        }

        fn reset(&mut self, reason: ResetReason) {
            self.resets.push(reason);
        }
    }

    fn buffer(depth: usize) -> ReorderBuffer {
        ReorderBuffer::new(ReorderConfig {
            depth,
            max_packet_size: 16,
            ..ReorderConfig::default()
        })
        .unwrap()
    }

    fn recorder(start: u64) -> Recorder {
        Recorder {
            start,
            ..Recorder::default()
        }
    }

    fn sequences(recorder: &Recorder) -> Vec<u64> {
        recorder.parsed.iter().map(|(seq, _)| *seq).collect()
    }

    #[test]
    fn test_in_order() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        for seq in 1..=5 {
            assert_eq!(reorder.dispatch(seq, &[seq as u8], &mut rec), Dispatch::Delivered(1));
        }
        assert_eq!(sequences(&rec), vec![1, 2, 3, 4, 5]);
        assert_eq!(rec.starts, 1);
        assert_eq!(reorder.expected(), Some(6));
    }

    #[test]
    fn test_buffer_then_drain() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);

        assert_eq!(reorder.dispatch(3, b"c", &mut rec), Dispatch::Buffered);
        assert_eq!(reorder.dispatch(2, b"b", &mut rec), Dispatch::Buffered);
        assert_eq!(reorder.pending(), 2);
        assert!(rec.parsed.is_empty());

        assert_eq!(reorder.dispatch(1, b"a", &mut rec), Dispatch::Delivered(3));
        assert_eq!(
            rec.parsed,
            vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (3, b"c".to_vec())]
        );
        assert_eq!(reorder.pending(), 0);
    }

    #[test]
    fn test_offset_equal_to_depth_is_buffered() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        assert_eq!(reorder.dispatch(5, b"e", &mut rec), Dispatch::Buffered);
        assert!(rec.resets.is_empty());
    }

    #[test]
    fn test_window_overflow_resets_once() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        reorder.dispatch(1, b"a", &mut rec);
        reorder.dispatch(3, b"c", &mut rec);

        let result = reorder.dispatch(7, b"g", &mut rec);
        assert_eq!(
            result,
            Dispatch::Reset(ResetReason::WindowOverflow { expected: 2, got: 7 })
        );
        assert_eq!(rec.resets.len(), 1);
        assert_eq!(sequences(&rec), vec![1]);
        assert_eq!(reorder.pending(), 0);
        assert_eq!(reorder.expected(), None);
    }

    #[test]
    fn test_stale_resets() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        reorder.dispatch(1, b"a", &mut rec);
        reorder.dispatch(2, b"b", &mut rec);

        let result = reorder.dispatch(1, b"a", &mut rec);
        assert_eq!(result, Dispatch::Reset(ResetReason::Stale { expected: 3, got: 1 }));
        assert_eq!(sequences(&rec), vec![1, 2]);
    }

    #[test]
    fn test_new_session_after_reset() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        reorder.dispatch(1, b"a", &mut rec);
        reorder.dispatch(20, b"t", &mut rec);
        assert_eq!(rec.resets.len(), 1);

        rec.start = 21;
        assert_eq!(reorder.dispatch(21, b"u", &mut rec), Dispatch::Delivered(1));
        assert_eq!(rec.starts, 2);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut reorder = ReorderBuffer::new(ReorderConfig {
            depth: 4,
            max_packet_size: 16,
            min_sequence: 10,
            max_sequence: 20,
        })
        .unwrap();
        let mut rec = recorder(10);

        assert_eq!(
            reorder.dispatch(9, b"x", &mut rec),
            Dispatch::Reset(ResetReason::OutOfBounds { sequence: 9 })
        );
        assert_eq!(
            reorder.dispatch(21, b"x", &mut rec),
            Dispatch::Reset(ResetReason::OutOfBounds { sequence: 21 })
        );
        assert_eq!(rec.starts, 0);
    }

    #[test]
    fn test_duplicate_buffered_packet() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        reorder.dispatch(3, b"c", &mut rec);
        assert_eq!(reorder.dispatch(3, b"c", &mut rec), Dispatch::Duplicate);
        assert_eq!(reorder.pending(), 1);

        assert_eq!(reorder.dispatch(1, b"a", &mut rec), Dispatch::Delivered(1));
        assert_eq!(reorder.dispatch(2, b"b", &mut rec), Dispatch::Delivered(2));
        assert_eq!(sequences(&rec), vec![1, 2, 3]);
    }

    #[test]
    fn test_oversized_packet() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        let big = [0u8; 32];

        // in order: delivered without buffering
        assert_eq!(reorder.dispatch(1, &big, &mut rec), Dispatch::Delivered(1));

        assert_eq!(
            reorder.dispatch(3, &big, &mut rec),
            Dispatch::Reset(ResetReason::PacketTooLarge { size: 32, limit: 16 })
        );
    }

    #[test]
    fn test_memory_is_bounded() {
        let mut reorder = buffer(4);
        let mut rec = recorder(1);
        for round in 0..10u64 {
            let base = 1 + round * 5;
            for seq in (base + 1..base + 5).rev() {
                reorder.dispatch(seq, &[0u8; 16], &mut rec);
            }
            reorder.dispatch(base, &[0u8; 16], &mut rec);
        }
        assert_eq!(rec.parsed.len(), 50);
        assert_eq!(reorder.allocated_bytes(), 4 * 16);
    }

    #[test]
    fn test_rejects_zero_depth() {
        let result = ReorderBuffer::new(ReorderConfig {
            depth: 0,
            ..ReorderConfig::default()
        });
        assert!(matches!(result, Err(ConfigError::ZeroDepth)));
    }
}
