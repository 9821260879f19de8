//! Error types.
//!
//! Gaps, duplicates and reordering are not errors: they are handled by the
//! reorder buffer and the sequencer. What ends up here is malformed
//! configuration, structural book violations and undecodable input.

use crate::decoder::{DecodeError, FragmentError};
use crate::update::{InstrumentKey, Side};
use thiserror::Error;

/// Result type alias for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Rejected at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("reorder window depth must be at least 1")]
    ZeroDepth,

    #[error("maximum packet size must be at least 1 byte")]
    ZeroPacketSize,

    #[error("sequence bounds are inverted: min {min} > max {max}")]
    InvertedBounds { min: u64, max: u64 },

    #[error("sequencer must be allowed to buffer at least one update")]
    ZeroMaxUpdates,
}

/// A diff that cannot be applied to the current book.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookError {
    #[error("no {side:?} level at price {price}")]
    LevelNotFound { side: Side, price: f64 },

    #[error("order not found: {side:?} {order_id}")]
    OrderNotFound { side: Side, order_id: String },

    #[error("duplicate order id: {side:?} {order_id}")]
    DuplicateOrder { side: Side, order_id: String },

    #[error("book inverted: best bid {bid} >= best ask {ask}")]
    Inverted { bid: f64, ask: f64 },

    #[error("invalid price: {0}")]
    InvalidPrice(f64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error("update kind is undefined (sequence {0})")]
    UndefinedUpdateKind(u64),
}

/// Top-level error, aggregating the module errors.
///
/// Returned directly for a malformed datagram header; everything after the
/// reorder window arrives wrapped in `FeedEvent::DecodeFailed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    /// The payload codec's own error, rendered
    #[error("payload decode failed: {0}")]
    Payload(String),

    #[error("{instrument} has more than one update in packet {sequence}")]
    SharedSequence { instrument: InstrumentKey, sequence: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvertedBounds { min: 10, max: 5 };
        assert_eq!(err.to_string(), "sequence bounds are inverted: min 10 > max 5");

        let err = BookError::LevelNotFound {
            side: Side::Bid,
            price: 10.5,
        };
        assert_eq!(err.to_string(), "no Bid level at price 10.5");
    }

    #[test]
    fn test_feed_error_from() {
        let err: FeedError = ConfigError::ZeroDepth.into();
        assert!(matches!(err, FeedError::Config(ConfigError::ZeroDepth)));

        let result: Result<()> = Err(SequencerError::UndefinedUpdateKind(3).into());
        assert!(result.is_err());

        let err: FeedError = FragmentError::TooLarge { limit: 8 }.into();
        assert!(matches!(err, FeedError::Fragment(FragmentError::TooLarge { limit: 8 })));
    }
}
