//! Packet header decoder
//!
//! Splits a datagram into its fixed header and a payload slice borrowed from
//! the original buffer. Only the sequencing fields are interpreted here; the
//! payload itself belongs to whichever codec sits behind the feed.

use crate::protocol::*;
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("invalid object type: {0}")]
    InvalidObjectType(u8),

    #[error("invalid fragment: {fragment} > fragment_max {fragment_max}")]
    InvalidFragment { fragment: u16, fragment_max: u16 },
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Zero-copy header decoder
pub struct HeaderDecoder;

impl HeaderDecoder {
    /// Parse the header at the start of `buffer`
    /// Returns the header and the payload that follows it
    pub fn decode(buffer: &[u8]) -> DecodeResult<(PacketHeader, &[u8])> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::BufferTooSmall {
                need: HEADER_SIZE,
                have: buffer.len(),
            });
        }

        let control = buffer[0];
        let object_type =
            ObjectType::from_u8(buffer[1]).ok_or(DecodeError::InvalidObjectType(buffer[1]))?;
        let fragment = BigEndian::read_u16(&buffer[2..4]);
        let fragment_max = BigEndian::read_u16(&buffer[4..6]);
        if fragment > fragment_max {
            return Err(DecodeError::InvalidFragment {
                fragment,
                fragment_max,
            });
        }

        let header = PacketHeader {
            control,
            object_type,
            fragment,
            fragment_max,
            session_id: BigEndian::read_u64(&buffer[8..16]),
            sequence_number: BigEndian::read_u64(&buffer[16..24]),
            object_id: BigEndian::read_u64(&buffer[24..32]),
            last_sequence_number: BigEndian::read_u64(&buffer[32..40]),
        };

        Ok((header, &buffer[HEADER_SIZE..]))
    }

    /// Write `header` into the first `HEADER_SIZE` bytes of `buffer`
    pub fn encode(header: &PacketHeader, buffer: &mut [u8]) -> DecodeResult<()> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::BufferTooSmall {
                need: HEADER_SIZE,
                have: buffer.len(),
            });
        }

        buffer[0] = header.control;
        buffer[1] = header.object_type as u8;
        BigEndian::write_u16(&mut buffer[2..4], header.fragment);
        BigEndian::write_u16(&mut buffer[4..6], header.fragment_max);
        BigEndian::write_u16(&mut buffer[6..8], 0);
        BigEndian::write_u64(&mut buffer[8..16], header.session_id);
        BigEndian::write_u64(&mut buffer[16..24], header.sequence_number);
        BigEndian::write_u64(&mut buffer[24..32], header.object_id);
        BigEndian::write_u64(&mut buffer[32..40], header.last_sequence_number);
        Ok(())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentError {
    #[error("unexpected fragment {got}, expected {expected}")]
    OutOfOrder { expected: u16, got: u16 },

    #[error("reassembled payload exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Joins fragmented payloads back into one contiguous message.
///
/// Fragments must arrive in order (the reorder buffer guarantees that for a
/// single channel); anything else drops the partial message.
#[derive(Debug)]
pub struct FragmentAssembler {
    buffer: Vec<u8>,
    next_fragment: u16,
    limit: usize,
}

impl FragmentAssembler {
    pub fn new(limit: usize) -> Self {
        FragmentAssembler {
            buffer: Vec::new(),
            next_fragment: 0,
            limit,
        }
    }

    /// Feed one packet's payload.
    ///
    /// Calls `complete` with the full message once the last fragment is seen.
    /// Unfragmented payloads are passed through without copying.
    pub fn push<F>(&mut self, header: &PacketHeader, payload: &[u8], complete: F) -> Result<(), FragmentError>
    where
        F: FnOnce(&[u8]),
    {
        if header.fragment != self.next_fragment {
            let expected = self.next_fragment;
            self.clear();
            return Err(FragmentError::OutOfOrder {
                expected,
                got: header.fragment,
            });
        }

        if header.is_last_fragment() && self.buffer.is_empty() {
            self.next_fragment = 0;
            complete(payload);
            return Ok(());
        }

        if self.buffer.len() + payload.len() > self.limit {
            self.clear();
            return Err(FragmentError::TooLarge { limit: self.limit });
        }
        self.buffer.extend_from_slice(payload);

        if header.is_last_fragment() {
            complete(&self.buffer);
            self.clear();
        } else {
            self.next_fragment += 1;
        }
        Ok(())
    }

    /// Drop any partial message
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.next_fragment = 0;
    }

    pub fn is_partial(&self) -> bool {
        self.next_fragment != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(fragment: u16, fragment_max: u16) -> PacketHeader {
        PacketHeader {
            control: CONTROL_INCREMENTAL,
            object_type: ObjectType::MarketByPrice,
            fragment,
            fragment_max,
            session_id: 7,
            sequence_number: 42,
            object_id: 3,
            last_sequence_number: 40,
        }
    }

    #[test]
    fn test_decode_header() {
        let mut msg = vec![0u8; HEADER_SIZE + 4];
        HeaderDecoder::encode(&header(0, 0), &mut msg).unwrap();
        msg[HEADER_SIZE..].copy_from_slice(&[1, 2, 3, 4]);

        let (decoded, payload) = HeaderDecoder::decode(&msg).unwrap();
        assert_eq!(decoded, header(0, 0));
        assert_eq!(payload, &[1, 2, 3, 4]);
        assert!(decoded.is_incremental());
    }

    #[test]
    fn test_buffer_too_small() {
        let small_buf = vec![0u8; 4];
        let result = HeaderDecoder::decode(&small_buf);
        assert!(matches!(result, Err(DecodeError::BufferTooSmall { need: HEADER_SIZE, have: 4 })));
    }

    #[test]
    fn test_invalid_object_type() {
        let mut msg = vec![0u8; HEADER_SIZE];
        msg[1] = 99;
        let result = HeaderDecoder::decode(&msg);
        assert!(matches!(result, Err(DecodeError::InvalidObjectType(99))));
    }

    #[test]
    fn test_fragments_joined() {
        let mut assembler = FragmentAssembler::new(64);
        let mut out = Vec::new();

        assembler.push(&header(0, 2), b"ab", |m| out.push(m.to_vec())).unwrap();
        assert!(assembler.is_partial());
        assembler.push(&header(1, 2), b"cd", |m| out.push(m.to_vec())).unwrap();
        assembler.push(&header(2, 2), b"e", |m| out.push(m.to_vec())).unwrap();

        assert_eq!(out, vec![b"abcde".to_vec()]);
        assert!(!assembler.is_partial());
    }

    #[test]
    fn test_fragment_out_of_order() {
        let mut assembler = FragmentAssembler::new(64);
        assembler.push(&header(0, 2), b"ab", |_| {}).unwrap();
        let err = assembler.push(&header(2, 2), b"e", |_| {}).unwrap_err();
        assert_eq!(err, FragmentError::OutOfOrder { expected: 1, got: 2 });
        assert!(!assembler.is_partial());
    }

    #[test]
    fn test_fragment_limit() {
        let mut assembler = FragmentAssembler::new(3);
        assembler.push(&header(0, 1), b"ab", |_| {}).unwrap();
        let err = assembler.push(&header(1, 1), b"cd", |_| {}).unwrap_err();
        assert_eq!(err, FragmentError::TooLarge { limit: 3 });
    }
}
