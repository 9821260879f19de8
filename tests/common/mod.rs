//! Toy price-level codec and packet builders shared by the integration tests

#![allow(dead_code)]

use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use feed_sequencer::protocol::{price_from_fixed, price_to_fixed, CONTROL_INCREMENTAL};
use feed_sequencer::{
    Channel, HeaderDecoder, InstrumentKey, MarketByPriceUpdate, ObjectType, PacketHeader, PriceLevel, Side,
    UpdateAction, UpdateDecoder, UpdateKind, HEADER_SIZE,
};

pub const EXCHANGE: &str = "test";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated payload")]
    Truncated(#[from] io::Error),

    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u8 },
}

/// Message layout, big endian:
/// kind u8, exchange_sequence u64, symbol_len u8, symbol, level_count u16,
/// then per level: side u8, action u8, price i64, quantity i64 (both 1e-8 fixed point).
pub struct LevelCodec;

impl UpdateDecoder for LevelCodec {
    type Update = MarketByPriceUpdate;
    type Error = CodecError;

    fn decode(
        &mut self,
        _header: &PacketHeader,
        mut payload: &[u8],
        out: &mut Vec<MarketByPriceUpdate>,
    ) -> Result<(), CodecError> {
        while !payload.is_empty() {
            out.push(read_update(&mut payload)?);
        }
        Ok(())
    }
}

fn read_update(input: &mut &[u8]) -> Result<MarketByPriceUpdate, CodecError> {
    let kind = input.read_u8()?;
    let kind = UpdateKind::from_u8(kind).ok_or(CodecError::InvalidValue {
        field: "kind",
        value: kind,
    })?;
    let sequence = input.read_u64::<BigEndian>()?;
    let mut symbol = vec![0u8; input.read_u8()? as usize];
    input.read_exact(&mut symbol)?;
    let key = InstrumentKey::new(EXCHANGE, String::from_utf8_lossy(&symbol));

    let mut update = MarketByPriceUpdate::new(&key, kind, sequence);
    for _ in 0..input.read_u16::<BigEndian>()? {
        let side = input.read_u8()?;
        let side = Side::from_u8(side).ok_or(CodecError::InvalidValue {
            field: "side",
            value: side,
        })?;
        let action = input.read_u8()?;
        let action = UpdateAction::from_u8(action).ok_or(CodecError::InvalidValue {
            field: "action",
            value: action,
        })?;
        let price = price_from_fixed(input.read_i64::<BigEndian>()?);
        let quantity = price_from_fixed(input.read_i64::<BigEndian>()?);
        let level = PriceLevel::new(price, quantity, action);
        match side {
            Side::Bid => update.bids.push(level),
            Side::Ask => update.asks.push(level),
        }
    }
    Ok(update)
}

pub fn encode_update(update: &MarketByPriceUpdate, out: &mut Vec<u8>) {
    let kind = match update.update_kind {
        UpdateKind::Undefined => 0,
        UpdateKind::Snapshot => 1,
        UpdateKind::Incremental => 2,
        UpdateKind::Stale => 3,
    };
    out.write_u8(kind).unwrap();
    out.write_u64::<BigEndian>(update.exchange_sequence).unwrap();
    out.write_u8(update.symbol.len() as u8).unwrap();
    out.extend_from_slice(update.symbol.as_bytes());
    out.write_u16::<BigEndian>((update.bids.len() + update.asks.len()) as u16)
        .unwrap();

    let sides = [(0u8, &update.bids), (1u8, &update.asks)];
    for (side, levels) in sides {
        for level in levels.iter() {
            let action = match level.update_action {
                UpdateAction::Undefined => 0,
                UpdateAction::New => 1,
                UpdateAction::Change => 2,
                UpdateAction::Delete => 3,
            };
            out.write_u8(side).unwrap();
            out.write_u8(action).unwrap();
            out.write_i64::<BigEndian>(price_to_fixed(level.price)).unwrap();
            out.write_i64::<BigEndian>(price_to_fixed(level.quantity)).unwrap();
        }
    }
}

pub fn key(symbol: &str) -> InstrumentKey {
    InstrumentKey::new(EXCHANGE, symbol)
}

pub fn header(channel: Channel, session: u64, sequence: u64, last_sequence: u64) -> PacketHeader {
    PacketHeader {
        control: match channel {
            Channel::Incremental => CONTROL_INCREMENTAL,
            Channel::Snapshot => 0,
        },
        object_type: ObjectType::MarketByPrice,
        session_id: session,
        sequence_number: sequence,
        last_sequence_number: last_sequence,
        ..PacketHeader::default()
    }
}

/// One datagram carrying `payload`
pub fn datagram(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; HEADER_SIZE];
    HeaderDecoder::encode(header, &mut buffer).unwrap();
    buffer.extend_from_slice(payload);
    buffer
}

/// Datagram for a single update on the given channel
pub fn packet(channel: Channel, session: u64, sequence: u64, update: &MarketByPriceUpdate) -> Vec<u8> {
    let mut payload = Vec::new();
    encode_update(update, &mut payload);
    let last_sequence = match update.update_kind {
        UpdateKind::Snapshot => update.exchange_sequence,
        _ => 0,
    };
    datagram(&header(channel, session, sequence, last_sequence), &payload)
}

pub fn snapshot(symbol: &str, sequence: u64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> MarketByPriceUpdate {
    let mut update = MarketByPriceUpdate::new(&key(symbol), UpdateKind::Snapshot, sequence);
    for &(price, quantity) in bids {
        update = update.with_bid(price, quantity, UpdateAction::New);
    }
    for &(price, quantity) in asks {
        update = update.with_ask(price, quantity, UpdateAction::New);
    }
    update
}

pub fn incremental(symbol: &str, sequence: u64) -> MarketByPriceUpdate {
    MarketByPriceUpdate::new(&key(symbol), UpdateKind::Incremental, sequence)
}
