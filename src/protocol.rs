//! Sequenced UDP packet header
//!
//! Fixed header: 40 bytes, network byte order
//!   - control: u8 (1 byte) - bit 0 set when sent on the incremental channel
//!   - object_type: u8 (1 byte) - payload classification
//!   - fragment: u16 (2 bytes) - position of this packet within the payload
//!   - fragment_max: u16 (2 bytes) - index of the last fragment
//!   - reserved: u16 (2 bytes)
//!   - session_id: u64 (8 bytes) - changes when the feed session rolls over
//!   - sequence_number: u64 (8 bytes) - monotonic per channel
//!   - object_id: u64 (8 bytes) - instrument or channel identifier
//!   - last_sequence_number: u64 (8 bytes) - trailing sequence covered by a snapshot

pub const HEADER_SIZE: usize = 40;

/// Control bit marking a packet as delivered on the incremental channel.
pub const CONTROL_INCREMENTAL: u8 = 0x01;

/// Fixed-point scale used for price keys (8 decimals).
pub const PRICE_SCALE: f64 = 1e8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectType {
    #[default]
    Undefined = 0,
    ReferenceData = 1,
    MarketStatus = 2,
    TopOfBook = 3,
    MarketByPrice = 4,
    MarketByOrder = 5,
    TradeSummary = 6,
    StatisticsUpdate = 7,
}

impl ObjectType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ObjectType::Undefined),
            1 => Some(ObjectType::ReferenceData),
            2 => Some(ObjectType::MarketStatus),
            3 => Some(ObjectType::TopOfBook),
            4 => Some(ObjectType::MarketByPrice),
            5 => Some(ObjectType::MarketByOrder),
            6 => Some(ObjectType::TradeSummary),
            7 => Some(ObjectType::StatisticsUpdate),
            _ => None,
        }
    }
}

/// Multicast channel a packet was received on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Snapshot,
    Incremental,
}

impl Channel {
    pub fn from_control(control: u8) -> Self {
        if control & CONTROL_INCREMENTAL != 0 {
            Channel::Incremental
        } else {
            Channel::Snapshot
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub control: u8,
    pub object_type: ObjectType,
    pub fragment: u16,
    pub fragment_max: u16,
    pub session_id: u64,
    pub sequence_number: u64,
    pub object_id: u64,
    pub last_sequence_number: u64,
}

impl PacketHeader {
    pub fn channel(&self) -> Channel {
        Channel::from_control(self.control)
    }

    pub fn is_incremental(&self) -> bool {
        self.channel() == Channel::Incremental
    }

    /// True when this packet carries the final (or only) fragment of a payload
    pub fn is_last_fragment(&self) -> bool {
        self.fragment == self.fragment_max
    }
}

/// Convert price from fixed-point to float
pub fn price_from_fixed(fixed: i64) -> f64 {
    fixed as f64 / PRICE_SCALE
}

/// Convert price to fixed-point, rounding to the nearest tick of 1e-8
pub fn price_to_fixed(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_conversion() {
        assert_eq!(ObjectType::from_u8(4), Some(ObjectType::MarketByPrice));
        assert_eq!(ObjectType::from_u8(5), Some(ObjectType::MarketByOrder));
        assert_eq!(ObjectType::from_u8(99), None);
    }

    #[test]
    fn test_channel_from_control() {
        assert_eq!(Channel::from_control(0x00), Channel::Snapshot);
        assert_eq!(Channel::from_control(0x01), Channel::Incremental);
        assert_eq!(Channel::from_control(0x81), Channel::Incremental);
    }

    #[test]
    fn test_price_conversions() {
        let price = 123.456;
        let fixed = price_to_fixed(price);
        let back = price_from_fixed(fixed);
        assert!((back - price).abs() < 1e-9);
        assert_eq!(price_to_fixed(-0.5), -50_000_000);
    }

    #[test]
    fn test_price_rounding_is_stable() {
        // 0.1 + 0.2 is not exactly 0.3 as f64 but must map to the same key
        assert_eq!(price_to_fixed(0.1 + 0.2), price_to_fixed(0.3));
    }
}
