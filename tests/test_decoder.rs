//! Protocol conformance and decoder tests

use byteorder::{BigEndian, ByteOrder};
use feed_sequencer::{
    Channel, DecodeError, FragmentAssembler, FragmentError, HeaderDecoder, ObjectType, PacketHeader, HEADER_SIZE,
};

fn raw_header(control: u8, object_type: u8, fragment: u16, fragment_max: u16, sequence: u64) -> Vec<u8> {
    let mut msg = vec![0u8; HEADER_SIZE];
    msg[0] = control;
    msg[1] = object_type;
    BigEndian::write_u16(&mut msg[2..4], fragment);
    BigEndian::write_u16(&mut msg[4..6], fragment_max);
    BigEndian::write_u64(&mut msg[8..16], 0xABCD);
    BigEndian::write_u64(&mut msg[16..24], sequence);
    BigEndian::write_u64(&mut msg[24..32], 77);
    BigEndian::write_u64(&mut msg[32..40], sequence.saturating_sub(1));
    msg
}

#[test]
fn test_network_byte_order() {
    let msg = raw_header(0x01, 5, 0, 0, 0x0102_0304_0506_0708);
    let (header, payload) = HeaderDecoder::decode(&msg).unwrap();

    assert!(payload.is_empty());
    assert_eq!(header.object_type, ObjectType::MarketByOrder);
    assert_eq!(header.session_id, 0xABCD);
    assert_eq!(header.sequence_number, 0x0102_0304_0506_0708);
    assert_eq!(header.object_id, 77);
    assert_eq!(header.last_sequence_number, 0x0102_0304_0506_0707);
    assert_eq!(&msg[16..18], &[0x01, 0x02]);
}

#[test]
fn test_channel_from_control_bit() {
    let incremental = raw_header(0x01, 4, 0, 0, 1);
    let snapshot = raw_header(0x00, 4, 0, 0, 1);
    let flagged = raw_header(0x81, 4, 0, 0, 1);

    assert_eq!(HeaderDecoder::decode(&incremental).unwrap().0.channel(), Channel::Incremental);
    assert_eq!(HeaderDecoder::decode(&snapshot).unwrap().0.channel(), Channel::Snapshot);
    assert_eq!(HeaderDecoder::decode(&flagged).unwrap().0.channel(), Channel::Incremental);
}

#[test]
fn test_payload_is_borrowed() {
    let mut msg = raw_header(0x01, 4, 0, 0, 9);
    msg.extend_from_slice(b"payload");
    let (_, payload) = HeaderDecoder::decode(&msg).unwrap();

    assert_eq!(payload, b"payload");
    assert_eq!(payload.as_ptr(), msg[HEADER_SIZE..].as_ptr());
}

#[test]
fn test_malformed_headers() {
    let result = HeaderDecoder::decode(&[0u8; HEADER_SIZE - 1]);
    assert!(matches!(
        result,
        Err(DecodeError::BufferTooSmall { need: HEADER_SIZE, have: 39 })
    ));

    let buf = raw_header(0, 8, 0, 0, 1);
    let result = HeaderDecoder::decode(&buf);
    assert!(matches!(result, Err(DecodeError::InvalidObjectType(8))));

    let buf = raw_header(0, 4, 3, 2, 1);
    let result = HeaderDecoder::decode(&buf);
    assert!(matches!(
        result,
        Err(DecodeError::InvalidFragment { fragment: 3, fragment_max: 2 })
    ));
}

#[test]
fn test_encode_matches_decode() {
    let header = PacketHeader {
        control: 0x01,
        object_type: ObjectType::TopOfBook,
        fragment: 1,
        fragment_max: 4,
        session_id: 3,
        sequence_number: 1000,
        object_id: 12,
        last_sequence_number: 998,
    };
    let mut buffer = [0u8; HEADER_SIZE];
    HeaderDecoder::encode(&header, &mut buffer).unwrap();
    assert_eq!(HeaderDecoder::decode(&buffer).unwrap().0, header);

    let mut short = [0u8; 8];
    assert!(HeaderDecoder::encode(&header, &mut short).is_err());
}

#[test]
fn test_unfragmented_payload_passes_through() {
    let (header, _) = HeaderDecoder::decode(&raw_header(1, 4, 0, 0, 1)).unwrap();
    let mut assembler = FragmentAssembler::new(4);
    let mut seen = Vec::new();

    // larger than the reassembly limit, but needs no reassembly
    assembler
        .push(&header, b"whole message", |m| seen.extend_from_slice(m))
        .unwrap();
    assert_eq!(seen, b"whole message");
}

#[test]
fn test_reassembly_resumes_after_error() {
    let fragment = |index: u16| HeaderDecoder::decode(&raw_header(1, 4, index, 1, 1)).unwrap().0;
    let mut assembler = FragmentAssembler::new(64);
    let mut complete = Vec::new();

    let err = assembler.push(&fragment(1), b"tail", |_| {}).unwrap_err();
    assert_eq!(err, FragmentError::OutOfOrder { expected: 0, got: 1 });

    assembler.push(&fragment(0), b"head-", |_| {}).unwrap();
    assembler
        .push(&fragment(1), b"tail", |m| complete.push(m.to_vec()))
        .unwrap();
    assert_eq!(complete, vec![b"head-tail".to_vec()]);
}
