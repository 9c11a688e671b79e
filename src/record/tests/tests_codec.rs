//! Record codec round-trips, width selection, and torn-record handling.

use crate::record::{RecordCodec, len_width};
use std::io::Cursor;

#[test]
fn width_follows_length_limit() {
    assert_eq!(len_width(1), 1);
    assert_eq!(len_width(255), 1);
    assert_eq!(len_width(256), 2);
    assert_eq!(len_width(65_535), 2);
    assert_eq!(len_width(65_536), 3);
}

#[test]
fn roundtrip_single_record() {
    let codec = RecordCodec::new(255, 255);
    let mut buf = Vec::new();
    let written = codec.write_record(&mut buf, b"key", b"value").unwrap();

    assert_eq!(written, buf.len() as u64);
    assert_eq!(buf, b"\x03key\x05value");

    let mut r = Cursor::new(buf);
    assert_eq!(
        codec.read_record(&mut r).unwrap(),
        Some((b"key".to_vec(), b"value".to_vec()))
    );
    assert_eq!(codec.read_record(&mut r).unwrap(), None);
}

#[test]
fn roundtrip_many_records() {
    let codec = RecordCodec::new(255, 255);
    let records: Vec<(Vec<u8>, Vec<u8>)> = (0u8..50)
        .map(|i| (vec![b'k', i], vec![i; (i % 7) as usize]))
        .collect();

    let mut buf = Vec::new();
    for (k, v) in &records {
        codec.write_record(&mut buf, k, v).unwrap();
    }

    let mut r = Cursor::new(buf);
    for (k, v) in &records {
        assert_eq!(codec.read_record(&mut r).unwrap(), Some((k.clone(), v.clone())));
    }
    assert_eq!(codec.read_record(&mut r).unwrap(), None);
}

#[test]
fn tombstone_value_roundtrips() {
    let codec = RecordCodec::new(255, 255);
    let mut buf = Vec::new();
    codec.write_record(&mut buf, b"gone", b"").unwrap();

    let mut r = Cursor::new(buf);
    assert_eq!(
        codec.read_record(&mut r).unwrap(),
        Some((b"gone".to_vec(), Vec::new()))
    );
}

#[test]
fn torn_trailing_record_reads_as_eof() {
    let codec = RecordCodec::new(255, 255);
    let mut buf = Vec::new();
    codec.write_record(&mut buf, b"whole", b"record").unwrap();
    codec.write_record(&mut buf, b"torn", b"payload").unwrap();

    // Cut the stream at every point inside the second record: the first
    // record must still decode and the remainder must read as EOF.
    let first_len = codec.encoded_len(b"whole", b"record") as usize;
    for cut in first_len..buf.len() {
        let mut r = Cursor::new(&buf[..cut]);
        assert_eq!(
            codec.read_record(&mut r).unwrap(),
            Some((b"whole".to_vec(), b"record".to_vec()))
        );
        assert_eq!(codec.read_record(&mut r).unwrap(), None, "cut at {cut}");
    }
}

#[test]
fn two_byte_widths() {
    let codec = RecordCodec::new(65_535, 65_535);
    let key = vec![7u8; 300];
    let value = vec![9u8; 500];

    let mut buf = Vec::new();
    codec.write_record(&mut buf, &key, &value).unwrap();
    assert_eq!(buf.len() as u64, codec.encoded_len(&key, &value));
    assert_eq!(&buf[..2], &300u16.to_le_bytes());

    let mut r = Cursor::new(buf);
    assert_eq!(codec.read_record(&mut r).unwrap(), Some((key, value)));
}

#[test]
fn encoded_len_matches_written_bytes() {
    let codec = RecordCodec::new(255, 255);
    let mut buf = Vec::new();
    let n = codec.write_record(&mut buf, b"a", b"bb").unwrap();
    assert_eq!(n, 5);
    assert_eq!(codec.encoded_len(b"a", b"bb"), 5);
}
