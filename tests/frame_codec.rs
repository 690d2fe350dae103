//! Frame codec tests - chunking invariance and stream recovery.
//!
//! Property 1 from the protocol contract: for every byte stream, feeding it
//! in any chunking yields the same sequence of frames.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use slednik::protocol::{crc_itu, FrameCodec, RawFrame};
use slednik::types::Sequence;

const LOGIN: [u8; 22] = [
    0x78, 0x78, 0x11, 0x01, 0x03, 0x55, 0x17, 0x21, 0x07, 0x46, 0x10, 0x53, 0x00, 0x36, 0x00,
    0x01, 0x00, 0x01, 0xE0, 0xD1, 0x0D, 0x0A,
];

/// Build a short frame around an opcode and payload.
fn short_frame(op: u8, payload: &[u8], seq: u16) -> Vec<u8> {
    let declared = 1 + payload.len() + 4;
    let mut out = vec![0x78, 0x78, declared as u8, op];
    out.extend_from_slice(payload);
    out.extend_from_slice(&seq.to_be_bytes());
    let fcs = crc_itu(&out[2..]);
    out.extend_from_slice(&fcs.to_be_bytes());
    out.extend_from_slice(&[0x0D, 0x0A]);
    out
}

/// Decode a stream delivered in the given chunk sizes; returns
/// (opcode, sequence) per frame.
fn decode_chunked(stream: &[u8], chunks: &[usize]) -> Vec<(u8, Sequence)> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    let mut offset = 0;

    let mut feed = |buf: &mut BytesMut, frames: &mut Vec<(u8, Sequence)>| {
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push((frame.opcode(), frame.sequence()));
        }
    };

    for &size in chunks {
        let end = (offset + size).min(stream.len());
        buf.extend_from_slice(&stream[offset..end]);
        offset = end;
        feed(&mut buf, &mut frames);
    }
    if offset < stream.len() {
        buf.extend_from_slice(&stream[offset..]);
        feed(&mut buf, &mut frames);
    }
    assert!(buf.is_empty(), "residual bytes after stream end");
    frames
}

fn sample_stream() -> Vec<u8> {
    let mut stream = Vec::new();
    stream.extend_from_slice(&LOGIN);
    stream.extend_from_slice(&short_frame(0x13, &[0x47, 0x06, 0x04, 0x00, 0x02], 0x0002));
    // garbage between frames
    stream.extend_from_slice(&[0x00, 0x42, 0x13]);
    stream.extend_from_slice(&short_frame(0x8A, &[], 0x0003));
    stream.extend_from_slice(&short_frame(0x9B, &[0x02, 0xBE, 0xEF], 0x0004));
    stream
}

#[test]
fn test_chunking_invariance() {
    let stream = sample_stream();
    let reference = decode_chunked(&stream, &[stream.len()]);
    assert_eq!(
        reference
            .iter()
            .map(|(op, _)| *op)
            .collect::<Vec<_>>(),
        vec![0x01, 0x13, 0x8A, 0x9B]
    );

    // byte-by-byte
    let trickle: Vec<usize> = std::iter::repeat(1).take(stream.len()).collect();
    // a few uneven chunkings, including the S4 split
    for chunks in [
        trickle.as_slice(),
        &[7, 6, 100][..],
        &[1, 2, 3, 5, 8, 13, 21, 34, 100][..],
        &[21, 1, 30, 2][..],
        &[4, 4, 4, 4, 4, 100][..],
    ] {
        assert_eq!(decode_chunked(&stream, chunks), reference);
    }
}

#[test]
fn test_s4_fragmented_login() {
    // Scenario S4: sizes 7, 6, rest; exactly one frame, empty residue.
    let frames = decode_chunked(&LOGIN, &[7, 6]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0], (0x01, Sequence(0x0001)));
}

#[test]
fn test_leading_garbage_resync() {
    let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x0D, 0x0A];
    stream.extend_from_slice(&LOGIN);
    let frames = decode_chunked(&stream, &[stream.len()]);
    assert_eq!(frames, vec![(0x01, Sequence(0x0001))]);
}

#[test]
fn test_garbage_starting_with_78_recovers() {
    // A stray 0x78 that is not a start marker must not wedge the decoder.
    let mut stream = vec![0x78, 0x00, 0x01, 0x02, 0x03, 0x04];
    stream.extend_from_slice(&LOGIN);
    let frames = decode_chunked(&stream, &[stream.len()]);
    assert_eq!(frames, vec![(0x01, Sequence(0x0001))]);
}

#[test]
fn test_crc_of_emitted_frames() {
    // Property 2: every emitted frame either carries a valid CRC or is the
    // known-corrupted fixture.
    let stream = sample_stream();
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&stream[..]);
    let mut seen = 0;
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        seen += 1;
        if frame.sequence() == Sequence(0x0001) {
            // the captured login fixture carries a stale CRC
            assert!(frame.verify_crc().is_err());
        } else {
            assert!(frame.verify_crc().is_ok());
        }
    }
    assert_eq!(seen, 4);
}

#[test]
fn test_oversize_frame_is_fatal() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&[0x79, 0x79, 0xFF, 0xFE, 0x22, 0x00, 0x00][..]);
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(err.is_connection_fatal());
}

#[test]
fn test_from_bytes_requires_exactly_one_frame() {
    assert!(RawFrame::from_bytes(&LOGIN).is_ok());

    let mut two = LOGIN.to_vec();
    two.extend_from_slice(&LOGIN);
    assert!(RawFrame::from_bytes(&two).is_err());
    assert!(RawFrame::from_bytes(&LOGIN[..10]).is_err());
}
