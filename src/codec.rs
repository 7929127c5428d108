//! Wire framer and codec for the length-prefixed binary+JSON protocol.
//!
//! Each frame on the wire is laid out as
//!
//! ```text
//! [length: 4, LE i32][timestamp: 8, LE unix millis][opCode: 1][cmdCode: 1][payload: JSON]
//! ```
//!
//! where `length` counts every byte after itself. A [`Packer`] owns one
//! connection's inbound accumulator: raw reads are appended with
//! [`Packer::add`], complete frames are decoded into [`Request`]s and queued
//! FIFO, and partial frames are held across reads. The encoder side,
//! [`Packer::pack_data`], is stateless.
//!
//! A malformed payload consumes its frame and surfaces an error without
//! stalling frames buffered behind it. Corrupt framing (a zero, negative, or
//! oversized length prefix) is unrecoverable: the stream has lost sync and
//! the error is fatal to the connection.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    message::{CmdCode, OpCode, Payload},
    request::Request,
};

/// Size of the length prefix preceding each frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed header bytes inside a frame body: timestamp + opCode + cmdCode.
pub const FRAME_HEADER_SIZE: usize = 8 + 1 + 1;

/// Maximum accepted frame body length (16 MiB), bounding buffer growth.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Errors produced while decoding or encoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The length prefix was zero or negative; the stream has lost framing.
    #[error("invalid frame length prefix {0}")]
    InvalidLength(i32),
    /// The length prefix exceeded [`MAX_FRAME_LENGTH`].
    #[error("frame length {size} exceeds maximum {max}")]
    OversizedFrame { size: usize, max: usize },
    /// A frame body was too short to hold the fixed header.
    #[error("frame of {0} bytes is too short for the header")]
    TruncatedHeader(usize),
    /// The JSON payload failed to serialize or deserialize.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the error leaves the byte stream unsynchronized.
    ///
    /// Fatal errors mean subsequent bytes can no longer be framed and the
    /// connection should be torn down; non-fatal errors poisoned a single
    /// frame that has already been consumed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidLength(_) | Self::OversizedFrame { .. }
        )
    }
}

/// Per-connection frame reassembler and decoder.
#[derive(Default)]
pub struct Packer {
    buffer: BytesMut,
    decoded: VecDeque<Request>,
    /// Body length of the frame currently being reassembled, once its
    /// prefix has been read and stripped from `buffer`.
    pending_len: Option<usize>,
}

impl Packer {
    /// Create an empty packer.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append raw bytes and decode every frame that is now complete.
    ///
    /// Decoded requests are queued for retrieval via [`next`](Self::next).
    /// Decoding continues past a malformed frame so one poisoned frame never
    /// delays frames buffered behind it; the first error encountered is
    /// returned after the buffer has been drained.
    ///
    /// # Errors
    ///
    /// Returns the first [`CodecError`] hit while draining. Check
    /// [`CodecError::is_fatal`] to decide whether the connection must close.
    pub fn add(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if data.is_empty() {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);

        let mut first_err = None;
        loop {
            let frame_len = match self.pending_len {
                Some(len) => len,
                None => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        break;
                    }
                    let mut prefix = &self.buffer[..LENGTH_PREFIX_SIZE];
                    let raw = prefix.get_i32_le();
                    if raw <= 0 {
                        return Err(CodecError::InvalidLength(raw));
                    }
                    let len = raw as usize;
                    if len > MAX_FRAME_LENGTH {
                        return Err(CodecError::OversizedFrame {
                            size: len,
                            max: MAX_FRAME_LENGTH,
                        });
                    }
                    self.buffer.advance(LENGTH_PREFIX_SIZE);
                    self.pending_len = Some(len);
                    len
                }
            };

            if self.buffer.len() < frame_len {
                break;
            }
            let frame = self.buffer.split_to(frame_len);
            self.pending_len = None;
            match decode_frame(&frame) {
                Ok(request) => self.decoded.push_back(request),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Whether at least one decoded request is queued.
    #[must_use]
    pub fn done(&self) -> bool { !self.decoded.is_empty() }

    /// Pop the oldest decoded request, if any.
    pub fn next(&mut self) -> Option<Request> { self.decoded.pop_front() }

    /// Encode a payload into its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] if the payload fails to serialize and
    /// [`CodecError::OversizedFrame`] if the body would not fit the length
    /// prefix.
    pub fn pack_data(
        send_time: DateTime<Utc>,
        op_code: OpCode,
        cmd_code: CmdCode,
        payload: &Payload,
    ) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(payload)?;
        let body_len = FRAME_HEADER_SIZE + json.len();
        if body_len > MAX_FRAME_LENGTH {
            return Err(CodecError::OversizedFrame {
                size: body_len,
                max: MAX_FRAME_LENGTH,
            });
        }
        let total = i32::try_from(body_len).map_err(|_| CodecError::OversizedFrame {
            size: body_len,
            max: MAX_FRAME_LENGTH,
        })?;

        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
        out.put_i32_le(total);
        out.put_i64_le(send_time.timestamp_millis());
        out.put_u8(op_code);
        out.put_u8(cmd_code);
        out.extend_from_slice(&json);
        Ok(out.to_vec())
    }
}

fn decode_frame(frame: &[u8]) -> Result<Request, CodecError> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::TruncatedHeader(frame.len()));
    }
    let mut cursor = frame;
    let uid = cursor.get_i64_le();
    let op_code = cursor.get_u8();
    let cmd_code = cursor.get_u8();
    let data: Payload = serde_json::from_slice(cursor)?;
    Ok(Request::from_wire(uid, op_code, cmd_code, data))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn sample_payload() -> Payload {
        Payload::from([(0, json!("123")), (1, json!(321))])
    }

    #[test]
    fn round_trips_a_packed_frame() {
        let payload = sample_payload();
        let bytes = Packer::pack_data(Utc::now(), 2, 98, &payload).expect("pack");

        let mut packer = Packer::new();
        packer.add(&bytes).expect("add");
        assert!(packer.done());

        let request = packer.next().expect("request");
        assert_eq!(request.op_code(), 2);
        assert_eq!(request.cmd_code(), 98);
        assert_eq!(request.get_str(0), Some("123"));
        assert_eq!(request.get_i64(1), Some(321));
        assert!(!packer.done());
    }

    #[test]
    fn single_byte_feed_matches_single_call() {
        let bytes = Packer::pack_data(Utc::now(), 7, 1, &sample_payload()).expect("pack");

        let mut packer = Packer::new();
        for byte in &bytes {
            packer.add(std::slice::from_ref(byte)).expect("add");
        }

        let request = packer.next().expect("request");
        assert_eq!(request.op_code(), 7);
        assert_eq!(request.get_str(0), Some("123"));
    }

    #[test]
    fn concatenated_frames_decode_in_fifo_order() {
        let mut stream = Vec::new();
        for cmd in 0..5u8 {
            let payload = Payload::from([(0, json!(i64::from(cmd)))]);
            stream.extend(Packer::pack_data(Utc::now(), 1, cmd, &payload).expect("pack"));
        }

        let mut packer = Packer::new();
        packer.add(&stream).expect("add");
        for cmd in 0..5u8 {
            let request = packer.next().expect("request");
            assert_eq!(request.cmd_code(), cmd);
            assert_eq!(request.get_i64(0), Some(i64::from(cmd)));
        }
        assert!(packer.next().is_none());
    }

    #[rstest]
    #[case(0)]
    #[case(-1)]
    #[case(-1024)]
    fn non_positive_length_prefix_fails_fast(#[case] len: i32) {
        let mut packer = Packer::new();
        let err = packer.add(&len.to_le_bytes()).expect_err("must fail");
        assert!(matches!(err, CodecError::InvalidLength(l) if l == len));
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_length_prefix_fails_fast() {
        let raw = i32::try_from(MAX_FRAME_LENGTH + 1).expect("fits i32");
        let mut packer = Packer::new();
        let err = packer.add(&raw.to_le_bytes()).expect_err("must fail");
        assert!(matches!(err, CodecError::OversizedFrame { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_payload_is_consumed_without_stalling() {
        // Hand-build a frame whose payload is not valid JSON.
        let mut poisoned = BytesMut::new();
        let body = b"not-json";
        let total = i32::try_from(FRAME_HEADER_SIZE + body.len()).expect("fits");
        poisoned.put_i32_le(total);
        poisoned.put_i64_le(0);
        poisoned.put_u8(9);
        poisoned.put_u8(9);
        poisoned.extend_from_slice(body);

        let good = Packer::pack_data(Utc::now(), 3, 4, &sample_payload()).expect("pack");

        let mut stream = poisoned.to_vec();
        stream.extend(good);

        let mut packer = Packer::new();
        let err = packer.add(&stream).expect_err("poisoned frame surfaces");
        assert!(matches!(err, CodecError::Payload(_)));
        assert!(!err.is_fatal());

        // The frame behind the poisoned one still decoded.
        let request = packer.next().expect("good frame");
        assert_eq!(request.op_code(), 3);
        assert_eq!(request.cmd_code(), 4);
        assert!(packer.next().is_none());
    }

    #[test]
    fn undersized_body_is_a_truncated_header() {
        let mut stream = BytesMut::new();
        stream.put_i32_le(4);
        stream.extend_from_slice(&[0, 0, 0, 0]);

        let mut packer = Packer::new();
        let err = packer.add(&stream).expect_err("truncated");
        assert!(matches!(err, CodecError::TruncatedHeader(4)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn empty_add_is_a_no_op() {
        let mut packer = Packer::new();
        packer.add(&[]).expect("empty add");
        assert!(!packer.done());
    }

    #[test]
    fn timestamp_survives_the_round_trip() {
        let sent = Utc::now();
        let bytes = Packer::pack_data(sent, 1, 1, &Payload::new()).expect("pack");

        let mut packer = Packer::new();
        packer.add(&bytes).expect("add");
        let request = packer.next().expect("request");
        assert_eq!(request.uid(), sent.timestamp_millis());
    }

    proptest! {
        #[test]
        fn chunked_feed_matches_single_feed(chunk_len in 1usize..16) {
            let mut stream = Vec::new();
            for cmd in 0..3u8 {
                let payload = Payload::from([(0, json!(i64::from(cmd))), (7, json!("x"))]);
                stream.extend(
                    Packer::pack_data(Utc::now(), 2, cmd, &payload).expect("pack"),
                );
            }

            let mut packer = Packer::new();
            for chunk in stream.chunks(chunk_len) {
                packer.add(chunk).expect("add");
            }

            for cmd in 0..3u8 {
                let request = packer.next().expect("request");
                prop_assert_eq!(request.cmd_code(), cmd);
                prop_assert_eq!(request.get_i64(0), Some(i64::from(cmd)));
            }
            prop_assert!(packer.next().is_none());
        }
    }
}
