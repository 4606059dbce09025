#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size. Chat frames are small; anything larger is hostile.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Width of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

impl FramingError {
	/// A decode error leaves the stream aligned on the next frame; a size violation does not.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, FramingError::Decode(_))
	}
}

/// Length-prefixed protobuf codec with a fixed payload cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
	max_frame_size: usize,
}

impl Default for FrameCodec {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}

impl FrameCodec {
	pub const fn new(max_frame_size: usize) -> Self {
		Self { max_frame_size }
	}

	pub const fn max_frame_size(&self) -> usize {
		self.max_frame_size
	}

	fn check_len(&self, len: usize) -> Result<(), FramingError> {
		if len > self.max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len,
				max: self.max_frame_size,
			});
		}
		Ok(())
	}

	/// Encode `msg` as one frame.
	pub fn encode<M: Message>(&self, msg: &M) -> Result<Bytes, FramingError> {
		let mut buf = BytesMut::new();
		self.encode_into(msg, &mut buf)?;
		Ok(buf.freeze())
	}

	/// Append one encoded frame to `buf`.
	pub fn encode_into<M: Message>(&self, msg: &M, buf: &mut BytesMut) -> Result<(), FramingError> {
		let payload_len = msg.encoded_len();
		self.check_len(payload_len)?;

		buf.reserve(LENGTH_PREFIX_LEN + payload_len);
		buf.put_u32(payload_len as u32);
		msg.encode(buf)?;
		Ok(())
	}

	pub fn decoder(&self) -> FrameDecoder {
		FrameDecoder::new(*self)
	}
}

/// Incremental decoder fed from a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
	codec: FrameCodec,
	buf: BytesMut,
}

impl FrameDecoder {
	pub fn new(codec: FrameCodec) -> Self {
		Self {
			codec,
			buf: BytesMut::with_capacity(8 * 1024),
		}
	}

	/// Append bytes read from the transport.
	pub fn extend(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Bytes buffered but not yet consumed.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Pop the next complete frame.
	///
	/// `Ok(None)` means more bytes are needed. A payload that fails to decode is consumed before the
	/// error is returned, so the caller may skip it and keep going.
	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		if self.buf.len() < LENGTH_PREFIX_LEN {
			return Ok(None);
		}

		let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
		self.codec.check_len(len)?;

		if self.buf.len() < LENGTH_PREFIX_LEN + len {
			return Ok(None);
		}

		self.buf.advance(LENGTH_PREFIX_LEN);
		let payload = self.buf.split_to(len);
		let msg = M::decode(payload.freeze())?;
		Ok(Some(msg))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct Probe {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(int64, tag = "2")]
		n: i64,
	}

	#[test]
	fn frame_carries_big_endian_length_prefix() {
		let codec = FrameCodec::default();
		let frame = codec
			.encode(&Probe {
				s: "hi".to_string(),
				n: 1,
			})
			.expect("encode");

		let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
		assert_eq!(declared, frame.len() - LENGTH_PREFIX_LEN);
	}

	#[test]
	fn encode_rejects_oversized_payload() {
		let codec = FrameCodec::new(16);
		let err = codec
			.encode(&Probe {
				s: "a".repeat(100),
				n: 0,
			})
			.unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { len, max: 16 } if len > 16));
		assert!(!err.is_recoverable());
	}

	#[test]
	fn undecodable_payload_is_consumed() {
		let mut dec = FrameCodec::default().decoder();

		// Field 1 as a length-delimited string claiming 10 bytes, with only 1 present.
		let garbage = [0x0a, 0x0a, 0x41];
		dec.extend(&(garbage.len() as u32).to_be_bytes());
		dec.extend(&garbage);

		let good = Probe {
			s: "ok".to_string(),
			n: 5,
		};
		dec.extend(&FrameCodec::default().encode(&good).expect("encode"));

		let err = dec.next_frame::<Probe>().unwrap_err();
		assert!(err.is_recoverable());

		let next = dec.next_frame::<Probe>().expect("decode").expect("frame");
		assert_eq!(next, good);
		assert_eq!(dec.buffered(), 0);
	}

	#[test]
	fn zero_length_frame_decodes_to_default() {
		let mut dec = FrameCodec::default().decoder();
		dec.extend(&[0, 0, 0, 0]);
		let msg = dec.next_frame::<Probe>().expect("decode").expect("frame");
		assert_eq!(msg, Probe::default());
	}
}
