#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;
pub mod wire;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameCodec, FrameDecoder, FramingError, LENGTH_PREFIX_LEN};

/// ALPN identifier negotiated on the QUIC transport.
pub const ALPN_PROTOCOL: &[u8] = b"agora-v1";

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;
}
