#![forbid(unsafe_code)]

use std::io::Read;

use bytes::BytesMut;
use flate2::read::ZlibDecoder;
use thiserror::Error;

use crate::framing::{Frame, FrameLimits, split_frames};

/// `protocol_version` values carried in the frame header.
///
/// 0 and 1 are uncompressed (1 is used for the 4-byte heartbeat-reply
/// counter); 2 is zlib; 3 is brotli. Anything else is passed through as
/// plain bytes for forward compatibility.
pub const VERSION_PLAIN: u16 = 0;
pub const VERSION_COUNTER: u16 = 1;
pub const VERSION_ZLIB: u16 = 2;
pub const VERSION_BROTLI: u16 = 3;

#[derive(Debug, Error)]
pub enum CompressError {
	#[error("zlib inflate failed: {0}")]
	Zlib(std::io::Error),

	#[error("brotli inflate failed ({brotli}); zlib fallback failed ({fallback})")]
	Brotli {
		brotli: std::io::Error,
		fallback: std::io::Error,
	},
}

fn inflate_zlib(body: &[u8]) -> Result<Vec<u8>, std::io::Error> {
	let mut out = Vec::with_capacity(body.len() * 4);
	ZlibDecoder::new(body).read_to_end(&mut out)?;
	Ok(out)
}

fn inflate_brotli(body: &[u8]) -> Result<Vec<u8>, std::io::Error> {
	let mut out = Vec::with_capacity(body.len() * 4);
	brotli::Decompressor::new(body, 4096).read_to_end(&mut out)?;
	Ok(out)
}

/// Decompress a frame body according to its `protocol_version`.
///
/// Brotli bodies fall back to zlib when brotli inflation fails; only when
/// both decoders reject the payload does the caller get an error (and drops
/// the frame).
pub fn decompress(protocol_version: u16, body: &[u8]) -> Result<Vec<u8>, CompressError> {
	match protocol_version {
		VERSION_ZLIB => inflate_zlib(body).map_err(CompressError::Zlib),
		VERSION_BROTLI => match inflate_brotli(body) {
			Ok(out) => Ok(out),
			Err(brotli_err) => inflate_zlib(body).map_err(|fallback| CompressError::Brotli {
				brotli: brotli_err,
				fallback,
			}),
		},
		_ => Ok(body.to_vec()),
	}
}

/// Expand a frame into the leaf frames it carries.
///
/// Compressed bodies hold a concatenation of further frames and are
/// re-split with the same splitter; that payload may nest, so expansion
/// recurses until only plain frames remain. Plain frames pass through as
/// themselves.
pub fn expand(frame: Frame, limits: &FrameLimits) -> Result<Vec<Frame>, CompressError> {
	match frame.header.protocol_version {
		VERSION_ZLIB | VERSION_BROTLI => {
			let inflated = decompress(frame.header.protocol_version, &frame.body)?;
			let mut buf = BytesMut::from(&inflated[..]);
			let report = split_frames(&mut buf, limits);

			let mut leaves = Vec::with_capacity(report.frames.len());
			for inner in report.frames {
				leaves.extend(expand(inner, limits)?);
			}
			Ok(leaves)
		}
		_ => Ok(vec![frame]),
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use flate2::Compression;
	use flate2::write::ZlibEncoder;
	use std::io::Write;

	use super::*;
	use crate::framing::{FrameHeader, HEADER_LEN, Operation, encode_frame};

	fn deflate(data: &[u8]) -> Vec<u8> {
		let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
		enc.write_all(data).unwrap();
		enc.finish().unwrap()
	}

	fn make_frame(protocol_version: u16, operation: Operation, body: &[u8]) -> Frame {
		Frame {
			header: FrameHeader {
				packet_length: (HEADER_LEN + body.len()) as u32,
				header_length: HEADER_LEN as u16,
				protocol_version,
				operation,
				sequence: 1,
			},
			body: Bytes::copy_from_slice(body),
		}
	}

	#[test]
	fn plain_versions_pass_through() {
		assert_eq!(decompress(VERSION_PLAIN, b"abc").unwrap(), b"abc");
		assert_eq!(decompress(VERSION_COUNTER, &[0, 0, 0, 42]).unwrap(), &[0, 0, 0, 42]);
		// Unrecognized versions are treated as plain.
		assert_eq!(decompress(9, b"xyz").unwrap(), b"xyz");
	}

	#[test]
	fn zlib_roundtrip() {
		let payload = br#"{"cmd":"SEND_GIFT"}"#;
		let compressed = deflate(payload);
		assert_eq!(decompress(VERSION_ZLIB, &compressed).unwrap(), payload);
	}

	#[test]
	fn brotli_falls_back_to_zlib() {
		// A zlib stream mislabeled as brotli still inflates via the fallback.
		let payload = b"mislabeled payload";
		let compressed = deflate(payload);
		assert_eq!(decompress(VERSION_BROTLI, &compressed).unwrap(), payload);
	}

	#[test]
	fn garbage_fails_both_decoders() {
		let err = decompress(VERSION_BROTLI, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap_err();
		assert!(matches!(err, CompressError::Brotli { .. }));
	}

	#[test]
	fn expand_unwraps_nested_frames() {
		let limits = FrameLimits::default();

		let mut inner = Vec::new();
		inner.extend_from_slice(&encode_frame(Operation::MessagePush, VERSION_PLAIN, 1, br#"{"cmd":"A"}"#));
		inner.extend_from_slice(&encode_frame(Operation::MessagePush, VERSION_PLAIN, 2, br#"{"cmd":"B"}"#));

		let outer = make_frame(VERSION_ZLIB, Operation::MessagePush, &deflate(&inner));
		let leaves = expand(outer, &limits).unwrap();

		assert_eq!(leaves.len(), 2);
		assert_eq!(&leaves[0].body[..], br#"{"cmd":"A"}"#);
		assert_eq!(&leaves[1].body[..], br#"{"cmd":"B"}"#);
		assert!(leaves.iter().all(|f| f.header.protocol_version == VERSION_PLAIN));
	}

	#[test]
	fn expand_keeps_plain_frames_intact() {
		let limits = FrameLimits::default();
		let frame = make_frame(VERSION_COUNTER, Operation::HeartbeatReply, &[0, 0, 0, 7]);
		let leaves = expand(frame.clone(), &limits).unwrap();
		assert_eq!(leaves, vec![frame]);
	}
}
