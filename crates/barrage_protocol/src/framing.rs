#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Wire header size in bytes. The header is big-endian:
/// `u32 packet_length, u16 header_length, u16 protocol_version,
/// u32 operation, u32 sequence`.
pub const HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("truncated header: need={need} have={have}")]
	TruncatedHeader {
		need: usize,
		have: usize,
	},
}

/// Frame operation codes.
///
/// The upstream protocol reserves more codes than it uses; anything outside
/// the named set round-trips through `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	/// Client handshake (legacy code; `Auth` carries the same payload).
	Handshake,
	HandshakeReply,
	Heartbeat,
	/// Server heartbeat reply; body is a 4-byte big-endian viewer count.
	HeartbeatReply,
	/// Server message push (JSON command envelope).
	MessagePush,
	/// Client auth/join packet (JSON body with uid/room/token).
	Auth,
	AuthReply,
	Unknown(u32),
}

impl Operation {
	pub fn from_u32(code: u32) -> Self {
		match code {
			0 => Operation::Handshake,
			1 => Operation::HandshakeReply,
			2 => Operation::Heartbeat,
			3 => Operation::HeartbeatReply,
			5 => Operation::MessagePush,
			7 => Operation::Auth,
			8 => Operation::AuthReply,
			other => Operation::Unknown(other),
		}
	}

	pub fn as_u32(self) -> u32 {
		match self {
			Operation::Handshake => 0,
			Operation::HandshakeReply => 1,
			Operation::Heartbeat => 2,
			Operation::HeartbeatReply => 3,
			Operation::MessagePush => 5,
			Operation::Auth => 7,
			Operation::AuthReply => 8,
			Operation::Unknown(code) => code,
		}
	}

	/// The server acknowledges the handshake on either the legacy reply
	/// code or the auth-reply alias.
	pub fn is_handshake_reply(self) -> bool {
		matches!(self, Operation::HandshakeReply | Operation::AuthReply)
	}
}

/// Heuristic sanity window for header validation.
///
/// The wire format has no framing delimiter, so a misaligned read can only
/// be detected by rejecting implausible headers. These bounds are observed
/// upstream behavior, not documented guarantees; treat them as
/// configuration, not invariants.
#[derive(Debug, Clone)]
pub struct FrameLimits {
	/// Largest plausible `packet_length`.
	pub max_packet_length: u32,
	/// Largest plausible operation code.
	pub max_operation: u32,
	/// How many bytes ahead to probe for a valid header after a rejection.
	pub resync_scan_window: usize,
	/// Consecutive failed probes tolerated before the rest of the buffer
	/// is discarded.
	pub max_resync_failures: u32,
}

impl Default for FrameLimits {
	fn default() -> Self {
		Self {
			max_packet_length: 10_000,
			max_operation: 1_000,
			resync_scan_window: 16,
			max_resync_failures: 5,
		}
	}
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
	pub packet_length: u32,
	pub header_length: u16,
	pub protocol_version: u16,
	pub operation: Operation,
	pub sequence: u32,
}

impl FrameHeader {
	/// Parse the leading 16 bytes of `data`.
	pub fn parse(data: &[u8]) -> Result<Self, FramingError> {
		if data.len() < HEADER_LEN {
			return Err(FramingError::TruncatedHeader {
				need: HEADER_LEN,
				have: data.len(),
			});
		}

		Ok(Self {
			packet_length: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
			header_length: u16::from_be_bytes([data[4], data[5]]),
			protocol_version: u16::from_be_bytes([data[6], data[7]]),
			operation: Operation::from_u32(u32::from_be_bytes([data[8], data[9], data[10], data[11]])),
			sequence: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
		})
	}

	pub fn encode(&self) -> [u8; HEADER_LEN] {
		let mut out = [0u8; HEADER_LEN];
		out[0..4].copy_from_slice(&self.packet_length.to_be_bytes());
		out[4..6].copy_from_slice(&self.header_length.to_be_bytes());
		out[6..8].copy_from_slice(&self.protocol_version.to_be_bytes());
		out[8..12].copy_from_slice(&self.operation.as_u32().to_be_bytes());
		out[12..16].copy_from_slice(&self.sequence.to_be_bytes());
		out
	}

	/// Whether this header is plausible under the sanity window.
	pub fn is_plausible(&self, limits: &FrameLimits) -> bool {
		(HEADER_LEN as u32..=limits.max_packet_length).contains(&self.packet_length)
			&& self.header_length == HEADER_LEN as u16
			&& self.operation.as_u32() <= limits.max_operation
	}

	pub fn body_len(&self) -> usize {
		(self.packet_length as usize).saturating_sub(HEADER_LEN)
	}
}

/// One decoded wire frame. The body may still be compressed; see
/// [`crate::compress::expand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub header: FrameHeader,
	pub body: Bytes,
}

/// Outcome of one splitter pass.
#[derive(Debug, Default)]
pub struct SplitReport {
	pub frames: Vec<Frame>,
	/// Garbage bytes stepped over while resynchronizing.
	pub skipped_bytes: usize,
	/// Bytes dropped because the resync failure budget ran out.
	pub discarded_bytes: usize,
}

impl SplitReport {
	pub fn lossy(&self) -> bool {
		self.skipped_bytes > 0 || self.discarded_bytes > 0
	}
}

/// Encode an outbound frame.
pub fn encode_frame(operation: Operation, protocol_version: u16, sequence: u32, body: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(HEADER_LEN + body.len());
	let header = FrameHeader {
		packet_length: (HEADER_LEN + body.len()) as u32,
		header_length: HEADER_LEN as u16,
		protocol_version,
		operation,
		sequence,
	};
	out.extend_from_slice(&header.encode());
	out.extend_from_slice(body);
	out
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, operation: Operation, protocol_version: u16, sequence: u32, body: &[u8]) {
	let header = FrameHeader {
		packet_length: (HEADER_LEN + body.len()) as u32,
		header_length: HEADER_LEN as u16,
		protocol_version,
		operation,
		sequence,
	};
	buf.reserve(HEADER_LEN + body.len());
	buf.put_slice(&header.encode());
	buf.put_slice(body);
}

/// Extract every complete frame from the front of `buf`.
///
/// Consumed bytes (frames, garbage, discards) are removed from the buffer;
/// an incomplete trailing frame (or a bare partial header) is retained
/// for the next read.
///
/// A rejected header triggers a byte-wise probe up to
/// `limits.resync_scan_window` positions ahead; when no plausible header
/// turns up the cursor advances one byte and a failure is counted. Hitting
/// `limits.max_resync_failures` discards the rest of the buffer: losing
/// data is preferred over burning CPU on a stream that no longer frames.
pub fn split_frames(buf: &mut BytesMut, limits: &FrameLimits) -> SplitReport {
	let mut report = SplitReport::default();
	let mut offset = 0usize;
	let mut failures = 0u32;

	loop {
		let remaining = buf.len() - offset;
		if remaining < HEADER_LEN {
			break;
		}

		let window = limits.resync_scan_window.min(remaining - HEADER_LEN);
		let mut found: Option<(usize, FrameHeader)> = None;
		for probe in 0..=window {
			match FrameHeader::parse(&buf[offset + probe..]) {
				Ok(header) if header.is_plausible(limits) => {
					found = Some((probe, header));
					break;
				}
				_ => {}
			}
		}

		let Some((probe, header)) = found else {
			offset += 1;
			report.skipped_bytes += 1;
			failures += 1;
			if failures >= limits.max_resync_failures {
				report.discarded_bytes = buf.len() - offset;
				offset = buf.len();
				break;
			}
			continue;
		};

		report.skipped_bytes += probe;
		offset += probe;

		let total = header.packet_length as usize;
		if buf.len() - offset < total {
			// Incomplete body; wait for more data.
			break;
		}

		let body = Bytes::copy_from_slice(&buf[offset + HEADER_LEN..offset + total]);
		report.frames.push(Frame { header, body });
		offset += total;
		failures = 0;
	}

	buf.advance(offset);
	report
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frame_bytes(operation: Operation, body: &[u8]) -> Vec<u8> {
		encode_frame(operation, 0, 1, body)
	}

	#[test]
	fn header_roundtrip() {
		let header = FrameHeader {
			packet_length: 532,
			header_length: 16,
			protocol_version: 2,
			operation: Operation::MessagePush,
			sequence: 7,
		};
		let parsed = FrameHeader::parse(&header.encode()).unwrap();
		assert_eq!(parsed, header);
	}

	#[test]
	fn parse_rejects_short_input() {
		let err = FrameHeader::parse(&[0u8; 7]).unwrap_err();
		match err {
			FramingError::TruncatedHeader { need, have } => {
				assert_eq!(need, HEADER_LEN);
				assert_eq!(have, 7);
			}
		}
	}

	#[test]
	fn unknown_operations_roundtrip() {
		for code in [4u32, 6, 9, 12, 700] {
			let op = Operation::from_u32(code);
			assert_eq!(op, Operation::Unknown(code));
			assert_eq!(op.as_u32(), code);
		}
		assert!(Operation::AuthReply.is_handshake_reply());
		assert!(Operation::HandshakeReply.is_handshake_reply());
		assert!(!Operation::Heartbeat.is_handshake_reply());
	}

	#[test]
	fn splits_concatenated_frames_and_keeps_partial_tail() {
		let limits = FrameLimits::default();
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&frame_bytes(Operation::HeartbeatReply, &42u32.to_be_bytes()));
		buf.extend_from_slice(&frame_bytes(Operation::MessagePush, br#"{"cmd":"DANMU_MSG"}"#));
		let partial = frame_bytes(Operation::MessagePush, b"tail-frame-body");
		buf.extend_from_slice(&partial[..10]);

		let report = split_frames(&mut buf, &limits);
		assert_eq!(report.frames.len(), 2);
		assert!(!report.lossy());
		assert_eq!(report.frames[0].header.operation, Operation::HeartbeatReply);
		assert_eq!(&report.frames[0].body[..], &42u32.to_be_bytes());
		assert_eq!(&report.frames[1].body[..], br#"{"cmd":"DANMU_MSG"}"#);

		// Partial tail stays buffered and completes on the next pass.
		assert_eq!(&buf[..], &partial[..10]);
		buf.extend_from_slice(&partial[10..]);
		let report = split_frames(&mut buf, &limits);
		assert_eq!(report.frames.len(), 1);
		assert_eq!(&report.frames[0].body[..], b"tail-frame-body");
		assert!(buf.is_empty());
	}

	#[test]
	fn resyncs_past_one_corrupted_byte() {
		let limits = FrameLimits::default();
		let mut buf = BytesMut::new();
		buf.put_u8(0xFF);
		buf.extend_from_slice(&frame_bytes(Operation::MessagePush, b"after-garbage"));

		let report = split_frames(&mut buf, &limits);
		assert_eq!(report.frames.len(), 1);
		assert_eq!(&report.frames[0].body[..], b"after-garbage");
		assert_eq!(report.skipped_bytes, 1);
		assert_eq!(report.discarded_bytes, 0);
		assert!(buf.is_empty());
	}

	#[test]
	fn discards_buffer_after_failure_budget() {
		let limits = FrameLimits {
			resync_scan_window: 4,
			max_resync_failures: 3,
			..FrameLimits::default()
		};
		// All 0xFF: no plausible header anywhere.
		let mut buf = BytesMut::from(&[0xFFu8; 64][..]);

		let report = split_frames(&mut buf, &limits);
		assert!(report.frames.is_empty());
		assert_eq!(report.skipped_bytes, 3);
		assert_eq!(report.discarded_bytes, 64 - 3);
		assert!(buf.is_empty());
	}

	#[test]
	fn bare_partial_header_is_retained() {
		let limits = FrameLimits::default();
		let mut buf = BytesMut::from(&[0u8; 10][..]);
		let report = split_frames(&mut buf, &limits);
		assert!(report.frames.is_empty());
		assert!(!report.lossy());
		assert_eq!(buf.len(), 10);
	}

	#[test]
	fn exact_single_frame_consumes_everything() {
		let limits = FrameLimits::default();
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&frame_bytes(Operation::Heartbeat, b""));
		let report = split_frames(&mut buf, &limits);
		assert_eq!(report.frames.len(), 1);
		assert!(report.frames[0].body.is_empty());
		assert!(buf.is_empty());
	}
}
