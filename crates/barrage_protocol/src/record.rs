#![forbid(unsafe_code)]

//! Hand-rolled decoder for the viewer-join wire record.
//!
//! The join event is the one push command with no JSON form: its payload is
//! a dense protobuf-style record. Only a handful of fields matter, so the
//! record is walked manually instead of pulling in a schema compiler.
//! Decoding is total: any structural anomaly ends the walk and the
//! defaults stand in for whatever was not recovered.

/// Fields recovered from a viewer-join record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerRecord {
	pub uid: u64,
	pub display_name: String,
	/// Interaction subtype (1 = join, 2 = follow, higher = other).
	pub event_subtype: u32,
	pub timestamp: u64,
	pub avatar_url: Option<String>,
}

impl Default for ViewerRecord {
	fn default() -> Self {
		Self {
			uid: 0,
			display_name: String::new(),
			event_subtype: 1,
			timestamp: 0,
			avatar_url: None,
		}
	}
}

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

struct Walker<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> Walker<'a> {
	fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	fn byte(&mut self) -> Option<u8> {
		let b = *self.data.get(self.pos)?;
		self.pos += 1;
		Some(b)
	}

	fn varint(&mut self) -> Option<u64> {
		let mut value = 0u64;
		let mut shift = 0u32;
		loop {
			let byte = self.byte()?;
			if shift < 64 {
				value |= u64::from(byte & 0x7F) << shift;
			}
			if byte & 0x80 == 0 {
				return Some(value);
			}
			shift += 7;
			if shift > 70 {
				// Runaway continuation bits; give up on this field.
				return None;
			}
		}
	}

	fn take(&mut self, len: usize) -> Option<&'a [u8]> {
		let end = self.pos.checked_add(len)?;
		if end > self.data.len() {
			return None;
		}
		let span = &self.data[self.pos..end];
		self.pos = end;
		Some(span)
	}
}

/// Decode a viewer-join record. Never fails: whatever cannot be recovered
/// keeps its default.
pub fn decode(data: &[u8]) -> ViewerRecord {
	let mut record = ViewerRecord::default();
	let mut nested_name: Option<String> = None;
	let mut nested_avatar: Option<String> = None;

	let mut w = Walker::new(data);
	loop {
		let Some(tag) = w.byte() else { break };
		let field = tag >> 3;
		let wire = tag & 0x07;

		match wire {
			WIRE_VARINT => {
				let Some(value) = w.varint() else { break };
				match field {
					1 => record.uid = value,
					5 => record.event_subtype = value as u32,
					6 => record.timestamp = value,
					_ => {}
				}
			}
			WIRE_FIXED64 => {
				if w.take(8).is_none() {
					break;
				}
			}
			WIRE_LEN => {
				let Some(len) = w.varint() else { break };
				let Some(span) = w.take(len as usize) else { break };
				match field {
					2 => {
						if let Ok(s) = core::str::from_utf8(span) {
							record.display_name = s.to_string();
						}
					}
					3 => {
						let (name, avatar) = decode_user_info(span);
						nested_name = name.or(nested_name);
						nested_avatar = avatar.or(nested_avatar);
					}
					4 => {
						if let Ok(s) = core::str::from_utf8(span) {
							record.avatar_url = Some(s.to_string());
						}
					}
					_ => {}
				}
			}
			WIRE_FIXED32 => {
				if w.take(4).is_none() {
					break;
				}
			}
			// Groups and reserved wire types carry no length; stop here.
			_ => break,
		}
	}

	if record.display_name.is_empty()
		&& let Some(name) = nested_name
	{
		record.display_name = name;
	}
	if record.avatar_url.is_none() {
		record.avatar_url = nested_avatar;
	}

	record
}

/// Nested user-info message: `{1: avatar, 2: name}`.
fn decode_user_info(data: &[u8]) -> (Option<String>, Option<String>) {
	let mut name = None;
	let mut avatar = None;

	let mut w = Walker::new(data);
	loop {
		let Some(tag) = w.byte() else { break };
		let field = tag >> 3;
		let wire = tag & 0x07;

		match wire {
			WIRE_VARINT => {
				if w.varint().is_none() {
					break;
				}
			}
			WIRE_FIXED64 => {
				if w.take(8).is_none() {
					break;
				}
			}
			WIRE_LEN => {
				let Some(len) = w.varint() else { break };
				let Some(span) = w.take(len as usize) else { break };
				if let Ok(s) = core::str::from_utf8(span) {
					match field {
						1 => avatar = Some(s.to_string()),
						2 => name = Some(s.to_string()),
						_ => {}
					}
				}
			}
			WIRE_FIXED32 => {
				if w.take(4).is_none() {
					break;
				}
			}
			_ => break,
		}
	}

	(name, avatar)
}
