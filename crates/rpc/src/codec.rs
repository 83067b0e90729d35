//! Streaming msgpack codec for msgpack-rpc messages.
//!
//! Frames are plain msgpack values concatenated on the stream. A
//! [`FrameScanner`] walks the headers of the buffered bytes and remembers how
//! far it got, so a frame split over many reads is scanned once and only
//! decoded when its last byte has arrived.

use bytes::{Buf, BytesMut};
use rmpv::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;
use crate::{Error, Result};

/// Never valid as the first byte of a msgpack value.
const RESERVED_MARKER: u8 = 0xc1;

/// Incremental decoder and encoder for [`Message`]s.
#[derive(Debug)]
pub struct MessageCodec {
	buf: BytesMut,
	scan: FrameScanner,
	strict_utf8: bool,
	poisoned: bool,
}

impl Default for MessageCodec {
	fn default() -> Self {
		Self::new(true)
	}
}

impl MessageCodec {
	/// Creates a codec; `strict_utf8` rejects strings that are not valid UTF-8.
	#[must_use]
	pub fn new(strict_utf8: bool) -> Self {
		Self {
			buf: BytesMut::new(),
			scan: FrameScanner::default(),
			strict_utf8,
			poisoned: false,
		}
	}

	/// Appends received bytes to the internal buffer.
	pub fn feed(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Number of buffered bytes not yet decoded.
	#[must_use]
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Iterates over every complete message currently buffered.
	///
	/// Stops at a partial frame; calling `drain` again after more bytes are
	/// fed resumes where it stopped.
	pub fn drain(&mut self) -> Drain<'_> {
		Drain { codec: self }
	}

	/// Decodes the next complete message, if any.
	///
	/// Returns `Some(Err(Error::Malformed(_)))` for a well-formed msgpack value
	/// that is not a message; that frame is consumed and decoding may
	/// continue. A `Decode` error poisons the codec.
	pub fn next_message(&mut self) -> Option<Result<Message>> {
		let value = match self.next_value() {
			Ok(Some(value)) => value,
			Ok(None) => return None,
			Err(err) => return Some(Err(err)),
		};
		Some(Message::from_value(value).map_err(Error::from))
	}

	fn next_value(&mut self) -> Result<Option<Value>> {
		if self.poisoned {
			return Err(Error::Decode("stream is desynchronised after a malformed frame".into()));
		}
		let end = match self.scan.frame_end(&self.buf) {
			Ok(Some(end)) => end,
			Ok(None) => return Ok(None),
			Err(err) => {
				self.poisoned = true;
				return Err(err);
			}
		};

		let mut rd: &[u8] = &self.buf[..end];
		let decoded = rmpv::decode::read_value(&mut rd);
		self.buf.advance(end);
		let value = match decoded {
			Ok(value) => value,
			Err(err) => {
				self.poisoned = true;
				return Err(Error::Decode(err.to_string()));
			}
		};
		if self.strict_utf8 && has_invalid_utf8(&value) {
			self.poisoned = true;
			return Err(Error::Decode("string is not valid UTF-8".into()));
		}
		Ok(Some(value))
	}

	/// Encodes a message into a fresh buffer.
	///
	/// # Errors
	///
	/// Returns [`Error::Serialize`] if the value tree cannot be written.
	pub fn encode(&self, message: Message) -> Result<Vec<u8>> {
		let value = message.into_value();
		let mut out = Vec::with_capacity(64);
		rmpv::encode::write_value(&mut out, &value).map_err(|e| Error::Serialize(e.to_string()))?;
		Ok(out)
	}
}

/// Resumable walk over msgpack headers that finds where a frame ends.
///
/// Payloads of strings, binaries and extensions are skipped by length, so
/// the work per frame is linear in its header count no matter how the bytes
/// are split across reads.
#[derive(Debug, Default)]
struct FrameScanner {
	/// Offset of the next header to read, relative to the buffer start.
	pos: usize,
	/// Elements still missing from each open array or map, innermost last.
	open: Vec<u64>,
}

/// One msgpack header: its encoded size including any payload, and how many
/// child values follow it.
struct Item {
	size: usize,
	children: u64,
}

impl FrameScanner {
	/// Returns the length of the first complete frame in `buf`, or `None`
	/// until all of it has arrived.
	///
	/// `buf` must only grow between calls until a frame is returned.
	fn frame_end(&mut self, buf: &[u8]) -> Result<Option<usize>> {
		loop {
			let Some(item) = item_at(&buf[self.pos..])? else {
				return Ok(None);
			};
			self.pos += item.size;
			if item.children > 0 {
				self.open.push(item.children);
				continue;
			}
			loop {
				match self.open.last_mut() {
					None => {
						let end = self.pos;
						self.pos = 0;
						return Ok(Some(end));
					}
					Some(left) => {
						*left -= 1;
						if *left > 0 {
							break;
						}
						self.open.pop();
					}
				}
			}
		}
	}
}

/// Reads the header at the start of `buf`; `None` if it or its payload is
/// incomplete.
fn item_at(buf: &[u8]) -> Result<Option<Item>> {
	let Some(&marker) = buf.first() else {
		return Ok(None);
	};
	let fixed = |size: usize| -> Result<Option<Item>> { Ok(Some(Item { size, children: 0 })) };
	// `head` bytes of header ending in a `width`-byte length; `extra` is the ext type byte.
	let sized = |head: usize, width: usize, extra: usize, per_len: u64| -> Result<Option<Item>> {
		let Some(len) = be_len(buf, 1, width) else {
			return Ok(None);
		};
		if per_len > 0 {
			return Ok(Some(Item {
				size: head,
				children: len * per_len,
			}));
		}
		let size = usize::try_from(len)
			.ok()
			.and_then(|len| (head + extra).checked_add(len))
			.ok_or_else(|| Error::Decode(format!("frame length {len} does not fit in memory")))?;
		Ok((buf.len() >= size).then_some(Item { size, children: 0 }))
	};
	let item = match marker {
		0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => fixed(1),
		0x80..=0x8f => Ok(Some(Item {
			size: 1,
			children: u64::from(marker & 0x0f) * 2,
		})),
		0x90..=0x9f => Ok(Some(Item {
			size: 1,
			children: u64::from(marker & 0x0f),
		})),
		0xa0..=0xbf => {
			let size = 1 + usize::from(marker & 0x1f);
			Ok((buf.len() >= size).then_some(Item { size, children: 0 }))
		}
		RESERVED_MARKER => Err(Error::Decode("reserved marker 0xc1".into())),
		0xc4 | 0xd9 => sized(2, 1, 0, 0),
		0xc5 | 0xda => sized(3, 2, 0, 0),
		0xc6 | 0xdb => sized(5, 4, 0, 0),
		0xc7 => sized(2, 1, 1, 0),
		0xc8 => sized(3, 2, 1, 0),
		0xc9 => sized(5, 4, 1, 0),
		0xca => fixed(5),
		0xcb => fixed(9),
		0xcc | 0xd0 => fixed(2),
		0xcd | 0xd1 => fixed(3),
		0xce | 0xd2 => fixed(5),
		0xcf | 0xd3 => fixed(9),
		0xd4 => fixed(3),
		0xd5 => fixed(4),
		0xd6 => fixed(6),
		0xd7 => fixed(10),
		0xd8 => fixed(18),
		0xdc => sized(3, 2, 0, 1),
		0xdd => sized(5, 4, 0, 1),
		0xde => sized(3, 2, 0, 2),
		0xdf => sized(5, 4, 0, 2),
	}?;
	Ok(item.filter(|item| buf.len() >= item.size))
}

/// Big-endian unsigned integer of `width` bytes at `offset`.
fn be_len(buf: &[u8], offset: usize, width: usize) -> Option<u64> {
	let bytes = buf.get(offset..offset + width)?;
	Some(bytes.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b)))
}

fn has_invalid_utf8(value: &Value) -> bool {
	match value {
		Value::String(s) => !s.is_str(),
		Value::Array(items) => items.iter().any(has_invalid_utf8),
		Value::Map(entries) => entries.iter().any(|(k, v)| has_invalid_utf8(k) || has_invalid_utf8(v)),
		_ => false,
	}
}

/// Iterator returned by [`MessageCodec::drain`].
pub struct Drain<'a> {
	codec: &'a mut MessageCodec,
}

impl Iterator for Drain<'_> {
	type Item = Result<Message>;

	fn next(&mut self) -> Option<Self::Item> {
		self.codec.next_message()
	}
}

impl Decoder for MessageCodec {
	type Item = Message;
	type Error = Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
		if !src.is_empty() {
			self.buf.extend_from_slice(src);
			src.clear();
		}
		self.next_message().transpose()
	}
}

impl Encoder<Message> for MessageCodec {
	type Error = Error;

	fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
		let bytes = MessageCodec::encode(self, item)?;
		dst.extend_from_slice(&bytes);
		Ok(())
	}
}
