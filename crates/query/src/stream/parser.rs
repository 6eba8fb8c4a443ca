// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! Resumable parser for chunked response documents.
//!
//! The query service streams one JSON object whose members are produced as
//! execution progresses: a `results` array, an `errors` array, and scalar
//! or record metadata fields, in no guaranteed document order. Transport
//! chunk boundaries carry no relationship to JSON value boundaries, so the
//! parser keeps explicit state (capture buffer, nesting depth, string and
//! escape flags) across [`feed`](ResponseParser::feed) calls and emits an
//! event for every completed row, error entry, or metadata field.
//!
//! Framing is tracked by hand; completed value bytes are handed to
//! `serde_json` for decoding. Unrecognised top-level fields are skipped.
//! A parser instance serves exactly one response and is not restartable.

use serde_json::Value;

use crate::{
	error::ParseError,
	stream::{MetadataFragment, QueryStatus, ResponseEvent, ServerError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	/// Before the opening `{` of the document.
	Start,
	/// Inside the top-level object, expecting a key or `}`.
	MemberStart,
	/// Reading the characters of a member key.
	Key,
	/// After a key, expecting `:`.
	Colon,
	/// After `:` of a non-list member, expecting the value's first byte.
	ValueStart,
	/// After `:` of `results`/`errors`, expecting `[`.
	ArrayStart,
	/// Inside a list, expecting an element's first byte or `]`.
	ElementStart,
	/// Accumulating the bytes of one value.
	Capture,
	/// After a list element, expecting `,` or `]`.
	ElementEnd,
	/// After a member value, expecting `,` or `}`.
	MemberEnd,
	/// The closing `}` was consumed; only whitespace may follow.
	Done,
}

/// Which top-level member the current value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
	Results,
	Errors,
	Field(FieldKind),
	Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
	RequestId,
	ClientContextId,
	Status,
	Signature,
	Metrics,
}

impl FieldKind {
	fn of(key: &str) -> Option<FieldKind> {
		match key {
			"requestID" => Some(FieldKind::RequestId),
			"clientContextID" => Some(FieldKind::ClientContextId),
			"status" => Some(FieldKind::Status),
			"signature" => Some(FieldKind::Signature),
			"metrics" => Some(FieldKind::Metrics),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureKind {
	/// An object or array; complete when nesting returns to zero.
	Container,
	/// A string; complete at the unescaped closing quote.
	Text,
	/// A number, boolean, or null; complete at the next delimiter.
	Bare,
}

enum Progress {
	Consumed,
	Complete {
		consumed: bool,
	},
}

/// Incremental decoder for one chunked response document.
pub struct ResponseParser {
	state: State,
	section: Section,
	capture: CaptureKind,
	key: Vec<u8>,
	buf: Vec<u8>,
	depth: usize,
	in_string: bool,
	escaped: bool,
	offset: u64,
	failed: bool,
}

impl ResponseParser {
	pub fn new() -> Self {
		Self {
			state: State::Start,
			section: Section::Ignored,
			capture: CaptureKind::Bare,
			key: Vec::new(),
			buf: Vec::new(),
			depth: 0,
			in_string: false,
			escaped: false,
			offset: 0,
			failed: false,
		}
	}

	/// Feed the next transport chunk, returning every event completed by
	/// it. Partial values are buffered and carried into the next feed.
	pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ResponseEvent>, ParseError> {
		if self.failed {
			return Err(ParseError::Aborted);
		}
		let mut events = Vec::new();
		let mut i = 0;
		while i < chunk.len() {
			match self.step(chunk[i], &mut events) {
				Ok(consumed) => {
					if consumed {
						i += 1;
						self.offset += 1;
					}
				}
				Err(error) => {
					self.failed = true;
					return Err(error);
				}
			}
		}
		Ok(events)
	}

	/// Signal end of the transport stream. Fails if the document did not
	/// complete.
	pub fn finish(&mut self) -> Result<(), ParseError> {
		if self.failed {
			return Err(ParseError::Aborted);
		}
		if self.state == State::Done {
			Ok(())
		} else {
			self.failed = true;
			Err(ParseError::Truncated)
		}
	}

	fn step(&mut self, byte: u8, events: &mut Vec<ResponseEvent>) -> Result<bool, ParseError> {
		match self.state {
			State::Start => match byte {
				b if is_ws(b) => Ok(true),
				b'{' => {
					self.state = State::MemberStart;
					Ok(true)
				}
				b => Err(self.unexpected(b)),
			},
			State::MemberStart => match byte {
				b if is_ws(b) => Ok(true),
				b'"' => {
					self.key.clear();
					self.state = State::Key;
					Ok(true)
				}
				b'}' => {
					self.state = State::Done;
					events.push(ResponseEvent::StreamEnd);
					Ok(true)
				}
				b => Err(self.unexpected(b)),
			},
			State::Key => {
				if self.escaped {
					self.key.push(byte);
					self.escaped = false;
				} else if byte == b'\\' {
					self.key.push(byte);
					self.escaped = true;
				} else if byte == b'"' {
					self.state = State::Colon;
				} else {
					self.key.push(byte);
				}
				Ok(true)
			}
			State::Colon => match byte {
				b if is_ws(b) => Ok(true),
				b':' => {
					self.route_key();
					Ok(true)
				}
				b => Err(self.unexpected(b)),
			},
			State::ArrayStart => match byte {
				b if is_ws(b) => Ok(true),
				b'[' => {
					self.state = State::ElementStart;
					Ok(true)
				}
				_ => Err(ParseError::ExpectedArray {
					field: self.key_string(),
				}),
			},
			State::ElementStart => match byte {
				b if is_ws(b) => Ok(true),
				b']' => {
					self.state = State::MemberEnd;
					Ok(true)
				}
				b => {
					self.begin_capture(b)?;
					Ok(true)
				}
			},
			State::ValueStart => match byte {
				b if is_ws(b) => Ok(true),
				b => {
					self.begin_capture(b)?;
					Ok(true)
				}
			},
			State::Capture => match self.capture_step(byte) {
				Progress::Consumed => Ok(true),
				Progress::Complete {
					consumed,
				} => {
					self.complete_capture(events)?;
					Ok(consumed)
				}
			},
			State::ElementEnd => match byte {
				b if is_ws(b) => Ok(true),
				b',' => {
					self.state = State::ElementStart;
					Ok(true)
				}
				b']' => {
					self.state = State::MemberEnd;
					Ok(true)
				}
				b => Err(self.unexpected(b)),
			},
			State::MemberEnd => match byte {
				b if is_ws(b) => Ok(true),
				b',' => {
					self.state = State::MemberStart;
					Ok(true)
				}
				b'}' => {
					self.state = State::Done;
					events.push(ResponseEvent::StreamEnd);
					Ok(true)
				}
				b => Err(self.unexpected(b)),
			},
			State::Done => {
				if is_ws(byte) {
					Ok(true)
				} else {
					Err(ParseError::TrailingData)
				}
			}
		}
	}

	fn route_key(&mut self) {
		let key = String::from_utf8_lossy(&self.key);
		self.section = match key.as_ref() {
			"results" => Section::Results,
			"errors" => Section::Errors,
			other => FieldKind::of(other).map(Section::Field).unwrap_or(Section::Ignored),
		};
		self.state = match self.section {
			Section::Results | Section::Errors => State::ArrayStart,
			_ => State::ValueStart,
		};
	}

	fn begin_capture(&mut self, byte: u8) -> Result<(), ParseError> {
		self.buf.clear();
		self.depth = 0;
		self.in_string = false;
		self.escaped = false;
		self.capture = match byte {
			b'{' | b'[' => {
				self.depth = 1;
				CaptureKind::Container
			}
			b'"' => {
				self.in_string = true;
				CaptureKind::Text
			}
			b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => CaptureKind::Bare,
			b => return Err(self.unexpected(b)),
		};
		self.buf.push(byte);
		self.state = State::Capture;
		Ok(())
	}

	fn capture_step(&mut self, byte: u8) -> Progress {
		match self.capture {
			CaptureKind::Container => {
				self.buf.push(byte);
				if self.in_string {
					if self.escaped {
						self.escaped = false;
					} else if byte == b'\\' {
						self.escaped = true;
					} else if byte == b'"' {
						self.in_string = false;
					}
				} else {
					match byte {
						b'"' => self.in_string = true,
						b'{' | b'[' => self.depth += 1,
						b'}' | b']' => {
							self.depth -= 1;
							if self.depth == 0 {
								return Progress::Complete {
									consumed: true,
								};
							}
						}
						_ => {}
					}
				}
				Progress::Consumed
			}
			CaptureKind::Text => {
				self.buf.push(byte);
				if self.escaped {
					self.escaped = false;
				} else if byte == b'\\' {
					self.escaped = true;
				} else if byte == b'"' {
					return Progress::Complete {
						consumed: true,
					};
				}
				Progress::Consumed
			}
			CaptureKind::Bare => {
				if is_ws(byte) || matches!(byte, b',' | b'}' | b']') {
					Progress::Complete {
						consumed: false,
					}
				} else {
					self.buf.push(byte);
					Progress::Consumed
				}
			}
		}
	}

	fn complete_capture(&mut self, events: &mut Vec<ResponseEvent>) -> Result<(), ParseError> {
		match self.section {
			Section::Results => {
				events.push(ResponseEvent::Row(self.decode_value()?));
				self.state = State::ElementEnd;
			}
			Section::Errors => {
				events.push(ResponseEvent::Error(ServerError::new(self.decode_value()?)));
				self.state = State::ElementEnd;
			}
			Section::Field(kind) => {
				let value = self.decode_value()?;
				if let Some(fragment) = self.fragment_for(kind, value)? {
					events.push(ResponseEvent::Metadata(fragment));
				}
				self.state = State::MemberEnd;
			}
			Section::Ignored => {
				// Skipped, but still required to be well-formed.
				self.decode_value()?;
				self.state = State::MemberEnd;
			}
		}
		self.buf.clear();
		Ok(())
	}

	fn decode_value(&self) -> Result<Value, ParseError> {
		serde_json::from_slice(&self.buf).map_err(|error| ParseError::InvalidValue {
			field: self.key_string(),
			reason: error.to_string(),
		})
	}

	fn fragment_for(&self, kind: FieldKind, value: Value) -> Result<Option<MetadataFragment>, ParseError> {
		let mut fragment = MetadataFragment::default();
		match (kind, value) {
			(_, Value::Null) => return Ok(None),
			(FieldKind::RequestId, Value::String(id)) => fragment.request_id = Some(id),
			(FieldKind::ClientContextId, Value::String(id)) => fragment.client_context_id = Some(id),
			(FieldKind::Status, Value::String(status)) => fragment.status = Some(QueryStatus::parse(&status)),
			(FieldKind::Signature, value) => fragment.signature = Some(value),
			(FieldKind::Metrics, value) => fragment.metrics = Some(value),
			(_, value) => {
				return Err(ParseError::InvalidValue {
					field: self.key_string(),
					reason: format!("unexpected {} value", value_type_name(&value)),
				});
			}
		}
		Ok(Some(fragment))
	}

	fn key_string(&self) -> String {
		String::from_utf8_lossy(&self.key).into_owned()
	}

	fn unexpected(&self, byte: u8) -> ParseError {
		ParseError::Unexpected {
			byte,
			offset: self.offset,
		}
	}
}

impl Default for ResponseParser {
	fn default() -> Self {
		Self::new()
	}
}

fn is_ws(byte: u8) -> bool {
	matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

fn value_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
