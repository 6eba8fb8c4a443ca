// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

use std::{
	collections::VecDeque,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};

use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use serde_json::Value;
use tidedb_query::{
	QueryRequest, TransportError,
	transport::{ByteStream, QueryTransport},
};

/// One step of a scripted response stream.
#[derive(Debug, Clone)]
pub enum ScriptedChunk {
	/// Deliver these bytes as one transport chunk.
	Bytes(Vec<u8>),
	/// Deliver a transport failure.
	Error(TransportError),
	/// Wait before producing the next item.
	Delay(Duration),
}

/// A scripted response: the chunk sequence returned for one request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
	chunks: Vec<ScriptedChunk>,
}

impl ScriptedResponse {
	pub fn new() -> Self {
		Self::default()
	}

	/// Script a whole document as a single chunk.
	pub fn document(doc: impl Into<Vec<u8>>) -> Self {
		Self::new().chunk(doc)
	}

	/// Script a document split at the given byte offset.
	pub fn split_document(doc: &str, at: usize) -> Self {
		let bytes = doc.as_bytes();
		Self::new().chunk(bytes[..at].to_vec()).chunk(bytes[at..].to_vec())
	}

	pub fn chunk(mut self, bytes: impl Into<Vec<u8>>) -> Self {
		self.chunks.push(ScriptedChunk::Bytes(bytes.into()));
		self
	}

	pub fn error(mut self, error: TransportError) -> Self {
		self.chunks.push(ScriptedChunk::Error(error));
		self
	}

	pub fn delay(mut self, duration: Duration) -> Self {
		self.chunks.push(ScriptedChunk::Delay(duration));
		self
	}
}

/// Decrements the open-stream count when a response stream is dropped,
/// whether it was consumed to completion or abandoned mid-flight.
struct OpenStream(Arc<AtomicUsize>);

impl Drop for OpenStream {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

/// A scripted in-memory transport.
///
/// Responses are served in FIFO order, one per `send`. Every request body
/// is captured for assertions. Sending with an empty script yields a
/// closed-connection error.
pub struct MockTransport {
	script: Mutex<VecDeque<ScriptedResponse>>,
	requests: Mutex<Vec<Value>>,
	open_streams: Arc<AtomicUsize>,
}

impl MockTransport {
	pub fn new() -> Self {
		Self {
			script: Mutex::new(VecDeque::new()),
			requests: Mutex::new(Vec::new()),
			open_streams: Arc::new(AtomicUsize::new(0)),
		}
	}

	/// Queue a scripted response.
	pub fn enqueue(&self, response: ScriptedResponse) {
		self.script.lock().push_back(response);
	}

	/// Queue a whole document delivered as one chunk.
	pub fn enqueue_document(&self, doc: &str) {
		self.enqueue(ScriptedResponse::document(doc.as_bytes().to_vec()));
	}

	/// Queue a document delivered as the given chunks.
	pub fn enqueue_chunks(&self, chunks: Vec<Vec<u8>>) {
		let mut response = ScriptedResponse::new();
		for chunk in chunks {
			response = response.chunk(chunk);
		}
		self.enqueue(response);
	}

	/// The captured request bodies, in send order.
	pub fn requests(&self) -> Vec<Value> {
		self.requests.lock().clone()
	}

	pub fn request_count(&self) -> usize {
		self.requests.lock().len()
	}

	/// Number of response streams handed out and not yet dropped.
	pub fn open_streams(&self) -> usize {
		self.open_streams.load(Ordering::SeqCst)
	}
}

impl Default for MockTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl QueryTransport for MockTransport {
	fn send(&self, request: QueryRequest) -> ByteStream {
		self.requests.lock().push(request.body().clone());
		let response = self.script.lock().pop_front();
		let Some(response) = response else {
			return stream::iter([Err::<Vec<u8>, _>(TransportError::Closed)]).boxed();
		};

		self.open_streams.fetch_add(1, Ordering::SeqCst);
		let guard = OpenStream(self.open_streams.clone());
		let queue: VecDeque<ScriptedChunk> = response.chunks.into();
		stream::unfold((queue, guard), |(mut queue, guard)| async move {
			loop {
				match queue.pop_front() {
					Some(ScriptedChunk::Delay(duration)) => {
						tokio::time::sleep(duration).await;
					}
					Some(ScriptedChunk::Bytes(bytes)) => {
						return Some((Ok(bytes), (queue, guard)));
					}
					Some(ScriptedChunk::Error(error)) => {
						return Some((Err(error), (queue, guard)));
					}
					None => return None,
				}
			}
		})
		.boxed()
	}
}
