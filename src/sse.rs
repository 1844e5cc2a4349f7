use bytes::Bytes;
use futures_util::Stream;

use crate::http::Body;
use crate::*;

/// Terminal state of a forwarded stream.
#[derive(Debug, Clone)]
pub struct StreamEnd {
	pub success: bool,
	pub error: Option<String>,
	pub client_disconnect: bool,
	pub bytes_forwarded: u64,
}

type EndCallback = Box<dyn FnOnce(StreamEnd) + Send>;

/// Forwards upstream bytes as they arrive, never re-framing event
/// boundaries. A mid-stream upstream error is surfaced to the client as a
/// final SSE error event followed by end-of-stream; dropping the body before
/// completion reports a client disconnect.
pub struct ObservedStream {
	inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
	on_end: Option<EndCallback>,
	pending: Option<Bytes>,
	bytes_forwarded: u64,
	done: bool,
}

pub fn observed_body(
	upstream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
	on_end: impl FnOnce(StreamEnd) + Send + 'static,
) -> Body {
	Body::from_stream(ObservedStream {
		inner: Box::pin(upstream),
		on_end: Some(Box::new(on_end)),
		pending: None,
		bytes_forwarded: 0,
		done: false,
	})
}

fn error_event(message: &str) -> Bytes {
	let data = serde_json::json!({
		"type": "error",
		"error": { "type": "upstream_error", "message": message },
	});
	Bytes::from(format!("event: error\ndata: {data}\n\n"))
}

impl ObservedStream {
	fn finish(&mut self, end: StreamEnd) {
		self.done = true;
		if let Some(cb) = self.on_end.take() {
			cb(end);
		}
	}
}

impl Stream for ObservedStream {
	type Item = Result<Bytes, std::convert::Infallible>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();
		if let Some(event) = this.pending.take() {
			return Poll::Ready(Some(Ok(event)));
		}
		if this.done {
			return Poll::Ready(None);
		}
		match ready!(this.inner.as_mut().poll_next(cx)) {
			Some(Ok(chunk)) => {
				this.bytes_forwarded += chunk.len() as u64;
				Poll::Ready(Some(Ok(chunk)))
			},
			Some(Err(e)) => {
				let message = e.to_string();
				warn!(error = %message, "upstream stream failed mid-flight");
				this.finish(StreamEnd {
					success: false,
					error: Some(message.clone()),
					client_disconnect: false,
					bytes_forwarded: this.bytes_forwarded,
				});
				// Truncated stream: one final error event, then end.
				Poll::Ready(Some(Ok(error_event(&message))))
			},
			None => {
				this.finish(StreamEnd {
					success: true,
					error: None,
					client_disconnect: false,
					bytes_forwarded: this.bytes_forwarded,
				});
				Poll::Ready(None)
			},
		}
	}
}

impl Drop for ObservedStream {
	fn drop(&mut self) {
		if self.on_end.is_some() {
			let bytes_forwarded = self.bytes_forwarded;
			self.finish(StreamEnd {
				success: false,
				error: None,
				client_disconnect: true,
				bytes_forwarded,
			});
		}
	}
}
