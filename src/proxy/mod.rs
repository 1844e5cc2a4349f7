pub mod classify;
pub mod handler;

use std::sync::atomic::{AtomicUsize, Ordering};

pub use classify::ErrorKind;
pub use handler::RequestHandler;
use tokio::sync::Semaphore;

use crate::http::{Body, HeaderValue, Response, StatusCode, header};
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no healthy key available")]
	NoHealthyKey,
	#[error("request body too large")]
	BodyTooLarge,
	#[error("request queue full")]
	QueueFull,
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(ErrorKind),
	#[error("replay entry not found")]
	ReplayNotFound,
	#[error("replay already in progress")]
	ReplayInProgress,
}

impl ProxyError {
	pub fn into_response(self) -> Response {
		let code = match &self {
			ProxyError::NoHealthyKey => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::UpstreamCallFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::ReplayNotFound => StatusCode::NOT_FOUND,
			ProxyError::ReplayInProgress => StatusCode::CONFLICT,
		};
		let body = serde_json::json!({
			"type": "error",
			"error": { "type": "api_error", "message": self.to_string() },
		});
		let mut rb = ::http::Response::builder()
			.status(code)
			.header(header::CONTENT_TYPE, "application/json");
		if matches!(self, ProxyError::QueueFull) {
			rb = rb.header(header::RETRY_AFTER, HeaderValue::from_static("1"));
		}
		rb.body(Body::from(body.to_string()))
			.expect("builder with known status code should not fail")
	}
}

/// Bounded admission between the HTTP front-end and the attempt loop. When
/// the queue is full new requests are rejected with 503 + Retry-After.
#[derive(Clone)]
pub struct Admission {
	semaphore: Arc<Semaphore>,
	depth: Arc<AtomicUsize>,
	capacity: usize,
}

#[derive(Debug)]
pub struct AdmissionPermit {
	_permit: tokio::sync::OwnedSemaphorePermit,
	depth: Arc<AtomicUsize>,
	pub queued_for: Duration,
}

impl Drop for AdmissionPermit {
	fn drop(&mut self) {
		self.depth.fetch_sub(1, Ordering::Relaxed);
	}
}

impl Admission {
	pub fn new(capacity: usize) -> Self {
		Admission {
			semaphore: Arc::new(Semaphore::new(capacity.max(1))),
			depth: Arc::new(AtomicUsize::new(0)),
			capacity: capacity.max(1),
		}
	}

	pub fn try_admit(&self) -> Result<AdmissionPermit, ProxyError> {
		let start = Instant::now();
		let permit = self
			.semaphore
			.clone()
			.try_acquire_owned()
			.map_err(|_| ProxyError::QueueFull)?;
		self.depth.fetch_add(1, Ordering::Relaxed);
		Ok(AdmissionPermit {
			_permit: permit,
			depth: self.depth.clone(),
			queued_for: start.elapsed(),
		})
	}

	pub fn depth(&self) -> usize {
		self.depth.load(Ordering::Relaxed)
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn admission_rejects_when_full() {
		let a = Admission::new(2);
		let p1 = a.try_admit().unwrap();
		let _p2 = a.try_admit().unwrap();
		assert_eq!(a.depth(), 2);
		assert_matches!(a.try_admit(), Err(ProxyError::QueueFull));
		drop(p1);
		assert_eq!(a.depth(), 1);
		assert!(a.try_admit().is_ok());
	}

	#[test]
	fn queue_full_response_has_retry_after() {
		let resp = ProxyError::QueueFull.into_response();
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert!(resp.headers().get(header::RETRY_AFTER).is_some());
	}
}
