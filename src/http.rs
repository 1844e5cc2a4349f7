pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};

pub mod x_headers {
	use http::HeaderName;

	pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
	pub const X_RATELIMIT_SCOPE: HeaderName = HeaderName::from_static("x-ratelimit-scope");
	pub const X_MODEL_OVERRIDE: HeaderName = HeaderName::from_static("x-model-override");
	pub const X_TENANT_ID: HeaderName = HeaderName::from_static("x-tenant-id");
	pub const X_TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");
	pub const X_ADMIN_TOKEN: HeaderName = HeaderName::from_static("x-admin-token");
}

#[derive(Debug)]
pub enum WellKnownContentTypes {
	Json,
	Sse,
	Unknown,
}

pub fn classify_content_type(h: &HeaderMap) -> WellKnownContentTypes {
	if let Some(content_type) = h.get(header::CONTENT_TYPE)
		&& let Ok(s) = content_type.to_str()
	{
		let essence = s.split(';').next().unwrap_or(s).trim();
		match essence {
			"application/json" => return WellKnownContentTypes::Json,
			"text/event-stream" => return WellKnownContentTypes::Sse,
			_ => {},
		}
	}
	WellKnownContentTypes::Unknown
}

/// Whether a response should be forwarded as a stream rather than buffered.
pub fn is_streaming_response(h: &HeaderMap) -> bool {
	if matches!(classify_content_type(h), WellKnownContentTypes::Sse) {
		return true;
	}
	h.get(header::TRANSFER_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.contains("chunked"))
		.unwrap_or(false)
}

// Hop-by-hop headers, removed when forwarding to the backend (RFC 7230).
pub static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn content_type_classification() {
		let mut h = HeaderMap::new();
		h.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("text/event-stream; charset=utf-8"),
		);
		assert!(is_streaming_response(&h));
		h.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		assert!(!is_streaming_response(&h));
		h.insert(
			header::TRANSFER_ENCODING,
			HeaderValue::from_static("chunked"),
		);
		assert!(is_streaming_response(&h));
	}
}
