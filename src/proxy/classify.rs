use std::error::Error as StdError;

use serde::Serialize;

use crate::http::StatusCode;

/// Classification of a failed attempt, decided at the dispatch boundary.
/// Each kind carries its own retry / circuit / cooldown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Timeout,
	SocketHangup,
	ConnectionAborted,
	BrokenPipe,
	StreamPrematureClose,
	ConnectionRefused,
	DnsError,
	TlsError,
	HttpParseError,
	ServerError,
	RateLimitedKey,
	RateLimitedAccount,
	AuthError,
	ClientError,
	ClientDisconnect,
}

impl ErrorKind {
	pub fn is_retriable(&self) -> bool {
		!matches!(
			self,
			ErrorKind::AuthError | ErrorKind::ClientError | ErrorKind::ClientDisconnect
		)
	}

	/// Only transport and server failures feed the circuit breaker; 429s and
	/// auth failures have dedicated handling.
	pub fn opens_circuit(&self) -> bool {
		matches!(
			self,
			ErrorKind::Timeout
				| ErrorKind::SocketHangup
				| ErrorKind::ConnectionAborted
				| ErrorKind::BrokenPipe
				| ErrorKind::StreamPrematureClose
				| ErrorKind::ConnectionRefused
				| ErrorKind::DnsError
				| ErrorKind::TlsError
				| ErrorKind::HttpParseError
				| ErrorKind::ServerError
		)
	}

	pub fn cools_key(&self) -> bool {
		matches!(self, ErrorKind::RateLimitedKey | ErrorKind::RateLimitedAccount)
	}

	pub fn cools_pool(&self) -> bool {
		matches!(self, ErrorKind::RateLimitedAccount)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::Timeout => "timeout",
			ErrorKind::SocketHangup => "socket_hangup",
			ErrorKind::ConnectionAborted => "connection_aborted",
			ErrorKind::BrokenPipe => "broken_pipe",
			ErrorKind::StreamPrematureClose => "stream_premature_close",
			ErrorKind::ConnectionRefused => "connection_refused",
			ErrorKind::DnsError => "dns_error",
			ErrorKind::TlsError => "tls_error",
			ErrorKind::HttpParseError => "http_parse_error",
			ErrorKind::ServerError => "server_error",
			ErrorKind::RateLimitedKey => "rate_limited",
			ErrorKind::RateLimitedAccount => "rate_limited_account",
			ErrorKind::AuthError => "auth_error",
			ErrorKind::ClientError => "client_error",
			ErrorKind::ClientDisconnect => "client_disconnect",
		}
	}
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Classifies a non-success upstream status. `account_scope` is the result of
/// the configured scope predicate applied to the response headers.
pub fn classify_status(status: StatusCode, account_scope: bool) -> Option<ErrorKind> {
	if status.is_success() || status.is_informational() || status.is_redirection() {
		return None;
	}
	Some(match status.as_u16() {
		429 if account_scope => ErrorKind::RateLimitedAccount,
		429 => ErrorKind::RateLimitedKey,
		401 | 403 => ErrorKind::AuthError,
		s if (400..500).contains(&s) => ErrorKind::ClientError,
		_ => ErrorKind::ServerError,
	})
}

/// Maps a transport-level dispatch error onto the taxonomy by walking the
/// error source chain for io error kinds.
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
	if err.is_timeout() {
		return ErrorKind::Timeout;
	}
	if let Some(io) = find_io_error(err) {
		match io.kind() {
			std::io::ErrorKind::ConnectionRefused => return ErrorKind::ConnectionRefused,
			std::io::ErrorKind::ConnectionAborted => return ErrorKind::ConnectionAborted,
			std::io::ErrorKind::ConnectionReset => return ErrorKind::SocketHangup,
			std::io::ErrorKind::BrokenPipe => return ErrorKind::BrokenPipe,
			std::io::ErrorKind::UnexpectedEof => return ErrorKind::StreamPrematureClose,
			std::io::ErrorKind::TimedOut => return ErrorKind::Timeout,
			std::io::ErrorKind::InvalidData => return ErrorKind::TlsError,
			_ => {},
		}
	}
	let chain = error_chain(err);
	if err.is_connect() {
		if chain.contains("dns") || chain.contains("resolve") {
			return ErrorKind::DnsError;
		}
		if chain.contains("tls") || chain.contains("certificate") {
			return ErrorKind::TlsError;
		}
		return ErrorKind::ConnectionRefused;
	}
	if err.is_body() || err.is_decode() {
		return ErrorKind::StreamPrematureClose;
	}
	if chain.contains("parse") || chain.contains("invalid http") {
		return ErrorKind::HttpParseError;
	}
	ErrorKind::SocketHangup
}

fn find_io_error(err: &dyn StdError) -> Option<&std::io::Error> {
	let mut source = err.source();
	while let Some(e) = source {
		if let Some(io) = e.downcast_ref::<std::io::Error>() {
			return Some(io);
		}
		source = e.source();
	}
	None
}

fn error_chain(err: &dyn StdError) -> String {
	let mut out = err.to_string();
	let mut source = err.source();
	while let Some(e) = source {
		out.push_str(": ");
		out.push_str(&e.to_string());
		source = e.source();
	}
	out.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_classification_matrix() {
		assert_eq!(classify_status(StatusCode::OK, false), None);
		assert_eq!(
			classify_status(StatusCode::TOO_MANY_REQUESTS, false),
			Some(ErrorKind::RateLimitedKey)
		);
		assert_eq!(
			classify_status(StatusCode::TOO_MANY_REQUESTS, true),
			Some(ErrorKind::RateLimitedAccount)
		);
		assert_eq!(
			classify_status(StatusCode::UNAUTHORIZED, false),
			Some(ErrorKind::AuthError)
		);
		assert_eq!(
			classify_status(StatusCode::FORBIDDEN, false),
			Some(ErrorKind::AuthError)
		);
		assert_eq!(
			classify_status(StatusCode::BAD_REQUEST, false),
			Some(ErrorKind::ClientError)
		);
		assert_eq!(
			classify_status(StatusCode::BAD_GATEWAY, false),
			Some(ErrorKind::ServerError)
		);
	}

	#[test]
	fn retry_and_circuit_policies() {
		assert!(ErrorKind::Timeout.is_retriable());
		assert!(ErrorKind::Timeout.opens_circuit());
		assert!(!ErrorKind::Timeout.cools_key());

		assert!(ErrorKind::RateLimitedKey.is_retriable());
		assert!(!ErrorKind::RateLimitedKey.opens_circuit());
		assert!(ErrorKind::RateLimitedKey.cools_key());
		assert!(!ErrorKind::RateLimitedKey.cools_pool());

		assert!(ErrorKind::RateLimitedAccount.cools_pool());

		assert!(!ErrorKind::AuthError.is_retriable());
		assert!(!ErrorKind::AuthError.opens_circuit());
		assert!(!ErrorKind::ClientError.is_retriable());
		assert!(!ErrorKind::ClientDisconnect.is_retriable());
		assert!(!ErrorKind::ClientDisconnect.opens_circuit());
	}
}
