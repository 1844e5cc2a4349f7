use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::http::{HOP_HEADERS, HeaderMap, HeaderValue, Method, header};
use crate::proxy::classify::{ErrorKind, classify_transport};
use crate::*;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ClientConfig {
	#[serde(with = "serde_dur")]
	pub connect_timeout: Duration,
	pub pool_idle_per_host: usize,
	pub user_agent: String,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig {
			connect_timeout: Duration::from_secs(10),
			pool_idle_per_host: 32,
			user_agent: concat!("keygate/", env!("CARGO_PKG_VERSION")).to_string(),
		}
	}
}

/// One dispatch to the upstream: the (possibly rewritten) client request plus
/// the credential chosen for this attempt.
pub struct Call {
	pub method: Method,
	pub path_and_query: String,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub base_url: Strng,
	pub api_key: SecretString,
	pub timeout: Duration,
}

/// Thin wrapper over the shared reqwest client. The proxy is transparent to
/// everything except auth headers and the JSON body's model field (which the
/// handler rewrites before dispatch).
#[derive(Clone)]
pub struct Client {
	inner: reqwest::Client,
}

impl Client {
	pub fn new(cfg: &ClientConfig) -> anyhow::Result<Self> {
		let inner = reqwest::Client::builder()
			.connect_timeout(cfg.connect_timeout)
			.pool_max_idle_per_host(cfg.pool_idle_per_host)
			.user_agent(cfg.user_agent.clone())
			.build()?;
		Ok(Client { inner })
	}

	pub async fn call(&self, call: Call) -> Result<reqwest::Response, ErrorKind> {
		let url = format!(
			"{}{}",
			call.base_url.trim_end_matches('/'),
			call.path_and_query
		);
		let mut headers = call.headers;
		for h in HOP_HEADERS.iter() {
			headers.remove(h);
		}
		headers.remove(header::HOST);
		headers.remove(header::CONTENT_LENGTH);
		// The pool's credential replaces whatever the client sent.
		headers.remove(header::AUTHORIZATION);
		let mut api_key = HeaderValue::from_str(call.api_key.expose_secret())
			.map_err(|_| ErrorKind::AuthError)?;
		api_key.set_sensitive(true);
		headers.insert("x-api-key", api_key);
		if !headers.contains_key("anthropic-version") {
			headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
		}

		self
			.inner
			.request(call.method, url)
			.headers(headers)
			.body(call.body)
			.timeout(call.timeout)
			.send()
			.await
			.map_err(|e| {
				let kind = classify_transport(&e);
				debug!(error = %e, kind = %kind, "upstream dispatch failed");
				kind
			})
	}
}
