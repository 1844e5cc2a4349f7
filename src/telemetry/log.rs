use once_cell::sync::OnceCell;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static LOG_HANDLE: OnceCell<FilterHandle> = OnceCell::new();

const DEFAULT_DIRECTIVE: &str = "info";

/// Installs the global subscriber: env-filtered, stderr, runtime-reloadable
/// via the admin logging endpoint.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
	let (filter, handle) = reload::Layer::new(filter);
	let _ = LOG_HANDLE.set(handle);
	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_writer(std::io::stderr)
				.with_target(true),
		)
		.init();
}

pub fn get_current_loglevel() -> anyhow::Result<String> {
	let handle = LOG_HANDLE
		.get()
		.ok_or_else(|| anyhow::anyhow!("logging is not initialized"))?;
	Ok(handle.with_current(|f| f.to_string())?)
}

/// Changes the active filter. `reset` restores the default; otherwise the
/// value uses the standard env-filter directive syntax
/// (`level` or `target=level,...`).
pub fn set_level(reset: bool, level: &str) -> anyhow::Result<String> {
	let handle = LOG_HANDLE
		.get()
		.ok_or_else(|| anyhow::anyhow!("logging is not initialized"))?;
	let new_filter = if reset {
		EnvFilter::new(DEFAULT_DIRECTIVE)
	} else {
		EnvFilter::try_new(level)?
	};
	let repr = new_filter.to_string();
	handle.reload(new_filter)?;
	Ok(repr)
}
