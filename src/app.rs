use axum::Router;
use keygate_core::readiness::Ready;
use keygate_core::{drain, signal};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;

use crate::client::Client;
use crate::concurrency::AdaptiveLimits;
use crate::config::load_key_file;
use crate::keys::KeyManager;
use crate::management::admin::{self, AdminState};
use crate::pool::PoolManager;
use crate::proxy::{Admission, RequestHandler};
use crate::replay::ReplayQueue;
use crate::router::ModelRouter;
use crate::stats::StatsStore;
use crate::telemetry::metrics::Metrics;
use crate::trace::TraceStore;
use crate::*;

pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = Ready::new();
	let proxy_ready = ready.register_task("proxy listener");
	let admin_ready = ready.register_task("admin listener");

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(keygate_core::metrics::sub_registry(
		&mut registry,
	)));
	let registry = Arc::new(registry);

	let key_file = load_key_file(&config.keys_file, &config.base_url)?;
	let keys = Arc::new(KeyManager::new(config.keys.clone(), &key_file));
	let pool = Arc::new(PoolManager::new(config.pool.clone()));
	let limits = Arc::new(AdaptiveLimits::new(config.concurrency.clone()));
	let router = ModelRouter::new(config.routing.clone(), pool.clone(), limits.clone());
	let traces = Arc::new(TraceStore::new(config.traces.capacity));
	let replay = Arc::new(ReplayQueue::new(config.replay.clone()));
	let stats = Arc::new(StatsStore::new(config.stats.clone())?);
	stats.load(&keys)?;
	let upstream = Client::new(&config.client)?;
	let admission = Admission::new(config.handler.queue_size);

	let inputs = Arc::new(ProxyInputs {
		cfg: config.clone(),
		keys: keys.clone(),
		pool,
		limits: limits.clone(),
		router,
		traces,
		replay: replay.clone(),
		stats: stats.clone(),
		metrics,
		upstream,
		admission,
	});
	let handler = RequestHandler::new(inputs.clone());

	tokio::spawn(limits.run(drain_rx.clone()));
	tokio::spawn(replay.run_cleanup(drain_rx.clone()));
	tokio::spawn(stats.run_persist(keys.clone(), drain_rx.clone()));

	let proxy_listener = TcpListener::bind(config.listen_addr)
		.await
		.map_err(|e| anyhow::anyhow!("binding {}: {e}", config.listen_addr))?;
	info!(addr = %config.listen_addr, keys = keys.key_count(), "proxy listening");
	let h = handler.clone();
	let proxy_app = Router::new().fallback(move |req: axum::extract::Request| {
		let h = h.clone();
		async move { h.handle(req).await }
	});
	spawn_server("proxy", proxy_listener, proxy_app, drain_rx.clone());
	drop(proxy_ready);

	let admin_listener = TcpListener::bind(config.admin_addr)
		.await
		.map_err(|e| anyhow::anyhow!("binding {}: {e}", config.admin_addr))?;
	info!(addr = %config.admin_addr, "admin listening");
	let admin_app = admin::router(AdminState {
		inputs,
		handler,
		registry,
		ready: ready.clone(),
		shutdown: shutdown.trigger(),
	});
	spawn_server("admin", admin_listener, admin_app, drain_rx.clone());
	drop(admin_ready);

	Ok(Bound {
		shutdown,
		drain_tx,
		deadline: config.termination_deadline,
	})
}

/// Serves until a drain is signaled, then finishes open connections before
/// releasing its drain watcher.
fn spawn_server(name: &'static str, listener: TcpListener, app: Router, watcher: drain::DrainWatcher) {
	tokio::spawn(async move {
		let signal_watcher = watcher.clone();
		let signal = async move {
			let release = signal_watcher.wait_for_drain().await;
			debug!(server = name, "drain signaled");
			drop(release);
		};
		if let Err(e) = axum::serve(listener, app)
			.with_graceful_shutdown(signal)
			.await
		{
			error!(server = name, "server error: {e}");
		}
		// The watcher held here keeps the drain open until all connections
		// have finished.
		drop(watcher);
	});
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
	deadline: Duration,
}

impl Bound {
	/// Blocks until shutdown is requested, then drains in-flight work up to
	/// the termination deadline.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		info!("shutdown requested, draining");
		if tokio::time::timeout(
			self.deadline,
			self.drain_tx.start_drain_and_wait(drain::DrainMode::Graceful),
		)
		.await
		.is_err()
		{
			warn!(
				"drain deadline ({:?}) expired with connections still open",
				self.deadline
			);
		}
		Ok(())
	}
}
