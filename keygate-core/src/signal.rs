use tokio::sync::mpsc;
use tracing::info;

/// Waits for a shutdown request, whichever arrives first: a termination
/// signal from the OS, or an explicit trigger (the admin API's shutdown
/// endpoint).
pub struct Shutdown {
	tx: mpsc::Sender<()>,
	rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.tx.clone(),
		}
	}

	pub async fn wait(mut self) {
		tokio::select! {
			_ = termination_signal() => {},
			_ = self.rx.recv() => info!("shutdown requested over the admin API"),
		}
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[cfg(unix)]
async fn termination_signal() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
	let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
	tokio::select! {
		_ = term.recv() => info!("received SIGTERM, shutting down"),
		_ = int.recv() => info!("received SIGINT, shutting down"),
	}
}

#[cfg(not(unix))]
async fn termination_signal() {
	if tokio::signal::ctrl_c().await.is_ok() {
		info!("received ctrl-c, shutting down");
	}
}
