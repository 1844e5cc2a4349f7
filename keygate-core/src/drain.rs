use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
	Immediate,
	Graceful,
}

/// Creates a drain pair. The trigger starts a drain and waits for it to
/// finish; the watcher side is cloned into everything that should hold the
/// process open. The drain is complete once every watcher, and every blocker
/// returned from `wait_for_drain`, has been dropped.
///
/// A single watch channel carries both directions: the announced mode flows
/// trigger→watchers through the value, and completion flows back through
/// channel closure once no receivers remain.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (tx, rx) = watch::channel(None);
	(DrainTrigger { tx }, DrainWatcher { rx })
}

#[derive(Debug)]
pub struct DrainTrigger {
	tx: watch::Sender<Option<DrainMode>>,
}

impl DrainTrigger {
	/// Announces the drain to all watchers, then waits until the last one
	/// lets go of its handle.
	pub async fn start_drain_and_wait(self, mode: DrainMode) {
		let _ = self.tx.send(Some(mode));
		self.tx.closed().await;
	}
}

#[derive(Debug, Clone)]
pub struct DrainWatcher {
	rx: watch::Receiver<Option<DrainMode>>,
}

impl DrainWatcher {
	/// Resolves once a drain has been announced. The returned blocker keeps
	/// the drain open; drop it when the caller's shutdown work is done.
	pub async fn wait_for_drain(mut self) -> DrainBlocker {
		let mode = match self.rx.wait_for(Option::is_some).await {
			Ok(state) => (*state).unwrap_or(DrainMode::Immediate),
			// The trigger disappeared without announcing anything.
			Err(_) => DrainMode::Immediate,
		};
		DrainBlocker { _rx: self.rx, mode }
	}
}

/// Holds the drain open on behalf of in-flight shutdown work.
#[must_use = "dropping the blocker is what completes the drain"]
#[derive(Debug)]
pub struct DrainBlocker {
	_rx: watch::Receiver<Option<DrainMode>>,
	mode: DrainMode,
}

impl DrainBlocker {
	pub fn mode(&self) -> DrainMode {
		self.mode
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn drain_waits_for_watchers() {
		let (tx, rx) = new();
		let rx2 = rx.clone();
		let task = tokio::spawn(async move {
			let blocker = rx2.wait_for_drain().await;
			assert_eq!(blocker.mode(), DrainMode::Graceful);
			drop(blocker);
		});
		drop(rx);
		tx.start_drain_and_wait(DrainMode::Graceful).await;
		task.await.unwrap();
	}

	#[tokio::test]
	async fn dropped_trigger_reads_as_immediate() {
		let (tx, rx) = new();
		drop(tx);
		let blocker = rx.wait_for_drain().await;
		assert_eq!(blocker.mode(), DrainMode::Immediate);
	}
}
