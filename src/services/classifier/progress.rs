use crate::models::classify_types::DownloadProgress;
use std::sync::Arc;
use tokio::sync::watch;

/// `(current_step, total_steps, message)`
pub type ProgressCallback = Arc<dyn Fn(u32, u32, &str) + Send + Sync>;

/// Single writer for download progress. Every update replaces the published
/// snapshot and is mirrored to the optional callback.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<DownloadProgress>>,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(tx: Arc<watch::Sender<DownloadProgress>>, callback: Option<ProgressCallback>) -> Self {
        Self { tx, callback }
    }

    pub fn report(&self, current_step: u32, message: impl Into<String>) {
        self.publish(DownloadProgress::new(current_step, message));
    }

    /// New message at the current step.
    pub fn restate(&self, message: impl Into<String>, network_restored: bool) {
        let step = self.current().current_step;
        let mut snapshot = DownloadProgress::new(step, message);
        snapshot.network_restored = network_restored;
        self.publish(snapshot);
    }

    pub fn current(&self) -> DownloadProgress {
        self.tx.borrow().clone()
    }

    fn publish(&self, snapshot: DownloadProgress) {
        if let Some(cb) = &self.callback {
            cb(snapshot.current_step, snapshot.total_steps, &snapshot.message);
        }
        self.tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn updates_reach_callback_and_subscribers() {
        let (tx, rx) = watch::channel(DownloadProgress::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(
            Arc::new(tx),
            Some(Arc::new(move |step, total, msg: &str| {
                sink.lock().unwrap().push((step, total, msg.to_string()));
            })),
        );

        reporter.report(1, "Species model ready ✓");
        reporter.restate("✓ Connection restored. Resuming download...", true);

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.current_step, 1);
        assert!(snapshot.network_restored);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                (1, 3, "Species model ready ✓".to_string()),
                (1, 3, "✓ Connection restored. Resuming download...".to_string()),
            ]
        );
    }
}
