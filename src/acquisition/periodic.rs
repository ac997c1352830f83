//-----------------------------------------------------------------------------
// Module periodic
// Periodic acquisition task
// Reads the signals round robin and sleeps the remainder of the interval, failures are logged and do not stop the loop

use std::sync::Arc;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::catalog::SignalId;

pub(super) struct PeriodicTask {
    ids: Vec<SignalId>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub(super) fn start(inner: Arc<Inner>, ids: Vec<SignalId>, interval: Duration) -> PeriodicTask {
        inner.set_monitored(&ids, true);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(periodic_loop(inner, ids.clone(), interval, cancel.clone()));
        PeriodicTask { ids, cancel, handle }
    }

    pub(super) fn cancel(&self) {
        self.cancel.cancel();
    }

    // A read in progress is completed before the loop observes the cancellation
    pub(super) async fn stop(self, inner: &Inner) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Periodic task failed: {}", e);
        }
        inner.set_monitored(&self.ids, false);
    }
}

async fn periodic_loop(inner: Arc<Inner>, ids: Vec<SignalId>, interval: Duration, cancel: CancellationToken) {
    info!("Start periodic acquisition of {} signals, interval = {}ms", ids.len(), interval.as_millis());
    let mut rounds: u64 = 0;
    let mut failures: u64 = 0;

    'outer: loop {
        let start = Instant::now();
        for id in &ids {
            if cancel.is_cancelled() {
                break 'outer;
            }
            if let Err(e) = inner.read_once(*id).await {
                failures += 1;
                warn!("Periodic read of signal {} failed: {}", id, e);
            }
        }
        rounds += 1;

        let elapsed = start.elapsed();
        if elapsed > interval {
            trace!("Periodic round {} took {}ms, interval {}ms", rounds, elapsed.as_millis(), interval.as_millis());
        }
        tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            _ = tokio::time::sleep_until(start + interval) => {}
        }
    }

    info!("Stop periodic acquisition after {} rounds, {} failed reads", rounds, failures);
}
