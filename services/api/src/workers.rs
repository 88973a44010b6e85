//! services/api/src/workers.rs
//!
//! Runs each lifecycle worker on its own periodic task until shutdown.

use crate::config::WorkerIntervals;
use goodnight_core::lifecycle::{LifecycleEngine, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl WorkerIntervals {
    pub fn period(&self, worker: Worker) -> Duration {
        match worker {
            Worker::TextGeneration => self.text_generation,
            Worker::ImageGeneration => self.image_generation,
            Worker::ImageFetch => self.image_fetch,
            Worker::StoryRequest => self.story_request,
        }
    }
}

/// Spawns one task per enabled worker. The tasks stop at the first tick boundary
/// after `token` is cancelled.
///
/// `StoryRequest` is only started when `auto_story_requests` is set.
pub fn spawn_workers(
    engine: Arc<LifecycleEngine>,
    intervals: &WorkerIntervals,
    auto_story_requests: bool,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    Worker::ALL
        .into_iter()
        .filter(|worker| auto_story_requests || *worker != Worker::StoryRequest)
        .map(|worker| {
            tokio::spawn(run_worker(
                engine.clone(),
                worker,
                intervals.period(worker),
                token.clone(),
            ))
        })
        .collect()
}

async fn run_worker(
    engine: Arc<LifecycleEngine>,
    worker: Worker,
    period: Duration,
    token: CancellationToken,
) {
    info!(%worker, ?period, "Worker started");
    let mut ticker = tokio::time::interval(period);
    // A slow tick pushes the next one back instead of firing a burst.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                // An in-flight tick always runs to completion; shutdown waits for it.
                let report = engine.run_tick(worker).await;
                if report.failed > 0 {
                    warn!(%worker, advanced = report.advanced, failed = report.failed, skipped = report.skipped, "Worker tick finished with failures");
                } else if report.advanced > 0 {
                    info!(%worker, advanced = report.advanced, skipped = report.skipped, "Worker tick finished");
                } else {
                    debug!(%worker, skipped = report.skipped, "Worker tick found nothing to do");
                }
            }
        }
    }

    info!(%worker, "Worker stopped");
}
