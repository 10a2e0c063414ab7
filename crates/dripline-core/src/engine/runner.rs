//! Fixed-interval driver for the execution loop.
//!
//! There is no continuous event loop reacting to individual triggers: a
//! single periodic timer invokes one tick, and a slow tick simply delays
//! the next one (ticks from one runner never overlap; overlapping *runners*
//! are handled by the claim protocol in the store).

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::repository::enrollment::EnrollmentRepository;
use crate::repository::flow::FlowRepository;
use crate::repository::subject::SubjectRepository;

use super::executor::FlowEngine;

/// Spawn the periodic tick task. Cancel the token to stop it; an in-flight
/// tick runs to completion rather than being interrupted mid-step.
pub fn spawn<F, E, S>(
    engine: Arc<FlowEngine<F, E, S>>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    F: FlowRepository + 'static,
    E: EnrollmentRepository + 'static,
    S: SubjectRepository + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(engine.config().poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_secs = engine.config().poll_interval.as_secs(),
            batch_limit = engine.config().batch_limit,
            "engine runner started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("engine runner stopped");
                    break;
                }
                _ = interval.tick() => {
                    let started = std::time::Instant::now();
                    let summary = engine.tick(Utc::now()).await;
                    tracing::debug!(
                        triggered = summary.triggered,
                        processed = summary.processed,
                        completed = summary.completed,
                        waiting = summary.waiting,
                        failed = summary.failed,
                        retrying = summary.retrying,
                        skipped = summary.skipped,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "tick complete"
                    );
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
