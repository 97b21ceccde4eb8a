//! Bounded worker pool.
//!
//! `size` tasks share the queue; each runs one job at a time, so at most
//! `size` jobs are ever `Running`. Workers exit when the queue's shutdown
//! token fires, after finishing the job in hand.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use rk_core::{Error, JobId};
use tokio::task::JoinHandle;

use super::handlers;
use super::JobContext;
use crate::context::EngineContext;
use crate::metrics::Op;

/// Spawn `size` workers pulling from `ctx.queue`.
pub fn spawn_workers(ctx: &EngineContext, size: usize) -> Vec<JoinHandle<()>> {
    tracing::info!(workers = size, "Starting worker pool");
    (0..size)
        .map(|worker| {
            let ctx = ctx.clone();
            tokio::spawn(async move { run_worker(worker, ctx).await })
        })
        .collect()
}

async fn run_worker(worker: usize, ctx: EngineContext) {
    tracing::debug!(worker, "Worker started");
    while let Some(id) = ctx.queue.next().await {
        run_job(&ctx, id).await;
    }
    tracing::debug!(worker, "Worker stopped");
}

/// Claim and run one attempt of job `id`, then hand the outcome back to the
/// queue.
async fn run_job(ctx: &EngineContext, id: JobId) {
    let Some(entry) = ctx.queue.claim(id).await else {
        return;
    };

    let job = JobContext::new(ctx.clone(), Arc::clone(&entry));
    tracing::debug!(job_id = %id, kind = %job.kind(), target = %job.target(), attempt = job.attempt(), "Running job");

    let outcome = {
        let _t = ctx.metrics.timer(Op::JobRun);
        match AssertUnwindSafe(handlers::run(&job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::Internal(format!(
                "job handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    };

    ctx.queue.finish(entry, outcome).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
