//! Producer harness: fan a fixed number of sends out over worker tasks.

pub mod sender;

use harness_common::{
    validate_worker_count, BrokerTarget, CompletionBarrier, HarnessContext, HarnessError,
    MessageSpec, PayloadPool, WorkerResources,
};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stomp_client::{ClientError, MessageProducer, SessionMode, TextMessage};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// What a producer command did, logged as JSON when it finishes.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ProduceSummary {
    pub workers: usize,
    pub sent: usize,
    pub retries: usize,
    pub elapsed_ms: u128,
}

impl ProduceSummary {
    fn log(&self, command: &str) {
        match serde_json::to_string(self) {
            Ok(json) => info!("{command} finished: {json}"),
            Err(_) => info!("{command} finished: {self:?}"),
        }
    }
}

#[derive(Debug, Default)]
struct WorkerTally {
    sent: usize,
    retries: usize,
}

/// How long a worker waits before reopening a lost connection when no retry
/// backoff is configured.
pub const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

fn connection_gone(error: &ClientError) -> bool {
    matches!(error, ClientError::ConnectionLost(_) | ClientError::Io(_))
}

struct ProducerWorker {
    ctx: HarnessContext,
    target: BrokerTarget,
    resources: WorkerResources,
    producer: Box<dyn MessageProducer>,
}

impl ProducerWorker {
    async fn open(ctx: &HarnessContext, target: &BrokerTarget) -> Result<Self, HarnessError> {
        let resources = WorkerResources::open(ctx, None, SessionMode::AutoAcknowledge).await?;
        match resources.session.create_producer(&target.destination).await {
            Ok(producer) => Ok(ProducerWorker {
                ctx: ctx.clone(),
                target: target.clone(),
                resources,
                producer,
            }),
            Err(e) => {
                resources.release().await;
                Err(e.into())
            }
        }
    }

    /// Swap in a fresh connection, session and producer. On failure the old
    /// ones stay in place and the next send fails again.
    async fn reopen(&mut self) {
        match ProducerWorker::open(&self.ctx, &self.target).await {
            Ok(fresh) => {
                let stale = std::mem::replace(self, fresh);
                drop(stale.producer);
                stale.resources.release().await;
                info!("Reopened connection for {}", self.target.destination);
            }
            Err(e) => warn!("Failed to reopen connection: {e}"),
        }
    }

    /// Send until the broker accepts the message. Returns the number of failed
    /// attempts.
    async fn send_with_retry(&mut self, message: &TextMessage, backoff: Option<Duration>) -> usize {
        let mut failures = 0;
        loop {
            let error = match self.producer.send(message).await {
                Ok(()) => return failures,
                Err(e) => e,
            };
            failures += 1;
            warn!("Send failed (attempt {failures}), retrying: {error}");

            if connection_gone(&error) {
                tokio::time::sleep(backoff.unwrap_or(RECONNECT_PAUSE)).await;
                self.reopen().await;
                continue;
            }
            match backoff {
                Some(pause) => tokio::time::sleep(pause).await,
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Take send tasks off the shared counter until none are left.
    async fn run(
        mut self,
        spec: Arc<MessageSpec>,
        tickets: Arc<AtomicUsize>,
        barrier: CompletionBarrier,
        backoff: Option<Duration>,
    ) -> WorkerTally {
        let mut tally = WorkerTally::default();
        loop {
            let ticket = tickets.fetch_add(1, Ordering::Relaxed);
            if ticket >= spec.count {
                break;
            }
            let guard = barrier.guard();

            let message = spec.build();
            tally.retries += self.send_with_retry(&message, backoff).await;
            tally.sent += 1;
            trace!("Sent message {}", ticket + 1);

            guard.complete();
        }
        drop(self.producer);
        self.resources.release().await;
        tally
    }
}

/// Send `spec.count` messages to the target using `threads` workers, each
/// with its own connection. Failed sends are retried until they succeed; a
/// worker whose connection is lost reopens it before retrying.
pub async fn produce(
    ctx: &HarnessContext,
    target: &BrokerTarget,
    spec: &MessageSpec,
    threads: usize,
) -> Result<ProduceSummary, HarnessError> {
    validate_worker_count(threads)?;
    let started = Instant::now();

    if spec.count == 0 {
        info!("Nothing to send to {}", target.destination);
        return Ok(ProduceSummary::default());
    }

    let workers = threads.min(spec.count);
    let mut opened = Vec::with_capacity(workers);
    for _ in 0..workers {
        match ProducerWorker::open(ctx, target).await {
            Ok(worker) => opened.push(worker),
            Err(e) => {
                error!("Failed to open producer connection: {e}");
                for worker in opened {
                    worker.resources.release().await;
                }
                return Err(e);
            }
        }
    }
    info!(
        "Sending {} messages to {} over {workers} connections",
        spec.count, target.destination
    );

    let spec = Arc::new(spec.clone());
    let tickets = Arc::new(AtomicUsize::new(0));
    let barrier = CompletionBarrier::new(spec.count);

    let handles: Vec<_> = opened
        .into_iter()
        .enumerate()
        .map(|(index, worker)| {
            let span = info_span!("producer.worker", worker = index);
            tokio::spawn(
                worker
                    .run(
                        spec.clone(),
                        tickets.clone(),
                        barrier.clone(),
                        ctx.timings.retry_backoff,
                    )
                    .instrument(span),
            )
        })
        .collect();

    barrier.wait().await;

    let mut summary = ProduceSummary {
        workers,
        ..Default::default()
    };
    for handle in handles {
        match handle.await {
            Ok(tally) => {
                summary.sent += tally.sent;
                summary.retries += tally.retries;
            }
            Err(e) => error!("Producer worker failed: {e}"),
        }
    }
    summary.elapsed_ms = started.elapsed().as_millis();
    summary.log("produce");
    Ok(summary)
}

/// Send `count` random payloads of exactly `payload_size` characters on a
/// single connection. The first failed send ends the command.
pub async fn produce_random(
    ctx: &HarnessContext,
    target: &BrokerTarget,
    payload_size: usize,
    count: usize,
) -> Result<ProduceSummary, HarnessError> {
    if payload_size < 2 {
        return Err(HarnessError::Configuration(format!(
            "message size must be at least 2, got {payload_size}"
        )));
    }
    let started = Instant::now();
    let pool = PayloadPool::global();

    let worker = ProducerWorker::open(ctx, target).await?;
    let outcome: Result<usize, HarnessError> = async {
        let mut sent = 0;
        for _ in 0..count {
            let payload = pool.generate(payload_size)?;
            worker.producer.send(&TextMessage::new(payload)).await?;
            sent += 1;
        }
        Ok(sent)
    }
    .instrument(info_span!("producer.random", size = payload_size))
    .await;
    worker.resources.release().await;

    let sent = outcome?;
    let summary = ProduceSummary {
        workers: 1,
        sent,
        retries: 0,
        elapsed_ms: started.elapsed().as_millis(),
    };
    summary.log("produce-random");
    Ok(summary)
}

/// Send one message, then hold the connection open for the stall period
/// without ever closing it. A failed send skips the stall. Waits at most the
/// await ceiling for the worker.
///
/// Returns whether the worker finished within the ceiling. Failing to open
/// the connection is an error.
pub async fn bad_produce(
    ctx: &HarnessContext,
    target: &BrokerTarget,
    payload: &str,
) -> Result<bool, HarnessError> {
    let worker = ProducerWorker::open(ctx, target).await?;

    let barrier = CompletionBarrier::new(1);
    let guard = barrier.guard();
    let message = TextMessage::new(payload);
    let stall = ctx.timings.stall;

    tokio::spawn(
        async move {
            let _guard = guard;
            match worker.producer.send(&message).await {
                Ok(()) => {
                    debug!("Sent one message, holding the connection for {stall:?}");
                    tokio::time::sleep(stall).await;
                }
                Err(e) => error!("Send failed: {e}"),
            }

            // never closed: the broker keeps a live producer until the process exits
            std::mem::forget(worker.producer);
            worker.resources.leak();
        }
        .instrument(info_span!("producer.bad")),
    );

    let completed = barrier.await_all(ctx.timings.await_ceiling).await;
    if !completed {
        warn!("Gave up waiting for the bad producer after {:?}", ctx.timings.await_ceiling);
    }
    Ok(completed)
}
