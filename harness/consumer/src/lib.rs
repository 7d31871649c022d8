//! Consumer harness: well-behaved and deliberately misbehaving consumers.
//!
//! All four commands share one skeleton. Each worker opens its own
//! connection and session, subscribes, and receives in a loop; the
//! [`AckMode`] decides what happens to each message.

pub mod echo;

use harness_common::{
    AckMode, BrokerTarget, CompletionBarrier, HarnessContext, HarnessError, WorkerResources,
    WorkerSpec,
};
use stomp_client::{ClientError, MessageConsumer, ReceivedMessage, Session};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Subscribe the way the worker spec asks: a durable subscription named
/// after the client id on topics, a plain consumer otherwise.
pub async fn subscribe(
    session: &dyn Session,
    target: &BrokerTarget,
    spec: &WorkerSpec,
) -> Result<Box<dyn MessageConsumer>, ClientError> {
    let selector = spec.effective_selector();
    match spec.subscription_name() {
        Some(name) if target.is_topic() => {
            debug!("Creating durable subscription {name} on {}", target.destination);
            session
                .create_durable_subscriber(&target.destination, &name, selector)
                .await
        }
        _ => session.create_consumer(&target.destination, selector).await,
    }
}

struct ConsumerWorker {
    resources: WorkerResources,
    consumer: Box<dyn MessageConsumer>,
}

impl ConsumerWorker {
    async fn open(
        ctx: &HarnessContext,
        target: &BrokerTarget,
        spec: &WorkerSpec,
        mode: AckMode,
    ) -> Result<Self, HarnessError> {
        let resources =
            WorkerResources::open(ctx, spec.client_id.as_deref(), mode.session_mode()).await?;
        match subscribe(resources.session.as_ref(), target, spec).await {
            Ok(consumer) => Ok(ConsumerWorker {
                resources,
                consumer,
            }),
            Err(e) => {
                resources.release().await;
                Err(e.into())
            }
        }
    }

    /// Receive until the broker fails us. Only `Normal` workers close their
    /// connection afterwards; the others leave it open.
    async fn run(self, mode: AckMode) {
        let ConsumerWorker {
            resources,
            mut consumer,
        } = self;

        if let Err(e) = receive_loop(consumer.as_mut(), mode).await {
            error!("Consumer stopped: {e}");
        }

        match mode {
            AckMode::Normal => {
                drop(consumer);
                resources.release().await;
            }
            AckMode::Never | AckMode::Pending | AckMode::TransactedNoCommit => {
                std::mem::forget(consumer);
                resources.leak();
            }
        }
    }
}

fn log_text(message: &ReceivedMessage, what: &str) {
    let id = message.message_id().unwrap_or("<no id>");
    match message.text() {
        Ok(text) => info!("Retrieved (but not {what}) message {id}:\n{text}"),
        Err(_) => info!(
            "Retrieved (but not {what}) non-text message {id} of {} bytes",
            message.body().len()
        ),
    }
}

async fn receive_loop(consumer: &mut dyn MessageConsumer, mode: AckMode) -> Result<(), ClientError> {
    loop {
        let message = consumer.receive().await?;
        match mode {
            AckMode::Normal => {
                consumer.acknowledge(&message).await?;
                trace!("Acknowledged {}", message.message_id().unwrap_or("<no id>"));
            }
            AckMode::Never => log_text(&message, "acknowledged"),
            AckMode::TransactedNoCommit => log_text(&message, "committed"),
            AckMode::Pending => {
                info!(
                    "Holding message {} without acknowledging it",
                    message.message_id().unwrap_or("<no id>")
                );
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Run `spec.workers` acknowledging consumers, one connection each. Returns
/// whether every worker finished before the await ceiling.
pub async fn consume(
    ctx: &HarnessContext,
    target: &BrokerTarget,
    spec: &WorkerSpec,
) -> Result<bool, HarnessError> {
    spec.validate()?;
    info!(
        "Consuming from {} on {} connections",
        target.destination, spec.workers
    );

    let barrier = CompletionBarrier::new(spec.workers);
    for index in 0..spec.workers {
        let guard = barrier.guard();
        let ctx = ctx.clone();
        let target = target.clone();
        let spec = spec.clone();

        tokio::spawn(
            async move {
                let _guard = guard;
                match ConsumerWorker::open(&ctx, &target, &spec, AckMode::Normal).await {
                    Ok(worker) => worker.run(AckMode::Normal).await,
                    Err(e) => error!("Consumer failed to start: {e}"),
                }
            }
            .instrument(info_span!("consumer.worker", worker = index)),
        );
    }

    let completed = barrier.await_all(ctx.timings.await_ceiling).await;
    if !completed {
        warn!(
            "{} consumers still running after {:?}",
            barrier.remaining(),
            ctx.timings.await_ceiling
        );
    }
    Ok(completed)
}

async fn run_bad(
    ctx: &HarnessContext,
    target: &BrokerTarget,
    mode: AckMode,
) -> Result<(), HarnessError> {
    let worker = ConsumerWorker::open(ctx, target, &WorkerSpec::default(), mode).await?;
    let span = info_span!("consumer.bad", mode = ?mode);
    if let Err(e) = tokio::spawn(worker.run(mode).instrument(span)).await {
        error!("Consumer task failed: {e}");
    }
    Ok(())
}

/// Receive and log every message without ever acknowledging one.
pub async fn bad_consume_no_ack(
    ctx: &HarnessContext,
    target: &BrokerTarget,
) -> Result<(), HarnessError> {
    run_bad(ctx, target, AckMode::Never).await
}

/// Receive one message and then hang forever with it unacknowledged.
pub async fn bad_consume_pending(
    ctx: &HarnessContext,
    target: &BrokerTarget,
) -> Result<(), HarnessError> {
    run_bad(ctx, target, AckMode::Pending).await
}

/// Receive inside a transaction that is never committed.
pub async fn bad_consume_no_commit_tx(
    ctx: &HarnessContext,
    target: &BrokerTarget,
) -> Result<(), HarnessError> {
    run_bad(ctx, target, AckMode::TransactedNoCommit).await
}
