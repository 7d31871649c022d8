//! A managed background sender: N workers, each pushing a fixed text message
//! in a loop to its own queue until the controller stops.

use harness_common::{CompletionBarrier, HarnessContext, WorkerResources};
use ractor::{async_trait, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stomp_client::{Destination, SessionMode, TextMessage};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long the controller waits for its workers when stopping.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

pub const LOREM_IPSUM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Donec \
sollicitudin nisi eros, eget suscipit lacus gravida ut. Morbi posuere tortor vel metus \
dignissim volutpat ut in sem. Nam vel vulputate augue. Donec vel mi quis augue euismod \
tempor. Morbi accumsan elit a lorem maximus, sit amet iaculis urna finibus. Sed \
tristique viverra eros, nec tempus arcu. Vivamus sed sem et ante aliquet condimentum \
ut at leo. Aenean dignissim dolor erat, sit amet porttitor metus commodo vel. \
Vestibulum quam est, semper ultrices diam consectetur, aliquam posuere lacus. \
Vivamus sagittis erat lectus, quis posuere purus euismod quis. Proin gravida maximus \
fermentum. Integer congue ullamcorper diam. Nullam urna nunc, sagittis nec eleifend \
non, posuere quis elit. Nam rhoncus pharetra lobortis. Praesent feugiat suscipit tortor.";

pub struct SenderController;

pub struct SenderArgs {
    pub ctx: HarnessContext,
    pub threads: usize,
    /// Worker `i` sends to queue `<prefix><i + 1>`.
    pub prefix: String,
}

pub struct SenderState {
    ctx: HarnessContext,
    threads: usize,
    prefix: String,
    running: Arc<AtomicBool>,
    sent: Arc<AtomicUsize>,
    barrier: Option<CompletionBarrier>,
    workers: Vec<JoinHandle<()>>,
}

pub enum SenderMessage {
    /// Start the workers. Ignored while they are already running.
    Start,
    /// Number of messages the workers have sent so far.
    SentCount(RpcReplyPort<usize>),
}

async fn send_loop(
    ctx: HarnessContext,
    queue: Destination,
    running: Arc<AtomicBool>,
    sent: Arc<AtomicUsize>,
) {
    let resources = match WorkerResources::open(&ctx, None, SessionMode::AutoAcknowledge).await {
        Ok(resources) => resources,
        Err(e) => {
            error!("Sender for {queue} failed to connect: {e}");
            return;
        }
    };

    match resources.session.create_producer(&queue).await {
        Ok(producer) => {
            let message = TextMessage::new(LOREM_IPSUM);
            while running.load(Ordering::Acquire) {
                if let Err(e) = producer.send(&message).await {
                    error!("Sender for {queue} stopped: {e}");
                    break;
                }
                sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(e) => error!("Failed to create producer for {queue}: {e}"),
    }

    resources.release().await;
    debug!("Sender for {queue} finished");
}

impl SenderController {
    fn start(state: &mut SenderState) {
        if state.running.swap(true, Ordering::AcqRel) {
            debug!("Senders already running");
            return;
        }

        let barrier = CompletionBarrier::new(state.threads);
        state.workers = (0..state.threads)
            .map(|i| {
                let queue = Destination::Queue(format!("{}{}", state.prefix, i + 1));
                let guard = barrier.guard();
                let task = send_loop(
                    state.ctx.clone(),
                    queue,
                    state.running.clone(),
                    state.sent.clone(),
                );
                tokio::spawn(
                    async move {
                        task.await;
                        guard.complete();
                    }
                    .instrument(info_span!("sender.worker", worker = i + 1)),
                )
            })
            .collect();
        state.barrier = Some(barrier);
        info!("Started {} senders", state.threads);
    }
}

#[async_trait]
impl Actor for SenderController {
    type Msg = SenderMessage;
    type State = SenderState;
    type Arguments = SenderArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: SenderArgs,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!("{myself:?} starting");
        harness_common::validate_worker_count(args.threads)?;

        Ok(SenderState {
            ctx: args.ctx,
            threads: args.threads,
            prefix: args.prefix,
            running: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(AtomicUsize::new(0)),
            barrier: None,
            workers: Vec::new(),
        })
    }

    async fn post_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        Self::start(state);
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SenderMessage::Start => Self::start(state),
            SenderMessage::SentCount(reply) => {
                if reply.send(state.sent.load(Ordering::Relaxed)).is_err() {
                    debug!("Caller went away before the sent count was returned");
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.running.store(false, Ordering::Release);

        if let Some(barrier) = state.barrier.take() {
            if !barrier.await_all(SHUTDOWN_GRACE).await {
                warn!(
                    "{} senders still running after {SHUTDOWN_GRACE:?}, aborting them",
                    barrier.remaining()
                );
            }
        }
        for worker in state.workers.drain(..) {
            worker.abort();
        }
        info!(
            "Senders stopped after sending {} messages",
            state.sent.load(Ordering::Relaxed)
        );
        Ok(())
    }
}
