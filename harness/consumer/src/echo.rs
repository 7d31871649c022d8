//! A listener that reads the text of everything delivered to it and drops it.

use harness_common::{BrokerTarget, HarnessContext, WorkerResources};
use ractor::{async_trait, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stomp_client::{ClientError, MessageConsumer, SessionMode};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

pub struct EchoListener;

pub struct EchoArgs {
    pub ctx: HarnessContext,
    pub target: BrokerTarget,
}

pub struct EchoState {
    resources: Option<WorkerResources>,
    listener: JoinHandle<()>,
    received: Arc<AtomicUsize>,
}

pub enum EchoMessage {
    /// Number of text messages read so far.
    ReceivedCount(RpcReplyPort<usize>),
}

async fn listen(
    myself: ActorRef<EchoMessage>,
    mut consumer: Box<dyn MessageConsumer>,
    received: Arc<AtomicUsize>,
) {
    loop {
        match consumer.receive().await {
            Ok(message) => match message.text() {
                Ok(text) => {
                    received.fetch_add(1, Ordering::Relaxed);
                    debug!("Read {} characters", text.chars().count());
                }
                Err(ClientError::NotText) => {}
                Err(e) => error!("Failed to read message: {e}"),
            },
            Err(e) => {
                error!("Listener stopped: {e}");
                myself.stop(Some(e.to_string()));
                return;
            }
        }
    }
}

#[async_trait]
impl Actor for EchoListener {
    type Msg = EchoMessage;
    type State = EchoState;
    type Arguments = EchoArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: EchoArgs,
    ) -> Result<Self::State, ActorProcessingErr> {
        let resources =
            WorkerResources::open(&args.ctx, None, SessionMode::AutoAcknowledge).await?;
        let consumer = match resources
            .session
            .create_consumer(&args.target.destination, None)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                resources.release().await;
                return Err(e.into());
            }
        };
        info!("Listening on {}", args.target.destination);

        let received = Arc::new(AtomicUsize::new(0));
        let listener = tokio::spawn(
            listen(myself, consumer, received.clone())
                .instrument(info_span!("echo.listener")),
        );

        Ok(EchoState {
            resources: Some(resources),
            listener,
            received,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EchoMessage::ReceivedCount(reply) => {
                if reply.send(state.received.load(Ordering::Relaxed)).is_err() {
                    debug!("Caller went away before the count was returned");
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
        state.listener.abort();
        if let Some(resources) = state.resources.take() {
            resources.release().await;
        }
        info!(
            "Listener read {} messages",
            state.received.load(Ordering::Relaxed)
        );
        Ok(())
    }
}
