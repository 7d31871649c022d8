mod args;

use args::{Cli, Command, ConnectionArgs, TargetArgs};
use clap::Parser;
use harness_common::message::parse_headers;
use harness_common::{
    init_logging, BrokerTarget, DestinationResolver, HarnessContext, HarnessError,
    HarnessTimings, MessageSpec, Schedule, WorkerSpec,
};
use harness_consumer::echo::{EchoArgs, EchoListener};
use harness_producer::sender::{SenderArgs, SenderController};
use ractor::concurrency::JoinHandle;
use ractor::{Actor, ActorRef, SpawnErr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use stomp_client::{ClientError, Credentials, StompConnectionFactory};
use tracing::{error, info, warn};

fn context(connection: &ConnectionArgs) -> Result<HarnessContext, HarnessError> {
    let factory = StompConnectionFactory::from_uri(&connection.uri)
        .map_err(|e| HarnessError::configuration(format!("{}: {e}", connection.uri)))?;
    let credentials = match (&connection.username, &connection.password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        _ => None,
    };
    Ok(HarnessContext::new(Arc::new(factory), credentials))
}

/// Resolve the destination before anything connects.
fn prepare(target: &TargetArgs) -> Result<(HarnessContext, BrokerTarget), HarnessError> {
    let resolved =
        DestinationResolver::default().resolve_target(&target.connection.uri, &target.dest)?;
    Ok((context(&target.connection)?, resolved))
}

/// Unwrap the harness error an actor failed to start with, if it had one.
fn startup_error(e: SpawnErr) -> HarnessError {
    let SpawnErr::StartupFailed(inner) = e else {
        return HarnessError::configuration(e);
    };
    let inner = match inner.downcast::<HarnessError>() {
        Ok(harness) => return *harness,
        Err(inner) => inner,
    };
    match inner.downcast::<ClientError>() {
        Ok(client) => HarnessError::Protocol(*client),
        Err(inner) => HarnessError::configuration(inner),
    }
}

/// Run an actor until it stops on its own or the process is interrupted.
async fn run_until_interrupted<M: ractor::Message>(
    actor: ActorRef<M>,
    mut handle: JoinHandle<()>,
) -> Result<(), HarnessError> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for interrupts: {e}");
            }
            info!("Interrupted, stopping {}", actor.get_id());
            actor.stop(None);
            if let Err(e) = handle.await {
                error!("Actor task failed: {e}");
            }
        }
        joined = &mut handle => {
            if let Err(e) = joined {
                error!("Actor task failed: {e}");
            }
        }
    }
    Ok(())
}

async fn run(command: Command) -> Result<(), HarnessError> {
    match command {
        Command::Consume {
            target,
            selector,
            client,
            connections,
        } => {
            let spec = WorkerSpec {
                workers: connections,
                client_id: client,
                selector,
            };
            spec.validate()?;
            let (ctx, target) = prepare(&target)?;
            if !harness_consumer::consume(&ctx, &target, &spec).await? {
                warn!("Gave up waiting for consumers");
            }
        }
        Command::BadConsumer { target } => {
            let (ctx, target) = prepare(&target)?;
            harness_consumer::bad_consume_no_ack(&ctx, &target).await?;
        }
        Command::BadConsumerPending { target } => {
            let (ctx, target) = prepare(&target)?;
            harness_consumer::bad_consume_pending(&ctx, &target).await?;
        }
        Command::BadConsumerNoTx { target } => {
            let (ctx, target) = prepare(&target)?;
            harness_consumer::bad_consume_no_commit_tx(&ctx, &target).await?;
        }
        Command::Produce {
            target,
            message,
            count,
            headers,
            delay,
            period,
            repeat,
            threads,
            retry_backoff_ms,
        } => {
            harness_common::validate_worker_count(threads)?;
            let spec = MessageSpec::new(message, count)
                .with_headers(parse_headers(&headers))
                .with_schedule(Schedule {
                    delay,
                    period,
                    repeat,
                });
            let (ctx, target) = prepare(&target)?;
            let ctx = ctx.with_timings(HarnessTimings {
                retry_backoff: retry_backoff_ms.map(Duration::from_millis),
                ..Default::default()
            });
            harness_producer::produce(&ctx, &target, &spec, threads).await?;
        }
        Command::BadProduce { target, message } => {
            let (ctx, target) = prepare(&target)?;
            if !harness_producer::bad_produce(&ctx, &target, &message).await? {
                warn!("Gave up waiting for the producer");
            }
        }
        Command::ProduceRandom {
            target,
            message_size,
            count,
        } => {
            let (ctx, target) = prepare(&target)?;
            harness_producer::produce_random(&ctx, &target, message_size, count).await?;
        }
        Command::SendLoop {
            connection,
            threads,
            prefix,
        } => {
            harness_common::validate_worker_count(threads)?;
            let args = SenderArgs {
                ctx: context(&connection)?,
                threads,
                prefix,
            };
            let (actor, handle) =
                Actor::spawn(Some("idle.sender".to_string()), SenderController, args)
                    .await
                    .map_err(startup_error)?;
            run_until_interrupted(actor, handle).await?;
        }
        Command::Echo { target } => {
            let (ctx, target) = prepare(&target)?;
            let (actor, handle) = Actor::spawn(
                Some("idle.echo".to_string()),
                EchoListener,
                EchoArgs { ctx, target },
            )
            .await
            .map_err(startup_error)?;
            run_until_interrupted(actor, handle).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_errors_survive_actor_startup() {
        let failed = SpawnErr::StartupFailed(Box::new(HarnessError::Resolution("x".into())));
        assert!(matches!(startup_error(failed), HarnessError::Resolution(_)));

        let failed = SpawnErr::StartupFailed(Box::new(ClientError::ConnectionLost("gone".into())));
        assert!(matches!(startup_error(failed), HarnessError::Protocol(_)));
    }

    #[test]
    fn literal_destinations_resolve_without_a_directory() {
        let target = TargetArgs {
            connection: ConnectionArgs {
                uri: "tcp://localhost:61613".to_string(),
                username: Some("admin".to_string()),
                password: Some("secret".to_string()),
            },
            dest: "queue://orders".to_string(),
        };
        let (ctx, resolved) = prepare(&target).unwrap();
        assert_eq!(resolved.destination_name(), "orders");
        assert!(!resolved.is_topic());
        assert_eq!(ctx.credentials, Some(Credentials::new("admin", "secret")));
    }

    #[test]
    fn unresolvable_destination_fails_before_connecting() {
        let target = TargetArgs {
            connection: ConnectionArgs {
                uri: "tcp://localhost:61613".to_string(),
                username: None,
                password: None,
            },
            dest: "orders".to_string(),
        };
        assert!(matches!(prepare(&target), Err(HarnessError::Resolution(_))));
    }

    #[test]
    fn bad_uri_is_a_configuration_error() {
        let connection = ConnectionArgs {
            uri: "http://nowhere".to_string(),
            username: None,
            password: None,
        };
        assert!(matches!(
            context(&connection),
            Err(HarnessError::Configuration(_))
        ));
    }
}
