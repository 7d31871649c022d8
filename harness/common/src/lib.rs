//! Shared plumbing for the producer and consumer harnesses: destination
//! resolution, connection provisioning, message building, random payloads
//! and the completion barrier that joins worker tasks.

pub mod barrier;
pub mod destination;
mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod message;
pub mod payload;
pub mod provision;

pub use barrier::{CompletionBarrier, CompletionGuard};
pub use destination::{DestinationResolver, DirectoryLookup, PropertiesDirectory};
pub use error::{HarnessError, HarnessResult};
pub use message::{MessageSpec, Schedule};
pub use payload::PayloadPool;
pub use provision::WorkerResources;

use std::sync::Arc;
use std::time::Duration;
use stomp_client::{ConnectionFactory, Credentials, Destination, SessionMode};

/// Upper bound on workers a single command may start.
pub const MAX_WORKERS: usize = 1024;

/// How long a command waits for its workers before returning anyway.
pub const AWAIT_CEILING: Duration = Duration::from_secs(60 * 60);

/// How long `bad-produce` holds its connection after sending.
pub const BAD_PRODUCER_STALL: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessTimings {
    pub await_ceiling: Duration,
    pub stall: Duration,
    /// Pause between send retries. `None` retries immediately.
    pub retry_backoff: Option<Duration>,
}

impl Default for HarnessTimings {
    fn default() -> Self {
        HarnessTimings {
            await_ceiling: AWAIT_CEILING,
            stall: BAD_PRODUCER_STALL,
            retry_backoff: None,
        }
    }
}

/// Everything a command needs to reach the broker.
#[derive(Clone)]
pub struct HarnessContext {
    pub factory: Arc<dyn ConnectionFactory>,
    pub credentials: Option<Credentials>,
    pub timings: HarnessTimings,
}

impl HarnessContext {
    pub fn new(factory: Arc<dyn ConnectionFactory>, credentials: Option<Credentials>) -> Self {
        HarnessContext {
            factory,
            credentials,
            timings: HarnessTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: HarnessTimings) -> Self {
        self.timings = timings;
        self
    }
}

/// A destination resolved once per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub uri: String,
    pub destination: Destination,
}

impl BrokerTarget {
    pub fn destination_name(&self) -> &str {
        self.destination.name()
    }

    pub fn is_topic(&self) -> bool {
        self.destination.is_topic()
    }
}

/// How many workers to run and how they subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub workers: usize,
    pub client_id: Option<String>,
    pub selector: Option<String>,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        WorkerSpec {
            workers: 1,
            client_id: None,
            selector: None,
        }
    }
}

impl WorkerSpec {
    pub fn validate(&self) -> Result<(), HarnessError> {
        validate_worker_count(self.workers)
    }

    /// The selector, unless it is too short to mean anything once trimmed.
    pub fn effective_selector(&self) -> Option<&str> {
        self.selector
            .as_deref()
            .filter(|selector| selector.trim().chars().count() > 1)
    }

    /// Name of the durable subscription for this worker's client id.
    pub fn subscription_name(&self) -> Option<String> {
        self.client_id
            .as_ref()
            .map(|client| format!("{client}subscription"))
    }
}

pub fn validate_worker_count(workers: usize) -> Result<(), HarnessError> {
    if workers == 0 || workers > MAX_WORKERS {
        return Err(HarnessError::Configuration(format!(
            "worker count must be between 1 and {MAX_WORKERS}, got {workers}"
        )));
    }
    Ok(())
}

/// How a consumer settles what it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge every message before receiving the next.
    Normal,
    /// Receive and log, never acknowledge.
    Never,
    /// Stop after the first message and hold it unacknowledged.
    Pending,
    /// Receive inside a transaction that is never committed.
    TransactedNoCommit,
}

impl AckMode {
    pub fn session_mode(&self) -> SessionMode {
        match self {
            AckMode::Normal | AckMode::Never | AckMode::Pending => SessionMode::ClientAcknowledge,
            AckMode::TransactedNoCommit => SessionMode::Transacted,
        }
    }
}

/// Install the process-wide tracing subscriber: glog formatted lines on
/// stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    use std::io::stderr;
    use std::io::IsTerminal;
    use tracing_glog::Glog;
    use tracing_glog::GlogFields;
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Registry;

    let fmt = tracing_subscriber::fmt::Layer::default()
        .with_ansi(stderr().is_terminal())
        .with_writer(std::io::stderr)
        .event_format(Glog::default().with_timer(tracing_glog::LocalTime::default()))
        .fmt_fields(GlogFields::default().compact());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if Registry::default().with(filter).with(fmt).try_init().is_err() {
        eprintln!("Logging registry already initialized");
    }
}
