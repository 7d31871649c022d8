use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "idle-client")]
#[command(about = "Drive producers and (mis)behaving consumers against a message broker", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionArgs {
    /// Broker uri, e.g. tcp://localhost:61613 or ssl://broker:61614
    #[arg(long, env = "BROKER_URI")]
    pub uri: String,

    #[arg(long, env = "BROKER_USERNAME", requires = "password")]
    pub username: Option<String>,

    #[arg(long, env = "BROKER_PASSWORD", requires = "username", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TargetArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Destination name: a directory entry, or queue://name / topic://name
    #[arg(long)]
    pub dest: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume and acknowledge every message
    Consume {
        #[command(flatten)]
        target: TargetArgs,

        /// Message selector
        #[arg(long)]
        selector: Option<String>,

        /// Client id; makes topic subscriptions durable
        #[arg(long)]
        client: Option<String>,

        /// Number of consumers, each on its own connection
        #[arg(long, default_value_t = 1)]
        connections: usize,
    },

    /// Consume without ever acknowledging
    BadConsumer {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Take one message and hang on to it
    BadConsumerPending {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Consume inside a transaction that is never committed
    BadConsumerNoTx {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Send a message a number of times
    Produce {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        message: String,

        #[arg(long)]
        count: usize,

        /// String property as KEY:VALUE; may be repeated
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Scheduled delivery delay in milliseconds
        #[arg(long)]
        delay: Option<u64>,

        /// Scheduled redelivery period in milliseconds
        #[arg(long)]
        period: Option<u64>,

        /// Number of scheduled redeliveries
        #[arg(long)]
        repeat: Option<u32>,

        #[arg(long, default_value_t = 1)]
        threads: usize,

        /// Pause between retries of a failed send
        #[arg(long)]
        retry_backoff_ms: Option<u64>,
    },

    /// Send one message and keep the connection open without closing it
    BadProduce {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        message: String,
    },

    /// Send random payloads of a fixed size
    ProduceRandom {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        message_size: usize,

        #[arg(long)]
        count: usize,
    },

    /// Send to <prefix>1..<prefix>N in a loop until interrupted
    SendLoop {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[arg(long, default_value_t = 1)]
        threads: usize,

        #[arg(long, default_value = "TEST")]
        prefix: String,
    },

    /// Read and drop everything delivered to a destination until interrupted
    Echo {
        #[command(flatten)]
        target: TargetArgs,
    },
}
