use clap::{Parser, Subcommand, ValueEnum};
use notify_engine::TransportKind;

#[derive(Parser)]
#[command(
    name = "notify",
    about = "Synchronize and observe notifications from a remote backend",
    version
)]
pub struct Args {
    /// Base API URL, e.g. https://example.org/api
    #[arg(long, env = "NOTIFY_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "NOTIFY_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine and print notification events as they arrive
    Watch {
        /// Transport to start with (foreground polling is always the
        /// runtime fallback)
        #[arg(long, value_enum, default_value_t = TransportArg::Worker)]
        transport: TransportArg,

        /// Poll interval in seconds
        #[arg(long, default_value_t = 30)]
        interval: u64,

        /// Emit events as JSON lines instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Print the current unread count and exit
    Count,
    /// Mark one notification as read
    MarkRead {
        /// Notification id
        id: i64,
    },
    /// Mark every notification as read
    MarkAllRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    /// Worker-isolated polling
    Worker,
    /// Long-lived server-push stream
    Stream,
    /// Foreground polling
    Foreground,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Worker => TransportKind::WorkerPoll,
            TransportArg::Stream => TransportKind::Stream,
            TransportArg::Foreground => TransportKind::ForegroundPoll,
        }
    }
}
