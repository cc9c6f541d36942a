use clap::Parser;
use log::{error, info, warn};
use socket_swarm::channel::SocketIoConnector;
use socket_swarm::config::RunConfig;
use socket_swarm::credentials;
use socket_swarm::error::Error;
use socket_swarm::lookup::HttpConversationLookup;
use socket_swarm::orchestrator::Orchestrator;
use socket_swarm::report;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Drives many concurrent chat clients against a Socket.IO chat service and
/// reports throughput and round-trip latency.
#[derive(Parser, Debug)]
#[command(name = "socket-swarm", version, about)]
struct Cli {
    /// JSON config file, every field optional
    #[arg(short, long, env = "SWARM_CONFIG")]
    config: Option<PathBuf>,

    /// Token file: an array of tokens or of user objects with a `token` field
    #[arg(short, long, env = "SWARM_TOKENS", default_value = "user_tokens.json")]
    tokens: PathBuf,

    /// Base address of the chat service
    #[arg(short = 'u', long, env = "SWARM_SERVER_URL")]
    server_url: Option<String>,

    /// Conversation every client joins
    #[arg(short = 'r', long, env = "SWARM_CONVERSATION_ID")]
    conversation_id: Option<String>,

    /// Number of clients, capped by the number of tokens
    #[arg(short = 'n', long)]
    clients: Option<usize>,

    /// Messages sent by every client
    #[arg(short, long)]
    messages: Option<usize>,

    /// Delay between two messages of the same client, in milliseconds
    #[arg(short, long)]
    delay_ms: Option<u64>,

    /// Seconds without a reply before a client times out
    #[arg(long)]
    inactivity_timeout: Option<u64>,

    /// Upper bound for the whole run, in seconds
    #[arg(short, long)]
    global_timeout: Option<u64>,

    /// Send one more message on every receipt, up to this many per client
    #[arg(long)]
    max_forwards: Option<usize>,

    /// Log a progress line while the run goes on
    #[arg(long)]
    live: bool,

    /// Skip the text, JSON and CSV reports
    #[arg(long)]
    no_reports: bool,

    /// Where reports are written
    #[arg(long)]
    report_dir: Option<String>,

    /// Don't query the REST API for the conversation size
    #[arg(long)]
    skip_size_lookup: bool,

    /// PEM file with the CA certificates to trust for wss:// and https://
    #[arg(long)]
    ca_file: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<(RunConfig, PathBuf), Error> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load_from_file(path)?,
            None => RunConfig::default(),
        };

        if let Some(server_url) = self.server_url {
            config.server_url = server_url;
        }
        if let Some(conversation_id) = self.conversation_id {
            config.conversation_id = conversation_id;
        }
        if let Some(clients) = self.clients {
            config.clients = clients;
        }
        if let Some(messages) = self.messages {
            config.messages_per_client = messages;
        }
        if let Some(delay_ms) = self.delay_ms {
            config.message_delay_ms = delay_ms;
        }
        if let Some(inactivity_timeout) = self.inactivity_timeout {
            config.inactivity_timeout_secs = inactivity_timeout;
        }
        if let Some(global_timeout) = self.global_timeout {
            config.global_timeout_secs = global_timeout;
        }
        if self.max_forwards.is_some() {
            config.max_forwards = self.max_forwards;
        }
        if let Some(report_dir) = self.report_dir {
            config.report_dir = report_dir;
        }
        if self.ca_file.is_some() {
            config.ca_file = self.ca_file;
        }
        config.live_monitoring |= self.live;
        config.reports_enabled &= !self.no_reports;
        config.lookup_conversation_size &= !self.skip_size_lookup;

        config.validate()?;
        Ok((config, self.tokens))
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Cli::parse()).await {
        error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let (config, tokens) = cli.into_config()?;

    let credentials = credentials::load_from_file(&tokens)?;
    if credentials.is_empty() {
        return Err(Error::CredentialError(format!(
            "no usable tokens in {}",
            tokens.display()
        )));
    }
    if config.conversation_id.is_empty() {
        warn!("no conversation id given, clients will join an empty conversation id");
    }

    let client_config = config.client_config();
    let connector = Arc::new(SocketIoConnector::new(client_config.clone()));
    let orchestrator = Orchestrator::new(config.clone(), connector)
        .with_size_lookup(Arc::new(HttpConversationLookup::new(client_config)?));

    let run_report = orchestrator.run(credentials).await;
    report::print_summary(&run_report);

    if config.reports_enabled {
        let files = report::write_reports(&run_report, Path::new(&config.report_dir))?;
        info!("report written to {}", files.text.display());
        info!("summary written to {}", files.summary.display());
        info!(
            "time series written to {} and {}",
            files.resources_csv.display(),
            files.latency_csv.display()
        );
    }

    Ok(())
}
