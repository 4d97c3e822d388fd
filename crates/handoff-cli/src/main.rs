mod client;
mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "handoff",
    about = "Hand tasks to an assistant running in tmux and learn when they finish",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .handoff/)
    #[arg(long, global = true, env = "HANDOFF_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .handoff/ with a default config
    Init {
        /// Overwrite an existing config with the defaults
        #[arg(long)]
        force: bool,
    },

    /// Run the coordinator and its HTTP/WebSocket server
    Serve {
        /// Port to listen on (default: server.port from the config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Submit a task to the session owned by an identity
    Submit {
        /// Identity part (repeat for compound identities, e.g. email then phone)
        #[arg(long = "identity", short = 'i', required = true)]
        identity: Vec<String>,
        /// Task text; use --file to read it from disk instead
        payload: Option<String>,
        #[arg(long, conflicts_with = "payload")]
        file: Option<PathBuf>,
        /// Return as soon as the task is accepted
        #[arg(long)]
        no_wait: bool,
        /// Server base URL (default: server.public_url from the config)
        #[arg(long)]
        server: Option<String>,
    },

    /// Show session status records
    Status {
        /// Session id (omit to list every session)
        #[arg(long)]
        session: Option<String>,
    },

    /// Publish an event into a session's notifier channel
    Emit {
        #[arg(long)]
        session: String,
        /// Task the event belongs to
        #[arg(long)]
        task: Option<String>,
        /// Event type: ack, progress, done, error, or any custom name
        #[arg(long = "type", value_name = "TYPE")]
        kind: String,
        /// Payload; numeric values are sent as numbers
        #[arg(long)]
        data: Option<String>,
        #[arg(long)]
        server: Option<String>,
    },

    /// Cancel the task in flight for a session
    Cancel {
        #[arg(long)]
        session: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        server: Option<String>,
    },

    /// Print the session id derived from an identity
    SessionId {
        #[arg(required = true)]
        identity: Vec<String>,
    },

    /// Inspect and validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Probe an HTTP endpoint with timeout and retries
    Check {
        url: String,
        /// Per-request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        #[arg(long, default_value = "2")]
        retries: u32,
        /// Require this exact status instead of any 2xx
        #[arg(long)]
        expect_status: Option<u16>,
    },

    /// Run an external command with a timeout and report the outcome
    Exec {
        /// Timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { force } => cmd::init::run(&root, force, cli.json),
        Commands::Serve { port } => cmd::serve::run(&root, port),
        Commands::Submit {
            identity,
            payload,
            file,
            no_wait,
            server,
        } => cmd::submit::run(
            &root,
            cmd::submit::SubmitArgs {
                identity,
                payload,
                file,
                wait: !no_wait,
                server,
            },
            cli.json,
        ),
        Commands::Status { session } => cmd::status::run(&root, session.as_deref(), cli.json),
        Commands::Emit {
            session,
            task,
            kind,
            data,
            server,
        } => cmd::emit::run(
            &root,
            &session,
            task.as_deref(),
            &kind,
            data.as_deref(),
            server.as_deref(),
            cli.json,
        ),
        Commands::Cancel {
            session,
            reason,
            server,
        } => cmd::cancel::run(&root, &session, reason.as_deref(), server.as_deref(), cli.json),
        Commands::SessionId { identity } => cmd::session_id::run(&identity, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Check {
            url,
            timeout,
            retries,
            expect_status,
        } => cmd::check::run(&url, timeout, retries, expect_status, cli.json),
        Commands::Exec { timeout, argv } => cmd::exec::run(&root, &argv, timeout, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
