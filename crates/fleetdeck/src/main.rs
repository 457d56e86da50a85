use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{LevelFilter, info};
use tokio::net::TcpListener;

use fleetdeck::api::{AppState, create_router};
use fleetdeck::config::ServerConfig;

const APP_NAME: &str = "fleetdeck";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    match cli.command {
        Command::Serve(cmd) => run_serve(&cli.common, cmd),
        Command::Config { command } => handle_config(&cli.common, command),
        Command::Completions { shell } => {
            handle_completions(shell);
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_serve(common: &CommonOpts, cmd: ServeCommand) -> Result<()> {
    let mut config = ServerConfig::load(common.config.as_deref())?;
    if let Some(bind) = cmd.bind {
        config.bind = bind;
    }
    if let Some(port) = cmd.port {
        config.port = port;
    }

    std::fs::create_dir_all(config.instances_dir())
        .with_context(|| format!("creating state directory {}", config.state_dir.display()))?;

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind, config.port))?;

    let state = AppState::build(config);
    let mode = state.topology.mode().await;
    info!(
        "fleetdeck {} serving on {} (topology: {}, auth: {})",
        env!("CARGO_PKG_VERSION"),
        addr,
        mode.as_str(),
        if state.config.auth.auth_enabled() {
            "enabled"
        } else {
            "open"
        },
    );

    let router = create_router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, router)
        .await
        .context("serving HTTP")?;
    Ok(())
}

fn handle_config(common: &CommonOpts, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Path => {
            let path = common
                .config
                .clone()
                .unwrap_or_else(ServerConfig::default_config_path);
            println!("{}", path.display());
            Ok(())
        }
        ConfigCommand::Show => {
            let config = ServerConfig::load(common.config.as_deref())?;
            let rendered =
                toml::to_string_pretty(&config).context("serializing configuration")?;
            print!("{}", rendered);
            Ok(())
        }
        ConfigCommand::Init => {
            let path = common
                .config
                .clone()
                .unwrap_or_else(ServerConfig::default_config_path);
            if path.exists() {
                anyhow::bail!("config file already exists at {}", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let rendered = toml::to_string_pretty(&ServerConfig::default())
                .context("serializing default configuration")?;
            let body = format!("# Configuration for {}\n\n{}", APP_NAME, rendered);
            std::fs::write(&path, body)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
}

fn init_logging(common: &CommonOpts) {
    let level = if common.trace {
        LevelFilter::Trace
    } else if common.debug || common.verbose >= 2 {
        LevelFilter::Debug
    } else if common.quiet {
        LevelFilter::Error
    } else if common.verbose == 1 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();

    // Route tower-http request traces through a tracing subscriber at the
    // same level. env_logger already owns the `log` side.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string().to_lowercase()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fleetdeck - control plane for container-backed desktop instances.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,
    /// Port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the config file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init,
}
