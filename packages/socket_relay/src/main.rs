use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use socket_relay::config::{BrowserOverrides, CliOverrides, UpstreamOverrides};
use socket_relay::demo_upstream::{self, DemoOptions};
use socket_relay::{Relay, RelayConfig};

#[derive(Parser)]
#[command(name = "socket-relay")]
#[command(about = "Relay a line-oriented TCP service to a browser over WebSocket")]
struct Cli {
    /// Config file (default: ./socket_relay.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (the default)
    Serve(ServeArgs),
    /// Run a demo upstream service that emits periodic events
    DemoUpstream(DemoArgs),
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Upstream TCP host
    #[arg(long)]
    upstream_host: Option<String>,

    /// Upstream TCP port
    #[arg(long)]
    upstream_port: Option<u16>,

    /// Host for the browser listener
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the browser listener
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory served to browsers
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

impl ServeArgs {
    fn overrides(self) -> CliOverrides {
        CliOverrides {
            upstream: Some(UpstreamOverrides {
                host: self.upstream_host,
                port: self.upstream_port,
            }),
            browser: Some(BrowserOverrides {
                host: self.host,
                port: self.port,
                static_dir: self.static_dir,
            }),
        }
    }
}

#[derive(Args)]
struct DemoArgs {
    /// Port to accept the relay's connection on
    #[arg(short, long, default_value = "6514")]
    port: u16,

    /// Write every received line back to the relay
    #[arg(long)]
    echo: bool,

    /// Minimum seconds between events
    #[arg(long, default_value = "5")]
    min_interval: u64,

    /// Maximum seconds between events
    #[arg(long, default_value = "10")]
    max_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "socket_relay=debug,tower_http=debug,info"
    } else {
        "socket_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    match cli.command {
        None => run_relay(cli.config, ServeArgs::default()).await,
        Some(Commands::Serve(args)) => run_relay(cli.config, args).await,
        Some(Commands::DemoUpstream(args)) => run_demo(args).await,
    }
}

async fn run_relay(config_file: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let config = RelayConfig::load(config_file.as_deref(), &args.overrides())?;
    info!(
        "Starting socket relay: upstream {}:{}, browsers on {}:{}",
        config.upstream.host, config.upstream.port, config.browser.host, config.browser.port
    );

    let relay = Relay::start(&config).await?;
    info!(
        "WebSocket endpoint: ws://{}{}",
        relay.local_addr(),
        config.browser.ws_path
    );
    if let Some(dir) = config.browser.static_root() {
        info!("Serving files from {}", dir.display());
    }

    tokio::select! {
        result = relay.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting");
            Ok(())
        }
    }
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind demo upstream on port {}", args.port))?;

    demo_upstream::run(
        listener,
        DemoOptions {
            echo: args.echo,
            min_interval_secs: args.min_interval,
            max_interval_secs: args.max_interval,
        },
    )
    .await
}
