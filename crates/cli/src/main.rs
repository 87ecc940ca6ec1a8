use clap::{Parser, Subcommand};
use std::sync::Arc;
use vaksi::correlator::Correlator;
use vaksi::matrix::MatrixClient;
use vaksi::session::DirectSessions;

#[derive(Parser)]
#[command(name = "vaksi")]
#[command(about = "Vaksi: open bridged direct conversations on Matrix", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file with an example Slack bridge.
    Init {
        /// Config file path (default: VAKSI_CONFIG_PATH or ~/.vaksi/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bot: Matrix sync loop plus the HTTP gateway. Send SIGHUP to reload bridges and timeouts.
    Run {
        /// Config file path (default: VAKSI_CONFIG_PATH or ~/.vaksi/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 29340)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print the bot account's known direct conversations (m.direct) as JSON.
    Dms {
        /// Config file path (default: VAKSI_CONFIG_PATH or ~/.vaksi/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("vaksi {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, port }) => {
            if let Err(e) = run_bot(config, port).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Dms { config }) => {
            if let Err(e) = run_dms(config).await {
                log::error!("dms failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(vaksi::config::default_config_path);
    let dir = vaksi::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_bot(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = vaksi::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting vaksi on {}:{}", config.gateway.bind, config.gateway.port);
    vaksi::gateway::run_bot(config, path).await
}

/// One-shot listing through the session facade; no sync loop or correlation involved.
async fn run_dms(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = vaksi::config::load_config(config_path)?;
    let token = vaksi::config::resolve_matrix_token(&config)
        .ok_or_else(|| anyhow::anyhow!("matrix access token not configured"))?;
    let client = Arc::new(MatrixClient::new(
        &config.matrix.homeserver,
        config.matrix.user_id.trim(),
        token,
    )?);
    let correlator = Arc::new(Correlator::new(config.channel_routes()?));
    let sessions = DirectSessions::new(client, correlator, config);
    let direct = sessions.list_direct_conversations().await?;
    println!("{}", serde_json::to_string_pretty(&direct)?);
    Ok(())
}
