use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voicebridge::{
    app::{self, AppStateBuilder},
    config::Config,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bridges Asterisk calls to a realtime speech AI backend over RTP"
)]
struct Cli {
    /// Path to the configuration file
    #[clap(
        long,
        global = true,
        help = "Path to the configuration file (TOML format)"
    )]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit without starting the gateway
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenv().ok();
    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.conf {
        println!("Loading config from: {}", path);
        Config::load(path).expect("Failed to load config")
    } else {
        println!("Loading default config");
        let mut config = Config::default();
        config.apply_env();
        config
    };

    if matches!(cli.command, Some(Commands::CheckConfig)) {
        match config.validate() {
            Ok(()) => {
                println!("Configuration is valid.");
                return Ok(());
            }
            Err(issues) => {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("- {}: {}", issue.field, issue.message);
                }
                std::process::exit(1);
            }
        }
    }

    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    let mut guard_holder = None;
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .expect("Failed to open log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        guard_holder = Some(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }
    let _ = guard_holder; // keep the guard alive

    let state = AppStateBuilder::new().with_config(config).build().await?;
    info!(
        ari = state.config.ari.url,
        realtime = state.config.realtime.url,
        "starting voicebridge"
    );
    app::run(state).await
}
