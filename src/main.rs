use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use topicstream::cli::{Cli, Commands};
use topicstream::config;
use topicstream::pipeline::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => match config::load_from_process_env() {
            Ok(cfg) => {
                println!("configuration OK");
                println!("  mastodon instance: {}", cfg.mastodon.instance_url);
                println!("  rss enabled:       {}", cfg.rss.enabled);
                println!("  reddit enabled:    {}", cfg.reddit.enabled);
                Ok(())
            }
            Err(errors) => {
                eprintln!("configuration invalid:");
                for e in &errors {
                    eprintln!("  - {}", e);
                }
                std::process::exit(1);
            }
        },
        Commands::Run => run().await,
    }
}

async fn run() -> anyhow::Result<()> {
    let config = config::load_from_process_env().map_err(|errors| {
        for e in &errors {
            tracing::error!("{}", e);
        }
        anyhow::anyhow!("invalid configuration ({} error(s))", errors.len())
    })?;

    let pipeline = Pipeline::new(config).await?;
    pipeline.run().await?;
    Ok(())
}

/// Structured logging via `tracing`, matching the rest of the pack's
/// `tracing` + `tracing-subscriber` (env-filter + fmt) stack. `RUST_LOG`
/// defaults to info-level for this crate and warn for its dependencies.
/// `LOG_FORMAT=json` switches to newline-delimited JSON for log
/// aggregators; anything else (including unset) keeps the human-readable
/// formatter used during local development.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("topicstream=info,warn"));

    let json_output = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json_output {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
