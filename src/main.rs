use clap::{Parser, Subcommand};
use relaygram::config::Config;
use relaygram::{logging, runtime};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(
    name = "relaygram",
    version = VERSION,
    about = "Relay plain HTTP calls into Telegram chats using per-chat tokens"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Register the webhook and serve HTTP (default)
    Start,
    /// Validate configuration, open the store and report webhook status
    Check,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(MainCommand::Start) {
        MainCommand::Version => {
            println!("relaygram {VERSION}");
            Ok(())
        }
        MainCommand::Check => {
            let config = Config::load()?;
            let report = runtime::check(&config).await?;
            println!("Configuration: ok");
            println!("Storage: {}", config.storage_path);
            println!("Active tokens: {}", report.active_tokens);
            match report.webhook_url {
                Some(url) if report.webhook_matches => println!("Webhook: {url} (matches)"),
                Some(url) => println!("Webhook: {url} (expected {})", config.webhook_url),
                None => println!("Webhook: not registered"),
            }
            Ok(())
        }
        MainCommand::Start => {
            let config = Config::load()?;
            logging::init_logging(&config.log_level)?;
            info!("Starting relaygram {VERSION}");
            runtime::run(config).await
        }
    }
}
