use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use fallwatch_lib::config::AppConfig;
use fallwatch_lib::pipeline::DispatchMode;
use fallwatch_lib::AppError;

#[derive(Parser, Debug)]
#[command(name = "fallwatch", about = "Wearable gyroscope stream to fall alert pipeline")]
struct Cli {
    /// Log filter when RUST_LOG is unset (e.g. "debug", "fallwatch_lib=trace")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to the sensor topic and classify incoming windows
    Run(RunArgs),
    /// Print recorded fall events as JSON lines
    Events(EventsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Sensor topic to subscribe to
    #[arg(long)]
    topic: Option<String>,

    /// Model weights file; without one windows are only collected
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Directory for labeled dataset windows
    #[arg(long, value_name = "DIR")]
    dataset_dir: Option<PathBuf>,

    /// Classify the newest samples on every tick instead of on triggers
    #[arg(long)]
    continuous: bool,
}

#[derive(Args, Debug)]
struct EventsArgs {
    /// SQLite database file
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Only events from this device
    #[arg(long)]
    device: Option<String>,

    #[arg(long, default_value = "50")]
    limit: usize,
}

impl RunArgs {
    fn into_config(self) -> Result<AppConfig, AppError> {
        let mut config = AppConfig::load(self.config.as_deref())?;

        if let Some(host) = self.host {
            config.transport.host = host;
        }
        if let Some(port) = self.port {
            config.transport.port = port;
        }
        if let Some(topic) = self.topic {
            config.transport.subscribe_topic = topic;
        }
        if let Some(model) = self.model {
            config.inference.model_path = Some(model);
        }
        if let Some(db) = self.db {
            config.storage.database_path = Some(db);
        }
        if let Some(dir) = self.dataset_dir {
            config.storage.dataset_dir = Some(dir);
        }
        if self.continuous {
            config.window.mode = DispatchMode::Continuous;
        }

        Ok(config)
    }
}

async fn execute(command: Command) -> Result<(), AppError> {
    match command {
        Command::Run(args) => {
            let config = args.into_config()?;
            let report = fallwatch_lib::run(config).await?;
            log::info!(
                "Session summary: {} windows, {} alerts, {} dropped",
                report.windows,
                report.alerts.len(),
                report.dropped
            );
        }
        Command::Events(args) => {
            let events = fallwatch_lib::list_events(args.db.as_deref(), args.device.as_deref(), args.limit)?;
            for event in events {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::error!("Failed to serialize event {}: {}", event.id, e),
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .init();

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("fallwatch: {}", e);
            ExitCode::FAILURE
        }
    }
}
