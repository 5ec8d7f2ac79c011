// Daemon entry point: run/start/stop/status/restart.

use clap::{Parser, Subcommand};
use tracing::info;

use mcp_fleet::daemon::{Daemon, DEFAULT_PORT};
use mcp_fleet::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "mcp-fleetd", version, about = "MCP fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Control plane port
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Start the daemon in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Report whether the daemon is running
    Status,
    /// Stop (if running) and start again
    Restart,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_panic_hook();
    init_tracing();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let daemon = Daemon::new(settings, cli.port)?;

    match cli.command {
        Command::Run => daemon.run().await?,
        Command::Start => daemon.start().await?,
        Command::Stop => daemon.stop().await?,
        Command::Status => println!("{}", daemon.status()),
        Command::Restart => {
            if let Err(e) = daemon.stop().await {
                info!(error = %e, "daemon was not running");
            }
            daemon.start().await?;
        }
    }
    Ok(())
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC: {message} at {location}");
    }));
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
