// Client entry point: connects to a daemon (or runs an in-process
// supervisor with --standalone) and prints the fleet.

use clap::Parser;

use mcp_fleet::control::{DirectApi, FleetApi, RemoteApi};
use mcp_fleet::settings::Settings;

const DEFAULT_DAEMON_ADDRESS: &str = "localhost:8080";

#[derive(Parser, Debug)]
#[command(name = "mcp-fleet", version, about = "MCP fleet client")]
struct Cli {
    /// Daemon address
    #[arg(long, default_value = DEFAULT_DAEMON_ADDRESS)]
    daemon: String,

    /// Run against an in-process supervisor instead of a daemon
    #[arg(long, conflicts_with = "daemon")]
    standalone: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let api: Box<dyn FleetApi> = if cli.standalone {
        let settings = Settings::from_env()?;
        Box::new(DirectApi::new(settings).await?)
    } else {
        match RemoteApi::connect(&cli.daemon).await {
            Ok(api) => Box::new(api),
            Err(e) => {
                eprintln!("Failed to connect to daemon at {}: {e}", cli.daemon);
                eprintln!();
                eprintln!("Make sure the daemon is running:");
                eprintln!("  mcp-fleetd start");
                eprintln!();
                eprintln!("Or run in standalone mode:");
                eprintln!("  mcp-fleet --standalone");
                std::process::exit(1);
            }
        }
    };

    let health = api.health().await?;
    println!(
        "Fleet healthy: {} running / {} configured (daemon uptime {}s)",
        health.running_count, health.total_count, health.uptime_seconds
    );
    println!();

    let (servers, _order) = api.list_servers().await?;
    println!(
        "{:<22} {:>6} {:<10} {:>6} {:>8}  {}",
        "NAME", "PORT", "STATUS", "TOOLS", "PID", "DESCRIPTION"
    );
    for server in &servers {
        let pid = if server.pid > 0 {
            server.pid.to_string()
        } else {
            "-".to_string()
        };
        let tools = if server.is_running() && server.tool_count > 0 {
            server.tool_count.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<22} {:>6} {:<10} {:>6} {:>8}  {}",
            server.name, server.port, server.status, tools, pid, server.description
        );
    }

    api.close().await;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    // Keep stdout clean for the listing; diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
