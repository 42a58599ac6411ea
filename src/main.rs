use clap::{Parser, Subcommand};
use drawbridge::{serve, EnvConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(version, about, arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway: auth, proxy and tunnel server in one process
    Serve,

    /// Load configuration, initialize cluster state, then exit
    Configure,

    /// Hash a password for a user resource, reading it from stdin
    HashPassword,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_config = EnvConfig::load();
    let default_filter = if env_config.debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::from(default_filter))
        .init();

    info!("🌉 Drawbridge v{VERSION}");

    match Cli::parse().command {
        Some(Command::Serve) => serve().await?,
        Some(Command::Configure) => {
            drawbridge::initialize().await?;
        }
        Some(Command::HashPassword) => {
            let mut password = String::new();
            std::io::stdin().read_line(&mut password)?;
            let hash = drawbridge::auth::hash_password(password.trim())?;
            println!("{hash}");
        }
        None => {}
    }

    Ok(())
}
