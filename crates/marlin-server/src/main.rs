use clap::Parser;
use marlin_common::{Result, ServerConfig, SnapshotConfig};
use marlin_server::Server;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// MarlinDB: a Redis-compatible in-memory data server.
#[derive(Debug, Parser)]
#[command(name = "marlin-server", version, about)]
struct Cli {
    /// Directory in which the RDB snapshot file resides.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Name of the RDB snapshot file.
    #[arg(long)]
    dbfilename: Option<String>,

    /// Host address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 6379)]
    port: u16,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            snapshot: SnapshotConfig {
                dir: self.dir,
                dbfilename: self.dbfilename,
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config();
    if let Err(err) = run(config).await {
        error!(%err, "server exited");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    let addr = config.bind_addr();
    let server = Server::new(config)?;
    server.load_snapshot()?;

    let listener = TcpListener::bind(&addr).await?;
    tokio::select! {
        result = server.run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            Ok(())
        }
    }
}
