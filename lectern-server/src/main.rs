use clap::Parser;
use lectern_server::{routes, state::AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "lectern-server", about = "Lectern creator support backend")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = lectern_core::load_config(args.config.as_deref())?;
    init_tracing(&config);

    let persistence = Arc::new(lectern_core::MemoryPersistence::new());
    let state = AppState::new(config.clone(), persistence)?;
    let app = routes::router(state);

    let addr: SocketAddr = config.server.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &lectern_core::LecternConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
