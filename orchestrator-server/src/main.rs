//! HTTP server exposing the task orchestrator's command surface.

mod error;
mod review_page;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use orchestrator::Orchestrator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "orchestrator-server")]
#[command(about = "HTTP server for sandboxed plan/execute/test/review tasks")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Project directory (contains .orchestrator/)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Config file (defaults to .orchestrator/config.toml under the project directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orchestrator_server=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    info!(project_dir = %project_dir.display(), "starting orchestrator-server");

    let orchestrator = Orchestrator::open(&project_dir, args.config.as_deref())
        .with_context(|| format!("open orchestrator in {}", project_dir.display()))?;
    info!(
        source_root = %orchestrator.config().source_root.display(),
        workspace_root = %orchestrator.config().workspace_root.display(),
        concurrency_limit = orchestrator.gate().limit(),
        "orchestrator ready"
    );

    let state = AppState::new(orchestrator)?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::app(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
