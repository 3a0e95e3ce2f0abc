use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod app;
mod http;
mod pipeline;
mod store;
mod token;

#[derive(Parser)]
#[command(name = "m365-gateway", about = "OpenAI-compatible proxy for M365 Copilot")]
struct Args {
    /// Path to the TOML config file (default: ./m365-proxy.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = m365_core::config::ProxyConfig::load(args.config.as_deref())
        .unwrap_or_else(|e| {
            eprintln!("config load failed ({e}), using defaults");
            m365_core::config::ProxyConfig::default()
        });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    let addr: SocketAddr = config.listen_url.parse()?;
    let state = Arc::new(app::AppState::new(config)?);
    let router = app::build_router(state);

    info!("m365 proxy listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
