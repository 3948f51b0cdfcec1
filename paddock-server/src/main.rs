use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (PADDOCK_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("PADDOCK_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("paddock_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = paddock_server::config::ServerConfig::parse();
    tracing::info!("starting paddock node on {}", config.listen_addr());

    // Fatal bootstrap failures (unwritable data dir, corrupt identity) exit
    // non-zero here; after this point the loops absorb their own errors.
    let core = paddock_server::core::Core::bootstrap(config.clone()).await?;
    core.start().await;

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    tracing::info!("HTTP/WebSocket listening on {}", config.listen_addr());
    axum::serve(listener, paddock_server::web::router(core)).await?;
    Ok(())
}
