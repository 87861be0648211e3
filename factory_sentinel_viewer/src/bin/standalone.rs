use factory_sentinel_viewer::{DEFAULT_BIND_ADDR, ServerConfig, start_server};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Bind address and state directory from env or defaults
    let cfg = ServerConfig {
        bind_addr: std::env::var("SENTINEL_VIEWER_BIND").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
        state_dir: std::env::var("SENTINEL_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".")),
    };

    let handle = start_server(cfg).await?;
    // Park forever
    handle.await.ok();
    Ok(())
}
