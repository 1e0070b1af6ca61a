use anyhow::Result;
use entitlement_service::{config::Config, init_tracing, serve};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_format);
    serve(config).await
}
