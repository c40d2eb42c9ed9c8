use clap::Parser;
use tracing::info;
use veil_user_service::{router, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    info!(
        trust_domain = %config.trust_domain,
        service = %config.service_name,
        listen = %config.listen,
        "starting user service"
    );

    let state = AppState::from_config(&config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("user service listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
