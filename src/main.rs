use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,novel_assistant=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = novel_assistant::config::AppConfig::from_env();
    let state = novel_assistant::build_state(&config).await?;
    let app = novel_assistant::build_app(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, data_dir = %config.data_dir.display(), "novel assistant listening");

    axum::serve(listener, app).await?;
    Ok(())
}
