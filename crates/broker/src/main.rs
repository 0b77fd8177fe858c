use tributary_broker::config::{BrokerConfig, StartupError};
use tributary_broker::http;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        eprintln!("STARTUP_ERROR {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = BrokerConfig::load()?;
    let app = http::router(config.clone()).await?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|err| StartupError {
            code: "ERR_BIND_FAILED",
            message: format!("failed to bind {}: {}", config.bind_addr, err),
        })?;

    tracing::info!(bind_addr = %config.bind_addr, "tributary-broker listening");

    axum::serve(listener, app).await.map_err(|err| StartupError {
        code: "ERR_SERVER_FAILED",
        message: err.to_string(),
    })
}
