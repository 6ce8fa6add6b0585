use modelgate::config::Settings;
use modelgate::server::create_app;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelgate=info,tower_http=info".into()),
        )
        .init();

    let settings = Settings::load()?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    // 本地推理引擎按部署注入；默认构建不携带任何引擎
    let app = create_app(settings, None).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("modelgate listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
