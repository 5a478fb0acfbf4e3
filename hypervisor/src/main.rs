use std::sync::Arc;

use agent_hypervisor::{
    api, config::Config, db, gateway::HttpSandboxGateway, interrupt::WsConnector,
    notifier::LogNotifier, AppState,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_hypervisor=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, gateway = %config.gateway_base_url, "hypervisor starting");

    // Database
    let db = db::connect(&config.database_url).await?;

    // Sandbox gateway
    let gateway = Arc::new(HttpSandboxGateway::new(
        &config.gateway_base_url,
        config.gateway_token.clone(),
        config.gateway_request_timeout,
    )?);

    let state = Arc::new(AppState::build(
        &config,
        db,
        gateway,
        Arc::new(WsConnector),
        Arc::new(LogNotifier),
    ));

    // Background jobs
    tokio::spawn(Arc::clone(&state.sweeper).run(config.stale_task_sweep_interval));
    tokio::spawn(Arc::clone(&state.reconciler).run(config.reconcile_interval));

    let app = api::router(Arc::clone(&state)).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
