// Binary entry point for the relay gateway

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_gateway::{
    gateway_router, initialize_app_state, services::initialize_maintenance_tasks, ClientConn,
    NullRelay,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle version flag for Docker health checks - must be FIRST
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && args[1] == "--version" {
        println!("relay-gateway v{}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_gateway=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = relay_gateway::app_config::config();
    let bind_address = config.server.bind_address.clone();
    info!("=== STARTING RELAY GATEWAY ===");
    info!("Binding to {}", bind_address);

    // Provider adapters are wired in by the embedding deployment; the bare
    // binary refuses upstream traffic with 502 until one is configured.
    let state = match initialize_app_state(Arc::new(NullRelay)).await {
        Ok(state) => {
            info!("✓ Gateway state initialized successfully");
            state
        },
        Err(e) => {
            error!("✗ Failed to initialize gateway state: {}", e);
            return Err(e);
        },
    };

    initialize_maintenance_tasks(state.clone());

    let app = gateway_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on {}", bind_address);

    // Per-connection identity feeds the queue's socket-liveness checks
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<ClientConn>(),
    )
    .await?;

    Ok(())
}
