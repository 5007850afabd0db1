//! courier: sidecar pub/sub runtime
//!
//! Serves `courier.v1.Runtime` to the application and delivers broker
//! messages back to it, either pushed to its `AppCallback` service or over
//! `SubscribeTopicEvents` streams.
//!
//! ## Configuration
//! - `courier.yaml` in the working directory, or the file named by `COURIER_CONFIG`
//! - `COURIER__*` environment overrides (e.g. `COURIER__APP__ADDRESS`)
//! - `COURIER_LOG`: tracing filter (default: info)

use std::sync::Arc;

use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info};

use courier::bus::init_pubsubs;
use courier::clients::{AppClient, GrpcAppClient};
use courier::config::Config;
use courier::proto::runtime_server::RuntimeServer;
use courier::services::RuntimeService;
use courier::state::RuntimeState;
use courier::subscriber::Subscriber;
use courier::transport::{connect_to_address, serve_with_shutdown};
use courier::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting courier runtime");

    let pubsubs = init_pubsubs(&config.effective_pubsubs()).await?;

    let app: Option<Arc<dyn AppClient>> = match config.app.address.as_deref() {
        Some(address) => {
            let channel = if config.app.connect_retry {
                connect_with_retry("app", address, || connect_to_address(address)).await?
            } else {
                connect_to_address(address).await?
            };
            Some(Arc::new(GrpcAppClient::new(channel)))
        }
        None => {
            info!("No app address configured, callback delivery disabled");
            None
        }
    };

    let state = Arc::new(
        RuntimeState::new(pubsubs, app).with_stream_buffer(config.delivery.stream_buffer),
    );

    Subscriber::new(Arc::clone(&state))
        .start_subscribing()
        .await?;

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<RuntimeServer<RuntimeService>>()
        .await;
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;

    let router = Server::builder()
        .add_service(health_service)
        .add_service(RuntimeService::new(Arc::clone(&state)).into_server());

    let served = serve_with_shutdown(router, &config.server.transport, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    })
    .await;

    state.close().await;
    served?;

    info!("courier stopped");
    Ok(())
}
