use async_trait::async_trait;
use cloudlink::config::CloudOptions;
use cloudlink::lifecycle::ConfiguredDevice;
use cloudlink::payload::Payload;
use cloudlink::router::MessageRouter;
use cloudlink::rpc::{HandlerError, RequestContext, RequestHandler};
use cloudlink::transport::{MqttSession, TransportListener};
use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Application id of the built-in status resource
const STATUS_APPLICATION: &str = "CONN";
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers `GET` with the connection state of the gateway
struct StatusHandler {
    router: Weak<MessageRouter>,
}

#[async_trait]
impl RequestHandler for StatusHandler {
    async fn do_get(
        &self,
        _context: &RequestContext,
        _request: &Payload,
    ) -> Result<Payload, HandlerError> {
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| HandlerError::Internal("router is gone".to_string()))?;
        let mut reply = Payload::new();
        reply.add_metric("connection.state", format!("{:?}", router.state()));
        reply.add_metric("connection.connected", router.is_connected());
        reply.add_metric("application.ids", router.application_ids().join(","));
        Ok(reply)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = CloudOptions::default_path();
    let options = CloudOptions::load_or_default(path.as_deref())
        .map_err(|e| eyre!("Failed to load connector options: {}", e))?;
    info!(
        "Starting cloudlink for {} on {}:{}",
        options.topic.client_id, options.broker.host, options.broker.port
    );

    let session = MqttSession::configure(&options.broker, &options.topic.client_id);
    let device = Arc::new(ConfiguredDevice::new(options.device.clone()));
    let router = MessageRouter::new(options, session.transport(), device);

    let listener: Weak<dyn TransportListener> = Arc::<MessageRouter>::downgrade(&router);
    let session = session.start(listener);

    router
        .register_request_handler(
            STATUS_APPLICATION,
            Arc::new(StatusHandler {
                router: Arc::downgrade(&router),
            }),
        )
        .await;

    if let Err(e) = router.connect().await {
        warn!("Initial connection failed: {}", e);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    if let Err(e) = router.disconnect(DISCONNECT_TIMEOUT).await {
        warn!("Disconnect failed: {}", e);
    }
    router.shutdown().await;
    let _stopped = session.stop().await;
    info!("cloudlink stopped");

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
