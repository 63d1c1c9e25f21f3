use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api_key_service::config::Config;
use api_key_service::consumer::{KafkaInboundQueue, QueueConsumer};
use api_key_service::http;
use api_key_service::services::credential::CredentialGenerator;
use api_key_service::services::mapping_publisher::{create_producer, KafkaMappingPublisher};
use api_key_service::services::{EventProcessor, HttpProfileForwarder};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        webhook_topic = %config.kafka.webhook_topic,
        mapping_topic = %config.kafka.mapping_topic,
        profile_service = %config.profile_service.url,
        max_in_flight = config.consumer.max_in_flight,
        "Starting api-key-service"
    );

    let producer = create_producer(&config.kafka).context("Failed to create Kafka producer")?;
    let publisher = Arc::new(KafkaMappingPublisher::new(
        producer.clone(),
        config.kafka.mapping_topic.clone(),
        config.kafka.publish_timeout,
    ));
    let forwarder = Arc::new(
        HttpProfileForwarder::from_config(&config.profile_service)
            .context("Failed to build profile service client")?,
    );
    let processor = EventProcessor::new(CredentialGenerator::new(), publisher, forwarder);

    let queue = Arc::new(
        KafkaInboundQueue::new(&config.kafka, &config.consumer, producer)
            .context("Failed to create Kafka consumer")?,
    );

    let server = http::server(config.http_port).context("Failed to bind ops HTTP server")?;
    let server_handle = server.handle();
    tokio::spawn(server);
    info!(port = config.http_port, "Health and metrics endpoints listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let consumer = QueueConsumer::new(queue, processor, &config.consumer, shutdown_rx);
    if let Err(e) = consumer.run().await {
        error!(error = %e, "Queue consumer terminated with error");
    }

    server_handle.stop(true).await;
    info!("api-key-service shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("api_key_service=info,rdkafka=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
