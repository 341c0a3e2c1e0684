use tokio::signal;
use tonic::transport::Server;
use tracing::info;
use warp::Filter;

use transcoder::pb::transcoder::transcoder_server::TranscoderServer;
use transcoder::metrics::register_metrics;
use transcoder::peer::rtc_config;
use transcoder::TranscoderService;

mod config;
mod logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Validate arguments and environment before starting the server
    let args: Vec<String> = std::env::args().collect();
    let cfg = config::load(&args).unwrap_or_else(|e| {
        eprintln!("Configuration failed: {}", e);
        std::process::exit(1);
    });

    // Initialize tracing with validated RUST_LOG
    logging::init(&cfg.rust_log);

    // Initialize Metrics
    register_metrics();

    // Start Metrics Server
    let metrics_port = cfg.metrics_port;
    let metrics_handle = tokio::spawn(async move {
        let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
            use prometheus::Encoder;
            let encoder = prometheus::TextEncoder::new();
            let mut buffer = vec![];
            let metric_families = prometheus::gather();
            encoder.encode(&metric_families, &mut buffer).unwrap();
            String::from_utf8(buffer).unwrap()
        });

        info!("Metrics server listening on 0.0.0.0:{}", metrics_port);
        warp::serve(metrics_route)
            .run(([0, 0, 0, 0], metrics_port))
            .await;
    });

    let addr = cfg.listen_addr.parse()?;
    let service = TranscoderService::new(rtc_config(&cfg.stun_url));

    info!("Transcoder listening on {}", addr);

    // Initialize health service
    let (_health_reporter, health_service) = transcoder::health::create_health_service();

    // Create shutdown signal handler
    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal (SIGINT/SIGTERM)");
    };

    // The service stays reachable for shutdown after being handed to tonic.
    let service = std::sync::Arc::new(service);
    let server_result = Server::builder()
        .add_service(TranscoderServer::from_arc(service.clone()))
        .add_service(health_service)
        .serve_with_shutdown(addr, shutdown_signal)
        .await;

    // Shutdown sequence
    info!("Shutting down - closing active sessions...");
    service.shutdown().await;
    info!("Transcoder shutdown complete");

    // Abort metrics server
    metrics_handle.abort();

    server_result?;
    Ok(())
}
