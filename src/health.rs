use tonic_health::pb::health_server::Health;
use tonic_health::server::health_reporter;
use tracing::info;

/// Creates and initializes the gRPC health service
///
/// This implements the standard gRPC health checking protocol
/// (https://github.com/grpc/grpc/blob/master/doc/health-checking.md)
/// so deployment probes can query the serving status of the service.
pub fn create_health_service() -> (
    tonic_health::server::HealthReporter,
    tonic_health::pb::health_server::HealthServer<impl Health>,
) {
    let (reporter, service) = health_reporter();

    info!("Health service initialized - ready to serve health checks");

    (reporter, service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_service_creation() {
        let (_reporter, _service) = create_health_service();
        // If we get here without panicking, the service was created successfully
    }
}
