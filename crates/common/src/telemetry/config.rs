/// Logging and OTLP export settings for one service
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryConfig {
    /// Reported as the OTEL `service.name` resource attribute
    pub service_name: String,
    /// OTLP/gRPC collector endpoint, only used when export is enabled
    pub otel_endpoint: String,
    pub otel_enabled: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_level: String,
}

impl TelemetryConfig {
    /// Stdout JSON logging only
    pub fn new(service_name: impl Into<String>, log_level: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_level: log_level.into(),
            ..Default::default()
        }
    }

    /// Also export spans and log records to the collector at `endpoint`
    pub fn with_otlp_export(mut self, endpoint: impl Into<String>) -> Self {
        self.otel_endpoint = endpoint.into();
        self.otel_enabled = true;
        self
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sensor-ingest".to_string(),
            otel_endpoint: "http://localhost:4317".to_string(),
            otel_enabled: false,
            log_level: "info".to_string(),
        }
    }
}
