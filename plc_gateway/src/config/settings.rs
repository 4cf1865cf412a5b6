use config::{Config, ConfigError, Environment};
use std::path::PathBuf;

/// Runtime settings for the gateway.
///
/// All values come from environment variables; tag and PLC metadata is
/// runtime-mutable through the REST API and never read from files.
#[derive(Debug, Clone)]
pub struct Settings {
    /// CompactLogix controller address (COMPACTLOGIX_IP).
    pub compactlogix_ip: Option<String>,
    /// SLC 5/05 controller address (SLC500_IP).
    pub slc500_ip: Option<String>,
    /// Poll loop period in seconds (POLL_PERIOD).
    pub poll_period: f64,
    /// Socket/read timeout for PLC drivers in seconds (PLC_SOCKET_TIMEOUT).
    pub plc_socket_timeout: f64,
    /// Base reconnect backoff in seconds (RECONNECT_BASE).
    pub reconnect_base: f64,
    /// Backoff cap in seconds (RECONNECT_MAX).
    pub reconnect_max: f64,
    /// Budget for the staged shutdown in seconds (SHUTDOWN_TIMEOUT).
    pub shutdown_timeout: f64,
    /// Optional readiness marker file path (READY_FILE).
    pub ready_file: Option<PathBuf>,
    /// Optional Prometheus exporter port (METRICS_PORT / PROMETHEUS_PORT).
    pub metrics_port: Option<u16>,
    /// Optional Loki push endpoint (LOKI_PUSH_URL).
    pub loki_push_url: Option<String>,
    /// REST listener port (HTTP_PORT).
    pub http_port: u16,
    /// Replace PLC drivers with in-process mocks (GATEWAY_MOCK_PLC).
    pub mock_plc: bool,
    /// Force a synthetic reconnect failure for tests
    /// (GATEWAY_MOCK_FAIL_RECONNECT).
    pub mock_fail_reconnect: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(Environment::default())
            .build()?;

        let metrics_port = cfg
            .get_int("metrics_port")
            .or_else(|_| cfg.get_int("prometheus_port"))
            .ok()
            .map(|p| p as u16);

        Ok(Settings {
            compactlogix_ip: cfg.get_string("compactlogix_ip").ok().filter(|s| !s.is_empty()),
            slc500_ip: cfg.get_string("slc500_ip").ok().filter(|s| !s.is_empty()),
            poll_period: cfg.get_float("poll_period").unwrap_or(1.0),
            plc_socket_timeout: cfg.get_float("plc_socket_timeout").unwrap_or(2.0),
            reconnect_base: cfg.get_float("reconnect_base").unwrap_or(1.0),
            reconnect_max: cfg.get_float("reconnect_max").unwrap_or(60.0),
            shutdown_timeout: cfg.get_float("shutdown_timeout").unwrap_or(5.0),
            ready_file: cfg
                .get_string("ready_file")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            metrics_port,
            loki_push_url: cfg.get_string("loki_push_url").ok().filter(|s| !s.is_empty()),
            http_port: cfg.get_int("http_port").ok().map(|p| p as u16).unwrap_or(5000),
            mock_plc: flag(cfg.get_string("gateway_mock_plc").ok()),
            mock_fail_reconnect: flag(cfg.get_string("gateway_mock_fail_reconnect").ok()),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            compactlogix_ip: None,
            slc500_ip: None,
            poll_period: 1.0,
            plc_socket_timeout: 2.0,
            reconnect_base: 1.0,
            reconnect_max: 60.0,
            shutdown_timeout: 5.0,
            ready_file: None,
            metrics_port: None,
            loki_push_url: None,
            http_port: 5000,
            mock_plc: false,
            mock_fail_reconnect: false,
        }
    }
}

// Accepts the spellings orchestration tooling historically used.
fn flag(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true") | Some("True"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_accepts_known_truthy_spellings() {
        assert!(flag(Some("1".into())));
        assert!(flag(Some("true".into())));
        assert!(flag(Some("True".into())));
        assert!(!flag(Some("0".into())));
        assert!(!flag(Some("yes".into())));
        assert!(!flag(None));
    }
}
