use std::env;
use std::num::ParseIntError;

#[derive(Debug, Clone)]
/// Service configuration from the command line and environment.
pub struct Config {
    /// Address the gRPC service listens on, `host:port`.
    pub listen_addr: String,
    /// Port for the HTTP metrics server (Prometheus).
    pub metrics_port: u16,
    /// Logging level (e.g., "info", "debug").
    pub rust_log: String,
    /// STUN server handed to new peer connections.
    pub stun_url: String,
}

#[derive(Debug)]
/// Errors that can occur during configuration loading.
pub enum ConfigError {
    /// The listen address did not contain a usable `host:port`.
    InvalidAddress(String),
    /// A port value could not be parsed as a 16-bit integer.
    InvalidPort(String, ParseIntError),
    /// A port value was 0, which is logically invalid for this service.
    PortOutOfRange(u16),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidAddress(addr) => {
                write!(f, "listen address '{}' is not host:port", addr)
            }
            ConfigError::InvalidPort(var, err) => {
                write!(f, "{} must be a valid port number ({})", var, err)
            }
            ConfigError::PortOutOfRange(port) => {
                write!(f, "port must be between 1 and 65535 (got {})", port)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builds the configuration from process arguments and environment.
///
/// The first positional argument is the listen address (default
/// `:50051`); a bare `:port` binds all interfaces. The `PORT`
/// environment variable overrides the port. `RUST_LOG`, `METRICS_PORT`,
/// and `STUN_URL` are optional.
pub fn load(args: &[String]) -> Result<Config, ConfigError> {
    let addr_arg = args.get(1).cloned().unwrap_or_else(|| ":50051".to_string());

    let (host, port_str) = addr_arg
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr_arg.clone()))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };

    let mut port: u16 = port_str
        .parse()
        .map_err(|e| ConfigError::InvalidPort("listen address".to_string(), e))?;

    // PORT overrides whatever the address carried.
    if let Ok(override_port) = env::var("PORT") {
        port = override_port
            .parse()
            .map_err(|e| ConfigError::InvalidPort("PORT".to_string(), e))?;
    }

    if port == 0 {
        return Err(ConfigError::PortOutOfRange(port));
    }

    // Optional: RUST_LOG (defaults to "info")
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    // Optional: METRICS_PORT (defaults to 3030)
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "3030".to_string())
        .parse()
        .map_err(|e| ConfigError::InvalidPort("METRICS_PORT".to_string(), e))?;

    // Optional: STUN_URL
    let stun_url =
        env::var("STUN_URL").unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string());

    Ok(Config {
        listen_addr: format!("{}:{}", host, port),
        metrics_port,
        rust_log,
        stun_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
    }

    // Helper to set up and tear down environment variables for tests
    struct EnvGuard<'a> {
        vars: Vec<String>,
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap();
            let mut this = EnvGuard {
                vars: Vec::new(),
                _guard: guard,
            };
            // Make sure ambient values never leak into a test.
            for var in ["PORT", "RUST_LOG", "METRICS_PORT", "STUN_URL"] {
                this.unset(var);
            }
            this
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
            self.vars.push(key.to_string());
        }

        fn unset(&mut self, key: &str) {
            env::remove_var(key);
            self.vars.push(key.to_string());
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in &self.vars {
                env::remove_var(var);
            }
        }
    }

    fn args(addr: Option<&str>) -> Vec<String> {
        let mut v = vec!["transcoder".to_string()];
        if let Some(addr) = addr {
            v.push(addr.to_string());
        }
        v
    }

    #[test]
    fn test_defaults() {
        let _guard = EnvGuard::new();
        let config = load(&args(None)).expect("expected valid configuration");
        assert_eq!(config.listen_addr, "0.0.0.0:50051");
        assert_eq!(config.metrics_port, 3030);
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_positional_address() {
        let _guard = EnvGuard::new();
        let config = load(&args(Some("127.0.0.1:9000"))).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_bare_port_address() {
        let _guard = EnvGuard::new();
        let config = load(&args(Some(":6000"))).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:6000");
    }

    #[test]
    fn test_port_env_override() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "7000");
        let config = load(&args(Some(":6000"))).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:7000");
    }

    #[test]
    fn test_invalid_port_env() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "not-a-number");
        let result = load(&args(None));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(_, _)));
        assert!(err.to_string().contains("PORT must be a valid port number"));
    }

    #[test]
    fn test_port_out_of_range() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "0");
        let result = load(&args(None));
        assert!(matches!(result, Err(ConfigError::PortOutOfRange(0))));
    }

    #[test]
    fn test_invalid_address() {
        let _guard = EnvGuard::new();
        let result = load(&args(Some("no-port-here")));
        assert!(matches!(result, Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_rust_log_and_metrics_port() {
        let mut guard = EnvGuard::new();
        guard.set("RUST_LOG", "debug");
        guard.set("METRICS_PORT", "9090");
        let config = load(&args(None)).unwrap();
        assert_eq!(config.rust_log, "debug");
        assert_eq!(config.metrics_port, 9090);
    }
}
