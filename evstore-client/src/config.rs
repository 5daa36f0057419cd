//! Connection settings and client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via EVSTORE_CONFIG)
//! 3. Environment variables

use evstore_protocol::{UserCredentials, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Behaviour of one logical connection: queues, retries, timers and TLS.
///
/// Durations are written as milliseconds in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Capacity of the connection actor's mailbox.
    pub max_queue_size: usize,
    /// Operations (and subscriptions) allowed in flight at once.
    pub max_concurrent_items: usize,
    /// Retries per operation; `-1` retries forever.
    pub max_retries: i32,
    /// Reconnection attempts before giving up; `-1` reconnects forever.
    pub max_reconnections: i32,
    #[serde(with = "duration_ms")]
    pub reconnection_delay: Duration,
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub operation_timeout_check_period: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub client_connection_timeout: Duration,
    /// Ask the server to reject requests on non-master nodes.
    pub require_master: bool,
    /// Fail timed-out operations instead of retrying them.
    pub fail_on_no_server_response: bool,
    /// Credentials used for authentication and for operations without their own.
    pub default_user_credentials: Option<UserCredentials>,
    pub tls: TlsSettings,
    /// Trace every package sent and received.
    pub verbose_logging: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 5000,
            max_concurrent_items: 5000,
            max_retries: 10,
            max_reconnections: 10,
            reconnection_delay: Duration::from_millis(100),
            operation_timeout: Duration::from_secs(7),
            operation_timeout_check_period: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(750),
            heartbeat_timeout: Duration::from_millis(1500),
            client_connection_timeout: Duration::from_millis(1000),
            require_master: true,
            fail_on_no_server_response: false,
            default_user_credentials: None,
            tls: TlsSettings::default(),
            verbose_logging: false,
        }
    }
}

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_concurrent_items(mut self, count: usize) -> Self {
        self.max_concurrent_items = count;
        self
    }

    pub fn with_max_retries(mut self, retries: i32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_unlimited_retries(mut self) -> Self {
        self.max_retries = -1;
        self
    }

    pub fn with_max_reconnections(mut self, reconnections: i32) -> Self {
        self.max_reconnections = reconnections;
        self
    }

    pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = delay;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_operation_timeout_check_period(mut self, period: Duration) -> Self {
        self.operation_timeout_check_period = period;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_client_connection_timeout(mut self, timeout: Duration) -> Self {
        self.client_connection_timeout = timeout;
        self
    }

    pub fn with_require_master(mut self, require: bool) -> Self {
        self.require_master = require;
        self
    }

    pub fn with_fail_on_no_server_response(mut self) -> Self {
        self.fail_on_no_server_response = true;
        self
    }

    pub fn with_default_credentials(mut self, credentials: UserCredentials) -> Self {
        self.default_user_credentials = Some(credentials);
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    /// Validates settings that would otherwise stall the actor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_queue_size must be positive".to_string(),
            ));
        }
        if self.max_concurrent_items == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_items must be positive".to_string(),
            ));
        }
        if self.max_retries < -1 {
            return Err(ConfigError::ValidationError(format!(
                "max_retries must be -1 or non-negative, got {}",
                self.max_retries
            )));
        }
        if self.max_reconnections < -1 {
            return Err(ConfigError::ValidationError(format!(
                "max_reconnections must be -1 or non-negative, got {}",
                self.max_reconnections
            )));
        }
        if self.operation_timeout_check_period.is_zero() {
            return Err(ConfigError::ValidationError(
                "operation_timeout_check_period must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(n) = var("EVSTORE_MAX_QUEUE_SIZE").and_then(|v| v.parse().ok()) {
            self.max_queue_size = n;
        }
        if let Some(n) = var("EVSTORE_MAX_CONCURRENT_ITEMS").and_then(|v| v.parse().ok()) {
            self.max_concurrent_items = n;
        }
        if let Some(n) = var("EVSTORE_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.max_retries = n;
        }
        if let Some(n) = var("EVSTORE_MAX_RECONNECTIONS").and_then(|v| v.parse().ok()) {
            self.max_reconnections = n;
        }
        if let Some(ms) = var("EVSTORE_OPERATION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = var("EVSTORE_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = var("EVSTORE_HEARTBEAT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(require) = var("EVSTORE_REQUIRE_MASTER") {
            self.require_master = parse_flag(&require);
        }
        if let Some(verbose) = var("EVSTORE_VERBOSE") {
            self.verbose_logging = parse_flag(&verbose);
        }
        if let (Some(username), Some(password)) = (var("EVSTORE_USERNAME"), var("EVSTORE_PASSWORD"))
        {
            self.default_user_credentials = Some(UserCredentials::new(username, password));
        }
        self.tls.apply_env_overrides(var);
    }
}

/// TLS settings for the server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Connect to the secure endpoint over TLS.
    pub enabled: bool,
    /// Host name used for SNI and certificate validation.
    pub target_host: Option<String>,
    /// Verify the server certificate (disable only in development).
    pub validate_server: bool,
    /// PEM bundle of trusted CAs; system roots when unset.
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            target_host: None,
            validate_server: true,
            ca_cert_path: None,
        }
    }
}

impl TlsSettings {
    pub fn new(target_host: impl Into<String>) -> Self {
        Self {
            enabled: true,
            target_host: Some(target_host.into()),
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.validate_server = false;
        self
    }

    fn apply_env_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("EVSTORE_TLS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Some(host) = var("EVSTORE_TLS_TARGET_HOST") {
            self.target_host = Some(host);
        }
        if let Some(validate) = var("EVSTORE_TLS_VALIDATE_SERVER") {
            self.validate_server = parse_flag(&validate);
        }
        if let Some(path) = var("EVSTORE_TLS_CA") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server TCP endpoint.
    #[serde(with = "socket_addr_serde")]
    pub endpoint: SocketAddr,
    /// Server TLS endpoint; `endpoint` is used when unset.
    #[serde(with = "opt_socket_addr_serde")]
    pub secure_endpoint: Option<SocketAddr>,
    pub connection: ConnectionSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            secure_endpoint: None,
            connection: ConnectionSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("EVSTORE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides(&|name| std::env::var(name).ok());
        config.connection.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("EVSTORE_ENDPOINT").and_then(|v| v.parse().ok()) {
            self.endpoint = addr;
        }
        if let Some(addr) = var("EVSTORE_SECURE_ENDPOINT").and_then(|v| v.parse().ok()) {
            self.secure_endpoint = Some(addr);
        }
        self.connection.apply_env_overrides(var);
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match addr {
            Some(addr) => serializer.serialize_some(&addr.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.max_queue_size, 5000);
        assert_eq!(settings.max_concurrent_items, 5000);
        assert_eq!(settings.max_retries, 10);
        assert_eq!(settings.max_reconnections, 10);
        assert_eq!(settings.operation_timeout, Duration::from_secs(7));
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(750));
        assert_eq!(settings.heartbeat_timeout, Duration::from_millis(1500));
        assert!(settings.require_master);
        assert!(!settings.fail_on_no_server_response);
        assert!(settings.tls.validate_server);
        assert!(settings.validate().is_ok());

        let config = ClientConfig::default();
        assert_eq!(config.endpoint.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let settings = ConnectionSettings::default().with_max_concurrent_items(0);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let settings = ConnectionSettings::default().with_max_retries(-5);
        assert!(settings.validate().is_err());

        let settings = ConnectionSettings::default()
            .with_unlimited_retries()
            .with_max_reconnections(-1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ClientConfig {
            secure_endpoint: Some("10.0.0.1:1115".parse().unwrap()),
            connection: ConnectionSettings::default()
                .with_default_credentials(UserCredentials::new("admin", "changeit"))
                .with_tls(TlsSettings::new("db.local")),
            ..ClientConfig::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ClientConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.endpoint, config.endpoint);
        assert_eq!(parsed.secure_endpoint, config.secure_endpoint);
        assert_eq!(parsed.connection.operation_timeout, Duration::from_secs(7));
        assert_eq!(
            parsed.connection.default_user_credentials,
            config.connection.default_user_credentials
        );
        assert_eq!(parsed.connection.tls.target_host.as_deref(), Some("db.local"));
    }

    #[test]
    fn test_from_file_with_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "endpoint: \"127.0.0.1:2113\"\nconnection:\n  max_retries: 3\n  operation_timeout: 250"
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint.port(), 2113);
        assert_eq!(config.connection.max_retries, 3);
        assert_eq!(
            config.connection.operation_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.connection.max_reconnections, 10);
    }

    #[test]
    fn test_from_file_errors() {
        let result = ClientConfig::from_file("/nonexistent/evstore.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_, _))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint: [not, an, address]").unwrap();
        let result = ClientConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_, _))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EVSTORE_ENDPOINT", "192.168.1.10:1113"),
            ("EVSTORE_MAX_RETRIES", "-1"),
            ("EVSTORE_OPERATION_TIMEOUT_MS", "1500"),
            ("EVSTORE_USERNAME", "ops"),
            ("EVSTORE_PASSWORD", "secret"),
            ("EVSTORE_TLS_ENABLED", "true"),
            ("EVSTORE_TLS_VALIDATE_SERVER", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_env_overrides(&|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.endpoint.port(), 1113);
        assert_eq!(config.endpoint.ip().to_string(), "192.168.1.10");
        assert_eq!(config.connection.max_retries, -1);
        assert_eq!(
            config.connection.operation_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(
            config.connection.default_user_credentials,
            Some(UserCredentials::new("ops", "secret"))
        );
        assert!(config.connection.tls.enabled);
        assert!(!config.connection.tls.validate_server);
    }
}
