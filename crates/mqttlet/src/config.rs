//! Adapter configuration, collected once at startup.
//!
//! Everything the adapter needs is read from the environment into an immutable
//! [`AdapterConfig`] and passed down explicitly; no component reads the
//! environment on its own.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::{ClientIdentity, ConnectionConfig, Credentials, LastWill};
use crate::router::{Mode, RouterConfig, UnknownMode};
use crate::subscriptions::SubscriptionStore;
use crate::supervisor::{SpawnError, WorkerCommand};

pub const DEFAULT_SERVICE_NAME: &str = "mqtt-service-adapter";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_BROKER_URL: &str = "tcp://mqtt:1883";
pub const DEFAULT_LISTENER_CREDENTIALS: &str = "/run/secrets/mqtt_listener.json";
pub const DEFAULT_PUBLISHER_CREDENTIALS: &str = "/run/secrets/mqtt_publisher.json";
pub const DEFAULT_PROCESSOR: &str = "/srv/processor";
pub const DEFAULT_SUBSCRIPTIONS: &str = "/srv/subscriptions.txt";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Random per-process identifier, shared by both connections and the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is set but empty")]
    Empty { var: &'static str },

    #[error("failed to read credentials from {path}: {source}")]
    CredentialsRead { path: PathBuf, source: io::Error },

    #[error("invalid credentials file {path}: {source}")]
    CredentialsParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("ADAPTER_MODE: {0}")]
    Mode(#[from] UnknownMode),

    #[error("SHUTDOWN_GRACE_MS must be a number of milliseconds, got {0:?}")]
    Grace(String),
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub service_name: String,
    pub instance_id: InstanceId,
    pub host: String,
    pub mode: Mode,
    pub namespace_listener: String,
    pub namespace_publisher: String,
    pub listener: ConnectionConfig,
    pub publisher: ConnectionConfig,
    /// Raw worker command line, split on whitespace at spawn time.
    pub processor: String,
    /// `None` disables the subscription file.
    pub subscriptions: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

impl AdapterConfig {
    /// Defaults for everything; credentials are not loaded.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: InstanceId::new(),
            host: hostname(),
            mode: Mode::Process,
            namespace_listener: DEFAULT_NAMESPACE.to_string(),
            namespace_publisher: DEFAULT_NAMESPACE.to_string(),
            listener: ConnectionConfig::new(DEFAULT_BROKER_URL),
            publisher: ConnectionConfig::new(DEFAULT_BROKER_URL),
            processor: DEFAULT_PROCESSOR.to_string(),
            subscriptions: Some(PathBuf::from(DEFAULT_SUBSCRIPTIONS)),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let service_name = var("SERVICE_NAME", DEFAULT_SERVICE_NAME);
        let namespace = var("NAMESPACE", DEFAULT_NAMESPACE);
        let namespace_listener = var("NAMESPACE_LISTENER", &namespace);
        let namespace_publisher = var("NAMESPACE_PUBLISHER", &namespace);

        let listener = ConnectionConfig::new(var("MQTT_LISTENER_URL", DEFAULT_BROKER_URL))
            .with_credentials(credentials_from(
                "MQTT_LISTENER_CREDENTIALS",
                lookup("MQTT_LISTENER_CREDENTIALS"),
                DEFAULT_LISTENER_CREDENTIALS,
            )?);
        let publisher = ConnectionConfig::new(var("MQTT_PUBLISHER_URL", DEFAULT_BROKER_URL))
            .with_credentials(credentials_from(
                "MQTT_PUBLISHER_CREDENTIALS",
                lookup("MQTT_PUBLISHER_CREDENTIALS"),
                DEFAULT_PUBLISHER_CREDENTIALS,
            )?);

        let mode = match lookup("ADAPTER_MODE") {
            Some(raw) => raw.parse()?,
            None => Mode::Process,
        };

        let subscriptions = match lookup("SUBSCRIPTIONS") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(PathBuf::from(raw)),
            None => Some(PathBuf::from(DEFAULT_SUBSCRIPTIONS)),
        };

        let shutdown_grace = match lookup("SHUTDOWN_GRACE_MS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::Grace(raw))?,
            None => DEFAULT_SHUTDOWN_GRACE,
        };

        Ok(Self {
            namespace_listener,
            namespace_publisher,
            listener,
            publisher,
            mode,
            processor: var("SERVICE_PROCESSOR", DEFAULT_PROCESSOR),
            subscriptions,
            shutdown_grace,
            ..Self::new(service_name)
        })
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_namespaces(
        mut self,
        listener: impl Into<String>,
        publisher: impl Into<String>,
    ) -> Self {
        self.namespace_listener = listener.into();
        self.namespace_publisher = publisher.into();
        self
    }

    pub fn with_listener(mut self, listener: ConnectionConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_publisher(mut self, publisher: ConnectionConfig) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = processor.into();
        self
    }

    pub fn with_subscriptions(mut self, path: Option<PathBuf>) -> Self {
        self.subscriptions = path;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Listener and publisher use one physical connection when configured identically.
    pub fn shares_connection(&self) -> bool {
        self.listener == self.publisher
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig::new(
            self.mode,
            self.namespace_listener.clone(),
            self.namespace_publisher.clone(),
        )
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            service_name: self.service_name.clone(),
            host: self.host.clone(),
            instance_id: self.instance_id.to_string(),
        }
    }

    pub fn last_will(&self) -> LastWill {
        LastWill::for_service(&self.namespace_publisher, &self.service_name)
    }

    /// Worker command line plus the identity variables the worker expects.
    pub fn worker_command(&self) -> Result<WorkerCommand, SpawnError> {
        Ok(WorkerCommand::parse(&self.processor)?
            .with_env("SERVICE_NAME", &self.service_name)
            .with_env("SERVICE_UUID", self.instance_id.to_string())
            .with_env("SERVICE_HOST", &self.host)
            .with_env("NAMESPACE_LISTENER", &self.namespace_listener)
            .with_env("NAMESPACE_PUBLISHER", &self.namespace_publisher))
    }

    pub fn subscription_store(&self) -> SubscriptionStore {
        match &self.subscriptions {
            Some(path) => SubscriptionStore::new(path),
            None => SubscriptionStore::in_memory(),
        }
    }
}

/// Resolve a credentials variable. Unset falls back to `default`; a missing file
/// means the connection is anonymous.
fn credentials_from(
    var: &'static str,
    value: Option<String>,
    default: &str,
) -> Result<Option<Credentials>, ConfigError> {
    let path = match value {
        Some(raw) if raw.trim().is_empty() => return Err(ConfigError::Empty { var }),
        Some(raw) => PathBuf::from(raw),
        None => PathBuf::from(default),
    };
    load_credentials(&path)
}

pub fn load_credentials(path: &Path) -> Result<Option<Credentials>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No credentials file, connecting anonymously");
            return Ok(None);
        }
        Err(source) => {
            return Err(ConfigError::CredentialsRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let credentials = serde_json::from_str(&content).map_err(|source| ConfigError::CredentialsParse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(credentials))
}

#[cfg(unix)]
fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read hostname");
            "unknown".to_string()
        }
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn missing_creds() -> [(&'static str, &'static str); 2] {
        [
            ("MQTT_LISTENER_CREDENTIALS", "/nonexistent/listener.json"),
            ("MQTT_PUBLISHER_CREDENTIALS", "/nonexistent/publisher.json"),
        ]
    }

    #[test]
    fn defaults() {
        let config = AdapterConfig::from_lookup(lookup(&missing_creds())).unwrap();
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.namespace_listener, "default");
        assert_eq!(config.namespace_publisher, "default");
        assert_eq!(config.listener.url, DEFAULT_BROKER_URL);
        assert_eq!(config.mode, Mode::Process);
        assert_eq!(config.processor, "/srv/processor");
        assert_eq!(
            config.subscriptions.as_deref(),
            Some(Path::new("/srv/subscriptions.txt"))
        );
        assert_eq!(config.shutdown_grace, Duration::from_millis(100));
        assert!(config.shares_connection());
    }

    #[test]
    fn role_namespaces_override_namespace() {
        let mut vars = missing_creds().to_vec();
        vars.extend([("NAMESPACE", "shared"), ("NAMESPACE_PUBLISHER", "out")]);
        let config = AdapterConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.namespace_listener, "shared");
        assert_eq!(config.namespace_publisher, "out");
    }

    #[test]
    fn blank_subscriptions_disables_file() {
        let mut vars = missing_creds().to_vec();
        vars.push(("SUBSCRIPTIONS", ""));
        let config = AdapterConfig::from_lookup(lookup(&vars)).unwrap();
        assert!(config.subscriptions.is_none());
        assert!(config.subscription_store().path().is_none());
    }

    #[test]
    fn mode_from_env() {
        let mut vars = missing_creds().to_vec();
        vars.push(("ADAPTER_MODE", "bridge"));
        let config = AdapterConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.mode, Mode::Bridge);

        let mut vars = missing_creds().to_vec();
        vars.push(("ADAPTER_MODE", "sideways"));
        assert!(matches!(
            AdapterConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Mode(_))
        ));
    }

    #[test]
    fn bad_grace_is_rejected() {
        let mut vars = missing_creds().to_vec();
        vars.push(("SHUTDOWN_GRACE_MS", "soon"));
        assert!(matches!(
            AdapterConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Grace(_))
        ));
    }

    #[test]
    fn empty_credentials_var_is_an_error() {
        let vars = [("MQTT_LISTENER_CREDENTIALS", " ")];
        assert!(matches!(
            AdapterConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Empty {
                var: "MQTT_LISTENER_CREDENTIALS"
            })
        ));
    }

    #[test]
    fn credentials_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listener.json");
        std::fs::write(&path, r#"{"username":"svc","password":"pw"}"#).unwrap();
        let path_str = path.to_str().unwrap();

        let vars = [
            ("MQTT_LISTENER_CREDENTIALS", path_str),
            ("MQTT_PUBLISHER_CREDENTIALS", "/nonexistent/publisher.json"),
        ];
        let config = AdapterConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(
            config.listener.credentials,
            Some(Credentials {
                username: "svc".to_string(),
                password: "pw".to_string()
            })
        );
        assert!(config.publisher.credentials.is_none());
        assert!(!config.shares_connection());
    }

    #[test]
    fn malformed_credentials_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listener.json");
        std::fs::write(&path, "username=svc").unwrap();
        assert!(matches!(
            load_credentials(&path),
            Err(ConfigError::CredentialsParse { .. })
        ));
    }

    #[test]
    fn different_urls_do_not_share() {
        let config = AdapterConfig::new("echo")
            .with_publisher(ConnectionConfig::new("tcp://other:1883"));
        assert!(!config.shares_connection());
    }

    #[test]
    fn worker_command_carries_identity_env() {
        let config = AdapterConfig::new("echo")
            .with_processor("/srv/processor --fast")
            .with_namespaces("in", "out");
        let command = config.worker_command().unwrap();

        assert_eq!(command.program, "/srv/processor");
        assert_eq!(command.args, vec!["--fast"]);
        let env: HashMap<_, _> = command.env.into_iter().collect();
        assert_eq!(env["SERVICE_NAME"], "echo");
        assert_eq!(env["SERVICE_UUID"], config.instance_id.to_string());
        assert_eq!(env["SERVICE_HOST"], config.host);
        assert_eq!(env["NAMESPACE_LISTENER"], "in");
        assert_eq!(env["NAMESPACE_PUBLISHER"], "out");
    }

    #[test]
    fn empty_processor_is_rejected_at_spawn_time() {
        let config = AdapterConfig::new("echo").with_processor("  ");
        assert!(matches!(
            config.worker_command(),
            Err(SpawnError::EmptyCommand)
        ));
    }

    #[test]
    fn last_will_targets_publisher_namespace() {
        let config = AdapterConfig::new("echo").with_namespaces("in", "out");
        assert_eq!(config.last_will().topic, "out/log");
    }

    #[test]
    fn instance_id_round_trips_through_display() {
        let id = InstanceId::new();
        assert_eq!(InstanceId::parse(&id.to_string()).unwrap(), id);
    }
}
