//! Connection options: broker address, credentials, client identity, last will.

use std::fmt;

use serde::Deserialize;

use crate::subscriptions::namespaced;

/// Which side of the adapter a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Listener,
    Publisher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Publisher => "publisher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker credentials, as stored in the secrets JSON file.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything that identifies a physical connection.
///
/// Two roles whose configs compare equal share one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub url: String,
    pub credentials: Option<Credentials>,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Identity components used to build broker client ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub service_name: String,
    pub host: String,
    pub instance_id: String,
}

impl ClientIdentity {
    /// `{service}_{host}_{instance}_{role}`; unique per role so two roles never
    /// collide on the broker.
    pub fn client_id(&self, role: Role) -> String {
        format!(
            "{}_{}_{}_{}",
            self.service_name, self.host, self.instance_id, role
        )
    }
}

/// Message the broker publishes on our behalf after an abnormal disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
}

impl LastWill {
    /// Last will on `{namespace}/log` (bare `log` for the null namespace) naming the service.
    pub fn for_service(namespace: &str, service_name: &str) -> Self {
        let payload = serde_json::json!({
            "service": service_name,
            "event": "last will",
        });
        Self {
            topic: namespaced(namespace, "log"),
            payload: payload.to_string(),
        }
    }
}

/// Parsed broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid broker url {url:?}: {reason}")]
pub struct AddressError {
    pub url: String,
    pub reason: String,
}

impl BrokerAddress {
    pub const DEFAULT_PORT: u16 = 1883;
    pub const DEFAULT_TLS_PORT: u16 = 8883;

    /// Parse `tcp://host:port`, `mqtt://`, `ssl://`, `tls://` or `mqtts://` urls.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let err = |reason: &str| AddressError {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let parsed = url::Url::parse(raw).map_err(|e| err(&e.to_string()))?;
        let tls = match parsed.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => return Err(err(&format!("unsupported scheme '{other}'"))),
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| err("missing host"))?
            .to_string();
        let port = parsed.port().unwrap_or(if tls {
            Self::DEFAULT_TLS_PORT
        } else {
            Self::DEFAULT_PORT
        });

        Ok(Self { host, port, tls })
    }
}
