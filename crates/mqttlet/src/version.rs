//! Version information for the adapter.

/// Adapter version from Cargo.toml
pub const MQTTLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Adapter version.
    pub mqttlet: &'static str,
    /// Name of the service this adapter fronts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Operating mode (process or bridge).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            mqttlet: MQTTLET_VERSION,
            service: None,
            mode: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_mode(mut self, mode: &'static str) -> Self {
        self.mode = Some(mode);
        self
    }
}
