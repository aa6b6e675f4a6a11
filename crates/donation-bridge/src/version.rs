//! Version information for the bridge.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported at startup and handed to workers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Host bridge version.
    pub bridge: &'static str,
    /// Version reported by the script package, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            script: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, version: impl Into<String>) -> Self {
        self.script = Some(version.into());
        self
    }
}
