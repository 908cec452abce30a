//! Demo settings

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uart_mux::{LineConfig, MuxConfig};

/// Settings file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Mux sizing and diagnostics
    #[serde(default)]
    pub mux: MuxConfig,
    /// Line settings used when a real serial port is opened
    #[serde(default)]
    pub line: LineConfig,
}

impl Settings {
    /// Load settings from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
        settings.mux.validate()?;
        Ok(settings)
    }
}
