// ============================================================================
// Logging Configuration
// ============================================================================

use crate::env_or;
use anyhow::{Result, bail};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, from RUST_LOG
    pub filter: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let format = match env_or("LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "text" | "pretty" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => bail!("unknown LOG_FORMAT '{}'", other),
        };
        Ok(Self {
            filter: env_or("RUST_LOG", "info"),
            format,
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
