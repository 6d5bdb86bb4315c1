//! Logging Setup
//!
//! Installs the global `tracing` subscriber. Output goes to stderr so the
//! line protocol on stdout stays machine-readable. `RUST_LOG` directives
//! refine the configured level.

use anyhow::{anyhow, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("Unknown log format: {}", other)),
        }
    }
}

/// Effective level: each `-v` raises the configured level one step
pub fn effective_level(config: &LoggingConfig, verbose: u8) -> Result<Level> {
    let configured: Level = config
        .level
        .to_lowercase()
        .parse()
        .map_err(|e| anyhow!("Failed to parse log level: {}", e))?;

    Ok(match verbose {
        0 => configured,
        1 => configured.max(Level::DEBUG),
        _ => Level::TRACE,
    })
}

/// Filter with `level` as the default directive
pub fn build_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global subscriber
///
/// Fails if a subscriber is already installed.
pub fn init(config: &LoggingConfig, verbose: u8) -> Result<()> {
    let level = effective_level(config, verbose)?;
    let format: LogFormat = config.format.parse()?;
    let builder = fmt()
        .with_env_filter(build_filter(level))
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing::{debug, info, warn};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    fn logging(level: &str, format: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            format: format.to_string(),
        }
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_verbose_raises_level() {
        let config = logging("warn", "compact");
        assert_eq!(effective_level(&config, 0).unwrap(), Level::WARN);
        assert_eq!(effective_level(&config, 1).unwrap(), Level::DEBUG);
        assert_eq!(effective_level(&config, 3).unwrap(), Level::TRACE);

        // -v never lowers an already verbose level
        let config = logging("trace", "compact");
        assert_eq!(effective_level(&config, 1).unwrap(), Level::TRACE);
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(effective_level(&logging("loud", "compact"), 0).is_err());
    }

    #[test]
    fn test_level_filtering() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            debug!("hidden detail");
            info!("visible line");
            warn!("visible warning");
        });

        let output = buf.contents();
        assert!(!output.contains("hidden detail"));
        assert!(output.contains("visible line"));
        assert!(output.contains("visible warning"));
    }

    #[test]
    fn test_json_output_is_parseable() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            info!(key = "user@example.com", decision = "denied", "Rate limit decision");
        });

        let output = buf.contents();
        let line = output.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["fields"]["message"], "Rate limit decision");
        assert_eq!(value["fields"]["key"], "user@example.com");
        assert_eq!(value["fields"]["decision"], "denied");
    }
}
