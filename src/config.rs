//! Command-line parsing and validation. Mirrors the original positional
//! CLI verbatim: `proxy <port> <telemetry:0|1> <blocklist-path>
//! [thread-count]`.

use std::fmt;
use std::path::PathBuf;

use clap::Parser;

pub const DEFAULT_THREADS: usize = 8;
pub const MIN_THREADS: usize = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multithreaded HTTPS CONNECT tunneling proxy")]
pub struct Args {
    /// Port to listen on
    pub port: u16,

    /// Telemetry flag: 0 or 1
    pub telemetry: u8,

    /// Path to the blocklist file
    pub blocklist_path: PathBuf,

    /// Number of worker threads (default 8, minimum 2)
    pub thread_count: Option<usize>,
}

impl Args {
    pub fn validate(self) -> Result<ProxyConfig, ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Args("port must be in 1-65535".into()));
        }

        let telemetry = match self.telemetry {
            0 => false,
            1 => true,
            other => return Err(ConfigError::Args(format!("telemetry must be 0 or 1, got {other}"))),
        };

        let thread_count = match self.thread_count {
            None => DEFAULT_THREADS,
            Some(n) if n >= MIN_THREADS => n,
            Some(n) => return Err(ConfigError::Args(format!("thread-count must be >= {MIN_THREADS}, got {n}"))),
        };

        if !self.blocklist_path.is_file() {
            return Err(ConfigError::Args(format!(
                "blocklist path {} is not a readable file",
                self.blocklist_path.display()
            )));
        }

        Ok(ProxyConfig {
            port: self.port,
            telemetry,
            blocklist_path: self.blocklist_path,
            thread_count,
        })
    }
}

/// Fully validated runtime configuration.
pub struct ProxyConfig {
    pub port: u16,
    pub telemetry: bool,
    pub blocklist_path: PathBuf,
    pub thread_count: usize,
}

#[derive(Debug)]
pub enum ConfigError {
    Args(String),
    Blocklist(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Args(msg) => write!(f, "invalid arguments: {msg}"),
            ConfigError::Blocklist(msg) => write!(f, "blocklist error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_telemetry_flag() {
        let args = Args {
            port: 8080,
            telemetry: 2,
            blocklist_path: PathBuf::from("/dev/null"),
            thread_count: None,
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn rejects_low_thread_count() {
        let args = Args {
            port: 8080,
            telemetry: 0,
            blocklist_path: PathBuf::from("/dev/null"),
            thread_count: Some(1),
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn defaults_thread_count() {
        let path = std::env::temp_dir().join(format!("connect-proxy-config-test-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let args = Args {
            port: 8080,
            telemetry: 0,
            blocklist_path: path.clone(),
            thread_count: None,
        };
        let config = args.validate().unwrap();
        assert_eq!(config.thread_count, DEFAULT_THREADS);

        std::fs::remove_file(&path).unwrap();
    }
}
