use crate::Args;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use validator::ValidateUrl;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub http: Http,
    pub ntfy: Ntfy,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Http {
    pub host: String,
    pub port: u16,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct Ntfy {
    /// Base URL of the ntfy server, notifications are POSTed here as JSON
    pub url: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Per-request timeout towards ntfy
    pub timeout_secs: u64,
}

impl Default for Ntfy {
    fn default() -> Self {
        Self {
            url: "https://ntfy.sh".into(),
            insecure: false,
            timeout_secs: 10,
        }
    }
}

impl Ntfy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from file");

        let config = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_norway::from_str(yaml)?)
    }

    /// Build the configuration from the optional config file and command line overrides
    pub fn load(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.with_overrides(args).validated()
    }

    fn with_overrides(mut self, args: &Args) -> Self {
        if let Some(port) = args.port {
            self.http.port = port;
        }

        if let Some(url) = &args.ntfy_url {
            self.ntfy.url = url.clone();
        }

        self
    }

    fn validated(mut self) -> Result<Self> {
        if !self.ntfy.url.validate_url() {
            anyhow::bail!("ntfy url '{}' is not a valid URL", self.ntfy.url);
        }

        let trimmed = self.ntfy.url.trim_end_matches('/').len();
        self.ntfy.url.truncate(trimmed);

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::load(&Args::default()).unwrap();

        assert_eq!(config.http.host, "0.0.0.0");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.ntfy.url, "https://ntfy.sh");
        assert!(!config.ntfy.insecure);
        assert_eq!(config.ntfy.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
ntfy:
  url: http://ntfy.internal:8080/
  timeoutSecs: 3
"#,
        )
        .unwrap();

        assert_eq!(config.http.port, 8080);
        assert_eq!(config.ntfy.url, "http://ntfy.internal:8080/");
        assert_eq!(config.ntfy.timeout_secs, 3);
    }

    #[test]
    fn test_args_override_file_values() {
        let args = Args {
            port: Some(9000),
            ntfy_url: Some("http://localhost:2586/".into()),
            ..Default::default()
        };

        let config = Config::default().with_overrides(&args).validated().unwrap();

        assert_eq!(config.http.port, 9000);
        assert_eq!(config.ntfy.url, "http://localhost:2586");
    }

    #[test]
    fn test_invalid_ntfy_url() {
        let args = Args {
            ntfy_url: Some("ntfy".into()),
            ..Default::default()
        };

        assert!(Config::load(&args).is_err());
    }
}
