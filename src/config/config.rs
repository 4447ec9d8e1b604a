use std::path::{Path, PathBuf};

use super::{
    cli::CliConfig,
    errors::ConfigError,
    gateway::GatewayConfig,
    types::LogLevel,
};

// -----------------------------------------------------------------------------
// ----- Config ----------------------------------------------------------------

/// Everything the binary needs, loaded once and passed down. There is no
/// process-wide instance.
#[derive(Clone, Debug)]
pub struct Config {
    pub config_file_location: PathBuf,
    pub log_level: LogLevel,
    pub gateway: GatewayConfig,
    /// `--threshold` / `CRABGATE_THRESHOLD`; wins over the file on every load.
    pub threshold_override: Option<i64>,
}

// -----------------------------------------------------------------------------
// ----- Config: Static --------------------------------------------------------

impl Config {
    /// CLI/ENV first, then the gateway file it points at.
    pub async fn load() -> Result<Config, ConfigError> {
        let cli = CliConfig::from_args()?;
        Self::from_cli(cli).await
    }

    pub async fn from_cli(cli: CliConfig) -> Result<Config, ConfigError> {
        must_exist_file(&cli.config_file_location)?;
        let gateway = GatewayConfig::from_file_async(&cli.config_file_location).await?;
        Self::assemble(cli, gateway)
    }

    /// Re-read the gateway file. On error the caller keeps its current config.
    pub async fn reload(&self) -> Result<Config, ConfigError> {
        let mut gateway = GatewayConfig::from_file_async(&self.config_file_location).await?;
        if let Some(threshold) = self.threshold_override {
            gateway.management_session_threshold = threshold;
        }
        Ok(Config {
            config_file_location: self.config_file_location.clone(),
            log_level: self.log_level,
            gateway,
            threshold_override: self.threshold_override,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Config: Private -------------------------------------------------------

impl Config {
    fn assemble(cli: CliConfig, mut gateway: GatewayConfig) -> Result<Config, ConfigError> {
        if let Some(threshold) = cli.threshold {
            if threshold < 0 {
                return Err(ConfigError::invalid("--threshold must be >= 0"));
            }
            gateway.management_session_threshold = threshold;
        }

        Ok(Config {
            config_file_location: cli.config_file_location,
            log_level: cli.log_level,
            gateway,
            threshold_override: cli.threshold,
        })
    }
}

fn must_exist_file(path: &Path) -> Result<(), ConfigError> {
    let md = std::fs::metadata(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    if !md.is_file() {
        return Err(ConfigError::invalid(format!(
            "path is not a file: {} (from --config / crabgate.toml)",
            path.display()
        )));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn cli_threshold_overrides_file() {
        let file = write_file("[gateway]\nmanagement_session_threshold = 3\n");
        let cli = CliConfig {
            config_file_location: file.path().to_path_buf(),
            log_level: LogLevel::Warn,
            threshold: Some(42),
        };

        let cfg = Config::from_cli(cli).await.unwrap();
        assert_eq!(cfg.gateway.management_session_threshold, 42);
        assert_eq!(cfg.log_level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliConfig {
            config_file_location: dir.path().join("nope.toml"),
            log_level: LogLevel::Info,
            threshold: None,
        };
        assert!(matches!(
            Config::from_cli(cli).await,
            Err(ConfigError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn reload_picks_up_changes() {
        let mut file = write_file("[gateway]\nmanagement_session_threshold = 1\n");
        let cli = CliConfig {
            config_file_location: file.path().to_path_buf(),
            log_level: LogLevel::Info,
            threshold: None,
        };
        let cfg = Config::from_cli(cli).await.unwrap();

        file.as_file_mut().set_len(0).unwrap();
        std::fs::write(file.path(), "[gateway]\nmanagement_session_threshold = 9\n").unwrap();

        let next = cfg.reload().await.unwrap();
        assert_eq!(next.gateway.management_session_threshold, 9);
    }

    #[tokio::test]
    async fn reload_keeps_the_cli_threshold() {
        let file = write_file("[gateway]\nmanagement_session_threshold = 1\n");
        let cli = CliConfig {
            config_file_location: file.path().to_path_buf(),
            log_level: LogLevel::Info,
            threshold: Some(7),
        };
        let cfg = Config::from_cli(cli).await.unwrap();

        std::fs::write(file.path(), "[gateway]\nmanagement_session_threshold = 9\nworkers = 3\n")
            .unwrap();

        let next = cfg.reload().await.unwrap();
        assert_eq!(next.gateway.management_session_threshold, 7);
        assert_eq!(next.gateway.workers, 3);
        assert_eq!(next.threshold_override, Some(7));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
