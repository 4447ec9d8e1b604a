use clap::Parser;
use std::path::PathBuf;

use super::{errors::ConfigError, types::LogLevel};

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub config_file_location: PathBuf,
    pub log_level: LogLevel,
    pub threshold: Option<i64>,
}

impl CliConfig {
    /// Parse the process arguments. `--help` and `--version` print and exit.
    pub fn from_args() -> Result<Self, ConfigError> {
        let args = match Args::try_parse() {
            Ok(args) => args,
            Err(e) if !e.use_stderr() => e.exit(),
            Err(e) => {
                return Err(ConfigError::Cli {
                    reason: e.to_string(),
                });
            }
        };
        Ok(Self::from_parsed(args))
    }

    pub fn try_from_iter<I, T>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let args = Args::try_parse_from(iter).map_err(|e| ConfigError::Cli {
            reason: e.to_string(),
        })?;
        Ok(Self::from_parsed(args))
    }
}

impl CliConfig {
    fn from_parsed(args: Args) -> Self {
        Self {
            config_file_location: args.config_file,
            log_level: args.log_level,
            threshold: args.threshold,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "crabgate", version, about = "Multi-protocol connection gateway")]
struct Args {
    // Must exist; no defaults.
    #[arg(long = "config", env = "CRABGATE_CONFIG_FILE")]
    config_file: PathBuf,

    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info")]
    log_level: LogLevel,

    // Overrides [gateway].management_session_threshold.
    #[arg(long = "threshold", env = "CRABGATE_THRESHOLD")]
    threshold: Option<i64>,
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
