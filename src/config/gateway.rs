use serde::Deserialize;
use std::{collections::HashSet, net::SocketAddr, path::Path, path::PathBuf, time::Duration};
use tokio::fs;

use super::errors::ConfigError;
use crate::service::ServiceConfig;

// -----------------------------------------------------------------------------
// ----- Defaults --------------------------------------------------------------

const DEFAULT_THRESHOLD: i64 = 100;
const DEFAULT_REPORT_INTERVAL: &str = "10s";

// -----------------------------------------------------------------------------
// ----- GatewayConfig ---------------------------------------------------------

/// The validated gateway file.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub workers: usize,
    pub management_session_threshold: i64,
    pub report_interval: Duration,
    pub export_file: Option<PathBuf>,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub name: String,
    pub listen: Vec<SocketAddr>,
    pub aligned: bool,
    pub management: bool,
}

impl ServiceEntry {
    /// Services built from the gateway file share the gateway's pool.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new(self.name.clone())
            .aligned(self.aligned)
            .management(self.management)
    }
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig: Static -------------------------------------------------

impl GatewayConfig {
    pub async fn from_file_async(path: &Path) -> Result<GatewayConfig, ConfigError> {
        let raw = fs::read_to_string(path).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<GatewayConfig, ConfigError> {
        let doc: GatewayFile = toml::from_str(raw).map_err(|e| ConfigError::Toml { source: e })?;

        let gateway = doc.gateway;
        if gateway.management_session_threshold < 0 {
            return Err(ConfigError::invalid(
                "management_session_threshold must be >= 0",
            ));
        }

        let report_interval = humantime::parse_duration(&gateway.report_interval).map_err(|e| {
            ConfigError::invalid(format!(
                "report_interval '{}': {e}",
                gateway.report_interval
            ))
        })?;
        if report_interval.is_zero() {
            return Err(ConfigError::invalid("report_interval must be non-zero"));
        }

        let mut seen = HashSet::with_capacity(doc.services.len());
        let mut services = Vec::with_capacity(doc.services.len());

        for entry in doc.services {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::invalid("service name is empty"));
            }
            if !seen.insert(entry.name.clone()) {
                return Err(ConfigError::DuplicateService { name: entry.name });
            }
            if entry.listen.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "service '{}' has no listen address",
                    entry.name
                )));
            }

            services.push(ServiceEntry {
                name: entry.name,
                listen: entry.listen,
                aligned: entry.aligned,
                management: entry.management,
            });
        }

        Ok(GatewayConfig {
            name: gateway.name,
            workers: gateway.workers,
            management_session_threshold: gateway.management_session_threshold,
            report_interval,
            export_file: gateway.export_file,
            services,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct GatewayFile {
    gateway: GatewaySection,
    #[serde(default)]
    services: Vec<ServiceFileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct GatewaySection {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    workers: usize,
    #[serde(default = "default_threshold")]
    management_session_threshold: i64,
    #[serde(default = "default_report_interval")]
    report_interval: String,
    #[serde(default)]
    export_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceFileEntry {
    name: String,
    #[serde(default)]
    listen: Vec<SocketAddr>,
    #[serde(default = "default_true")]
    aligned: bool,
    #[serde(default)]
    management: bool,
}

fn default_name() -> String {
    "crabgate".to_string()
}

fn default_threshold() -> i64 {
    DEFAULT_THRESHOLD
}

fn default_report_interval() -> String {
    DEFAULT_REPORT_INTERVAL.to_string()
}

fn default_true() -> bool {
    true
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
