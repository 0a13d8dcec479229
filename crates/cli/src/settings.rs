use std::path::{Path, PathBuf};
use std::sync::Arc;

use runway_engine::{EngineConfig, OpsClient};
use runway_storage::JsonLinesLedger;
use serde::Deserialize;
use tracing::debug;

const DEFAULT_LEDGER: &str = "runway-audit.jsonl";

/// The configuration file: engine settings plus where the ledger lives.
///
/// The CLI only reads `[audit]`. The engine sections are the ones a service
/// embedding the planner loads from the same file; the CLI validates them so
/// a bad deploy config is caught by any `runway` invocation, but none of its
/// commands use them.
///
/// ```toml
/// [audit]
/// ledger = "/var/lib/runway/audit.jsonl"
///
/// [lock]
/// lease_millis = 60000
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    audit: AuditSection,
    #[serde(flatten)]
    engine: EngineConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuditSection {
    ledger: Option<PathBuf>,
}

#[derive(Debug)]
pub(crate) struct Settings {
    pub ledger: PathBuf,
}

impl Settings {
    /// `--ledger` wins over the config file, which wins over the default path.
    pub fn resolve(config: Option<&Path>, ledger: Option<PathBuf>) -> Result<Self, String> {
        let file = match config {
            Some(path) => load(path)?,
            None => FileConfig::default(),
        };
        let ledger = ledger
            .or(file.audit.ledger)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER));
        debug!(ledger = %ledger.display(), "ledger resolved");
        Ok(Self { ledger })
    }

    pub fn ops_client(&self) -> OpsClient {
        OpsClient::new(Arc::new(JsonLinesLedger::new(&self.ledger)))
    }
}

/// Read a config file, engine sections included, and validate it.
fn load(path: &Path) -> Result<FileConfig, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("error reading config '{}': {}", path.display(), e))?;
    let file: FileConfig = toml::from_str(&source)
        .map_err(|e| format!("invalid config '{}': {}", path.display(), e))?;
    file.engine
        .validate()
        .map_err(|e| format!("invalid config '{}': {}", path.display(), e))?;
    Ok(file)
}
