//! Genesis bootstrap.
//!
//! First start of a deployment: generate the configured keypairs, append
//! the genesis pulse, seed the root jet and activate the root-domain
//! lifeline. Re-running against an existing ledger is a no-op apart from
//! filling in missing key files, so the flag can stay in the unit file.
//!
//! Bootstrap writes storage directly; the engine's authorization pipeline
//! only applies once a membership roster exists to authorize against.

use std::path::{Path, PathBuf};

use lumen_core::crypto::{self, CryptoError, NodeKeypair};
use lumen_core::error::CoreError;
use lumen_core::id::ObjectId;
use lumen_core::index::{Lifeline, StateKind};
use lumen_core::jet::JetId;
use lumen_core::pulse::{GENESIS_PULSE, Pulse};
use lumen_core::record::{GenesisRecord, MaterialRecord, Record};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::dispatch::Node;

/// Errors raised during bootstrap.
#[derive(Debug, Error)]
pub enum GenesisError {
    /// Key or config file I/O failed.
    #[error("genesis I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The genesis config did not parse.
    #[error("cannot parse genesis config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Key generation or storage failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Ledger seeding failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// The genesis configuration file (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Name of the root domain; its hash anchors the root-domain id.
    #[serde(default = "default_root_domain")]
    pub root_domain: String,

    /// Names of the keypairs to generate under `--genesis-key-out`.
    #[serde(default = "default_key_names")]
    pub keys: Vec<String>,
}

fn default_root_domain() -> String {
    "root-domain".to_owned()
}

fn default_key_names() -> Vec<String> {
    vec!["node".to_owned()]
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            root_domain: default_root_domain(),
            keys: default_key_names(),
        }
    }
}

impl GenesisConfig {
    /// Loads the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// What bootstrap did.
#[derive(Debug)]
pub struct GenesisReport {
    /// The root-domain object id.
    pub root_domain: ObjectId,
    /// Whether the ledger was seeded on this run (false: already done).
    pub seeded: bool,
    /// Key files written or confirmed.
    pub keys: Vec<PathBuf>,
}

/// The root-domain id for a given domain name.
#[must_use]
pub fn root_domain_id(name: &str) -> ObjectId {
    ObjectId::new(GENESIS_PULSE, crypto::record_hash(name.as_bytes()))
}

/// Runs bootstrap against the node's stores.
pub fn run(
    node: &Node,
    config: &GenesisConfig,
    key_out: &Path,
) -> Result<GenesisReport, GenesisError> {
    std::fs::create_dir_all(key_out)?;
    let mut keys = Vec::with_capacity(config.keys.len());
    for name in &config.keys {
        let path = key_out.join(format!("{name}.key"));
        if !path.exists() {
            NodeKeypair::generate().save(&path)?;
            info!(path = %path.display(), "generated keypair");
        }
        keys.push(path);
    }

    let root_domain = root_domain_id(&config.root_domain);
    if node.pulses.latest().is_ok() {
        return Ok(GenesisReport {
            root_domain,
            seeded: false,
            keys,
        });
    }

    node.pulses.append(Pulse::genesis())?;
    node.tree
        .update(GENESIS_PULSE, JetId::ROOT, true)
        .map_err(CoreError::from)?;

    let record = Record::Genesis(GenesisRecord {
        hash: crypto::record_hash(config.root_domain.as_bytes()).to_vec(),
    });
    let genesis_id = record.id_at(GENESIS_PULSE);
    node.records.set(
        &genesis_id,
        &MaterialRecord {
            record,
            jet: JetId::ROOT,
        },
    )?;

    let lifeline = Lifeline {
        latest_state: Some(genesis_id),
        latest_state_kind: StateKind::Activate,
        ..Lifeline::default()
    };
    node.indices
        .set_lifeline(GENESIS_PULSE, &root_domain, lifeline)?;

    info!(root_domain = %root_domain, "genesis seeded");
    Ok(GenesisReport {
        root_domain,
        seeded: true,
        keys,
    })
}
