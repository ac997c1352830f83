//-----------------------------------------------------------------------------
// Module catalog
// ECU and signal catalog, read only source of truth for the acquisition
// MemoryCatalog holds the catalog in memory and loads it from a json file

use std::path::Path;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::a2l::{ConversionError, ParameterDefinition};

mod description_source;
pub use description_source::{DescriptionSource, FileDescriptionSource, MemoryDescriptionSource};

//-------------------------------------------------------------------------------------------------
// Identifiers

pub type EcuId = u32;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub u32);

impl std::fmt::Display for SignalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a signal, stable across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SignalKey {
    pub name: String,
    #[serde(serialize_with = "crate::a2l::hex_address::serialize")]
    pub address: u32,
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@0x{:08X}", self.name, self.address)
    }
}

//-------------------------------------------------------------------------------------------------
// EcuDescriptor

/// Transport protocol of an ECU, only XCP on Ethernet is supported
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EcuProtocol {
    #[default]
    Ethernet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuDescriptor {
    pub id: EcuId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Path of the A2L description
    pub a2l_path: String,
    #[serde(default)]
    pub protocol: EcuProtocol,
}

impl EcuDescriptor {
    pub fn new(id: EcuId, name: &str, host: &str, port: u16, a2l_path: &str) -> EcuDescriptor {
        EcuDescriptor {
            id,
            name: name.to_string(),
            description: None,
            host: Some(host.to_string()),
            port: Some(port),
            a2l_path: a2l_path.to_string(),
            protocol: EcuProtocol::Ethernet,
        }
    }

    /// Host and port, if both are configured
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match (self.host.as_deref(), self.port) {
            (Some(host), Some(port)) if !host.trim().is_empty() => Some((host.trim(), port)),
            _ => None,
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Signal

/// A parameter definition with runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub ecu_id: EcuId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,
    #[serde(flatten)]
    pub definition: ParameterDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,

    #[serde(skip)]
    pub current_value: Option<f64>,
    #[serde(skip)]
    pub is_monitored: bool,
}

impl Signal {
    pub fn new(id: SignalId, ecu_id: EcuId, definition: ParameterDefinition) -> Signal {
        Signal {
            id,
            ecu_id,
            group_id: None,
            min_value: definition.lower_limit,
            max_value: definition.upper_limit,
            definition,
            current_value: None,
            is_monitored: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn key(&self) -> SignalKey {
        SignalKey {
            name: self.definition.name.clone(),
            address: self.definition.address,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} ({})", self.definition.name, self.definition.unit.as_deref().unwrap_or("no units"))
    }

    pub fn convert(&self, raw: f64) -> Result<f64, ConversionError> {
        self.definition.convert(raw)
    }
}

/// Named group of signals of one ECU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalGroup {
    pub id: u32,
    pub ecu_id: EcuId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

//-------------------------------------------------------------------------------------------------
// Catalog

/// Read only ECU and signal lookup
pub trait Catalog: Send + Sync {
    fn get_ecu(&self, id: EcuId) -> Option<EcuDescriptor>;
    fn get_signals_for_ecu(&self, id: EcuId) -> Vec<Signal>;
    fn get_signal(&self, id: SignalId) -> Option<Signal>;

    fn get_signal_groups(&self, _ecu_id: EcuId) -> Vec<SignalGroup> {
        Vec::new()
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog format error: {0}")]
    Json(#[from] serde_json::Error),
}

/// In memory catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryCatalog {
    #[serde(default)]
    ecus: Vec<EcuDescriptor>,
    #[serde(default)]
    groups: Vec<SignalGroup>,
    #[serde(default)]
    signals: Vec<Signal>,
}

impl MemoryCatalog {
    pub fn new() -> MemoryCatalog {
        MemoryCatalog::default()
    }

    pub fn from_json(json: &str) -> Result<MemoryCatalog, CatalogError> {
        let catalog: MemoryCatalog = serde_json::from_str(json)?;
        debug!("Catalog: {} ECUs, {} groups, {} signals", catalog.ecus.len(), catalog.groups.len(), catalog.signals.len());
        Ok(catalog)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<MemoryCatalog, CatalogError> {
        info!("Load catalog {}", path.as_ref().display());
        let json = std::fs::read_to_string(path)?;
        MemoryCatalog::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn add_ecu(&mut self, ecu: EcuDescriptor) -> &mut Self {
        self.ecus.retain(|e| e.id != ecu.id);
        self.ecus.push(ecu);
        self
    }

    pub fn add_group(&mut self, group: SignalGroup) -> &mut Self {
        self.groups.retain(|g| g.id != group.id);
        self.groups.push(group);
        self
    }

    pub fn add_signal(&mut self, signal: Signal) -> &mut Self {
        self.signals.retain(|s| s.id != signal.id);
        self.signals.push(signal);
        self
    }

    pub fn ecus(&self) -> &[EcuDescriptor] {
        &self.ecus
    }
}

impl Catalog for MemoryCatalog {
    fn get_ecu(&self, id: EcuId) -> Option<EcuDescriptor> {
        self.ecus.iter().find(|e| e.id == id).cloned()
    }

    fn get_signals_for_ecu(&self, id: EcuId) -> Vec<Signal> {
        self.signals.iter().filter(|s| s.ecu_id == id).cloned().collect()
    }

    fn get_signal(&self, id: SignalId) -> Option<Signal> {
        self.signals.iter().find(|s| s.id == id).cloned()
    }

    fn get_signal_groups(&self, ecu_id: EcuId) -> Vec<SignalGroup> {
        self.groups.iter().filter(|g| g.ecu_id == ecu_id).cloned().collect()
    }
}

//-------------------------------------------------------------------------------------------------
