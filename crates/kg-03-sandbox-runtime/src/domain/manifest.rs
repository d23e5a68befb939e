//! Sandbox manifests: declared capabilities and exported functions.

use crate::domain::value_objects::SecurityMode;
use crate::errors::SandboxError;
use serde::{Deserialize, Serialize};
use shared_types::{Capability, CapabilitySet};
use std::collections::BTreeMap;

/// Fuel ceiling of an exported function that does not declare one.
pub const DEFAULT_FUNCTION_FUEL: u64 = 100_000;

/// A function instance code exports to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFunction {
    pub name: String,
    /// Per-call fuel ceiling.
    pub max_fuel: u64,
}

/// What an instance declares about itself at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxManifest {
    pub name: String,
    pub version: String,
    /// Capabilities whose host functions get bound.
    pub capabilities: CapabilitySet,
    /// Exported functions by name.
    pub exports: BTreeMap<String, ExportedFunction>,
    /// Attestation required by [`SecurityMode::Trusted`].
    pub internally_trusted: bool,
}

impl SandboxManifest {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: CapabilitySet::empty(),
            exports: BTreeMap::new(),
            internally_trusted: false,
        }
    }

    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        for capability in capabilities {
            self.capabilities.insert(capability);
        }
        self
    }

    /// Export `name` with the default fuel ceiling.
    #[must_use]
    pub fn export(self, name: impl Into<String>) -> Self {
        self.export_with_fuel(name, DEFAULT_FUNCTION_FUEL)
    }

    #[must_use]
    pub fn export_with_fuel(mut self, name: impl Into<String>, max_fuel: u64) -> Self {
        let name = name.into();
        self.exports.insert(
            name.clone(),
            ExportedFunction { name, max_fuel },
        );
        self
    }

    #[must_use]
    pub fn internally_trusted(mut self) -> Self {
        self.internally_trusted = true;
        self
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&ExportedFunction> {
        self.exports.get(name)
    }

    /// Check the manifest on its own and against `mode`.
    pub fn validate(&self, mode: SecurityMode) -> Result<(), SandboxError> {
        if self.name.trim().is_empty() {
            return Err(SandboxError::InvalidManifest("name is empty".into()));
        }
        if self.exports.is_empty() {
            return Err(SandboxError::InvalidManifest(format!(
                "{} exports no functions",
                self.name
            )));
        }
        if let Some(function) = self.exports.values().find(|f| f.max_fuel == 0) {
            return Err(SandboxError::InvalidManifest(format!(
                "function {} has a zero fuel ceiling",
                function.name
            )));
        }
        if mode.bypasses_isolation() && !self.internally_trusted {
            return Err(SandboxError::Security(format!(
                "{} is not attested as internally trusted, {mode} mode refused",
                self.name
            )));
        }
        if let Some(capability) = self.capabilities.iter().find(|c| !mode.permits(*c)) {
            return Err(SandboxError::CapabilityNotPermitted { capability, mode });
        }
        Ok(())
    }
}
