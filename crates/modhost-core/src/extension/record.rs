//! Extension records owned by the loader.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::abi::{CallingConvention, ModsysVersion};
use super::binary::{ExtensionBinary, SymbolDependency};
use crate::error::ModuleError;
use crate::registry::ModuleObject;

/// Loader-assigned identity of an extension record.
///
/// Ids increase monotonically, so ordering by id is load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExtensionId(u64);

impl ExtensionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an extension record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtensionState {
    /// Opened, validated and self-tested; waiting for batch activation.
    Testing,
    /// Init succeeded; waiting for load.
    Initialized,
    /// Fully active.
    Loaded,
    /// Unload was deferred by the extension or one of its parents.
    PendingUnload,
}

impl ExtensionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionState::Testing => "testing",
            ExtensionState::Initialized => "initialized",
            ExtensionState::Loaded => "loaded",
            ExtensionState::PendingUnload => "unloading",
        }
    }
}

bitflags! {
    /// Options an extension sets on itself during init.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtensionOptions: u32 {
        /// Never unloaded by a rehash; its registrations never retire.
        const PERMANENT = 0x0001;
        /// Shipped with the host; allowed to provide efunctions.
        const OFFICIAL = 0x0002;
    }
}

impl ExtensionOptions {
    pub fn is_third_party(self) -> bool {
        !self.contains(ExtensionOptions::OFFICIAL)
    }
}

/// Validated header of an extension binary.
#[derive(Debug, Clone)]
pub struct ExtensionHeader {
    pub name: String,
    pub version: String,
    pub description: String,
    pub modversion: String,
    pub dependencies: Vec<SymbolDependency>,
}

/// A loaded extension.
pub struct Extension {
    pub(crate) id: ExtensionId,
    pub(crate) header: ExtensionHeader,
    pub(crate) modsys: ModsysVersion,
    pub(crate) convention: CallingConvention,
    pub(crate) state: ExtensionState,
    pub(crate) options: ExtensionOptions,
    /// Extensions that resolved at least one symbol from this one.
    pub(crate) children: Vec<ExtensionId>,
    /// Registrations to retract on unload.
    pub(crate) objects: Vec<ModuleObject>,
    pub(crate) error: ModuleError,
    pub(crate) binary: Arc<dyn ExtensionBinary>,
    pub(crate) loaded_at: DateTime<Utc>,
    pub(crate) delayed_attempts: u32,
}

impl Extension {
    pub(crate) fn new(
        id: ExtensionId,
        header: ExtensionHeader,
        modsys: ModsysVersion,
        binary: Arc<dyn ExtensionBinary>,
    ) -> Self {
        Self {
            id,
            header,
            modsys,
            convention: modsys.calling_convention(),
            state: ExtensionState::Testing,
            options: ExtensionOptions::empty(),
            children: Vec::new(),
            objects: Vec::new(),
            error: ModuleError::NoError,
            binary,
            loaded_at: Utc::now(),
            delayed_attempts: 0,
        }
    }

    pub fn id(&self) -> ExtensionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn version(&self) -> &str {
        &self.header.version
    }

    pub fn description(&self) -> &str {
        &self.header.description
    }

    pub fn header(&self) -> &ExtensionHeader {
        &self.header
    }

    pub fn modsys_version(&self) -> ModsysVersion {
        self.modsys
    }

    pub fn calling_convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn state(&self) -> ExtensionState {
        self.state
    }

    pub fn options(&self) -> ExtensionOptions {
        self.options
    }

    pub fn is_permanent(&self) -> bool {
        self.options.contains(ExtensionOptions::PERMANENT)
    }

    pub fn is_pending_unload(&self) -> bool {
        self.state == ExtensionState::PendingUnload
    }

    pub fn children(&self) -> &[ExtensionId] {
        &self.children
    }

    pub fn objects(&self) -> &[ModuleObject] {
        &self.objects
    }

    /// Code left by the last registration call.
    pub fn error(&self) -> ModuleError {
        self.error
    }

    pub fn path(&self) -> &Path {
        self.binary.location()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn delayed_attempts(&self) -> u32 {
        self.delayed_attempts
    }

    pub(crate) fn add_child(&mut self, child: ExtensionId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    pub(crate) fn remove_child(&mut self, child: ExtensionId) {
        self.children.retain(|c| *c != child);
    }

    pub(crate) fn forget_object(&mut self, object: &ModuleObject) {
        if let Some(pos) = self.objects.iter().position(|o| o == object) {
            self.objects.remove(pos);
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("id", &self.id)
            .field("name", &self.header.name)
            .field("version", &self.header.version)
            .field("state", &self.state)
            .field("options", &self.options)
            .field("children", &self.children)
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// Serializable summary of an extension, used by listings.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionSummary {
    pub id: ExtensionId,
    pub name: String,
    pub version: String,
    pub description: String,
    pub state: ExtensionState,
    pub permanent: bool,
    pub third_party: bool,
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

impl From<&Extension> for ExtensionSummary {
    fn from(ext: &Extension) -> Self {
        Self {
            id: ext.id,
            name: ext.header.name.clone(),
            version: ext.header.version.clone(),
            description: ext.header.description.clone(),
            state: ext.state,
            permanent: ext.is_permanent(),
            third_party: ext.options.is_third_party(),
            path: ext.path().to_path_buf(),
            loaded_at: ext.loaded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options() {
        let opts = ExtensionOptions::OFFICIAL;
        assert!(!opts.is_third_party());
        assert!(ExtensionOptions::empty().is_third_party());
        assert!((ExtensionOptions::OFFICIAL | ExtensionOptions::PERMANENT)
            .contains(ExtensionOptions::PERMANENT));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ExtensionState::PendingUnload.as_str(), "unloading");
        assert_eq!(ExtensionState::Loaded.as_str(), "loaded");
    }
}
