//! In-process extensions.
//!
//! A builtin is compiled into the host and goes through exactly the same
//! validation, resolution and lifecycle as a native binary. The stock
//! authentication backends are builtins, and tests use them to exercise
//! the loader without compiling shared objects.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use super::abi::{BuildTag, Entry, SymbolAddress, SymbolSlot, HOST_BUILD_TAG, MOD_VERSION_TAG};
use super::binary::{BuiltinEntryFn, EntryPoint, ExtensionBinary, SymbolDependency, SymbolProvider};
use super::record::{ExtensionHeader, ExtensionId};
use crate::error::Result;

/// A builtin extension.
pub struct StaticBinary {
    name: String,
    location: PathBuf,
    version_tag: Option<String>,
    build_tag: Option<BuildTag>,
    header: Option<ExtensionHeader>,
    exports: HashMap<String, SymbolAddress>,
    test: Option<BuiltinEntryFn>,
    init: Option<BuiltinEntryFn>,
    load: Option<BuiltinEntryFn>,
    unload: Option<BuiltinEntryFn>,
    handle: AtomicU64,
}

impl StaticBinary {
    pub fn builder(name: impl Into<String>) -> StaticBinaryBuilder {
        StaticBinaryBuilder::new(name.into())
    }

    /// Catalog name; also the header name unless the header was left out.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id published by the loader, if the extension has been validated.
    pub fn published_handle(&self) -> Option<ExtensionId> {
        match self.handle.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ExtensionId::new(raw)),
        }
    }
}

impl SymbolProvider for StaticBinary {
    fn resolve(&self, symbol: &str) -> Option<SymbolAddress> {
        self.exports.get(symbol).copied()
    }
}

impl ExtensionBinary for StaticBinary {
    fn location(&self) -> &Path {
        &self.location
    }

    fn version_tag(&self) -> Result<Option<String>> {
        Ok(self.version_tag.clone())
    }

    fn build_tag(&self) -> Option<BuildTag> {
        self.build_tag
    }

    fn header(&self) -> Result<Option<ExtensionHeader>> {
        Ok(self.header.clone())
    }

    fn entry_point(&self, entry: Entry) -> Option<EntryPoint> {
        let f = match entry {
            Entry::Test => self.test,
            Entry::Init => self.init,
            Entry::Load => self.load,
            Entry::Unload => self.unload,
        };
        f.map(EntryPoint::Builtin)
    }

    fn publish_handle(&self, id: ExtensionId) {
        self.handle.store(id.raw(), Ordering::Release);
    }
}

/// Builder for [`StaticBinary`].
///
/// Tags default to the host's own and the module-system version to
/// `3.2.3`, so a builtin only needs its entry points.
pub struct StaticBinaryBuilder {
    name: String,
    version: String,
    description: String,
    modversion: String,
    version_tag: Option<String>,
    build_tag: Option<BuildTag>,
    with_header: bool,
    dependencies: Vec<SymbolDependency>,
    exports: HashMap<String, SymbolAddress>,
    test: Option<BuiltinEntryFn>,
    init: Option<BuiltinEntryFn>,
    load: Option<BuiltinEntryFn>,
    unload: Option<BuiltinEntryFn>,
}

impl StaticBinaryBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            version: "1.0".to_string(),
            description: String::new(),
            modversion: "3.2.3".to_string(),
            version_tag: Some(MOD_VERSION_TAG.to_string()),
            build_tag: Some(HOST_BUILD_TAG),
            with_header: true,
            dependencies: Vec::new(),
            exports: HashMap::new(),
            test: None,
            init: None,
            load: None,
            unload: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn modversion(mut self, modversion: impl Into<String>) -> Self {
        self.modversion = modversion.into();
        self
    }

    pub fn version_tag(mut self, tag: Option<&str>) -> Self {
        self.version_tag = tag.map(str::to_string);
        self
    }

    pub fn build_tag(mut self, tag: Option<BuildTag>) -> Self {
        self.build_tag = tag;
        self
    }

    pub fn without_header(mut self) -> Self {
        self.with_header = false;
        self
    }

    /// Declare that `symbol`, normally exported by `provider`, must be
    /// written into `slot` before the extension is initialized.
    pub fn depends(
        mut self,
        symbol: impl Into<String>,
        provider: impl Into<String>,
        slot: &'static AtomicPtr<c_void>,
    ) -> Self {
        self.dependencies.push(SymbolDependency {
            symbol: symbol.into(),
            provider: provider.into(),
            slot: SymbolSlot::from_static(slot),
        });
        self
    }

    /// Export `addr` under `symbol`. Null addresses are ignored.
    pub fn export(mut self, symbol: impl Into<String>, addr: *const c_void) -> Self {
        if let Some(addr) = SymbolAddress::new(addr) {
            self.exports.insert(symbol.into(), addr);
        }
        self
    }

    pub fn test(mut self, f: BuiltinEntryFn) -> Self {
        self.test = Some(f);
        self
    }

    pub fn init(mut self, f: BuiltinEntryFn) -> Self {
        self.init = Some(f);
        self
    }

    pub fn load(mut self, f: BuiltinEntryFn) -> Self {
        self.load = Some(f);
        self
    }

    pub fn unload(mut self, f: BuiltinEntryFn) -> Self {
        self.unload = Some(f);
        self
    }

    pub fn build(self) -> StaticBinary {
        let header = self.with_header.then(|| ExtensionHeader {
            name: self.name.clone(),
            version: self.version,
            description: self.description,
            modversion: self.modversion,
            dependencies: self.dependencies,
        });
        StaticBinary {
            location: PathBuf::from(format!("builtin:{}", self.name)),
            name: self.name,
            version_tag: self.version_tag,
            build_tag: self.build_tag,
            header,
            exports: self.exports,
            test: self.test,
            init: self.init,
            load: self.load,
            unload: self.unload,
            handle: AtomicU64::new(0),
        }
    }
}
