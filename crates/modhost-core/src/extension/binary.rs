//! Loadable-unit abstraction.
//!
//! The loader never talks to `libloading` directly. It sees an
//! [`ExtensionBinary`]: something that can report its tags and header,
//! hand out entry points and resolve exported symbols by name. Native
//! shared objects and in-process builtins both implement it.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::Path;

use parking_lot::RwLock;

use super::abi::{
    BuildTag, CallingConvention, Entry, LegacyEntryFn, ModuleReturn, NativeEntryFn, SymbolAddress,
    SymbolSlot,
};
use super::context::ModuleInfo;
use super::record::{ExtensionHeader, ExtensionId};
use crate::error::Result;

/// Anything symbols can be looked up in.
pub trait SymbolProvider: Send + Sync {
    fn resolve(&self, symbol: &str) -> Option<SymbolAddress>;
}

/// An opened extension binary.
pub trait ExtensionBinary: SymbolProvider {
    /// Path (or pseudo-path for builtins) the binary was opened from.
    fn location(&self) -> &Path;

    /// `Ok(None)` when the binary carries no version tag at all.
    fn version_tag(&self) -> Result<Option<String>>;

    /// Toolchain tag, if the binary exports one.
    fn build_tag(&self) -> Option<BuildTag>;

    /// `Ok(None)` when the binary carries no header.
    fn header(&self) -> Result<Option<ExtensionHeader>>;

    fn entry_point(&self, entry: Entry) -> Option<EntryPoint>;

    /// Hand the extension its own record id.
    fn publish_handle(&self, id: ExtensionId);
}

/// Builtin entry point signature.
pub type BuiltinEntryFn = fn(&mut ModuleInfo<'_>) -> ModuleReturn;

/// A callable lifecycle entry point.
#[derive(Clone, Copy)]
pub enum EntryPoint {
    Native(SymbolAddress),
    Builtin(BuiltinEntryFn),
}

impl EntryPoint {
    /// Invoke the entry point with the convention fixed at load time.
    pub fn invoke(
        self,
        convention: CallingConvention,
        entry: Entry,
        info: &mut ModuleInfo<'_>,
    ) -> ModuleReturn {
        match self {
            EntryPoint::Builtin(f) => f(info),
            EntryPoint::Native(addr) => {
                let code = if convention.passes_context(entry) {
                    // SAFETY: the symbol was exported under an entry-point
                    // name and the binary passed the version and build checks.
                    let f: NativeEntryFn = unsafe { std::mem::transmute(addr.as_ptr()) };
                    unsafe { f(info as *mut ModuleInfo<'_> as *mut c_void) }
                } else {
                    // SAFETY: as above, legacy header shape.
                    let f: LegacyEntryFn = unsafe { std::mem::transmute(addr.as_ptr()) };
                    unsafe { f() }
                };
                ModuleReturn::from_code(code)
            }
        }
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Native(addr) => write!(f, "Native({:p})", addr.as_ptr()),
            EntryPoint::Builtin(_) => write!(f, "Builtin"),
        }
    }
}

/// One declared symbol dependency.
#[derive(Debug, Clone)]
pub struct SymbolDependency {
    pub symbol: String,
    /// Name of the extension expected to export the symbol.
    pub provider: String,
    pub slot: SymbolSlot,
}

/// Symbols exported by the host process itself.
#[derive(Default)]
pub struct HostSymbols {
    symbols: RwLock<HashMap<String, SymbolAddress>>,
}

impl HostSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `addr` under `name`. Returns `false` for a null address.
    pub fn export(&self, name: impl Into<String>, addr: *const c_void) -> bool {
        match SymbolAddress::new(addr) {
            Some(addr) => {
                self.symbols.write().insert(name.into(), addr);
                true
            }
            None => false,
        }
    }

    pub fn withdraw(&self, name: &str) -> bool {
        self.symbols.write().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SymbolProvider for HostSymbols {
    fn resolve(&self, symbol: &str) -> Option<SymbolAddress> {
        self.symbols.read().get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static VALUE: u32 = 42;

    #[test]
    fn test_host_symbols() {
        let host = HostSymbols::new();
        assert!(host.is_empty());
        assert!(host.export("me_value", &VALUE as *const u32 as *const c_void));
        assert!(!host.export("null", std::ptr::null()));
        assert_eq!(host.len(), 1);

        let addr = host.resolve("me_value").unwrap();
        assert_eq!(addr.as_ptr(), &VALUE as *const u32 as *const c_void);
        assert!(host.resolve("missing").is_none());

        assert!(host.withdraw("me_value"));
        assert!(host.resolve("me_value").is_none());
    }
}
