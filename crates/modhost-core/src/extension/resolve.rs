//! Symbol dependency resolution.
//!
//! A dependency is looked up in the extension's own binary, then in the
//! host, then in the other extensions allowed by the loader's
//! [`SymbolScope`]. If that fails the declared provider is loaded once and
//! the search repeated.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::abi::SymbolAddress;
use super::binary::{SymbolDependency, SymbolProvider};
use super::loader::Loader;
use super::record::{ExtensionId, ExtensionState};
use crate::error::{Error, Result};
use crate::registry::Registries;

/// Which other extensions may supply a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolScope {
    /// Only the Testing batch. A rehash builds the next generation this
    /// way so that nothing binds to the generation it replaces.
    Testing,
    /// The Testing batch first, then activated extensions.
    #[default]
    Active,
}

impl Loader {
    pub(super) fn resolve_dependencies(&mut self, id: ExtensionId, registries: &mut Registries) -> Result<()> {
        let dependencies = match self.records.get(&id) {
            Some(record) => record.header.dependencies.clone(),
            None => return Err(Error::not_found(format!("extension {}", id))),
        };
        for dep in &dependencies {
            self.resolve_one(id, dep, registries)?;
        }
        Ok(())
    }

    fn resolve_one(&mut self, id: ExtensionId, dep: &SymbolDependency, registries: &mut Registries) -> Result<()> {
        let own = match self.records.get(&id) {
            Some(record) => record.binary.clone(),
            None => return Err(Error::not_found(format!("extension {}", id))),
        };
        if let Some(addr) = own.resolve(&dep.symbol).or_else(|| self.host.resolve(&dep.symbol)) {
            dep.slot.fill(addr);
            return Ok(());
        }

        for attempt in 0..2 {
            if let Some((supplier, addr)) = self.exported_by_other(id, &dep.symbol) {
                self.link(supplier, id, &dep.symbol)?;
                dep.slot.fill(addr);
                debug!(
                    category = "modules",
                    extension = %self.name_of(id),
                    supplier = %self.name_of(supplier),
                    symbol = %dep.symbol,
                    "Resolved symbol"
                );
                return Ok(());
            }
            if attempt == 0 && !self.load_provider(id, dep, registries) {
                break;
            }
        }

        Err(Error::UnresolvedSymbol {
            extension: self.name_of(id),
            symbol: dep.symbol.clone(),
        })
    }

    fn exported_by_other(&self, id: ExtensionId, symbol: &str) -> Option<(ExtensionId, SymbolAddress)> {
        let (testing, settled): (Vec<_>, Vec<_>) = self
            .records
            .values()
            .filter(|r| r.id != id && r.state != ExtensionState::PendingUnload)
            .partition(|r| r.state == ExtensionState::Testing);
        let settled = match self.symbol_scope {
            SymbolScope::Testing => Vec::new(),
            SymbolScope::Active => settled,
        };
        testing
            .into_iter()
            .chain(settled)
            .find_map(|r| r.binary.resolve(symbol).map(|addr| (r.id, addr)))
    }

    /// Load the provider named by `dep`. `true` if it is present afterwards.
    fn load_provider(&mut self, id: ExtensionId, dep: &SymbolDependency, registries: &mut Registries) -> bool {
        if dep.provider.is_empty() {
            return false;
        }
        let key = dep.provider.to_ascii_lowercase();
        if !self.providers_loading.insert(key.clone()) {
            return false;
        }
        let request = self.provider_request(id, &dep.provider);
        debug!(
            category = "modules",
            extension = %self.name_of(id),
            provider = %request,
            symbol = %dep.symbol,
            "Loading provider extension"
        );
        let result = self.load(&request, registries);
        self.providers_loading.remove(&key);
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    category = "modules",
                    extension = %self.name_of(id),
                    provider = %request,
                    error = %e,
                    "Provider extension could not be loaded"
                );
                false
            }
        }
    }

    /// Builtins by name; from 3.2.3 on, native providers live next to the dependent.
    fn provider_request(&self, id: ExtensionId, provider: &str) -> String {
        if self.builtin(provider).is_some() {
            return provider.to_string();
        }
        let Some(record) = self.records.get(&id) else {
            return provider.to_string();
        };
        if record.modsys.resolves_providers_by_sibling_path() {
            if let Some(dir) = record.path().parent().filter(|d| !d.as_os_str().is_empty()) {
                return dir
                    .join(format!("{}{}", provider, self.module_suffix))
                    .to_string_lossy()
                    .into_owned();
            }
        }
        provider.to_string()
    }

    /// Record `child` as depending on `supplier`.
    fn link(&mut self, supplier: ExtensionId, child: ExtensionId, symbol: &str) -> Result<()> {
        if supplier == child || self.is_descendant(child, supplier) {
            return Err(Error::CircularDependency {
                extension: self.name_of(child),
                provider: self.name_of(supplier),
                symbol: symbol.to_string(),
            });
        }
        if let Some(record) = self.records.get_mut(&supplier) {
            record.add_child(child);
        }
        Ok(())
    }

    /// Whether `target` is reachable from `root` through children edges.
    pub(super) fn is_descendant(&self, root: ExtensionId, target: ExtensionId) -> bool {
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(record) = self.records.get(&current) else {
                continue;
            };
            for child in &record.children {
                if *child == target {
                    return true;
                }
                stack.push(*child);
            }
        }
        false
    }
}
