//! The extension loader.
//!
//! The loader is the sole owner of [`Extension`] records. Records are
//! keyed by [`ExtensionId`], so iterating the map is iterating in load
//! order. Dependency edges are stored as ids on the supplying record.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::abi::{Entry, ModsysVersion, ModuleReturn, HOST_BUILD_TAG, MOD_VERSION_TAG};
use super::binary::{ExtensionBinary, HostSymbols};
use super::builtin::StaticBinary;
use super::context::ModuleInfo;
use super::native::NativeBinary;
use super::record::{Extension, ExtensionHeader, ExtensionId, ExtensionState, ExtensionSummary};
use super::resolve::SymbolScope;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::registry::Registries;
use crate::validation_err;

/// Result of a successful unload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The extension and every dependent are gone.
    Removed,
    /// The extension asked to be unloaded later.
    Delayed,
    /// A dependent asked to be unloaded later; this extension waits for it.
    DelayedByChildren,
}

pub struct Loader {
    pub(super) records: BTreeMap<ExtensionId, Extension>,
    next_id: u64,
    module_dir: PathBuf,
    pub(super) module_suffix: String,
    tmp_dir: PathBuf,
    retry_interval: Duration,
    max_delayed_attempts: u32,
    /// Builtin catalog, keyed by lower-case name.
    pub(super) builtins: HashMap<String, Arc<StaticBinary>>,
    pub(super) host: Arc<HostSymbols>,
    /// Providers currently being loaded on behalf of a dependent.
    pub(super) providers_loading: HashSet<String>,
    pub(super) symbol_scope: SymbolScope,
    module_load: bool,
}

impl Loader {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 0,
            module_dir: config.module_dir.clone(),
            module_suffix: config.module_suffix.clone(),
            tmp_dir: config.tmp_dir.clone(),
            retry_interval: config.retry_interval(),
            max_delayed_attempts: config.max_delayed_attempts,
            builtins: HashMap::new(),
            host: Arc::new(HostSymbols::new()),
            providers_loading: HashSet::new(),
            symbol_scope: SymbolScope::default(),
            module_load: false,
        }
    }

    /// Add a builtin to the catalog. `false` if the name is taken.
    pub fn register_builtin(&mut self, binary: StaticBinary) -> bool {
        let key = binary.name().to_ascii_lowercase();
        if self.builtins.contains_key(&key) {
            return false;
        }
        self.builtins.insert(key, Arc::new(binary));
        true
    }

    pub fn builtin(&self, name: &str) -> Option<&Arc<StaticBinary>> {
        self.builtins.get(&name.to_ascii_lowercase())
    }

    /// Symbols the host exports to every extension.
    pub fn host_symbols(&self) -> &Arc<HostSymbols> {
        &self.host
    }

    /// Mark startup as finished; later loads see `module_load() == true`.
    pub fn set_module_load(&mut self, module_load: bool) {
        self.module_load = module_load;
    }

    /// Choose which extensions supply symbols to later loads. Returns the
    /// previous scope.
    pub fn set_symbol_scope(&mut self, scope: SymbolScope) -> SymbolScope {
        std::mem::replace(&mut self.symbol_scope, scope)
    }

    pub fn symbol_scope(&self) -> SymbolScope {
        self.symbol_scope
    }

    /// `name` alone means `<module_dir>/<name><suffix>`; anything with a
    /// directory or an extension is used as given.
    pub fn resolve_path(&self, request: &str) -> PathBuf {
        let path = Path::new(request);
        let bare = path.parent().map_or(true, |p| p.as_os_str().is_empty()) && path.extension().is_none();
        if bare {
            self.module_dir.join(format!("{}{}", request, self.module_suffix))
        } else {
            path.to_path_buf()
        }
    }

    /// Load an extension by builtin name or path.
    ///
    /// Returns `Ok(None)` when an extension of the same name already
    /// blocks the load (see [`Loader::find_blocking`]). On success the
    /// extension is in the Testing state, waiting for
    /// [`Loader::init_all_testing`].
    pub fn load(&mut self, request: &str, registries: &mut Registries) -> Result<Option<ExtensionId>> {
        let result = self
            .open(request)
            .and_then(|binary| self.load_binary(binary, registries));
        if let Err(e) = &result {
            warn!(category = "modules", request, error = %e, "Extension load failed");
        }
        result
    }

    fn open(&self, request: &str) -> Result<Arc<dyn ExtensionBinary>> {
        if let Some(builtin) = self.builtin(request) {
            let binary: Arc<dyn ExtensionBinary> = builtin.clone();
            return Ok(binary);
        }
        let path = self.resolve_path(request);
        Ok(Arc::new(NativeBinary::open(path, &self.tmp_dir)?))
    }

    /// Validate an already opened binary and add it to the Testing set.
    pub fn load_binary(
        &mut self,
        binary: Arc<dyn ExtensionBinary>,
        registries: &mut Registries,
    ) -> Result<Option<ExtensionId>> {
        let (header, modsys) = validate(binary.as_ref())?;

        if let Some(existing) = self.find_blocking(&header.name) {
            debug!(
                category = "modules",
                extension = %header.name,
                existing = %existing.id,
                "Extension already present, nothing to do"
            );
            return Ok(None);
        }

        self.next_id += 1;
        let id = ExtensionId::new(self.next_id);
        let name = header.name.clone();
        self.records
            .insert(id, Extension::new(id, header, modsys, binary.clone()));

        if let Err(e) = self.prepare(id, binary.as_ref(), registries) {
            self.release(id, registries);
            return Err(e);
        }

        info!(
            category = "modules",
            extension = %name,
            id = %id,
            path = %binary.location().display(),
            "Extension validated, waiting for activation"
        );
        Ok(Some(id))
    }

    /// Dependency resolution, entry-point check, handle publication and self-test.
    fn prepare(&mut self, id: ExtensionId, binary: &dyn ExtensionBinary, registries: &mut Registries) -> Result<()> {
        self.resolve_dependencies(id, registries)?;

        for entry in [Entry::Init, Entry::Load, Entry::Unload] {
            if binary.entry_point(entry).is_none() {
                return Err(Error::MissingEntryPoint {
                    path: binary.location().to_path_buf(),
                    symbol: entry.symbol().to_string(),
                });
            }
        }

        binary.publish_handle(id);

        if let Some(ModuleReturn::Failure(code)) = self.call_entry(id, Entry::Test, registries) {
            return Err(Error::SelfTestFailed {
                extension: self.name_of(id),
                code,
            });
        }
        Ok(())
    }

    /// A same-name record that makes a new load a no-op: one that is
    /// permanent, or one still in Testing.
    pub fn find_blocking(&self, name: &str) -> Option<&Extension> {
        self.records.values().find(|r| {
            r.name().eq_ignore_ascii_case(name) && (r.is_permanent() || r.state == ExtensionState::Testing)
        })
    }

    pub(super) fn call_entry(
        &mut self,
        id: ExtensionId,
        entry: Entry,
        registries: &mut Registries,
    ) -> Option<ModuleReturn> {
        let record = self.records.get_mut(&id)?;
        let point = record.binary.entry_point(entry)?;
        let convention = record.convention;
        let mut info = ModuleInfo::new(record, registries, self.module_load);
        Some(point.invoke(convention, entry, &mut info))
    }

    fn ids_in_state(&self, state: ExtensionState) -> Vec<ExtensionId> {
        self.records
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.id)
            .collect()
    }

    pub(super) fn name_of(&self, id: ExtensionId) -> String {
        self.records
            .get(&id)
            .map(|r| r.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    /// Run init for every Testing extension. Failures are discarded one
    /// by one and returned; the rest of the batch carries on.
    pub fn init_all_testing(&mut self, registries: &mut Registries) -> Vec<Error> {
        let mut failures = Vec::new();
        for id in self.ids_in_state(ExtensionState::Testing) {
            // An earlier discard may have taken this one with it.
            if !self.records.contains_key(&id) {
                continue;
            }
            match self.call_entry(id, Entry::Init, registries) {
                Some(ModuleReturn::Failure(code)) => {
                    let extension = self.name_of(id);
                    error!(category = "modules", extension = %extension, code, "Extension init failed");
                    failures.push(Error::EntryFailed {
                        extension,
                        entry: "init",
                        code,
                    });
                    failures.extend(self.discard_failed(id, "init", registries));
                }
                _ => {
                    if let Some(record) = self.records.get_mut(&id) {
                        record.state = ExtensionState::Initialized;
                    }
                }
            }
        }
        failures
    }

    /// Release an extension whose `entry` failed, and every extension that
    /// depends on it. Each dependent is reported; activated ones are asked
    /// to unload first.
    fn discard_failed(&mut self, id: ExtensionId, entry: &'static str, registries: &mut Registries) -> Vec<Error> {
        let provider = self.name_of(id);
        let mut failures = Vec::new();
        for child in self.descendants(id).into_iter().rev() {
            let Some(record) = self.records.get(&child) else {
                continue;
            };
            let extension = record.name().to_string();
            let activated = matches!(record.state, ExtensionState::Loaded | ExtensionState::PendingUnload);
            warn!(
                category = "modules",
                extension = %extension,
                provider = %provider,
                "Unloading child extension of failed provider"
            );
            if activated {
                if let Some(ModuleReturn::Failure(code)) = self.call_entry(child, Entry::Unload, registries) {
                    debug!(category = "modules", extension = %extension, code, "Unload failed while discarding");
                }
            }
            failures.push(Error::DependencyDiscarded {
                extension,
                provider: provider.clone(),
                entry,
            });
        }
        self.release(id, registries);
        failures
    }

    /// Every extension below `id`, breadth first.
    fn descendants(&self, id: ExtensionId) -> Vec<ExtensionId> {
        let mut order = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let Some(record) = self.records.get(&current) else {
                continue;
            };
            for child in &record.children {
                if seen.insert(*child) {
                    order.push(*child);
                    queue.push_back(*child);
                }
            }
        }
        order
    }

    /// Run load for every Initialized extension.
    pub fn load_all(&mut self, registries: &mut Registries) -> Vec<Error> {
        let mut failures = Vec::new();
        for id in self.ids_in_state(ExtensionState::Initialized) {
            if !self.records.contains_key(&id) {
                continue;
            }
            match self.call_entry(id, Entry::Load, registries) {
                Some(ModuleReturn::Failure(code)) => {
                    let extension = self.name_of(id);
                    error!(category = "modules", extension = %extension, code, "Cannot load extension");
                    failures.push(Error::EntryFailed {
                        extension,
                        entry: "load",
                        code,
                    });
                    failures.extend(self.discard_failed(id, "load", registries));
                }
                _ => {
                    if let Some(record) = self.records.get_mut(&id) {
                        record.state = ExtensionState::Loaded;
                        record.loaded_at = chrono::Utc::now();
                        info!(
                            category = "modules",
                            extension = %record.name(),
                            version = %record.version(),
                            "Loaded extension"
                        );
                    }
                }
            }
        }
        failures
    }

    /// Unload the newest extension called `name`.
    pub fn unload(&mut self, name: &str, registries: &mut Registries) -> Result<UnloadOutcome> {
        let id = self
            .find(name)
            .map(|r| r.id)
            .ok_or_else(|| Error::not_found(format!("extension '{}'", name)))?;
        self.unload_id(id, registries)
    }

    /// Unload an extension, dependents first.
    pub fn unload_id(&mut self, id: ExtensionId, registries: &mut Registries) -> Result<UnloadOutcome> {
        let children = match self.records.get(&id) {
            Some(record) => record.children.clone(),
            None => return Err(Error::not_found(format!("extension {}", id))),
        };

        let mut waiting = false;
        for child in children {
            if !self.records.contains_key(&child) {
                continue;
            }
            if self.unload_id(child, registries)? != UnloadOutcome::Removed {
                waiting = true;
            }
        }
        if waiting {
            self.defer_unload(id, registries);
            return Ok(UnloadOutcome::DelayedByChildren);
        }

        match self.call_entry(id, Entry::Unload, registries) {
            Some(ModuleReturn::Delay) => {
                self.defer_unload(id, registries);
                info!(category = "modules", extension = %self.name_of(id), "Extension requested delayed unload");
                Ok(UnloadOutcome::Delayed)
            }
            Some(ModuleReturn::Failure(code)) => {
                let extension = self.name_of(id);
                warn!(category = "modules", extension = %extension, code, "Extension refused to unload");
                Err(Error::UnloadRefused(extension))
            }
            Some(ModuleReturn::Success) | None => {
                self.release(id, registries);
                Ok(UnloadOutcome::Removed)
            }
        }
    }

    /// Flag `id` and everything below it PendingUnload and schedule a retry.
    fn defer_unload(&mut self, id: ExtensionId, registries: &mut Registries) {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(record) = self.records.get_mut(&current) {
                record.state = ExtensionState::PendingUnload;
                stack.extend(record.children.iter().copied());
            }
        }
        registries
            .events
            .schedule_unload_retry(id, self.retry_interval, Instant::now());
    }

    /// Retry a deferred unload. Gives up after the configured number of
    /// attempts, leaving the record PendingUnload until shutdown.
    pub fn retry_unload(&mut self, id: ExtensionId, registries: &mut Registries) -> Option<UnloadOutcome> {
        let Some(record) = self.records.get_mut(&id) else {
            registries.events.cancel_unload_retry(id);
            return None;
        };
        if record.state != ExtensionState::PendingUnload {
            registries.events.cancel_unload_retry(id);
            return None;
        }
        record.delayed_attempts += 1;
        let attempts = record.delayed_attempts;
        let name = record.name().to_string();

        let outcome = match self.unload_id(id, registries) {
            Ok(UnloadOutcome::Removed) => {
                info!(category = "modules", extension = %name, "Unloaded extension");
                return Some(UnloadOutcome::Removed);
            }
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(category = "modules", extension = %name, error = %e, "Failed to unload '{}'", name);
                None
            }
        };

        if attempts >= self.max_delayed_attempts {
            warn!(
                category = "modules",
                extension = %name,
                attempts,
                "Stuck unload: giving up retrying, extension stays pending until shutdown"
            );
            registries.events.cancel_unload_retry(id);
        }
        outcome
    }

    /// Unload the previous generation during a rehash: every Loaded,
    /// non-permanent extension.
    ///
    /// Edges from the previous generation to extensions outside it are
    /// dropped first, so the unload never cascades into the new generation
    /// or into permanent extensions.
    pub fn unload_all_loaded(&mut self, registries: &mut Registries) {
        let ids: Vec<ExtensionId> = self
            .records
            .values()
            .filter(|r| r.state == ExtensionState::Loaded && !r.is_permanent())
            .map(|r| r.id)
            .collect();
        let previous: HashSet<ExtensionId> = ids.iter().copied().collect();
        for id in &ids {
            if let Some(record) = self.records.get_mut(id) {
                let before = record.children.len();
                record.children.retain(|child| previous.contains(child));
                if record.children.len() != before {
                    debug!(
                        category = "modules",
                        extension = %record.name(),
                        detached = before - record.children.len(),
                        "Detached dependents outside the previous generation"
                    );
                }
            }
        }
        for id in ids {
            if !self.records.contains_key(&id) {
                continue;
            }
            let name = self.name_of(id);
            match self.unload_id(id, registries) {
                Ok(UnloadOutcome::Removed) => {}
                Ok(outcome) => debug!(category = "modules", extension = %name, outcome = ?outcome, "Previous generation still unloading"),
                Err(e) => warn!(category = "modules", extension = %name, error = %e, "Failed to unload previous generation"),
            }
        }
    }

    /// Drop every extension that was never loaded (Testing or Initialized),
    /// without calling unload.
    pub fn discard_testing(&mut self, registries: &mut Registries) {
        let ids: Vec<ExtensionId> = self
            .records
            .values()
            .filter(|r| matches!(r.state, ExtensionState::Testing | ExtensionState::Initialized))
            .map(|r| r.id)
            .collect();
        for id in ids {
            self.release(id, registries);
        }
    }

    /// Unload everything, dependents first, ignoring delay requests.
    pub fn shutdown(&mut self, registries: &mut Registries) {
        let ids: Vec<ExtensionId> = self.records.keys().copied().collect();
        for id in ids {
            self.shutdown_one(id, registries);
        }
    }

    fn shutdown_one(&mut self, id: ExtensionId, registries: &mut Registries) {
        let Some(record) = self.records.get(&id) else {
            return;
        };
        let children = record.children.clone();
        let activated = record.state != ExtensionState::Testing;
        for child in children {
            self.shutdown_one(child, registries);
        }
        if activated {
            if let Some(ModuleReturn::Failure(code)) = self.call_entry(id, Entry::Unload, registries) {
                debug!(category = "modules", extension = %self.name_of(id), code, "Unload failed during shutdown");
            }
        }
        self.release(id, registries);
    }

    /// Free a record: dependents first, then every registration, then the
    /// dependency edges, then the binary.
    pub(super) fn release(&mut self, id: ExtensionId, registries: &mut Registries) {
        let _lock = registries.event_lock.acquire();

        let children = match self.records.get(&id) {
            Some(record) => record.children.clone(),
            None => return,
        };
        for child in children {
            self.release(child, registries);
        }

        let Some(mut record) = self.records.remove(&id) else {
            return;
        };
        for object in record.objects.drain(..).rev() {
            registries.retract(id, &object);
        }
        for other in self.records.values_mut() {
            other.remove_child(id);
        }
        registries.events.cancel_unload_retry(id);

        debug!(
            category = "modules",
            extension = %record.name(),
            id = %id,
            state = record.state.as_str(),
            "Released extension"
        );
    }

    /// Newest extension called `name`.
    pub fn find(&self, name: &str) -> Option<&Extension> {
        self.records
            .values()
            .rev()
            .find(|r| r.name().eq_ignore_ascii_case(name))
    }

    pub fn get(&self, id: ExtensionId) -> Option<&Extension> {
        self.records.get(&id)
    }

    /// Extensions in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.records.values()
    }

    pub fn summaries(&self) -> Vec<ExtensionSummary> {
        self.records.values().map(ExtensionSummary::from).collect()
    }

    pub fn is_permanent(&self, id: ExtensionId) -> bool {
        self.records.get(&id).is_some_and(|r| r.is_permanent())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Tag, build and header checks, in that order.
fn validate(binary: &dyn ExtensionBinary) -> Result<(ExtensionHeader, ModsysVersion)> {
    let path = binary.location();

    match binary.version_tag()? {
        None => {
            return Err(validation_err!(
                path,
                "Lacking module version tag. Is this a modhost extension?"
            ))
        }
        Some(tag) if tag != MOD_VERSION_TAG => {
            return Err(Error::VersionMismatch {
                path: path.to_path_buf(),
                expected: MOD_VERSION_TAG.to_string(),
                found: tag,
            })
        }
        Some(_) => {}
    }

    if let Some(tag) = binary.build_tag() {
        if !tag.is_compatible_with(HOST_BUILD_TAG) {
            return Err(Error::AbiMismatch {
                path: path.to_path_buf(),
                expected: HOST_BUILD_TAG.to_string(),
                found: tag.to_string(),
            });
        }
    }

    let header = binary
        .header()?
        .ok_or_else(|| validation_err!(path, "Lacking sane header pointer"))?;
    if header.modversion.is_empty() {
        return Err(validation_err!(path, "Lacking mod_header->modversion"));
    }
    let modsys = ModsysVersion::parse(&header.modversion).ok_or_else(|| Error::UnsupportedModuleSystem {
        path: path.to_path_buf(),
        version: header.modversion.clone(),
    })?;
    if header.name.is_empty() || header.version.is_empty() || header.description.is_empty() {
        return Err(validation_err!(path, "Lacking sane header pointer"));
    }
    Ok((header, modsys))
}
