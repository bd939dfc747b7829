//! The process-wide extension runtime.
//!
//! [`Runtime`] owns the [`Loader`] and every [`Registries`] table. The
//! host drives it from one thread: load extensions, [`Runtime::commit`]
//! the batch, call [`Runtime::tick`] from its event loop and
//! [`Runtime::shutdown`] on exit.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthClient, AuthData, AuthOutcome};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::events::EventAction;
use crate::extension::{
    purge_temp_dir, Extension, ExtensionId, ExtensionSummary, Loader, StaticBinary, SymbolScope,
    UnloadOutcome,
};
use crate::registry::Registries;

pub struct Runtime {
    config: RuntimeConfig,
    loader: Loader,
    registries: Registries,
}

impl Runtime {
    /// Create a runtime with the stock auth backends in the builtin catalog.
    pub fn new(config: RuntimeConfig) -> Self {
        let mut loader = Loader::new(&config);
        for ext in auth::stock_extensions() {
            loader.register_builtin(ext);
        }

        if config.tmp_dir.is_dir() {
            match purge_temp_dir(&config.tmp_dir) {
                Ok(0) => {}
                Ok(n) => debug!(category = "modules", removed = n, dir = %config.tmp_dir.display(), "Purged stale extension copies"),
                Err(e) => warn!(category = "modules", error = %e, dir = %config.tmp_dir.display(), "Failed to purge temp directory"),
            }
        }

        Self {
            config,
            loader,
            registries: Registries::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn registries_mut(&mut self) -> &mut Registries {
        &mut self.registries
    }

    pub fn register_builtin(&mut self, binary: StaticBinary) -> bool {
        self.loader.register_builtin(binary)
    }

    /// Require exactly one provider of efunction `slot` at every commit.
    pub fn declare_efunction(&mut self, slot: u32, name: &str) {
        self.registries.declare_efunction(slot, name);
    }

    pub fn load(&mut self, request: &str) -> Result<Option<ExtensionId>> {
        self.loader.load(request, &mut self.registries)
    }

    pub fn unload(&mut self, name: &str) -> Result<UnloadOutcome> {
        let outcome = self.loader.unload(name, &mut self.registries)?;
        if outcome == UnloadOutcome::Removed {
            info!(category = "modules", extension = %name, "Unloaded extension");
        }
        Ok(outcome)
    }

    pub fn find(&self, name: &str) -> Option<&Extension> {
        self.loader.find(name)
    }

    /// Activate the Testing batch.
    ///
    /// Init runs for every Testing extension, then the single-winner slots
    /// are checked. A failed check discards the whole batch and skips the
    /// switchover. Otherwise the new winners are published, the previous
    /// generation is unloaded when `rehash` is set, and load runs.
    ///
    /// Per-extension init and load failures do not fail the commit; they
    /// are returned.
    pub fn commit(&mut self, rehash: bool) -> Result<Vec<Error>> {
        let mut failures = self.loader.init_all_testing(&mut self.registries);

        if let Err(e) = self.registries.check(rehash) {
            error!(category = "modules", error = %e, "Extension check failed, discarding new extensions");
            self.loader.discard_testing(&mut self.registries);
            return Err(e);
        }

        let loader = &self.loader;
        self.registries.switchover(|id| loader.is_permanent(id));
        debug!(category = "modules", rehash, "Switchover complete");

        if rehash {
            self.loader.unload_all_loaded(&mut self.registries);
        }
        failures.extend(self.loader.load_all(&mut self.registries));
        Ok(failures)
    }

    /// Load every configured extension and activate them.
    ///
    /// Individual failures are returned; only a failed slot check is an
    /// error. Configured auth blocks are validated afterwards.
    pub fn start(&mut self) -> Result<Vec<Error>> {
        let mut failures = self.load_configured();
        failures.extend(self.commit(false)?);
        self.loader.set_module_load(true);

        for e in self.check_auth_config() {
            warn!(category = "auth", error = %e, "Invalid auth block");
            failures.push(e);
        }
        info!(
            category = "modules",
            extensions = self.loader.len(),
            failures = failures.len(),
            "Runtime started"
        );
        Ok(failures)
    }

    /// Load a new generation of every configured extension and replace
    /// the current one.
    ///
    /// The new generation resolves symbols only among itself, loading
    /// fresh providers where needed.
    pub fn rehash(&mut self) -> Result<Vec<Error>> {
        let scope = self.loader.set_symbol_scope(SymbolScope::Testing);
        let mut failures = self.load_configured();
        let committed = self.commit(true);
        self.loader.set_symbol_scope(scope);
        failures.extend(committed?);
        info!(category = "modules", extensions = self.loader.len(), "Rehash complete");
        Ok(failures)
    }

    fn load_configured(&mut self) -> Vec<Error> {
        let requests = self.config.load.clone();
        requests
            .iter()
            .filter_map(|request| self.loader.load(request, &mut self.registries).err())
            .collect()
    }

    /// Run every event due at `now`. Nothing runs while the event lock is
    /// held. Returns the number of events run.
    pub fn tick(&mut self, now: Instant) -> usize {
        if self.registries.event_lock.is_held() {
            return 0;
        }
        let due = self.registries.events.due(now);
        let count = due.len();
        for (_, action) in due {
            match action {
                EventAction::Call(f) => f(&mut self.registries),
                EventAction::RetryUnload(id) => {
                    self.loader.retry_unload(id, &mut self.registries);
                }
            }
        }
        count
    }

    /// Unload everything, ignoring delay requests.
    pub fn shutdown(&mut self) {
        let count = self.loader.len();
        self.loader.shutdown(&mut self.registries);
        info!(category = "modules", extensions = count, "Runtime shut down");
    }

    pub fn listing(&self, oper: bool) -> Vec<String> {
        self.loader.listing(oper, &self.registries)
    }

    pub fn summaries(&self) -> Vec<ExtensionSummary> {
        self.loader.summaries()
    }

    pub fn mkpasswd(&self, method: &str, text: &str) -> String {
        auth::mkpasswd(&self.registries.auth, method, text)
    }

    pub fn make_auth(&self, method: &str, param: &str) -> Option<String> {
        auth::make_auth(&self.registries.auth, method, param)
    }

    pub fn auth_check(&self, client: &dyn AuthClient, auth: Option<&AuthData>, param: Option<&str>) -> AuthOutcome {
        auth::check_auth(&self.registries.auth, client, auth, param)
    }

    /// Validate every configured auth block against the loaded backends.
    pub fn check_auth_config(&self) -> Vec<Error> {
        self.config
            .auth
            .iter()
            .filter_map(|block| auth::check_config(&self.registries.auth, block).err())
            .collect()
    }
}
