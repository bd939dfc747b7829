//! The handle an extension receives in its lifecycle entry points.

use std::any::Any;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::record::{Extension, ExtensionId, ExtensionOptions};
use crate::auth::AuthOps;
use crate::error::ModuleError;
use crate::events::{EventAction, EventFn, EventHandle};
use crate::registry::{
    Callable, CommandFn, HookHandle, ModuleObject, OverrideFn, OverrideHandle, Registries, SlotHandle,
};

/// Passed to `test`, `init`, `load` and `unload`.
///
/// Every registration goes through here so it is recorded on the
/// extension and retracted when the extension is freed. Each call leaves
/// its outcome in [`ModuleInfo::error`].
pub struct ModuleInfo<'a> {
    record: &'a mut Extension,
    registries: &'a mut Registries,
    module_load: bool,
}

impl<'a> ModuleInfo<'a> {
    pub(crate) fn new(record: &'a mut Extension, registries: &'a mut Registries, module_load: bool) -> Self {
        Self {
            record,
            registries,
            module_load,
        }
    }

    pub fn handle(&self) -> ExtensionId {
        self.record.id
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// `true` when loaded at runtime rather than during startup.
    pub fn module_load(&self) -> bool {
        self.module_load
    }

    pub fn options(&self) -> ExtensionOptions {
        self.record.options
    }

    /// Replace the option flags, returning the previous ones.
    pub fn set_options(&mut self, options: ExtensionOptions) -> ExtensionOptions {
        std::mem::replace(&mut self.record.options, options)
    }

    pub fn mark_official(&mut self) {
        self.record.options.insert(ExtensionOptions::OFFICIAL);
    }

    pub fn mark_permanent(&mut self) {
        self.record.options.insert(ExtensionOptions::PERMANENT);
    }

    /// Outcome of the last registration call.
    pub fn error(&self) -> ModuleError {
        self.record.error
    }

    /// Read-only view of every registry.
    pub fn registries(&self) -> &Registries {
        &*self.registries
    }

    fn owner(&self) -> Option<ExtensionId> {
        Some(self.record.id)
    }

    fn record_object(&mut self, object: ModuleObject) {
        self.record.error = ModuleError::NoError;
        self.record.objects.push(object);
    }

    fn fail(&mut self, error: ModuleError) {
        self.record.error = error;
    }

    fn retract(&mut self, object: ModuleObject) {
        self.registries.retract(self.record.id, &object);
        self.record.forget_object(&object);
        self.record.error = ModuleError::NoError;
    }

    pub fn hook_add<F: Any + Send + Sync>(&mut self, hooktype: u32, func: F) -> HookHandle {
        let owner = self.owner();
        let handle = self.registries.hooks.add(hooktype, Callable::new(func), owner);
        self.record_object(ModuleObject::Hook(handle));
        handle
    }

    pub fn hook_del(&mut self, handle: HookHandle) {
        self.retract(ModuleObject::Hook(handle));
    }

    pub fn callback_add<F: Any + Send + Sync>(&mut self, slot: u32, func: F) -> SlotHandle {
        let owner = self.owner();
        let handle = self.registries.callbacks.add(slot, Callable::new(func), owner);
        self.record_object(ModuleObject::Callback(handle));
        handle
    }

    pub fn callback_del(&mut self, handle: SlotHandle) {
        self.retract(ModuleObject::Callback(handle));
    }

    /// Only official extensions may provide efunctions.
    pub fn efunction_add<F: Any + Send + Sync>(&mut self, slot: u32, func: F) -> Option<SlotHandle> {
        if self.record.options.is_third_party() {
            warn!(
                category = "modules",
                extension = %self.record.name(),
                slot,
                "Efunction refused: extension is not official"
            );
            self.fail(ModuleError::Invalid);
            return None;
        }
        let owner = self.owner();
        let handle = self.registries.efunctions.add(slot, Callable::new(func), owner);
        self.record_object(ModuleObject::Efunction(handle));
        Some(handle)
    }

    pub fn efunction_del(&mut self, handle: SlotHandle) {
        self.retract(ModuleObject::Efunction(handle));
    }

    /// Register or join a named hook type. Returns its numeric id.
    pub fn hooktype_add(&mut self, name: &str) -> Option<u32> {
        let owner = self.owner();
        match self.registries.hooktypes.add(name, owner) {
            Ok((id, new_parent)) => {
                if new_parent {
                    self.record_object(ModuleObject::Hooktype(name.to_string()));
                } else {
                    self.record.error = ModuleError::NoError;
                }
                Some(id)
            }
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    pub fn hooktype_del(&mut self, name: &str) {
        let object = self
            .record
            .objects
            .iter()
            .find(|o| matches!(o, ModuleObject::Hooktype(n) if n.eq_ignore_ascii_case(name)))
            .cloned();
        match object {
            Some(object) => self.retract(object),
            None => self.fail(ModuleError::NotFound),
        }
    }

    pub fn versionflag_add(&mut self, flag: char) -> bool {
        let owner = self.owner();
        match self.registries.versionflags.add(flag, owner) {
            Ok(true) => {
                self.record_object(ModuleObject::Versionflag(flag));
                true
            }
            Ok(false) => {
                self.record.error = ModuleError::NoError;
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    pub fn versionflag_del(&mut self, flag: char) {
        self.retract(ModuleObject::Versionflag(flag));
    }

    pub fn command_add(&mut self, name: &str, func: CommandFn) -> bool {
        let owner = self.owner();
        match self.registries.commands.add(name, func, owner) {
            Ok(()) => {
                self.record_object(ModuleObject::Command(name.to_string()));
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    pub fn command_del(&mut self, name: &str) {
        let object = self
            .record
            .objects
            .iter()
            .find(|o| matches!(o, ModuleObject::Command(n) if n.eq_ignore_ascii_case(name)))
            .cloned();
        match object {
            Some(object) => self.retract(object),
            None => self.fail(ModuleError::NotFound),
        }
    }

    /// Chain `func` in front of the current implementation of `name`.
    pub fn cmdoverride_add(&mut self, name: &str, func: OverrideFn) -> Option<OverrideHandle> {
        let owner = self.owner();
        match self.registries.commands.add_override(name, func, owner) {
            Ok(handle) => {
                self.record_object(ModuleObject::CmdOverride(handle));
                Some(handle)
            }
            Err(e) => {
                debug!(category = "modules", extension = %self.record.name(), command = name, error = ?e, "Override refused");
                self.fail(e);
                None
            }
        }
    }

    pub fn cmdoverride_del(&mut self, handle: OverrideHandle) {
        self.retract(ModuleObject::CmdOverride(handle));
    }

    pub fn auth_register(&mut self, ops: AuthOps) -> bool {
        let name = ops.name.clone();
        if self.registries.auth.register(ops) {
            self.record_object(ModuleObject::AuthBackend(name));
            true
        } else {
            warn!(category = "auth", extension = %self.record.name(), method = %name, "Authentication method already registered");
            self.fail(ModuleError::Exists);
            false
        }
    }

    pub fn auth_unregister(&mut self, name: &str) {
        let object = self
            .record
            .objects
            .iter()
            .find(|o| matches!(o, ModuleObject::AuthBackend(n) if n.eq_ignore_ascii_case(name)))
            .cloned();
        match object {
            Some(object) => self.retract(object),
            None => self.fail(ModuleError::NotFound),
        }
    }

    /// Run `func` every `every`, `count` times (`None`: until removed).
    pub fn event_add(
        &mut self,
        name: &str,
        every: Duration,
        count: Option<u32>,
        func: EventFn,
    ) -> EventHandle {
        let owner = self.owner();
        let handle = self
            .registries
            .events
            .add(name, every, count, EventAction::Call(func), owner, Instant::now());
        self.record_object(ModuleObject::Event(handle));
        handle
    }

    pub fn event_del(&mut self, handle: EventHandle) {
        self.retract(ModuleObject::Event(handle));
    }
}
