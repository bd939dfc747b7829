//! Extension-point registries.
//!
//! All tables an extension can register into live in one [`Registries`]
//! value owned by the runtime. Every registration made through
//! [`ModuleInfo`](crate::extension::ModuleInfo) is also recorded on the
//! extension as a [`ModuleObject`], so unloading can retract it.

pub mod callable;
pub mod commands;
pub mod hooks;
pub mod hooktypes;
pub mod slots;
pub mod versionflags;

pub use callable::Callable;
pub use commands::{
    Command, CommandCall, CommandFn, CommandTable, Override, OverrideFn, OverrideHandle, OverrideLink,
};
pub use hooks::{HookEntry, HookHandle, HookTable};
pub use hooktypes::{Hooktype, HooktypeTable, FIRST_HOOKTYPE_ID, MAX_HOOKTYPES};
pub use slots::{SlotEntry, SlotHandle, SlotKind, SlotState, SlotTable};
pub use versionflags::{Versionflag, VersionflagTable};

use tracing::debug;

use crate::auth::AuthRegistry;
use crate::error::{Error, Result};
use crate::events::{EventHandle, EventLock, EventQueue};
use crate::extension::ExtensionId;

/// One registration owned by an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleObject {
    Hook(HookHandle),
    Callback(SlotHandle),
    Efunction(SlotHandle),
    Hooktype(String),
    Versionflag(char),
    Command(String),
    CmdOverride(OverrideHandle),
    AuthBackend(String),
    Event(EventHandle),
}

/// Every extension-point table.
#[derive(Debug)]
pub struct Registries {
    pub hooks: HookTable,
    pub callbacks: SlotTable,
    pub efunctions: SlotTable,
    pub hooktypes: HooktypeTable,
    pub versionflags: VersionflagTable,
    pub commands: CommandTable,
    pub auth: AuthRegistry,
    pub events: EventQueue,
    pub event_lock: EventLock,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    pub fn new() -> Self {
        Self {
            hooks: HookTable::new(),
            callbacks: SlotTable::new(SlotKind::Callback),
            efunctions: SlotTable::new(SlotKind::Efunction),
            hooktypes: HooktypeTable::new(),
            versionflags: VersionflagTable::new(),
            commands: CommandTable::new(),
            auth: AuthRegistry::new(),
            events: EventQueue::new(),
            event_lock: EventLock::new(),
        }
    }

    /// Require exactly one provider of efunction `slot` at every check.
    pub fn declare_efunction(&mut self, slot: u32, name: &str) {
        self.efunctions.declare(slot, name);
    }

    /// Verify that a switchover would leave every single-winner slot with
    /// exactly one implementation. All problems are reported together.
    pub fn check(&self, rehash: bool) -> Result<()> {
        let mut problems = self.callbacks.problems(rehash);
        problems.extend(self.efunctions.problems(rehash));
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::SlotCheck(problems))
        }
    }

    /// Publish the current candidates of every callback and efunction slot.
    pub fn switchover(&mut self, is_permanent: impl Fn(ExtensionId) -> bool) {
        self.callbacks.switchover(&is_permanent);
        self.efunctions.switchover(&is_permanent);
    }

    /// Undo one registration on behalf of `owner`.
    pub(crate) fn retract(&mut self, owner: ExtensionId, object: &ModuleObject) {
        let found = match object {
            ModuleObject::Hook(h) => self.hooks.remove(*h).is_some(),
            ModuleObject::Callback(h) => self.callbacks.remove(*h).is_some(),
            ModuleObject::Efunction(h) => self.efunctions.remove(*h).is_some(),
            ModuleObject::Hooktype(name) => self.hooktypes.remove(name, Some(owner)),
            ModuleObject::Versionflag(flag) => self.versionflags.remove(*flag, Some(owner)),
            ModuleObject::Command(name) => self.commands.remove(name).is_some(),
            ModuleObject::CmdOverride(h) => self.commands.remove_override(*h).is_some(),
            ModuleObject::AuthBackend(name) => self.auth.unregister(name).is_some(),
            ModuleObject::Event(h) => self.events.cancel(*h),
        };
        if !found {
            debug!(category = "modules", extension = %owner, object = ?object, "Registration already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() {}

    #[test]
    fn test_check_aggregates_every_problem() {
        let mut regs = Registries::new();
        regs.declare_efunction(0, "do_join");
        regs.callbacks.add(2, Callable::new(noop as fn()), Some(ExtensionId::new(1)));
        regs.callbacks.add(2, Callable::new(noop as fn()), Some(ExtensionId::new(2)));

        match regs.check(false) {
            Err(Error::SlotCheck(problems)) => {
                assert_eq!(problems.len(), 2);
                assert!(problems.iter().any(|p| p.contains("type 2")));
                assert!(problems.iter().any(|p| p.contains("do_join")));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_retract_each_kind() {
        let mut regs = Registries::new();
        let owner = ExtensionId::new(1);
        let hook = regs.hooks.add(1, Callable::new(noop as fn()), Some(owner));
        regs.hooktypes.add("my_type", Some(owner)).unwrap();
        regs.versionflags.add('X', Some(owner)).unwrap();

        regs.retract(owner, &ModuleObject::Hook(hook));
        regs.retract(owner, &ModuleObject::Hooktype("MY_TYPE".into()));
        regs.retract(owner, &ModuleObject::Versionflag('X'));
        // Retracting twice is harmless.
        regs.retract(owner, &ModuleObject::Hook(hook));

        assert!(regs.hooks.is_empty());
        assert!(regs.hooktypes.is_empty());
        assert!(regs.versionflags.is_empty());
    }
}
