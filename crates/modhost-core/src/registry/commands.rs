//! Command table and override chains.
//!
//! Each command has a base handler and a chain of overrides. Dispatch
//! enters the newest override; an override reaches the older links only
//! by calling [`OverrideLink::call_next`], so it may also swallow the
//! command entirely.

use std::collections::HashMap;

use crate::error::ModuleError;
use crate::extension::ExtensionId;
use crate::trie::{ascii_uppercase, Trie};

/// Arguments and replies of one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandCall {
    pub source: String,
    pub params: Vec<String>,
    pub replies: Vec<String>,
}

impl CommandCall {
    pub fn new(source: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            source: source.into(),
            params,
            replies: Vec::new(),
        }
    }

    pub fn reply(&mut self, line: impl Into<String>) {
        self.replies.push(line.into());
    }
}

pub type CommandFn = fn(&mut CommandCall) -> i32;
pub type OverrideFn = fn(&OverrideLink<'_>, &mut CommandCall) -> i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverrideHandle(u64);

#[derive(Debug, Clone)]
pub struct Override {
    pub handle: OverrideHandle,
    pub func: OverrideFn,
    pub owner: Option<ExtensionId>,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub base: CommandFn,
    pub owner: Option<ExtensionId>,
    /// Oldest first; dispatch enters at the back.
    overrides: Vec<Override>,
}

impl Command {
    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    pub fn is_overridden(&self) -> bool {
        !self.overrides.is_empty()
    }

    fn call(&self, call: &mut CommandCall) -> i32 {
        match self.overrides.len() {
            0 => (self.base)(call),
            n => OverrideLink {
                command: self,
                position: n - 1,
            }
            .invoke(call),
        }
    }
}

/// One position in a command's override chain.
pub struct OverrideLink<'a> {
    command: &'a Command,
    position: usize,
}

impl OverrideLink<'_> {
    pub fn command_name(&self) -> &str {
        &self.command.name
    }

    pub fn owner(&self) -> Option<ExtensionId> {
        self.command.overrides[self.position].owner
    }

    /// Call the next-older override, or the base handler at the end of the chain.
    pub fn call_next(&self, call: &mut CommandCall) -> i32 {
        match self.position {
            0 => (self.command.base)(call),
            n => OverrideLink {
                command: self.command,
                position: n - 1,
            }
            .invoke(call),
        }
    }

    fn invoke(&self, call: &mut CommandCall) -> i32 {
        (self.command.overrides[self.position].func)(self, call)
    }
}

#[derive(Debug)]
pub struct CommandTable {
    commands: Trie<Command>,
    index: HashMap<OverrideHandle, String>,
    next: u64,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            commands: Trie::named("commands", Some(ascii_uppercase)),
            index: HashMap::new(),
            next: 0,
        }
    }

    pub fn add(&mut self, name: &str, base: CommandFn, owner: Option<ExtensionId>) -> Result<(), ModuleError> {
        if name.is_empty() {
            return Err(ModuleError::Invalid);
        }
        let command = Command {
            name: name.to_string(),
            base,
            owner,
            overrides: Vec::new(),
        };
        if self.commands.add(name, command) {
            Ok(())
        } else {
            Err(ModuleError::Exists)
        }
    }

    /// Remove a command together with any overrides still chained on it.
    pub fn remove(&mut self, name: &str) -> Option<Command> {
        let command = self.commands.delete(name)?;
        for ovr in &command.overrides {
            self.index.remove(&ovr.handle);
        }
        Some(command)
    }

    pub fn find(&self, name: &str) -> Option<&Command> {
        self.commands.find(name)
    }

    /// Chain `func` on `name` as the newest override.
    pub fn add_override(
        &mut self,
        name: &str,
        func: OverrideFn,
        owner: Option<ExtensionId>,
    ) -> Result<OverrideHandle, ModuleError> {
        let command = self.commands.find_mut(name).ok_or(ModuleError::NotFound)?;
        if command
            .overrides
            .iter()
            .any(|o| o.owner == owner && std::ptr::fn_addr_eq(o.func, func))
        {
            return Err(ModuleError::Exists);
        }
        self.next += 1;
        let handle = OverrideHandle(self.next);
        command.overrides.push(Override {
            handle,
            func,
            owner,
        });
        self.index.insert(handle, command.name.clone());
        Ok(handle)
    }

    pub fn remove_override(&mut self, handle: OverrideHandle) -> Option<Override> {
        let name = self.index.remove(&handle)?;
        let command = self.commands.find_mut(&name)?;
        let pos = command.overrides.iter().position(|o| o.handle == handle)?;
        Some(command.overrides.remove(pos))
    }

    /// Run `name` through its override chain. `None` if there is no such command.
    pub fn dispatch(&self, name: &str, call: &mut CommandCall) -> Option<i32> {
        self.commands.find(name).map(|cmd| cmd.call(call))
    }

    /// Commands with at least one override, in name order.
    pub fn overridden(&self) -> impl Iterator<Item = &Command> {
        self.commands
            .iter()
            .map(|(_, cmd)| cmd)
            .filter(|cmd| cmd.is_overridden())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(call: &mut CommandCall) -> i32 {
        call.reply("base");
        0
    }

    fn logging(link: &OverrideLink<'_>, call: &mut CommandCall) -> i32 {
        call.reply(format!("log {}", link.command_name()));
        link.call_next(call)
    }

    fn deny(_: &OverrideLink<'_>, call: &mut CommandCall) -> i32 {
        call.reply("denied");
        -1
    }

    #[test]
    fn test_dispatch_without_overrides() {
        let mut table = CommandTable::new();
        table.add("PRIVMSG", base, None).unwrap();
        assert_eq!(table.add("privmsg", base, None), Err(ModuleError::Exists));

        let mut call = CommandCall::new("nick", vec![]);
        assert_eq!(table.dispatch("privmsg", &mut call), Some(0));
        assert_eq!(call.replies, vec!["base"]);
        assert_eq!(table.dispatch("NOPE", &mut call), None);
    }

    #[test]
    fn test_chain_runs_newest_first() {
        let mut table = CommandTable::new();
        table.add("KICK", base, None).unwrap();
        let owner = Some(ExtensionId::new(1));
        table.add_override("kick", logging, owner).unwrap();
        let deny_handle = table.add_override("kick", deny, owner).unwrap();

        let mut call = CommandCall::default();
        assert_eq!(table.dispatch("KICK", &mut call), Some(-1));
        assert_eq!(call.replies, vec!["denied"]);

        table.remove_override(deny_handle).unwrap();
        let mut call = CommandCall::default();
        assert_eq!(table.dispatch("KICK", &mut call), Some(0));
        assert_eq!(call.replies, vec!["log KICK", "base"]);
    }

    #[test]
    fn test_override_errors() {
        let mut table = CommandTable::new();
        let owner = Some(ExtensionId::new(1));
        assert_eq!(
            table.add_override("MODE", logging, owner),
            Err(ModuleError::NotFound)
        );
        table.add("MODE", base, None).unwrap();
        table.add_override("MODE", logging, owner).unwrap();
        assert_eq!(
            table.add_override("MODE", logging, owner),
            Err(ModuleError::Exists)
        );
        // Another owner may chain the same function.
        assert!(table.add_override("MODE", logging, None).is_ok());
        assert_eq!(table.overridden().count(), 1);
    }

    #[test]
    fn test_remove_command_drops_overrides() {
        let mut table = CommandTable::new();
        table.add("AWAY", base, None).unwrap();
        let h = table.add_override("AWAY", logging, None).unwrap();
        assert!(table.remove("away").is_some());
        assert!(table.remove_override(h).is_none());
        assert!(table.is_empty());
    }
}
