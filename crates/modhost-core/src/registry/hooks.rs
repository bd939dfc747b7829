//! Multi-subscriber hooks.

use std::collections::{BTreeMap, HashMap};
use std::any::Any;

use super::callable::Callable;
use crate::extension::ExtensionId;

/// Opaque handle returned by [`HookTable::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(u64);

#[derive(Debug, Clone)]
pub struct HookEntry {
    pub handle: HookHandle,
    pub hooktype: u32,
    pub func: Callable,
    /// `None` for host-owned hooks.
    pub owner: Option<ExtensionId>,
}

/// Every hook, grouped by hook type.
#[derive(Debug, Default)]
pub struct HookTable {
    hooks: BTreeMap<u32, Vec<HookEntry>>,
    index: HashMap<HookHandle, u32>,
    next: u64,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hooktype: u32, func: Callable, owner: Option<ExtensionId>) -> HookHandle {
        self.next += 1;
        let handle = HookHandle(self.next);
        self.hooks.entry(hooktype).or_default().push(HookEntry {
            handle,
            hooktype,
            func,
            owner,
        });
        self.index.insert(handle, hooktype);
        handle
    }

    pub fn remove(&mut self, handle: HookHandle) -> Option<HookEntry> {
        let hooktype = self.index.remove(&handle)?;
        let list = self.hooks.get_mut(&hooktype)?;
        let pos = list.iter().position(|h| h.handle == handle)?;
        let entry = list.remove(pos);
        if list.is_empty() {
            self.hooks.remove(&hooktype);
        }
        Some(entry)
    }

    /// All hooks of one type, in registration order.
    pub fn hooks(&self, hooktype: u32) -> &[HookEntry] {
        self.hooks.get(&hooktype).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Function pointers of type `F` registered for `hooktype`.
    pub fn functions<F: Any + Copy>(&self, hooktype: u32) -> impl Iterator<Item = F> + '_ {
        self.hooks(hooktype).iter().filter_map(|h| h.func.get::<F>())
    }

    /// Hook types with at least one subscriber, ascending.
    pub fn active_types(&self) -> impl Iterator<Item = u32> + '_ {
        self.hooks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
