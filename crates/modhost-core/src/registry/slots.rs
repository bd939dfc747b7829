//! Single-winner slots: callbacks and efunctions.
//!
//! Any number of entries may be registered per slot but callers only ever
//! see the *active* one. Which entry is active changes only in
//! [`SlotTable::switchover`], or when the active entry is removed.
//!
//! Switchover publishes the newest non-retiring entry and marks it
//! retiring unless its owner is permanent. During a reload the next
//! generation's entry is then the only non-retiring candidate, while the
//! old one stays published until the old owner unloads.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::callable::Callable;
use crate::extension::ExtensionId;

/// What kind of single-winner slot a table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Callback,
    Efunction,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Callback => f.write_str("callback"),
            SlotKind::Efunction => f.write_str("efunction"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle(u64);

#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub handle: SlotHandle,
    pub slot: u32,
    pub func: Callable,
    pub owner: Option<ExtensionId>,
    /// Excluded from the next switchover.
    pub retiring: bool,
}

/// Observable state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing published.
    Empty,
    /// One entry published and no other candidate waiting.
    Active(SlotHandle),
    /// The published entry is retiring and a candidate is waiting for the
    /// next switchover.
    Handover {
        active: SlotHandle,
        candidate: SlotHandle,
    },
}

impl SlotState {
    pub fn active(self) -> Option<SlotHandle> {
        match self {
            SlotState::Empty => None,
            SlotState::Active(h) | SlotState::Handover { active: h, .. } => Some(h),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    entries: Vec<SlotEntry>,
    active: Option<SlotHandle>,
}

impl Slot {
    fn candidates(&self) -> impl Iterator<Item = &SlotEntry> {
        self.entries.iter().rev().filter(|e| !e.retiring)
    }
}

#[derive(Debug)]
pub struct SlotTable {
    kind: SlotKind,
    slots: BTreeMap<u32, Slot>,
    /// Slots the host requires to be filled, with their names.
    required: BTreeMap<u32, String>,
    index: HashMap<SlotHandle, u32>,
    next: u64,
}

impl SlotTable {
    pub fn new(kind: SlotKind) -> Self {
        Self {
            kind,
            slots: BTreeMap::new(),
            required: BTreeMap::new(),
            index: HashMap::new(),
            next: 0,
        }
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// Require exactly one provider for `slot` at every check.
    pub fn declare(&mut self, slot: u32, name: impl Into<String>) {
        self.required.insert(slot, name.into());
    }

    pub fn add(&mut self, slot: u32, func: Callable, owner: Option<ExtensionId>) -> SlotHandle {
        self.next += 1;
        let handle = SlotHandle(self.next);
        self.slots.entry(slot).or_default().entries.push(SlotEntry {
            handle,
            slot,
            func,
            owner,
            retiring: false,
        });
        self.index.insert(handle, slot);
        handle
    }

    /// Remove an entry. Removing the published entry leaves the slot empty
    /// until the next switchover.
    pub fn remove(&mut self, handle: SlotHandle) -> Option<SlotEntry> {
        let slot_id = self.index.remove(&handle)?;
        let slot = self.slots.get_mut(&slot_id)?;
        let pos = slot.entries.iter().position(|e| e.handle == handle)?;
        let entry = slot.entries.remove(pos);
        if slot.active == Some(handle) {
            slot.active = None;
        }
        if slot.entries.is_empty() {
            self.slots.remove(&slot_id);
        }
        Some(entry)
    }

    pub fn entries(&self, slot: u32) -> &[SlotEntry] {
        self.slots
            .get(&slot)
            .map(|s| s.entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn entry(&self, handle: SlotHandle) -> Option<&SlotEntry> {
        let slot = self.index.get(&handle)?;
        self.entries(*slot).iter().find(|e| e.handle == handle)
    }

    /// The published entry for `slot`.
    pub fn active(&self, slot: u32) -> Option<&SlotEntry> {
        let active = self.slots.get(&slot)?.active?;
        self.entry(active)
    }

    /// The published function for `slot`, if it has type `F`.
    pub fn active_fn<F: Any + Copy>(&self, slot: u32) -> Option<F> {
        self.active(slot)?.func.get::<F>()
    }

    pub fn state(&self, slot: u32) -> SlotState {
        let Some(s) = self.slots.get(&slot) else {
            return SlotState::Empty;
        };
        match s.active {
            None => SlotState::Empty,
            Some(active) => match s.candidates().find(|e| e.handle != active) {
                Some(candidate) => SlotState::Handover {
                    active,
                    candidate: candidate.handle,
                },
                None => SlotState::Active(active),
            },
        }
    }

    /// Number of non-retiring entries for `slot`.
    pub fn candidates(&self, slot: u32) -> usize {
        self.slots.get(&slot).map_or(0, |s| s.candidates().count())
    }

    /// Every slot that would be ambiguous or missing after a switchover.
    ///
    /// When `rehash` is false the retiring generation stays loaded, so a
    /// published retiring entry still satisfies a required slot.
    pub fn problems(&self, rehash: bool) -> Vec<String> {
        let mut problems = Vec::new();
        match self.kind {
            SlotKind::Callback => {
                for (id, slot) in &self.slots {
                    let n = slot.candidates().count();
                    if n > 1 {
                        problems.push(format!(
                            "Multiple callbacks loaded for type {} ({} registrants). Make sure you only load 1 module of 1 type",
                            self.label(*id),
                            n
                        ));
                    }
                }
            }
            SlotKind::Efunction => {
                let ids: std::collections::BTreeSet<u32> =
                    self.required.keys().chain(self.slots.keys()).copied().collect();
                for id in ids {
                    let slot = self.slots.get(&id);
                    let mut n = slot.map_or(0, |s| s.candidates().count());
                    if n == 0 && !rehash && slot.is_some_and(|s| s.active.is_some()) {
                        n = 1;
                    }
                    if n == 0 && self.required.contains_key(&id) {
                        problems.push(format!(
                            "efunction '{}' not found, not all required extensions are loaded",
                            self.label(id)
                        ));
                    } else if n > 1 {
                        problems.push(format!(
                            "efunction '{}' was found {} times, an extension providing it was loaded twice",
                            self.label(id),
                            n
                        ));
                    }
                }
            }
        }
        problems
    }

    /// Publish the newest non-retiring entry of every slot.
    ///
    /// The published entry is marked retiring unless `is_permanent` holds
    /// for its owner. Host-owned entries never retire. Slots with no
    /// candidate keep their current publication.
    pub fn switchover(&mut self, is_permanent: impl Fn(ExtensionId) -> bool) {
        for slot in self.slots.values_mut() {
            let Some(entry) = slot.entries.iter_mut().rev().find(|e| !e.retiring) else {
                continue;
            };
            slot.active = Some(entry.handle);
            if let Some(owner) = entry.owner {
                if !is_permanent(owner) {
                    entry.retiring = true;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn label(&self, slot: u32) -> String {
        match self.required.get(&slot) {
            Some(name) => name.clone(),
            None => slot.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type CloakFn = fn(&str) -> String;

    fn cloak_v1(host: &str) -> String {
        format!("v1.{host}")
    }

    fn cloak_v2(host: &str) -> String {
        format!("v2.{host}")
    }

    const CLOAK: u32 = 1;

    fn id(n: u64) -> ExtensionId {
        ExtensionId::new(n)
    }

    #[test]
    fn test_reload_keeps_exactly_one_active() {
        let mut table = SlotTable::new(SlotKind::Callback);
        assert_eq!(table.state(CLOAK), SlotState::Empty);

        let old = table.add(CLOAK, Callable::new(cloak_v1 as CloakFn), Some(id(1)));
        assert!(table.problems(false).is_empty());
        table.switchover(|_| false);
        assert_eq!(table.state(CLOAK), SlotState::Active(old));
        assert!(table.entry(old).unwrap().retiring);

        // Next generation registers alongside the old one.
        let new = table.add(CLOAK, Callable::new(cloak_v2 as CloakFn), Some(id(2)));
        assert_eq!(
            table.state(CLOAK),
            SlotState::Handover {
                active: old,
                candidate: new
            }
        );
        assert_eq!(table.active_fn::<CloakFn>(CLOAK).unwrap()("host"), "v1.host");
        assert!(table.problems(true).is_empty());

        table.switchover(|_| false);
        assert_eq!(table.state(CLOAK), SlotState::Active(new));
        assert_eq!(table.active_fn::<CloakFn>(CLOAK).unwrap()("host"), "v2.host");

        // Old generation unloads.
        table.remove(old);
        assert_eq!(table.state(CLOAK), SlotState::Active(new));
    }

    #[test]
    fn test_two_candidates_is_a_problem() {
        let mut table = SlotTable::new(SlotKind::Callback);
        table.add(CLOAK, Callable::new(cloak_v1 as CloakFn), Some(id(1)));
        table.add(CLOAK, Callable::new(cloak_v2 as CloakFn), Some(id(2)));
        let problems = table.problems(false);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("type 1"));
    }

    #[test]
    fn test_permanent_owner_never_retires() {
        let mut table = SlotTable::new(SlotKind::Callback);
        let h = table.add(CLOAK, Callable::new(cloak_v1 as CloakFn), Some(id(1)));
        table.switchover(|owner| owner == id(1));
        assert!(!table.entry(h).unwrap().retiring);
        assert_eq!(table.candidates(CLOAK), 1);
    }

    #[test]
    fn test_removing_active_empties_slot() {
        let mut table = SlotTable::new(SlotKind::Callback);
        let h = table.add(CLOAK, Callable::new(cloak_v1 as CloakFn), None);
        table.switchover(|_| false);
        assert!(!table.entry(h).unwrap().retiring);
        table.remove(h);
        assert_eq!(table.state(CLOAK), SlotState::Empty);
        assert!(table.is_empty());
    }

    #[test]
    fn test_required_efunctions() {
        let mut table = SlotTable::new(SlotKind::Efunction);
        table.declare(0, "do_join");
        table.declare(1, "can_join");

        let problems = table.problems(false);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("'do_join' not found"));

        table.add(0, Callable::new(cloak_v1 as CloakFn), Some(id(1)));
        table.add(1, Callable::new(cloak_v1 as CloakFn), Some(id(1)));
        table.add(1, Callable::new(cloak_v2 as CloakFn), Some(id(2)));
        let problems = table.problems(false);
        assert_eq!(problems, vec![
            "efunction 'can_join' was found 2 times, an extension providing it was loaded twice".to_string()
        ]);
    }

    #[test]
    fn test_retiring_efunction_counts_only_without_rehash() {
        let mut table = SlotTable::new(SlotKind::Efunction);
        table.declare(0, "do_join");
        table.add(0, Callable::new(cloak_v1 as CloakFn), Some(id(1)));
        table.switchover(|_| false);
        assert!(table.problems(false).is_empty());
        assert_eq!(table.problems(true).len(), 1);
    }
}
