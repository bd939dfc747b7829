//! Extension-defined hook types.

use crate::error::ModuleError;
use crate::extension::ExtensionId;
use crate::trie::{ascii_uppercase, Trie};

/// First id handed out to an extension-defined hook type.
pub const FIRST_HOOKTYPE_ID: u32 = 41;
/// Number of extension-defined hook types that can exist at once.
pub const MAX_HOOKTYPES: usize = 39;

#[derive(Debug, Clone)]
pub struct Hooktype {
    pub id: u32,
    pub name: String,
    /// Owners keeping this type alive. `None` is the host.
    pub parents: Vec<Option<ExtensionId>>,
}

#[derive(Debug)]
pub struct HooktypeTable {
    types: Trie<Hooktype>,
    used: [bool; MAX_HOOKTYPES],
}

impl Default for HooktypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HooktypeTable {
    pub fn new() -> Self {
        Self {
            types: Trie::named("hooktypes", Some(ascii_uppercase)),
            used: [false; MAX_HOOKTYPES],
        }
    }

    /// Register `name` for `owner`, returning its id and whether `owner`
    /// became a new parent.
    ///
    /// Registering an existing name (in any case) returns the existing id.
    pub fn add(&mut self, name: &str, owner: Option<ExtensionId>) -> Result<(u32, bool), ModuleError> {
        if name.is_empty() {
            return Err(ModuleError::Invalid);
        }
        if let Some(ht) = self.types.find_mut(name) {
            if ht.parents.contains(&owner) {
                return Ok((ht.id, false));
            }
            ht.parents.push(owner);
            return Ok((ht.id, true));
        }

        let slot = self
            .used
            .iter()
            .position(|used| !used)
            .ok_or(ModuleError::NoSpace)?;
        let id = FIRST_HOOKTYPE_ID + slot as u32;
        let hooktype = Hooktype {
            id,
            name: name.to_string(),
            parents: vec![owner],
        };
        if !self.types.add(name, hooktype) {
            return Err(ModuleError::Invalid);
        }
        self.used[slot] = true;
        Ok((id, true))
    }

    /// Drop `owner` as a parent; the type is freed with its last parent.
    pub fn remove(&mut self, name: &str, owner: Option<ExtensionId>) -> bool {
        let Some(ht) = self.types.find_mut(name) else {
            return false;
        };
        let Some(pos) = ht.parents.iter().position(|p| *p == owner) else {
            return false;
        };
        ht.parents.remove(pos);
        if ht.parents.is_empty() {
            if let Some(ht) = self.types.delete(name) {
                self.used[(ht.id - FIRST_HOOKTYPE_ID) as usize] = false;
            }
        }
        true
    }

    pub fn find(&self, name: &str) -> Option<&Hooktype> {
        self.types.find(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hooktype> {
        self.types.iter().map(|(_, ht)| ht)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
