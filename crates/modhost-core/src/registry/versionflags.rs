//! Single-character flags appended to the server version reply.

use crate::error::ModuleError;
use crate::extension::ExtensionId;
use crate::trie::Trie;

#[derive(Debug, Clone)]
pub struct Versionflag {
    pub flag: char,
    pub parents: Vec<Option<ExtensionId>>,
}

#[derive(Debug)]
pub struct VersionflagTable {
    flags: Trie<Versionflag>,
}

impl Default for VersionflagTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionflagTable {
    pub fn new() -> Self {
        Self {
            flags: Trie::named("versionflags", None),
        }
    }

    /// Register `flag` for `owner`. Returns whether `owner` became a new parent.
    pub fn add(&mut self, flag: char, owner: Option<ExtensionId>) -> Result<bool, ModuleError> {
        if flag == '\0' || flag.is_whitespace() {
            return Err(ModuleError::Invalid);
        }
        let key = flag.to_string();
        if let Some(vf) = self.flags.find_mut(&key) {
            if vf.parents.contains(&owner) {
                return Ok(false);
            }
            vf.parents.push(owner);
            return Ok(true);
        }
        self.flags.add(
            &key,
            Versionflag {
                flag,
                parents: vec![owner],
            },
        );
        Ok(true)
    }

    pub fn remove(&mut self, flag: char, owner: Option<ExtensionId>) -> bool {
        let key = flag.to_string();
        let Some(vf) = self.flags.find_mut(&key) else {
            return false;
        };
        let Some(pos) = vf.parents.iter().position(|p| *p == owner) else {
            return false;
        };
        vf.parents.remove(pos);
        if vf.parents.is_empty() {
            self.flags.delete(&key);
        }
        true
    }

    pub fn find(&self, flag: char) -> Option<&Versionflag> {
        self.flags.find(&flag.to_string())
    }

    /// All registered flags, in order.
    pub fn flags(&self) -> String {
        self.flags.iter().map(|(_, vf)| vf.flag).collect()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}
