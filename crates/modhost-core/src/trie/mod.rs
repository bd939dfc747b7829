//! Patricia trie keyed by canonicalized strings.
//!
//! Every named registry in the runtime (auth backends, hook types, commands,
//! version flags) is stored in a [`Trie`]. Keys are split into 4-bit nibbles
//! and each branch tests one nibble, so iteration in slot order yields keys in
//! ascending byte order of their canonical form.
//!
//! ```text
//!            [branch nib 1]
//!           /      |       \
//!        0x1      0x3      0x5
//!        AUTH   [branch nib 3]  EFUNC
//!                /      \
//!             CRYPT    CERTFP
//! ```
//!
//! Canonicalization (for example ASCII upper-casing) runs once on insert and
//! once on lookup; stored keys are never re-canonicalized. Keys containing a
//! NUL byte are rejected because nibbles past the end of a key read as zero.

mod iter;

use std::fmt;

pub use iter::{Cursor, Iter};

const FANOUT: usize = 16;

pub(crate) type NodeId = usize;

/// Key normalization applied before insertion and lookup.
pub type Canonicalize = fn(&mut String);

/// Case-insensitive canonicalization: ASCII upper-casing.
pub fn ascii_uppercase(key: &mut String) {
    key.make_ascii_uppercase();
}

#[derive(Debug)]
struct Branch {
    nibnum: usize,
    down: [Option<NodeId>; FANOUT],
    parent: Option<NodeId>,
    parent_val: u8,
}

#[derive(Debug)]
struct Leaf<T> {
    key: String,
    data: T,
    parent: Option<NodeId>,
    parent_val: u8,
}

#[derive(Debug)]
enum Elem<T> {
    Branch(Branch),
    Leaf(Leaf<T>),
    Vacant,
}

fn nibble(key: &[u8], n: usize) -> u8 {
    match key.get(n / 2) {
        Some(b) if n & 1 == 0 => b >> 4,
        Some(b) => b & 0x0f,
        None => 0,
    }
}

/// A string-keyed patricia trie.
///
/// Data is owned by the trie until it is handed back by [`Trie::delete`].
pub struct Trie<T> {
    name: Option<String>,
    canonize: Option<Canonicalize>,
    elems: Vec<Elem<T>>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    count: usize,
}

impl<T> Trie<T> {
    /// Create an exact-match trie.
    pub fn new() -> Self {
        Self {
            name: None,
            canonize: None,
            elems: Vec::new(),
            free: Vec::new(),
            root: None,
            count: 0,
        }
    }

    /// Create a trie whose keys pass through `canonize` first.
    pub fn with_canonicalize(canonize: Canonicalize) -> Self {
        Self {
            canonize: Some(canonize),
            ..Self::new()
        }
    }

    /// Create a named trie; the name shows up in [`Trie::stats`].
    pub fn named(name: impl Into<String>, canonize: Option<Canonicalize>) -> Self {
        Self {
            name: Some(name.into()),
            canonize,
            ..Self::new()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn canonical(&self, key: &str) -> String {
        let mut ckey = key.to_owned();
        if let Some(canonize) = self.canonize {
            canonize(&mut ckey);
        }
        ckey
    }

    /// Insert `data` under `key`.
    ///
    /// Returns `false` (dropping `data`) when the canonical key is already
    /// present or contains a NUL byte.
    pub fn add(&mut self, key: &str, data: T) -> bool {
        if key.contains('\0') {
            return false;
        }
        let ckey = self.canonical(key);
        let bytes = ckey.as_bytes();

        let mut prev: Option<NodeId> = None;
        let mut val: u8 = 0;
        let mut delem = self.root;
        while let Some(id) = delem {
            match &self.elems[id] {
                Elem::Branch(b) => {
                    prev = Some(id);
                    val = nibble(bytes, b.nibnum);
                    delem = b.down[val as usize];
                }
                _ => break,
            }
        }

        if let Some(id) = delem {
            if matches!(&self.elems[id], Elem::Leaf(l) if l.key == ckey) {
                return false;
            }
        }

        let other = match delem {
            Some(id) => Some(id),
            None => prev.and_then(|p| self.first_leaf(p)),
        };
        let Some(other) = other else {
            let id = self.alloc(Elem::Leaf(Leaf {
                key: ckey,
                data,
                parent: None,
                parent_val: 0,
            }));
            self.root = Some(id);
            self.count += 1;
            return true;
        };

        // First nibble where the new key and the neighbouring leaf differ.
        let (i, other_nib) = {
            let Elem::Leaf(leaf) = &self.elems[other] else {
                return false;
            };
            let okey = leaf.key.as_bytes();
            let limit = 2 * bytes.len().max(okey.len()) + 1;
            let Some(i) = (0..limit).find(|&n| nibble(bytes, n) != nibble(okey, n)) else {
                return false;
            };
            (i, nibble(okey, i))
        };

        while let Some(p) = prev {
            match &self.elems[p] {
                Elem::Branch(b) if b.nibnum > i => {
                    val = b.parent_val;
                    prev = b.parent;
                }
                _ => break,
            }
        }

        let reuse = prev.filter(|&p| matches!(&self.elems[p], Elem::Branch(b) if b.nibnum == i));
        let node = match reuse {
            Some(p) => p,
            None => {
                let displaced = match prev {
                    None => self.root,
                    Some(p) => self.child(p, val),
                };
                let mut down = [None; FANOUT];
                down[other_nib as usize] = displaced;
                let id = self.alloc(Elem::Branch(Branch {
                    nibnum: i,
                    down,
                    parent: prev,
                    parent_val: if prev.is_some() { val } else { 0 },
                }));
                if let Some(d) = displaced {
                    self.set_parent(d, Some(id), other_nib);
                }
                match prev {
                    None => self.root = Some(id),
                    Some(p) => self.set_child(p, val, Some(id)),
                }
                id
            }
        };

        let v = nibble(bytes, i);
        let leaf = self.alloc(Elem::Leaf(Leaf {
            key: ckey,
            data,
            parent: Some(node),
            parent_val: v,
        }));
        self.set_child(node, v, Some(leaf));
        self.count += 1;
        true
    }

    /// Look up the data stored under `key`.
    pub fn find(&self, key: &str) -> Option<&T> {
        let id = self.find_leaf(key)?;
        match &self.elems[id] {
            Elem::Leaf(l) => Some(&l.data),
            _ => None,
        }
    }

    pub fn find_mut(&mut self, key: &str) -> Option<&mut T> {
        let id = self.find_leaf(key)?;
        match &mut self.elems[id] {
            Elem::Leaf(l) => Some(&mut l.data),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find_leaf(key).is_some()
    }

    /// Remove `key`, handing its data back to the caller.
    pub fn delete(&mut self, key: &str) -> Option<T> {
        let id = self.find_leaf(key)?;
        self.remove_leaf(id).map(|(_, data)| data)
    }

    /// Visit every entry in ascending canonical-key order.
    pub fn foreach(&self, mut visit: impl FnMut(&str, &T)) {
        for (key, data) in self.iter() {
            visit(key, data);
        }
    }

    /// Visit entries in order until `visit` returns a value.
    pub fn search<R>(&self, mut visit: impl FnMut(&str, &T) -> Option<R>) -> Option<R> {
        self.iter().find_map(|(key, data)| visit(key, data))
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter::new(self)
    }

    /// Start a cursor that tolerates removal of its current element.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self)
    }

    /// Depth statistics, mirroring what operators see in `/stats`.
    pub fn stats(&self) -> TrieStats {
        let mut stats = TrieStats {
            name: self.name.clone(),
            count: self.count,
            depth_sum: 0,
            max_depth: 0,
        };
        let Some(root) = self.root else {
            return stats;
        };
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            stats.max_depth = stats.max_depth.max(depth);
            match &self.elems[id] {
                Elem::Leaf(_) => stats.depth_sum += depth,
                Elem::Branch(b) => stack.extend(b.down.iter().flatten().map(|&c| (c, depth + 1))),
                Elem::Vacant => {}
            }
        }
        stats
    }

    fn find_leaf(&self, key: &str) -> Option<NodeId> {
        if key.contains('\0') {
            return None;
        }
        let ckey = self.canonical(key);
        let bytes = ckey.as_bytes();
        let mut cur = self.root?;
        while let Elem::Branch(b) = &self.elems[cur] {
            cur = b.down[nibble(bytes, b.nibnum) as usize]?;
        }
        match &self.elems[cur] {
            Elem::Leaf(l) if l.key == ckey => Some(cur),
            _ => None,
        }
    }

    /// Smallest leaf below `id`.
    fn first_leaf(&self, mut id: NodeId) -> Option<NodeId> {
        loop {
            match &self.elems[id] {
                Elem::Leaf(_) => return Some(id),
                Elem::Branch(b) => id = b.down.iter().flatten().next().copied()?,
                Elem::Vacant => return None,
            }
        }
    }

    /// Leaf following `leaf` in key order.
    pub(crate) fn next_leaf(&self, leaf: NodeId) -> Option<NodeId> {
        let (mut node, val) = self.parent_link(leaf);
        let mut from = val as usize + 1;
        while let Some(n) = node {
            let Elem::Branch(b) = &self.elems[n] else {
                return None;
            };
            match (from..FANOUT).find_map(|v| b.down[v]) {
                Some(next) => return self.first_leaf(next),
                None => {
                    node = b.parent;
                    from = b.parent_val as usize + 1;
                }
            }
        }
        None
    }

    pub(crate) fn first(&self) -> Option<NodeId> {
        self.root.and_then(|r| self.first_leaf(r))
    }

    pub(crate) fn entry(&self, id: NodeId) -> Option<(&str, &T)> {
        match self.elems.get(id) {
            Some(Elem::Leaf(l)) => Some((l.key.as_str(), &l.data)),
            _ => None,
        }
    }

    /// Unlink a leaf, collapsing its parent if only one child remains.
    pub(crate) fn remove_leaf(&mut self, id: NodeId) -> Option<(String, T)> {
        if !matches!(self.elems.get(id), Some(Elem::Leaf(_))) {
            return None;
        }
        let Elem::Leaf(leaf) = self.release(id) else {
            return None;
        };

        match leaf.parent {
            None => self.root = None,
            Some(p) => {
                self.set_child(p, leaf.parent_val, None);
                let sole = match &self.elems[p] {
                    Elem::Branch(b) => {
                        let mut used = b.down.iter().enumerate().filter_map(|(v, c)| c.map(|c| (v, c)));
                        match (used.next(), used.next()) {
                            (Some((_, only)), None) => Some((only, b.parent, b.parent_val)),
                            _ => None,
                        }
                    }
                    _ => None,
                };
                if let Some((next, grandparent, gval)) = sole {
                    match grandparent {
                        Some(g) => self.set_child(g, gval, Some(next)),
                        None => self.root = Some(next),
                    }
                    self.set_parent(next, grandparent, gval);
                    self.release(p);
                }
            }
        }

        self.count -= 1;
        if self.count == 0 {
            self.root = None;
        }
        Some((leaf.key, leaf.data))
    }

    fn alloc(&mut self, elem: Elem<T>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.elems[id] = elem;
                id
            }
            None => {
                self.elems.push(elem);
                self.elems.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Elem<T> {
        self.free.push(id);
        std::mem::replace(&mut self.elems[id], Elem::Vacant)
    }

    fn child(&self, id: NodeId, val: u8) -> Option<NodeId> {
        match &self.elems[id] {
            Elem::Branch(b) => b.down[val as usize],
            _ => None,
        }
    }

    fn set_child(&mut self, id: NodeId, val: u8, child: Option<NodeId>) {
        if let Elem::Branch(b) = &mut self.elems[id] {
            b.down[val as usize] = child;
        }
    }

    fn parent_link(&self, id: NodeId) -> (Option<NodeId>, u8) {
        match &self.elems[id] {
            Elem::Branch(b) => (b.parent, b.parent_val),
            Elem::Leaf(l) => (l.parent, l.parent_val),
            Elem::Vacant => (None, 0),
        }
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>, val: u8) {
        match &mut self.elems[id] {
            Elem::Branch(b) => {
                b.parent = parent;
                b.parent_val = val;
            }
            Elem::Leaf(l) => {
                l.parent = parent;
                l.parent_val = val;
            }
            Elem::Vacant => {}
        }
    }

    /// Panics if the structural invariants do not hold.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let Some(root) = self.root else {
            assert_eq!(self.count, 0);
            return;
        };
        assert_eq!(self.parent_link(root).0, None);
        let mut leaves = 0;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match &self.elems[id] {
                Elem::Leaf(_) => leaves += 1,
                Elem::Branch(b) => {
                    let children: Vec<_> = b.down.iter().enumerate().filter_map(|(v, c)| c.map(|c| (v, c))).collect();
                    assert!(children.len() >= 2, "branch {id} has {} children", children.len());
                    for (v, c) in children {
                        assert_eq!(self.parent_link(c), (Some(id), v as u8));
                        if let Elem::Branch(cb) = &self.elems[c] {
                            assert!(cb.nibnum > b.nibnum);
                        }
                        stack.push(c);
                    }
                }
                Elem::Vacant => panic!("vacant node {id} reachable"),
            }
        }
        assert_eq!(leaves, self.count);
    }
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Trie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Depth statistics for a [`Trie`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieStats {
    pub name: Option<String>,
    pub count: usize,
    pub depth_sum: usize,
    pub max_depth: usize,
}

impl TrieStats {
    pub fn avg_depth(&self) -> usize {
        self.depth_sum.checked_div(self.count).unwrap_or(0)
    }
}

impl fmt::Display for TrieStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => writeln!(f, "Dictionary stats for {} ({})", name, self.count)?,
            None => writeln!(f, "Dictionary stats for <anonymous> ({})", self.count)?,
        }
        write!(
            f,
            "Depth sum {} Avg depth {} Max depth {}",
            self.depth_sum,
            self.avg_depth(),
            self.max_depth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys<T>(trie: &Trie<T>) -> Vec<String> {
        trie.iter().map(|(k, _)| k.to_string()).collect()
    }

    #[test]
    fn test_nibble_order() {
        assert_eq!(nibble(b"A", 0), 0x4);
        assert_eq!(nibble(b"A", 1), 0x1);
        assert_eq!(nibble(b"A", 2), 0);
    }

    #[test]
    fn test_add_find_delete() {
        let mut trie = Trie::new();
        assert!(trie.add("crypt", 1));
        assert!(trie.add("md5", 2));
        assert!(trie.add("sha1", 3));
        assert!(!trie.add("md5", 4));
        assert_eq!(trie.len(), 3);
        assert_eq!(trie.find("md5"), Some(&2));
        assert_eq!(trie.find("MD5"), None);
        trie.assert_invariants();

        assert_eq!(trie.delete("md5"), Some(2));
        assert_eq!(trie.delete("md5"), None);
        assert_eq!(trie.len(), 2);
        trie.assert_invariants();
    }

    #[test]
    fn test_case_insensitive() {
        let mut trie = Trie::with_canonicalize(ascii_uppercase);
        assert!(trie.add("Crypt", "c"));
        assert!(!trie.add("CRYPT", "dup"));
        assert_eq!(trie.find("crypt"), Some(&"c"));
        assert_eq!(keys(&trie), vec!["CRYPT"]);
    }

    #[test]
    fn test_prefix_keys_are_ordered() {
        let mut trie = Trie::new();
        for key in ["ab", "a", "abc", "", "b", "aa"] {
            assert!(trie.add(key, key.len()));
        }
        assert_eq!(keys(&trie), vec!["", "a", "aa", "ab", "abc", "b"]);
        trie.assert_invariants();
    }

    #[test]
    fn test_nul_keys_rejected() {
        let mut trie = Trie::new();
        assert!(!trie.add("a\0b", 1));
        assert!(trie.add("a", 1));
        assert_eq!(trie.find("a\0"), None);
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_delete_collapses_branches() {
        let mut trie = Trie::new();
        let words = ["hook", "hooktype", "callback", "efunction", "cmdoverride", "versionflag"];
        for w in words {
            trie.add(w, ());
        }
        for w in words {
            assert!(trie.delete(w).is_some());
            trie.assert_invariants();
        }
        assert!(trie.is_empty());
        assert!(trie.root.is_none());
    }

    #[test]
    fn test_node_slots_are_reused() {
        let mut trie = Trie::new();
        for i in 0..32 {
            trie.add(&format!("key{i}"), i);
        }
        let allocated = trie.elems.len();
        for i in 0..32 {
            trie.delete(&format!("key{i}"));
        }
        for i in 0..32 {
            trie.add(&format!("key{i}"), i);
        }
        assert_eq!(trie.elems.len(), allocated);
        trie.assert_invariants();
    }

    #[test]
    fn test_search_stops_early() {
        let mut trie = Trie::new();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            trie.add(k, i);
        }
        let mut seen = 0;
        let found = trie.search(|k, v| {
            seen += 1;
            (k == "b").then_some(*v)
        });
        assert_eq!(found, Some(1));
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_stats() {
        let mut trie = Trie::named("auth-ops", Some(ascii_uppercase));
        let empty = trie.stats();
        assert_eq!(empty.avg_depth(), 0);
        assert!(empty.to_string().contains("Depth sum 0 Avg depth 0 Max depth 0"));

        trie.add("a", ());
        assert_eq!(trie.stats().max_depth, 0);
        trie.add("b", ());
        trie.add("c", ());
        let stats = trie.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.depth_sum, 3);
        assert_eq!(stats.max_depth, 1);
        assert!(stats.to_string().starts_with("Dictionary stats for auth-ops (3)"));
    }
}
