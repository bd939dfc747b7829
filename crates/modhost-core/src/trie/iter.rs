//! Ordered iteration over a [`Trie`].

use super::{NodeId, Trie};

/// Borrowing iterator in ascending canonical-key order.
pub struct Iter<'a, T> {
    trie: &'a Trie<T>,
    next: Option<NodeId>,
    remaining: usize,
}

impl<'a, T> Iter<'a, T> {
    pub(super) fn new(trie: &'a Trie<T>) -> Self {
        Self {
            trie,
            next: trie.first(),
            remaining: trie.len(),
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (&'a str, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.trie.next_leaf(id);
        self.remaining = self.remaining.saturating_sub(1);
        self.trie.entry(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a Trie<T> {
    type Item = (&'a str, &'a T);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Restartable external iterator.
///
/// The cursor holds positions rather than borrows, so the caller may remove
/// the *current* element between steps with [`Cursor::remove_current`]. Any
/// other mutation of the trie while a cursor is live invalidates it.
///
/// ```
/// use modhost_core::trie::Trie;
///
/// let mut trie = Trie::new();
/// for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
///     trie.add(key, i);
/// }
/// let mut cursor = trie.cursor();
/// while cursor.advance(&trie) {
///     if matches!(cursor.current(&trie), Some((_, v)) if v % 2 == 1) {
///         cursor.remove_current(&mut trie);
///     }
/// }
/// assert_eq!(trie.iter().map(|(k, _)| k).collect::<Vec<_>>(), ["a", "c"]);
/// ```
#[derive(Debug, Clone)]
pub struct Cursor {
    cur: Option<NodeId>,
    next: Option<NodeId>,
}

impl Cursor {
    pub(super) fn new<T>(trie: &Trie<T>) -> Self {
        Self {
            cur: None,
            next: trie.first(),
        }
    }

    /// Rewind to before the first element.
    pub fn restart<T>(&mut self, trie: &Trie<T>) {
        *self = Self::new(trie);
    }

    /// Step to the next element; `false` once the trie is exhausted.
    pub fn advance<T>(&mut self, trie: &Trie<T>) -> bool {
        self.cur = self.next;
        self.next = self.cur.and_then(|cur| {
            let next = trie.next_leaf(cur)?;
            // A successor that sorts before the current key means the trie
            // was mutated under us; stop rather than revisit entries.
            match (trie.entry(cur), trie.entry(next)) {
                (Some((ck, _)), Some((nk, _))) if nk < ck => None,
                _ => Some(next),
            }
        });
        self.cur.is_some()
    }

    pub fn current<'a, T>(&self, trie: &'a Trie<T>) -> Option<(&'a str, &'a T)> {
        trie.entry(self.cur?)
    }

    /// Remove the current element, returning its canonical key and data.
    pub fn remove_current<T>(&mut self, trie: &mut Trie<T>) -> Option<(String, T)> {
        let id = self.cur.take()?;
        trie.remove_leaf(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_is_sorted_and_exact() {
        let mut trie = Trie::new();
        let words = ["mkpasswd", "module", "away", "kill", "oper", "ping", "ison"];
        for (i, w) in words.iter().enumerate() {
            trie.add(w, i);
        }
        let mut expected: Vec<_> = words.to_vec();
        expected.sort();
        let got: Vec<_> = trie.iter().map(|(k, _)| k).collect();
        assert_eq!(got, expected);
        assert_eq!(trie.iter().size_hint(), (7, Some(7)));
    }

    #[test]
    fn test_cursor_removes_every_element() {
        let mut trie = Trie::new();
        for i in 0..50 {
            trie.add(&format!("{i:03}"), i);
        }
        let mut cursor = trie.cursor();
        let mut visited = Vec::new();
        while cursor.advance(&trie) {
            if let Some((_, v)) = cursor.current(&trie) {
                visited.push(*v);
            }
            assert!(cursor.remove_current(&mut trie).is_some());
            trie.assert_invariants();
        }
        assert_eq!(visited, (0..50).collect::<Vec<_>>());
        assert!(trie.is_empty());
    }

    #[test]
    fn test_cursor_restart() {
        let mut trie = Trie::new();
        trie.add("x", 1);
        trie.add("y", 2);
        let mut cursor = trie.cursor();
        assert!(cursor.advance(&trie));
        assert!(cursor.advance(&trie));
        assert!(!cursor.advance(&trie));
        assert!(cursor.current(&trie).is_none());

        cursor.restart(&trie);
        assert!(cursor.advance(&trie));
        assert_eq!(cursor.current(&trie), Some(("x", &1)));
    }
}
