//! Bitmap radix trie over internal entry keys.
//!
//! The trie is an Array Mapped Tree with a twist: runs of single-child
//! nodes are collapsed into their first node, making it a radix tree. Each
//! node carries a `u64` bitmap describing which of the 64 possible child
//! digits exist below it. A key digit is used as a bit offset into the
//! bitmap, and the population count of the bits *below* that offset is the
//! child's index in the `children` vector. Children are therefore always
//! stored in ascending digit order, so a left-to-right depth-first walk
//! yields entries in ascending id order.
//!
//! Because internal keys are zero-padded to a fixed 22 digits, every entry
//! sits in a leaf at conceptual depth 22 and interior nodes never hold
//! entries. That is what makes range scans cheap: at any node, everything
//! in the left siblings is smaller and everything in the right siblings is
//! larger.
//!
//! Compressed nodes store the collapsed digits in `extra`, applied before
//! the bitmap is consulted. `extra` is a [`Bytes`] slice and is never
//! mutated after creation; splitting a compressed node slices the shared
//! backing storage into a prefix (kept by the split node) and a suffix
//! (moved to the tail node) without copying. The trie is append-only:
//! nodes are created and split but never removed, which is the discipline
//! that makes the shared slices safe.

use crate::keys::{EntryId, InternalId, INTERNAL_LEN};
use bytes::Bytes;

/// A stream entry: an id and its field-value payload.
///
/// Field order is preserved as given at append time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

impl Entry {
    pub fn new(id: EntryId, fields: Vec<(String, String)>) -> Self {
        Self { id, fields }
    }

    /// The sentinel entry carried by an empty stream.
    pub fn sentinel() -> Self {
        Self::new(EntryId::MIN, Vec::new())
    }
}

/// A radix trie node. Only leaves (depth 22) carry an entry.
#[derive(Debug, Default)]
pub(crate) struct RadixNode {
    /// Bit `i` is set iff a child exists for digit `i`.
    bitmap: u64,
    /// Collapsed single-child digits, walked before the bitmap applies.
    extra: Bytes,
    /// Children in ascending digit order; length equals `bitmap.count_ones()`.
    children: Vec<RadixNode>,
    /// Present iff this node is a leaf.
    entry: Option<Entry>,
}

/// Returns the index a child for `digit` has (or would have) in the
/// children vector: the number of set bitmap bits below `digit`.
///
/// The `digit == 0` case is handled separately to avoid the undefined
/// 64-bit shift by 64.
fn child_index(bitmap: u64, digit: u8) -> usize {
    if digit == 0 {
        return 0;
    }
    (bitmap & (u64::MAX >> (64 - u32::from(digit)))).count_ones() as usize
}

impl RadixNode {
    /// Returns the entry stored for `key`, if present.
    pub(crate) fn search(&self, key: &InternalId) -> Option<&Entry> {
        let mut node = self;
        let mut depth = 0;
        loop {
            // A compressed node is walked through its extra digits first.
            // Indexing key[depth + i] cannot go out of bounds: keys are 22
            // digits and a node's extra can never be longer than what
            // remains below its depth.
            for (i, &digit) in node.extra.iter().enumerate() {
                if digit != key[depth + i] {
                    return None;
                }
            }
            depth += node.extra.len();

            if depth == INTERNAL_LEN {
                // Constant depth: running out of digits means we are at a
                // leaf, and leaves always hold an entry.
                return node.entry.as_ref();
            }

            let digit = key[depth];
            if node.bitmap & (1 << digit) == 0 {
                return None;
            }
            node = &node.children[child_index(node.bitmap, digit)];
            depth += 1;
        }
    }

    /// Returns the leaf node for `key`, creating any nodes necessary.
    pub(crate) fn create(&mut self, key: &InternalId) -> &mut RadixNode {
        let mut node = self;
        let mut depth = 0;
        loop {
            let mut mismatch = None;
            for (i, &digit) in node.extra.iter().enumerate() {
                if digit != key[depth + i] {
                    mismatch = Some(i);
                    break;
                }
            }
            if let Some(offset) = mismatch {
                // The walk failed inside a compressed node: split it.
                let fail_depth = depth + offset;
                return node.split(offset, key, fail_depth);
            }
            depth += node.extra.len();

            if depth == INTERNAL_LEN {
                return node; // node already exists
            }

            let digit = key[depth];
            if node.bitmap & (1 << digit) == 0 {
                // The walk failed at a missing child edge: attach a fresh
                // node carrying the rest of the key as its compressed tail.
                return node.attach(digit, &key[depth + 1..]);
            }
            let idx = child_index(node.bitmap, digit);
            node = &mut node.children[idx];
            depth += 1;
        }
    }

    /// Adds an empty child for `digit` and compresses `rest` into it.
    fn attach(&mut self, digit: u8, rest: &[u8]) -> &mut RadixNode {
        self.bitmap |= 1 << digit;
        let idx = child_index(self.bitmap, digit);
        self.insert_child(idx);
        let child = &mut self.children[idx];
        if !rest.is_empty() {
            child.extra = Bytes::copy_from_slice(rest);
        }
        child
    }

    /// Splits this compressed node at `offset` within its extra digits.
    ///
    /// The node keeps the digits before the split; a tail node takes the
    /// digits after it along with the bitmap, children, and entry. Both
    /// halves alias the original backing storage, which is sound because
    /// extra digits are never mutated in place. The node is left with two
    /// children: the tail and a fresh node for the diverging key, ordered
    /// by digit.
    fn split(&mut self, offset: usize, key: &InternalId, fail_depth: usize) -> &mut RadixNode {
        let tail = RadixNode {
            bitmap: self.bitmap,
            extra: self.extra.slice(offset + 1..),
            children: std::mem::take(&mut self.children),
            entry: self.entry.take(),
        };

        let tail_digit = self.extra[offset];
        let new_digit = key[fail_depth];
        self.extra = self.extra.slice(..offset);
        self.bitmap = (1 << tail_digit) | (1 << new_digit);

        let new_idx = if new_digit > tail_digit {
            self.children = vec![tail, RadixNode::default()];
            1
        } else {
            self.children = vec![RadixNode::default(), tail];
            0
        };

        let rest = &key[fail_depth + 1..];
        let child = &mut self.children[new_idx];
        if !rest.is_empty() {
            child.extra = Bytes::copy_from_slice(rest);
        }
        child
    }

    /// Makes room for a new child at `idx`.
    ///
    /// Grows capacity by 2 at a time instead of the standard doubling; the
    /// trie has many small nodes and the factor trades a few extra
    /// allocations for a lower memory floor. The exact factor is a tuning
    /// knob, not a correctness requirement.
    fn insert_child(&mut self, idx: usize) {
        if self.children.len() == self.children.capacity() {
            let mut grown = Vec::with_capacity(self.children.capacity() + 2);
            grown.append(&mut self.children);
            self.children = grown;
        }
        self.children.insert(idx, RadixNode::default());
    }

    /// Returns all entries under this node with keys in `[from, to]`,
    /// ordered ascending. `from <= to` is the caller's responsibility.
    pub(crate) fn range_entries(&self, from: &InternalId, to: &InternalId) -> Vec<Entry> {
        let mut node = self;
        let mut depth = 0;
        loop {
            for (i, &digit) in node.extra.iter().enumerate() {
                let lo = from[depth + i];
                let hi = to[depth + i];

                if lo == hi && hi == digit {
                    continue; // all three agree, keep walking
                }
                if lo == hi {
                    // The whole result set would live under a digit this
                    // subtree does not contain.
                    return Vec::new();
                }
                if lo < digit && digit < hi {
                    // The compressed digit lies strictly inside the bounds,
                    // so the entire subtree is in range.
                    return node.all_entries();
                }
                if digit < lo || hi < digit {
                    return Vec::new();
                }
                if digit == lo {
                    // Everything below is already smaller than `to`; what
                    // remains is the lower bound.
                    return node.higher_entries(&from[depth..]);
                }
                // digit == hi: mirrored case.
                return node.lower_entries(&to[depth..]);
            }
            depth += node.extra.len();

            if depth == INTERNAL_LEN {
                // Only reachable when from == to and the walk matched all
                // the way down to a leaf.
                return node.entry.iter().cloned().collect();
            }

            if from[depth] == to[depth] {
                let digit = to[depth];
                if node.bitmap & (1 << digit) == 0 {
                    return Vec::new();
                }
                node = &node.children[child_index(node.bitmap, digit)];
                depth += 1;
                continue;
            }

            // The bounds deviate at this node: the lower bound's subtree
            // contributes its tail, every digit strictly in between
            // contributes whole subtrees, and the upper bound's subtree
            // contributes its head.
            let lo = from[depth];
            let hi = to[depth];
            let mut result = Vec::new();

            if node.bitmap & (1 << lo) != 0 {
                let child = &node.children[child_index(node.bitmap, lo)];
                result.extend(child.higher_entries(&from[depth + 1..]));
            }
            for digit in lo + 1..hi {
                if node.bitmap & (1 << digit) != 0 {
                    let child = &node.children[child_index(node.bitmap, digit)];
                    child.collect_leaves(&mut result);
                }
            }
            if node.bitmap & (1 << hi) != 0 {
                let child = &node.children[child_index(node.bitmap, hi)];
                result.extend(child.lower_entries(&to[depth + 1..]));
            }
            return result;
        }
    }

    /// Returns all entries under this node with keys >= `key`, ordered
    /// ascending. `key` is the remaining digits from this node's depth on.
    pub(crate) fn higher_entries(&self, key: &[u8]) -> Vec<Entry> {
        let found = self.higher_siblings(key);
        // At least one leaf per collected node.
        let mut entries = Vec::with_capacity(found.len());
        // higher_siblings collects from highest to lowest.
        for node in found.iter().rev() {
            node.collect_leaves(&mut entries);
        }
        entries
    }

    /// Returns all entries under this node with keys <= `key`, ordered
    /// ascending. `key` is the remaining digits from this node's depth on.
    pub(crate) fn lower_entries(&self, key: &[u8]) -> Vec<Entry> {
        let found = self.lower_siblings(key);
        let mut entries = Vec::with_capacity(found.len());
        for node in &found {
            node.collect_leaves(&mut entries);
        }
        entries
    }

    /// Returns every entry under this node, ordered ascending.
    fn all_entries(&self) -> Vec<Entry> {
        let mut entries = Vec::with_capacity(1);
        self.collect_leaves(&mut entries);
        entries
    }

    /// Walks the path for `key`, collecting the roots of every subtree
    /// whose keys are all >= `key`. An exact match at full depth is
    /// included. Collected from highest to lowest.
    ///
    /// This is not every higher node in the trie: it is one sibling
    /// harvest per level along the search path, which together cover
    /// exactly the keys >= `key`.
    fn higher_siblings<'a>(&'a self, key: &[u8]) -> Vec<&'a RadixNode> {
        let mut found = Vec::new();
        let mut node = self;
        let mut depth = 0;
        loop {
            for (i, &digit) in node.extra.iter().enumerate() {
                if digit < key[depth + i] {
                    // Nothing under this node can be higher.
                    return found;
                } else if digit > key[depth + i] {
                    // Everything under this node is higher.
                    found.push(node);
                    return found;
                }
            }
            depth += node.extra.len();

            if depth == key.len() {
                found.push(node); // inclusive on exact match
                return found;
            }

            let digit = key[depth];
            let idx = child_index(node.bitmap, digit);
            if node.bitmap & (1 << digit) == 0 {
                // No child on the path: everything from where it would sit
                // upward is higher.
                for child in node.children[idx..].iter().rev() {
                    found.push(child);
                }
                return found;
            }

            for child in node.children[idx + 1..].iter().rev() {
                found.push(child);
            }
            node = &node.children[idx];
            depth += 1;
        }
    }

    /// Mirror of [`higher_siblings`]: subtree roots covering exactly the
    /// keys <= `key`, collected from lowest to highest, inclusive on an
    /// exact match.
    ///
    /// [`higher_siblings`]: RadixNode::higher_siblings
    fn lower_siblings<'a>(&'a self, key: &[u8]) -> Vec<&'a RadixNode> {
        let mut found = Vec::new();
        let mut node = self;
        let mut depth = 0;
        loop {
            for (i, &digit) in node.extra.iter().enumerate() {
                if digit > key[depth + i] {
                    return found;
                } else if digit < key[depth + i] {
                    found.push(node);
                    return found;
                }
            }
            depth += node.extra.len();

            if depth == key.len() {
                found.push(node);
                return found;
            }

            let digit = key[depth];
            let idx = child_index(node.bitmap, digit);
            if node.bitmap & (1 << digit) == 0 {
                found.extend(node.children[..idx].iter());
                return found;
            }

            found.extend(node.children[..idx].iter());
            node = &node.children[idx];
            depth += 1;
        }
    }

    /// Appends every leaf entry under this node to `out` in ascending key
    /// order, using an explicit stack instead of recursion.
    fn collect_leaves(&self, out: &mut Vec<Entry>) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Some(entry) = &node.entry {
                out.push(entry.clone());
            } else {
                // Reverse so the lowest child is popped first.
                stack.extend(node.children.iter().rev());
            }
        }
    }

    /// Stores `entry` in this node. Only meaningful on a leaf returned by
    /// [`create`].
    ///
    /// [`create`]: RadixNode::create
    pub(crate) fn set_entry(&mut self, entry: Entry) {
        self.entry = Some(entry);
    }
}
