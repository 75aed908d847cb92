//! Concurrent B+ tree index over the pager.
//!
//! Keys are fixed-width byte strings ordered by a caller-supplied
//! comparator; values are record ids. Readers descend with read-latch
//! crabbing, writers with write-latch crabbing: the latches of a node's
//! ancestors (and of the tree's header page) are released as soon as
//! the node is known safe, i.e. the pending insert or delete cannot
//! propagate a split or merge past it.

mod cursor;
mod node;

pub use cursor::Cursor;

use crate::id::{PageId, RecordId};
use crate::pager::{PageWrite, Pager};
use crate::PAGE_SIZE;
use anyhow::anyhow;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

/// Total order over fixed-width keys. Must be transitive and
/// antisymmetric, and Equal must coincide with byte equality of the
/// stored keys.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte order. The natural comparator for big-endian
/// encoded integers.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Write-path traversal state: the latched ancestors of the current
/// node, oldest first, plus the header page guard while a root change
/// is still possible. Dropping the context releases everything.
struct Context<'a> {
    header: Option<PageWrite<'a>>,
    root_pgid: Option<PageId>,
    write_set: VecDeque<PageWrite<'a>>,
}

impl<'a> Context<'a> {
    fn new() -> Self {
        Self {
            header: None,
            root_pgid: None,
            write_set: VecDeque::new(),
        }
    }

    fn is_root(&self, pgid: PageId) -> bool {
        Some(pgid) == self.root_pgid
    }

    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.header = None;
    }
}

enum Rebalance {
    Redistributed,
    Merged,
}

pub struct BPlusTree<C: KeyComparator = BytewiseComparator> {
    pager: Arc<Pager>,
    comparator: C,
    key_size: usize,
    leaf_max_size: usize,
    internal_max_size: usize,
    header_pgid: PageId,
}

impl<C: KeyComparator> BPlusTree<C> {
    /// Allocates a header page and returns an empty tree.
    pub fn create(
        pager: Arc<Pager>,
        comparator: C,
        key_size: usize,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> anyhow::Result<Self> {
        Self::check_sizes(key_size, leaf_max_size, internal_max_size)?;
        let header_pgid = {
            // a fresh page is zeroed, which already encodes "no root"
            let header = pager.alloc()?;
            header.page_id()
        };
        Ok(Self {
            pager,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
            header_pgid,
        })
    }

    /// Reattaches to a tree whose header page already exists.
    pub fn open(
        pager: Arc<Pager>,
        comparator: C,
        header_pgid: PageId,
        key_size: usize,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> anyhow::Result<Self> {
        Self::check_sizes(key_size, leaf_max_size, internal_max_size)?;
        Ok(Self {
            pager,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
            header_pgid,
        })
    }

    fn check_sizes(
        key_size: usize,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> anyhow::Result<()> {
        if key_size < 1 {
            return Err(anyhow!("key size must be at least 1"));
        }
        if leaf_max_size < 3 || internal_max_size < 3 {
            return Err(anyhow!(
                "node capacity must be at least 3, but got leaf={leaf_max_size} internal={internal_max_size}",
            ));
        }
        let leaf_area = node::NODE_HEADER_SIZE + leaf_max_size * (key_size + node::LEAF_VALUE_SIZE);
        if leaf_area > PAGE_SIZE {
            return Err(anyhow!(
                "{leaf_max_size} leaf entries of key size {key_size} do not fit in a page",
            ));
        }
        let internal_area =
            node::NODE_HEADER_SIZE + internal_max_size * (key_size + node::INTERNAL_VALUE_SIZE);
        if internal_area > PAGE_SIZE {
            return Err(anyhow!(
                "{internal_max_size} internal entries of key size {key_size} do not fit in a page",
            ));
        }
        Ok(())
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_pgid
    }

    pub fn root_page_id(&self) -> anyhow::Result<Option<PageId>> {
        let header = self.pager.fetch_read(self.header_pgid)?;
        Ok(node::header_root(header.data()))
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.root_page_id()?.is_none())
    }

    /// Point query. Read-latch crabbing: the child's latch is taken
    /// before the parent's is released.
    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<RecordId>> {
        assert_eq!(self.key_size, key.len(), "key has the wrong width");
        let pager = self.pager.as_ref();

        let header = pager.fetch_read(self.header_pgid)?;
        let Some(root) = node::header_root(header.data()) else {
            return Ok(None);
        };
        let mut guard = pager.fetch_read(root)?;
        drop(header);

        loop {
            if node::node_kind(guard.data()) == node::KIND_LEAF {
                let leaf = node::LeafRef::new(guard.data(), self.key_size);
                let rid = leaf
                    .search(&self.comparator, key)
                    .ok()
                    .map(|index| leaf.rid_at(index));
                return Ok(rid);
            }
            let child = {
                let internal = node::InternalRef::new(guard.data(), self.key_size);
                internal.child_at(internal.search_child(&self.comparator, key))
            };
            let next = pager.fetch_read(child)?;
            guard = next;
        }
    }

    /// Inserts a unique key. Returns false when the key already exists.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> anyhow::Result<bool> {
        assert_eq!(self.key_size, key.len(), "key has the wrong width");
        let pager = self.pager.as_ref();
        let mut ctx = Context::new();

        let mut header = pager.fetch_write(self.header_pgid)?;
        let root = node::header_root(header.data());
        ctx.root_pgid = root;

        let Some(root_pgid) = root else {
            // first insert grows a root leaf under the header latch
            let mut root_page = pager.alloc()?;
            node::LeafMut::init(root_page.data_mut(), self.leaf_max_size);
            let mut leaf = node::LeafMut::new(root_page.data_mut(), self.key_size);
            leaf.insert_at(0, key, rid);
            node::set_header_root(header.data_mut(), Some(root_page.page_id()));
            log::debug!("created root leaf pgid={}", root_page.page_id().get());
            return Ok(true);
        };
        ctx.header = Some(header);

        let mut guard = pager.fetch_write(root_pgid)?;
        loop {
            if self.insert_safe(guard.data()) {
                ctx.release_ancestors();
            }
            if node::node_kind(guard.data()) == node::KIND_LEAF {
                break;
            }
            let child = {
                let internal = node::InternalRef::new(guard.data(), self.key_size);
                internal.child_at(internal.search_child(&self.comparator, key))
            };
            ctx.write_set.push_back(guard);
            guard = pager.fetch_write(child)?;
        }

        let index = {
            let leaf = node::LeafRef::new(guard.data(), self.key_size);
            match leaf.search(&self.comparator, key) {
                Ok(_) => return Ok(false),
                Err(index) => index,
            }
        };

        if node::node_size(guard.data()) < self.leaf_max_size {
            let mut leaf = node::LeafMut::new(guard.data_mut(), self.key_size);
            leaf.insert_at(index, key, rid);
            return Ok(true);
        }

        // the leaf is full: split around the incoming entry and carry
        // the promoted separator upward
        let (mut up_key, mut up_child) = self.split_leaf(pager, &mut guard, index, key, rid)?;
        let mut left_pgid = guard.page_id();
        drop(guard);

        loop {
            let Some(mut parent) = ctx.write_set.pop_back() else {
                // every node on the path split: grow a new root
                let mut header = ctx
                    .header
                    .take()
                    .expect("the header latch must be held for a root split");
                let mut new_root = pager.alloc()?;
                node::InternalMut::init(new_root.data_mut(), self.internal_max_size);
                let mut internal = node::InternalMut::new(new_root.data_mut(), self.key_size);
                let zero_key = vec![0u8; self.key_size];
                internal.set_size(1);
                internal.write_entry(0, &zero_key, left_pgid);
                internal.insert_at(1, &up_key, up_child);
                node::set_header_root(header.data_mut(), Some(new_root.page_id()));
                log::debug!("grew tree, new root pgid={}", new_root.page_id().get());
                return Ok(true);
            };

            if node::node_size(parent.data()) < self.internal_max_size {
                let slot = {
                    let internal = node::InternalRef::new(parent.data(), self.key_size);
                    internal.search_child(&self.comparator, &up_key)
                };
                let mut internal = node::InternalMut::new(parent.data_mut(), self.key_size);
                internal.insert_at(slot + 1, &up_key, up_child);
                return Ok(true);
            }

            let (promoted, new_right) = self.split_internal(pager, &mut parent, &up_key, up_child)?;
            up_key = promoted;
            up_child = new_right;
            left_pgid = parent.page_id();
        }
    }

    /// Removes a key. Returns false when the key is absent.
    pub fn remove(&self, key: &[u8]) -> anyhow::Result<bool> {
        assert_eq!(self.key_size, key.len(), "key has the wrong width");
        let pager = self.pager.as_ref();
        let mut ctx = Context::new();

        let header = pager.fetch_write(self.header_pgid)?;
        let Some(root_pgid) = node::header_root(header.data()) else {
            return Ok(false);
        };
        ctx.root_pgid = Some(root_pgid);
        ctx.header = Some(header);

        let mut guard = pager.fetch_write(root_pgid)?;
        loop {
            if self.delete_safe(guard.data(), ctx.is_root(guard.page_id())) {
                ctx.release_ancestors();
            }
            if node::node_kind(guard.data()) == node::KIND_LEAF {
                break;
            }
            let child = {
                let internal = node::InternalRef::new(guard.data(), self.key_size);
                internal.child_at(internal.search_child(&self.comparator, key))
            };
            ctx.write_set.push_back(guard);
            guard = pager.fetch_write(child)?;
        }

        let index = {
            let leaf = node::LeafRef::new(guard.data(), self.key_size);
            match leaf.search(&self.comparator, key) {
                Ok(index) => index,
                Err(_) => return Ok(false),
            }
        };
        {
            let mut leaf = node::LeafMut::new(guard.data_mut(), self.key_size);
            leaf.remove_at(index);
        }

        if ctx.is_root(guard.page_id()) && node::node_size(guard.data()) == 0 {
            // the last key is gone; the tree is empty again
            let mut header = ctx
                .header
                .take()
                .expect("the header latch must be held to clear the root");
            node::set_header_root(header.data_mut(), None);
            let pgid = guard.page_id();
            drop(guard);
            // may be refused if a late reader still pins the old root;
            // the page is unreachable either way
            self.pager.delete_page(pgid)?;
            return Ok(true);
        }

        let mut cur = guard;
        loop {
            let cur_is_root = ctx.is_root(cur.page_id());
            let size = node::node_size(cur.data());

            if cur_is_root {
                if node::node_kind(cur.data()) == node::KIND_INTERNAL && size == 1 {
                    // an internal root with a single child shrinks the tree
                    let child = {
                        let internal = node::InternalRef::new(cur.data(), self.key_size);
                        internal.child_at(0)
                    };
                    let mut header = ctx
                        .header
                        .take()
                        .expect("the header latch must be held to shrink the tree");
                    node::set_header_root(header.data_mut(), Some(child));
                    let pgid = cur.page_id();
                    drop(cur);
                    self.pager.delete_page(pgid)?;
                    log::debug!("shrank tree, new root pgid={}", child.get());
                }
                break;
            }

            let min = node::min_size_for(node::node_max_size(cur.data()));
            if size >= min {
                break;
            }

            let mut parent = ctx
                .write_set
                .pop_back()
                .expect("a non-root underflow must have a latched parent");
            match self.rebalance(pager, &mut parent, cur)? {
                Rebalance::Redistributed => break,
                Rebalance::Merged => cur = parent,
            }
        }

        Ok(true)
    }

    /// Iterator over the whole tree, positioned at the smallest key.
    pub fn cursor(&self) -> anyhow::Result<Cursor<'_>> {
        let pager = self.pager.as_ref();
        let header = pager.fetch_read(self.header_pgid)?;
        let Some(root) = node::header_root(header.data()) else {
            return Ok(Cursor::empty(pager, self.key_size));
        };
        let mut guard = pager.fetch_read(root)?;
        drop(header);

        loop {
            if node::node_kind(guard.data()) == node::KIND_LEAF {
                return Ok(Cursor::new(pager, self.key_size, guard, 0));
            }
            let child = {
                let internal = node::InternalRef::new(guard.data(), self.key_size);
                internal.child_at(0)
            };
            let next = pager.fetch_read(child)?;
            guard = next;
        }
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn cursor_from(&self, key: &[u8]) -> anyhow::Result<Cursor<'_>> {
        assert_eq!(self.key_size, key.len(), "key has the wrong width");
        let pager = self.pager.as_ref();
        let header = pager.fetch_read(self.header_pgid)?;
        let Some(root) = node::header_root(header.data()) else {
            return Ok(Cursor::empty(pager, self.key_size));
        };
        let mut guard = pager.fetch_read(root)?;
        drop(header);

        loop {
            if node::node_kind(guard.data()) == node::KIND_LEAF {
                let index = {
                    let leaf = node::LeafRef::new(guard.data(), self.key_size);
                    match leaf.search(&self.comparator, key) {
                        Ok(index) => index,
                        Err(index) => index,
                    }
                };
                return Ok(Cursor::new(pager, self.key_size, guard, index));
            }
            let child = {
                let internal = node::InternalRef::new(guard.data(), self.key_size);
                internal.child_at(internal.search_child(&self.comparator, key))
            };
            let next = pager.fetch_read(child)?;
            guard = next;
        }
    }

    /// Renders the tree level by level for debugging and tests. Keys
    /// are shown as hex. Takes read latches node by node, so the
    /// output is only consistent when no writer is active.
    pub fn dump(&self) -> anyhow::Result<String> {
        use std::fmt::Write;

        let mut out = String::new();
        let Some(root) = self.root_page_id()? else {
            out.push_str("(empty)\n");
            return Ok(out);
        };

        let mut level: Vec<PageId> = vec![root];
        while !level.is_empty() {
            let mut next_level = Vec::new();
            for pgid in &level {
                let guard = self.pager.fetch_read(*pgid)?;
                if node::node_kind(guard.data()) == node::KIND_LEAF {
                    let leaf = node::LeafRef::new(guard.data(), self.key_size);
                    write!(out, "leaf:{}[", pgid.get())?;
                    for i in 0..leaf.size() {
                        if i > 0 {
                            out.push(' ');
                        }
                        for b in leaf.key_at(i) {
                            write!(out, "{b:02x}")?;
                        }
                    }
                    out.push_str("] ");
                } else {
                    let internal = node::InternalRef::new(guard.data(), self.key_size);
                    write!(out, "int:{}[", pgid.get())?;
                    for i in 0..internal.size() {
                        if i > 0 {
                            out.push(' ');
                            for b in internal.key_at(i) {
                                write!(out, "{b:02x}")?;
                            }
                            out.push(':');
                        }
                        write!(out, "{}", internal.child_at(i).get())?;
                        next_level.push(internal.child_at(i));
                    }
                    out.push_str("] ");
                }
            }
            out.push('\n');
            level = next_level;
        }
        Ok(out)
    }

    /// An insert into this node cannot split it.
    fn insert_safe(&self, buff: &[u8]) -> bool {
        node::node_size(buff) + 1 <= node::node_max_size(buff)
    }

    /// A delete from this node cannot underflow it. The root is exempt
    /// from the minimum but must keep one leaf entry or two children.
    fn delete_safe(&self, buff: &[u8], is_root: bool) -> bool {
        let size = node::node_size(buff);
        if is_root {
            if node::node_kind(buff) == node::KIND_LEAF {
                size > 1
            } else {
                size > 2
            }
        } else {
            size > node::min_size_for(node::node_max_size(buff))
        }
    }

    /// Splits a full leaf around the entry being inserted at `index`.
    /// Returns the separator to promote and the new right sibling.
    fn split_leaf<'p>(
        &self,
        pager: &'p Pager,
        left_guard: &mut PageWrite<'p>,
        index: usize,
        key: &[u8],
        rid: RecordId,
    ) -> anyhow::Result<(Vec<u8>, PageId)> {
        let mut entries: Vec<(Vec<u8>, RecordId)> = {
            let leaf = node::LeafRef::new(left_guard.data(), self.key_size);
            (0..leaf.size())
                .map(|i| (leaf.key_at(i).to_vec(), leaf.rid_at(i)))
                .collect()
        };
        entries.insert(index, (key.to_vec(), rid));
        let old_next = node::LeafRef::new(left_guard.data(), self.key_size).next();

        let mut right_guard = pager.alloc()?;
        let right_pgid = right_guard.page_id();
        node::LeafMut::init(right_guard.data_mut(), self.leaf_max_size);

        // the lower half stays, the upper half moves right
        let keep = entries.len() / 2;

        let mut left = node::LeafMut::new(left_guard.data_mut(), self.key_size);
        for (i, (k, r)) in entries[..keep].iter().enumerate() {
            left.write_entry(i, k, *r);
        }
        left.set_size(keep);
        left.set_next(Some(right_pgid));

        let mut right = node::LeafMut::new(right_guard.data_mut(), self.key_size);
        for (i, (k, r)) in entries[keep..].iter().enumerate() {
            right.write_entry(i, k, *r);
        }
        right.set_size(entries.len() - keep);
        right.set_next(old_next);

        log::debug!(
            "split leaf pgid={} right={}",
            left_guard.page_id().get(),
            right_pgid.get(),
        );
        Ok((entries[keep].0.clone(), right_pgid))
    }

    /// Splits a full internal node around the carried (key, child).
    /// The median key is promoted and cleared from the right node's
    /// slot 0.
    fn split_internal<'p>(
        &self,
        pager: &'p Pager,
        left_guard: &mut PageWrite<'p>,
        carry_key: &[u8],
        carry_child: PageId,
    ) -> anyhow::Result<(Vec<u8>, PageId)> {
        let zero_key = vec![0u8; self.key_size];
        let mut entries: Vec<(Vec<u8>, PageId)> = {
            let internal = node::InternalRef::new(left_guard.data(), self.key_size);
            (0..internal.size())
                .map(|i| {
                    let k = if i == 0 {
                        zero_key.clone()
                    } else {
                        internal.key_at(i).to_vec()
                    };
                    (k, internal.child_at(i))
                })
                .collect()
        };
        let carry_at = {
            let internal = node::InternalRef::new(left_guard.data(), self.key_size);
            internal.search_child(&self.comparator, carry_key) + 1
        };
        entries.insert(carry_at, (carry_key.to_vec(), carry_child));

        let mut right_guard = pager.alloc()?;
        let right_pgid = right_guard.page_id();
        node::InternalMut::init(right_guard.data_mut(), self.internal_max_size);

        // both halves keep at least min_size children; the first key of
        // the right half moves up instead of staying in slot 0
        let keep = entries.len() / 2;
        let promoted = entries[keep].0.clone();

        let mut left = node::InternalMut::new(left_guard.data_mut(), self.key_size);
        left.set_size(keep);
        for (i, (k, c)) in entries[..keep].iter().enumerate() {
            left.write_entry(i, k, *c);
        }

        let mut right = node::InternalMut::new(right_guard.data_mut(), self.key_size);
        right.set_size(entries.len() - keep);
        for (i, (k, c)) in entries[keep..].iter().enumerate() {
            right.write_entry(i, k, *c);
        }
        right.clear_key_at(0);

        log::debug!(
            "split internal pgid={} right={}",
            left_guard.page_id().get(),
            right_pgid.get(),
        );
        Ok((promoted, right_pgid))
    }

    /// Fixes an underflowed child under its write-latched parent by
    /// borrowing from an adjacent sibling or merging with it. Sibling
    /// latches are taken left before right; when the underflowed child
    /// is the right one it is unlatched and retaken, which is safe
    /// because the parent's latch keeps every other writer out.
    fn rebalance<'p>(
        &self,
        pager: &'p Pager,
        parent: &mut PageWrite<'p>,
        cur: PageWrite<'p>,
    ) -> anyhow::Result<Rebalance> {
        let cur_pgid = cur.page_id();
        let (cur_slot, left_pgid, right_pgid) = {
            let internal = node::InternalRef::new(parent.data(), self.key_size);
            let cur_slot = internal
                .find_child_slot(cur_pgid)
                .expect("an underflowed child must be present in its parent");
            if cur_slot == 0 {
                (cur_slot, cur_pgid, internal.child_at(1))
            } else {
                (cur_slot, internal.child_at(cur_slot - 1), cur_pgid)
            }
        };

        let (mut left_guard, mut right_guard, sep_slot) = if cur_slot == 0 {
            let right = pager.fetch_write(right_pgid)?;
            (cur, right, 1)
        } else {
            drop(cur);
            let left = pager.fetch_write(left_pgid)?;
            let right = pager.fetch_write(right_pgid)?;
            (left, right, cur_slot)
        };

        if node::node_kind(left_guard.data()) == node::KIND_LEAF {
            self.rebalance_leaves(pager, parent, &mut left_guard, right_guard, sep_slot)
        } else {
            self.rebalance_internals(pager, parent, &mut left_guard, right_guard, sep_slot)
        }
    }

    fn rebalance_leaves<'p>(
        &self,
        pager: &'p Pager,
        parent: &mut PageWrite<'p>,
        left_guard: &mut PageWrite<'p>,
        mut right_guard: PageWrite<'p>,
        sep_slot: usize,
    ) -> anyhow::Result<Rebalance> {
        let left_size = node::node_size(left_guard.data());
        let right_size = node::node_size(right_guard.data());
        let min = node::min_size_for(self.leaf_max_size);

        if left_size > min || right_size > min {
            if left_size > min {
                // move the left sibling's largest entry over
                let (k, r) = {
                    let leaf = node::LeafRef::new(left_guard.data(), self.key_size);
                    (leaf.key_at(left_size - 1).to_vec(), leaf.rid_at(left_size - 1))
                };
                node::LeafMut::new(left_guard.data_mut(), self.key_size).remove_at(left_size - 1);
                node::LeafMut::new(right_guard.data_mut(), self.key_size).insert_at(0, &k, r);
            } else {
                // move the right sibling's smallest entry over
                let (k, r) = {
                    let leaf = node::LeafRef::new(right_guard.data(), self.key_size);
                    (leaf.key_at(0).to_vec(), leaf.rid_at(0))
                };
                node::LeafMut::new(right_guard.data_mut(), self.key_size).remove_at(0);
                node::LeafMut::new(left_guard.data_mut(), self.key_size).insert_at(left_size, &k, r);
            }

            // the separator is always the right sibling's new first key
            let sep = {
                let leaf = node::LeafRef::new(right_guard.data(), self.key_size);
                leaf.key_at(0).to_vec()
            };
            node::InternalMut::new(parent.data_mut(), self.key_size).set_key_at(sep_slot, &sep);
            log::debug!(
                "redistributed leaves left={} right={}",
                left_guard.page_id().get(),
                right_guard.page_id().get(),
            );
            return Ok(Rebalance::Redistributed);
        }

        // neither sibling can lend: fold the right leaf into the left
        let entries: Vec<(Vec<u8>, RecordId)> = {
            let leaf = node::LeafRef::new(right_guard.data(), self.key_size);
            (0..right_size)
                .map(|i| (leaf.key_at(i).to_vec(), leaf.rid_at(i)))
                .collect()
        };
        let right_next = node::LeafRef::new(right_guard.data(), self.key_size).next();
        {
            let mut leaf = node::LeafMut::new(left_guard.data_mut(), self.key_size);
            debug_assert!(left_size + right_size <= self.leaf_max_size);
            for (i, (k, r)) in entries.iter().enumerate() {
                leaf.write_entry(left_size + i, k, *r);
            }
            leaf.set_size(left_size + right_size);
            leaf.set_next(right_next);
        }
        node::InternalMut::new(parent.data_mut(), self.key_size).remove_at(sep_slot);

        let right_pgid = right_guard.page_id();
        drop(right_guard);
        pager.delete_page(right_pgid)?;
        log::debug!(
            "merged leaf pgid={} into {}",
            right_pgid.get(),
            left_guard.page_id().get(),
        );
        Ok(Rebalance::Merged)
    }

    fn rebalance_internals<'p>(
        &self,
        pager: &'p Pager,
        parent: &mut PageWrite<'p>,
        left_guard: &mut PageWrite<'p>,
        mut right_guard: PageWrite<'p>,
        sep_slot: usize,
    ) -> anyhow::Result<Rebalance> {
        let left_size = node::node_size(left_guard.data());
        let right_size = node::node_size(right_guard.data());
        let min = node::min_size_for(self.internal_max_size);
        let separator = {
            let internal = node::InternalRef::new(parent.data(), self.key_size);
            internal.key_at(sep_slot).to_vec()
        };

        if left_size > min {
            // rotate right: the left sibling's last child moves over,
            // the separator comes down and the moved key goes up
            let (moved_key, moved_child) = {
                let internal = node::InternalRef::new(left_guard.data(), self.key_size);
                (
                    internal.key_at(left_size - 1).to_vec(),
                    internal.child_at(left_size - 1),
                )
            };
            {
                let mut internal = node::InternalMut::new(left_guard.data_mut(), self.key_size);
                internal.set_size(left_size - 1);
            }
            {
                let mut internal = node::InternalMut::new(right_guard.data_mut(), self.key_size);
                let old_first = internal.as_ref().child_at(0);
                internal.insert_at(1, &separator, old_first);
                internal.set_child_at(0, moved_child);
            }
            node::InternalMut::new(parent.data_mut(), self.key_size)
                .set_key_at(sep_slot, &moved_key);
            log::debug!(
                "redistributed internals left={} right={}",
                left_guard.page_id().get(),
                right_guard.page_id().get(),
            );
            return Ok(Rebalance::Redistributed);
        }

        if right_size > min {
            // rotate left: the separator comes down onto the right
            // sibling's first child, whose successor key goes up
            let (up_key, first_child, second_child) = {
                let internal = node::InternalRef::new(right_guard.data(), self.key_size);
                (
                    internal.key_at(1).to_vec(),
                    internal.child_at(0),
                    internal.child_at(1),
                )
            };
            {
                let mut internal = node::InternalMut::new(left_guard.data_mut(), self.key_size);
                internal.set_size(left_size + 1);
                internal.write_entry(left_size, &separator, first_child);
            }
            {
                let mut internal = node::InternalMut::new(right_guard.data_mut(), self.key_size);
                internal.set_child_at(0, second_child);
                internal.remove_at(1);
            }
            node::InternalMut::new(parent.data_mut(), self.key_size).set_key_at(sep_slot, &up_key);
            log::debug!(
                "redistributed internals left={} right={}",
                left_guard.page_id().get(),
                right_guard.page_id().get(),
            );
            return Ok(Rebalance::Redistributed);
        }

        // merge: the separator comes down between the two halves
        let entries: Vec<(Vec<u8>, PageId)> = {
            let internal = node::InternalRef::new(right_guard.data(), self.key_size);
            (0..right_size)
                .map(|i| {
                    let k = if i == 0 {
                        separator.clone()
                    } else {
                        internal.key_at(i).to_vec()
                    };
                    (k, internal.child_at(i))
                })
                .collect()
        };
        {
            let mut internal = node::InternalMut::new(left_guard.data_mut(), self.key_size);
            debug_assert!(left_size + right_size <= self.internal_max_size);
            internal.set_size(left_size + right_size);
            for (i, (k, c)) in entries.iter().enumerate() {
                internal.write_entry(left_size + i, k, *c);
            }
        }
        node::InternalMut::new(parent.data_mut(), self.key_size).remove_at(sep_slot);

        let right_pgid = right_guard.page_id();
        drop(right_guard);
        pager.delete_page(right_pgid)?;
        log::debug!(
            "merged internal pgid={} into {}",
            right_pgid.get(),
            left_guard.page_id().get(),
        );
        Ok(Rebalance::Merged)
    }
}
