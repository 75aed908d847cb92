use crate::btree::node::LeafRef;
use crate::id::{PageId, RecordId};
use crate::pager::{PageRead, Pager};

/// Forward scan over the leaf level. Holds the current leaf read
/// latched; when the leaf is exhausted the next one is latched before
/// the old one is released, so the scan follows the same left-to-right
/// order writers use and sees each leaf in a consistent state.
pub struct Cursor<'a> {
    pager: &'a Pager,
    key_size: usize,
    leaf: Option<PageRead<'a>>,
    index: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(pager: &'a Pager, key_size: usize, leaf: PageRead<'a>, index: usize) -> Self {
        Self {
            pager,
            key_size,
            leaf: Some(leaf),
            index,
        }
    }

    pub(crate) fn empty(pager: &'a Pager, key_size: usize) -> Self {
        Self {
            pager,
            key_size,
            leaf: None,
            index: 0,
        }
    }

    /// True once the scan is exhausted (or never had anything to show).
    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// Current (leaf page, slot) position, None at the end. Two
    /// cursors over one tree are at the same spot iff their positions
    /// are equal.
    pub fn position(&self) -> Option<(PageId, usize)> {
        self.leaf.as_ref().map(|leaf| (leaf.page_id(), self.index))
    }

    /// Yields the next entry in ascending key order, hopping the leaf
    /// sibling chain as leaves run out.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> anyhow::Result<Option<(Box<[u8]>, RecordId)>> {
        loop {
            let Some(leaf_guard) = &self.leaf else {
                return Ok(None);
            };
            let leaf = LeafRef::new(leaf_guard.data(), self.key_size);

            if self.index < leaf.size() {
                let key = leaf.key_at(self.index).to_vec().into_boxed_slice();
                let rid = leaf.rid_at(self.index);
                self.index += 1;
                return Ok(Some((key, rid)));
            }

            match leaf.next() {
                Some(next_pgid) => {
                    let next = self.pager.fetch_read(next_pgid)?;
                    self.leaf = Some(next);
                    self.index = 0;
                }
                None => {
                    self.leaf = None;
                    return Ok(None);
                }
            }
        }
    }
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.position() == other.position()
    }
}
