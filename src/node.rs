use std::sync::Arc;

use crate::{
    buffer::{ByteReader, DataBuffer},
    chunk::Chunk,
    datatype::{DataType, KeyType},
    error::{corrupt_page, Error},
    page::{
        check_value, expand_body, maybe_compress_body, read_envelope, PageHead, PageTypeFlags,
        PAGE_MEMORY_CHILD,
    },
    pageref::{PageRef, PageReference, SharedPage},
    pos::PagePos,
    storage::BTreeStorage,
};

/// Child kind byte in the serialized child table.
const CHILD_KIND_LEAF: u8 = 0;
const CHILD_KIND_NODE: u8 = 1;

/// Outcome of a completed child level split, consumed by
/// [NodePage::copy_and_insert_child] one level up.
pub(crate) struct ChildSplit<K: KeyType, V: DataType> {
    pub key: K::Item,
    pub left: PageRef<K, V>,
    pub right: PageRef<K, V>,
}

/// Inner B-tree page: sorted separator keys and `keys + 1` child references.
///
/// For every `i`, all keys under `children[i]` sort strictly below `keys[i]`
/// and all keys under `children[i + 1]` sort at or above it; separators are
/// promoted out of the children entirely on splits.
///
/// Once persisted (or once published to other readers) a node page is
/// immutable; structural edits go through the copy-on-write constructors
/// which mark the replaced page as removed.
#[derive(Debug)]
pub(crate) struct NodePage<K: KeyType, V: DataType> {
    pub(crate) head: PageHead<K, V>,
    children: Vec<PageRef<K, V>>,
}

impl<K: KeyType, V: DataType> NodePage<K, V> {
    pub fn create(
        storage: &BTreeStorage<K, V>,
        keys: Vec<K::Item>,
        children: Vec<PageRef<K, V>>,
        memory: usize,
    ) -> NodePage<K, V> {
        assert_eq!(
            children.len(),
            keys.len() + 1,
            "a node page needs exactly one more child than keys"
        );
        let mut page = NodePage {
            head: PageHead::new(keys),
            children,
        };
        if memory == 0 {
            page.recalculate_memory(storage);
        } else {
            page.head.memory = memory;
        }
        page
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        self.head.keys.len()
    }

    #[inline]
    pub fn children(&self) -> &[PageRef<K, V>] {
        &self.children
    }

    #[inline]
    pub fn child_ref(&self, index: usize) -> &PageRef<K, V> {
        &self.children[index]
    }

    /// Index of the child to descend into for `key`: the count of separators
    /// at or below it, so an exact separator match goes right.
    pub fn child_index(&self, key: &K::Item) -> usize {
        self.head.keys.partition_point(|k| k <= key)
    }

    /// Resolves child `index` to a page, rebuilding it from the cached
    /// serialized buffer or from disk when the resident object was evicted.
    pub fn get_child_page(
        &self,
        storage: &BTreeStorage<K, V>,
        index: usize,
    ) -> Result<SharedPage<K, V>, Error> {
        let r = &self.children[index];
        if let Some(p) = r.get() {
            p.update_time();
            return Ok(p);
        }
        let page = if let Some(info) = r.pinfo() {
            let page = storage.read_page_from_buffer(r, &info)?;
            storage.gc_if_needed(page.memory());
            page
        } else {
            // installs the PageInfo produced by the read on the reference
            storage.read_page(r)?
        };
        r.replace_page(&page);
        Ok(page)
    }

    /// Splits this page in place, keeping `keys[..at]` and `children[..=at]`.
    /// The key at `at` becomes the separator: it is returned together with
    /// the new right sibling and ends up in neither child.
    ///
    /// Only legal on an unpublished working copy.
    pub fn split(&mut self, storage: &BTreeStorage<K, V>, at: usize) -> (K::Item, NodePage<K, V>) {
        assert!(at < self.head.keys.len(), "split index {at} out of range");
        let b_keys = self.head.keys.split_off(at + 1);
        let separator = self.head.keys.pop().unwrap();
        let b_children = self.children.split_off(at + 1);
        self.recalculate_memory(storage);
        let right = NodePage::create(storage, b_keys, b_children, 0);
        (separator, right)
    }

    /// Copy-on-write absorption of a child split: produces a new page with
    /// the separator inserted and the split child's slot replaced by the two
    /// halves. The current page is marked removed and left untouched.
    pub fn copy_and_insert_child(
        &self,
        storage: &BTreeStorage<K, V>,
        tmp: ChildSplit<K, V>,
    ) -> NodePage<K, V> {
        let key_count = self.head.keys.len();
        let index = self
            .head
            .key_index(&tmp.key)
            .unwrap_or_else(|insert_at| insert_at);

        let mut new_keys = Vec::with_capacity(key_count + 1);
        new_keys.extend_from_slice(&self.head.keys[..index]);
        new_keys.push(tmp.key.clone());
        new_keys.extend_from_slice(&self.head.keys[index..]);

        let mut new_children = Vec::with_capacity(self.children.len() + 1);
        new_children.extend_from_slice(&self.children[..index]);
        new_children.push(tmp.left.clone());
        new_children.push(tmp.right.clone());
        new_children.extend_from_slice(&self.children[index + 1..]);

        let memory =
            self.head.memory + storage.key_type.memory(&tmp.key) + PAGE_MEMORY_CHILD;
        let page = NodePage {
            head: self.head.derived(new_keys, memory),
            children: new_children,
        };
        // the copy shares this page's slot in the parent, point the new
        // halves at it
        let own_ref = page.head.own_ref_weak();
        tmp.left.set_parent(own_ref.clone());
        tmp.right.set_parent(own_ref);
        storage.remove_page(self.head.pos(), self.head.memory);
        page
    }

    /// Plain copy-on-write clone sharing keys and child references. The
    /// current page is marked removed.
    pub fn copy(&self, storage: &BTreeStorage<K, V>) -> NodePage<K, V> {
        let page = NodePage {
            head: self
                .head
                .derived(self.head.keys.clone(), self.head.memory),
            children: self.children.clone(),
        };
        storage.remove_page(self.head.pos(), self.head.memory);
        page
    }

    /// Drops child slot `index` and the nearest separator. When the last
    /// child goes, the keys are already empty and only the slot is dropped.
    ///
    /// Only legal on an unpublished working copy.
    pub fn remove(&mut self, storage: &BTreeStorage<K, V>, index: usize) {
        let key_count = self.head.keys.len();
        if key_count > 0 {
            let key_index = index.min(key_count - 1);
            let old = self.head.keys.remove(key_index);
            self.head.memory -= storage.key_type.memory(&old);
        }
        self.head.memory -= PAGE_MEMORY_CHILD;
        self.children.remove(index);
    }

    pub(crate) fn recalculate_memory(&mut self, storage: &BTreeStorage<K, V>) {
        let mut mem = self.children.len() * PAGE_MEMORY_CHILD;
        for k in &self.head.keys {
            mem += storage.key_type.memory(k);
        }
        self.head.memory = mem;
    }

    pub(crate) fn read(
        storage: &BTreeStorage<K, V>,
        own_ref: &PageRef<K, V>,
        buff: &[u8],
        chunk_id: u32,
        offset: u32,
    ) -> Result<NodePage<K, V>, Error> {
        let (mut reader, key_count, flags) =
            read_envelope(buff, chunk_id, offset, storage.opts.use_checksums)?;
        if !flags.contains(PageTypeFlags::NODE) {
            return Err(corrupt_page!("expected a node page at {chunk_id}:{offset}"));
        }
        let mut positions = Vec::with_capacity(key_count + 1);
        for _ in 0..=key_count {
            positions.push(PagePos::from_raw(reader.get_u64()?));
        }
        let mut children = Vec::with_capacity(key_count + 1);
        for pos in positions {
            let kind = reader.get_u8()?;
            match kind {
                CHILD_KIND_LEAF => {
                    // reserved replication slot, written as zero
                    reader.get_u32()?;
                }
                CHILD_KIND_NODE => {}
                _ => return Err(corrupt_page!("unknown child kind byte {kind:#04x}")),
            }
            let child = PageReference::new_evicted(pos, kind == CHILD_KIND_LEAF);
            child.set_parent(Arc::downgrade(own_ref));
            children.push(child);
        }
        let body = expand_body(&mut reader, flags)?;
        let mut body_reader = ByteReader::new(&body);
        let keys = storage.key_type.read_values(&mut body_reader, key_count)?;
        let mut page = NodePage {
            head: PageHead::new(keys),
            children,
        };
        page.head.set_ref(own_ref);
        page.recalculate_memory(storage);
        Ok(page)
    }

    /// Serializes this page into `buf`, registers it with the chunk and
    /// assigns its position. Returns the buffer offset of the child position
    /// table so it can be patched once the children have positions.
    pub(crate) fn write(
        &self,
        storage: &BTreeStorage<K, V>,
        chunk: &mut Chunk,
        buf: &mut DataBuffer,
    ) -> usize {
        let start = buf.position();
        let key_count = self.head.keys.len();
        buf.put_u32(0);
        let check_pos = buf.position();
        buf.put_u16(0);
        buf.put_var_u32(key_count as u32);
        let type_pos = buf.position();
        buf.put_u8(0);
        self.write_children_positions(buf);
        for child in &self.children {
            if child.is_leaf_page() {
                buf.put_u8(CHILD_KIND_LEAF);
                // reserved replication slot
                buf.put_u32(0);
            } else {
                buf.put_u8(CHILD_KIND_NODE);
            }
        }
        let body_start = buf.position();
        storage.key_type.write_values(buf, &self.head.keys);
        let mut flags = PageTypeFlags::NODE;
        maybe_compress_body(buf, body_start, &mut flags, &storage.opts);
        buf.patch_u8(type_pos, flags.bits());
        let page_length = (buf.position() - start) as u32;
        buf.patch_u32(start, page_length);
        buf.patch_u16(check_pos, check_value(chunk.id, start as u32, page_length));
        let pos = chunk.register_page(start as u32, page_length, false);
        self.head.set_pos(pos);
        type_pos + 1
    }

    fn write_children_positions(&self, buf: &mut DataBuffer) {
        for child in &self.children {
            // positions are usually large, var coding would not pay off
            buf.put_u64(child.pos().raw());
        }
    }

    /// Depth-first store of the unsaved subtree. Children are written after
    /// this page's header, which starts out with null child positions and is
    /// patched once every child has one; each child's in-memory form is
    /// released on the way so a large checkpoint does not pin the whole tree.
    pub(crate) fn write_unsaved_recursive(
        &self,
        storage: &BTreeStorage<K, V>,
        chunk: &mut Chunk,
        buf: &mut DataBuffer,
    ) -> Result<(), Error> {
        if !self.head.pos().is_null() {
            // already stored, and so is the whole subtree below it
            return Ok(());
        }
        let patch = self.write(storage, chunk, buf);
        for child in &self.children {
            if let Some(p) = child.get() {
                p.write_unsaved_recursive(storage, chunk, buf)?;
                child.set_pos(p.pos());
                storage.add_used_memory(-(p.memory() as isize));
            }
            debug_assert!(!child.pos().is_null());
            child.clear_page();
            child.clear_pinfo();
        }
        let end = buf.position();
        buf.set_position(patch);
        self.write_children_positions(buf);
        buf.set_position(end);
        Ok(())
    }
}
