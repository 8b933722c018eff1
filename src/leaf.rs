use crate::{
    buffer::{ByteReader, DataBuffer},
    chunk::Chunk,
    datatype::{DataType, KeyType},
    error::{corrupt_page, Error},
    page::{
        check_value, expand_body, maybe_compress_body, read_envelope, PageHead, PageTypeFlags,
        PAGE_MEMORY,
    },
    pageref::PageRef,
    storage::BTreeStorage,
};

/// B-tree terminal page carrying sorted keys and their values.
pub(crate) struct LeafPage<K: KeyType, V: DataType> {
    pub(crate) head: PageHead<K, V>,
    values: Vec<V::Item>,
}

impl<K: KeyType, V: DataType> LeafPage<K, V> {
    pub fn create(
        storage: &BTreeStorage<K, V>,
        keys: Vec<K::Item>,
        values: Vec<V::Item>,
        memory: usize,
    ) -> LeafPage<K, V> {
        assert_eq!(
            keys.len(),
            values.len(),
            "leaf keys and values must have the same length"
        );
        let mut page = LeafPage {
            head: PageHead::new(keys),
            values,
        };
        if memory == 0 {
            page.recalculate_memory(storage);
        } else {
            page.head.memory = memory;
        }
        page
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.head.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.keys.is_empty()
    }

    pub fn get(&self, key: &K::Item) -> Option<&V::Item> {
        let i = self.head.key_index(key).ok()?;
        Some(&self.values[i])
    }

    /// Copy-on-write upsert. The current page is marked removed; the returned
    /// page is fresh and unpublished.
    pub fn copy_and_put(
        &self,
        storage: &BTreeStorage<K, V>,
        key: K::Item,
        value: V::Item,
    ) -> (LeafPage<K, V>, Option<V::Item>) {
        let value_mem = storage.value_type.memory(&value);
        let mut keys = self.head.keys.clone();
        let mut values = self.values.clone();
        let (memory, old) = match self.head.key_index(&key) {
            Ok(i) => {
                let old = std::mem::replace(&mut values[i], value);
                let memory = self.head.memory + value_mem - storage.value_type.memory(&old);
                (memory, Some(old))
            }
            Err(i) => {
                let key_mem = storage.key_type.memory(&key);
                keys.insert(i, key);
                values.insert(i, value);
                (self.head.memory + key_mem + value_mem, None)
            }
        };
        let page = LeafPage {
            head: self.head.derived(keys, memory),
            values,
        };
        storage.remove_page(self.head.pos(), self.head.memory);
        (page, old)
    }

    /// Copy-on-write delete. `None` if the key is absent, in which case
    /// nothing is marked removed.
    pub fn copy_and_remove(
        &self,
        storage: &BTreeStorage<K, V>,
        key: &K::Item,
    ) -> Option<(LeafPage<K, V>, V::Item)> {
        let i = self.head.key_index(key).ok()?;
        let mut keys = self.head.keys.clone();
        let mut values = self.values.clone();
        let old_key = keys.remove(i);
        let old_value = values.remove(i);
        let memory = self.head.memory
            - storage.key_type.memory(&old_key)
            - storage.value_type.memory(&old_value);
        let page = LeafPage {
            head: self.head.derived(keys, memory),
            values,
        };
        storage.remove_page(self.head.pos(), self.head.memory);
        Some((page, old_value))
    }

    /// Splits off everything at and past `at` into a new right sibling. The
    /// key at `at` stays in the right page and doubles as the separator
    /// handed to the parent.
    pub fn split(&mut self, storage: &BTreeStorage<K, V>, at: usize) -> (K::Item, LeafPage<K, V>) {
        assert!(
            at > 0 && at < self.head.keys.len(),
            "leaf split index {at} out of range"
        );
        let b_keys = self.head.keys.split_off(at);
        let b_values = self.values.split_off(at);
        let separator = b_keys[0].clone();
        self.recalculate_memory(storage);
        (separator, LeafPage::create(storage, b_keys, b_values, 0))
    }

    pub(crate) fn recalculate_memory(&mut self, storage: &BTreeStorage<K, V>) {
        let mut mem = PAGE_MEMORY;
        for k in &self.head.keys {
            mem += storage.key_type.memory(k);
        }
        for v in &self.values {
            mem += storage.value_type.memory(v);
        }
        self.head.memory = mem;
    }

    pub(crate) fn read(
        storage: &BTreeStorage<K, V>,
        own_ref: &PageRef<K, V>,
        buff: &[u8],
        chunk_id: u32,
        offset: u32,
    ) -> Result<LeafPage<K, V>, Error> {
        let (mut reader, key_count, flags) =
            read_envelope(buff, chunk_id, offset, storage.opts.use_checksums)?;
        if flags.contains(PageTypeFlags::NODE) {
            return Err(corrupt_page!("expected a leaf page at {chunk_id}:{offset}"));
        }
        let body = expand_body(&mut reader, flags)?;
        let mut body_reader = ByteReader::new(&body);
        let keys = storage.key_type.read_values(&mut body_reader, key_count)?;
        let values = storage.value_type.read_values(&mut body_reader, key_count)?;
        let mut page = LeafPage {
            head: PageHead::new(keys),
            values,
        };
        page.head.set_ref(own_ref);
        page.recalculate_memory(storage);
        Ok(page)
    }

    pub(crate) fn write(&self, storage: &BTreeStorage<K, V>, chunk: &mut Chunk, buf: &mut DataBuffer) {
        let start = buf.position();
        let key_count = self.head.keys.len();
        buf.put_u32(0);
        let check_pos = buf.position();
        buf.put_u16(0);
        buf.put_var_u32(key_count as u32);
        let type_pos = buf.position();
        buf.put_u8(0);
        let body_start = buf.position();
        storage.key_type.write_values(buf, &self.head.keys);
        storage.value_type.write_values(buf, &self.values);
        let mut flags = PageTypeFlags::empty();
        maybe_compress_body(buf, body_start, &mut flags, &storage.opts);
        buf.patch_u8(type_pos, flags.bits());
        let page_length = (buf.position() - start) as u32;
        buf.patch_u32(start, page_length);
        buf.patch_u16(check_pos, check_value(chunk.id, start as u32, page_length));
        let pos = chunk.register_page(start as u32, page_length, true);
        self.head.set_pos(pos);
    }

    pub(crate) fn write_unsaved_recursive(
        &self,
        storage: &BTreeStorage<K, V>,
        chunk: &mut Chunk,
        buf: &mut DataBuffer,
    ) -> Result<(), Error> {
        if !self.head.pos().is_null() {
            // already stored before
            return Ok(());
        }
        self.write(storage, chunk, buf);
        Ok(())
    }
}
