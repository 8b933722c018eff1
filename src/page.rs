use std::{
    borrow::Cow,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    buffer::{var_u32_len, ByteReader, DataBuffer},
    chunk::Chunk,
    datatype::{DataType, KeyType},
    error::{corrupt_page, unsupported_format, Error},
    leaf::LeafPage,
    node::NodePage,
    options::BTreeOptions,
    pageref::{PageRef, PageReference, WeakPageRef},
    pos::PagePos,
    storage::BTreeStorage,
};

/// Fixed memory estimate charged per page object.
pub(crate) const PAGE_MEMORY: usize = 128;
/// Fixed memory estimate charged per child reference slot.
pub(crate) const PAGE_MEMORY_CHILD: usize = 16;

/// Bodies shorter than this are never worth compressing.
const MIN_COMPRESS_LEN: usize = 64;

#[derive(Default, Copy, Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageTypeFlags(u8);

bitflags::bitflags! {
    impl PageTypeFlags: u8 {
        /// Set for inner node pages, clear for leaves
        const NODE = 0b0000_0001;
        /// Set if the page body is LZ4 block compressed
        const COMPRESSED_LZ4 = 0b0001_0000;
    }
}

/// Logical clock stamping page accesses; eviction sweeps the lowest stamps
/// first. Wall clock time is irrelevant here, only the relative order is.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(0);

pub(crate) fn access_stamp() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed) + 1
}

/// 16-bit integrity tag over the page coordinates. Detects pages whose bytes
/// were relocated or torn, which a checksum of the content alone would miss.
pub(crate) fn check_value(chunk_id: u32, offset: u32, page_length: u32) -> u16 {
    let mut raw = [0u8; 12];
    raw[..4].copy_from_slice(&chunk_id.to_be_bytes());
    raw[4..8].copy_from_slice(&offset.to_be_bytes());
    raw[8..].copy_from_slice(&page_length.to_be_bytes());
    xxhash_rust::xxh3::xxh3_64(&raw) as u16
}

/// State shared by node and leaf pages.
#[derive(Debug)]
pub(crate) struct PageHead<K: KeyType, V: DataType> {
    pub keys: Vec<K::Item>,
    /// Memory estimate, maintained incrementally by structural edits and
    /// recomputed after deserialization.
    pub memory: usize,
    /// Raw [PagePos], zero until the page is persisted.
    pos: AtomicU64,
    last_access: AtomicU64,
    /// Index of the last key lookup hit, probed before binary searching.
    search_hint: AtomicUsize,
    /// The parent slot pointing at this page. Weak so that a page and its
    /// reference never keep each other alive against the eviction sweep.
    own_ref: Mutex<WeakPageRef<K, V>>,
}

impl<K: KeyType, V: DataType> PageHead<K, V> {
    pub fn new(keys: Vec<K::Item>) -> Self {
        Self {
            keys,
            memory: 0,
            pos: AtomicU64::new(0),
            last_access: AtomicU64::new(access_stamp()),
            search_hint: AtomicUsize::new(0),
            own_ref: Mutex::new(WeakPageRef::new()),
        }
    }

    /// Head for a copy-on-write clone: shares the parent slot and the search
    /// hint, starts unpersisted.
    pub fn derived(&self, keys: Vec<K::Item>, memory: usize) -> Self {
        Self {
            keys,
            memory,
            pos: AtomicU64::new(0),
            last_access: AtomicU64::new(access_stamp()),
            search_hint: AtomicUsize::new(self.search_hint.load(Ordering::Relaxed)),
            own_ref: Mutex::new(self.own_ref.lock().clone()),
        }
    }

    #[inline]
    pub fn pos(&self) -> PagePos {
        PagePos::from_raw(self.pos.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_pos(&self, pos: PagePos) {
        self.pos.store(pos.raw(), Ordering::Release);
    }

    #[inline]
    pub fn update_time(&self) {
        self.last_access.store(access_stamp(), Ordering::Relaxed);
    }

    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn set_ref(&self, r: &PageRef<K, V>) {
        *self.own_ref.lock() = std::sync::Arc::downgrade(r);
    }

    pub fn own_ref_weak(&self) -> WeakPageRef<K, V> {
        self.own_ref.lock().clone()
    }

    /// Binary search accelerated by the last-hit hint, which makes repeated
    /// and monotonic access patterns cheaper.
    pub fn key_index(&self, key: &K::Item) -> Result<usize, usize> {
        let hint = self.search_hint.load(Ordering::Relaxed);
        if let Some(k) = self.keys.get(hint) {
            if k == key {
                return Ok(hint);
            }
        }
        let result = self.keys.binary_search(key);
        self.search_hint
            .store(result.unwrap_or_else(|i| i), Ordering::Relaxed);
        result
    }
}

/// A materialized tree page.
pub(crate) enum Page<K: KeyType, V: DataType> {
    Node(NodePage<K, V>),
    Leaf(LeafPage<K, V>),
}

impl<K: KeyType, V: DataType> Page<K, V> {
    #[inline]
    pub fn head(&self) -> &PageHead<K, V> {
        match self {
            Page::Node(p) => &p.head,
            Page::Leaf(p) => &p.head,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }

    #[inline]
    pub fn is_node(&self) -> bool {
        matches!(self, Page::Node(_))
    }

    pub fn as_node(&self) -> &NodePage<K, V> {
        match self {
            Page::Node(p) => p,
            Page::Leaf(_) => unreachable!("expected a node page"),
        }
    }

    pub fn as_leaf(&self) -> &LeafPage<K, V> {
        match self {
            Page::Leaf(p) => p,
            Page::Node(_) => unreachable!("expected a leaf page"),
        }
    }

    #[inline]
    pub fn memory(&self) -> usize {
        self.head().memory
    }

    #[inline]
    pub fn pos(&self) -> PagePos {
        self.head().pos()
    }

    #[inline]
    pub fn update_time(&self) {
        self.head().update_time();
    }

    /// Records `r` as the slot owning this page and re-targets the parent
    /// backlinks of any children at it.
    pub fn bind_ref(&self, r: &PageRef<K, V>) {
        self.head().set_ref(r);
        if let Page::Node(node) = self {
            for child in node.children() {
                child.set_parent(std::sync::Arc::downgrade(r));
            }
        }
    }

    pub fn read(
        storage: &BTreeStorage<K, V>,
        own_ref: &PageRef<K, V>,
        buff: &[u8],
        chunk_id: u32,
        offset: u32,
        leaf: bool,
    ) -> Result<Page<K, V>, Error> {
        if leaf {
            LeafPage::read(storage, own_ref, buff, chunk_id, offset).map(Page::Leaf)
        } else {
            NodePage::read(storage, own_ref, buff, chunk_id, offset).map(Page::Node)
        }
    }

    pub fn write_unsaved_recursive(
        &self,
        storage: &BTreeStorage<K, V>,
        chunk: &mut Chunk,
        buf: &mut DataBuffer,
    ) -> Result<(), Error> {
        match self {
            Page::Node(p) => p.write_unsaved_recursive(storage, chunk, buf),
            Page::Leaf(p) => p.write_unsaved_recursive(storage, chunk, buf),
        }
    }

    /// Diagnostic dump of the subtree. Off-line children are either read back
    /// on demand or printed as placeholders.
    pub fn pretty_recursive(
        &self,
        storage: &BTreeStorage<K, V>,
        out: &mut String,
        indent: &str,
        info: &mut PrettyInfo,
    ) -> Result<(), Error> {
        use std::fmt::Write;

        info.page_count += 1;
        match self {
            Page::Leaf(leaf) => {
                info.leaf_count += 1;
                info.key_count += leaf.len();
                let _ = writeln!(out, "{indent}leaf {:?}: {} entries", self.pos(), leaf.len());
            }
            Page::Node(node) => {
                info.node_count += 1;
                let _ = writeln!(
                    out,
                    "{indent}node {:?}: keys {:?}",
                    self.pos(),
                    self.head().keys
                );
                let child_indent = format!("{indent}  ");
                for child in node.children() {
                    if let Some(p) = child.get() {
                        p.pretty_recursive(storage, out, &child_indent, info)?;
                    } else if info.read_off_line_pages {
                        let p = PageReference::get_page(child, storage)?;
                        p.pretty_recursive(storage, out, &child_indent, info)?;
                    } else {
                        let _ = writeln!(out, "{child_indent}*** off-line *** {:?}", child.pos());
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct PrettyInfo {
    pub read_off_line_pages: bool,
    pub page_count: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    pub key_count: usize,
}

/// Parses and validates the page prelude shared by all page kinds: total
/// length, check value, key count and type byte. The returned reader is
/// positioned at the first kind-specific byte.
pub(crate) fn read_envelope<'a>(
    buff: &'a [u8],
    chunk_id: u32,
    offset: u32,
    verify_check: bool,
) -> Result<(ByteReader<'a>, usize, PageTypeFlags), Error> {
    let mut reader = ByteReader::new(buff);
    let page_length = reader.get_u32()? as usize;
    if page_length != buff.len() || page_length < 8 {
        return Err(corrupt_page!(
            "page length {page_length} does not match the {} bytes at {chunk_id}:{offset}",
            buff.len()
        ));
    }
    let stored_check = reader.get_u16()?;
    if verify_check {
        let expected = check_value(chunk_id, offset, page_length as u32);
        if stored_check != expected {
            return Err(corrupt_page!(
                "check value mismatch at {chunk_id}:{offset}: stored {stored_check:#06x}, computed {expected:#06x}"
            ));
        }
    }
    let key_count = reader.get_var_u32()? as usize;
    let type_byte = reader.get_u8()?;
    let flags = PageTypeFlags::from_bits(type_byte).ok_or_else(|| {
        unsupported_format!("unknown page type byte {type_byte:#04x} at {chunk_id}:{offset}")
    })?;
    Ok((reader, key_count, flags))
}

/// Compresses the body written at `body_start..` in place when it pays off,
/// recording the algorithm in `flags`. The compressed form is the var-int
/// coded size delta followed by the LZ4 block.
pub(crate) fn maybe_compress_body(
    buf: &mut DataBuffer,
    body_start: usize,
    flags: &mut PageTypeFlags,
    opts: &BTreeOptions,
) {
    let body_len = buf.position() - body_start;
    if !opts.compress || body_len < MIN_COMPRESS_LEN {
        return;
    }
    let compressed = lz4_flex::block::compress(&buf.as_slice()[body_start..]);
    if compressed.is_empty() || compressed.len() >= body_len {
        return;
    }
    let delta = (body_len - compressed.len()) as u32;
    if compressed.len() + var_u32_len(delta) >= body_len {
        return;
    }
    buf.truncate(body_start);
    buf.put_var_u32(delta);
    buf.put_slice(&compressed);
    *flags |= PageTypeFlags::COMPRESSED_LZ4;
}

/// Inverse of [maybe_compress_body]: hands back the body bytes ready for the
/// codec, decompressing only when the type byte says so.
pub(crate) fn expand_body<'a>(
    reader: &mut ByteReader<'a>,
    flags: PageTypeFlags,
) -> Result<Cow<'a, [u8]>, Error> {
    if !flags.contains(PageTypeFlags::COMPRESSED_LZ4) {
        return Ok(Cow::Borrowed(reader.rest()));
    }
    let delta = reader.get_var_u32()? as usize;
    let compressed = reader.rest();
    let expanded_len = compressed.len() + delta;
    lz4_flex::block::decompress(compressed, expanded_len)
        .map(Cow::Owned)
        .map_err(|e| corrupt_page!("page body does not decompress: {e}"))
}
