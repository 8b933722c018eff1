use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    datatype::{DataType, KeyType},
    error::Error,
    page::Page,
    pos::PagePos,
    storage::BTreeStorage,
};

pub(crate) type PageRef<K, V> = Arc<PageReference<K, V>>;
pub(crate) type WeakPageRef<K, V> = Weak<PageReference<K, V>>;
pub(crate) type SharedPage<K, V> = triomphe::Arc<Page<K, V>>;
pub(crate) type SharedBuffer = triomphe::Arc<Vec<u8>>;

/// Serialized form of a persisted page, kept around after the page object is
/// evicted so it can be rebuilt without a disk read.
#[derive(Clone)]
pub(crate) struct PageInfo {
    pub buff: SharedBuffer,
    pub page_length: u32,
}

impl fmt::Debug for PageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageInfo")
            .field("page_length", &self.page_length)
            .finish()
    }
}

/// A slot in a node page pointing at a child page.
///
/// Carries the child's on-disk position, optionally the resident page object
/// and optionally the cached serialized buffer. The resident page may be
/// dropped by the eviction sweep at any time; traversals then rebuild it from
/// the buffer or from disk and race to re-install it, where the last writer
/// wins and both produced pages are equivalent.
///
/// Invariant: a zero position implies the page is resident, unpersisted pages
/// are only reachable through their reference.
pub(crate) struct PageReference<K: KeyType, V: DataType> {
    page: RwLock<Option<SharedPage<K, V>>>,
    pinfo: Mutex<Option<PageInfo>>,
    pos: AtomicU64,
    /// Kind of the referent while `pos` is zero; derived from `pos` otherwise.
    leaf: AtomicBool,
    /// The owning slot of the parent page, used to rewire grandchildren after
    /// structural edits. Weak: it must not keep the parent resident.
    parent: Mutex<WeakPageRef<K, V>>,
}

impl<K: KeyType, V: DataType> PageReference<K, V> {
    /// Creates a reference owning a resident page and wires the page's
    /// backlink to it.
    pub fn new(page: SharedPage<K, V>) -> PageRef<K, V> {
        let r = Arc::new(Self {
            pos: AtomicU64::new(page.pos().raw()),
            leaf: AtomicBool::new(page.is_leaf()),
            page: RwLock::new(Some(page.clone())),
            pinfo: Mutex::new(None),
            parent: Mutex::new(Weak::new()),
        });
        page.bind_ref(&r);
        r
    }

    /// Creates a reference in the evicted state. `leaf_hint` is only
    /// consulted while the position is zero.
    pub fn new_evicted(pos: PagePos, leaf_hint: bool) -> PageRef<K, V> {
        Arc::new(Self {
            page: RwLock::new(None),
            pinfo: Mutex::new(None),
            leaf: AtomicBool::new(if pos.is_null() { leaf_hint } else { pos.is_leaf() }),
            pos: AtomicU64::new(pos.raw()),
            parent: Mutex::new(Weak::new()),
        })
    }

    #[inline]
    pub fn get(&self) -> Option<SharedPage<K, V>> {
        self.page.read().clone()
    }

    #[inline]
    pub fn pos(&self) -> PagePos {
        PagePos::from_raw(self.pos.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_pos(&self, pos: PagePos) {
        self.pos.store(pos.raw(), Ordering::Release);
    }

    pub fn is_leaf_page(&self) -> bool {
        let pos = self.pos();
        if pos.is_null() {
            self.leaf.load(Ordering::Relaxed)
        } else {
            pos.is_leaf()
        }
    }

    pub fn set_parent(&self, parent: WeakPageRef<K, V>) {
        *self.parent.lock() = parent;
    }

    pub fn parent(&self) -> Option<PageRef<K, V>> {
        self.parent.lock().upgrade()
    }

    pub fn pinfo(&self) -> Option<PageInfo> {
        self.pinfo.lock().clone()
    }

    pub fn set_pinfo(&self, info: Option<PageInfo>) {
        *self.pinfo.lock() = info;
    }

    pub fn clear_pinfo(&self) {
        *self.pinfo.lock() = None;
    }

    /// Publishes `page` in this slot. Tolerates racing installers: whichever
    /// write lands last stays, the loser becomes garbage.
    pub fn replace_page(&self, page: &SharedPage<K, V>) {
        let pos = page.pos();
        if pos.raw() != self.pos.load(Ordering::Acquire) {
            // a different referent, the cached serialized form is stale
            *self.pinfo.lock() = None;
        }
        self.pos.store(pos.raw(), Ordering::Release);
        self.leaf.store(page.is_leaf(), Ordering::Relaxed);
        *self.page.write() = Some(page.clone());
    }

    /// Drops the resident page object. Only legal for persisted referents.
    pub fn clear_page(&self) {
        debug_assert!(!self.pos().is_null() || self.page.read().is_none());
        *self.page.write() = None;
    }

    /// Resolves the reference to a page, rebuilding it from the cached
    /// serialized buffer or from the chunk file when it was evicted.
    pub fn get_page(
        this: &PageRef<K, V>,
        storage: &BTreeStorage<K, V>,
    ) -> Result<SharedPage<K, V>, Error> {
        if let Some(p) = this.get() {
            p.update_time();
            return Ok(p);
        }
        let page = if let Some(info) = this.pinfo() {
            let page = storage.read_page_from_buffer(this, &info)?;
            storage.gc_if_needed(page.memory());
            page
        } else {
            storage.read_page(this)?
        };
        this.replace_page(&page);
        Ok(page)
    }
}

impl<K: KeyType, V: DataType> fmt::Debug for PageReference<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageReference")
            .field("pos", &self.pos())
            .field("resident", &self.page.read().is_some())
            .field("buffered", &self.pinfo.lock().is_some())
            .field("leaf", &self.is_leaf_page())
            .finish()
    }
}
