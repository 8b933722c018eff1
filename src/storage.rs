use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, Ordering},
};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};

use crate::{
    buffer::DataBuffer,
    chunk::{Chunk, ChunkHeader, CHUNK_HEADER_LEN},
    datatype::{DataType, KeyType},
    error::{corrupt_page, error_validation, io_invalid_data, Error},
    leaf::LeafPage,
    options::BTreeOptions,
    page::Page,
    pageref::{PageInfo, PageRef, PageReference, SharedPage},
    pos::{PagePos, MAX_CHUNK_ID},
    utils::{sync_dir, FileExt},
};

/// An opened, immutable chunk file.
pub(crate) struct ChunkFile {
    pub file: File,
    /// Root position recorded by the checkpoint that wrote this chunk.
    pub root_pos: PagePos,
    pub size: u64,
}

/// Storage backing one tree: the chunk files, the page read path, the memory
/// accounting for resident pages and the checkpoint writer.
pub(crate) struct BTreeStorage<K: KeyType, V: DataType> {
    pub(crate) key_type: K,
    pub(crate) value_type: V,
    pub(crate) opts: BTreeOptions,
    dir: PathBuf,
    chunks: DashMap<u32, ChunkFile>,
    last_chunk_id: AtomicU32,
    /// The sentinel reference owning the tree root. The reference object is
    /// permanent, the page inside it is swapped by structural edits.
    root: RwLock<Option<PageRef<K, V>>>,
    /// Estimated bytes of resident page objects.
    used_memory: AtomicIsize,
    /// Positions of persisted pages superseded by copy-on-write edits,
    /// awaiting chunk compaction.
    removed_pages: DashSet<u64>,
    gc_lock: Mutex<()>,
    /// Held for the duration of a checkpoint. The recursive store releases
    /// page caches whose new positions point into the chunk being written;
    /// a reader chasing such a position blocks here until the chunk file is
    /// registered instead of failing the lookup.
    save_lock: Mutex<()>,
    /// Set when a checkpoint failed after assigning positions. The in-memory
    /// tree can no longer be written out consistently, so writes are refused.
    halted: AtomicBool,
}

impl<K: KeyType, V: DataType> BTreeStorage<K, V> {
    pub fn open(
        dir: &Path,
        opts: BTreeOptions,
        key_type: K,
        value_type: V,
    ) -> Result<BTreeStorage<K, V>, Error> {
        opts.validate()?;
        if opts.read_only {
            if !dir.is_dir() {
                return Err(error_validation!(
                    "cannot open missing directory {} read only",
                    dir.display()
                ));
            }
        } else {
            fs::create_dir_all(dir)?;
        }
        let storage = BTreeStorage {
            key_type,
            value_type,
            opts,
            dir: dir.to_path_buf(),
            chunks: DashMap::new(),
            last_chunk_id: AtomicU32::new(0),
            root: RwLock::new(None),
            used_memory: AtomicIsize::new(0),
            removed_pages: DashSet::new(),
            gc_lock: Mutex::new(()),
            save_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
        };

        let mut last_id = 0u32;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "chunk") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(id) = u32::from_str_radix(stem, 16) else {
                continue;
            };
            let file = OpenOptions::new().read(true).open(&path)?;
            let size = file.metadata()?.len();
            let mut raw = [0u8; CHUNK_HEADER_LEN];
            let header = if size >= CHUNK_HEADER_LEN as u64 {
                file.read_exact_at(&mut raw, 0)?;
                ChunkHeader::decode(&raw)
            } else {
                Err(corrupt_page!("chunk file {} is truncated", path.display()))
            };
            let header = match header {
                Ok(header) => header,
                Err(Error::UnsupportedFormat(e)) => {
                    return Err(Error::UnsupportedFormat(e));
                }
                Err(e) => {
                    // a crash mid checkpoint leaves a torn chunk behind, the
                    // previous chunk still holds the last durable root
                    warn!("discarding torn chunk file {}: {e:?}", path.display());
                    if !storage.opts.read_only {
                        drop(file);
                        fs::remove_file(&path)?;
                    }
                    continue;
                }
            };
            if header.id.get() != id {
                return Err(io_invalid_data!(
                    "chunk file {} carries id {}",
                    path.display(),
                    header.id.get()
                ));
            }
            let root_pos = PagePos::from_raw(header.root_pos.get());
            storage.chunks.insert(id, ChunkFile { file, root_pos, size });
            last_id = last_id.max(id);
        }
        storage.last_chunk_id.store(last_id, Ordering::Release);

        let root_pos = storage
            .chunks
            .get(&last_id)
            .map_or(PagePos::NULL, |c| c.root_pos);
        let root_ref = if root_pos.is_null() {
            let empty = LeafPage::create(&storage, Vec::new(), Vec::new(), 0);
            let page = triomphe::Arc::new(Page::Leaf(empty));
            storage.add_used_memory(page.memory() as isize);
            PageReference::new(page)
        } else {
            PageReference::new_evicted(root_pos, root_pos.is_leaf())
        };
        *storage.root.write() = Some(root_ref);

        info!(
            "opened tree storage at {} ({} chunks, root {root_pos:?})",
            dir.display(),
            storage.chunks.len()
        );
        Ok(storage)
    }

    pub fn root_ref(&self) -> PageRef<K, V> {
        self.root
            .read()
            .clone()
            .expect("the root reference is set for the storage lifetime")
    }

    /// Reads and materializes a page from its chunk file, installing the
    /// serialized buffer on the reference for cheap re-materialization.
    pub fn read_page(&self, r: &PageRef<K, V>) -> Result<SharedPage<K, V>, Error> {
        let pos = r.pos();
        if pos.is_null() {
            return Err(error_validation!(
                "cannot read a page that was never persisted"
            ));
        }
        let bytes = self.read_page_bytes(pos)?;
        let page_length = bytes.len() as u32;
        let page = Page::read(self, r, &bytes, pos.chunk_id(), pos.offset(), pos.is_leaf())?;
        let page = triomphe::Arc::new(page);
        r.set_pinfo(Some(PageInfo {
            buff: triomphe::Arc::new(bytes),
            page_length,
        }));
        self.add_used_memory(page.memory() as isize);
        self.gc_if_needed(0);
        trace!("read page {pos:?} ({page_length} bytes)");
        Ok(page)
    }

    /// Rebuilds a page from a cached serialized buffer, avoiding the disk.
    pub fn read_page_from_buffer(
        &self,
        r: &PageRef<K, V>,
        info: &PageInfo,
    ) -> Result<SharedPage<K, V>, Error> {
        let pos = r.pos();
        if pos.is_null() || info.page_length as usize > info.buff.len() {
            return Err(corrupt_page!(
                "cached buffer for page {pos:?} is inconsistent"
            ));
        }
        let buff = &info.buff[..info.page_length as usize];
        let page = Page::read(self, r, buff, pos.chunk_id(), pos.offset(), pos.is_leaf())?;
        let page = triomphe::Arc::new(page);
        self.add_used_memory(page.memory() as isize);
        Ok(page)
    }

    fn read_page_bytes(&self, pos: PagePos) -> Result<Vec<u8>, Error> {
        let chunk = match self.chunks.get(&pos.chunk_id()) {
            Some(chunk) => chunk,
            None => {
                // the position may belong to a checkpoint still in flight,
                // wait for it to land and look again
                drop(self.save_lock.lock());
                self.chunks
                    .get(&pos.chunk_id())
                    .ok_or_else(|| corrupt_page!("page {pos:?} points at an unknown chunk"))?
            }
        };
        let offset = u64::from(pos.offset());
        if offset + 8 > chunk.size {
            return Err(corrupt_page!(
                "page {pos:?} lies outside its chunk ({} bytes)",
                chunk.size
            ));
        }
        let speculative = u64::from(pos.max_length()).min(chunk.size - offset) as usize;
        let mut bytes = vec![0u8; speculative];
        chunk.file.read_exact_at(&mut bytes, offset)?;
        let page_length = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        if page_length < 8 || offset + page_length as u64 > chunk.size {
            return Err(corrupt_page!("page {pos:?} has invalid length {page_length}"));
        }
        if page_length > bytes.len() {
            // the size class only covered the prelude, re-read exactly
            bytes.resize(page_length, 0);
            chunk.file.read_exact_at(&mut bytes, offset)?;
        } else {
            bytes.truncate(page_length);
        }
        Ok(bytes)
    }

    #[inline]
    pub fn add_used_memory(&self, delta: isize) {
        self.used_memory.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn used_memory(&self) -> usize {
        self.used_memory.load(Ordering::Relaxed).max(0) as usize
    }

    /// Runs an eviction sweep if the resident set plus `memory_delta` is over
    /// budget. Cheap when under budget; called from every page read.
    pub fn gc_if_needed(&self, memory_delta: usize) {
        if self.used_memory() + memory_delta > self.opts.cache_size {
            self.gc();
        }
    }

    /// Evicts the coldest persisted pages until the resident set is at half
    /// the budget. First pass drops the page objects but keeps their
    /// serialized buffers; under continued pressure those go too.
    fn gc(&self) {
        let Some(_guard) = self.gc_lock.try_lock() else {
            // a sweep is already running
            return;
        };
        let root = self.root_ref();
        let mut candidates = Vec::new();
        Self::collect_evictable(&root, &mut candidates);
        candidates.sort_unstable_by_key(|&(_, last_access, _)| last_access);
        let target = self.opts.cache_size / 2;
        let mut evicted = Vec::new();
        let mut evicted_bytes = 0usize;
        for (r, _, memory) in candidates {
            if self.used_memory() <= target {
                break;
            }
            r.clear_page();
            self.add_used_memory(-(memory as isize));
            evicted_bytes += memory;
            evicted.push(r);
        }
        if self.used_memory() > target {
            for r in &evicted {
                r.clear_pinfo();
            }
        }
        debug!(
            "gc evicted {} pages ({evicted_bytes} bytes), {} bytes still resident",
            evicted.len(),
            self.used_memory()
        );
    }

    fn collect_evictable(r: &PageRef<K, V>, out: &mut Vec<(PageRef<K, V>, u64, usize)>) {
        let Some(page) = r.get() else { return };
        if let Page::Node(node) = &*page {
            for child in node.children() {
                Self::collect_evictable(child, out);
            }
        }
        // unpersisted pages are only reachable through their reference and
        // must stay resident
        if !r.pos().is_null() {
            out.push((r.clone(), page.head().last_access(), page.memory()));
        }
    }

    /// Marks the on-disk image at `pos` as superseded and releases the page's
    /// share of the memory estimate. The bytes themselves are reclaimed by
    /// chunk compaction, never in place.
    pub fn remove_page(&self, pos: PagePos, memory: usize) {
        if !pos.is_null() {
            self.removed_pages.insert(pos.raw());
        }
        self.add_used_memory(-(memory as isize));
    }

    pub fn has_removed(&self, pos: PagePos) -> bool {
        self.removed_pages.contains(&pos.raw())
    }

    pub fn check_halted(&self) -> Result<(), Error> {
        if self.halted.load(Ordering::Acquire) {
            Err(Error::StorageHalted)
        } else {
            Ok(())
        }
    }

    pub fn check_writable(&self) -> Result<(), Error> {
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }
        self.check_halted()
    }

    /// Writes the unsaved subtree into a fresh chunk file and publishes the
    /// new root position in its header. A no-op when the root is persisted.
    ///
    /// Serialization assigns positions as it goes, so an error after that
    /// point leaves the in-memory tree pointing at a chunk that never became
    /// durable; the storage halts rather than risk writing an inconsistent
    /// successor chunk.
    pub fn save(&self) -> Result<(), Error> {
        self.check_writable()?;
        let root_ref = self.root_ref();
        let Some(root) = root_ref.get() else {
            // an evicted root is persisted by definition
            return Ok(());
        };
        if !root.pos().is_null() {
            trace!("checkpoint: no unsaved pages");
            return Ok(());
        }
        let id = self.last_chunk_id.load(Ordering::Acquire) + 1;
        if id > MAX_CHUNK_ID {
            return Err(error_validation!("chunk id space exhausted"));
        }

        let save_guard = self.save_lock.lock();
        let result = self.write_chunk(id, &root);
        drop(save_guard);
        match result {
            Ok(size) => {
                root_ref.set_pos(root.pos());
                root_ref.clear_pinfo();
                self.last_chunk_id.store(id, Ordering::Release);
                debug!(
                    "checkpoint wrote chunk {id:08x}: {size} bytes, root {:?}",
                    root.pos()
                );
                Ok(())
            }
            Err(e) => {
                self.halted.store(true, Ordering::Release);
                error!("checkpoint of chunk {id:08x} failed, halting storage: {e:?}");
                Err(e)
            }
        }
    }

    fn write_chunk(&self, id: u32, root: &SharedPage<K, V>) -> Result<u64, Error> {
        let mut chunk = Chunk::new(id);
        let mut buf = DataBuffer::with_capacity(64 * 1024);
        buf.put_slice(&[0u8; CHUNK_HEADER_LEN]);
        root.write_unsaved_recursive(self, &mut chunk, &mut buf)?;
        buf.patch_slice(0, &ChunkHeader::encode(id, chunk.page_count(), root.pos()));

        let path = self.chunk_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all_at(buf.as_slice(), 0)?;
        file.sync_all().map_err(Error::FatalIo)?;
        sync_dir(&self.dir).map_err(Error::FatalIo)?;

        let size = buf.len() as u64;
        self.chunks.insert(
            id,
            ChunkFile {
                file,
                root_pos: root.pos(),
                size,
            },
        );
        trace!("chunk {id:08x} holds {} pages", chunk.page_count());
        Ok(size)
    }

    fn chunk_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{id:08x}.chunk"))
    }
}
