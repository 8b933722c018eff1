use std::path::Path;

use parking_lot::Mutex;
use smallvec::SmallVec;
use triomphe::Arc;

use crate::{
    datatype::{DataType, KeyType},
    error::Error,
    leaf::LeafPage,
    node::{ChildSplit, NodePage},
    options::BTreeOptions,
    page::{Page, PrettyInfo},
    pageref::{PageRef, PageReference, SharedPage},
    storage::BTreeStorage,
};

/// Pages visited on the way to a leaf, innermost last, with the child index
/// taken at each node.
type PathVec<K, V> = SmallVec<(PageRef<K, V>, usize), 8>;

/// An ordered map persisted as an append-only, copy-on-write B-tree.
///
/// Key and value encodings are pluggable through the [KeyType] and
/// [DataType] codecs. Reads are concurrent and traverse published pages
/// without taking tree-level locks; writes are serialized internally and
/// publish each edit with a single reference swap, so a reader always
/// observes either the previous or the new subtree, never a mixture.
///
/// Changes live in memory until [BTree::checkpoint] appends the unsaved
/// subtree to a fresh chunk file. Dropping the tree without a checkpoint
/// discards the changes made since the last one.
pub struct BTree<K: KeyType, V: DataType> {
    storage: Arc<BTreeStorage<K, V>>,
    write_lock: Mutex<()>,
}

impl<K: KeyType, V: DataType> BTree<K, V> {
    /// Opens the tree stored in `dir`, creating an empty one if the
    /// directory holds no chunks yet.
    pub fn open(
        dir: impl AsRef<Path>,
        opts: BTreeOptions,
        key_type: K,
        value_type: V,
    ) -> Result<BTree<K, V>, Error> {
        let storage = BTreeStorage::open(dir.as_ref(), opts, key_type, value_type)?;
        Ok(BTree {
            storage: Arc::new(storage),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &K::Item) -> Result<Option<V::Item>, Error> {
        let root_ref = self.storage.root_ref();
        let mut page = PageReference::get_page(&root_ref, &self.storage)?;
        loop {
            let next = match &*page {
                Page::Leaf(leaf) => return Ok(leaf.get(key).cloned()),
                Page::Node(node) => {
                    let index = node.child_index(key);
                    node.get_child_page(&self.storage, index)?
                }
            };
            page = next;
        }
    }

    /// Whether the tree holds no keys.
    pub fn is_empty(&self) -> Result<bool, Error> {
        let root_ref = self.storage.root_ref();
        let root = PageReference::get_page(&root_ref, &self.storage)?;
        Ok(match &*root {
            Page::Leaf(leaf) => leaf.is_empty(),
            // node pages with empty subtrees are pruned eagerly
            Page::Node(_) => false,
        })
    }

    /// Inserts or replaces `key`, returning the previous value if any.
    pub fn put(&self, key: K::Item, value: V::Item) -> Result<Option<V::Item>, Error> {
        let _guard = self.write_lock.lock();
        let storage = &*self.storage;
        storage.check_writable()?;
        let (mut path, leaf_ref, leaf_page) = self.descend(&key)?;
        self.mark_dirty_path(&path)?;

        let (new_leaf, old_value) = leaf_page.as_leaf().copy_and_put(storage, key, value);
        let split_size = storage.opts.page_split_size;
        if new_leaf.head.memory > split_size && new_leaf.len() > 1 {
            let mut left_leaf = new_leaf;
            let at = left_leaf.len() / 2;
            let (separator, right_leaf) = left_leaf.split(storage, at);
            let left_page = Arc::new(Page::Leaf(left_leaf));
            let right_page = Arc::new(Page::Leaf(right_leaf));
            storage.add_used_memory((left_page.memory() + right_page.memory()) as isize);
            let mut split = ChildSplit {
                key: separator,
                left: PageReference::new(left_page),
                right: PageReference::new(right_page),
            };
            loop {
                let Some((r, _index)) = path.pop() else {
                    // the root itself split, grow the tree by one level
                    let ChildSplit { key, left, right } = split;
                    let new_root = NodePage::create(storage, vec![key], vec![left, right], 0);
                    let new_root = Arc::new(Page::Node(new_root));
                    storage.add_used_memory(new_root.memory() as isize);
                    let root_ref = storage.root_ref();
                    root_ref.replace_page(&new_root);
                    new_root.bind_ref(&root_ref);
                    break;
                };
                let parent = PageReference::get_page(&r, storage)?;
                let new_parent = parent.as_node().copy_and_insert_child(storage, split);
                if new_parent.head.memory > split_size && new_parent.key_count() > 1 {
                    let mut left_node = new_parent;
                    let at = left_node.key_count() / 2;
                    let (separator, right_node) = left_node.split(storage, at);
                    let left_page = Arc::new(Page::Node(left_node));
                    let right_page = Arc::new(Page::Node(right_node));
                    storage.add_used_memory((left_page.memory() + right_page.memory()) as isize);
                    split = ChildSplit {
                        key: separator,
                        left: PageReference::new(left_page),
                        right: PageReference::new(right_page),
                    };
                    continue;
                }
                let new_parent = Arc::new(Page::Node(new_parent));
                storage.add_used_memory(new_parent.memory() as isize);
                r.replace_page(&new_parent);
                break;
            }
        } else {
            let new_leaf = Arc::new(Page::Leaf(new_leaf));
            storage.add_used_memory(new_leaf.memory() as isize);
            leaf_ref.replace_page(&new_leaf);
        }
        storage.gc_if_needed(0);
        Ok(old_value)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &K::Item) -> Result<Option<V::Item>, Error> {
        let _guard = self.write_lock.lock();
        let storage = &*self.storage;
        storage.check_writable()?;
        let (mut path, leaf_ref, leaf_page) = self.descend(key)?;
        let leaf = leaf_page.as_leaf();
        if leaf.get(key).is_none() {
            return Ok(None);
        }
        self.mark_dirty_path(&path)?;

        let (new_leaf, old_value) = leaf
            .copy_and_remove(storage, key)
            .expect("key presence was just checked");
        if new_leaf.is_empty() && !path.is_empty() {
            // the leaf vanishes, drop its slot from the parent chain
            loop {
                let Some((r, index)) = path.pop() else {
                    // every slot on the way up vanished with it
                    let empty =
                        LeafPage::create(storage, Vec::new(), Vec::new(), 0);
                    let empty = Arc::new(Page::Leaf(empty));
                    storage.add_used_memory(empty.memory() as isize);
                    let root_ref = storage.root_ref();
                    root_ref.replace_page(&empty);
                    empty.bind_ref(&root_ref);
                    break;
                };
                let parent = PageReference::get_page(&r, storage)?;
                let mut copied = parent.as_node().copy(storage);
                copied.remove(storage, index);
                if copied.is_empty() {
                    continue;
                }
                if path.is_empty() && copied.key_count() == 0 && copied.children().len() == 1 {
                    // a root left with a single child collapses into it
                    let child = copied.get_child_page(storage, 0)?;
                    let root_ref = storage.root_ref();
                    root_ref.replace_page(&child);
                    child.bind_ref(&root_ref);
                } else {
                    let copied = Arc::new(Page::Node(copied));
                    storage.add_used_memory(copied.memory() as isize);
                    r.replace_page(&copied);
                }
                break;
            }
        } else {
            let new_leaf = Arc::new(Page::Leaf(new_leaf));
            storage.add_used_memory(new_leaf.memory() as isize);
            leaf_ref.replace_page(&new_leaf);
        }
        Ok(Some(old_value))
    }

    /// Appends all unsaved pages to a fresh chunk file and publishes the new
    /// root position. A no-op when nothing changed since the last call.
    pub fn checkpoint(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.storage.save()
    }

    /// Diagnostic dump of the tree structure. With `read_off_line_pages` the
    /// whole tree is paged in, otherwise evicted subtrees are printed as
    /// placeholders.
    pub fn pretty(&self, read_off_line_pages: bool) -> Result<String, Error> {
        use std::fmt::Write;

        let storage = &*self.storage;
        let root_ref = storage.root_ref();
        let mut out = String::new();
        let mut info = PrettyInfo {
            read_off_line_pages,
            ..Default::default()
        };
        let root = if read_off_line_pages {
            Some(PageReference::get_page(&root_ref, storage)?)
        } else {
            root_ref.get()
        };
        match root {
            Some(root) => root.pretty_recursive(storage, &mut out, "", &mut info)?,
            None => out.push_str("*** off-line root ***\n"),
        }
        let _ = writeln!(
            out,
            "{} pages ({} nodes, {} leaves), {} keys",
            info.page_count, info.node_count, info.leaf_count, info.key_count
        );
        Ok(out)
    }

    pub(crate) fn storage(&self) -> &Arc<BTreeStorage<K, V>> {
        &self.storage
    }

    /// Walks from the root to the leaf responsible for `key`, materializing
    /// evicted pages on the way.
    fn descend(
        &self,
        key: &K::Item,
    ) -> Result<(PathVec<K, V>, PageRef<K, V>, SharedPage<K, V>), Error> {
        let storage = &*self.storage;
        let mut path = SmallVec::new();
        let mut cur_ref = storage.root_ref();
        let mut cur = PageReference::get_page(&cur_ref, storage)?;
        while cur.is_node() {
            let node = cur.as_node();
            let index = node.child_index(key);
            let child_ref = node.child_ref(index).clone();
            let child = node.get_child_page(storage, index)?;
            path.push((cur_ref, index));
            cur_ref = child_ref;
            cur = child;
        }
        Ok((path, cur_ref, cur))
    }

    /// Copies every persisted node along the path, so the chain from the
    /// root down to the edited leaf is unsaved. This preserves the rule that
    /// a persisted page's subtree is persisted in its entirety, which both
    /// the checkpoint and the eviction sweep rely on. Unsaved pages are not
    /// evictable, so afterwards the path is pinned for the rest of the edit.
    fn mark_dirty_path(&self, path: &PathVec<K, V>) -> Result<(), Error> {
        let storage = &*self.storage;
        for (r, _) in path {
            let page = PageReference::get_page(r, storage)?;
            if page.pos().is_null() {
                continue;
            }
            let copied = Arc::new(Page::Node(page.as_node().copy(storage)));
            storage.add_used_memory(copied.memory() as isize);
            r.replace_page(&copied);
        }
        Ok(())
    }
}
