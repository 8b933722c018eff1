use crate::{
    buffer::DataBuffer,
    chunk::Chunk,
    leaf::LeafPage,
    node::{ChildSplit, NodePage},
    page::{Page, PAGE_MEMORY_CHILD},
    pageref::{PageRef, PageReference},
    pos::PagePos,
    *,
};
use rand::prelude::*;
use std::{collections::BTreeMap, sync::Arc as StdArc};
use tempfile::TempDir;
use triomphe::Arc;

type TestTree = BTree<VarIntType, BytesType>;
type TestRef = PageRef<VarIntType, BytesType>;

fn get_rng() -> impl Rng + Clone {
    let seed: u64 = std::env::var("SEED")
        .map_or_else(|_| thread_rng().gen(), |seed_str| seed_str.parse().unwrap());
    println!("SEED {}", seed);
    SmallRng::seed_from_u64(seed)
}

fn very_rand_bytes(rng: &mut impl Rng, a: usize, b: usize) -> Vec<u8> {
    let len = rng.gen_range(a..=b);
    let mut buffer = vec![0; len];
    rng.fill_bytes(&mut buffer);
    buffer
}

fn test_folder() -> TempDir {
    if let Ok(p) = std::env::var("TEST_DATA_FOLDER") {
        let _ = std::fs::create_dir_all(&p);
        tempfile::tempdir_in(&p).unwrap()
    } else {
        tempfile::tempdir().unwrap()
    }
}

fn test_tree(opts: BTreeOptions) -> (TempDir, TestTree) {
    let _ = env_logger::try_init();
    let dir = test_folder();
    let tree = BTree::open(dir.path(), opts, VarIntType, BytesType).unwrap();
    (dir, tree)
}

fn evicted_leaf_ref(chunk: u32, offset: u32) -> TestRef {
    PageReference::new_evicted(PagePos::new(chunk, offset, 64, true), true)
}

#[test]
fn test_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}

    assert_send_sync::<TestTree>();
    assert_send_sync::<BTree<BytesType, BytesType>>();
    assert_send_sync::<Error>();
}

#[test]
fn node_page_round_trip() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();

    let positions: Vec<PagePos> = (0..4)
        .map(|i| PagePos::new(3, 64 + i * 128, 100, true))
        .collect();
    let children: Vec<TestRef> = positions
        .iter()
        .map(|&pos| PageReference::new_evicted(pos, true))
        .collect();
    let node = NodePage::create(storage, vec![10u64, 20, 30], children, 0);
    assert_eq!(node.head.memory, 3 * 8 + 4 * PAGE_MEMORY_CHILD);

    let mut chunk = Chunk::new(7);
    let mut buf = DataBuffer::new();
    node.write(storage, &mut chunk, &mut buf);
    assert!(!node.head.pos().is_null());
    assert!(!node.head.pos().is_leaf());

    let own_ref: TestRef = PageReference::new_evicted(node.head.pos(), false);
    let read = NodePage::read(storage, &own_ref, buf.as_slice(), 7, 0).unwrap();
    assert_eq!(read.head.keys, vec![10, 20, 30]);
    assert_eq!(read.children().len(), 4);
    for (child, &pos) in read.children().iter().zip(&positions) {
        assert_eq!(child.pos(), pos);
        assert!(child.is_leaf_page());
        assert!(child.get().is_none());
        let parent = child.parent().unwrap();
        assert!(StdArc::ptr_eq(&parent, &own_ref));
    }
    assert_eq!(read.head.memory, node.head.memory);
}

#[test]
fn split_middle_preserves_child_identity() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();

    let children: Vec<TestRef> = (0..6).map(|i| evicted_leaf_ref(1, 40 + i * 100)).collect();
    let orig = children.clone();
    let mut node = NodePage::create(storage, vec![1u64, 2, 3, 4, 5], children, 0);

    let (separator, right) = node.split(storage, 2);
    assert_eq!(separator, 3);
    assert_eq!(node.head.keys, vec![1, 2]);
    assert_eq!(right.head.keys, vec![4, 5]);
    assert_eq!(node.children().len(), 3);
    assert_eq!(right.children().len(), 3);
    for i in 0..3 {
        assert!(StdArc::ptr_eq(&node.children()[i], &orig[i]));
        assert!(StdArc::ptr_eq(&right.children()[i], &orig[i + 3]));
    }
    assert_eq!(node.head.memory, 2 * 8 + 3 * PAGE_MEMORY_CHILD);
    assert_eq!(right.head.memory, 2 * 8 + 3 * PAGE_MEMORY_CHILD);
}

#[test]
fn split_boundaries() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();
    let new_node = |keys: Vec<u64>| {
        let children = (0..=keys.len() as u32)
            .map(|i| evicted_leaf_ref(1, 40 + i * 100))
            .collect();
        NodePage::create(storage, keys, children, 0)
    };

    // the first key becomes the separator, everything else goes right
    let mut node = new_node(vec![1, 2, 3, 4, 5]);
    let (separator, right) = node.split(storage, 0);
    assert_eq!(separator, 1);
    assert_eq!(node.head.keys, Vec::<u64>::new());
    assert_eq!(node.children().len(), 1);
    assert_eq!(right.head.keys, vec![2, 3, 4, 5]);
    assert_eq!(right.children().len(), 5);

    // a minimal right sibling: one key, two children
    let mut node = new_node(vec![1, 2, 3, 4, 5]);
    let (separator, right) = node.split(storage, 3);
    assert_eq!(separator, 4);
    assert_eq!(node.head.keys, vec![1, 2, 3]);
    assert_eq!(right.head.keys, vec![5]);
    assert_eq!(right.children().len(), 2);

    // splitting at the last key empties the right sibling of keys
    let mut node = new_node(vec![1, 2, 3, 4, 5]);
    let (separator, right) = node.split(storage, 4);
    assert_eq!(separator, 5);
    assert_eq!(node.head.keys, vec![1, 2, 3, 4]);
    assert_eq!(right.head.keys, Vec::<u64>::new());
    assert_eq!(right.children().len(), 1);
    assert_eq!(right.head.memory, PAGE_MEMORY_CHILD);
}

#[test]
fn copy_on_write_insert_child() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();

    let a = evicted_leaf_ref(1, 40);
    let b = evicted_leaf_ref(1, 140);
    let c = evicted_leaf_ref(1, 240);
    let parent = NodePage::create(
        storage,
        vec![10u64, 30],
        vec![a.clone(), b.clone(), c.clone()],
        0,
    );
    let parent_pos = PagePos::new(2, 40, 200, false);
    parent.head.set_pos(parent_pos);
    let parent_page = Arc::new(Page::Node(parent));
    let parent_ref = PageReference::new(parent_page.clone());
    let parent_memory = parent_page.memory();

    let b_left = evicted_leaf_ref(1, 500);
    let b_new = evicted_leaf_ref(1, 600);
    let tmp = ChildSplit {
        key: 20u64,
        left: b_left.clone(),
        right: b_new.clone(),
    };
    let new_parent = parent_page.as_node().copy_and_insert_child(storage, tmp);

    assert_eq!(new_parent.head.keys, vec![10, 20, 30]);
    assert_eq!(new_parent.children().len(), 4);
    assert!(StdArc::ptr_eq(&new_parent.children()[0], &a));
    assert!(StdArc::ptr_eq(&new_parent.children()[1], &b_left));
    assert!(StdArc::ptr_eq(&new_parent.children()[2], &b_new));
    assert!(StdArc::ptr_eq(&new_parent.children()[3], &c));
    assert_eq!(new_parent.head.memory, parent_memory + 8 + PAGE_MEMORY_CHILD);
    assert!(new_parent.head.pos().is_null());

    // the original is untouched but marked removed
    assert_eq!(parent_page.as_node().head.keys, vec![10, 30]);
    assert_eq!(parent_page.as_node().children().len(), 3);
    assert!(storage.has_removed(parent_pos));

    // the split halves point back at the slot both parents share
    for half in [&b_left, &b_new] {
        let p = half.parent().unwrap();
        assert!(StdArc::ptr_eq(&p, &parent_ref));
    }
}

#[test]
fn remove_children_until_empty() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();

    let children: Vec<TestRef> = (0..3).map(|i| evicted_leaf_ref(1, 40 + i * 100)).collect();
    let mut node = NodePage::create(storage, vec![10u64, 20], children, 0);
    node.remove(storage, 1);
    assert_eq!(node.head.keys, vec![10]);
    assert_eq!(node.children().len(), 2);
    node.remove(storage, 1);
    assert_eq!(node.head.keys, Vec::<u64>::new());
    assert_eq!(node.children().len(), 1);
    // the last slot goes while the keys are already empty
    node.remove(storage, 0);
    assert!(node.is_empty());
    assert_eq!(node.head.memory, 0);
}

#[test]
fn recursive_write_back_patches_positions() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();

    let leaf1 = LeafPage::create(
        storage,
        vec![1u64, 2],
        vec![b"a".to_vec(), b"b".to_vec()],
        0,
    );
    let leaf2 = LeafPage::create(
        storage,
        vec![10u64, 20],
        vec![b"c".to_vec(), b"d".to_vec()],
        0,
    );
    let l1 = PageReference::new(Arc::new(Page::Leaf(leaf1)));
    let l2 = PageReference::new(Arc::new(Page::Leaf(leaf2)));
    let root = NodePage::create(storage, vec![10u64], vec![l1.clone(), l2.clone()], 0);

    let mut chunk = Chunk::new(5);
    let mut buf = DataBuffer::new();
    root.write_unsaved_recursive(storage, &mut chunk, &mut buf)
        .unwrap();

    let root_pos = root.head.pos();
    assert!(!root_pos.is_null());
    assert_eq!(root_pos.offset(), 0);
    assert_eq!(chunk.page_count(), 3);
    // both leaves were assigned positions and their caches were released
    for leaf_ref in [&l1, &l2] {
        assert!(!leaf_ref.pos().is_null());
        assert!(leaf_ref.pos().is_leaf());
        assert!(leaf_ref.get().is_none());
        assert!(leaf_ref.pinfo().is_none());
    }

    // the root image on disk carries the patched child positions
    let root_len = u32::from_be_bytes(buf.as_slice()[..4].try_into().unwrap()) as usize;
    let own_ref: TestRef = PageReference::new_evicted(root_pos, false);
    let read = NodePage::read(storage, &own_ref, &buf.as_slice()[..root_len], 5, 0).unwrap();
    assert_eq!(read.children()[0].pos(), l1.pos());
    assert_eq!(read.children()[1].pos(), l2.pos());

    // one of the leaf images round-trips as well
    let l2_offset = l2.pos().offset() as usize;
    let l2_len =
        u32::from_be_bytes(buf.as_slice()[l2_offset..l2_offset + 4].try_into().unwrap()) as usize;
    let l2_read = LeafPage::read(
        storage,
        &l2,
        &buf.as_slice()[l2_offset..l2_offset + l2_len],
        5,
        l2.pos().offset(),
    )
    .unwrap();
    assert_eq!(l2_read.head.keys, vec![10, 20]);
    assert_eq!(l2_read.get(&20), Some(&b"d".to_vec()));

    // a second pass is a no-op, everything already has a position
    let len_before = buf.len();
    root.write_unsaved_recursive(storage, &mut chunk, &mut buf)
        .unwrap();
    assert_eq!(buf.len(), len_before);
}

#[test]
fn corruption_is_detected() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();

    let children: Vec<TestRef> = (0..3).map(|i| evicted_leaf_ref(1, 40 + i * 100)).collect();
    let node = NodePage::create(storage, vec![10u64, 20], children, 0);
    let mut chunk = Chunk::new(9);
    let mut buf = DataBuffer::new();
    node.write(storage, &mut chunk, &mut buf);
    let pristine = buf.as_slice().to_vec();
    let own_ref = || -> TestRef { PageReference::new_evicted(node.head.pos(), false) };

    // sanity: the pristine image reads fine
    NodePage::read(storage, &own_ref(), &pristine, 9, 0).unwrap();

    // flipped check value byte
    let mut corrupt = pristine.clone();
    corrupt[5] ^= 0xff;
    let err = NodePage::read(storage, &own_ref(), &corrupt, 9, 0);
    assert!(matches!(&err, Err(Error::CorruptPage(_))), "{err:?}");

    // page length mismatch
    let mut corrupt = pristine.clone();
    corrupt[3] ^= 0x01;
    let err = NodePage::read(storage, &own_ref(), &corrupt, 9, 0);
    assert!(matches!(&err, Err(Error::CorruptPage(_))), "{err:?}");

    // unknown type byte; the check value does not cover it
    let mut corrupt = pristine.clone();
    corrupt[7] = 0xee;
    let err = NodePage::read(storage, &own_ref(), &corrupt, 9, 0);
    assert!(matches!(&err, Err(Error::UnsupportedFormat(_))), "{err:?}");

    // a page read against the wrong coordinates is rejected too
    let err = NodePage::read(storage, &own_ref(), &pristine, 9, 4096);
    assert!(matches!(&err, Err(Error::CorruptPage(_))), "{err:?}");
}

#[test]
fn compressed_body_round_trip() {
    let _ = env_logger::try_init();
    let _f = test_folder();
    let opts = BTreeOptions {
        compress: true,
        ..Default::default()
    };
    let tree: BTree<BytesType, BytesType> =
        BTree::open(_f.path(), opts.clone(), BytesType, BytesType).unwrap();
    let storage = &**tree.storage();

    let keys: Vec<Vec<u8>> = (0..20u8).map(|i| [i; 40].to_vec()).collect();
    let values: Vec<Vec<u8>> = (0..20u8).map(|i| [i; 100].to_vec()).collect();
    let leaf = LeafPage::create(storage, keys.clone(), values.clone(), 0);
    let leaf_ref = PageReference::new(Arc::new(Page::Leaf(leaf)));

    let mut chunk = Chunk::new(2);
    let mut buf = DataBuffer::new();
    let page = leaf_ref.get().unwrap();
    page.as_leaf().write(storage, &mut chunk, &mut buf);
    // this body is highly repetitive, compression must kick in
    assert!(buf.len() < 20 * 140);

    let read = LeafPage::read(storage, &leaf_ref, buf.as_slice(), 2, 0).unwrap();
    assert_eq!(read.head.keys, keys);
    for (k, v) in keys.iter().zip(&values) {
        assert_eq!(read.get(k), Some(v));
    }
}

#[test]
fn uncompressed_body_is_used_verbatim() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    let storage = &**tree.storage();
    assert!(!storage.opts.compress);

    let leaf = LeafPage::create(storage, vec![7u64], vec![b"x".to_vec()], 0);
    let leaf_ref = PageReference::new(Arc::new(Page::Leaf(leaf)));
    let mut chunk = Chunk::new(2);
    let mut buf = DataBuffer::new();
    leaf_ref.get().unwrap().as_leaf().write(storage, &mut chunk, &mut buf);
    let read = LeafPage::read(storage, &leaf_ref, buf.as_slice(), 2, 0).unwrap();
    assert_eq!(read.head.keys, vec![7]);
    assert_eq!(read.get(&7), Some(&b"x".to_vec()));
}

#[test]
fn eviction_and_rematerialization() {
    let (_f, tree) = test_tree(BTreeOptions {
        page_split_size: 1024,
        ..Default::default()
    });
    for i in 0..500u64 {
        tree.put(i, i.to_be_bytes().to_vec()).unwrap();
    }
    tree.checkpoint().unwrap();

    // simulate the sweep: drop the resident root and its cached form
    let root_ref = tree.storage().root_ref();
    assert!(!root_ref.pos().is_null());
    root_ref.clear_page();
    root_ref.clear_pinfo();
    assert!(root_ref.get().is_none());

    // the traversal re-reads the tree from the chunk files
    for i in 0..500u64 {
        assert_eq!(
            tree.get(&i).unwrap().as_deref(),
            Some(&i.to_be_bytes()[..]),
            "key {i}"
        );
    }

    // evict only the page object; the next read comes from the cached buffer
    let root_ref = tree.storage().root_ref();
    assert!(root_ref.pinfo().is_some());
    root_ref.clear_page();
    for i in (0..500u64).step_by(100) {
        assert_eq!(tree.get(&i).unwrap().as_deref(), Some(&i.to_be_bytes()[..]));
    }
    assert!(root_ref.pinfo().is_some());
}

#[test]
fn gc_sweeps_cold_pages() {
    let (_f, tree) = test_tree(BTreeOptions {
        page_split_size: 1024,
        cache_size: 16 * 1024,
        ..Default::default()
    });
    let mut rng = get_rng();
    for i in 0..2000u64 {
        tree.put(i, very_rand_bytes(&mut rng, 10, 30)).unwrap();
    }
    tree.checkpoint().unwrap();

    // page everything in, then force a sweep
    for i in 0..2000u64 {
        assert!(tree.get(&i).unwrap().is_some());
    }
    let storage = &**tree.storage();
    let before = storage.used_memory();
    storage.gc_if_needed(usize::MAX / 2);
    assert!(storage.used_memory() <= before);
    assert!(storage.used_memory() <= storage.opts.cache_size / 2);

    for i in (0..2000u64).step_by(7) {
        assert!(tree.get(&i).unwrap().is_some(), "key {i}");
    }
}

#[test]
fn tree_random_ops() {
    let _ = env_logger::try_init();
    let mut rng = get_rng();
    let _f = test_folder();
    let opts = BTreeOptions {
        page_split_size: 1024,
        cache_size: 64 * 1024,
        ..Default::default()
    };
    let mut model: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

    {
        let tree = BTree::open(_f.path(), opts.clone(), VarIntType, BytesType).unwrap();
        for _ in 0..3000 {
            let k = rng.gen_range(0..1500u64);
            let v = very_rand_bytes(&mut rng, 4, 40);
            assert_eq!(tree.put(k, v.clone()).unwrap(), model.insert(k, v));
            if rng.gen_ratio(1, 100) {
                tree.checkpoint().unwrap();
            }
            if rng.gen_ratio(1, 10) {
                let k = rng.gen_range(0..1500u64);
                assert_eq!(tree.remove(&k).unwrap(), model.remove(&k));
            }
        }
        for (k, v) in &model {
            assert_eq!(tree.get(k).unwrap().as_ref(), Some(v));
        }
        tree.checkpoint().unwrap();
    }

    {
        let tree = BTree::open(_f.path(), opts.clone(), VarIntType, BytesType).unwrap();
        for (k, v) in &model {
            assert_eq!(tree.get(k).unwrap().as_ref(), Some(v));
        }
        // drain the tree, exercising empty leaf removal and root collapse
        let keys: Vec<u64> = model.keys().copied().collect();
        for k in keys {
            assert_eq!(tree.remove(&k).unwrap(), model.remove(&k));
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.get(&0).unwrap(), None);
        tree.checkpoint().unwrap();
    }

    {
        let tree = BTree::open(_f.path(), opts, VarIntType, BytesType).unwrap();
        assert!(tree.is_empty().unwrap());
    }
}

#[test]
fn reopen_after_checkpoints() {
    let _ = env_logger::try_init();
    let _f = test_folder();
    let opts = BTreeOptions {
        page_split_size: 1024,
        ..Default::default()
    };

    {
        let tree = BTree::open(_f.path(), opts.clone(), VarIntType, BytesType).unwrap();
        for i in 0..300u64 {
            tree.put(i, vec![1; 16]).unwrap();
        }
        tree.checkpoint().unwrap();
        for i in 300..600u64 {
            tree.put(i, vec![2; 16]).unwrap();
        }
        // overwrite a few persisted keys so both chunks stay relevant
        for i in 0..50u64 {
            tree.put(i, vec![3; 16]).unwrap();
        }
        tree.checkpoint().unwrap();
        // checkpointing a clean tree writes no new chunk
        tree.checkpoint().unwrap();
    }

    let tree = BTree::open(_f.path(), opts, VarIntType, BytesType).unwrap();
    for i in 0..50u64 {
        assert_eq!(tree.get(&i).unwrap(), Some(vec![3; 16]));
    }
    for i in 50..300u64 {
        assert_eq!(tree.get(&i).unwrap(), Some(vec![1; 16]));
    }
    for i in 300..600u64 {
        assert_eq!(tree.get(&i).unwrap(), Some(vec![2; 16]));
    }
}

#[test]
fn pretty_print_exercises_the_read_path() {
    let (_f, tree) = test_tree(BTreeOptions {
        page_split_size: 1024,
        ..Default::default()
    });
    for i in 0..400u64 {
        tree.put(i, vec![0; 24]).unwrap();
    }
    tree.checkpoint().unwrap();

    let root_ref = tree.storage().root_ref();
    root_ref.clear_page();
    root_ref.clear_pinfo();

    // without off-line reads the dump stops at the missing root
    let shallow = tree.pretty(false).unwrap();
    assert!(shallow.contains("off-line"), "{shallow}");

    // with off-line reads it pages in the whole tree
    let deep = tree.pretty(true).unwrap();
    assert!(deep.contains("400 keys"), "{deep}");
    assert!(!deep.contains("off-line"), "{deep}");
}

#[test]
fn concurrent_readers_with_eviction() {
    let (_f, tree) = test_tree(BTreeOptions {
        page_split_size: 1024,
        cache_size: 16 * 1024,
        ..Default::default()
    });
    for i in 0..1000u64 {
        tree.put(i, i.to_be_bytes().to_vec()).unwrap();
    }
    tree.checkpoint().unwrap();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let tree = &tree;
            s.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(t);
                for _ in 0..2000 {
                    let k = rng.gen_range(0..1000u64);
                    assert_eq!(
                        tree.get(&k).unwrap().as_deref(),
                        Some(&k.to_be_bytes()[..])
                    );
                }
            });
        }
        let tree = &tree;
        s.spawn(move || {
            for _ in 0..50 {
                tree.storage().gc_if_needed(usize::MAX / 2);
                std::thread::yield_now();
            }
        });
    });
}

#[test]
fn large_values_use_the_large_size_class() {
    let (_f, tree) = test_tree(BTreeOptions {
        // a single huge leaf entry must still round-trip
        page_split_size: 4 * 1024 * 1024,
        ..Default::default()
    });
    let big = vec![0xabu8; (1 << 20) + 100];
    tree.put(1, big.clone()).unwrap();
    tree.checkpoint().unwrap();

    let root_ref = tree.storage().root_ref();
    root_ref.clear_page();
    root_ref.clear_pinfo();
    assert_eq!(tree.get(&1).unwrap(), Some(big));
}

#[test]
fn validation_of_options() {
    let _ = env_logger::try_init();
    let _f = test_folder();
    let opts = BTreeOptions {
        page_split_size: 16,
        ..Default::default()
    };
    let err = BTree::open(_f.path(), opts, VarIntType, BytesType);
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn read_only_mode_rejects_writes() {
    let _ = env_logger::try_init();
    let _f = test_folder();
    let opts = BTreeOptions {
        page_split_size: 1024,
        ..Default::default()
    };
    {
        let tree = BTree::open(_f.path(), opts.clone(), VarIntType, BytesType).unwrap();
        for i in 0..100u64 {
            tree.put(i, vec![7; 8]).unwrap();
        }
        tree.checkpoint().unwrap();
    }

    let mut chunks_before: Vec<_> = std::fs::read_dir(_f.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    chunks_before.sort();

    let ro_opts = BTreeOptions {
        read_only: true,
        ..opts
    };
    let tree = BTree::open(_f.path(), ro_opts.clone(), VarIntType, BytesType).unwrap();
    for i in 0..100u64 {
        assert_eq!(tree.get(&i).unwrap(), Some(vec![7; 8]));
    }
    assert!(matches!(
        tree.put(0, Vec::new()).unwrap_err(),
        Error::ReadOnly
    ));
    assert!(matches!(tree.remove(&0).unwrap_err(), Error::ReadOnly));
    assert!(matches!(tree.checkpoint().unwrap_err(), Error::ReadOnly));

    // nothing in the directory was created, modified or deleted
    let mut chunks_after: Vec<_> = std::fs::read_dir(_f.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    chunks_after.sort();
    assert_eq!(chunks_before, chunks_after);

    // a read only open of a missing directory is refused
    let missing = _f.path().join("missing");
    let err = BTree::open(&missing, ro_opts, VarIntType, BytesType);
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn removed_pages_are_marked_for_compaction() {
    let (_f, tree) = test_tree(BTreeOptions::default());
    tree.put(1, b"one".to_vec()).unwrap();
    tree.checkpoint().unwrap();
    let persisted_root = tree.storage().root_ref().pos();
    assert!(!persisted_root.is_null());

    // the copy-on-write update supersedes the persisted image
    tree.put(1, b"two".to_vec()).unwrap();
    assert!(tree.storage().has_removed(persisted_root));
    assert_eq!(tree.get(&1).unwrap().as_deref(), Some(&b"two"[..]));
}
