use aspen_btree::{BTree, BTreeOptions, BytesType, VarIntType};
use tempfile::tempdir;

fn main() {
    let sample_data: [(u64, &[u8]); 3] = [(1, b"qux"), (2, b"bar"), (3, b"quux")];
    let _dir = tempdir().unwrap();

    let tree = BTree::open(_dir.path(), BTreeOptions::default(), VarIntType, BytesType).unwrap();
    for (k, v) in sample_data {
        tree.put(k, v.to_vec()).unwrap();
    }
    // reads see the in-memory state right away
    let maybe_value = tree.get(&2).unwrap();
    assert_eq!(maybe_value.as_deref(), Some(&b"bar"[..]));

    // checkpoint to persist the changes into a chunk file
    tree.checkpoint().unwrap();
    drop(tree);

    // a fresh open reads the tree back from the chunks
    let tree = BTree::open(_dir.path(), BTreeOptions::default(), VarIntType, BytesType).unwrap();
    for (k, v) in sample_data {
        assert_eq!(tree.get(&k).unwrap().as_deref(), Some(v));
    }
    println!("{}", tree.pretty(true).unwrap());
}
