//! # Aspen
//!
//! An append-only, copy-on-write B-Tree page store.
//!
//! Trees are persisted as fixed-format pages appended into chunk files. Inner
//! nodes hold sorted separator keys plus `keys + 1` child references; leaves
//! hold the key/value pairs. Structural edits never mutate a persisted page,
//! they build fresh pages and publish them with a single reference swap, so
//! readers traverse published subtrees concurrently without locks on the tree
//! structure itself.
//!
//! Child references are eviction aware: the in-memory page object of any
//! persisted page may be dropped under memory pressure and is transparently
//! rebuilt from its cached serialized form or from the chunk file on the next
//! traversal.
//!
//! ```no_run
//! use aspen_btree::{BTree, BTreeOptions, BytesType, VarIntType};
//!
//! let tree = BTree::open("/tmp/aspen", BTreeOptions::default(), VarIntType, BytesType)?;
//! tree.put(42, b"value".to_vec())?;
//! assert_eq!(tree.get(&42)?.as_deref(), Some(&b"value"[..]));
//! tree.checkpoint()?;
//! # Ok::<(), aspen_btree::Error>(())
//! ```

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod buffer;
mod chunk;
mod datatype;
mod error;
mod leaf;
mod map;
mod node;
mod options;
mod page;
mod pageref;
mod pos;
mod storage;
mod utils;

#[cfg(test)]
mod tests;

pub use crate::{
    buffer::{ByteReader, DataBuffer},
    datatype::{BytesType, DataType, KeyType, VarIntType},
    error::Error,
    map::BTree,
    options::BTreeOptions,
};

pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V>;
