use crate::error::{error_validation, Error};

/// Options for a [BTree](crate::BTree) store.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct BTreeOptions {
    /// Memory estimate threshold above which a page is split.
    ///
    /// The estimate is the sum of the per item codec estimates plus a fixed
    /// amount per child reference, so the serialized page is usually smaller
    /// than this number.
    ///
    /// Default: `16 KB`
    pub page_split_size: usize,
    /// Budget for resident page objects. When the estimate of all resident
    /// pages exceeds it, the coldest persisted pages are evicted (their
    /// serialized form is kept around first, dropped under further pressure)
    /// and are transparently re-read on the next traversal.
    ///
    /// Default: `32 MB`
    pub cache_size: usize,
    /// Whether to LZ4 compress page bodies. The type byte of each page
    /// records whether its body was compressed, so files written with either
    /// setting can always be read back.
    ///
    /// Bodies that are small or that do not shrink are stored verbatim even
    /// when this is enabled.
    ///
    /// Default: `false`
    pub compress: bool,
    /// Whether to verify page check values when reading pages back. Writing
    /// is not affected, check values are always computed and stored.
    ///
    /// Default: `true`
    pub use_checksums: bool,
    /// Opens the tree read only: `put`, `remove` and `checkpoint` are
    /// refused with [Error::ReadOnly](crate::Error::ReadOnly) and nothing in
    /// the directory is created, modified or deleted.
    ///
    /// Default: `false`
    pub read_only: bool,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            page_split_size: 16 * 1024,
            cache_size: 32 * 1024 * 1024,
            compress: false,
            use_checksums: true,
            read_only: false,
        }
    }
}

impl BTreeOptions {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.page_split_size < 512 {
            return Err(error_validation!(
                "page_split_size must be at least 512 bytes, got {}",
                self.page_split_size
            ));
        }
        if self.cache_size < self.page_split_size {
            return Err(error_validation!(
                "cache_size ({}) must not be smaller than page_split_size ({})",
                self.cache_size,
                self.page_split_size
            ));
        }
        Ok(())
    }
}
