use std::fmt;

use crate::{
    buffer::{ByteReader, DataBuffer},
    error::{corrupt_page, Error},
};

/// Codec for the keys or values stored in tree pages.
///
/// Implementations must be deterministic and lossless: `read_values` applied
/// to the output of `write_values` yields equal items, independent of the
/// process that wrote them.
pub trait DataType: Send + Sync + 'static {
    type Item: Clone + fmt::Debug + Send + Sync + 'static;

    /// Estimated in-memory footprint of one item in bytes. Feeds the page
    /// memory estimate used by the split and eviction heuristics; it only
    /// needs to be monotone with the item size, not exact.
    fn memory(&self, item: &Self::Item) -> usize;

    fn write_values(&self, buf: &mut DataBuffer, values: &[Self::Item]);

    fn read_values(&self, reader: &mut ByteReader<'_>, len: usize)
        -> Result<Vec<Self::Item>, Error>;
}

/// A [DataType] whose items are totally ordered, usable for keys.
pub trait KeyType: DataType<Item: Ord> {}

impl<T: DataType> KeyType for T where T::Item: Ord {}

/// `u64` items in var-long coding.
#[derive(Debug, Default, Clone, Copy)]
pub struct VarIntType;

impl DataType for VarIntType {
    type Item = u64;

    fn memory(&self, _item: &u64) -> usize {
        8
    }

    fn write_values(&self, buf: &mut DataBuffer, values: &[u64]) {
        for &v in values {
            buf.put_var_u64(v);
        }
    }

    fn read_values(&self, reader: &mut ByteReader<'_>, len: usize) -> Result<Vec<u64>, Error> {
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(reader.get_var_u64()?);
        }
        Ok(values)
    }
}

/// Length-prefixed byte strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesType;

/// Per item allocation overhead estimate.
const BYTES_ITEM_OVERHEAD: usize = 24;

impl DataType for BytesType {
    type Item = Vec<u8>;

    fn memory(&self, item: &Vec<u8>) -> usize {
        BYTES_ITEM_OVERHEAD + item.len()
    }

    fn write_values(&self, buf: &mut DataBuffer, values: &[Vec<u8>]) {
        for v in values {
            buf.put_var_u32(v.len() as u32);
            buf.put_slice(v);
        }
    }

    fn read_values(&self, reader: &mut ByteReader<'_>, len: usize) -> Result<Vec<Vec<u8>>, Error> {
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            let item_len = reader.get_var_u32()? as usize;
            if item_len > reader.remaining() {
                return Err(corrupt_page!(
                    "byte item length {item_len} exceeds remaining body ({})",
                    reader.remaining()
                ));
            }
            values.push(reader.get_slice(item_len)?.to_vec());
        }
        Ok(values)
    }
}
