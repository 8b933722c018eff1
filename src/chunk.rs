use std::mem::size_of;

use zerocopy::{
    byteorder::{BigEndian, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::{
    error::{corrupt_page, unsupported_format, Error},
    pos::PagePos,
    utils::EscapedBytes,
    HashMap,
};

pub(crate) const CHUNK_MAGIC: [u8; 8] = *b"ASPNCHNK";
pub(crate) const CHUNK_FORMAT_VERSION: u32 = 1;
pub(crate) const CHUNK_HEADER_LEN: usize = size_of::<ChunkHeader>();

/// Fixed header at the base of every chunk file. All page offsets count from
/// the chunk base, so the header length is part of the address space.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct ChunkHeader {
    pub magic: [u8; 8],
    pub version: U32<BigEndian>,
    pub id: U32<BigEndian>,
    pub page_count: U32<BigEndian>,
    pub _reserved: U32<BigEndian>,
    /// Position of the tree root written by this chunk's checkpoint.
    pub root_pos: U64<BigEndian>,
    /// xxh3 of all preceding header bytes.
    pub checksum: U64<BigEndian>,
}

impl ChunkHeader {
    pub fn encode(id: u32, page_count: u32, root_pos: PagePos) -> [u8; CHUNK_HEADER_LEN] {
        let mut header = ChunkHeader {
            magic: CHUNK_MAGIC,
            version: U32::new(CHUNK_FORMAT_VERSION),
            id: U32::new(id),
            page_count: U32::new(page_count),
            _reserved: U32::new(0),
            root_pos: U64::new(root_pos.raw()),
            checksum: U64::new(0),
        };
        let checksum = xxhash_rust::xxh3::xxh3_64(&header.as_bytes()[..CHUNK_HEADER_LEN - 8]);
        header.checksum = U64::new(checksum);
        let mut raw = [0u8; CHUNK_HEADER_LEN];
        raw.copy_from_slice(header.as_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<ChunkHeader, Error> {
        if raw.len() < CHUNK_HEADER_LEN {
            return Err(corrupt_page!(
                "chunk file too short for a header ({} bytes)",
                raw.len()
            ));
        }
        let header = ChunkHeader::read_from_bytes(&raw[..CHUNK_HEADER_LEN])
            .expect("header length was just checked");
        if header.magic != CHUNK_MAGIC {
            return Err(corrupt_page!(
                "bad chunk magic {}",
                EscapedBytes(&header.magic)
            ));
        }
        if header.version.get() != CHUNK_FORMAT_VERSION {
            return Err(unsupported_format!(
                "chunk format version {} is not supported",
                header.version.get()
            ));
        }
        let checksum = xxhash_rust::xxh3::xxh3_64(&raw[..CHUNK_HEADER_LEN - 8]);
        if header.checksum.get() != checksum {
            return Err(corrupt_page!(
                "chunk header checksum mismatch in chunk {}",
                header.id.get()
            ));
        }
        Ok(header)
    }
}

/// Build-side bookkeeping of a chunk being assembled by a checkpoint:
/// assigns positions to appended pages and remembers their extents.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub id: u32,
    /// Offset from the chunk base to length of every registered page.
    pub pages: HashMap<u32, u32>,
}

impl Chunk {
    pub fn new(id: u32) -> Chunk {
        Chunk {
            id,
            pages: HashMap::new(),
        }
    }

    /// Registers a page just serialized at `start` and hands out its position.
    pub fn register_page(&mut self, start: u32, page_length: u32, leaf: bool) -> PagePos {
        let pos = PagePos::new(self.id, start, page_length, leaf);
        let prev = self.pages.insert(start, page_length);
        debug_assert!(prev.is_none(), "two pages registered at offset {start}");
        pos
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }
}
