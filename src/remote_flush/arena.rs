//! Serializable block allocator.
//!
//! A frozen memtable's backing storage needs to travel to a memory node and
//! back to a worker such that every address handed out during allocation
//! still resolves to the same bytes afterwards. Raw pointers cannot survive
//! that trip, so this arena hands out `(block_index, offset, len)` triples
//! instead: as long as the block list is reconstructed in the same order,
//! every address recorded before `pack` resolves correctly after `unpack`.
//! There is no pointer-fixup pass.

use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Default size of a freshly allocated regular block (4 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Largest single allocation the arena will service (2 GiB). Anything
/// larger is rejected outright rather than silently truncated.
pub const MAX_BLOCK_SIZE: usize = 2usize << 30;

/// Errors raised by [`SerializableArena`].
#[derive(Debug, Error)]
pub enum ArenaError {
    /// A single allocation request exceeded [`MAX_BLOCK_SIZE`].
    #[error("allocation of {requested} bytes exceeds the {max} byte limit")]
    AllocationTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// An [`ArenaAddr`] referenced a block index or range outside the arena.
    #[error("address out of bounds: block {block_index}, offset {offset}, len {len}")]
    OutOfBounds {
        /// Block index that was referenced.
        block_index: u32,
        /// Offset within that block.
        offset: u32,
        /// Length requested from that offset.
        len: u32,
    },

    /// Underlying binary codec failure while packing or unpacking.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// A stable address into a [`SerializableArena`], valid across `pack`/`unpack`.
///
/// Replaces the raw pointer a native allocator would return: the block list
/// order is the only thing that must be preserved, not any particular
/// memory location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaAddr {
    /// Index into the arena's block list.
    pub block_index: u32,
    /// Byte offset within that block.
    pub offset: u32,
    /// Length of the allocation in bytes.
    pub len: u32,
}

struct Block {
    data: Vec<u8>,
    irregular: bool,
}

/// Append-only allocator whose block list can be marshaled to bytes and
/// reconstructed elsewhere with equivalent addressing.
///
/// Allocation strategy mirrors a conventional arena: requests that fit in
/// the active block are bump-allocated; requests too large for a quarter of
/// the block size get their own irregular block; everything else starts a
/// fresh regular block.
pub struct SerializableArena {
    block_size: usize,
    blocks: Vec<Block>,
    active_block: Option<usize>,
    cursor: usize,
    blocks_memory: usize,
    irregular_memory: usize,
    irregular_block_num: usize,
}

impl SerializableArena {
    /// Creates an empty arena using the default block size.
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Creates an empty arena with an explicit regular block size.
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            blocks: Vec::new(),
            active_block: None,
            cursor: 0,
            blocks_memory: 0,
            irregular_memory: 0,
            irregular_block_num: 0,
        }
    }

    /// Allocates `n` bytes and returns their address. The returned region is
    /// zero-filled; use [`SerializableArena::write`] to populate it in one
    /// step, or [`SerializableArena::write_at`] to fill an address obtained
    /// earlier.
    pub fn allocate(&mut self, n: usize) -> Result<ArenaAddr, ArenaError> {
        self.allocate_aligned(n, 1)
    }

    /// Allocates `n` bytes aligned to `align` bytes within the active block.
    ///
    /// `align` must be a power of two; callers that don't care about
    /// alignment should use [`SerializableArena::allocate`].
    pub fn allocate_aligned(&mut self, n: usize, align: usize) -> Result<ArenaAddr, ArenaError> {
        if n > MAX_BLOCK_SIZE {
            return Err(ArenaError::AllocationTooLarge {
                requested: n,
                max: MAX_BLOCK_SIZE,
            });
        }

        if n > self.block_size / 4 {
            return Ok(self.allocate_irregular(n));
        }

        if let Some(idx) = self.active_block {
            let align = align.max(1);
            let padded = self.cursor.div_ceil(align) * align;
            let block_len = self.blocks[idx].data.len();
            if padded + n <= block_len {
                self.cursor = padded + n;
                return Ok(ArenaAddr {
                    block_index: idx as u32,
                    offset: padded as u32,
                    len: n as u32,
                });
            }
        }

        Ok(self.allocate_new_block(n))
    }

    fn allocate_new_block(&mut self, n: usize) -> ArenaAddr {
        let data = vec![0u8; self.block_size];
        self.blocks_memory += data.len();
        self.blocks.push(Block {
            data,
            irregular: false,
        });
        let idx = self.blocks.len() - 1;
        self.active_block = Some(idx);
        self.cursor = n;
        ArenaAddr {
            block_index: idx as u32,
            offset: 0,
            len: n as u32,
        }
    }

    fn allocate_irregular(&mut self, n: usize) -> ArenaAddr {
        let data = vec![0u8; n];
        self.irregular_memory += data.len();
        self.irregular_block_num += 1;
        self.blocks.push(Block {
            data,
            irregular: true,
        });
        let idx = self.blocks.len() - 1;
        ArenaAddr {
            block_index: idx as u32,
            offset: 0,
            len: n as u32,
        }
    }

    /// Allocates `data.len()` bytes and copies `data` into them in one step.
    pub fn write(&mut self, data: &[u8]) -> Result<ArenaAddr, ArenaError> {
        let addr = self.allocate(data.len())?;
        self.write_at(&addr, data)?;
        Ok(addr)
    }

    /// Overwrites the bytes at a previously returned address.
    pub fn write_at(&mut self, addr: &ArenaAddr, data: &[u8]) -> Result<(), ArenaError> {
        let slice = self.slice_mut(addr)?;
        slice.copy_from_slice(data);
        Ok(())
    }

    /// Reads the bytes at a previously returned address.
    pub fn read(&self, addr: &ArenaAddr) -> Result<&[u8], ArenaError> {
        let block = self
            .blocks
            .get(addr.block_index as usize)
            .ok_or(ArenaError::OutOfBounds {
                block_index: addr.block_index,
                offset: addr.offset,
                len: addr.len,
            })?;
        let start = addr.offset as usize;
        let end = start + addr.len as usize;
        block
            .data
            .get(start..end)
            .ok_or(ArenaError::OutOfBounds {
                block_index: addr.block_index,
                offset: addr.offset,
                len: addr.len,
            })
    }

    fn slice_mut(&mut self, addr: &ArenaAddr) -> Result<&mut [u8], ArenaError> {
        let block = self
            .blocks
            .get_mut(addr.block_index as usize)
            .ok_or(ArenaError::OutOfBounds {
                block_index: addr.block_index,
                offset: addr.offset,
                len: addr.len,
            })?;
        let start = addr.offset as usize;
        let end = start + addr.len as usize;
        block
            .data
            .get_mut(start..end)
            .ok_or(ArenaError::OutOfBounds {
                block_index: addr.block_index,
                offset: addr.offset,
                len: addr.len,
            })
    }

    /// Total bytes backing this arena (regular blocks plus irregular blocks).
    pub fn approximate_memory_usage(&self) -> usize {
        self.blocks_memory + self.irregular_memory
    }

    /// Number of irregular (oversized, single-allocation) blocks.
    pub fn irregular_block_num(&self) -> usize {
        self.irregular_block_num
    }

    /// Number of blocks of any kind.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for SerializableArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Encode for SerializableArena {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.block_size as u64).encode_to(buf)?;
        (self.blocks.len() as u32).encode_to(buf)?;
        for block in &self.blocks {
            block.irregular.encode_to(buf)?;
            block.data.encode_to(buf)?;
        }
        match self.active_block {
            Some(idx) => Some(idx as u32).encode_to(buf)?,
            None => Option::<u32>::None.encode_to(buf)?,
        }
        (self.cursor as u64).encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SerializableArena {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (block_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (block_count, n) = u32::decode_from(&buf[off..])?;
        off += n;

        let mut blocks = Vec::with_capacity(block_count as usize);
        let mut blocks_memory = 0usize;
        let mut irregular_memory = 0usize;
        let mut irregular_block_num = 0usize;

        for _ in 0..block_count {
            let (irregular, n) = bool::decode_from(&buf[off..])?;
            off += n;
            let (data, n) = Vec::<u8>::decode_from(&buf[off..])?;
            off += n;
            if irregular {
                irregular_memory += data.len();
                irregular_block_num += 1;
            } else {
                blocks_memory += data.len();
            }
            blocks.push(Block { data, irregular });
        }

        let (active_block, n) = Option::<u32>::decode_from(&buf[off..])?;
        off += n;
        let (cursor, n) = u64::decode_from(&buf[off..])?;
        off += n;

        Ok((
            Self {
                block_size: block_size as usize,
                blocks,
                active_block: active_block.map(|v| v as usize),
                cursor: cursor as usize,
                blocks_memory,
                irregular_memory,
                irregular_block_num,
            },
            off,
        ))
    }
}

impl SerializableArena {
    /// Serializes the full arena image (block list, cursor, active block)
    /// into `buf` so it can be shipped to a memory node or worker.
    pub fn pack(&self) -> Result<Vec<u8>, ArenaError> {
        Ok(encoding::encode_to_vec(self)?)
    }

    /// Reconstructs an arena from the bytes produced by [`SerializableArena::pack`].
    ///
    /// Every [`ArenaAddr`] recorded against the source arena resolves to the
    /// same bytes against the result.
    pub fn unpack(buf: &[u8]) -> Result<Self, ArenaError> {
        let (arena, _) = encoding::decode_from_slice::<Self>(buf)?;
        Ok(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_within_one_block() {
        let mut arena = SerializableArena::with_block_size(64);
        let a = arena.write(b"hello").unwrap();
        let b = arena.write(b"world!").unwrap();
        assert_eq!(a.block_index, b.block_index);
        assert_eq!(arena.read(&a).unwrap(), b"hello");
        assert_eq!(arena.read(&b).unwrap(), b"world!");
    }

    #[test]
    fn overflow_starts_a_new_block() {
        let mut arena = SerializableArena::with_block_size(8);
        let a = arena.write(b"1234567").unwrap();
        let b = arena.write(b"abcdefg").unwrap();
        assert_ne!(a.block_index, b.block_index);
    }

    #[test]
    fn oversized_allocation_is_irregular() {
        let mut arena = SerializableArena::with_block_size(16);
        let big = vec![7u8; 64];
        let addr = arena.write(&big).unwrap();
        assert_eq!(arena.irregular_block_num(), 1);
        assert_eq!(arena.read(&addr).unwrap(), big.as_slice());
    }

    #[test]
    fn allocation_above_limit_is_rejected() {
        let mut arena = SerializableArena::new();
        let err = arena.allocate(MAX_BLOCK_SIZE + 1).unwrap_err();
        assert!(matches!(err, ArenaError::AllocationTooLarge { .. }));
    }

    #[test]
    fn pack_unpack_round_trips_addresses_and_usage() {
        let mut arena = SerializableArena::with_block_size(32);
        let mut addrs = Vec::new();
        for i in 0..20u8 {
            let payload = vec![i; (i as usize % 5) + 1];
            addrs.push((arena.write(&payload).unwrap(), payload));
        }
        let usage_before = arena.approximate_memory_usage();

        let packed = arena.pack().unwrap();
        let restored = SerializableArena::unpack(&packed).unwrap();

        assert_eq!(restored.approximate_memory_usage(), usage_before);
        for (addr, payload) in &addrs {
            assert_eq!(restored.read(addr).unwrap(), payload.as_slice());
        }
    }

    #[test]
    fn out_of_bounds_address_is_rejected() {
        let arena = SerializableArena::new();
        let bogus = ArenaAddr {
            block_index: 0,
            offset: 0,
            len: 1,
        };
        assert!(matches!(
            arena.read(&bogus),
            Err(ArenaError::OutOfBounds { .. })
        ));
    }
}
