//! Persists a [`Bitmap`] onto a [`BlockStorage`] device.
//!
//! # Layout
//! =====================================================
//! | Header | Bitmap payload (zero padded to a block) |
//! =====================================================
//!
//! The header occupies the start of the first block, the remainder of that block
//! is zero. The payload is the bitmap's packed bytes, exactly as returned by
//! [`Bitmap::to_bytes`], starting on the next block.
use crate::bitmap::Bitmap;
use crate::io::{BlockNumber, BlockStorage};

use log::{debug, warn};
use std::mem::size_of;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Identifies a stored bitmap, "BMAP".
pub const MAGIC: u32 = 0x424D_4150;
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = size_of::<BitmapHeader>();

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("device i/o failed")]
    Io(#[from] std::io::Error),
    #[error("invalid bitmap magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported bitmap format version {0}")]
    UnsupportedVersion(u32),
    #[error("bitmap needs {blocks} blocks but only {available} are available")]
    TooLarge { blocks: u64, available: u64 },
    #[error("bitmap header records {expected} free bits, payload has {actual}")]
    Corrupt { expected: u64, actual: u64 },
    #[error("block size {block_size} cannot hold the bitmap header")]
    HeaderDoesNotFit { block_size: usize },
}

/// On-disk header. All fields are little endian.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Debug, Clone, Copy)]
pub struct BitmapHeader {
    magic: U32<LittleEndian>,
    version: U32<LittleEndian>,
    /// Size of the payload in bytes.
    byte_len: U64<LittleEndian>,
    /// Free bits in the payload when it was written, checked again on load.
    free_bits: U64<LittleEndian>,
}

impl BitmapHeader {
    pub fn new(bitmap: &Bitmap) -> Self {
        Self {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            byte_len: U64::new(bitmap.len_bytes() as u64),
            free_bits: U64::new(bitmap.count_free() as u64),
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.byte_len.get()
    }

    pub fn free_bits(&self) -> u64 {
        self.free_bits.get()
    }
}

/// Number of blocks a bitmap of `byte_len` bytes occupies, header included.
/// Returns `None` for a zero block size or a count that does not fit a `usize`.
pub fn blocks_needed(byte_len: usize, block_size: usize) -> Option<usize> {
    let full = byte_len.checked_div(block_size)?;
    let partial = usize::from(byte_len % block_size != 0);
    full.checked_add(partial)?.checked_add(1)
}

/// Writes `bitmap` starting at `start` and syncs the device. Returns the number
/// of blocks written.
pub fn write_bitmap<T: BlockStorage>(
    dev: &mut T,
    start: BlockNumber,
    bitmap: &Bitmap,
) -> Result<usize, StoreError> {
    let block_size = check_block_size(dev)?;
    let blocks = blocks_needed(bitmap.len_bytes(), block_size).ok_or(StoreError::TooLarge {
        blocks: u64::MAX,
        available: dev.block_count() as u64,
    })?;
    let available = dev.block_count().saturating_sub(start);
    if blocks > available {
        return Err(StoreError::TooLarge {
            blocks: blocks as u64,
            available: available as u64,
        });
    }

    // Reusable buffer for writing blocks.
    let mut block_buffer = vec![0; block_size];
    let header = BitmapHeader::new(bitmap);
    block_buffer[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    dev.write_block(start, &block_buffer)?;

    let payload = bitmap.to_bytes();
    for (i, chunk) in payload.chunks(block_size).enumerate() {
        block_buffer.iter_mut().for_each(|b| *b = 0);
        block_buffer[..chunk.len()].copy_from_slice(chunk);
        dev.write_block(start + 1 + i, &block_buffer)?;
    }
    dev.sync_disk()?;

    debug!(
        "wrote bitmap of {} bytes ({} free bits) to blocks {}..{}",
        bitmap.len_bytes(),
        header.free_bits(),
        start,
        start + blocks
    );
    Ok(blocks)
}

/// Reads a bitmap previously stored at `start` with [`write_bitmap`].
///
/// # Errors
///
/// Fails if the header is not a supported bitmap header, if the payload would run
/// past the end of the device, or if the payload's free bit count disagrees with
/// the header.
pub fn read_bitmap<T: BlockStorage>(dev: &mut T, start: BlockNumber) -> Result<Bitmap, StoreError> {
    let block_size = check_block_size(dev)?;
    let mut block_buffer = vec![0; block_size];
    dev.read_block(start, &mut block_buffer)?;

    let header = BitmapHeader::read_from_prefix(&block_buffer[..])
        .ok_or(StoreError::HeaderDoesNotFit { block_size })?;
    if header.magic.get() != MAGIC {
        warn!("block {} does not hold a bitmap header", start);
        return Err(StoreError::BadMagic(header.magic.get()));
    }
    if header.version.get() != VERSION {
        return Err(StoreError::UnsupportedVersion(header.version.get()));
    }

    let byte_len = header.byte_len();
    let block_len = block_size as u64;
    let payload_blocks = byte_len / block_len + u64::from(byte_len % block_len != 0);
    let available = dev.block_count().saturating_sub(start) as u64;
    if 1 + payload_blocks > available {
        warn!(
            "bitmap at block {} claims {} bytes, more than the device holds",
            start, byte_len
        );
        return Err(StoreError::TooLarge {
            blocks: 1 + payload_blocks,
            available,
        });
    }

    // Bounded by the device size checked above.
    let byte_len = byte_len as usize;
    let mut payload = Vec::with_capacity(byte_len);
    for i in 0..payload_blocks as usize {
        dev.read_block(start + 1 + i, &mut block_buffer)?;
        let take = (byte_len - payload.len()).min(block_size);
        payload.extend_from_slice(&block_buffer[..take]);
    }

    let bitmap = Bitmap::from_bytes(&payload);
    let actual = bitmap.count_free() as u64;
    if actual != header.free_bits() {
        warn!("bitmap at block {} is inconsistent with its header", start);
        return Err(StoreError::Corrupt {
            expected: header.free_bits(),
            actual,
        });
    }

    debug!(
        "read bitmap of {} bytes ({} free bits) from block {}",
        byte_len, actual, start
    );
    Ok(bitmap)
}

fn check_block_size<T: BlockStorage>(dev: &T) -> Result<usize, StoreError> {
    let block_size = dev.block_size();
    if block_size < HEADER_SIZE {
        return Err(StoreError::HeaderDoesNotFit { block_size });
    }
    Ok(block_size)
}
