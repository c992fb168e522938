use crate::io::block::{BlockNumber, BlockStorage};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};

use log::trace;

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for image building and testing.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    block_size: usize,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "block {} out of range for device of {} blocks",
                    blocknr, self.block_count
                ),
            ));
        }
        Ok(())
    }

    fn offset(&self, blocknr: BlockNumber) -> std::io::Result<u64> {
        blocknr
            .checked_mul(self.block_size)
            .map(|offset| offset as u64)
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "block offset overflows"))
    }
}

impl BlockStorage for FileBlockEmulator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() < self.block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }

        trace!("reading block {}", blocknr);
        let offset = self.offset(blocknr)?;
        self.fd.seek(SeekFrom::Start(offset))?;
        // Limit the read to just the block specified.
        self.fd.read_exact(&mut buf[..self.block_size])
    }

    /// This method truncates writes that exceed the block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;

        trace!("writing {} bytes to block {}", buf.len().min(self.block_size), blocknr);
        let offset = self.offset(blocknr)?;
        self.fd.seek(SeekFrom::Start(offset))?;
        let max = buf.len().min(self.block_size);
        self.fd.write_all(&buf[..max])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_size: usize,
    block_count: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            block_size: DEFAULT_BLOCK_SIZE,
            // A better default here might be the size of the file rounded down
            // to the nearest block.
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of blocks in the device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Sets the size of each block in bytes.
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Whether `build` zeroes every block. Turn this off to reopen a device that
    /// already holds data.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 || self.block_size == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "device needs a non-zero block count and block size",
            ));
        }
        let len = self
            .block_count
            .checked_mul(self.block_size)
            .map(|len| len as u64)
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "device size overflows"))?;

        if self.clear_medium {
            self.zero_blocks()?;
        } else {
            // Short files are padded so every block can be read back.
            if self.fd.metadata()?.len() < len {
                self.fd.set_len(len)?;
            }
        }

        Ok(FileBlockEmulator {
            fd: self.fd,
            block_size: self.block_size,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let zeros = vec![0x00; self.block_size];
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        for _ in 0..self.block_count {
            bfd.write_all(&zeros)?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(blocks: usize) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = device(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn custom_block_size_is_respected() {
        let fs_block = tempfile::tempfile().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(3)
            .with_block_size(512)
            .build()
            .unwrap();

        assert_eq!(disk_emu.block_size(), 512);
        assert_eq!(disk_emu.block_count(), 3);
        disk_emu.write_block(2, &[0xAB; 512]).unwrap();
        let mut read_block = vec![0x00; 512];
        disk_emu.read_block(2, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0xAB; 512]);
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 3 * 512);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk_emu = device(4);

        // Allocate a block with a non-zero character.
        disk_emu.write_block(2, &[0x55; 4096]).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_block = vec![0x00; 4096];
        // Read a different block.
        disk_emu.read_block(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);

        // Read the block with data.
        disk_emu.read_block(2, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x55; 4096]);
    }

    #[test]
    fn block_beyond_range_returns_error() {
        let mut disk_emu = device(1);

        let err = disk_emu.write_block(1, &[0x55; 4096]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let mut read_block = vec![0x00; 4096];
        let err = disk_emu.read_block(1, &mut read_block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn short_read_buffer_returns_error() {
        let mut disk_emu = device(1);

        let mut read_block = vec![0x00; 100];
        let err = disk_emu.read_block(0, &mut read_block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn oversized_write_is_truncated_to_block() {
        let mut disk_emu = device(2);

        disk_emu.write_block(0, &[0x11; 5000]).unwrap();

        let mut read_block = vec![0x00; 4096];
        disk_emu.read_block(1, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);
    }

    #[test]
    fn writing_partial_block_succeeds() {
        let mut disk_emu = device(1);

        // Fill half the block with meaningful data.
        disk_emu
            .write_block(0, &[0x55; 2048])
            .expect("failed to write block");

        let mut read_block = vec![0x00; 4096];
        disk_emu.read_block(0, &mut read_block).unwrap();
        assert!(read_block[..2048].iter().all(|&b| b == 0x55));
        assert!(read_block[2048..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn zero_sized_device_is_rejected() {
        let fs_block = tempfile::tempfile().unwrap();
        let result = FileBlockEmulatorBuilder::from(fs_block).build();
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidInput));
    }

    #[test]
    fn overflowing_device_size_is_rejected() {
        let fs_block = tempfile::tempfile().unwrap();
        let result = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(usize::MAX)
            .clear_medium(false)
            .build();
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidInput));

        let fs_block = tempfile::tempfile().unwrap();
        let result = FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(2)
            .with_block_size(usize::MAX)
            .build();
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidInput));
    }

    #[test]
    fn reopening_without_clear_keeps_data() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut disk_emu = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .build()
            .unwrap();
        disk_emu.write_block(1, &[0x42; 4096]).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut disk_emu = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            // Don't reset initialized disk.
            .clear_medium(false)
            .build()
            .unwrap();
        let mut read_block = vec![0x00; 4096];
        disk_emu.read_block(1, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x42; 4096]);
    }
}
