use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    #[error("bit {location} is out of range for a bitmap of {capacity} bits")]
    OutOfRange { location: usize, capacity: usize },
}

/// A maximal run of consecutive free bits, as reported by [`Bitmap::free_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contiguous {
    /// Index of the first bit in the run.
    pub position: usize,
    /// Number of bits in the run, never zero for runs produced by a scan.
    pub count: usize,
}

impl Contiguous {
    pub fn new(position: usize, count: usize) -> Self {
        Self { position, count }
    }

    /// One past the last bit of the run, saturating at `usize::MAX`.
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.count)
    }

    pub fn contains(&self, location: usize) -> bool {
        location >= self.position && location < self.end()
    }
}

/// Tracks the allocation state of a fixed number of blocks, one bit per block.
///
/// Block `n` is stored in byte `n / 8` at bit `n % 8` counted from the least
/// significant bit, so bit 0 of byte 0 is block 0. This is also the persisted
/// layout: the bytes returned by [`Bitmap::to_bytes`] can be written to disk as-is
/// and read back with [`Bitmap::from_bytes`].
///
/// A set bit (1) marks a used block and a clear bit (0) a free one. The size is
/// fixed when the bitmap is created; any access past the last bit fails with
/// [`BitmapError::OutOfRange`] instead of growing the buffer.
///
/// There is no internal locking. Share a bitmap between threads behind a mutex.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
}

impl Bitmap {
    /// Creates a bitmap of `size_bytes` bytes with every block free. A zero sized
    /// bitmap is valid and has no free blocks.
    pub fn new(size_bytes: usize) -> Self {
        Self {
            bits: vec![0; size_bytes],
        }
    }

    /// Builds a bitmap from an existing buffer. The bytes are copied, later writes
    /// to `data` are not seen by the bitmap.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            bits: data.to_vec(),
        }
    }

    /// Returns a copy of the packed buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    pub fn len_bytes(&self) -> usize {
        self.bits.len()
    }

    pub fn len_bits(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn is_set(&self, location: usize) -> Result<bool, BitmapError> {
        let (byte, mask) = self.locate(location)?;
        Ok(self.bits[byte] & mask != 0)
    }

    pub fn set(&mut self, location: usize) -> Result<(), BitmapError> {
        let (byte, mask) = self.locate(location)?;
        self.bits[byte] |= mask;
        Ok(())
    }

    pub fn clear(&mut self, location: usize) -> Result<(), BitmapError> {
        let (byte, mask) = self.locate(location)?;
        self.bits[byte] &= !mask;
        Ok(())
    }

    /// Marks `count` bits starting at `position` as used. The whole range is
    /// checked before anything is written, so a failing call changes nothing.
    pub fn set_range(&mut self, position: usize, count: usize) -> Result<(), BitmapError> {
        self.check_range(position, count)?;
        for location in position..position + count {
            self.bits[location / 8] |= 1 << (location % 8);
        }
        Ok(())
    }

    /// Marks `count` bits starting at `position` as free, with the same checks as
    /// [`Bitmap::set_range`].
    pub fn clear_range(&mut self, position: usize, count: usize) -> Result<(), BitmapError> {
        self.check_range(position, count)?;
        for location in position..position + count {
            self.bits[location / 8] &= !(1 << (location % 8));
        }
        Ok(())
    }

    /// Finds the first free bit at or after `start`.
    ///
    /// `start` is an exact bit index: free bits that share a byte with `start` but
    /// sit below it are never returned. Fully used bytes are skipped whole.
    pub fn first_free(&self, start: usize) -> Option<usize> {
        let first = start / 8;
        if first >= self.bits.len() {
            return None;
        }

        // Treat the bits below `start` in the first byte as used.
        let head = self.bits[first] | low_bits(start % 8);
        if head != 0xFF {
            return Some(first * 8 + (!head).trailing_zeros() as usize);
        }

        self.bits[first + 1..]
            .iter()
            .position(|&byte| byte != 0xFF)
            .map(|i| {
                let byte = first + 1 + i;
                byte * 8 + (!self.bits[byte]).trailing_zeros() as usize
            })
    }

    /// Finds the first used bit from the beginning of the bitmap.
    pub fn first_set(&self) -> Option<usize> {
        self.bits
            .iter()
            .position(|&byte| byte != 0)
            .map(|byte| byte * 8 + self.bits[byte].trailing_zeros() as usize)
    }

    /// Lists every maximal run of free bits in ascending order of position.
    ///
    /// Runs are not sorted by size; callers choosing between runs (best fit, worst
    /// fit) sort the result themselves.
    pub fn free_list(&self) -> Vec<Contiguous> {
        let mut runs = Vec::new();
        let mut current: Option<Contiguous> = None;

        for (index, &byte) in self.bits.iter().enumerate() {
            let base = index * 8;
            match byte {
                0x00 => match current.as_mut() {
                    Some(run) => run.count += 8,
                    None => current = Some(Contiguous::new(base, 8)),
                },
                0xFF => {
                    if let Some(run) = current.take() {
                        runs.push(run);
                    }
                }
                _ => {
                    for offset in 0..8 {
                        if byte & (1 << offset) == 0 {
                            match current.as_mut() {
                                Some(run) => run.count += 1,
                                None => current = Some(Contiguous::new(base + offset, 1)),
                            }
                        } else if let Some(run) = current.take() {
                            runs.push(run);
                        }
                    }
                }
            }
        }

        if let Some(run) = current {
            runs.push(run);
        }
        runs
    }

    /// Number of used bits.
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Number of free bits.
    pub fn count_free(&self) -> usize {
        self.len_bits() - self.count_set()
    }

    fn locate(&self, location: usize) -> Result<(usize, u8), BitmapError> {
        let byte = location / 8;
        if byte >= self.bits.len() {
            return Err(BitmapError::OutOfRange {
                location,
                capacity: self.len_bits(),
            });
        }
        Ok((byte, 1 << (location % 8)))
    }

    pub(crate) fn check_range(&self, position: usize, count: usize) -> Result<(), BitmapError> {
        let capacity = self.len_bits();
        match position.checked_add(count) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(BitmapError::OutOfRange {
                location: position.max(capacity),
                capacity,
            }),
        }
    }
}

/// Mask with the lowest `n` bits set, `n` in `0..8`.
fn low_bits(n: usize) -> u8 {
    ((1_u16 << n) - 1) as u8
}
