use crate::bitmap::{Bitmap, BitmapError, Contiguous};

use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocError {
    #[error("cannot allocate an extent of zero blocks")]
    ZeroLength,
    #[error("no free extent of {requested} blocks, largest free run is {largest_free}")]
    NoSpace { requested: usize, largest_free: usize },
    #[error("could not allocate {requested} blocks, only {free} are free")]
    Exhausted { requested: usize, free: usize },
    #[error("block {location} is already free")]
    DoubleFree { location: usize },
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}

/// Chooses which free run an extent is carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The lowest positioned run that is large enough. Keeps data packed toward
    /// the front of the device.
    FirstFit,
    /// The smallest run that is large enough, leaving big runs for big requests.
    BestFit,
    /// The largest run, so the leftover tail stays usable.
    WorstFit,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::FirstFit
    }
}

/// Walks free blocks in ascending order, one per call to `next`. The bitmap is
/// only read; callers reserve the blocks they keep.
pub struct NextAvailableAllocation<'a> {
    /// Where the next search starts.
    marker: usize,
    bitmap: &'a Bitmap,
    /// One past the highest block handed out. For example, with 80 inode blocks on
    /// disk this would be 80 even if the bitmap tracks more.
    cap: usize,
}

impl<'a> NextAvailableAllocation<'a> {
    pub fn new(bitmap: &'a Bitmap, cap: Option<usize>) -> Self {
        let cap = cap.map_or(bitmap.len_bits(), |cap| cap.min(bitmap.len_bits()));
        Self {
            marker: 0,
            bitmap,
            cap,
        }
    }
}

impl<'a> Iterator for NextAvailableAllocation<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let found = self.bitmap.first_free(self.marker).filter(|&i| i < self.cap)?;
        self.marker = found + 1;
        Some(found)
    }
}

/// Hands out extents of blocks from an owned [`Bitmap`].
///
/// Like the bitmap it wraps, the allocator does no locking of its own.
#[derive(Debug, Clone)]
pub struct Allocator {
    bitmap: Bitmap,
    policy: Policy,
}

impl Allocator {
    pub fn new(bitmap: Bitmap, policy: Policy) -> Self {
        Self { bitmap, policy }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn into_bitmap(self) -> Bitmap {
        self.bitmap
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn free_blocks(&self) -> usize {
        self.bitmap.count_free()
    }

    /// Reserves `count` consecutive blocks and returns where they start.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::NoSpace`] if no free run holds `count` blocks. The
    /// bitmap is left unchanged.
    pub fn allocate(&mut self, count: usize) -> Result<Contiguous, AllocError> {
        if count == 0 {
            return Err(AllocError::ZeroLength);
        }

        let runs = self.bitmap.free_list();
        let candidates = runs.iter().filter(|run| run.count >= count);
        // Ties go to the lowest position under every policy.
        let chosen = match self.policy {
            Policy::FirstFit => candidates.copied().next(),
            Policy::BestFit => candidates.copied().min_by_key(|run| run.count),
            Policy::WorstFit => candidates
                .copied()
                .min_by_key(|run| (std::cmp::Reverse(run.count), run.position)),
        };

        let run = match chosen {
            Some(run) => run,
            None => {
                let largest_free = runs.iter().map(|run| run.count).max().unwrap_or(0);
                warn!(
                    "no free run for {} blocks (largest free run is {})",
                    count, largest_free
                );
                return Err(AllocError::NoSpace {
                    requested: count,
                    largest_free,
                });
            }
        };

        let extent = Contiguous::new(run.position, count);
        self.bitmap.set_range(extent.position, extent.count)?;
        debug!(
            "allocated blocks {}..{} ({:?})",
            extent.position,
            extent.end(),
            self.policy
        );
        Ok(extent)
    }

    /// Reserves `count` blocks spread over as few extents as possible.
    ///
    /// Free runs are cut into pieces of at most `max_extent` blocks and taken
    /// largest first, ties going to the lowest position. The last piece taken is
    /// trimmed to what is still needed. Extents are returned in the order taken.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Exhausted`] if the free pieces together hold fewer than
    /// `count` blocks. Nothing is reserved in that case.
    pub fn allocate_extents(
        &mut self,
        count: usize,
        max_extent: usize,
    ) -> Result<Vec<Contiguous>, AllocError> {
        if count == 0 || max_extent == 0 {
            return Err(AllocError::ZeroLength);
        }

        let mut pieces = Vec::new();
        for run in self.bitmap.free_list() {
            let mut start = run.position;
            let mut remaining = run.count;
            while remaining > 0 {
                let len = remaining.min(max_extent);
                pieces.push(Contiguous::new(start, len));
                start += len;
                remaining -= len;
            }
        }
        // Stable, so equal pieces keep their ascending position order.
        pieces.sort_by(|a, b| b.count.cmp(&a.count));

        let mut wanted = count;
        let mut extents = Vec::new();
        for piece in pieces {
            if wanted == 0 {
                break;
            }
            let len = piece.count.min(wanted);
            extents.push(Contiguous::new(piece.position, len));
            wanted -= len;
        }

        if wanted > 0 {
            let free = count - wanted;
            warn!("could not allocate {} blocks, only {} are free", count, free);
            return Err(AllocError::Exhausted {
                requested: count,
                free,
            });
        }

        for extent in &extents {
            self.bitmap.set_range(extent.position, extent.count)?;
        }
        debug!(
            "allocated {} blocks in {} extents (at most {} blocks each)",
            count,
            extents.len(),
            max_extent
        );
        Ok(extents)
    }

    /// Reserves the lowest free block.
    pub fn allocate_one(&mut self) -> Result<usize, AllocError> {
        let block = match self.bitmap.first_free(0) {
            Some(block) => block,
            None => {
                warn!("no free blocks left");
                return Err(AllocError::NoSpace {
                    requested: 1,
                    largest_free: 0,
                });
            }
        };
        self.bitmap.set(block)?;
        debug!("allocated block {}", block);
        Ok(block)
    }

    /// Returns an extent to the free pool.
    ///
    /// Every block of the extent must currently be in use. If any is already free
    /// the call fails with [`AllocError::DoubleFree`] and nothing is released.
    pub fn release(&mut self, extent: Contiguous) -> Result<(), AllocError> {
        self.bitmap.check_range(extent.position, extent.count)?;
        for location in extent.position..extent.end() {
            if !self.bitmap.is_set(location)? {
                return Err(AllocError::DoubleFree { location });
            }
        }
        self.bitmap.clear_range(extent.position, extent.count)?;
        debug!("released blocks {}..{}", extent.position, extent.end());
        Ok(())
    }
}
