//! Block allocation bitmaps for disk and filesystem image builders.
//!
//! A [`Bitmap`] tracks which blocks of a fixed-size device are in use, one bit per
//! block. [`alloc::Allocator`] hands out extents from it, and [`store`] persists it
//! onto any [`io::BlockStorage`] device.
pub mod alloc;
mod bitmap;
pub mod io;
pub mod store;
pub mod util;

pub use crate::alloc::{AllocError, Allocator, NextAvailableAllocation, Policy};
pub use crate::bitmap::{Bitmap, BitmapError, Contiguous};
pub use crate::store::StoreError;
