use blockmap::io::FileBlockEmulatorBuilder;
use blockmap::{store, Allocator, Bitmap, Policy};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let mut dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(4)
        .build()
        .expect("Could not initialize disk emulator.");

    // Track 64 blocks, carve a few extents out of them and print what is left.
    let mut alloc = Allocator::new(Bitmap::new(8), Policy::BestFit);
    let journal = alloc.allocate(16).unwrap();
    let inodes = alloc.allocate(8).unwrap();
    alloc.allocate(4).unwrap();
    alloc.release(inodes).unwrap();
    println!("journal at {:?}", journal);

    for run in alloc.bitmap().free_list() {
        println!("free: {} blocks at {}", run.count, run.position);
    }

    let blocks = store::write_bitmap(&mut dev, 0, alloc.bitmap()).unwrap();
    println!("bitmap stored in {} blocks", blocks);
}
