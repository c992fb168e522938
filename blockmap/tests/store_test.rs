use blockmap::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use blockmap::store::{self, StoreError};
use blockmap::{Allocator, Bitmap, Policy};
use tempfile::NamedTempFile;

fn open_device(disk: &NamedTempFile, clear: bool) -> FileBlockEmulator {
    FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(16)
        .with_block_size(512)
        .clear_medium(clear)
        .build()
        .expect("Could not initialize disk emulator.")
}

#[test]
fn can_persist_and_reload_allocations() {
    let disk = NamedTempFile::new().unwrap();

    // Allocate a few extents and write the bitmap behind a reserved first block.
    let mut alloc = Allocator::new(Bitmap::new(1024), Policy::FirstFit);
    let kept = alloc.allocate(100).unwrap();
    let dropped = alloc.allocate(50).unwrap();
    alloc.allocate(7).unwrap();
    alloc.release(dropped).unwrap();
    let bitmap = alloc.into_bitmap();

    let mut dev = open_device(&disk, true);
    let written = store::write_bitmap(&mut dev, 1, &bitmap).unwrap();
    assert_eq!(Some(written), store::blocks_needed(1024, dev.block_size()));

    // Reopen without clearing and read it back.
    let mut dev = open_device(&disk, false);
    let loaded = store::read_bitmap(&mut dev, 1).unwrap();
    assert_eq!(loaded, bitmap);

    let mut alloc = Allocator::new(loaded, Policy::FirstFit);
    assert!(alloc.bitmap().is_set(kept.position).unwrap());
    assert_eq!(alloc.allocate(50).unwrap(), dropped);
}

#[test]
fn unformatted_device_is_rejected() {
    let disk = NamedTempFile::new().unwrap();
    let mut dev = open_device(&disk, true);

    match store::read_bitmap(&mut dev, 0) {
        Err(StoreError::BadMagic(0)) => (),
        other => panic!("Unexpected result: {:?}", other.map(|b| b.len_bytes())),
    }
}

#[test]
fn start_block_past_device_end_is_io_error() {
    let disk = NamedTempFile::new().unwrap();
    let mut dev = open_device(&disk, true);

    assert!(matches!(
        store::read_bitmap(&mut dev, 16),
        Err(StoreError::Io(_))
    ));
    assert!(matches!(
        store::write_bitmap(&mut dev, 16, &Bitmap::new(1)),
        Err(StoreError::TooLarge { available: 0, .. })
    ));
}
