mod common;

use abyss::addressing::{PAGE_SIZE, Pa};
use common::{HEAP, MMAP, file, page, pattern, vm, vm_with_policy};
use platform::{
    KernelError,
    fs::{Disk, MemDisk},
    mm::PhysicalAllocator,
};
use vm::{
    MmStruct,
    config::VmConfigurationBuilder,
    frame::{ClockPolicy, FifoPolicy},
    page::VmType,
};

/// Writes a distinct pattern into each of `n` anonymous pages, then reads
/// every page back.
fn check_anon_survives(mm: &MmStruct, n: usize) {
    for i in 0..n {
        mm.alloc_page(VmType::Anon, page(HEAP, i), true).unwrap();
        mm.write_user(page(HEAP, i), &pattern(i as u8 + 1)).unwrap();
    }
    for i in (0..n).rev() {
        let mut buf = vec![0; PAGE_SIZE];
        mm.read_user(page(HEAP, i), &mut buf).unwrap();
        assert_eq!(buf, pattern(i as u8 + 1), "Page {i} lost its contents.");
    }
}

#[test]
fn anon_pattern_survives_eviction() {
    let vm = vm(4, 16);
    let mm = MmStruct::new(vm.clone());
    check_anon_survives(&mm, 12);
    assert_eq!(vm.resident_frames(), 4);
    assert_eq!(vm.used_swap_slots(), 8);
}

#[test]
fn anon_pattern_survives_fifo_eviction() {
    let vm = vm_with_policy(3, 16, FifoPolicy);
    let mm = MmStruct::new(vm.clone());
    check_anon_survives(&mm, 10);
}

#[test]
fn dirty_file_page_writes_valid_bytes() {
    let vm = vm(1, 4);
    let mm = MmStruct::new(vm.clone());
    let (mem, file) = file(&[b'x'; 6000]);
    mm.mmap(page(MMAP, 0), 6000, true, &file, 0).unwrap();

    // The second page holds the last 1904 bytes of the file.
    mm.write_user(page(MMAP, 1), b"dirty").unwrap();
    assert!(mem.writes().is_empty());

    // Faulting in the first page evicts the second one.
    let mut buf = [0; 5];
    mm.read_user(page(MMAP, 0), &mut buf).unwrap();
    assert_eq!(mem.writes(), vec![(PAGE_SIZE, 6000 - PAGE_SIZE)]);
    assert_eq!(&mem.contents()[PAGE_SIZE..PAGE_SIZE + 5], b"dirty");
    assert_eq!(mem.contents().len(), 6000, "Write back must not extend the file.");

    // A file-backed page never uses the swap disk.
    assert_eq!(vm.used_swap_slots(), 0);
}

#[test]
fn clean_file_page_is_not_written() {
    let vm = vm(1, 4);
    let mm = MmStruct::new(vm);
    let (mem, file) = file(&[b'y'; 2 * PAGE_SIZE]);
    mm.mmap(page(MMAP, 0), 2 * PAGE_SIZE, true, &file, 0).unwrap();

    let mut buf = [0; 1];
    mm.read_user(page(MMAP, 0), &mut buf).unwrap();
    mm.read_user(page(MMAP, 1), &mut buf).unwrap();
    mm.read_user(page(MMAP, 0), &mut buf).unwrap();
    assert_eq!(buf, [b'y']);
    assert!(mem.writes().is_empty());
}

#[test]
fn clock_gives_second_chance() {
    let vm = vm_with_policy(2, 8, ClockPolicy::new());
    let mm = MmStruct::new(vm);
    for i in 0..4 {
        mm.alloc_page(VmType::Anon, page(HEAP, i), true).unwrap();
    }
    mm.write_user(page(HEAP, 0), b"a").unwrap();
    mm.write_user(page(HEAP, 1), b"b").unwrap();
    // Both are accessed: the clock clears both bits and takes page 0.
    mm.write_user(page(HEAP, 2), b"c").unwrap();
    assert!(mm.get_phys(page(HEAP, 0)).is_none());

    // Page 1 is used again; page 2 is not.
    let mut pt = mm.page_table().lock();
    pt.clear_accessed(page(HEAP, 2));
    pt.unlock();
    mm.write_user(page(HEAP, 1), b"B").unwrap();

    mm.write_user(page(HEAP, 3), b"d").unwrap();
    assert!(mm.get_phys(page(HEAP, 1)).is_some(), "Accessed page must get a second chance.");
    assert!(mm.get_phys(page(HEAP, 2)).is_none());
}

#[test]
fn fifo_evicts_oldest() {
    let vm = vm_with_policy(2, 8, FifoPolicy);
    let mm = MmStruct::new(vm);
    for i in 0..4 {
        mm.alloc_page(VmType::Anon, page(HEAP, i), true).unwrap();
    }
    mm.write_user(page(HEAP, 0), b"a").unwrap();
    mm.write_user(page(HEAP, 1), b"b").unwrap();
    mm.write_user(page(HEAP, 2), b"c").unwrap();
    mm.write_user(page(HEAP, 1), b"B").unwrap();
    mm.write_user(page(HEAP, 3), b"d").unwrap();
    // Page 1 is older than page 2, used or not.
    assert!(mm.get_phys(page(HEAP, 1)).is_none());
    assert!(mm.get_phys(page(HEAP, 2)).is_some());
}

#[test]
fn in_flight_frames_are_not_evicted() {
    let vm = VmConfigurationBuilder::new()
        .build(
            PhysicalAllocator::new(Pa::new(0x10_0000).unwrap(), 1),
            Disk::new(MemDisk::new(64)),
        )
        .unwrap();
    let frame = vm.get_frame().unwrap();
    assert_eq!(vm.get_frame().err(), Some(KernelError::NoMemory));

    vm.release_frame(&frame);
    drop(frame);
    assert!(vm.get_frame().is_ok());
}

#[test]
fn failed_write_back_keeps_victim() {
    let vm = vm(1, 4);
    let mm = MmStruct::new(vm.clone());
    let (mem, file) = file(&[0; 2 * PAGE_SIZE]);
    mm.mmap(page(MMAP, 0), 2 * PAGE_SIZE, true, &file, 0).unwrap();
    mm.write_user(page(MMAP, 0), b"unsaved").unwrap();
    let pa = mm.get_phys(page(MMAP, 0));

    mem.set_faulty(true);
    let mut buf = [0; 7];
    assert_eq!(mm.read_user(page(MMAP, 1), &mut buf), Err(KernelError::IOError));
    assert_eq!(mm.get_phys(page(MMAP, 0)), pa, "Victim must stay mapped.");
    assert_eq!(vm.resident_frames(), 1);

    mem.set_faulty(false);
    mm.read_user(page(MMAP, 0), &mut buf).unwrap();
    assert_eq!(&buf, b"unsaved");
    assert_eq!(mm.munmap(page(MMAP, 0)), Ok(0));
    assert_eq!(&mem.contents()[..7], b"unsaved");
}
