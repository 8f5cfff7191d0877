mod common;

use abyss::addressing::PAGE_SIZE;
use common::{HEAP, page, pattern, vm};
use platform::{
    KernelError,
    fs::{Disk, MemDisk},
};
use vm::{
    MmStruct,
    page::VmType,
    swap::{SECTORS_PER_SLOT, SwapTable},
};

#[test]
fn slots_are_page_sized() {
    assert_eq!(SECTORS_PER_SLOT * 512, PAGE_SIZE);
    // Trailing sectors that do not fill a slot are not used.
    let swap = SwapTable::new(Disk::new(MemDisk::new(3 * SECTORS_PER_SLOT + 7)));
    assert_eq!(swap.capacity(), 3);
}

#[test]
fn exhausted_swap() {
    let mut swap = SwapTable::new(Disk::new(MemDisk::new(2 * SECTORS_PER_SLOT)));
    let page = pattern(0x11);
    let first = swap.swap_out(&page).unwrap();
    swap.swap_out(&page).unwrap();
    assert_eq!(swap.swap_out(&page), Err(KernelError::NoSpace));

    // A freed slot is handed out again.
    swap.free_slot(first);
    assert_eq!(swap.allocate_slot(), Some(first));
}

#[test]
fn swap_in_releases_slot() {
    let vm = vm(1, 4);
    let mm = MmStruct::new(vm.clone());
    mm.alloc_page(VmType::Anon, page(HEAP, 0), true).unwrap();
    mm.alloc_page(VmType::Anon, page(HEAP, 1), true).unwrap();

    mm.write_user(page(HEAP, 0), &pattern(0xaa)).unwrap();
    mm.write_user(page(HEAP, 1), &pattern(0xbb)).unwrap();
    assert_eq!(vm.used_swap_slots(), 1);

    // Bringing page 0 back evicts page 1 and frees the slot of page 0.
    let mut buf = vec![0; PAGE_SIZE];
    mm.read_user(page(HEAP, 0), &mut buf).unwrap();
    assert_eq!(buf, pattern(0xaa));
    assert_eq!(vm.used_swap_slots(), 1);
    assert_eq!(vm.free_swap_slots(), 3);
}

#[test]
fn out_of_swap_is_fatal_but_keeps_victim() {
    let vm = vm(1, 0);
    let mm = MmStruct::new(vm.clone());
    mm.alloc_page(VmType::Anon, page(HEAP, 0), true).unwrap();
    mm.alloc_page(VmType::Anon, page(HEAP, 1), true).unwrap();
    mm.write_user(page(HEAP, 0), &pattern(0x5a)).unwrap();

    // The only frame cannot be evicted: its contents have nowhere to go.
    assert_eq!(
        mm.write_user(page(HEAP, 1), &pattern(0xa5)),
        Err(KernelError::NoSpace)
    );

    // The victim is mapped back untouched.
    let mut buf = vec![0; PAGE_SIZE];
    mm.read_user(page(HEAP, 0), &mut buf).unwrap();
    assert_eq!(buf, pattern(0x5a));
    assert!(mm.get_phys(page(HEAP, 1)).is_none());
}
