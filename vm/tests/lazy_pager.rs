mod common;

use abyss::addressing::{PAGE_SIZE, Va};
use common::{HEAP, file, page, pattern, va, vm};
use platform::{KernelError, task::PFErrorCode};
use std::sync::Arc;
use vm::{
    MmStruct, PageFaultReason,
    config::KERNEL_BASE,
    loader::{FileBackedLoader, MmLoader},
    page::{Target, VmType},
};

/// Nothing is resident before the first access.
#[test]
fn pages_are_loaded_on_first_access() {
    let vm = vm(4, 8);
    let mm = MmStruct::new(vm.clone());
    mm.alloc_page(VmType::Anon, page(HEAP, 0), true).unwrap();
    assert!(mm.get_phys(page(HEAP, 0)).is_none());
    assert_eq!(vm.resident_frames(), 0);

    let mut buf = vec![0xff; PAGE_SIZE];
    mm.read_user(page(HEAP, 0), &mut buf).unwrap();
    assert_eq!(buf, pattern(0), "Anonymous page must start zeroed.");
    let pa = mm.get_phys(va(HEAP + 0x123)).expect("Page must be resident.");
    assert_eq!(pa.offset(), 0x123);
    assert_eq!(mm.page_type(page(HEAP, 0)), Some(VmType::Anon));
}

#[test]
fn initializer_runs_after_transition() {
    let mm = MmStruct::new(vm(4, 8));
    let (_, file) = file(b"#!program text");
    let loader = FileBackedLoader::new(Arc::new(file), page(HEAP, 0), 0, 14);
    mm.alloc_page_with_initializer(page(HEAP, 0), false, Target::Anon, Some(Arc::new(loader)))
        .unwrap();
    // An untouched page reports the type it turns into.
    assert_eq!(mm.page_type(page(HEAP, 0)), Some(VmType::Anon));

    let mut buf = [0xff; 16];
    mm.read_user(page(HEAP, 0), &mut buf).unwrap();
    assert_eq!(&buf[..14], b"#!program text");
    assert_eq!(&buf[14..], &[0, 0]);
}

#[test]
fn segment_spanning_pages() {
    let mm = MmStruct::new(vm(4, 8));
    let contents = (0..PAGE_SIZE + 100).map(|i| (i % 253) as u8).collect::<Vec<_>>();
    let (_, file) = file(&contents);
    let file = Arc::new(file);
    for n in 0..3 {
        let loader: Arc<dyn MmLoader> = Arc::new(FileBackedLoader::new(
            file.clone(),
            page(HEAP, 0),
            0,
            contents.len(),
        ));
        mm.alloc_page_with_initializer(page(HEAP, n), true, Target::Anon, Some(loader))
            .unwrap();
    }
    let mut buf = vec![0; 3 * PAGE_SIZE];
    mm.read_user(page(HEAP, 0), &mut buf).unwrap();
    assert_eq!(&buf[..contents.len()], contents.as_slice());
    assert!(buf[contents.len()..].iter().all(|b| *b == 0));
}

#[test]
fn failed_initializer_is_fatal() {
    let vm = vm(4, 8);
    let mm = MmStruct::new(vm.clone());
    let loader: Arc<dyn MmLoader> =
        Arc::new(|_: Va, _: &mut [u8]| -> Result<(), KernelError> { Err(KernelError::IOError) });
    mm.alloc_page_with_initializer(page(HEAP, 0), true, Target::Anon, Some(loader))
        .unwrap();

    let mut buf = [0; 1];
    assert_eq!(mm.read_user(page(HEAP, 0), &mut buf), Err(KernelError::IOError));
    assert!(mm.get_phys(page(HEAP, 0)).is_none());
    assert_eq!(vm.resident_frames(), 0, "Frame of a failed claim must be released.");
    assert_eq!(vm.free_frames(), 4);
}

#[test]
fn write_to_read_only_page_is_fatal() {
    let mm = MmStruct::new(vm(4, 8));
    mm.alloc_page(VmType::Anon, page(HEAP, 0), false).unwrap();
    assert_eq!(
        mm.write_user(page(HEAP, 0), b"x"),
        Err(KernelError::InvalidAccess)
    );
    // Reading is fine, and a write still fails once the page is present.
    let mut buf = [1; 1];
    mm.read_user(page(HEAP, 0), &mut buf).unwrap();
    assert_eq!(buf, [0]);
    assert_eq!(
        mm.write_user(page(HEAP, 0), b"x"),
        Err(KernelError::InvalidAccess)
    );
}

#[test]
fn invalid_addresses_are_fatal() {
    let mm = MmStruct::new(vm(4, 8));
    let user_write = PFErrorCode::USER | PFErrorCode::WRITE_ACCESS;
    for addr in [0, 0x10, KERNEL_BASE, KERNEL_BASE + 0x1000] {
        let reason = PageFaultReason::new(user_write, va(addr), 0x4000_0000);
        assert_eq!(mm.handle_page_fault(&reason), Err(KernelError::BadAddress));
    }
    // Nothing is allocated there.
    let reason = PageFaultReason::new(PFErrorCode::USER, page(HEAP, 7), 0x4000_0000);
    assert_eq!(mm.handle_page_fault(&reason), Err(KernelError::BadAddress));
}

#[test]
fn alloc_page_validation() {
    let mm = MmStruct::new(vm(4, 8));
    assert_eq!(
        mm.alloc_page(VmType::Anon, va(HEAP + 1), true),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        mm.alloc_page(VmType::Anon, Va::NULL, true),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        mm.alloc_page(VmType::File, page(HEAP, 0), true),
        Err(KernelError::InvalidArgument)
    );
    mm.alloc_page(VmType::Anon, page(HEAP, 0), true).unwrap();
    assert_eq!(
        mm.alloc_page(VmType::Anon, page(HEAP, 0), true),
        Err(KernelError::FileExist)
    );
}

#[test]
fn claim_page_eagerly() {
    let vm = vm(4, 8);
    let mm = MmStruct::new(vm.clone());
    mm.alloc_page(VmType::Anon, page(HEAP, 0), true).unwrap();
    mm.claim_page(page(HEAP, 0)).unwrap();
    assert!(mm.get_phys(page(HEAP, 0)).is_some());
    // Claiming a resident page does nothing.
    mm.claim_page(page(HEAP, 0)).unwrap();
    assert_eq!(vm.resident_frames(), 1);
    assert_eq!(mm.claim_page(page(HEAP, 1)), Err(KernelError::BadAddress));
}

#[test]
fn access_ok_checks_records_without_loading() {
    let mm = MmStruct::new(vm(4, 8));
    mm.alloc_page(VmType::Anon, page(HEAP, 0), true).unwrap();
    mm.alloc_page(VmType::Anon, page(HEAP, 1), false).unwrap();

    assert!(mm.access_ok(va(HEAP + 8)..va(HEAP + PAGE_SIZE + 8), false));
    assert!(mm.access_ok(va(HEAP + 8)..va(HEAP + 16), true));
    assert!(!mm.access_ok(va(HEAP + 8)..va(HEAP + PAGE_SIZE + 8), true));
    assert!(!mm.access_ok(va(HEAP)..va(HEAP + 2 * PAGE_SIZE + 1), false));
    assert!(mm.get_phys(page(HEAP, 0)).is_none());
}

#[test]
fn loader_rejects_wrapping_offset() {
    let (_, file) = file(&[1; PAGE_SIZE]);
    let loader = FileBackedLoader::new(
        Arc::new(file),
        page(HEAP, 0),
        usize::MAX & !(PAGE_SIZE - 1),
        2 * PAGE_SIZE,
    );
    let mut frame = pattern(0xff);
    assert_eq!(loader.load(page(HEAP, 0), &mut frame), Ok(()));
    assert!(frame.iter().all(|b| *b == 0), "Nothing lies past the end of the file.");
    assert_eq!(
        loader.load(page(HEAP, 1), &mut frame),
        Err(KernelError::InvalidArgument)
    );
}

#[test]
fn claiming_resident_page_needs_no_frame() {
    // One frame and no swap: evicting anything would fail.
    let vm = vm(1, 0);
    let mm = MmStruct::new(vm.clone());
    mm.alloc_page(VmType::Anon, page(HEAP, 0), true).unwrap();
    mm.write_user(page(HEAP, 0), b"kept").unwrap();

    assert_eq!(mm.claim_page(page(HEAP, 0)), Ok(()));
    assert_eq!(mm.claim_page(va(HEAP + 0x800)), Ok(()));
    assert_eq!(vm.resident_frames(), 1);
    assert_eq!(vm.used_swap_slots(), 0);
    let mut buf = [0; 4];
    mm.read_user(page(HEAP, 0), &mut buf).unwrap();
    assert_eq!(&buf, b"kept");
}
