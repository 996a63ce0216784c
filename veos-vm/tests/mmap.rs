//! Memory-mapped files: lazy materialization, write-back at unmap, and the
//! argument/overlap failure paths.

mod common;

use common::*;
use veos::{KernelError, addressing::PAGE_SIZE, mm::Permission};

const BASE: usize = 0x4000_0000;

fn hello_page() -> Vec<u8> {
    let mut content = b"HELLO".to_vec();
    content.resize(PAGE_SIZE, 0);
    content
}

#[test]
fn modified_mapping_writes_back_on_unmap() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let (handle, backing) = file(&hello_page());

    let id = mm
        .map(handle, va(BASE), PAGE_SIZE, Permission::READ | Permission::WRITE)
        .expect("mapping a free region");

    mm.copy_to_user(&vm, va(BASE), b"WORLD").unwrap();
    mm.unmap(&vm, id).expect("unmap with write-back");

    let data = backing.snapshot();
    assert_eq!(&data[..5], b"WORLD", "the modification must reach the file");
    assert!(
        data[5..].iter().all(|&b| b == 0),
        "the rest of the page is untouched"
    );
    assert_eq!(vm.frames_in_use(), 0);
}

#[test]
fn clean_mapping_leaves_file_unchanged() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let original = hello_page();
    let (handle, backing) = file(&original);

    let id = mm
        .map(handle, va(BASE), PAGE_SIZE, Permission::READ | Permission::WRITE)
        .unwrap();

    // Materialize and read the page, but never write it.
    let mut buf = [0u8; 5];
    mm.copy_from_user(&vm, va(BASE), &mut buf).unwrap();
    assert_eq!(&buf, b"HELLO");

    mm.unmap(&vm, id).unwrap();
    assert_eq!(
        backing.snapshot(),
        original,
        "an unmodified mapping must leave the file byte-for-byte unchanged"
    );
}

#[test]
fn never_touched_mapping_unmaps_without_io() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let original = hello_page();
    let (handle, backing) = file(&original);

    let id = mm
        .map(handle, va(BASE), PAGE_SIZE, Permission::READ | Permission::WRITE)
        .unwrap();
    mm.unmap(&vm, id).unwrap();

    assert_eq!(backing.snapshot(), original);
    assert_eq!(vm.frames_in_use(), 0);
    assert_eq!(vm.swap_slots_in_use(), 0);
}

#[test]
fn zero_length_mapping_is_rejected() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let (handle, _backing) = file(b"x");

    assert_eq!(
        mm.map(handle, va(BASE), 0, Permission::READ),
        Err(KernelError::InvalidArgument)
    );
}

#[test]
fn misaligned_mapping_is_rejected() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let (handle, _backing) = file(b"x");

    assert_eq!(
        mm.map(handle, va(BASE + 0x10), PAGE_SIZE, Permission::READ),
        Err(KernelError::InvalidArgument)
    );
}

#[test]
fn overlapping_mapping_rolls_back_entirely() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let (handle, _backing) = file(&[0u8; 3 * PAGE_SIZE]);

    // A page sits in the middle of the would-be region.
    mm.register_file_backed(
        handle.clone(),
        0,
        va(BASE + PAGE_SIZE),
        PAGE_SIZE,
        0,
        Permission::READ,
    )
    .unwrap();

    assert_eq!(
        mm.map(handle, va(BASE), 3 * PAGE_SIZE, Permission::READ),
        Err(KernelError::AlreadyMapped)
    );
    assert!(
        !mm.resolve_fault(&vm, va(BASE)),
        "no descriptor of the failed mapping may survive"
    );
    assert!(
        !mm.resolve_fault(&vm, va(BASE + 2 * PAGE_SIZE)),
        "no descriptor of the failed mapping may survive"
    );
}

#[test]
#[should_panic(expected = "unknown mapping")]
fn unmap_twice_is_a_caller_bug() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let (handle, _backing) = file(&hello_page());

    let id = mm.map(handle, va(BASE), PAGE_SIZE, Permission::READ).unwrap();
    mm.unmap(&vm, id).unwrap();
    let _ = mm.unmap(&vm, id);
}

#[test]
fn write_back_survives_a_swap_round_trip() {
    // A single frame, so the dirty mapped page gets evicted and must come
    // back before the unmap can see it.
    let vm = vm(1, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let (handle, backing) = file(&hello_page());

    let id = mm
        .map(handle, va(BASE), PAGE_SIZE, Permission::READ | Permission::WRITE)
        .unwrap();
    mm.copy_to_user(&vm, va(BASE), b"WORLD").unwrap();

    // The stack page pushes the mapped page out to swap; the hardware
    // dirty bit is gone after the round trip, but the latched one is not.
    mm.setup_stack(&vm).unwrap();
    assert!(!mm.is_resident(va(BASE)));

    let mut probe = [0u8; 5];
    mm.copy_from_user(&vm, va(BASE), &mut probe).unwrap();
    assert_eq!(&probe, b"WORLD");
    assert!(mm.is_resident(va(BASE)));

    mm.unmap(&vm, id).unwrap();
    assert_eq!(
        &backing.snapshot()[..5],
        b"WORLD",
        "a modification must not be forgotten across eviction"
    );
}

#[test]
fn partial_page_write_back_respects_file_length() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let (handle, backing) = file(&[7u8; 100]);

    let id = mm
        .map(handle, va(BASE), 100, Permission::READ | Permission::WRITE)
        .unwrap();
    mm.copy_to_user(&vm, va(BASE), b"XY").unwrap();
    mm.unmap(&vm, id).unwrap();

    let data = backing.snapshot();
    assert_eq!(data.len(), 100, "write-back must not grow the file");
    assert_eq!(&data[..2], b"XY");
    assert!(data[2..].iter().all(|&b| b == 7), "bytes past the write keep their value");
}

#[test]
fn multi_page_mapping_faults_pages_independently() {
    let vm = vm(4, 64);
    let (mut mm, _aspace) = process(&vm, 1);
    let mut content = vec![b'x'; PAGE_SIZE];
    content.extend_from_slice(&[b'y'; PAGE_SIZE / 2]);
    let (handle, _backing) = file(&content);

    mm.map(handle, va(BASE), content.len(), Permission::READ)
        .unwrap();
    assert_eq!(vm.frames_in_use(), 0, "mapping alone materializes nothing");

    let mut buf = [0u8; 4];
    mm.copy_from_user(&vm, va(BASE + PAGE_SIZE), &mut buf).unwrap();
    assert_eq!(&buf, b"yyyy");
    assert_eq!(
        vm.frames_in_use(),
        1,
        "only the touched page gets a frame"
    );

    // The second page's tail, past the end of the file, reads as zeros.
    let mut tail = [0xFFu8; 8];
    mm.copy_from_user(&vm, va(BASE + PAGE_SIZE + PAGE_SIZE / 2), &mut tail)
        .unwrap();
    assert_eq!(tail, [0u8; 8]);
}
