use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use inline_hook::{Function, HookError, HookSettings, InlineHook, System};
use region::Protection;

type Add = extern "C" fn(i32, i32) -> i32;

/// mov eax, edi; add eax, esi; nop x4; ret
#[cfg(all(target_arch = "x86_64", not(windows)))]
const ADD: &[u8] = &[0x89, 0xf8, 0x01, 0xf0, 0x90, 0x90, 0x90, 0x90, 0xc3];
/// mov eax, ecx; add eax, edx; nop x4; ret
#[cfg(all(target_arch = "x86_64", windows))]
const ADD: &[u8] = &[0x89, 0xc8, 0x01, 0xd0, 0x90, 0x90, 0x90, 0x90, 0xc3];
/// mov eax, [esp+4]; add eax, [esp+8]; nop; ret
#[cfg(target_arch = "x86")]
const ADD: &[u8] = &[0x8b, 0x44, 0x24, 0x04, 0x03, 0x44, 0x24, 0x08, 0x90, 0xc3];

/// Routes `RUST_LOG` filtered output to the test harness
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Assembles `ADD` into a fresh read-execute page
fn assemble() -> (region::Allocation, Add) {
    let mut page = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
    unsafe {
        ptr::copy_nonoverlapping(ADD.as_ptr(), page.as_mut_ptr::<u8>(), ADD.len());
        region::protect(page.as_ptr::<u8>(), page.len(), Protection::READ_EXECUTE).unwrap();
    }
    let add = unsafe { <Add as Function>::from_ptr(page.as_ptr::<()>()) };
    (page, add)
}

/// First bytes of the assembled function
fn head(page: &region::Allocation) -> Vec<u8> {
    unsafe { slice::from_raw_parts(page.as_ptr::<u8>(), 32) }.to_vec()
}

static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

extern "C" fn doubled(a: i32, b: i32) -> i32 {
    let original = unsafe { <Add as Function>::from_ptr(ORIGINAL.load(Ordering::SeqCst) as _) };
    original(a, b) * 2
}

extern "C" fn negated(a: i32, b: i32) -> i32 {
    -(a + b)
}

#[test]
fn detour_end_to_end() {
    init_logging();
    let (page, add) = assemble();
    let pristine = head(&page);

    let mut hook = InlineHook::new(add, doubled as Add);
    let original = unsafe { hook.attach() }.unwrap();
    ORIGINAL.store(original.to_ptr() as usize, Ordering::SeqCst);

    assert_eq!(add(2, 3), 10);
    assert_eq!(original(2, 3), 5);
    assert_ne!(head(&page), pristine);

    unsafe { hook.detach() }.unwrap();
    assert_eq!(head(&page), pristine);
    assert_eq!(add(2, 3), 5);

    // a detached hook can be attached again
    let original = unsafe { hook.attach() }.unwrap();
    ORIGINAL.store(original.to_ptr() as usize, Ordering::SeqCst);
    assert_eq!(add(7, 8), 30);
    unsafe { hook.detach() }.unwrap();
    assert_eq!(add(7, 8), 15);
}

#[test]
fn drop_restores_target() {
    init_logging();
    let (page, add) = assemble();
    let pristine = head(&page);

    {
        let mut hook = InlineHook::new(add, negated as Add);
        unsafe { hook.attach() }.unwrap();
        assert_eq!(add(1, 2), -3);
    }

    assert_eq!(head(&page), pristine);
    assert_eq!(add(1, 2), 3);
}

#[test]
fn second_hook_on_same_target() {
    init_logging();
    let (page, add) = assemble();

    let mut first = InlineHook::new(add, negated as Add);
    let mut second = InlineHook::with_host(add, doubled as Add, HookSettings::default(), System);

    unsafe { first.attach() }.unwrap();
    let patched = head(&page);
    match unsafe { second.attach() } {
        Err(HookError::TargetInUse(address)) => assert_eq!(address, add.to_ptr() as usize),
        other => panic!("expected TargetInUse, got {:?}", other.map(|f| f.to_ptr())),
    }
    assert_eq!(head(&page), patched);
    assert_eq!(add(1, 2), -3);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn far_callback_without_relay() {
    init_logging();
    let (page, add) = assemble();
    let pristine = head(&page);

    let settings = HookSettings::default().with_relay(false);
    let mut hook = InlineHook::with_host(add, negated as Add, settings, System);

    // the test binary and a fresh page are not guaranteed to be within rel32 reach
    match unsafe { hook.attach() } {
        Ok(_) => {
            assert_eq!(add(1, 2), -3);
            unsafe { hook.detach() }.unwrap();
        }
        Err(HookError::Unreachable { to, .. }) => {
            assert_eq!(to, negated as *const () as usize);
            assert!(!hook.is_attached());
        }
        Err(e) => panic!("unexpected error: {}", e),
    }
    assert_eq!(head(&page), pristine);
}
