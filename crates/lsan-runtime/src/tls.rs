//! Static TLS layout discovery.
//!
//! The leak scanner treats every thread's static TLS block as a root
//! region, so it needs to know how big that block is. We sum the `PT_TLS`
//! segments of every loaded object, rounding each to its alignment.

use std::sync::atomic::{AtomicUsize, Ordering};

static STATIC_TLS_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Size recorded by the last `init_tls_size`.
pub fn static_tls_size() -> usize {
    STATIC_TLS_SIZE.load(Ordering::Acquire)
}

fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe extern "C" fn sum_tls_segments(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let total = &mut *(data as *mut usize);
    let info = &*info;
    if info.dlpi_phdr.is_null() {
        return 0;
    }
    let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    for phdr in headers.iter().filter(|p| p.p_type == libc::PT_TLS) {
        *total = align_up(*total, phdr.p_align as usize) + phdr.p_memsz as usize;
    }
    0
}

/// Walk the loaded objects and record the static TLS size. Returns it.
pub fn init_tls_size() -> usize {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let total = {
        let mut total = 0usize;
        unsafe {
            libc::dl_iterate_phdr(
                Some(sum_tls_segments),
                &mut total as *mut usize as *mut libc::c_void,
            );
        }
        total
    };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let total = 0usize;

    STATIC_TLS_SIZE.store(total, Ordering::Release);
    total
}
