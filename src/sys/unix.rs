// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::RawMapping;

/// Reserve `size` bytes of anonymous memory, committed up front. `size` must
/// already be a multiple of the page size; callers (see `stack.rs`) round up
/// before calling in.
pub fn allocate(size: usize) -> io::Result<RawMapping> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(RawMapping {
            base: ptr as *mut u8,
            len: size,
        })
    }
}

pub fn deallocate(mapping: RawMapping) {
    unsafe {
        libc::munmap(mapping.base as *mut libc::c_void, mapping.len);
    }
}

/// Mark one page starting at `page_ptr` as inaccessible, to serve as a guard
/// page at the low end of a descending stack.
pub fn protect(page_ptr: *mut u8) -> io::Result<()> {
    let ret = unsafe {
        libc::mprotect(
            page_ptr as *mut libc::c_void,
            page_size(),
            libc::PROT_NONE,
        )
    };

    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut ret = PAGE_SIZE.load(Ordering::Relaxed);
    if ret == 0 {
        ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(ret, Ordering::Relaxed);
    }
    ret
}

pub fn min_stack_size() -> usize {
    page_size()
}

pub fn max_stack_size() -> usize {
    let mut limit = unsafe { std::mem::zeroed::<libc::rlimit>() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) };

    if ret != 0 || limit.rlim_max == libc::RLIM_INFINITY {
        1024 * 1024 * 1024
    } else {
        limit.rlim_max as usize
    }
}
