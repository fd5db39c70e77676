// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use winapi::shared::basetsd::SIZE_T;
use winapi::shared::minwindef::DWORD;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
use winapi::um::sysinfoapi::GetSystemInfo;
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

use super::RawMapping;

pub fn allocate(size: usize) -> io::Result<RawMapping> {
    let ptr = unsafe {
        VirtualAlloc(
            ptr::null_mut(),
            size as SIZE_T,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };

    if ptr.is_null() {
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
        VirtualFree(mapping.base as *mut _, 0, MEM_RELEASE);
    }
}

pub fn protect(page_ptr: *mut u8) -> io::Result<()> {
    let mut old_prot: DWORD = 0;

    let ret = unsafe {
        VirtualProtect(
            page_ptr as *mut _,
            page_size() as SIZE_T,
            PAGE_NOACCESS,
            &mut old_prot,
        )
    };

    if ret == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let mut ret = PAGE_SIZE.load(Ordering::Relaxed);
    if ret == 0 {
        ret = unsafe {
            let mut info = mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        };
        PAGE_SIZE.store(ret, Ordering::Relaxed);
    }
    ret
}

// Windows does not expose a stack-limit API analogous to getrlimit.
pub fn min_stack_size() -> usize {
    page_size()
}

pub fn max_stack_size() -> usize {
    1024 * 1024 * 1024
}
