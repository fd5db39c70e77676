// Copyright 2013 The Rust Project Developers. See the COPYRIGHT
// file at the top-level directory of this distribution and at
// http://rust-lang.org/COPYRIGHT.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The abstract growable-stack service and its default concrete backend.
//!
//! The growable-stack allocator itself -- reservation, on-demand paging,
//! guard pages, per-OS mmap/VirtualAlloc logic -- is treated as an
//! external collaborator; the [`GStack`] trait is the abstract "growable
//! stack" service the rest of the crate consumes. Everything else depends
//! only on the trait, never on [`ProtectedFixedSizeStack`] directly.

use std::io;

use crate::sys;

/// A stack a [`crate::context::Context`] can run on.
///
/// Implementations own the backing memory and are responsible for freeing
/// it on drop. The region between [`GStack::base`] and [`GStack::top`] is
/// available for the running prompt; [`GStack::reserve`] carves bytes off
/// the base for the `Prompt` header.
pub trait GStack {
    /// Highest usable address: the initial stack pointer handed to
    /// `make_fcontext`, since every architecture this crate targets has a
    /// descending stack.
    fn top(&self) -> *mut u8;

    /// Size in bytes of the currently-usable region (`top() - base()`).
    fn len(&self) -> usize;

    /// Lowest usable address.
    fn base(&self) -> *mut u8 {
        unsafe { self.top().sub(self.len()) }
    }

    /// Reserve `n` bytes at the base of the stack, shrinking the region `top()`/`len()` expose by
    /// the same amount. Called once by [`ProtectedFixedSizeStack::new`] to
    /// carve off its guard page, and once more by [`crate::prompt::allocate`]
    /// to place that stack's `Prompt` header at the (possibly already
    /// shrunk) base.
    fn reserve(&mut self, n: usize) -> *mut u8;
}

fn round_up_to(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A fixed-size growable stack, with an optional guard page at the low
/// (base) end.
///
/// "Growable" here means a generously-sized fixed commitment backed by a
/// guard page, rather than true on-demand paging -- the growable-stack
/// allocator's internals are an external collaborator, and the default
/// backend only needs to be *a* conforming implementation of [`GStack`],
/// not the only possible one.
pub struct FixedSizeStack {
    mapping: sys::RawMapping,
    /// Bytes carved off the base by `reserve`, including the guard page
    /// (if any) when this stack is protected.
    reserved: usize,
}

impl FixedSizeStack {
    /// Allocate an unprotected stack of at least `size` bytes (rounded up
    /// to the page size). Fails if `size` is zero or the allocation is
    /// refused by the OS.
    pub fn new(size: usize) -> io::Result<FixedSizeStack> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "delimcc: stack size must be non-zero",
            ));
        }

        let size = round_up_to(size, sys::page_size());
        let mapping = sys::allocate(size)?;

        Ok(FixedSizeStack {
            mapping,
            reserved: 0,
        })
    }
}

impl GStack for FixedSizeStack {
    fn top(&self) -> *mut u8 {
        unsafe { self.mapping.base.add(self.mapping.len) }
    }

    fn len(&self) -> usize {
        self.mapping.len - self.reserved
    }

    fn reserve(&mut self, n: usize) -> *mut u8 {
        let n = round_up_to(n, 16);
        debug_assert!(
            self.reserved + n <= self.mapping.len,
            "delimcc: reserve() request exceeds the stack's own size"
        );
        let ptr = unsafe { self.mapping.base.add(self.reserved) };
        self.reserved += n;
        ptr
    }
}

impl Drop for FixedSizeStack {
    fn drop(&mut self) {
        sys::deallocate(self.mapping);
    }
}

/// A [`FixedSizeStack`] with an unmapped/`PROT_NONE` guard page just below
/// its base. This is the default backend
/// `crate::init`/`crate::prompt_create` allocate from.
pub struct ProtectedFixedSizeStack {
    inner: FixedSizeStack,
}

impl ProtectedFixedSizeStack {
    pub fn new(size: usize) -> io::Result<ProtectedFixedSizeStack> {
        let page_size = sys::page_size();
        let mut inner = FixedSizeStack::new(size + page_size)?;
        let guard_page = inner.reserve(page_size);
        sys::protect(guard_page)?;
        Ok(ProtectedFixedSizeStack { inner })
    }

    /// Allocate with [`crate::config::GstackConfig::default`]'s sizing.
    pub fn default_sized() -> io::Result<ProtectedFixedSizeStack> {
        ProtectedFixedSizeStack::new(default_stack_size())
    }
}

impl GStack for ProtectedFixedSizeStack {
    fn top(&self) -> *mut u8 {
        self.inner.top()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn reserve(&mut self, n: usize) -> *mut u8 {
        self.inner.reserve(n)
    }
}

pub fn page_size() -> usize {
    sys::page_size()
}

pub fn default_stack_size() -> usize {
    sys::default_stack_size()
}

pub fn min_stack_size() -> usize {
    sys::min_stack_size()
}

pub fn max_stack_size() -> usize {
    sys::max_stack_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_size_stack_layout() {
        let stack = FixedSizeStack::new(page_size() * 4).unwrap();
        assert_eq!(stack.len(), page_size() * 4);
        assert_eq!(unsafe { stack.top().sub(stack.len()) }, stack.base());
    }

    #[test]
    fn reserve_shrinks_usable_region() {
        let mut stack = FixedSizeStack::new(page_size() * 4).unwrap();
        let full = stack.len();
        let header = stack.reserve(64);
        assert_eq!(header, stack.mapping.base);
        assert!(stack.len() < full);
        assert_eq!(stack.base() as usize, header as usize + 64);
    }

    #[test]
    fn protected_stack_excludes_guard_page() {
        let stack = ProtectedFixedSizeStack::new(page_size() * 4).unwrap();
        assert_eq!(stack.len(), page_size() * 4);
    }

    #[test]
    fn rejects_zero_size() {
        assert!(FixedSizeStack::new(0).is_err());
    }
}
