// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resumption handle tag encoding.
//!
//! A resumption handle is a single pointer-sized word. The low bit is used
//! as a tag so that an at-most-once resumption costs nothing beyond the
//! `Prompt` it already owns: no separate heap record, no separate enum
//! discriminant word.

use std::ptr::NonNull;

use crate::multishot::MultiResumption;
use crate::prompt::Prompt;

const MULTI_TAG: usize = 0b1;

/// Assumed minimum alignment of both tagged pointee types. Both `Prompt`
/// and `MultiResumption` are heap-allocated Rust structs, whose alignment
/// is always at least that of a `usize` on every target this crate
/// supports, so one low bit is always free.
const _: () = assert!(MULTI_TAG < std::mem::align_of::<usize>());

/// A tagged resumption handle: either a once-handle (a bare `Prompt`
/// pointer) or a multi-handle (a pointer to a heap-allocated
/// [`MultiResumption`], with bit 0 set).
///
/// Encoding is lossless and branch-predictable: [`Handle::once`]
/// and [`Handle::multi`] construct; [`Handle::as_once`] and
/// [`Handle::as_multi`] inspect.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handle(usize);

impl Handle {
    /// Wrap a prompt pointer as a once-handle.
    pub fn once(prompt: NonNull<Prompt>) -> Handle {
        let bits = prompt.as_ptr() as usize;
        debug_assert_eq!(bits & MULTI_TAG, 0, "delimcc: Prompt underaligned");
        Handle(bits)
    }

    /// Wrap a `MultiResumption` pointer as a multi-handle.
    pub fn multi(record: NonNull<MultiResumption>) -> Handle {
        let bits = record.as_ptr() as usize;
        debug_assert_eq!(bits & MULTI_TAG, 0, "delimcc: MultiResumption underaligned");
        Handle(bits | MULTI_TAG)
    }

    /// True iff this is a multi-handle.
    pub fn is_multi(self) -> bool {
        self.0 & MULTI_TAG != 0
    }

    /// Recover the prompt pointer, if this is a once-handle.
    pub fn as_once(self) -> Option<NonNull<Prompt>> {
        if self.is_multi() {
            None
        } else {
            NonNull::new(self.0 as *mut Prompt)
        }
    }

    /// Recover the `MultiResumption` pointer, if this is a multi-handle.
    pub fn as_multi(self) -> Option<NonNull<MultiResumption>> {
        if self.is_multi() {
            NonNull::new((self.0 & !MULTI_TAG) as *mut MultiResumption)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Prompt's own layout isn't exercised here, only the tag bit math, so a
    // correctly aligned dummy allocation stands in for a real Prompt.
    #[test]
    fn once_roundtrips() {
        let storage: Box<u64> = Box::new(0);
        let ptr = NonNull::new(Box::into_raw(storage) as *mut Prompt).unwrap();
        let h = Handle::once(ptr);
        assert!(!h.is_multi());
        assert_eq!(h.as_once(), Some(ptr));
        assert_eq!(h.as_multi(), None);
        unsafe { drop(Box::from_raw(ptr.as_ptr() as *mut u64)) };
    }
}
