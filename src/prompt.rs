// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Prompt objects and the thread-local active chain.
//!
//! A [`Prompt`] is a node owned by exactly one reference at a time (a
//! [`crate::tag::Handle`], a parent link, or a [`crate::multishot::SavedStack`]
//! entry); its refcount is a plain [`Cell`] rather than `Rc`'s because the
//! increments/decrements here follow a manual `prompt_dup`/`prompt_drop`
//! protocol, not `Clone`/`Drop`.
//!
//! The prompt header lives at the base of its own growable stack (spec §3:
//! "no separate header allocation"), carved off via [`crate::stack::GStack::reserve`]
//! the same way [`crate::stack::ProtectedFixedSizeStack`] carves off its guard
//! page. Because of that, freeing a prompt can't be an ordinary `Drop`: the
//! `gstack` field living inside the header owns the memory the header
//! itself is embedded in, so [`drop_ref`]'s teardown has to move `gstack`
//! out and drop it *last*, after every other heap-owned field -- see
//! [`free_prompt`].

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::ptr::NonNull;

use log::trace;

use crate::context::Context;
use crate::stack::GStack;
use crate::tag::Handle;

/// Type-erased payload crossing a prompt boundary. The raw machine
/// protocol passes a `void*`/`usize`; the Rust-level engine
/// boxes values instead, the same translation the rest of this crate's
/// "machine value" plumbing makes throughout.
pub type AnyBox = Box<dyn Any + Send>;

/// The closure run when a prompt is first entered: `start_fun` and
/// `start_arg` collapsed into one `FnOnce`, capturing
/// `start_arg` directly rather than storing it as a separate field.
pub type StartFn = Box<dyn FnOnce(Handle, AnyBox) -> AnyBox>;

/// The closure passed to `yield`/`yieldm`, invoked by the Control-Transfer
/// Engine's dispatch-at-return-point step with the
/// resumption handle and the yielded argument.
pub type YieldFn = Box<dyn FnOnce(Handle, AnyBox) -> AnyBox>;

/// What kind of transfer landed at a `return_point`.
pub enum TransferKind {
    /// Not yet used; the slot has been allocated but nothing has jumped
    /// into it yet.
    Pending,
    Return,
    YieldOnce,
    YieldMulti,
    Exception,
}

/// Register-context snapshot allocated on the parent stack frame that
/// entered or resumed a prompt. Doubles as the tagged result area the
/// engine's dispatch step reads.
pub struct ReturnPoint {
    pub(crate) context: Option<Context>,
    pub(crate) kind: TransferKind,
    pub(crate) fun: Option<YieldFn>,
    pub(crate) arg: Option<AnyBox>,
    /// Captured panic payload, valid iff `kind` is `Exception`.
    pub(crate) exception: Option<Box<dyn Any + Send>>,
}

impl ReturnPoint {
    pub fn empty() -> ReturnPoint {
        ReturnPoint {
            context: None,
            kind: TransferKind::Pending,
            fun: None,
            arg: None,
            exception: None,
        }
    }
}

/// Register-context snapshot allocated on the prompt's own stack frame at
/// its most recent yield. `result` carries the
/// value handed back across the **PR → Y** transition.
pub struct ResumePoint {
    pub(crate) context: Option<Context>,
    pub(crate) result: Option<AnyBox>,
}

impl ResumePoint {
    pub fn empty() -> ResumePoint {
        ResumePoint {
            context: None,
            result: None,
        }
    }
}

/// A delimited stack segment.
pub struct Prompt {
    pub(crate) parent: Cell<Option<NonNull<Prompt>>>,
    pub(crate) top: Cell<Option<NonNull<Prompt>>>,
    pub(crate) refcount: Cell<usize>,
    pub(crate) gstack: Box<dyn GStack>,
    pub(crate) return_point: UnsafeCell<ReturnPoint>,
    pub(crate) resume_point: UnsafeCell<ResumePoint>,
    pub(crate) start_fn: UnsafeCell<Option<StartFn>>,
    /// Opaque token handed to the backtrace adapter; meaningless unless
    /// the `backtrace` feature is enabled.
    pub(crate) unwind_frame: Cell<u64>,
}

impl Prompt {
    /// `top == null` iff active.
    pub fn is_active(&self) -> bool {
        self.top.get().is_none()
    }

    pub fn is_suspended(&self) -> bool {
        !self.is_active()
    }

    pub(crate) fn return_point(&self) -> &mut ReturnPoint {
        unsafe { &mut *self.return_point.get() }
    }

    pub(crate) fn resume_point(&self) -> &mut ResumePoint {
        unsafe { &mut *self.resume_point.get() }
    }
}

thread_local! {
    /// The thread-local `current_top`: the stack on which this thread is
    /// presently running. `None` means the thread is running on its own
    /// native stack, outside any prompt.
    static CURRENT_TOP: Cell<Option<NonNull<Prompt>>> = Cell::new(None);
}

/// `prompt_top()`.
pub fn prompt_top() -> Option<NonNull<Prompt>> {
    CURRENT_TOP.with(|c| c.get())
}

fn set_current_top(p: Option<NonNull<Prompt>>) {
    CURRENT_TOP.with(|c| c.set(p));
}

/// `prompt_parent(p)`: with `None`, equivalent to
/// [`prompt_top`].
pub fn prompt_parent(p: Option<NonNull<Prompt>>) -> Option<NonNull<Prompt>> {
    match p {
        None => prompt_top(),
        Some(p) => unsafe { p.as_ref().parent.get() },
    }
}

/// Walk from the current top toward the root looking for `p`: the
/// precondition a yield target must satisfy, "`p` is an ancestor of the
/// current top".
pub fn is_ancestor_of_current_top(p: NonNull<Prompt>) -> bool {
    let mut cur = prompt_top();
    while let Some(node) = cur {
        if node == p {
            return true;
        }
        cur = unsafe { node.as_ref().parent.get() };
    }
    false
}

/// Allocate a suspended prompt: growable stack via the collaborator,
/// header placed at the stack's own base via [`GStack::reserve`], `top :=
/// self`, `refcount := 1`, `start_fn` set. Returns the owning pointer;
/// callers wrap it as a once-[`Handle`].
pub fn allocate(mut gstack: Box<dyn GStack>, start_fn: StartFn) -> NonNull<Prompt> {
    let header_ptr = gstack.reserve(mem::size_of::<Prompt>()) as *mut Prompt;
    debug_assert!(!header_ptr.is_null(), "delimcc: GStack::reserve returned null");
    unsafe {
        header_ptr.write(Prompt {
            parent: Cell::new(None),
            top: Cell::new(None),
            refcount: Cell::new(1),
            gstack,
            return_point: UnsafeCell::new(ReturnPoint::empty()),
            resume_point: UnsafeCell::new(ResumePoint::empty()),
            start_fn: UnsafeCell::new(Some(start_fn)),
            unwind_frame: Cell::new(0),
        });
    }
    let ptr = unsafe { NonNull::new_unchecked(header_ptr) };
    unsafe { ptr.as_ref().top.set(Some(ptr)) };
    trace!("prompt_create: {:p}", ptr.as_ptr());
    ptr
}

/// Tear down a single prompt whose header lives at the base of its own
/// growable stack. Every other heap-owned field is dropped first; `gstack`
/// is read out and dropped last since dropping it unmaps the memory the
/// header itself sits in.
///
/// # Safety
/// `p` must not be read again after this call returns.
unsafe fn free_prompt(p: NonNull<Prompt>) {
    let prompt_ptr = p.as_ptr();
    let prompt = &*prompt_ptr;

    drop((*prompt.start_fn.get()).take());
    let rp = prompt.return_point();
    drop(rp.context.take());
    drop(rp.fun.take());
    drop(rp.arg.take());
    drop(rp.exception.take());
    let sp = prompt.resume_point();
    drop(sp.context.take());
    drop(sp.result.take());

    let gstack = std::ptr::read(&prompt.gstack as *const Box<dyn GStack>);
    drop(gstack);
}

/// `prompt_link(p, ret)`.
///
/// # Safety
/// `p` must point to a suspended, live `Prompt`.
pub unsafe fn link(p: NonNull<Prompt>, ret: Option<Context>) -> Option<Context> {
    let prompt = p.as_ref();
    debug_assert!(prompt.is_suspended(), "delimcc: prompt_link on active prompt");

    prompt.parent.set(prompt_top());
    set_current_top(prompt.top.get());
    prompt.top.set(None);
    crate::backtrace::notify_link(p);

    if let Some(ret) = ret {
        prompt.return_point().context = Some(ret);
    }

    prompt.resume_point().context.take()
}

/// `prompt_unlink(p, res)`.
///
/// # Safety
/// `p` must be an ancestor of the current top.
pub unsafe fn unlink(p: NonNull<Prompt>, res: Option<Context>) -> Option<Context> {
    let prompt = p.as_ref();
    debug_assert!(prompt.is_active(), "delimcc: prompt_unlink on suspended prompt");

    prompt.top.set(prompt_top());
    set_current_top(prompt.parent.get());
    prompt.parent.set(None);
    prompt.resume_point().context = res;

    // `return_point`'s context is consumed here and repopulated by the
    // engine once the jump back to the caller actually lands (see
    // `engine::yield_internal`'s Y transition and `entry_trampoline`'s
    // initial capture) -- there is no stale value to preserve across it.
    prompt.return_point().context.take()
}

/// `prompt_dup(p)`.
///
/// # Safety
/// `p` must point to a live `Prompt`.
pub unsafe fn dup(p: NonNull<Prompt>) -> NonNull<Prompt> {
    let prompt = p.as_ref();
    prompt.refcount.set(prompt.refcount.get() + 1);
    p
}

/// `prompt_drop(p)`: decrement refcount, freeing the prompt and
/// recursively its suspended sub-chain (`p.top`) when it reaches zero.
///
/// The chain-free walk assumes each intermediate suspended prompt in the
/// sub-chain is uniquely owned — asserted here rather than silently
/// handled.
///
/// # Safety
/// `p` must point to a live `Prompt`, not concurrently dropped elsewhere.
pub unsafe fn drop_ref(p: NonNull<Prompt>) {
    let prompt = p.as_ref();
    let rc = prompt.refcount.get();
    debug_assert!(rc > 0, "delimcc: refcount underflow");
    if rc > 1 {
        prompt.refcount.set(rc - 1);
        return;
    }

    trace!("prompt_drop: freeing {:p}", p.as_ptr());

    // Free the suspended sub-chain headed by `top`, top-first, down to
    // and including `p` itself -- `p` is the root of its own captured
    // sub-chain (its `parent` is `None` while suspended) and is reached
    // by this same `parent` walk, not freed separately from it; walking
    // from `top` and stopping once the node being freed is `p` mirrors
    // `multishot::save_walk`'s identical top-to-root traversal.
    let top = prompt.top.get().unwrap_or(p);
    let mut next = Some(top);
    while let Some(node) = next {
        let is_root = node == p;
        if !is_root {
            let node_ref = node.as_ref();
            debug_assert_eq!(
                node_ref.refcount.get(),
                1,
                "delimcc: intermediate suspended prompt must be uniquely owned"
            );
            next = node_ref.parent.get();
        } else {
            next = None;
        }
        free_prompt(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ProtectedFixedSizeStack;

    fn dummy_stack() -> Box<dyn GStack> {
        Box::new(ProtectedFixedSizeStack::new(crate::stack::default_stack_size()).unwrap())
    }

    #[test]
    fn fresh_prompt_is_suspended_and_is_its_own_top() {
        let p = allocate(dummy_stack(), Box::new(|_h, a| a));
        unsafe {
            assert!(p.as_ref().is_suspended());
            assert_eq!(p.as_ref().top.get(), Some(p));
            drop_ref(p);
        }
    }

    #[test]
    fn link_unlink_round_trip_restores_top() {
        let p = allocate(dummy_stack(), Box::new(|_h, a| a));
        assert_eq!(prompt_top(), None);
        unsafe {
            let _ = link(p, None);
            assert!(p.as_ref().is_active());
            assert_eq!(prompt_top(), Some(p));

            let _ = unlink(p, None);
            assert!(p.as_ref().is_suspended());
            assert_eq!(prompt_top(), None);

            drop_ref(p);
        }
    }
}
