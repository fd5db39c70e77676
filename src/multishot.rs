// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-shot save & restore.
//!
//! A multi-handle wraps a heap-allocated [`MultiResumption`] record. Each
//! `mresume` either restores a previously taken snapshot, takes a fresh
//! one (if the continuation might still be observed again), or consumes
//! the chain in place if this is provably the only remaining reference.

use std::cell::Cell;
use std::ptr::NonNull;

use log::trace;

use crate::context::Context;
use crate::prompt::{self, AnyBox, Prompt};

/// One prompt's saved stack bytes, captured top-first.
struct SavedStack {
    prompt: NonNull<Prompt>,
    bytes: Vec<u8>,
    /// Offset from the prompt's `gstack` base at which `bytes` begins.
    offset: usize,
}

/// The heap record a multi-handle points to.
pub struct MultiResumption {
    refcount: Cell<usize>,
    resume_count: Cell<usize>,
    prompt: NonNull<Prompt>,
    save: std::cell::RefCell<Option<Vec<SavedStack>>>,
    /// Whether the tail-resume fast path (`engine::try_tail_resume`) is
    /// still available: true until the first resume of this continuation,
    /// by any path, consumes it. Only the first multi-resume can keep the
    /// tail property this way; every later one falls back to an ordinary
    /// nested call through `mresume` (see `DESIGN.md`'s Open Questions
    /// section for why this is a documented simplification rather than a
    /// full realization of spec §4.4's `tail_return_point`).
    tail_eligible: Cell<bool>,
}

/// Allocate a fresh record for a just-yielded-multi prompt.
pub(crate) fn allocate(p: NonNull<Prompt>) -> NonNull<MultiResumption> {
    let record = Box::new(MultiResumption {
        refcount: Cell::new(1),
        resume_count: Cell::new(0),
        prompt: p,
        save: std::cell::RefCell::new(None),
        tail_eligible: Cell::new(true),
    });
    NonNull::from(Box::leak(record))
}

/// # Safety
/// `r` must point to a live `MultiResumption`.
pub(crate) unsafe fn dup(r: NonNull<MultiResumption>) -> NonNull<MultiResumption> {
    let rec = r.as_ref();
    rec.refcount.set(rec.refcount.get() + 1);
    r
}

/// # Safety
/// `r` must point to a live `MultiResumption`, not concurrently dropped
/// elsewhere.
pub(crate) unsafe fn drop_ref(r: NonNull<MultiResumption>) {
    let rec = r.as_ref();
    let rc = rec.refcount.get();
    debug_assert!(rc > 0, "delimcc: MultiResumption refcount underflow");
    if rc > 1 {
        rec.refcount.set(rc - 1);
        return;
    }

    trace!("multishot: freeing record {:p}", r.as_ptr());
    if let Some(saves) = rec.save.borrow_mut().take() {
        for entry in saves {
            prompt::drop_ref(entry.prompt);
        }
    }
    prompt::drop_ref(rec.prompt);
    drop(Box::from_raw(r.as_ptr()));
}

/// `resume_count(r)`.
pub(crate) unsafe fn resume_count(r: NonNull<MultiResumption>) -> usize {
    r.as_ref().resume_count.get()
}

/// `should_unwind(r)`: unique and never-resumed.
pub(crate) unsafe fn should_unwind(r: NonNull<MultiResumption>) -> bool {
    let rec = r.as_ref();
    rec.refcount.get() == 1 && rec.resume_count.get() == 0
}

/// Walk the captured sub-chain headed by `r.prompt`, top-first, saving
/// each prompt's used stack bytes.
///
/// `r.prompt.top` names the outermost prompt of the captured sub-chain
/// (set by whichever `prompt_unlink` suspended it); every other member of
/// the sub-chain is only reachable from there by walking `parent` links
/// back down to `r.prompt` itself, since `prompt_unlink` only ever updates
/// the `top` field of the prompt it is directly called on, not of the
/// intermediate prompts it carries along with it.
fn save_walk(rec: &MultiResumption) -> Vec<SavedStack> {
    let mut saves = Vec::new();
    let top = unsafe { rec.prompt.as_ref() }.top.get().unwrap_or(rec.prompt);
    let mut cur = Some(top);
    let mut first = true;
    while let Some(p) = cur {
        let prompt = unsafe { p.as_ref() };
        // The top-of-capture prompt's used range starts at its
        // resume_point; every ancestor's starts at its return_point --
        // both are populated once a prompt is suspended.
        let sp = if first {
            prompt
                .resume_point()
                .context
                .as_ref()
                .map(Context::sp)
                .unwrap_or_else(|| prompt.gstack.top() as usize)
        } else {
            prompt
                .return_point()
                .context
                .as_ref()
                .map(Context::sp)
                .unwrap_or_else(|| prompt.gstack.top() as usize)
        };

        let base = prompt.gstack.base() as usize;
        let top = prompt.gstack.top() as usize;
        let sp = sp.clamp(base, top);
        let len = top - sp;
        let bytes = unsafe { std::slice::from_raw_parts(sp as *const u8, len).to_vec() };

        saves.push(SavedStack {
            prompt: unsafe { prompt::dup(p) },
            bytes,
            offset: sp - base,
        });

        first = false;
        cur = if p == rec.prompt {
            None
        } else {
            prompt.parent.get()
        };
    }
    saves
}

/// Copy each save entry's bytes back into its prompt's growable stack.
fn restore_walk(saves: &[SavedStack]) {
    for entry in saves {
        let prompt = unsafe { entry.prompt.as_ref() };
        let base = prompt.gstack.base() as usize;
        let dst = (base + entry.offset) as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(entry.bytes.as_ptr(), dst, entry.bytes.len()) };
    }
}

/// Shared pre-resume bookkeeping for both [`mresume`] and
/// [`try_tail_resume`]: bump `resume_count`, decide whether to restore a
/// prior snapshot, take a fresh one, or consume the chain in place, and
/// consume the tail-fast-path eligibility. Stops short of calling into the
/// engine -- the two callers differ only in how they do that part.
fn prepare_resume(rec: &MultiResumption) {
    rec.resume_count.set(rec.resume_count.get() + 1);
    rec.tail_eligible.set(false);

    let mut save_slot = rec.save.borrow_mut();
    if let Some(saves) = save_slot.as_ref() {
        trace!("mresume: restoring {} saved stacklet(s)", saves.len());
        restore_walk(saves);
    } else if rec.refcount.get() > 1 || unsafe { rec.prompt.as_ref() }.refcount.get() > 1 {
        trace!("mresume: snapshotting before consuming the chain");
        *save_slot = Some(save_walk(rec));
    }
    // else: sole owner and chain will be consumed by this resume, no
    // snapshot needed.
}

/// `mresume(r, arg)`.
pub(crate) fn mresume(r: NonNull<MultiResumption>, arg: AnyBox) -> AnyBox {
    let rec = unsafe { r.as_ref() };
    prepare_resume(rec);

    let p = unsafe { prompt::dup(rec.prompt) };
    unsafe { drop_ref(r) };
    crate::engine::resume_prompt_low(p, arg)
}

/// Attempt the tail fast path for a multi-handle: only the continuation's
/// first resume is still eligible (`tail_eligible`), the crate's
/// realization of spec §4.4's "`tail_return_point` ... preserved to allow a
/// tail-resume fast path" under the `Context`-collapsed design engine.rs
/// documents (there is no separate register-context value to stash here;
/// what matters is whether the engine's resume-tail loop can still pick the
/// prompt up directly instead of recursing through [`mresume`]).
///
/// On success, returns the prompt to resume and leaves the caller to drive
/// it through the same loop a once-handle's tail-resume uses, so the first
/// multi-resume costs no extra native stack frame. On a later resume of the
/// same handle, returns `None` and the caller falls back to [`mresume`].
pub(crate) fn try_tail_resume(r: NonNull<MultiResumption>) -> Option<NonNull<Prompt>> {
    let rec = unsafe { r.as_ref() };
    if !rec.tail_eligible.get() {
        return None;
    }
    prepare_resume(rec);

    let p = unsafe { prompt::dup(rec.prompt) };
    unsafe { drop_ref(r) };
    Some(p)
}
