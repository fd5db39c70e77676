// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The Control-Transfer Engine: the four transitions PI, P,
//! PR, Y, expressed in terms of [`Context::resume`]/[`Context::resume_ontop`]
//! rather than a raw save/restore-context pair for a setjmp/longjmp-style
//! collaborator.
//!
//! A `Context::resume()` call both captures the caller's own machine state
//! *and* switches to the target in one step, so the two-part "allocate a
//! return_point, save into it, dispatch on how we arrived" protocol
//! collapses: the context that arrives in a `Transfer`
//! on one side is installed into the other side's `return_point`/
//! `resume_point` immediately *after* the jump returns, rather than
//! pre-populated before it. The chain bookkeeping
//! `prompt_link`/`prompt_unlink` perform is unaffected and is called
//! exactly where this collapse requires it.
//!
//! `prompt_resume_tail` is the one place this collapse
//! isn't free: an O(1)-parent-stack-space guarantee needs a chain of
//! tail-resumes to *not* grow the native call stack, but an ordinary
//! nested `resume()` call from inside a yield handler does exactly that
//! (Rust gives no TCO guarantee, especially across a `Box<dyn FnOnce>`
//! and a `catch_unwind` boundary). [`resume_tail`] therefore doesn't
//! recurse at all: it posts a thread-local request and returns a
//! placeholder, and the one true trampoline loop in
//! [`run_once_handle_loop`] picks the request up and continues in the
//! same stack frame. This only works when `resume_tail`'s result is
//! itself the tail expression of the yield handler; calling
//! it any other way returns the placeholder `()`, which is a caller
//! error this crate does not attempt to detect (see `DESIGN.md`).

use std::cell::RefCell;
use std::ptr::NonNull;

use log::trace;

use crate::context::{Context, Transfer};
use crate::error::{Error, Misuse};
use crate::prompt::{self, AnyBox, Prompt, StartFn, TransferKind, YieldFn};
use crate::stack::GStack;
use crate::tag::Handle;

/// `prompt_create(start_fun, start_arg) -> handle`.
pub fn prompt_create(gstack: Box<dyn GStack>, start_fn: StartFn) -> Handle {
    let p = prompt::allocate(gstack, start_fn);
    Handle::once(p)
}

/// `prompt(fun, arg) -> result`: create and immediately enter a
/// fresh prompt.
pub fn prompt(
    gstack: Box<dyn GStack>,
    fun: impl FnOnce(Handle, AnyBox) -> AnyBox + 'static,
    arg: AnyBox,
) -> AnyBox {
    let handle = prompt_create(gstack, Box::new(fun));
    resume(handle, arg)
}

/// `resume(handle, arg) -> result`: dispatches once vs. multi.
///
/// # Panics
/// Propagates (via [`std::panic::resume_unwind`]) an exception that
/// crossed the prompt boundary.
pub fn resume(handle: Handle, arg: AnyBox) -> AnyBox {
    if let Some(record) = handle.as_multi() {
        crate::multishot::mresume(record, arg)
    } else {
        let p = handle.as_once().expect("delimcc: malformed handle");
        run_once_handle_loop(p, arg)
    }
}

/// `resume_tail(handle, arg) -> result`.
///
/// Call this only as the final expression of a `yield`/`yieldm` handler.
/// It does not itself perform the resume; it posts a request that the
/// engine's trampoline (running one frame up, inside [`dispatch`]/
/// [`run_once_handle_loop`]) picks up once the handler returns, so a
/// chain of these through the same two prompts runs in bounded parent
/// (native) stack space. See the module doc comment.
pub fn resume_tail(handle: Handle, arg: AnyBox) -> AnyBox {
    TAIL_REQUEST.with(|slot| *slot.borrow_mut() = Some((handle, arg)));
    Box::new(())
}

/// `resume_drop(handle)`.
pub fn resume_drop(handle: Handle) {
    if let Some(record) = handle.as_multi() {
        unsafe { crate::multishot::drop_ref(record) };
    } else if let Some(p) = handle.as_once() {
        unsafe { prompt::drop_ref(p) };
    }
}

/// `resume_dup(handle) -> handle`. Fails on once-handles.
pub fn resume_dup(handle: Handle) -> Result<Handle, Error> {
    if let Some(record) = handle.as_multi() {
        Ok(Handle::multi(unsafe { crate::multishot::dup(record) }))
    } else {
        Err(Error::Misuse(Misuse::DupOnceHandle))
    }
}

/// `resume_resume_count(handle) -> n` (0 for once).
pub fn resume_resume_count(handle: Handle) -> usize {
    handle
        .as_multi()
        .map(|r| unsafe { crate::multishot::resume_count(r) })
        .unwrap_or(0)
}

/// `resume_should_unwind(handle) -> bool`.
pub fn resume_should_unwind(handle: Handle) -> bool {
    handle
        .as_multi()
        .map(|r| unsafe { crate::multishot::should_unwind(r) })
        .unwrap_or(false)
}

/// `yield(p, fun, arg) -> result`: yield with an at-most-once resumption.
pub fn yield_(target: NonNull<Prompt>, fun: YieldFn, arg: AnyBox) -> AnyBox {
    yield_internal(target, fun, arg, false)
}

/// `yieldm(p, fun, arg) -> result`: yield with a multi-shot resumption.
pub fn yieldm(target: NonNull<Prompt>, fun: YieldFn, arg: AnyBox) -> AnyBox {
    yield_internal(target, fun, arg, true)
}

/// Shared implementation of [`yield_`]/[`yieldm`].
pub(crate) fn yield_internal(
    target: NonNull<Prompt>,
    fun: YieldFn,
    arg: AnyBox,
    multi: bool,
) -> AnyBox {
    if !prompt::is_ancestor_of_current_top(target) {
        crate::error::fatal("yield target is not an ancestor of the current top");
    }

    let return_ctx = unsafe { prompt::unlink(target, None) }
        .unwrap_or_else(|| crate::error::fatal("yield target has no return point to jump to"));

    {
        let tp = unsafe { target.as_ref() };
        let rp = tp.return_point();
        rp.kind = if multi {
            TransferKind::YieldMulti
        } else {
            TransferKind::YieldOnce
        };
        rp.fun = Some(fun);
        rp.arg = Some(arg);
    }

    trace!("yield: -> prompt {:p} (multi={})", target.as_ptr(), multi);
    let t = unsafe { return_ctx.resume(target.as_ptr() as usize) };

    // Transition Y: we've been resumed. `t.context` is the resumer's own
    // now-suspended frame -- the place this prompt's *next* yield/return
    // must jump back to, i.e. its return_point, not its resume_point
    // (which names where to jump *into* this prompt, and is written by
    // whoever captures this exact suspension point -- `run_once_handle_loop`
    // below, not here).
    let tp = unsafe { target.as_ref() };
    tp.return_point().context = Some(t.context);
    tp.resume_point()
        .result
        .take()
        .unwrap_or_else(|| crate::error::fatal("resumed without a value"))
}

thread_local! {
    /// Set by [`resume_tail`]; drained by [`run_once_handle_loop`].
    static TAIL_REQUEST: RefCell<Option<(Handle, AnyBox)>> = RefCell::new(None);

    /// Set by `delayed_drop_ontop` right before it frees a just-finished
    /// prompt, and drained by `run_once_handle_loop` as soon as control
    /// returns to it. The prompt's own `return_point` cannot be read at
    /// that point in the RETURN/EXCEPTION case -- `delayed_drop_ontop` may
    /// already have freed it -- so the terminal payload has to cross
    /// through something that outlives the prompt itself.
    static FINISHED: RefCell<Option<Finished>> = RefCell::new(None);
}

/// A terminal outcome relayed from `delayed_drop_ontop` to whichever
/// `run_once_handle_loop` iteration is woken up by its `resume_ontop`.
enum Finished {
    Return(AnyBox),
    Exception(Box<dyn std::any::Any + Send>),
}

fn take_tail_request() -> Option<(Handle, AnyBox)> {
    TAIL_REQUEST.with(|slot| slot.borrow_mut().take())
}

fn take_finished() -> Option<Finished> {
    FINISHED.with(|slot| slot.borrow_mut().take())
}

/// Runs the **PI/PR → P** transitions for an once-handle prompt in a
/// loop, so that a chain of `resume_tail` requests through once-handles
/// never grows the native call stack.
fn run_once_handle_loop(mut p: NonNull<Prompt>, mut arg: AnyBox) -> AnyBox {
    loop {
        let prompt = unsafe { p.as_ref() };
        if prompt.is_active() {
            crate::error::fatal("resume of an already-active prompt");
        }

        let resume_ctx = unsafe { prompt::link(p, None) };
        prompt.resume_point().result = Some(arg);

        let t = match resume_ctx {
            Some(ctx) => {
                trace!("resume (PR): prompt {:p}", p.as_ptr());
                unsafe { ctx.resume(p.as_ptr() as usize) }
            }
            None => {
                trace!("resume (PI): prompt {:p}", p.as_ptr());
                let ctx = unsafe { Context::new(&*prompt.gstack, entry_trampoline) };
                unsafe { ctx.resume(p.as_ptr() as usize) }
            }
        };

        // The RETURN/EXCEPTION case has already been drained into
        // `FINISHED` by `delayed_drop_ontop`, on the other side of the
        // jump that just woke us up -- `p` may already be freed by now, so
        // this has to be checked before touching `prompt` again.
        if let Some(finished) = take_finished() {
            return match finished {
                Finished::Return(value) => {
                    trace!("dispatch: RETURN (prompt already freed)");
                    value
                }
                Finished::Exception(payload) => {
                    trace!("dispatch: EXCEPTION (prompt already freed)");
                    std::panic::resume_unwind(payload);
                }
            };
        }

        let rp = prompt.return_point();
        let kind = std::mem::replace(&mut rp.kind, TransferKind::Pending);

        match kind {
            TransferKind::Return | TransferKind::Exception => crate::error::fatal(
                "dispatch: terminal transfer kind seen without a matching FINISHED relay",
            ),
            TransferKind::YieldOnce | TransferKind::YieldMulti => {
                let multi = matches!(kind, TransferKind::YieldMulti);
                // `t.context` is this prompt's own frame, suspended the
                // instant it called into `yield_internal` -- exactly what
                // a future resume needs to jump straight back into.
                prompt.resume_point().context = Some(t.context);
                let fun = rp.fun.take().unwrap_or_else(|| crate::error::fatal("missing yield fun"));
                let yielded_arg = rp.arg.take().unwrap_or_else(|| crate::error::fatal("missing yield arg"));

                let handle = if multi {
                    Handle::multi(crate::multishot::allocate(p))
                } else {
                    Handle::once(p)
                };

                let result = fun(handle, yielded_arg);

                match take_tail_request() {
                    None => return result,
                    Some((next_handle, next_arg)) => match next_handle.as_once() {
                        Some(next_p) => {
                            p = next_p;
                            arg = next_arg;
                            continue;
                        }
                        None => {
                            let record =
                                next_handle.as_multi().expect("delimcc: malformed handle");
                            match crate::multishot::try_tail_resume(record) {
                                // First resume of this multi-handle: keep
                                // going in the same loop iteration instead
                                // of recursing through `mresume`, same as
                                // the once-handle case above.
                                Some(next_p) => {
                                    p = next_p;
                                    arg = next_arg;
                                    continue;
                                }
                                // Already resumed once before: the tail
                                // property is gone, fall back to a regular
                                // nested call.
                                None => return crate::multishot::mresume(record, next_arg),
                            }
                        }
                    },
                }
            }
            TransferKind::Pending => crate::error::fatal("dispatch on a return_point never filled in"),
        }
    }
}

/// Low-level resume used by `multishot`'s resume policy.
pub(crate) fn resume_prompt_low(p: NonNull<Prompt>, arg: AnyBox) -> AnyBox {
    run_once_handle_loop(p, arg)
}

/// Entry point for a freshly `make_fcontext`'d prompt stack.
extern "C" fn entry_trampoline(t: Transfer) -> ! {
    let p = unsafe { NonNull::new_unchecked(t.data as *mut Prompt) };
    let prompt = unsafe { p.as_ref() };

    // The parent's context, captured as part of the jump that entered
    // us; this is what a later return/yield/exception jumps back to.
    prompt.return_point().context = Some(t.context);
    crate::backtrace::notify_link(p);

    let start_fn = unsafe { (*prompt.start_fn.get()).take() }
        .unwrap_or_else(|| crate::error::fatal("prompt entered more than once"));
    let arg = prompt
        .resume_point()
        .result
        .take()
        .unwrap_or_else(|| crate::error::fatal("missing initial argument"));
    let handle = Handle::once(p);

    let outcome =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || start_fn(handle, arg)));

    // Transition RET/EXC -> P. Chain bookkeeping first (still safe: we
    // haven't switched stacks yet), then jump away and let the ontop
    // callback free our own stack once it is safe to do so.
    let parent_ctx = unsafe { prompt::unlink(p, None) }
        .unwrap_or_else(|| crate::error::fatal("prompt has no parent to return to"));

    match outcome {
        Ok(value) => {
            let rp = prompt.return_point();
            rp.kind = TransferKind::Return;
            rp.arg = Some(value);
        }
        Err(payload) => {
            let rp = prompt.return_point();
            rp.kind = TransferKind::Exception;
            rp.exception = Some(payload);
        }
    }

    unsafe { parent_ctx.resume_ontop(p.as_ptr() as usize, delayed_drop_ontop) };
    unreachable!("delimcc: resumed a prompt after it returned or threw");
}

/// Runs on the parent's stack, right after it is safe to do so, to free
/// the just-finished prompt's growable stack.
///
/// Extracts the terminal `return_point` payload into [`FINISHED`] before
/// dropping the reference: once `prompt::drop_ref` actually frees `p`
/// (the common, not-dup'd case), nothing downstream may read `p` again.
extern "C" fn delayed_drop_ontop(t: Transfer) -> Transfer {
    let p = unsafe { NonNull::new_unchecked(t.data as *mut Prompt) };

    let finished = unsafe {
        let rp = p.as_ref().return_point();
        match std::mem::replace(&mut rp.kind, TransferKind::Pending) {
            TransferKind::Return => Finished::Return(
                rp.arg
                    .take()
                    .unwrap_or_else(|| crate::error::fatal("missing return value")),
            ),
            TransferKind::Exception => Finished::Exception(
                rp.exception
                    .take()
                    .unwrap_or_else(|| crate::error::fatal("missing exception payload")),
            ),
            _ => crate::error::fatal("delayed_drop_ontop reached with a non-terminal transfer kind"),
        }
    };
    FINISHED.with(|slot| *slot.borrow_mut() = Some(finished));

    unsafe { prompt::drop_ref(p) };
    t
}
