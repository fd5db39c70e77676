// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-prompt delimited control over native call stacks.
//!
//! A [`prompt`] marks a region of the call stack. Code running inside it
//! can [`yield_`]/[`yieldm`] out to any enclosing prompt, capturing
//! everything between the two as a [`Handle`] -- an at-most-once or
//! multi-shot resumption that can later be handed back to [`resume`] to
//! continue exactly where it left off, on a growable stack switched in
//! and out of the native one.
//!
//! ```
//! use delimcc::{prompt, resume, yield_, Handle};
//!
//! let result = prompt(
//!     |_p: Handle, arg| {
//!         let n: usize = *arg.downcast::<usize>().unwrap();
//!         Box::new(n + 1) as delimcc::AnyBox
//!     },
//!     Box::new(41usize),
//! );
//! assert_eq!(*result.downcast::<usize>().unwrap(), 42);
//! # let _ = (yield_, resume);
//! ```
//!
//! Everything below the tag/engine/prompt layer -- the growable-stack
//! allocator, the register-context switch primitive, platform backtrace
//! capture -- is treated as a collaborator this crate consumes through a
//! narrow trait ([`stack::GStack`]) or a handful of `extern "C"` functions
//! ([`context::Context`]), rather than something it reimplements from
//! scratch.

pub mod backtrace;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod multishot;
pub mod prompt;
pub mod stack;
mod sys;
pub mod tag;

use std::ptr::NonNull;
use std::sync::OnceLock;

pub use config::GstackConfig;
pub use error::{Error, Misuse};
pub use prompt::AnyBox;
pub use tag::Handle;

use prompt::{Prompt, StartFn, YieldFn};
use stack::GStack;

static CONFIG: OnceLock<GstackConfig> = OnceLock::new();

/// `init(config)`: one-time collaborator
/// configuration. Safe to skip -- the first allocation falls back to
/// [`GstackConfig::default`] -- but calling it more than once, or after
/// the first prompt has already been created, only logs a warning and
/// keeps whichever configuration won the race; this crate has no notion
/// of reconfiguring stacks already handed out.
pub fn init(config: GstackConfig) {
    if CONFIG.set(config).is_err() {
        log::warn!("delimcc: init() called more than once; keeping the first configuration");
    }
}

fn active_config() -> &'static GstackConfig {
    CONFIG.get_or_init(GstackConfig::default)
}

/// Allocate a growable stack from the active configuration, aborting the
/// process on allocation failure -- this is the one call site in the crate
/// where an `Err` from the collaborator has no caller frame left to
/// propagate to.
fn new_gstack() -> Box<dyn GStack> {
    let cfg = active_config();
    let size = cfg.reserve_size.max(cfg.initial_commit_size).max(stack::min_stack_size());

    if cfg.guard_pages {
        let s = stack::ProtectedFixedSizeStack::new(size)
            .unwrap_or_else(|e| error::fatal(&format!("gstack_alloc: {e}")));
        Box::new(s)
    } else {
        let s = stack::FixedSizeStack::new(size)
            .unwrap_or_else(|e| error::fatal(&format!("gstack_alloc: {e}")));
        Box::new(s)
    }
}

/// `prompt(fun, arg) -> result`: create a fresh prompt, enter it
/// immediately with `arg`, and return its result -- or propagate (via
/// [`std::panic::resume_unwind`]) whatever panic escaped `fun`.
pub fn prompt(fun: impl FnOnce(Handle, AnyBox) -> AnyBox + 'static, arg: AnyBox) -> AnyBox {
    engine::prompt(new_gstack(), fun, arg)
}

/// `prompt_create(fun, arg) -> handle`: allocate a suspended
/// prompt without entering it.
///
/// `arg` is fixed here as the prompt's `start_arg`, not
/// supplied by whatever is later passed to the first [`resume`] on the
/// returned handle -- the first such `arg` is simply discarded. This
/// collapses a separate `start_fun`/`start_arg` pair into one closure
/// capture, the same adaptation `prompt::StartFn`'s doc comment describes.
pub fn prompt_create(fun: impl FnOnce(Handle, AnyBox) -> AnyBox + 'static, arg: AnyBox) -> Handle {
    let start: StartFn = Box::new(move |h, _first_resume_arg| fun(h, arg));
    engine::prompt_create(new_gstack(), start)
}

/// `resume(handle, arg) -> result`.
pub fn resume(handle: Handle, arg: AnyBox) -> AnyBox {
    engine::resume(handle, arg)
}

/// `resume_tail(handle, arg) -> result`. Must be the
/// tail expression of a `yield_`/`yieldm` handler; see [`engine::resume_tail`].
pub fn resume_tail(handle: Handle, arg: AnyBox) -> AnyBox {
    engine::resume_tail(handle, arg)
}

/// `resume_drop(handle)`.
pub fn resume_drop(handle: Handle) {
    engine::resume_drop(handle)
}

/// `resume_dup(handle) -> handle`. Fails on once-handles.
pub fn resume_dup(handle: Handle) -> Result<Handle, Error> {
    engine::resume_dup(handle)
}

/// `resume_resume_count(handle) -> n`.
pub fn resume_resume_count(handle: Handle) -> usize {
    engine::resume_resume_count(handle)
}

/// `resume_should_unwind(handle) -> bool`.
pub fn resume_should_unwind(handle: Handle) -> bool {
    engine::resume_should_unwind(handle)
}

fn target_prompt(target: Handle) -> NonNull<Prompt> {
    target
        .as_once()
        .unwrap_or_else(|| error::fatal("yield target must name a prompt, not a multi-handle"))
}

/// `yield(p, fun, arg) -> result`: yield out of `p` with an
/// at-most-once resumption handed to `fun`.
pub fn yield_(
    target: Handle,
    fun: impl FnOnce(Handle, AnyBox) -> AnyBox + 'static,
    arg: AnyBox,
) -> AnyBox {
    let fun: YieldFn = Box::new(fun);
    engine::yield_(target_prompt(target), fun, arg)
}

/// `yieldm(p, fun, arg) -> result`: yield out of `p` with a
/// multi-shot resumption handed to `fun`.
pub fn yieldm(
    target: Handle,
    fun: impl FnOnce(Handle, AnyBox) -> AnyBox + 'static,
    arg: AnyBox,
) -> AnyBox {
    let fun: YieldFn = Box::new(fun);
    engine::yieldm(target_prompt(target), fun, arg)
}

/// `prompt_top()`: the currently active prompt, if any.
pub fn prompt_top() -> Option<Handle> {
    prompt::prompt_top().map(Handle::once)
}

/// `prompt_parent(p)`: `p`'s parent; `None` is equivalent to
/// [`prompt_top`].
pub fn prompt_parent(p: Option<Handle>) -> Option<Handle> {
    let p = p.map(target_prompt);
    prompt::prompt_parent(p).map(Handle::once)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_runs_and_returns() {
        let result = prompt(
            |_h, arg| {
                let n = *arg.downcast::<usize>().unwrap();
                Box::new(n + 1) as AnyBox
            },
            Box::new(41usize),
        );
        assert_eq!(*result.downcast::<usize>().unwrap(), 42);
    }

    #[test]
    fn yield_and_resume_round_trip() {
        let result = prompt(
            move |h, _arg| {
                let got = yield_(
                    h,
                    |inner_h, yielded| {
                        let n = *yielded.downcast::<usize>().unwrap();
                        resume(inner_h, Box::new(n * 2))
                    },
                    Box::new(21usize),
                );
                got
            },
            Box::new(()),
        );
        assert_eq!(*result.downcast::<usize>().unwrap(), 42);
    }

    #[test]
    fn panic_inside_prompt_propagates() {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            prompt(
                |_h, _arg| -> AnyBox { panic!("boom") },
                Box::new(()),
            )
        }));
        assert!(outcome.is_err());
    }

    #[test]
    fn prompt_top_is_none_outside_any_prompt() {
        assert!(prompt_top().is_none());
    }
}
