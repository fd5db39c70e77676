// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy for the prompt/resumption engine.
//!
//! Allocation failure and `resume_dup` misuse are the only conditions a
//! caller can recover from; everything else -- including the other
//! precondition violations spec §7 lists (yielding to a non-ancestor,
//! resuming an already-active prompt) -- is an unconditional `debug_assert!`
//! plus [`fatal`] in this crate, not a typed `Err`: those checks run at a
//! point (inside the entry trampoline, mid-stack-switch) with no caller
//! frame left to hand a `Result` back to.

use std::fmt;

/// Errors returned from the public API.
///
/// The only recoverable condition this crate surfaces as a typed error is
/// `resume_dup` on a once-handle: every other misuse §7 enumerates is
/// reported through [`fatal`] instead, since nothing downstream is in a
/// position to catch it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The growable-stack collaborator could not satisfy a `gstack_alloc` or
    /// could not allocate a `Multi-Resumption`/`Saved-Stack` record.
    #[error("failed to allocate a growable stack or continuation record")]
    AllocationFailure,

    /// A caller violated one of the resumption-handle invariants.
    #[error("misuse of resumption handle: {0}")]
    Misuse(#[from] Misuse),
}

/// The specific misuses the engine can detect cheaply at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    /// `resume_dup` was called on a once-handle; the diagnostic points at
    /// `yieldm` instead.
    DupOnceHandle,
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Misuse::DupOnceHandle => {
                write!(f, "cannot duplicate an at-most-once resumption, use yieldm")
            }
        }
    }
}

/// Log `msg` at `error` level and abort the process.
///
/// For failures that aren't plumbed through `Result` -- e.g. inside the
/// entry trampoline, where there is no caller frame left to return an
/// `Err` to -- this is the only option: fatal and non-recoverable.
#[cold]
pub fn fatal(msg: &str) -> ! {
    log::error!("delimcc: fatal: {}", msg);
    std::process::abort()
}
