// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-prompt backtrace adapter.
//!
//! Where the native unwinder stops at a stack-switch boundary, capture
//! what is visible on the current stack, then — if more frames are
//! wanted than that yielded — yield out of the current prompt, capture
//! again in whichever context resumed it, and resume back in with the
//! combined list. This reuses `yield`/`resume` rather than inventing new
//! machinery, kept to exactly that shape rather than generalized further.
//!
//! Gated behind the `backtrace` Cargo feature: without it, [`notify_link`]
//! below is a no-op and [`capture`] does not exist.

use std::ptr::NonNull;

use crate::prompt::Prompt;

/// Called by `prompt::link` whenever a prompt is linked with a new
/// return point, so the platform unwinder can retarget its frame-based
/// registration lists.
#[cfg(feature = "backtrace")]
pub(crate) fn notify_link(p: NonNull<Prompt>) {
    // The `backtrace` crate walks via frame pointers / DWARF CFI on the
    // platforms this crate targets and needs no registration call of its
    // own (unlike e.g. table-based SEH unwinding); this counter exists so
    // a future platform adapter has a single call site to hang real
    // bookkeeping off.
    let prompt = unsafe { p.as_ref() };
    prompt.unwind_frame.set(prompt.unwind_frame.get().wrapping_add(1));
}

#[cfg(not(feature = "backtrace"))]
pub(crate) fn notify_link(_p: NonNull<Prompt>) {}

#[cfg(feature = "backtrace")]
mod capture_impl {
    use super::*;
    use crate::prompt::AnyBox;
    use crate::tag::Handle;

    /// One captured frame.
    #[derive(Clone)]
    pub struct Frame {
        pub symbol: Option<String>,
        pub addr: usize,
    }

    fn frames_from(bt: &backtrace::Backtrace) -> Vec<Frame> {
        bt.frames()
            .iter()
            .map(|f| Frame {
                addr: f.ip() as usize,
                symbol: f
                    .symbols()
                    .first()
                    .and_then(|s| s.name())
                    .map(|n| n.to_string()),
            })
            .collect()
    }

    /// Capture up to `max_frames` frames of the chain reachable from `p`,
    /// crossing prompt boundaries by yielding out of `p` and resuming
    /// back in with whatever the ancestor context collected.
    ///
    /// Must be called from within `p`'s running body.
    pub fn capture(p: NonNull<Prompt>, max_frames: usize) -> Vec<Frame> {
        let mut frames = frames_from(&backtrace::Backtrace::new_unresolved());
        frames.truncate(max_frames);
        if frames.len() >= max_frames || crate::prompt::prompt_parent(Some(p)).is_none() {
            return frames;
        }

        let remaining = max_frames - frames.len();
        let result: AnyBox = crate::engine::yield_(
            p,
            Box::new(move |h: Handle, _arg: AnyBox| -> AnyBox {
                let more = capture(p, remaining);
                crate::engine::resume(h, Box::new(more))
            }),
            Box::new(()),
        );

        match result.downcast::<Vec<Frame>>() {
            Ok(ancestor_frames) => {
                frames.extend(*ancestor_frames);
                frames
            }
            Err(_) => frames,
        }
    }
}

#[cfg(feature = "backtrace")]
pub use capture_impl::{capture, Frame};
