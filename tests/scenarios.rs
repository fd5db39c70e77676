// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Integration tests for end-to-end control-transfer round trips, kept
//! separate from the per-module unit tests the way a systems crate in
//! this corpus splits end-to-end checks into their own `tests/` binary.

use delimcc::{
    prompt, prompt_create, resume, resume_drop, resume_dup, resume_should_unwind, resume_tail,
    yield_, yieldm, AnyBox, Handle,
};

fn usize_box(n: usize) -> AnyBox {
    Box::new(n)
}

fn as_usize(v: AnyBox) -> usize {
    *v.downcast::<usize>().unwrap()
}

/// (a) Identity yield: `prompt(f)` where `f(p,_) = yield(p, g, 10)` and
/// `g(k, x) = resume(k, x+1)` returns `11`.
#[test]
fn identity_yield() {
    let _ = env_logger::try_init();
    let result = prompt(
        |p: Handle, _arg| {
            yield_(
                p,
                |k, x| resume(k, usize_box(as_usize(x) + 1)),
                usize_box(10),
            )
        },
        usize_box(0),
    );
    assert_eq!(as_usize(result), 11);
}

/// (b) Double resume: `prompt(f)` where `f(p,_) = 100 + yieldm(p, h, 0)`
/// and `h(k,_) = resume(dup(k), 1) + resume(k, 2)` enters the body twice,
/// yielding `101` and `102`; the handler's own result is `203`.
#[test]
fn double_resume_via_multishot() {
    let _ = env_logger::try_init();
    let result = prompt(
        |p: Handle, _arg| {
            let v = yieldm(p, |k, _arg| {
                let dup = resume_dup(k).expect("multi-handle dups");
                let r1 = as_usize(resume(dup, usize_box(1)));
                let r2 = as_usize(resume(k, usize_box(2)));
                usize_box(r1 + r2)
            }, usize_box(0));
            usize_box(100 + as_usize(v))
        },
        usize_box(0),
    );
    assert_eq!(as_usize(result), 203);
}

/// (c) Exception propagation: a panic inside the prompt body crosses the
/// boundary and is observable by `catch_unwind` around `prompt`, same as
/// an ordinary function that panicked.
#[test]
fn exception_crosses_prompt_boundary() {
    let _ = env_logger::try_init();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        prompt(
            |_p: Handle, _arg| -> AnyBox { panic!("boundary crossing exception") },
            usize_box(0),
        )
    }));

    let err = outcome.expect_err("panic inside prompt body must propagate");
    let msg = err
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("");
    assert!(msg.contains("boundary crossing exception"));
}

/// (d) Deep tail-resume: a handler that always calls `resume_tail` and a
/// yielding body that counts down run in bounded parent-stack space --
/// this would stack-overflow a naive recursive implementation.
#[test]
fn deep_tail_resume_chain() {
    let _ = env_logger::try_init();
    const DEPTH: usize = 1_000_000;

    let result = prompt(
        |p: Handle, start| {
            let mut n = as_usize(start);
            loop {
                if n == 0 {
                    return usize_box(0);
                }
                let got = yield_(
                    p,
                    |k, yielded| {
                        let cur = as_usize(yielded);
                        resume_tail(k, usize_box(cur - 1))
                    },
                    usize_box(n),
                );
                n = as_usize(got);
            }
        },
        usize_box(DEPTH),
    );

    assert_eq!(as_usize(result), 0);
}

/// (e) Drop without resume: the handler drops the resumption instead of
/// resuming it; the in-flight body is simply abandoned and the handler's
/// own value is what `prompt` returns.
#[test]
fn drop_without_resume() {
    let _ = env_logger::try_init();
    let result = prompt(
        |p: Handle, _arg| -> AnyBox {
            yield_(
                p,
                |k, _arg| {
                    resume_drop(k);
                    Box::new("done".to_string())
                },
                usize_box(0),
            )
        },
        usize_box(0),
    );
    assert_eq!(*result.downcast::<String>().unwrap(), "done");
}

/// (f) Nested prompts: `p1 ⊃ p2`; `p2`'s body yields to `p1` (not its own
/// prompt), `p1`'s handler resumes immediately, and `p2`'s body continues
/// to completion -- verifies ancestor targeting and re-linking of the
/// inner, non-target prompt.
#[test]
fn nested_prompts_yield_past_inner_to_outer_ancestor() {
    let _ = env_logger::try_init();
    let result = prompt(
        |p1: Handle, _outer_arg| {
            prompt(
                move |_p2: Handle, inner_arg| {
                    let got = yield_(p1, |k, yielded| resume(k, yielded), inner_arg);
                    usize_box(as_usize(got) + 1)
                },
                usize_box(41),
            )
        },
        usize_box(0),
    );
    assert_eq!(as_usize(result), 42);
}

/// Round-trip: `resume_dup` followed by two independent resumes yields
/// two independent results, each observing the state captured at yield.
#[test]
fn dup_then_independent_resumes_are_independent() {
    let _ = env_logger::try_init();
    let result = prompt(
        |p: Handle, _arg| {
            yieldm(
                p,
                |k, _arg| {
                    let dup = resume_dup(k).expect("multi-handle dups");
                    let a = as_usize(resume(dup, usize_box(10)));
                    let b = as_usize(resume(k, usize_box(20)));
                    usize_box(a * 100 + b)
                },
                usize_box(1),
            )
        },
        usize_box(0),
    );
    // Each resume re-enters the same captured `+1` continuation with its
    // own argument: 10+1=11, 20+1=21.
    assert_eq!(as_usize(result), 1121);
}

/// Round-trip: dropping a suspended, never-resumed prompt handle releases
/// its growable stack without resuming the captured body.
#[test]
fn drop_suspended_prompt_without_entering() {
    let _ = env_logger::try_init();
    let handle = prompt_create(|_p: Handle, arg| arg, usize_box(0));
    resume_drop(handle);
}

/// `resume_should_unwind` is true only for a uniquely-owned, never-yet-
/// resumed multi-handle.
#[test]
fn should_unwind_reflects_uniqueness_and_freshness() {
    let _ = env_logger::try_init();
    prompt(
        |p: Handle, _arg| -> AnyBox {
            yieldm(
                p,
                |k, _arg| {
                    assert!(resume_should_unwind(k));
                    let dup = resume_dup(k).expect("multi-handle dups");
                    assert!(!resume_should_unwind(k));
                    resume_drop(dup);
                    resume_drop(k);
                    Box::new(())
                },
                usize_box(0),
            )
        },
        usize_box(0),
    );
}
