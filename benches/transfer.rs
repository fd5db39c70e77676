// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Benchmarks for the control-transfer engine and the default growable-stack
//! backend, using `criterion` so the crate benchmarks on stable rather than
//! relying on the nightly-only `#[bench]` attribute.

use criterion::{criterion_group, criterion_main, Criterion};

use delimcc::stack::{FixedSizeStack, ProtectedFixedSizeStack};
use delimcc::{prompt, resume, yield_, Handle};

fn stack_alloc(c: &mut Criterion) {
    let size = delimcc::stack::default_stack_size();

    c.bench_function("stack_alloc_fixed", |b| {
        b.iter(|| FixedSizeStack::new(size).unwrap());
    });

    c.bench_function("stack_alloc_protected_fixed", |b| {
        b.iter(|| ProtectedFixedSizeStack::new(size).unwrap());
    });
}

/// Round-trips `resume -> yield -> resume` a single time per iteration,
/// the at-most-once path exercised by `engine::run_once_handle_loop`'s
/// PI/Y/P transitions, through the public API rather than a raw `Context`.
fn once_round_trip(c: &mut Criterion) {
    c.bench_function("once_yield_resume_round_trip", |b| {
        b.iter(|| {
            prompt(
                |h: Handle, arg| {
                    yield_(
                        h,
                        |inner, yielded| resume(inner, yielded),
                        arg,
                    )
                },
                Box::new(0usize),
            )
        });
    });
}

/// A chain of `resume_tail` calls through the same two prompts,
/// exercising the bounded-parent-stack-space property of the tail-resume
/// fast path.
fn tail_resume_chain(c: &mut Criterion) {
    const DEPTH: usize = 1_000;

    c.bench_function("tail_resume_chain_1000", |b| {
        b.iter(|| {
            prompt(
                |h: Handle, start| {
                    let mut n = *start.downcast::<usize>().unwrap();
                    loop {
                        if n == 0 {
                            return Box::new(0usize) as delimcc::AnyBox;
                        }
                        let got = yield_(
                            h,
                            |inner, yielded| {
                                let cur = *yielded.downcast::<usize>().unwrap();
                                delimcc::resume_tail(inner, Box::new(cur - 1))
                            },
                            Box::new(n),
                        );
                        n = *got.downcast::<usize>().unwrap();
                    }
                },
                Box::new(DEPTH),
            )
        });
    });
}

criterion_group!(benches, stack_alloc, once_round_trip, tail_resume_chain);
criterion_main!(benches);
