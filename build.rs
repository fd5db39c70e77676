// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compiles the per-architecture register-context assembly that backs
//! `src/context.rs`'s register-context-switch primitive.
//!
//! Only the two targets exercised in this corpus's CI-shaped environments
//! are vendored: x86_64 System V (Linux/macOS) and x86_64 Windows (GNU ABI,
//! via the `windows-gnu` target so a single assembler handles both). Other
//! architectures are a documented gap, the same way `wasmtime-internal-fiber`
//! and `libs/fiber` in this corpus ship `arch/x86_64.rs` and
//! `arch/riscv.rs` incrementally rather than all ISAs at once.

use std::env;
use std::path::PathBuf;

fn main() {
    let target: String = env::var("TARGET").unwrap();
    let is_win_gnu = target.ends_with("windows-gnu");
    let is_win_msvc = target.ends_with("windows-msvc");

    let arch = target.split('-').next().unwrap();

    if arch != "x86_64" {
        panic!(
            "delimcc: no register-context assembly vendored for target architecture `{}` yet \
             (only x86_64 is implemented; see build.rs)",
            arch
        );
    }

    if is_win_msvc {
        panic!(
            "delimcc: windows-msvc is not supported yet, only windows-gnu (MASM integration is \
             a follow-up; see build.rs)"
        );
    }

    let file = if is_win_gnu {
        "x86_64_windows_gas.S"
    } else {
        "x86_64_sysv_gas.S"
    };

    let mut path: PathBuf = ["src", "asm"].iter().collect();
    path.push(file);

    println!("cargo:rerun-if-changed={}", path.display());

    cc::Build::new()
        .file(&path)
        .flag_if_supported("-x")
        .flag_if_supported("assembler-with-cpp")
        .compile("delimcc_asm");
}
