// Copyright 2016 coroutine-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-time collaborator configuration.

use crate::stack;

/// Configuration accepted by [`crate::init`], covering the one-time
/// `gstack_init(config)` field list the growable-stack collaborator reads.
#[derive(Debug, Clone)]
pub struct GstackConfig {
    /// Bytes committed up front for a newly allocated growable stack.
    pub initial_commit_size: usize,
    /// Bytes reserved (but not necessarily committed) for a growable stack.
    pub reserve_size: usize,
    /// Whether a guard page is mapped past the end of every growable stack.
    pub guard_pages: bool,
    /// How many freed stacks to retain for reuse before physically
    /// releasing them, used by the delayed-free mechanism.
    pub delayed_release_cache_size: usize,
    /// Whether the backend may grow a stack on demand past its initial
    /// commit, up to `reserve_size`. The default backend does not
    /// implement on-demand growth itself -- that detail is delegated to
    /// the OS guard-page/commit behavior, since the growable-stack
    /// allocator is treated as an external collaborator -- but this flag
    /// is threaded through so a different backend can honor it.
    pub on_demand_paging: bool,
    /// Whether host-language exceptions are allowed to cross a prompt
    /// boundary. When `false`, an exception escaping a prompt's
    /// body is treated as fatal instead of being tunneled to the parent.
    pub exception_propagation: bool,
}

impl Default for GstackConfig {
    fn default() -> Self {
        let reserve_size = stack::default_stack_size();
        GstackConfig {
            initial_commit_size: reserve_size,
            reserve_size,
            guard_pages: true,
            delayed_release_cache_size: 0,
            on_demand_paging: false,
            exception_propagation: true,
        }
    }
}

impl GstackConfig {
    /// Overlay `DELIMCC_STACK_SIZE`, `DELIMCC_GUARD_PAGES` and
    /// `DELIMCC_DELAYED_CACHE` environment variables over [`Default`].
    pub fn from_env() -> Self {
        let mut cfg = GstackConfig::default();

        if let Ok(size) = std::env::var("DELIMCC_STACK_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                cfg.initial_commit_size = size;
                cfg.reserve_size = size;
            }
        }

        if let Ok(flag) = std::env::var("DELIMCC_GUARD_PAGES") {
            cfg.guard_pages = flag != "0";
        }

        if let Ok(n) = std::env::var("DELIMCC_DELAYED_CACHE") {
            if let Ok(n) = n.parse::<usize>() {
                cfg.delayed_release_cache_size = n;
            }
        }

        cfg
    }
}
