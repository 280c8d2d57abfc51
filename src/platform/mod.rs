// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Platform Backend (C1): the five per-OS capability operations §4.1
//! describes, selected as a tagged variant at build time (Design Note
//! §9) rather than through a trait object — there is exactly one backend
//! compiled into any given binary, so dynamic dispatch buys nothing and
//! would add an indirection to the one path (signal-handler capture)
//! that can least afford it.

pub mod frame_pointer_walker;
pub mod limits;

/// Opaque platform-native thread identifier (§4.1.3 `enumerate_threads`).
pub type ThreadHandle = u64;

/// Result of `module_of` (§4.1.4): best-effort address-to-module lookup.
/// All-empty/zero when the loader can't place the address in any module.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub path: String,
    pub base: u64,
    pub symbol_name: Option<String>,
}

impl ModuleInfo {
    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && self.base == 0 && self.symbol_name.is_none()
    }
}

/// Result of `symbolise_offline` (§4.1.5). All fields `None` on failure —
/// this is the contract callers rely on instead of an `Err` (missing or
/// stripped binaries are not failures, §4.1.5).
#[derive(Debug, Clone, Default)]
pub struct SymbolOutput {
    pub function: Option<String>,
    pub filename: Option<String>,
    pub line: Option<u32>,
}

cfg_if::cfg_if! {
    if #[cfg(all(unix, target_env = "musl"))] {
        mod unix;
        pub use unix::*;
    } else if #[cfg(all(unix, not(target_os = "macos")))] {
        mod unix;
        pub use unix::*;
    } else if #[cfg(target_os = "macos")] {
        mod darwin;
        pub use darwin::*;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::*;
    } else {
        mod fallback;
        pub use fallback::*;
    }
}
