// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error kinds surfaced by the public API.
//!
//! Most failures inside this crate are recoverable: a backend that can't
//! find a module, an `addr2line` that isn't on `PATH`, a cross-thread
//! capture the platform doesn't support. Those degrade the affected
//! [`crate::frame::StackFrame`] fields instead of propagating (see the
//! module docs on `resolver`). The variants below are the ones that *do*
//! need to reach a caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StacktraceError {
    /// The current platform backend cannot perform the requested capability
    /// (e.g. cross-thread capture on the Darwin backend, or any capability
    /// beyond "return empty data" on the Fallback backend).
    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),

    /// No loaded module contains the given address. Recoverable: the
    /// resulting frame keeps `object`/`function` empty and resolution
    /// continues via the symbol cache.
    #[error("no module contains address {0:#x}")]
    LoaderMiss(u64),

    /// The external symboliser (`addr2line`, `atos`) is missing from `PATH`
    /// or exited non-zero. Recoverable: the frame's `filename`/`line` stay
    /// empty.
    #[error("external symboliser failed: {0}")]
    SymboliserFailed(String),

    /// The symbol cache's first `load()` failed to parse the executable's
    /// symbol table. This is cached and returned to every subsequent caller
    /// until [`crate::symbol_cache::SymbolCache::clear`].
    #[error("failed to load symbol table: {0}")]
    CacheLoadFailed(String),

    /// Capture was truncated at `max_depth`. The returned sequence is still
    /// a valid (prefix) stack.
    #[error("backtrace truncated at {0} frames")]
    Truncated(usize),

    /// The Windows stack walker observed `AddrPC == AddrReturn` for more
    /// than 1024 consecutive frames and gave up. The returned sequence is a
    /// valid partial stack.
    #[error("stack walker detected unwind recursion after {0} frames")]
    Recursion(usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("signal list contained duplicate entries")]
    DuplicateSignals,

    #[error("signal number {0} does not map to a catchable signal")]
    InvalidSignal(i32),

    #[error("cannot create an alt stack without using it")]
    AltStackParadox,
}
