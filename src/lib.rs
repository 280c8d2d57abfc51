// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! `stacktrace-core`: in-process crash detection and stack capture.
//!
//! The crate is organised around the six components the spec names:
//!
//! - [`platform`] (C1): per-OS capture/module-lookup/symbolisation
//!   primitives, selected as a tagged variant at build time.
//! - [`symbol_cache`] (C2): a one-shot, lock-free-after-load table of
//!   `(address, symbol)` pairs parsed from the running executable.
//! - [`resolver`] (C3): resolves raw addresses into [`frame::StackFrame`]s
//!   using the loader, the symbol cache, and an external symboliser, in
//!   that order.
//! - [`multistack`] (C4): folds per-thread stacks into a prefix-shared
//!   tree.
//! - [`abort`] (C5): process-wide abort configuration and the
//!   terminate path that builds an [`abort::AbortError`] and ends the
//!   process.
//! - [`signals`] (C6, unix only): installs/clears signal handlers that
//!   bridge signal delivery into C5.
//!
//! [`config`], [`error`], [`frame`], and [`sig_info`] hold the shared
//! types the components above pass between each other.

pub mod abort;
pub mod config;
pub mod error;
pub mod frame;
pub mod multistack;
pub mod platform;
pub mod resolver;
pub mod sig_info;
#[cfg(unix)]
pub mod signals;
pub mod symbol_cache;

pub use abort::{
    abort, register_panic_hook, set_process_state, terminate, AbortCause, AbortError,
    SourceLocation,
};
pub use config::{default_signals, AbortBehavior, StackScope};
pub use error::{ConfigError, StacktraceError};
pub use frame::{pack_array, unpack_array, StackFrame, UnpackError};
pub use multistack::{cleanup_stack_trace, MultiStack, MultiStackNode};
pub use resolver::StackResolver;
pub use symbol_cache::{SymbolCache, SymbolRecord};

#[cfg(unix)]
pub use signals::{all_signals_to_catch, clear_signal, clear_signals, set_signals};
