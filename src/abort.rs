// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Abort / Terminate (C5): builds an [`AbortError`] record on demand,
//! routes it through a configurable handler, and guarantees
//! single-threaded termination (§4.5).
//!
//! Global state is published through `AtomicPtr` swaps rather than a
//! mutex, the same technique the teacher uses for its
//! `METADATA`/`CONFIG`/`PANIC_MESSAGE` globals in
//! `collector::crash_handler`: a signal handler must never take a lock
//! that an interrupted thread might already be holding, and `abort()`'s
//! fast recursive path runs from exactly that context.
//!
//! Async-signal safety note, carried over from the teacher (the same
//! POSIX functions are in play here):
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! `handle_signal` itself only performs an atomic fetch-add and an
//! atomic pointer load before handing off to `terminate`, which is
//! best-effort-safe, not guaranteed-safe — see §4.6's distinction
//! between (a) the guaranteed-safe re-raise path and (b) everything else.

use crate::config::{AbortBehavior, StackScope};
use crate::multistack::MultiStack;
use crate::resolver::StackResolver;
use crate::sig_info::SiCode;
use serde::{Deserialize, Serialize};
use std::panic::{self, PanicHookInfo};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64};
use std::sync::Mutex;

/// Cause of an [`AbortError`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortCause {
    Signal,
    Exception,
    Abort,
    Mpi,
    Unknown,
}

/// `{file, line, function}` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// The record produced by the terminate path (§3 `AbortError`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortError {
    pub message: String,
    pub source_location: SourceLocation,
    pub cause: AbortCause,
    /// 0 if `cause != Signal`.
    pub signal_number: i32,
    /// Supplementary detail on the `Signal` cause (§10.4); `None` for
    /// every other cause.
    pub si_code: Option<SiCode>,
    pub bytes_in_use: u64,
    pub stack: MultiStack,
}

impl AbortError {
    pub fn what(&self) -> &str {
        &self.message
    }

    /// Renders this record as pretty-printed JSON (§6: the data model is
    /// specified, not a particular text format, so this is this crate's
    /// own choice of human-readable export, matching
    /// `CrashInfo::to_json`'s use of `serde_json::to_string_pretty` in
    /// the teacher).
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

struct ProcessState {
    config: AbortBehavior,
    resolver: StackResolver,
}

static PROCESS_STATE: AtomicPtr<ProcessState> = AtomicPtr::new(ptr::null_mut());
static TERMINATE_LOCK: Mutex<()> = Mutex::new(());
/// `force_exit` (§4.5): incremented on every `terminate` entry; values
/// past 1 indicate recursive entry, which bypasses all formatting.
static FORCE_EXIT: AtomicU64 = AtomicU64::new(0);

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());
static PANIC_LOCATION: AtomicPtr<SourceLocation> = AtomicPtr::new(ptr::null_mut());

/// Publishes the process-wide configuration and resolver used by
/// `abort()`/`terminate()`/the panic hook/the signal surface. Not
/// signal-safe; call only from ordinary application startup, never from
/// a handler.
pub fn set_process_state(config: AbortBehavior, executable_path: PathBuf) {
    let boxed = Box::into_raw(Box::new(ProcessState {
        config,
        resolver: StackResolver::new(executable_path),
    }));
    let old = PROCESS_STATE.swap(boxed, SeqCst);
    if !old.is_null() {
        // Safety: only ever created by `Box::into_raw` above, and this
        // function is documented as not being called from signal context.
        unsafe {
            drop(Box::from_raw(old));
        }
    }
}

fn with_process_state<T>(f: impl FnOnce(&ProcessState) -> T, default: T) -> T {
    let ptr = PROCESS_STATE.load(SeqCst);
    if ptr.is_null() {
        return default;
    }
    // Safety: once published, a `ProcessState` is only ever replaced (not
    // freed) by `set_process_state`, which leaks the old value whenever a
    // reader might still be using it; since no reader is ever mid-read
    // across a `set_process_state` call here (both run off the signal
    // path), reading through the raw pointer is sound.
    f(unsafe { &*ptr })
}

/// Builds an [`AbortError`] at the configured [`StackScope`] and returns
/// it for the caller to propagate (§4.5: Rust has no exceptions, so
/// "raising" here means returning a value the caller passes to
/// [`terminate`] — the DESIGN NOTE choice recorded in `DESIGN.md`).
pub fn abort(message: impl Into<String>, source_location: SourceLocation) -> AbortError {
    let message = message.into();
    let bytes_in_use = current_bytes_in_use();
    let stack = with_process_state(
        |state| capture_stack(state.config.stack_type(), &state.resolver),
        MultiStack::new(),
    );
    AbortError {
        message,
        source_location,
        cause: AbortCause::Abort,
        signal_number: 0,
        si_code: None,
        bytes_in_use,
        stack,
    }
}

/// Builds an [`AbortError`] for a delivered signal (§4.6 bridging into
/// C5). Used only by `signals::handle_signal`; kept in this module
/// because it shares `PROCESS_STATE`/`capture_stack`/`current_bytes_in_use`
/// with [`abort`] rather than duplicating them in `signals.rs`.
pub(crate) fn build_signal_abort_error(
    signal_number: i32,
    signal_name: &str,
    si_code: Option<crate::sig_info::SiCode>,
) -> AbortError {
    let bytes_in_use = current_bytes_in_use();
    let stack = with_process_state(
        |state| capture_stack(state.config.stack_type(), &state.resolver),
        MultiStack::new(),
    );
    AbortError {
        message: format!("process received signal {signal_name} ({signal_number})"),
        source_location: SourceLocation {
            file: String::new(),
            line: 0,
            function: String::new(),
        },
        cause: AbortCause::Signal,
        signal_number,
        si_code,
        bytes_in_use,
        stack,
    }
}

fn capture_stack(scope: StackScope, resolver: &StackResolver) -> MultiStack {
    match scope {
        StackScope::Thread | StackScope::Global => {
            let addresses = crate::platform::capture_backtrace(crate::platform::limits::MAX_BACKTRACE_FRAMES);
            MultiStack::aggregate(&[resolver.resolve_all(&addresses)])
        }
        StackScope::AllThreads => {
            let stacks: Vec<Vec<crate::frame::StackFrame>> = crate::platform::enumerate_threads()
                .into_iter()
                .map(|thread| {
                    crate::platform::capture_thread_backtrace(
                        thread,
                        crate::platform::limits::MAX_BACKTRACE_FRAMES,
                    )
                    .unwrap_or_default()
                })
                .map(|addresses| resolver.resolve_all(&addresses))
                .collect();
            MultiStack::aggregate(&stacks)
        }
    }
}

/// Best-effort RSS reading for the `bytes_in_use` field (§1: memory-usage
/// reporting is out of scope beyond its use as this one field). Returns
/// 0 where no portable source is available.
fn current_bytes_in_use() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = rss_pages.parse::<u64>() {
                    return pages * page_size::get() as u64;
                }
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

/// `terminate(err)` (§4.5): serialized by a process-wide mutex so only
/// one termination sequence ever completes. A `force_exit` count above 1
/// means we're already terminating (most likely this is a recursive
/// crash inside the handler itself) and skips straight to the platform
/// abort primitive without taking the lock or touching I/O again.
pub fn terminate(err: AbortError) -> ! {
    if FORCE_EXIT.fetch_add(1, SeqCst) > 0 {
        platform_abort();
    }

    let _guard = TERMINATE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    report(&err);
    let throw_exception = with_process_state(|state| state.config.throw_exception(), true);

    tracing::error!(cause = ?err.cause, signal = err.signal_number, "terminating process");
    if throw_exception {
        platform_abort();
    }
    if mpi_hooks::is_active() {
        mpi_hooks::abort();
    }
    platform_abort();
}

/// Prints `err` per the configured `print_on_abort`/`print_memory`/
/// `print_stack` flags (§4.5). `print_on_abort` gates printing
/// entirely; `print_memory`/`print_stack` add detail beyond the base
/// `err.what()` line once printing is on (Open Question, resolved in
/// `DESIGN.md`). Split out from [`terminate`] so the signal surface
/// (C6) can report a crash and then chain to the previous signal
/// disposition instead of always ending in [`platform_abort`] — see
/// `signals::chain_signal_handler`.
pub(crate) fn report(err: &AbortError) {
    let (print_on_abort, print_memory, print_stack) = with_process_state(
        |state| {
            (
                state.config.print_on_abort(),
                state.config.print_memory(),
                state.config.print_stack(),
            )
        },
        (true, false, false),
    );
    if !print_on_abort {
        return;
    }
    eprintln!("{}", err.what());
    if print_memory {
        eprintln!("bytes in use: {}", err.bytes_in_use);
    }
    if print_stack {
        eprintln!("{:#?}", err.stack);
    }
}

fn platform_abort() -> ! {
    std::process::abort();
}

/// MPI bridge extension point (§1 "out of scope... MPI error-handler
/// integration (only the hook points are described)"). Without the
/// `mpi` feature this is a no-op; with it, an embedder that has already
/// linked an MPI implementation provides these two symbols (this crate
/// does not vendor an MPI binding — §12).
#[cfg(feature = "mpi")]
mod mpi_hooks {
    extern "C" {
        fn stacktrace_core_mpi_is_active() -> i32;
        fn stacktrace_core_mpi_abort() -> i32;
    }

    pub fn is_active() -> bool {
        unsafe { stacktrace_core_mpi_is_active() != 0 }
    }

    pub fn abort() {
        unsafe {
            stacktrace_core_mpi_abort();
        }
    }
}

#[cfg(not(feature = "mpi"))]
mod mpi_hooks {
    pub fn is_active() -> bool {
        false
    }

    pub fn abort() {}
}

fn format_panic_message(payload_description: &str, location: Option<&panic::Location>) -> String {
    let base = format!("process panicked with {payload_description}");
    match location {
        Some(loc) => format!("{base} ({}:{}:{})", loc.file(), loc.line(), loc.column()),
        None => base,
    }
}

/// Installs a panic hook that bridges a Rust panic into the same
/// [`AbortError`]/[`terminate`] path the signal surface uses (§10.4):
/// `spec.md` doesn't name this explicitly, but a complete terminate path
/// needs it, since panics are the most common abort trigger in a Rust
/// program. Chains to whatever hook was previously installed, the same
/// way `register_panic_hook`/`call_previous_panic_hook` do in the
/// teacher.
pub fn register_panic_hook() {
    if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
        return;
    }
    let old_hook = panic::take_hook();
    PREVIOUS_PANIC_HOOK.store(Box::into_raw(Box::new(old_hook)), SeqCst);

    panic::set_hook(Box::new(|panic_info| {
        let payload_description = if let Some(&s) = panic_info.payload().downcast_ref::<&str>() {
            format!("\"{s}\"")
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            format!("\"{s}\"")
        } else {
            "a non-string payload".to_string()
        };
        let message = format_panic_message(&payload_description, panic_info.location());

        let (file, line, function) = match panic_info.location() {
            Some(loc) => (loc.file().to_string(), loc.line(), String::new()),
            None => (String::new(), 0, String::new()),
        };
        let location_ptr = Box::into_raw(Box::new(SourceLocation {
            file,
            line,
            function,
        }));
        let old = PANIC_LOCATION.swap(location_ptr, SeqCst);
        if !old.is_null() {
            unsafe {
                drop(Box::from_raw(old));
            }
        }

        call_previous_panic_hook(panic_info);

        let err = abort(message.clone(), unsafe { (*location_ptr).clone() });
        let err = AbortError {
            cause: AbortCause::Exception,
            ..err
        };
        terminate(err);
    }));
}

fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !ptr.is_null() {
        // Safety: only ever created by `Box::into_raw` in `register_panic_hook`.
        unsafe {
            let hook = &*ptr;
            hook(panic_info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_panic_message_with_location() {
        let location = panic::Location::caller();
        let msg = format_panic_message("\"boom\"", Some(location));
        assert!(msg.starts_with("process panicked with \"boom\" ("));
    }

    #[test]
    fn test_format_panic_message_without_location() {
        let msg = format_panic_message("\"boom\"", None);
        assert_eq!(msg, "process panicked with \"boom\"");
    }

    #[test]
    fn test_abort_without_process_state_returns_empty_stack() {
        // Process state is never set in this test process, so `abort`
        // falls back to an empty `MultiStack` rather than panicking.
        let err = abort(
            "test failure",
            SourceLocation {
                file: "test.rs".to_string(),
                line: 1,
                function: "test_fn".to_string(),
            },
        );
        assert_eq!(err.message, "test failure");
        assert_eq!(err.cause, AbortCause::Abort);
    }

    #[test]
    fn test_current_bytes_in_use_does_not_panic() {
        let _ = current_bytes_in_use();
    }

    #[test]
    fn test_mpi_hooks_inactive_without_feature() {
        assert!(!mpi_hooks::is_active());
    }

    #[test]
    fn test_build_signal_abort_error_fields() {
        let err = build_signal_abort_error(11, "SIGSEGV", None);
        assert_eq!(err.cause, AbortCause::Signal);
        assert_eq!(err.signal_number, 11);
        assert!(err.message.contains("SIGSEGV"));
    }
}
