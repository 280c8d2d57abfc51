// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide abort configuration (§6 Configuration / §4.5
//! `setAbortBehavior`), validated the way the teacher's
//! `CrashtrackerConfiguration::new` validates its inputs: constructor-time
//! checks return `Result`, and setters re-validate the same invariants
//! (§10.3).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Validates that `signum` names a signal the current platform actually
/// knows about. On unix this defers to [`crate::sig_info::signal_from_signum`]
/// (the full `nix::sys::signal::Signal` table); `sig_info`'s signal
/// machinery is unix-only (`sig_info.rs`'s `pub use unix::*` is
/// `#[cfg(unix)]`), so non-unix targets (the Windows/DbgHelp backend, §4.1)
/// fall back to a plain range check instead of linking against a table
/// that doesn't exist there.
#[cfg(unix)]
fn validate_signum(signum: i32) -> Result<(), ConfigError> {
    crate::sig_info::signal_from_signum(signum).map_err(|_| ConfigError::InvalidSignal(signum))?;
    Ok(())
}

/// The ANSI C signal set is the only one `libc` defines on non-unix
/// targets (Windows' CRT has no `SIGBUS`/`SIGKILL`/realtime signals), so
/// that's the full catchable set there.
#[cfg(not(unix))]
fn validate_signum(signum: i32) -> Result<(), ConfigError> {
    const CATCHABLE: &[i32] = &[
        libc::SIGINT,
        libc::SIGILL,
        libc::SIGABRT,
        libc::SIGFPE,
        libc::SIGSEGV,
        libc::SIGTERM,
    ];
    if CATCHABLE.contains(&signum) {
        Ok(())
    } else {
        Err(ConfigError::InvalidSignal(signum))
    }
}

/// Which scope C5 asks the Stack Aggregator (C4) to capture when an
/// abort happens (§4.5 `stack_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackScope {
    /// Capture only the aborting thread.
    Thread,
    /// Capture every thread and aggregate into a `MultiStack`.
    AllThreads,
    /// A single process-wide stack, independent of which thread aborted
    /// (used when the caller doesn't care about per-thread detail).
    Global,
}

/// Process-wide abort/terminate configuration (§4.5 `setAbortBehavior`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortBehavior {
    /// `true`: on terminate, emit the message then invoke the platform
    /// abort primitive directly. `false`: emit the message, then prefer
    /// an MPI-aware abort if MPI is initialized-but-not-finalized,
    /// falling back to the platform abort primitive otherwise (§4.5).
    throw_exception: bool,
    print_memory: bool,
    print_stack: bool,
    print_on_abort: bool,
    stack_type: StackScope,
    signals: Vec<i32>,
    create_alt_stack: bool,
    use_alt_stack: bool,
}

impl AbortBehavior {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        throw_exception: bool,
        print_memory: bool,
        print_stack: bool,
        print_on_abort: bool,
        stack_type: StackScope,
        mut signals: Vec<i32>,
        create_alt_stack: bool,
        use_alt_stack: bool,
    ) -> Result<Self, ConfigError> {
        if create_alt_stack && !use_alt_stack {
            return Err(ConfigError::AltStackParadox);
        }

        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort_unstable();
            signals.dedup();
            if before_len != signals.len() {
                return Err(ConfigError::DuplicateSignals);
            }
            for &signum in &signals {
                validate_signum(signum)?;
            }
        }

        Ok(Self {
            throw_exception,
            print_memory,
            print_stack,
            print_on_abort,
            stack_type,
            signals,
            create_alt_stack,
            use_alt_stack,
        })
    }

    pub fn throw_exception(&self) -> bool {
        self.throw_exception
    }

    pub fn print_memory(&self) -> bool {
        self.print_memory
    }

    pub fn print_stack(&self) -> bool {
        self.print_stack
    }

    pub fn print_on_abort(&self) -> bool {
        self.print_on_abort
    }

    pub fn stack_type(&self) -> StackScope {
        self.stack_type
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    /// Requesting to create, but not use, the alt stack is paradoxical
    /// (mirrors `CrashtrackerConfiguration::set_create_alt_stack`).
    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> Result<(), ConfigError> {
        if create_alt_stack && !self.use_alt_stack {
            return Err(ConfigError::AltStackParadox);
        }
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> Result<(), ConfigError> {
        if self.create_alt_stack && !use_alt_stack {
            return Err(ConfigError::AltStackParadox);
        }
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }
}

impl Default for AbortBehavior {
    fn default() -> Self {
        Self::new(
            true,
            false,
            true,
            true,
            StackScope::Thread,
            Vec::new(),
            true,
            true,
        )
        .expect("default configuration is always valid")
    }
}

/// `defaultSignalsToCatch()` (§4.6): a curated subset excluding signals
/// that can't be meaningfully translated into an abort. `libc::SIGBUS` is
/// POSIX-only (Windows' CRT never defines it), so it's only in the default
/// list on unix.
#[cfg(unix)]
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGABRT,
        libc::SIGILL,
        libc::SIGFPE,
    ]
}

#[cfg(not(unix))]
pub fn default_signals() -> Vec<i32> {
    vec![libc::SIGSEGV, libc::SIGABRT, libc::SIGILL, libc::SIGFPE]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AbortBehavior::default();
        assert!(config.throw_exception());
        assert_eq!(config.stack_type(), StackScope::Thread);
        assert_eq!(config.signals(), default_signals().as_slice());
    }

    #[test]
    fn test_empty_signals_fall_back_to_defaults() {
        let config = AbortBehavior::new(
            true,
            false,
            true,
            true,
            StackScope::Thread,
            Vec::new(),
            false,
            false,
        )
        .unwrap();
        assert_eq!(config.signals(), default_signals().as_slice());
    }

    #[test]
    fn test_duplicate_signals_rejected() {
        let err = AbortBehavior::new(
            true,
            false,
            true,
            true,
            StackScope::Thread,
            vec![libc::SIGSEGV, libc::SIGSEGV],
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSignals));
    }

    #[test]
    fn test_invalid_signal_number_rejected() {
        let err = AbortBehavior::new(
            true,
            false,
            true,
            true,
            StackScope::Thread,
            vec![999],
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSignal(999)));
    }

    #[test]
    fn test_create_without_use_alt_stack_rejected() {
        let err = AbortBehavior::new(
            true, false, true, true, StackScope::Thread, Vec::new(), true, false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::AltStackParadox));
    }

    #[test]
    fn test_set_use_alt_stack_rejects_paradox() {
        let mut config = AbortBehavior::default();
        assert!(config.set_use_alt_stack(false).is_err());
    }
}
