// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fallback backend (§4.1): compiled in for any target that isn't POSIX,
//! Darwin, or Windows. Returns `Unsupported` for the two capabilities
//! that genuinely need OS cooperation and empty data for the rest,
//! exactly as §4.1's "a fourth Fallback backend" describes. The Windows
//! backend also degrades to this behaviour once its state machine
//! reaches `Failed` (§4.1 state machine).

use super::{ModuleInfo, SymbolOutput, ThreadHandle};
use crate::error::StacktraceError;

pub fn capture_backtrace(_max_depth: usize) -> Vec<u64> {
    Vec::new()
}

pub fn capture_thread_backtrace(
    _thread: ThreadHandle,
    _max_depth: usize,
) -> Result<Vec<u64>, StacktraceError> {
    Err(StacktraceError::Unsupported(
        "no platform backend is available on this target",
    ))
}

pub fn enumerate_threads() -> Vec<ThreadHandle> {
    Vec::new()
}

pub fn module_of(_address: u64) -> ModuleInfo {
    ModuleInfo::default()
}

pub fn symbolise_offline(_module_path: &str, _address: u64) -> SymbolOutput {
    SymbolOutput::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_backtrace_is_empty() {
        assert!(capture_backtrace(16).is_empty());
    }

    #[test]
    fn test_capture_thread_backtrace_is_unsupported() {
        assert!(capture_thread_backtrace(0, 16).is_err());
    }

    #[test]
    fn test_module_of_is_empty() {
        assert!(module_of(0x1234).is_empty());
    }
}
