// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Darwin backend (§4.1): `libc::backtrace`/`dladdr`, same as the
//! POSIX-with-GNU-loader backend for capture and module lookup, but
//! `atos` instead of `addr2line` for offline symbolisation.
//!
//! The open question of whether to enable `atos` at all (§9, open
//! question 4) is resolved in `DESIGN.md`: it's enabled here, since this
//! design has no multi-process receiver for which disabling it to avoid
//! spawning child processes from a constrained collector would matter.

use super::limits::MAX_BACKTRACE_FRAMES;
use super::{ModuleInfo, SymbolOutput, ThreadHandle};
use crate::error::StacktraceError;
use std::ffi::CStr;
use std::os::raw::c_void;
use std::process::Command;

pub fn capture_backtrace(max_depth: usize) -> Vec<u64> {
    let depth = max_depth.min(MAX_BACKTRACE_FRAMES);
    let mut buf: Vec<*mut c_void> = vec![std::ptr::null_mut(); depth];
    let count = unsafe { libc::backtrace(buf.as_mut_ptr(), depth as libc::c_int) };
    let count = count.max(0) as usize;
    buf.truncate(count);
    buf.into_iter().map(|p| p as u64).collect()
}

/// Cross-thread capture is not implemented on this backend (§4.1.2's
/// `Unsupported` escape hatch, explicitly named for Darwin in §7's edge
/// cases).
pub fn capture_thread_backtrace(
    thread: ThreadHandle,
    max_depth: usize,
) -> Result<Vec<u64>, StacktraceError> {
    if thread == current_thread_handle() {
        Ok(capture_backtrace(max_depth))
    } else {
        Err(StacktraceError::Unsupported(
            "cross-thread stack capture is not supported on the Darwin backend",
        ))
    }
}

pub fn current_thread_handle() -> ThreadHandle {
    unsafe { libc::pthread_self() as ThreadHandle }
}

/// No portable thread-enumeration API ships in `libc` for Darwin (the
/// underlying `task_threads` Mach call isn't bound there); only the
/// calling thread is reported.
pub fn enumerate_threads() -> Vec<ThreadHandle> {
    vec![current_thread_handle()]
}

pub fn module_of(address: u64) -> ModuleInfo {
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        let rc = libc::dladdr(address as *const c_void, &mut info);
        if rc == 0 {
            return ModuleInfo::default();
        }
        let path = if info.dli_fname.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dli_fname).to_string_lossy().into_owned()
        };
        let symbol_name = if info.dli_sname.is_null() {
            None
        } else {
            Some(CStr::from_ptr(info.dli_sname).to_string_lossy().into_owned())
        };
        ModuleInfo {
            path,
            base: info.dli_fbase as u64,
            symbol_name,
        }
    }
}

/// `atos -o <module_path> -l <base> <address>` prints one line like
/// `function (in module) (file.c:12)` or just `function (in module)` if
/// no line info is available. Tolerates a missing `atos`, a stripped
/// binary, or any unparsable output by returning all-`None` fields.
pub fn symbolise_offline(module_path: &str, address: u64) -> SymbolOutput {
    if module_path.is_empty() {
        return SymbolOutput::default();
    }
    let output = Command::new("atos")
        .args(["-o", module_path, &format!("{address:#x}")])
        .output();
    let Ok(output) = output else {
        return SymbolOutput::default();
    };
    if !output.status.success() {
        return SymbolOutput::default();
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_atos_line(text.trim())
}

fn parse_atos_line(line: &str) -> SymbolOutput {
    let function = line
        .split(" (in ")
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let (filename, line_no) = match (line.rfind('('), line.rfind(')')) {
        (Some(open), Some(close)) if close > open => {
            let inner = &line[open + 1..close];
            match inner.rsplit_once(':') {
                Some((file, num)) => (Some(file.to_string()), num.parse::<u32>().ok()),
                None => (None, None),
            }
        }
        _ => (None, None),
    };

    SymbolOutput {
        function,
        filename,
        line: line_no,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_backtrace_returns_nonempty() {
        assert!(!capture_backtrace(32).is_empty());
    }

    #[test]
    fn test_capture_thread_backtrace_other_is_unsupported() {
        let bogus = current_thread_handle().wrapping_add(1);
        assert!(capture_thread_backtrace(bogus, 16).is_err());
    }

    #[test]
    fn test_parse_atos_line_with_file_and_line() {
        let out = parse_atos_line("compute_widget (in widget) (widget.c:42)");
        assert_eq!(out.function.as_deref(), Some("compute_widget"));
        assert_eq!(out.filename.as_deref(), Some("widget.c"));
        assert_eq!(out.line, Some(42));
    }

    #[test]
    fn test_parse_atos_line_without_file_info() {
        let out = parse_atos_line("compute_widget (in widget)");
        assert_eq!(out.function.as_deref(), Some("compute_widget"));
        assert!(out.filename.is_none());
    }

    #[test]
    fn test_symbolise_offline_empty_module_path() {
        let result = symbolise_offline("", 0x1000);
        assert!(result.function.is_none());
    }
}
