// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! POSIX-with-GNU-loader backend (§4.1): `libc::backtrace`/`dladdr` for
//! capture and module lookup, `addr2line` for offline symbolisation.
//! Falls back to the musl frame-pointer walker (§10.4) for capture on
//! musl targets, where `backtrace(3)` is documented as unreliable.

#[cfg(target_env = "musl")]
use super::frame_pointer_walker::{self, FrameContext, RawFrame};
use super::limits::MAX_BACKTRACE_FRAMES;
use super::{ModuleInfo, SymbolOutput, ThreadHandle};
use crate::error::StacktraceError;
use std::ffi::CStr;
use std::os::raw::c_void;
use std::process::Command;

#[cfg(not(target_env = "musl"))]
pub fn capture_backtrace(max_depth: usize) -> Vec<u64> {
    let depth = max_depth.min(MAX_BACKTRACE_FRAMES);
    let mut buf: Vec<*mut c_void> = vec![std::ptr::null_mut(); depth];
    let count = unsafe { libc::backtrace(buf.as_mut_ptr(), depth as libc::c_int) };
    let count = count.max(0) as usize;
    buf.truncate(count);
    // backtrace(3) already starts at its caller, i.e. innermost-first (§4.1.1).
    buf.into_iter().map(|p| p as u64).collect()
}

#[cfg(target_env = "musl")]
pub fn capture_backtrace(max_depth: usize) -> Vec<u64> {
    let depth = max_depth.min(MAX_BACKTRACE_FRAMES);
    unsafe {
        let mut ctx: libc::ucontext_t = std::mem::zeroed();
        if libc::getcontext(&mut ctx) != 0 {
            return Vec::new();
        }
        let Some(frame_ctx) = FrameContext::from_ucontext(&ctx) else {
            return Vec::new();
        };
        let mut raw = vec![RawFrame::default(); depth];
        let count = frame_pointer_walker::walk_frame_pointers(&frame_ctx, &mut raw);
        raw.truncate(count);
        raw.into_iter().map(|f| f.ip as u64).collect()
    }
}

/// This backend can only capture the calling thread. A different
/// thread's stack would require signalling it and having it capture
/// itself into a shared buffer (the lock-free hand-off §4.6 describes as
/// an extension point) — not implemented here, so any handle but the
/// caller's own is `Unsupported` (§4.1.2 permits this).
pub fn capture_thread_backtrace(
    thread: ThreadHandle,
    max_depth: usize,
) -> Result<Vec<u64>, StacktraceError> {
    if thread == current_thread_handle() {
        Ok(capture_backtrace(max_depth))
    } else {
        Err(StacktraceError::Unsupported(
            "capturing a backtrace of another thread requires a signal hand-off this backend does not implement",
        ))
    }
}

#[cfg(target_os = "linux")]
pub fn current_thread_handle() -> ThreadHandle {
    unsafe { libc::syscall(libc::SYS_gettid) as ThreadHandle }
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_handle() -> ThreadHandle {
    unsafe { libc::pthread_self() as ThreadHandle }
}

#[cfg(target_os = "linux")]
pub fn enumerate_threads() -> Vec<ThreadHandle> {
    match std::fs::read_dir("/proc/self/task") {
        Ok(entries) => {
            let threads: Vec<ThreadHandle> = entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
                .collect();
            if threads.is_empty() {
                vec![current_thread_handle()]
            } else {
                threads
            }
        }
        Err(_) => vec![current_thread_handle()],
    }
}

#[cfg(not(target_os = "linux"))]
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

/// Shells out to `addr2line -f -C -e <module_path> <address>` (§4.2's
/// sibling tool for per-frame resolution rather than whole-table
/// listing). Tolerates a missing binary, a stripped binary, or
/// `addr2line` not being on `PATH` by returning all-`None` fields rather
/// than an error (§4.1.5 contract).
pub fn symbolise_offline(module_path: &str, address: u64) -> SymbolOutput {
    if module_path.is_empty() {
        return SymbolOutput::default();
    }
    let addr_arg = format!("{address:#x}");
    let output = Command::new("addr2line")
        .args(["-f", "-C", "-e", module_path, &addr_arg])
        .output();
    let Ok(output) = output else {
        return SymbolOutput::default();
    };
    if !output.status.success() {
        return SymbolOutput::default();
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut lines = text.lines();

    let function = lines
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "??")
        .map(str::to_string);

    let location = lines.next().unwrap_or("");
    let (filename, line) = match location.rsplit_once(':') {
        Some((file, line_str)) if !file.is_empty() && file != "??" => {
            (Some(file.to_string()), line_str.parse::<u32>().ok())
        }
        _ => (None, None),
    };

    SymbolOutput {
        function,
        filename,
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_backtrace_returns_nonempty() {
        let frames = capture_backtrace(32);
        assert!(!frames.is_empty());
    }

    #[test]
    fn test_capture_backtrace_respects_max_depth() {
        let frames = capture_backtrace(3);
        assert!(frames.len() <= 3);
    }

    #[test]
    fn test_capture_thread_backtrace_self_succeeds() {
        let frames = capture_thread_backtrace(current_thread_handle(), 16).unwrap();
        assert!(!frames.is_empty());
    }

    #[test]
    fn test_capture_thread_backtrace_other_is_unsupported() {
        let bogus_handle = current_thread_handle().wrapping_add(1);
        assert!(capture_thread_backtrace(bogus_handle, 16).is_err());
    }

    #[test]
    fn test_enumerate_threads_includes_current() {
        let threads = enumerate_threads();
        assert!(!threads.is_empty());
    }

    #[test]
    fn test_module_of_resolves_own_binary() {
        let info = module_of(module_of as usize as u64);
        assert!(!info.path.is_empty());
    }

    #[test]
    fn test_symbolise_offline_empty_module_path() {
        let result = symbolise_offline("", 0x1000);
        assert!(result.function.is_none());
        assert!(result.filename.is_none());
    }
}
