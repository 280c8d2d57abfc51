// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Symbol Cache (C2): a lazily-built, sorted table of `(address, kind,
//! name)` records for the current executable, consulted by the resolver
//! (C3) when the dynamic loader alone can't name a local (non-exported)
//! symbol.
//!
//! The "mutex gates the first load, lock-free after" contract (§4.2, §5)
//! is implemented the same way the teacher swaps its process-wide
//! `METADATA`/`CONFIG` pointers in `collector::crash_handler`: the frozen
//! table is an `AtomicPtr`, published with `Release` and read with
//! `Acquire`, so a successful `load()` is visible to readers without
//! their taking a lock. `clear()` intentionally leaks the outgoing table
//! rather than dropping it — an in-flight reader may still hold a
//! reference to it, and this crate has no epoch-based reclamation scheme
//! to safely free memory another thread might be reading concurrently.

use crate::error::StacktraceError;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

/// One row of the symbol table: `kind` is a single linkage character
/// (`T`, `t`, `B`, `D`, `W`, ...) interpreted opaquely (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub address: u64,
    pub kind: char,
    pub name: String,
}

enum CacheState {
    Loaded(Vec<SymbolRecord>),
    Failed(String),
}

/// Symbol cache for a single executable path. Callers typically keep one
/// instance per process (the resolver owns it), but nothing here assumes
/// a process-wide singleton.
pub struct SymbolCache {
    executable_path: PathBuf,
    load_gate: Mutex<()>,
    state: AtomicPtr<CacheState>,
}

impl SymbolCache {
    pub fn new(executable_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
            load_gate: Mutex::new(()),
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Idempotent. The first successful call populates the table; the
    /// first failing call caches the error and every subsequent call
    /// returns that same error until [`Self::clear`] (§4.2).
    pub fn load(&self) -> Result<(), StacktraceError> {
        if let Some(result) = self.snapshot_result() {
            return result;
        }
        let _guard = self.load_gate.lock().unwrap();
        // Another thread may have finished loading while we waited for the gate.
        if let Some(result) = self.snapshot_result() {
            return result;
        }
        let state = match parse_symbol_table(&self.executable_path) {
            Ok(records) => {
                tracing::debug!(
                    path = %self.executable_path.display(),
                    count = records.len(),
                    "loaded symbol table"
                );
                CacheState::Loaded(records)
            }
            Err(message) => {
                tracing::warn!(
                    path = %self.executable_path.display(),
                    error = %message,
                    "failed to load symbol table"
                );
                CacheState::Failed(message)
            }
        };
        let result = match &state {
            CacheState::Loaded(_) => Ok(()),
            CacheState::Failed(message) => Err(StacktraceError::CacheLoadFailed(message.clone())),
        };
        self.state
            .store(Box::into_raw(Box::new(state)), Ordering::Release);
        result
    }

    fn snapshot_result(&self) -> Option<Result<(), StacktraceError>> {
        let ptr = self.state.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // Safety: once published, a `CacheState` is never freed (see `clear`),
        // so this reference stays valid for the lifetime of the program.
        Some(match unsafe { &*ptr } {
            CacheState::Loaded(_) => Ok(()),
            CacheState::Failed(message) => Err(StacktraceError::CacheLoadFailed(message.clone())),
        })
    }

    /// Returns the record immediately preceding `address` in sorted
    /// order, or `None` if the table is empty, unloaded, or `address`
    /// precedes every record.
    pub fn lookup(&self, address: u64) -> Option<(String, char)> {
        let ptr = self.state.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        match unsafe { &*ptr } {
            CacheState::Loaded(records) => lower_bound_lookup(records, address),
            CacheState::Failed(_) => None,
        }
    }

    /// Resets to the pre-load state. Safe under concurrent readers: they
    /// observe either the old table or an empty one, never a torn read,
    /// because the swap is a single atomic store.
    pub fn clear(&self) {
        self.state.swap(ptr::null_mut(), Ordering::AcqRel);
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }
}

fn lower_bound_lookup(records: &[SymbolRecord], address: u64) -> Option<(String, char)> {
    let idx = records.partition_point(|r| r.address <= address);
    if idx == 0 {
        return None;
    }
    let mut i = idx - 1;
    let target = records[i].address;
    // Duplicates at the same address: first-wins (§4.2 edge cases).
    while i > 0 && records[i - 1].address == target {
        i -= 1;
    }
    let record = &records[i];
    Some((record.name.clone(), record.kind))
}

#[cfg(target_os = "linux")]
fn run_name_listing_tool(executable_path: &Path) -> Result<String, String> {
    let output = Command::new("nm")
        .arg("-n")
        .arg("--demangle")
        .arg(executable_path)
        .output()
        .map_err(|e| format!("failed to spawn nm: {e}"))?;
    if !output.status.success() {
        return Err(format!("nm exited with {}", output.status));
    }
    String::from_utf8(output.stdout).map_err(|e| format!("nm output was not UTF-8: {e}"))
}

#[cfg(target_os = "macos")]
fn run_name_listing_tool(executable_path: &Path) -> Result<String, String> {
    use std::process::Stdio;

    let nm = Command::new("nm")
        .arg("-n")
        .arg(executable_path)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn nm: {e}"))?;
    let output = Command::new("c++filt")
        .stdin(nm.stdout.ok_or_else(|| "nm produced no stdout".to_string())?)
        .output()
        .map_err(|e| format!("failed to spawn c++filt: {e}"))?;
    if !output.status.success() {
        return Err(format!("c++filt exited with {}", output.status));
    }
    String::from_utf8(output.stdout).map_err(|e| format!("c++filt output was not UTF-8: {e}"))
}

/// Windows relies on DbgHelp directly (§4.2); the symbol cache is never
/// populated there, so `load()` always fails with a consistent message
/// rather than shelling out to a tool that doesn't exist on that
/// platform.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_name_listing_tool(_executable_path: &Path) -> Result<String, String> {
    Err("symbol cache is not populated on this platform".to_string())
}

fn parse_symbol_table(executable_path: &Path) -> Result<Vec<SymbolRecord>, String> {
    let text = run_name_listing_tool(executable_path)?;
    let mut records: Vec<SymbolRecord> = text.lines().filter_map(parse_line).collect();
    records.sort_by_key(|r| r.address);
    Ok(records)
}

/// Parses one `nm -n` line: `<hex-address> <kind-char> <name...>`.
/// Lines starting with whitespace (undefined symbols) and lines with
/// fewer than three whitespace-separated fields are skipped, not
/// treated as errors (§4.2 tolerant parser).
fn parse_line(line: &str) -> Option<SymbolRecord> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return None;
    }
    let mut parts = line.splitn(3, char::is_whitespace);
    let address_str = parts.next()?;
    let kind_str = parts.next()?;
    let name = parts.next()?.trim_start();
    if address_str.is_empty() || kind_str.len() != 1 || name.is_empty() {
        return None;
    }
    let address = u64::from_str_radix(address_str, 16).ok()?;
    let kind = kind_str.chars().next()?;
    Some(SymbolRecord {
        address,
        kind,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_accepts_well_formed() {
        let record = parse_line("0000000000001149 T main").unwrap();
        assert_eq!(record.address, 0x1149);
        assert_eq!(record.kind, 'T');
        assert_eq!(record.name, "main");
    }

    #[test]
    fn test_parse_line_rejects_leading_whitespace() {
        assert!(parse_line("         U puts").is_none());
    }

    #[test]
    fn test_parse_line_rejects_too_few_fields() {
        assert!(parse_line("0000000000001149 T").is_none());
        assert!(parse_line("garbage").is_none());
    }

    #[test]
    fn test_parse_line_demangled_name_with_spaces() {
        let record = parse_line("0000000000002000 T operator new(unsigned long)").unwrap();
        assert_eq!(record.name, "operator new(unsigned long)");
    }

    #[test]
    fn test_lookup_returns_nearest_lower() {
        let records = vec![
            SymbolRecord {
                address: 0x100,
                kind: 'T',
                name: "f1".to_string(),
            },
            SymbolRecord {
                address: 0x200,
                kind: 'T',
                name: "f2".to_string(),
            },
        ];
        assert_eq!(
            lower_bound_lookup(&records, 0x150),
            Some(("f1".to_string(), 'T'))
        );
        assert_eq!(
            lower_bound_lookup(&records, 0x200),
            Some(("f2".to_string(), 'T'))
        );
        assert_eq!(lower_bound_lookup(&records, 0x50), None);
    }

    #[test]
    fn test_lookup_duplicate_addresses_first_wins() {
        let records = vec![
            SymbolRecord {
                address: 0x100,
                kind: 'T',
                name: "first".to_string(),
            },
            SymbolRecord {
                address: 0x100,
                kind: 't',
                name: "second".to_string(),
            },
        ];
        assert_eq!(
            lower_bound_lookup(&records, 0x100),
            Some(("first".to_string(), 'T'))
        );
    }

    #[test]
    fn test_lookup_empty_table() {
        let records: Vec<SymbolRecord> = Vec::new();
        assert_eq!(lower_bound_lookup(&records, 0x100), None);
    }

    #[test]
    fn test_load_is_idempotent_after_failure() {
        let cache = SymbolCache::new("/nonexistent/path/to/binary");
        let first = cache.load();
        assert!(first.is_err());
        let second = cache.load();
        assert!(second.is_err());
        assert_eq!(first.unwrap_err().to_string(), second.unwrap_err().to_string());
    }

    #[test]
    fn test_clear_resets_to_unloaded() {
        let cache = SymbolCache::new("/nonexistent/path/to/binary");
        let _ = cache.load();
        assert!(cache.lookup(1).is_none());
        cache.clear();
        assert!(cache.lookup(1).is_none());
    }
}
