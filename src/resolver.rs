// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stack Resolver (C3): turns a raw address into a [`StackFrame`] by
//! combining the platform backend (C1), the symbol cache (C2), and the
//! backend's external symboliser, per the four-step algorithm in §4.3.

use crate::frame::StackFrame;
use crate::platform;
use crate::symbol_cache::SymbolCache;
use std::path::Path;

/// Resolves raw addresses to [`StackFrame`]s for one executable, reusing
/// a [`SymbolCache`] across calls (§4.2's "amortises the cost of parsing
/// the executable's symbol table").
pub struct StackResolver {
    symbol_cache: SymbolCache,
}

impl StackResolver {
    pub fn new(executable_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            symbol_cache: SymbolCache::new(executable_path),
        }
    }

    /// Resolves a single address through the four-step algorithm in
    /// §4.3. Every step is best-effort: a failure at any step degrades
    /// the corresponding fields rather than aborting resolution (§7
    /// propagation policy).
    pub fn resolve(&self, address: u64) -> StackFrame {
        let mut frame = StackFrame::with_address(address);

        // Step 1: ask the backend for the owning module.
        let module = platform::module_of(address);
        if !module.is_empty() {
            frame.object = module.path.clone();
            frame.address2 = address.wrapping_sub(module.base);
            if let Some(name) = module.symbol_name {
                frame.function = name;
                frame.demangle_function();
            }
        } else {
            // Step 2: the loader couldn't place it; fall back to the
            // symbol cache for the current executable.
            let _ = self.symbol_cache.load();
            if let Some((name, _kind)) = self.symbol_cache.lookup(address) {
                frame.function = name;
                frame.demangle_function();
                frame.object = self.executable_path_string();
            }
        }

        // Step 3: external symboliser, using a load-relative address for
        // shared libraries on POSIX (§4.3 step 3).
        if !frame.object.is_empty() {
            let symbolise_address = if is_shared_library(&frame.object) {
                frame.address2
            } else {
                address
            };
            let output = platform::symbolise_offline(&frame.object, symbolise_address);
            if let (Some(filename), Some(line)) = (output.filename, output.line) {
                frame.set_source_location(filename, line);
            }
            if frame.function.is_empty() {
                if let Some(function) = output.function {
                    frame.function = function;
                    frame.demangle_function();
                }
            }
        }

        // Step 4: if nothing resolved, `frame` still carries `address`
        // alone, which is a valid return per §4.3.
        if frame.function.is_empty() {
            tracing::warn!(address = format_args!("{address:#x}"), "unresolved stack frame");
        }
        frame
    }

    /// Resolves an entire stack, innermost frame first (§5 ordering
    /// guarantees carry through unchanged — this function does not
    /// reorder).
    pub fn resolve_all(&self, addresses: &[u64]) -> Vec<StackFrame> {
        addresses.iter().map(|&addr| self.resolve(addr)).collect()
    }

    fn executable_path_string(&self) -> String {
        self.symbol_cache.executable_path().display().to_string()
    }
}

#[cfg(unix)]
fn is_shared_library(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == "so" || ext.starts_with("so."))
        .unwrap_or(false)
        || path.contains(".so.")
}

#[cfg(not(unix))]
fn is_shared_library(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("dll"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_unknown_address_falls_back_to_address_only() {
        let resolver = StackResolver::new("/nonexistent/executable");
        let frame = resolver.resolve(0);
        assert_eq!(frame.address, 0);
    }

    #[test]
    fn test_is_shared_library_posix() {
        assert!(is_shared_library("/usr/lib/libfoo.so"));
        assert!(is_shared_library("/usr/lib/libfoo.so.1.2.3"));
        assert!(!is_shared_library("/usr/bin/myapp"));
    }

    #[test]
    fn test_resolve_all_preserves_order() {
        let resolver = StackResolver::new("/nonexistent/executable");
        let frames = resolver.resolve_all(&[1, 2, 3]);
        assert_eq!(
            frames.iter().map(|f| f.address).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}
