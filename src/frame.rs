// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! The resolved-frame data model (§3 `StackFrame`) and its wire format
//! (§6 Serialization).

use serde::{Deserialize, Serialize};
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// A single resolved stack frame.
///
/// Invariants (enforced by the resolver, not by this type itself — a
/// `StackFrame` is a plain record and the resolver is the only code that
/// constructs non-trivial ones):
/// - `filename.is_empty()` implies `line == 0`.
/// - `object` is either empty or was an existing path at capture time.
/// - `address` is never zero in a frame that is persisted (returned from
///   `resolve`); an all-zero frame only appears transiently inside capture
///   buffers before they're filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StackFrame {
    /// Virtual program counter.
    pub address: u64,
    /// Offset of `address` from the base of the owning shared object; 0 for
    /// the main executable.
    pub address2: u64,
    /// File path of the module containing `address`; empty if unknown.
    pub object: String,
    /// Demangled symbol name; empty if unresolved.
    pub function: String,
    /// Source file name; empty if unavailable.
    pub filename: String,
    /// 1-based source line; 0 means unknown.
    pub line: u32,
}

impl StackFrame {
    /// A frame with only `address` populated — the minimum the resolver
    /// ever returns (§4.3 step 4).
    pub fn with_address(address: u64) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// `filename.is_empty() => line == 0`, by construction: this is the
    /// only place `filename`/`line` are set together outside of
    /// deserialization, so callers can't violate the invariant by hand.
    pub fn set_source_location(&mut self, filename: String, line: u32) {
        if filename.is_empty() {
            self.filename = String::new();
            self.line = 0;
        } else {
            self.filename = filename;
            self.line = line;
        }
    }

    /// Demangles `function` in place. Tries Rust, then C++, then MSVC
    /// manglings (`DemangleOptions::name_only()` — we only want the name,
    /// not full signatures). If demangling doesn't change anything the
    /// mangled form is kept verbatim rather than surfacing an error: an
    /// unmangled or unrecognized name is not a failure (§7, recoverable
    /// degradation).
    pub fn demangle_function(&mut self) {
        if self.function.is_empty() {
            return;
        }
        if let Some(demangled) =
            Name::from(self.function.as_str()).demangle(DemangleOptions::name_only())
        {
            self.function = demangled.into_owned();
        }
    }

    /// Serializes this frame to the compact wire layout described in §6:
    /// `address` (8 bytes LE), `address2` (8 bytes LE), `line` (4 bytes
    /// LE), then `object`, `filename`, `function` each as a 4-byte LE
    /// length prefix followed by UTF-8 bytes.
    ///
    /// The source spec's layout used a `uint8_t line` that truncated
    /// anything past 255 — an identified defect (§9, open question 1).
    /// This implementation uses a full 32-bit `line` field as the design
    /// note recommends, so `pack`/`unpack` round-trips for every `line`
    /// value, not just `line <= 255`.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + 12 + self.object.len() + self.filename.len() + self.function.len());
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(&self.address2.to_le_bytes());
        buf.extend_from_slice(&self.line.to_le_bytes());
        pack_string(&mut buf, &self.object);
        pack_string(&mut buf, &self.filename);
        pack_string(&mut buf, &self.function);
        buf
    }

    /// Inverse of [`Self::pack`]. Returns the decoded frame and the number
    /// of bytes consumed from `buf`, so callers packing a sequence of
    /// frames back-to-back (see [`pack_array`]) can advance a cursor.
    pub fn unpack(buf: &[u8]) -> Result<(Self, usize), UnpackError> {
        let mut pos = 0usize;
        let address = read_u64(buf, &mut pos)?;
        let address2 = read_u64(buf, &mut pos)?;
        let line = read_u32(buf, &mut pos)?;
        let object = unpack_string(buf, &mut pos)?;
        let filename = unpack_string(buf, &mut pos)?;
        let function = unpack_string(buf, &mut pos)?;
        Ok((
            Self {
                address,
                address2,
                object,
                function,
                filename,
                line,
            },
            pos,
        ))
    }
}

/// Errors for [`StackFrame::unpack`]/[`unpack_array`]: the byte slice ran
/// out before a field could be fully read, or a length-prefixed string
/// wasn't valid UTF-8.
#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("buffer truncated: expected {expected} more bytes at offset {offset}, found {found}")]
    Truncated {
        offset: usize,
        expected: usize,
        found: usize,
    },
    #[error("string field at offset {0} was not valid UTF-8")]
    InvalidUtf8(usize),
}

fn pack_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, UnpackError> {
    let bytes = take(buf, pos, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, UnpackError> {
    let bytes = take(buf, pos, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], UnpackError> {
    if buf.len() < *pos + n {
        return Err(UnpackError::Truncated {
            offset: *pos,
            expected: n,
            found: buf.len().saturating_sub(*pos),
        });
    }
    let slice = &buf[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

fn unpack_string(buf: &[u8], pos: &mut usize) -> Result<String, UnpackError> {
    let len = read_u32(buf, pos)? as usize;
    let offset = *pos;
    let bytes = take(buf, pos, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| UnpackError::InvalidUtf8(offset))
}

/// Packs a sequence of frames the way `packArray` does in §6: a 4-byte LE
/// count followed by each element's own `pack()` output, back-to-back.
pub fn pack_array(frames: &[StackFrame]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        buf.extend_from_slice(&frame.pack());
    }
    buf
}

/// Inverse of [`pack_array`].
pub fn unpack_array(buf: &[u8]) -> Result<Vec<StackFrame>, UnpackError> {
    let mut pos = 0usize;
    let count = read_u32(buf, &mut pos)? as usize;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let (frame, consumed) = StackFrame::unpack(&buf[pos..])?;
        pos += consumed;
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let frame = StackFrame {
            address: 0x7fff_0000_1234,
            address2: 0x1234,
            object: "/usr/bin/widget".to_string(),
            function: "compute_widget".to_string(),
            filename: "widget.rs".to_string(),
            line: 42,
        };
        let packed = frame.pack();
        let (unpacked, consumed) = StackFrame::unpack(&packed).unwrap();
        assert_eq!(consumed, packed.len());
        assert_eq!(unpacked, frame);
    }

    #[test]
    fn test_pack_unpack_roundtrip_line_beyond_legacy_u8_limit() {
        // The original C++ layout truncated `line` to a uint8_t; this design
        // fixes that (§9, open question 1), so lines past 255 must survive.
        let frame = StackFrame {
            address: 1,
            address2: 0,
            object: String::new(),
            function: String::new(),
            filename: "big_file.rs".to_string(),
            line: 100_000,
        };
        let packed = frame.pack();
        let (unpacked, _) = StackFrame::unpack(&packed).unwrap();
        assert_eq!(unpacked.line, 100_000);
    }

    #[test]
    fn test_unpack_truncated() {
        let err = StackFrame::unpack(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, UnpackError::Truncated { .. }));
    }

    #[test]
    fn test_pack_array_roundtrip() {
        let frames = vec![
            StackFrame::with_address(1),
            StackFrame::with_address(2),
            StackFrame::with_address(3),
        ];
        let packed = pack_array(&frames);
        let unpacked = unpack_array(&packed).unwrap();
        assert_eq!(unpacked, frames);
    }

    #[test]
    fn test_pack_array_empty() {
        let packed = pack_array(&[]);
        let unpacked = unpack_array(&packed).unwrap();
        assert!(unpacked.is_empty());
    }

    #[test]
    fn test_set_source_location_enforces_invariant() {
        let mut frame = StackFrame::with_address(1);
        frame.set_source_location(String::new(), 99);
        assert_eq!(frame.line, 0);
        assert!(frame.filename.is_empty());

        frame.set_source_location("foo.rs".to_string(), 10);
        assert_eq!(frame.line, 10);
        assert_eq!(frame.filename, "foo.rs");
    }

    #[test]
    fn test_demangle_rust() {
        let mut frame = StackFrame::with_address(1);
        frame.function = "_ZN3std2rt10lang_start17h7a87e81ecc4a9d6cE".to_string();
        frame.demangle_function();
        assert_eq!(frame.function, "std::rt::lang_start");
    }

    #[test]
    fn test_demangle_cpp() {
        let mut frame = StackFrame::with_address(1);
        frame.function = "_ZN3Foo3barEv".to_string();
        frame.demangle_function();
        assert_eq!(frame.function, "Foo::bar");
    }

    #[test]
    fn test_demangle_unmangled_name_is_kept() {
        let mut frame = StackFrame::with_address(1);
        frame.function = "main".to_string();
        frame.demangle_function();
        assert_eq!(frame.function, "main");
    }

    #[test]
    fn test_demangle_empty_is_noop() {
        let mut frame = StackFrame::with_address(1);
        frame.demangle_function();
        assert_eq!(frame.function, "");
    }
}
