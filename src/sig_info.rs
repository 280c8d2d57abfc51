// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Signal-number bookkeeping shared between the signal surface (C6) and the
//! abort/terminate path (C5).

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Human-readable signal name, used on the `signal` variant of
/// [`crate::abort::AbortCause`] so a report doesn't force the reader to
/// remember that 11 means SIGSEGV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[repr(C)]
pub enum SignalNames {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGILL,
    SIGTRAP,
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGKILL,
    SIGUSR1,
    SIGSEGV,
    SIGUSR2,
    SIGPIPE,
    SIGALRM,
    SIGTERM,
    SIGCHLD,
    SIGCONT,
    SIGSTOP,
    SIGTSTP,
    SIGTTIN,
    SIGTTOU,
    SIGURG,
    SIGXCPU,
    SIGXFSZ,
    SIGVTALRM,
    SIGPROF,
    SIGWINCH,
    SIGIO,
    SIGSYS,
    UNKNOWN,
}

/// Coarse classification of `siginfo_t::si_code`, supplementing the bare
/// `signal_number` that `spec.md` calls for (§10.4 of SPEC_FULL.md): knowing
/// a SIGSEGV was a `SEGV_MAPERR` (unmapped page) vs `SEGV_ACCERR`
/// (protection violation) is usually the first thing a reader of a crash
/// report wants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromPrimitive, ToPrimitive,
)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[repr(C)]
pub enum SiCode {
    SegvMapErr,
    SegvAccErr,
    SegvBndErr,
    SegvPkuErr,
    BusAdrAlign,
    BusAdrErr,
    BusObjErr,
    IllIllOpc,
    IllIllOpn,
    IllIllAdr,
    IllIllTrp,
    IllPrvOpc,
    IllPrvReg,
    IllCoProc,
    IllBadStk,
    FpeIntDiv,
    FpeIntOvf,
    FpeFltDiv,
    FpeFltOvf,
    FpeFltUnd,
    FpeFltRes,
    FpeFltInv,
    FpeFltSub,
    SiUser,
    SiKernel,
    SiQueue,
    SiTimer,
    SiAsyncIo,
    SiMesgQ,
    SiSigIo,
    SiTkill,
    Unknown,
}

#[cfg(unix)]
mod unix {
    use super::*;

    impl From<nix::sys::signal::Signal> for SignalNames {
        fn from(value: nix::sys::signal::Signal) -> Self {
            use nix::sys::signal::Signal::*;
            match value {
                SIGHUP => SignalNames::SIGHUP,
                SIGINT => SignalNames::SIGINT,
                SIGQUIT => SignalNames::SIGQUIT,
                SIGILL => SignalNames::SIGILL,
                SIGTRAP => SignalNames::SIGTRAP,
                SIGABRT => SignalNames::SIGABRT,
                SIGBUS => SignalNames::SIGBUS,
                SIGFPE => SignalNames::SIGFPE,
                SIGKILL => SignalNames::SIGKILL,
                SIGUSR1 => SignalNames::SIGUSR1,
                SIGSEGV => SignalNames::SIGSEGV,
                SIGUSR2 => SignalNames::SIGUSR2,
                SIGPIPE => SignalNames::SIGPIPE,
                SIGALRM => SignalNames::SIGALRM,
                SIGTERM => SignalNames::SIGTERM,
                SIGCHLD => SignalNames::SIGCHLD,
                SIGCONT => SignalNames::SIGCONT,
                SIGSTOP => SignalNames::SIGSTOP,
                SIGTSTP => SignalNames::SIGTSTP,
                SIGTTIN => SignalNames::SIGTTIN,
                SIGTTOU => SignalNames::SIGTTOU,
                SIGURG => SignalNames::SIGURG,
                SIGXCPU => SignalNames::SIGXCPU,
                SIGXFSZ => SignalNames::SIGXFSZ,
                SIGVTALRM => SignalNames::SIGVTALRM,
                SIGPROF => SignalNames::SIGPROF,
                SIGWINCH => SignalNames::SIGWINCH,
                SIGIO => SignalNames::SIGIO,
                SIGSYS => SignalNames::SIGSYS,
                _ => SignalNames::UNKNOWN,
            }
        }
    }

    /// Converts a raw signal number into a [`nix::sys::signal::Signal`].
    /// Can't use `TryFrom` because we don't own either type.
    pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
        nix::sys::signal::Signal::try_from(value)
            .map_err(|_| anyhow::anyhow!("unexpected signal number {value}"))
    }

    /// Classifies `si_code` for the signals this crate cares about.
    /// Codes are POSIX-portable where the standard defines them; unknown
    /// combinations map to `Unknown` rather than failing, matching the
    /// tolerant-parser style used throughout the symbol cache (§4.2).
    pub fn translate_si_code(signum: libc::c_int, si_code: libc::c_int) -> SiCode {
        match signum {
            libc::SIGSEGV => match si_code {
                libc::SEGV_MAPERR => SiCode::SegvMapErr,
                libc::SEGV_ACCERR => SiCode::SegvAccErr,
                _ => SiCode::Unknown,
            },
            libc::SIGBUS => match si_code {
                libc::BUS_ADRALN => SiCode::BusAdrAlign,
                libc::BUS_ADRERR => SiCode::BusAdrErr,
                libc::BUS_OBJERR => SiCode::BusObjErr,
                _ => SiCode::Unknown,
            },
            libc::SIGILL => match si_code {
                libc::ILL_ILLOPC => SiCode::IllIllOpc,
                libc::ILL_ILLOPN => SiCode::IllIllOpn,
                libc::ILL_ILLADR => SiCode::IllIllAdr,
                libc::ILL_ILLTRP => SiCode::IllIllTrp,
                libc::ILL_PRVOPC => SiCode::IllPrvOpc,
                libc::ILL_PRVREG => SiCode::IllPrvReg,
                libc::ILL_COPROC => SiCode::IllCoProc,
                libc::ILL_BADSTK => SiCode::IllBadStk,
                _ => SiCode::Unknown,
            },
            libc::SIGFPE => match si_code {
                libc::FPE_INTDIV => SiCode::FpeIntDiv,
                libc::FPE_INTOVF => SiCode::FpeIntOvf,
                libc::FPE_FLTDIV => SiCode::FpeFltDiv,
                libc::FPE_FLTOVF => SiCode::FpeFltOvf,
                libc::FPE_FLTUND => SiCode::FpeFltUnd,
                libc::FPE_FLTRES => SiCode::FpeFltRes,
                libc::FPE_FLTINV => SiCode::FpeFltInv,
                libc::FPE_FLTSUB => SiCode::FpeFltSub,
                _ => SiCode::Unknown,
            },
            _ => match si_code {
                libc::SI_USER => SiCode::SiUser,
                libc::SI_KERNEL => SiCode::SiKernel,
                libc::SI_QUEUE => SiCode::SiQueue,
                libc::SI_TIMER => SiCode::SiTimer,
                libc::SI_ASYNCIO => SiCode::SiAsyncIo,
                libc::SI_MESGQ => SiCode::SiMesgQ,
                libc::SI_SIGIO => SiCode::SiSigIo,
                libc::SI_TKILL => SiCode::SiTkill,
                _ => SiCode::Unknown,
            },
        }
    }
}

#[cfg(unix)]
pub use unix::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_signal_from_signum_known() {
        let sig = signal_from_signum(libc::SIGSEGV).unwrap();
        assert_eq!(sig, nix::sys::signal::Signal::SIGSEGV);
        assert_eq!(SignalNames::from(sig), SignalNames::SIGSEGV);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_from_signum_unknown() {
        assert!(signal_from_signum(999).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_translate_si_code_segv() {
        assert_eq!(
            translate_si_code(libc::SIGSEGV, libc::SEGV_MAPERR),
            SiCode::SegvMapErr
        );
        assert_eq!(
            translate_si_code(libc::SIGSEGV, libc::SEGV_ACCERR),
            SiCode::SegvAccErr
        );
        assert_eq!(translate_si_code(libc::SIGSEGV, 42), SiCode::Unknown);
    }

    #[test]
    fn test_si_code_to_primitive_round_trip() {
        use num_traits::{FromPrimitive, ToPrimitive};
        let tag = SiCode::SegvMapErr.to_i32().unwrap();
        assert_eq!(SiCode::from_i32(tag), Some(SiCode::SegvMapErr));
    }
}
