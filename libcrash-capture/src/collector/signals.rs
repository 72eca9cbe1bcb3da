// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fixed table of faults the handler chain intercepts.

/// Signal numbers on POSIX, exception codes on Windows.
#[cfg(unix)]
pub type SignalNumber = libc::c_int;
#[cfg(windows)]
pub type SignalNumber = u32;

/// One intercepted fault: its number, the symbolic name reported as the
/// exception type, and a human readable description reported as its value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignalSlot {
    pub number: SignalNumber,
    pub name: &'static str,
    pub description: &'static str,
}

macro_rules! signal_def {
    ($sig:ident, $desc:literal) => {
        SignalSlot {
            number: $sig,
            name: stringify!($sig),
            description: $desc,
        }
    };
}

#[cfg(unix)]
mod table {
    use super::SignalSlot;
    use libc::{SIGABRT, SIGBUS, SIGFPE, SIGILL, SIGSEGV, SIGTRAP};

    pub(super) const SIGNAL_DEFINITIONS: [SignalSlot; 6] = [
        signal_def!(SIGILL, "IllegalInstruction"),
        signal_def!(SIGTRAP, "Trap"),
        signal_def!(SIGABRT, "Abort"),
        signal_def!(SIGBUS, "BusError"),
        signal_def!(SIGFPE, "FloatingPointException"),
        signal_def!(SIGSEGV, "Segfault"),
    ];
}

#[cfg(windows)]
mod table {
    use super::SignalSlot;

    // NTSTATUS values, spelled out so the table does not depend on which
    // windows-sys modules export them.
    pub(super) const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
    pub(super) const EXCEPTION_ARRAY_BOUNDS_EXCEEDED: u32 = 0xC000_008C;
    pub(super) const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
    pub(super) const EXCEPTION_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
    pub(super) const EXCEPTION_FLT_DENORMAL_OPERAND: u32 = 0xC000_008D;
    pub(super) const EXCEPTION_FLT_DIVIDE_BY_ZERO: u32 = 0xC000_008E;
    pub(super) const EXCEPTION_FLT_INEXACT_RESULT: u32 = 0xC000_008F;
    pub(super) const EXCEPTION_FLT_INVALID_OPERATION: u32 = 0xC000_0090;
    pub(super) const EXCEPTION_FLT_OVERFLOW: u32 = 0xC000_0091;
    pub(super) const EXCEPTION_FLT_STACK_CHECK: u32 = 0xC000_0092;
    pub(super) const EXCEPTION_FLT_UNDERFLOW: u32 = 0xC000_0093;
    pub(super) const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
    pub(super) const EXCEPTION_IN_PAGE_ERROR: u32 = 0xC000_0006;
    pub(super) const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
    pub(super) const EXCEPTION_INT_OVERFLOW: u32 = 0xC000_0095;
    pub(super) const EXCEPTION_INVALID_DISPOSITION: u32 = 0xC000_0026;
    pub(super) const EXCEPTION_NONCONTINUABLE_EXCEPTION: u32 = 0xC000_0025;
    pub(super) const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
    pub(super) const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
    pub(super) const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;

    pub(super) const SIGNAL_DEFINITIONS: [SignalSlot; 20] = [
        signal_def!(EXCEPTION_ACCESS_VIOLATION, "AccessViolation"),
        signal_def!(EXCEPTION_ARRAY_BOUNDS_EXCEEDED, "ArrayBoundsExceeded"),
        signal_def!(EXCEPTION_BREAKPOINT, "BreakPoint"),
        signal_def!(EXCEPTION_DATATYPE_MISALIGNMENT, "DatatypeMisalignment"),
        signal_def!(EXCEPTION_FLT_DENORMAL_OPERAND, "FloatDenormalOperand"),
        signal_def!(EXCEPTION_FLT_DIVIDE_BY_ZERO, "FloatDivideByZero"),
        signal_def!(EXCEPTION_FLT_INEXACT_RESULT, "FloatInexactResult"),
        signal_def!(EXCEPTION_FLT_INVALID_OPERATION, "FloatInvalidOperation"),
        signal_def!(EXCEPTION_FLT_OVERFLOW, "FloatOverflow"),
        signal_def!(EXCEPTION_FLT_STACK_CHECK, "FloatStackCheck"),
        signal_def!(EXCEPTION_FLT_UNDERFLOW, "FloatUnderflow"),
        signal_def!(EXCEPTION_ILLEGAL_INSTRUCTION, "IllegalInstruction"),
        signal_def!(EXCEPTION_IN_PAGE_ERROR, "InPageError"),
        signal_def!(EXCEPTION_INT_DIVIDE_BY_ZERO, "IntegerDivideByZero"),
        signal_def!(EXCEPTION_INT_OVERFLOW, "IntegerOverflow"),
        signal_def!(EXCEPTION_INVALID_DISPOSITION, "InvalidDisposition"),
        signal_def!(EXCEPTION_NONCONTINUABLE_EXCEPTION, "NonContinuableException"),
        signal_def!(EXCEPTION_PRIV_INSTRUCTION, "PrivilegedInstruction"),
        signal_def!(EXCEPTION_SINGLE_STEP, "SingleStep"),
        signal_def!(EXCEPTION_STACK_OVERFLOW, "StackOverflow"),
    ];
}

#[cfg(windows)]
pub(crate) use table::{EXCEPTION_BREAKPOINT, EXCEPTION_SINGLE_STEP};

/// Every fault the handler chain intercepts on this platform.
pub fn signal_slots() -> &'static [SignalSlot] {
    &table::SIGNAL_DEFINITIONS
}

/// Looks up the slot for `number` with a linear scan of the fixed table.
/// Safe to call from a signal handler.
pub fn find_slot(number: SignalNumber) -> Option<&'static SignalSlot> {
    signal_slots().iter().find(|slot| slot.number == number)
}

#[cfg(unix)]
pub(crate) fn slot_index(number: SignalNumber) -> Option<usize> {
    signal_slots().iter().position(|slot| slot.number == number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_unix_table() {
        let names: Vec<_> = signal_slots().iter().map(|s| s.name).collect();
        assert_eq!(
            vec!["SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE", "SIGSEGV"],
            names
        );
        let segv = find_slot(libc::SIGSEGV).unwrap();
        assert_eq!("Segfault", segv.description);
        assert_eq!(Some(5), slot_index(libc::SIGSEGV));
        assert!(find_slot(libc::SIGUSR1).is_none());
        assert!(slot_index(libc::SIGUSR1).is_none());
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_table() {
        assert_eq!(20, signal_slots().len());
        let av = find_slot(0xC000_0005).unwrap();
        assert_eq!("EXCEPTION_ACCESS_VIOLATION", av.name);
        assert_eq!("AccessViolation", av.description);
        assert!(find_slot(EXCEPTION_BREAKPOINT).is_some());
        assert!(find_slot(0xE06D_7363).is_none());
    }

    #[test]
    fn test_numbers_are_unique() {
        let mut numbers: Vec<_> = signal_slots().iter().map(|s| s.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        assert_eq!(signal_slots().len(), numbers.len());
    }
}
