// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy and fault reporting.
//!
//! Faults detected while guest code runs are recorded into
//! [`RunState::error`](crate::run::RunState::error) rather than raised
//! immediately, so that the caller can decide whether to propagate them (see
//! [`MachineError::NestedCpuRun`]). [`ErrorReporter`] turns a raw
//! `MachineError` into a [`FaultReport`] enriched with the faulting PC, the
//! containing label if any, and a register dump; rendering to text is
//! deferred to its `Display` impl so the caller can log at whatever level it
//! wants (or not at all).

use std::fmt;

use thiserror::Error;

use crate::alloc::AllocError;
use crate::label::{Label, OverlapError};

/// The kind of memory operation that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    /// Instruction fetch, as opposed to a data access.
    Fetch,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Fetch => "fetch",
        };
        f.write_str(s)
    }
}

/// All errors the execution core can report, whether raised by the guest's
/// own misbehavior or by host misuse of the API.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The guest touched an address outside the memory facade's mapped range.
    #[error("invalid {mode} access of {width}-bit value at {addr:#010x}")]
    InvalidMemoryAccess { mode: AccessMode, width: u8, addr: u32 },

    /// An m68k exception was taken that the guest did not install a handler
    /// for, or the CPU reached an otherwise undecodable state.
    #[error("invalid CPU state at {pc:#010x}: {reason}")]
    InvalidCpuState { pc: u32, reason: String },

    /// A nested [`run()`](crate::machine::Machine::run) terminated with an
    /// error; wraps the inner error so the host call stack that triggered the
    /// nested run can unwind cleanly.
    #[error("nested run entered from {pc:#010x} failed")]
    NestedCpuRun {
        pc: u32,
        #[source]
        inner: Box<MachineError>,
    },

    /// A trap handler raised an arbitrary host error while the guest was
    /// paused; captured verbatim rather than interpreted.
    #[error("trap handler raised: {0}")]
    TrapRaised(String),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Overlap(#[from] OverlapError),

    /// `run()` was invoked at `run_max_nesting` depth already.
    #[error("run nesting would exceed the maximum of {max}")]
    NestingOverflow { max: usize },

    /// The trap table has no free id left to hand out.
    #[error("trap table exhausted: all {capacity} slots are in use")]
    TrapExhausted { capacity: usize },

    /// A top-level (depth 0) `run()` was called without an explicit stack
    /// pointer; only nested runs may inherit one from the current A7.
    #[error("top-level run() requires an explicit stack pointer")]
    MissingStack,
}

/// A point-in-time snapshot of the registers, taken for a fault report.
#[derive(Clone, Debug, Default)]
pub struct RegisterDump {
    pub d: [u32; 8],
    pub a: [u32; 7],
    pub usp: u32,
    pub ssp: u32,
    pub sr: u16,
    pub pc: u32,
}

impl fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.d.iter().enumerate() {
            write!(f, "D{i}={d:08x} ")?;
        }
        for (i, a) in self.a.iter().enumerate() {
            write!(f, "A{i}={a:08x} ")?;
        }
        write!(f, "USP={:08x} SSP={:08x} SR={:04x} PC={:08x}", self.usp, self.ssp, self.sr, self.pc)
    }
}

/// An enriched, renderable view of a [`MachineError`].
#[derive(Debug)]
pub struct FaultReport {
    pub error: MachineError,
    pub pc: u32,
    pub nesting: usize,
    pub label: Option<String>,
    /// The opcode word at `pc`, if it could be read; a best-effort stand-in
    /// for full disassembly.
    pub opcode: Option<u16>,
    pub registers: RegisterDump,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[nesting {}] {} at pc={:#010x}", self.nesting, self.error, self.pc)?;
        if let Some(label) = &self.label {
            write!(f, " (inside label '{label}')")?;
        }
        if let Some(opcode) = self.opcode {
            write!(f, " opcode=DC.W ${opcode:04x}")?;
        }
        write!(f, "\n  {}", self.registers)
    }
}

/// Builds [`FaultReport`]s from raw [`MachineError`]s and ambient run state.
#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorReporter;

impl ErrorReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn report(
        &self,
        error: MachineError,
        pc: u32,
        nesting: usize,
        label: Option<&Label>,
        opcode: Option<u16>,
        registers: RegisterDump,
    ) -> FaultReport {
        let report = FaultReport {
            error,
            pc,
            nesting,
            label: label.map(|l| l.name.clone()),
            opcode,
            registers,
        };
        match &report.error {
            MachineError::InvalidMemoryAccess { .. } | MachineError::InvalidCpuState { .. } => {
                log::warn!(target: "machine::run", "{report}");
            }
            _ => log::error!(target: "machine::run", "{report}"),
        }
        report
    }
}
