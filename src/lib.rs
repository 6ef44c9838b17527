// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution core for an AmigaOS binary emulator.
//!
//! This crate drives a Motorola 68000 CPU interpreter ([`m68000`]) over a flat,
//! labeled guest RAM image, installs traps that hand control back to host code
//! while the guest is paused, and supports nested guest runs: a trap handler
//! may call [`Machine::run`](machine::Machine::run) again before returning to
//! the outer run.
//!
//! # Layout
//!
//! - [`label`] — named, non-overlapping address ranges used for diagnostics.
//! - [`memory`] — the [`m68000::MemoryAccess`] implementation over guest RAM.
//! - [`trap`] — the reserved-opcode trap table and its dispatch.
//! - [`alloc`] — a coalescing allocator serving host-initiated guest structures.
//! - [`run`] — [`RunState`](run::RunState) and the nested-run bookkeeping.
//! - [`error`] — the error taxonomy and the fault reporter.
//! - [`machine`] — [`Machine`](machine::Machine), composing all of the above.
//!
//! # Basic usage
//!
//! ```no_run
//! use machine_core::machine::{Machine, MachineConfig};
//!
//! let mut machine = Machine::new_mc68000(MachineConfig::new(256));
//! let run_state = machine.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap();
//! assert!(run_state.done);
//! ```

pub mod alloc;
pub mod error;
pub mod label;
pub mod machine;
pub mod memory;
pub mod run;
pub mod trap;

pub use error::MachineError;
pub use machine::{Machine, MachineConfig};
