// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trap installation and the reserved trap opcode encoding.
//!
//! The `m68000` crate has no raw "unimplemented opcode calls a host function"
//! hook independent of its exception system. The
//! engine instead reserves the unimplemented-instruction space
//! `0xA000..=0xAFFF`, which the crate decodes as `Isa::Unknown` and raises as
//! `Vector::IllegalInstruction`. Because the Run Engine drives exception
//! injection itself, it intercepts that vector before it reaches the guest,
//! and this module's [`trap_id_of_opcode`] tells it whether the faulting
//! opcode is one of ours.
//!
//! Dispatch itself — invoking the handler and performing the auto-`RTS` — is
//! implemented on [`Machine`](crate::machine::Machine) rather than here,
//! since it needs simultaneous access to the CPU, memory and this table; see
//! `machine.rs`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use m68000::CpuDetails;
use thiserror::Error;

use crate::machine::Machine;

/// Base of the reserved trap opcode range.
pub const TRAP_OPCODE_BASE: u16 = 0xA000;
/// Mask isolating the 12-bit trap id packed into the low bits of the opcode.
pub const TRAP_ID_MASK: u16 = 0x0FFF;
/// Number of ids the opcode encoding can address (`2^12`).
pub const MAX_TRAPS: u16 = TRAP_ID_MASK + 1;

/// The trap id the handler runs under, so it can free itself.
pub type TrapId = u16;

/// A host callback reachable from the guest via the reserved trap opcode.
///
/// Runs on the host call stack while the CPU is paused; it may read and
/// mutate guest memory and registers, and may call
/// [`Machine::run`](crate::machine::Machine::run) recursively.
pub type TrapHandler<CPU> = Rc<RefCell<dyn FnMut(&mut Machine<CPU>, u32)>>;

/// Returns the opcode's trap id if it falls in the reserved range, `None`
/// otherwise (a genuine illegal instruction).
pub fn trap_id_of_opcode(opcode: u16) -> Option<TrapId> {
    if opcode & !TRAP_ID_MASK == TRAP_OPCODE_BASE {
        Some(opcode & TRAP_ID_MASK)
    } else {
        None
    }
}

/// Encodes `id` as a trap opcode suitable for writing into guest memory.
pub fn opcode_of_trap_id(id: TrapId) -> u16 {
    TRAP_OPCODE_BASE | (id & TRAP_ID_MASK)
}

#[derive(Clone)]
pub(crate) struct TrapEntry<CPU: CpuDetails> {
    pub handler: TrapHandler<CPU>,
    pub auto_rts: bool,
}

/// No free trap id remains among the table's capacity.
#[derive(Debug, Error)]
#[error("trap table exhausted: all {capacity} slots are in use")]
pub struct TrapExhausted {
    pub capacity: u16,
}

/// No handler is installed at the requested trap id.
#[derive(Debug, Error)]
#[error("no trap installed at id {0}")]
pub struct TrapNotInstalled(pub TrapId);

/// Dense table of installed [`TrapEntry`]s, indexed by id.
pub struct TrapTable<CPU: CpuDetails> {
    slots: Vec<Option<TrapEntry<CPU>>>,
    free_ids: BTreeSet<TrapId>,
    capacity: u16,
}

impl<CPU: CpuDetails> TrapTable<CPU> {
    pub fn new(capacity: u16) -> Self {
        let capacity = capacity.min(MAX_TRAPS);
        Self { slots: Vec::new(), free_ids: (0..capacity).collect(), capacity }
    }

    /// Assigns the lowest free id, installs `handler`, and returns the id.
    pub fn setup(&mut self, handler: TrapHandler<CPU>, auto_rts: bool) -> Result<TrapId, TrapExhausted> {
        let id = *self.free_ids.iter().next().ok_or(TrapExhausted { capacity: self.capacity })?;
        self.free_ids.remove(&id);
        if self.slots.len() <= id as usize {
            self.slots.resize_with(id as usize + 1, || None);
        }
        self.slots[id as usize] = Some(TrapEntry { handler, auto_rts });
        log::debug!(target: "machine::trap", "installed trap {id} (auto_rts={auto_rts})");
        Ok(id)
    }

    /// Releases `id`, making it available for reuse.
    pub fn free(&mut self, id: TrapId) -> Result<(), TrapNotInstalled> {
        match self.slots.get_mut(id as usize).and_then(Option::take) {
            Some(_) => {
                self.free_ids.insert(id);
                log::debug!(target: "machine::trap", "freed trap {id}");
                Ok(())
            }
            None => Err(TrapNotInstalled(id)),
        }
    }

    /// Clones the entry at `id`, if installed. Cheap: only the `Rc` is cloned.
    pub(crate) fn get(&self, id: TrapId) -> Option<TrapEntry<CPU>> {
        self.slots.get(id as usize)?.clone()
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}
