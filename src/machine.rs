// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Machine`], the Run Engine that composes the CPU interpreter with guest
//! memory, labels, traps and the allocator into the single entry point of
//! this crate.
//!
//! The `m68000` crate has no notion of "run until this particular return
//! address" or "intercept this reserved opcode before it becomes a real
//! exception" — those are this module's job. It drives
//! [`M68000::interpreter_exception`] directly, one opcode at a time, rather
//! than the crate's own `interpreter`/`cycle` convenience loops, precisely so
//! it can inspect the returned vector before deciding whether to hand it to
//! the CPU's own exception machinery or treat it as a trap dispatch.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use m68000::cpu_details::Mc68000;
use m68000::exception::{Exception, Vector};
use m68000::{CpuDetails, M68000, MemoryAccess};

use crate::alloc::{AllocError, Allocator, Field, StructHandle};
use crate::error::{AccessMode, ErrorReporter, MachineError, RegisterDump};
use crate::label::{Label, LabelRegistry, NotFoundError};
use crate::memory::MemoryImage;
use crate::run::{RegisterId, RunState};
use crate::trap::{self, TrapHandler, TrapId, TrapTable};

/// Start of usable RAM for application code and data.
pub const RAM_BEGIN: u32 = 0x800;
/// Base of the per-nesting-level RESET trampoline table.
pub const RUN_RESET_ADDR: u32 = 0x400;
/// Maximum simultaneous `run()` nesting; one trampoline slot per level.
pub const RUN_MAX_NESTING: usize = 16;
/// Landing pad for every exception vector: a single RESET opcode.
pub const RESET_EXVEC_ADDR: u32 = RUN_RESET_ADDR + 2 * RUN_MAX_NESTING as u32;
/// TRAP opcode encoding the engine's own shutdown trap.
pub const SHUTDOWN_TRAP_ADDR: u32 = RESET_EXVEC_ADDR + 2;

const RESET_OPCODE: u16 = 0x4E70;
const EXCEPTION_VECTOR_COUNT: u32 = 254;
const DEFAULT_CYCLES_PER_RUN: usize = 1000;

fn d_index(reg: RegisterId) -> Option<usize> {
    use RegisterId::*;
    Some(match reg {
        D0 => 0, D1 => 1, D2 => 2, D3 => 3, D4 => 4, D5 => 5, D6 => 6, D7 => 7,
        _ => return None,
    })
}

fn a_index(reg: RegisterId) -> Option<usize> {
    use RegisterId::*;
    Some(match reg {
        A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5, A6 => 6,
        _ => return None,
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "trap handler panicked with a non-string payload".to_string()
    }
}

/// Drives a `CPU: CpuDetails` m68k interpreter over labeled guest RAM,
/// dispatching traps and supporting nested guest runs.
///
/// See the crate root for the overall architecture.
pub struct Machine<CPU: CpuDetails + Clone> {
    cpu: M68000<CPU>,
    memory: MemoryImage,
    labels: LabelRegistry,
    traps: TrapTable<CPU>,
    allocator: Allocator,
    reporter: ErrorReporter,
    run_stack: Vec<RunState>,
    mem0: u32,
    mem4: u32,
    cycles_per_run: usize,
    raise_on_main_run: bool,
    shutdown_hook: Rc<RefCell<Option<Box<dyn FnMut(&mut Machine<CPU>)>>>>,
    shutdown_trap_id: TrapId,
    /// Vector most recently handed to [`M68000::exception`], so that when the
    /// resulting RESET fires at `reset_exvec_addr` the engine can report
    /// which exception it was without reverse-engineering the guest's own
    /// exception stack frame, whose format varies with `CpuDetails::STACK_FORMAT`.
    pending_exception_vector: Option<u8>,
    instr_hook: Option<Box<dyn FnMut(&M68000<CPU>)>>,
}

/// Construction-time settings for a [`Machine`] (the CPU type itself is fixed
/// by the `CPU: CpuDetails` type parameter rather than a runtime field).
#[derive(Clone, Copy, Debug)]
pub struct MachineConfig {
    pub ram_kib: u32,
    /// Seed the zero-page diagnostic label and accept labels added later.
    pub use_labels: bool,
    /// Whether a depth-0 `run()` that ends in error returns `Err` (`true`) or
    /// an `Ok(RunState)` with `error` set (`false`).
    pub raise_on_main_run: bool,
}

impl MachineConfig {
    pub fn new(ram_kib: u32) -> Self {
        Self { ram_kib, use_labels: true, raise_on_main_run: true }
    }

    pub fn use_labels(mut self, use_labels: bool) -> Self {
        self.use_labels = use_labels;
        self
    }

    pub fn raise_on_main_run(mut self, raise_on_main_run: bool) -> Self {
        self.raise_on_main_run = raise_on_main_run;
        self
    }
}

impl<CPU: CpuDetails + Clone> Machine<CPU> {
    /// Constructs a machine per `config`, installs the shutdown trap, and
    /// writes the fixed memory layout (see [`init_fixed_layout`]).
    pub fn new(config: MachineConfig) -> Self {
        let MachineConfig { ram_kib, use_labels, raise_on_main_run } = config;
        let ram_total = ram_kib * 1024;
        assert!(ram_total > SHUTDOWN_TRAP_ADDR + 2, "ram_kib must be large enough for the fixed memory layout");

        let mut memory = MemoryImage::new(ram_total);
        init_fixed_layout(&mut memory);

        let mut labels = LabelRegistry::new();
        if use_labels {
            labels.add(Label::new("zero_page", 0, RAM_BEGIN)).expect("zero_page never overlaps on a fresh registry");
        }

        let mut traps = TrapTable::new(trap::MAX_TRAPS);
        let shutdown_hook: Rc<RefCell<Option<Box<dyn FnMut(&mut Machine<CPU>)>>>> = Rc::new(RefCell::new(None));
        let hook_for_trap = shutdown_hook.clone();
        let shutdown_handler: TrapHandler<CPU> = Rc::new(RefCell::new(move |machine: &mut Machine<CPU>, _pc: u32| {
            let mut hook = hook_for_trap.borrow_mut();
            if let Some(f) = hook.as_mut() {
                f(machine);
            }
        }));
        let shutdown_trap_id = traps
            .setup(shutdown_handler, true)
            .expect("a fresh trap table always has room for the shutdown trap");
        memory
            .w16(SHUTDOWN_TRAP_ADDR, trap::opcode_of_trap_id(shutdown_trap_id))
            .expect("shutdown trap slot is inside the fixed layout");

        let allocator = Allocator::new(RAM_BEGIN, ram_total);

        log::info!(target: "machine::run", "machine constructed: {ram_kib} KiB RAM, shutdown trap id {shutdown_trap_id}");

        Self {
            cpu: M68000::new_no_reset(),
            memory,
            labels,
            traps,
            allocator,
            reporter: ErrorReporter::new(),
            run_stack: Vec::new(),
            mem0: 0,
            mem4: 0,
            cycles_per_run: DEFAULT_CYCLES_PER_RUN,
            raise_on_main_run,
            shutdown_hook,
            shutdown_trap_id,
            pending_exception_vector: None,
            instr_hook: None,
        }
    }

    /// Releases the shutdown trap slot. The `Machine` itself tears down
    /// normally on drop; this only undoes the one piece of state installed
    /// outside of `Drop`'s reach (the host-visible trap id).
    pub fn cleanup(&mut self) {
        if self.traps.free(self.shutdown_trap_id).is_ok() {
            log::debug!(target: "machine::run", "cleanup: released shutdown trap {}", self.shutdown_trap_id);
        }
    }

    /// Sets the words restored to zero-page[0,4] after every reset pulse.
    pub fn set_zero_mem(&mut self, mem0: u32, mem4: u32) {
        self.mem0 = mem0;
        self.mem4 = mem4;
    }

    /// Sets the default instruction slice size used when `run()` is not
    /// given an explicit `cycles_per_run`.
    pub fn set_cycles_per_run(&mut self, n: usize) {
        self.cycles_per_run = n.max(1);
    }

    /// Installs the hook invoked once, via the shutdown trap, when the
    /// top-level run is about to terminate normally.
    pub fn set_shutdown_hook(&mut self, f: impl FnMut(&mut Machine<CPU>) + 'static) {
        *self.shutdown_hook.borrow_mut() = Some(Box::new(f));
    }

    /// Installs a per-instruction host callback, run after every executed
    /// opcode (including ones that immediately fault or trap).
    pub fn set_instr_hook(&mut self, f: impl FnMut(&M68000<CPU>) + 'static) {
        self.instr_hook = Some(Box::new(f));
    }

    /// Current run nesting depth (0 when no `run()` is active).
    pub fn get_run_nesting(&self) -> usize {
        self.run_stack.len()
    }

    // -- Memory pass-throughs -------------------------------------------

    pub fn r8(&mut self, addr: u32) -> Result<u8, MachineError> {
        self.memory.r8(addr)
    }
    pub fn r16(&mut self, addr: u32) -> Result<u16, MachineError> {
        self.memory.r16(addr)
    }
    pub fn r32(&mut self, addr: u32) -> Result<u32, MachineError> {
        self.memory.r32(addr)
    }
    pub fn w8(&mut self, addr: u32, value: u8) -> Result<(), MachineError> {
        self.memory.w8(addr, value)
    }
    pub fn w16(&mut self, addr: u32, value: u16) -> Result<(), MachineError> {
        self.memory.w16(addr, value)
    }
    pub fn w32(&mut self, addr: u32, value: u32) -> Result<(), MachineError> {
        self.memory.w32(addr, value)
    }
    pub fn r_cstr(&mut self, addr: u32) -> Result<Vec<u8>, MachineError> {
        self.memory.r_cstr(addr)
    }
    pub fn w_cstr(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MachineError> {
        self.memory.w_cstr(addr, bytes)
    }
    pub fn r_bstr(&mut self, addr: u32) -> Result<Vec<u8>, MachineError> {
        self.memory.r_bstr(addr)
    }
    pub fn w_bstr(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MachineError> {
        self.memory.w_bstr(addr, bytes)
    }
    pub fn reserve_special_range(&mut self, size: u32) -> u32 {
        self.memory.reserve_special_range(size)
    }

    // -- Label pass-throughs ---------------------------------------------

    pub fn add_label(&mut self, label: Label) -> Result<(), crate::label::OverlapError> {
        self.labels.add(label)
    }
    pub fn remove_label(&mut self, addr: u32) -> Result<Label, NotFoundError> {
        self.labels.remove(addr)
    }
    pub fn find_label(&self, addr: u32) -> Option<&Label> {
        self.labels.find(addr)
    }

    // -- Allocator pass-throughs ------------------------------------------

    pub fn alloc_memory(&mut self, label_name: impl Into<String>, size: u32) -> Result<u32, AllocError> {
        self.allocator.alloc_memory(&mut self.labels, label_name, size)
    }
    pub fn alloc_struct(&mut self, label_name: impl Into<String>, layout: &[Field]) -> Result<StructHandle, AllocError> {
        self.allocator.alloc_struct(&mut self.labels, label_name, layout)
    }
    pub fn alloc_cstr(&mut self, label_name: impl Into<String>, bytes: &[u8]) -> Result<u32, AllocError> {
        self.allocator.alloc_cstr(&mut self.labels, &mut self.memory, label_name, bytes)
    }
    pub fn alloc_bstr(&mut self, label_name: impl Into<String>, bytes: &[u8]) -> Result<u32, AllocError> {
        self.allocator.alloc_bstr(&mut self.labels, &mut self.memory, label_name, bytes)
    }
    pub fn free_alloc(&mut self, addr: u32) -> Result<(), NotFoundError> {
        self.allocator.free(&mut self.labels, addr)
    }
    pub fn allocator_is_pristine(&self) -> bool {
        self.allocator.is_pristine()
    }

    // -- Trap pass-throughs ------------------------------------------------

    /// Installs a trap handler, returning its id. `auto_rts` performs the
    /// pop-and-jump an `RTS` would have performed once the handler returns.
    pub fn setup_trap(
        &mut self,
        auto_rts: bool,
        handler: impl FnMut(&mut Machine<CPU>, u32) + 'static,
    ) -> Result<TrapId, MachineError> {
        self.traps
            .setup(Rc::new(RefCell::new(handler)), auto_rts)
            .map_err(|e| MachineError::TrapExhausted { capacity: e.capacity as usize })
    }

    pub fn free_trap(&mut self, id: TrapId) -> Result<(), trap::TrapNotInstalled> {
        self.traps.free(id)
    }

    /// Encodes `id` as a trap opcode ready to write into guest code.
    pub fn trap_opcode(&self, id: TrapId) -> u16 {
        trap::opcode_of_trap_id(id)
    }

    // -- Register access ---------------------------------------------------

    fn read_reg(&self, reg: RegisterId) -> u32 {
        use RegisterId::*;
        if let Some(i) = d_index(reg) {
            return self.cpu.regs.d[i].0;
        }
        if let Some(i) = a_index(reg) {
            return self.cpu.regs.a[i].0;
        }
        match reg {
            Sp => self.cpu.regs.a(7),
            Usp => self.cpu.regs.usp.0,
            Ssp => self.cpu.regs.ssp.0,
            Sr => self.cpu.regs.sr.into(),
            Pc => self.cpu.regs.pc.0,
            _ => unreachable!("all RegisterId variants are covered above"),
        }
    }

    fn write_reg(&mut self, reg: RegisterId, value: u32) {
        use RegisterId::*;
        if let Some(i) = d_index(reg) {
            self.cpu.regs.d[i].0 = value;
            return;
        }
        if let Some(i) = a_index(reg) {
            self.cpu.regs.a[i].0 = value;
            return;
        }
        match reg {
            Sp => *self.cpu.regs.a_mut(7) = std::num::Wrapping(value),
            Usp => self.cpu.regs.usp.0 = value,
            Ssp => self.cpu.regs.ssp.0 = value,
            Sr => self.cpu.regs.sr = (value as u16).into(),
            Pc => self.cpu.regs.pc.0 = value,
            _ => unreachable!("all RegisterId variants are covered above"),
        }
    }

    fn register_dump(&self) -> RegisterDump {
        RegisterDump {
            d: self.cpu.regs.d.map(|w| w.0),
            a: self.cpu.regs.a.map(|w| w.0),
            usp: self.cpu.regs.usp.0,
            ssp: self.cpu.regs.ssp.0,
            sr: self.cpu.regs.sr.into(),
            pc: self.cpu.regs.pc.0,
        }
    }

    // -- The Run Engine ------------------------------------------------------

    /// Executes guest code starting at `pc`, returning only once the run
    /// terminates (normal return, fault, or `max_cycles` exhausted).
    ///
    /// `max_cycles = 0` means no cap; `cycles_per_run = None` uses the
    /// engine-wide default set by [`Machine::set_cycles_per_run`].
    pub fn run(
        &mut self,
        pc: u32,
        sp: Option<u32>,
        set_regs: &[(RegisterId, u32)],
        get_regs: &[RegisterId],
        max_cycles: u64,
        cycles_per_run: Option<usize>,
        name: Option<&str>,
    ) -> Result<RunState, MachineError> {
        let depth = self.run_stack.len();
        if depth >= RUN_MAX_NESTING {
            return Err(MachineError::NestingOverflow { max: RUN_MAX_NESTING });
        }
        let ret_addr = RUN_RESET_ADDR + 2 * depth as u32;
        let name = name.unwrap_or("run").to_string();

        log::info!(target: "machine::run", "run#{depth} '{name}': begin pc={pc:#010x}");

        let saved_context = (depth > 0).then(|| self.cpu.clone());

        let base_sp = match sp {
            Some(s) => s,
            None if depth > 0 => self.cpu.regs.a(7).wrapping_sub(4),
            None => return Err(MachineError::MissingStack),
        };

        let mut cursor = base_sp;
        self.memory.w32(cursor, ret_addr)?;
        if depth == 0 && self.shutdown_hook.borrow().is_some() {
            cursor = cursor.wrapping_sub(4);
            self.memory.w32(cursor, SHUTDOWN_TRAP_ADDR)?;
        }
        let entry_sp = cursor;

        self.pulse_reset(entry_sp, pc);

        self.run_stack.push(RunState::new(name, pc, entry_sp, ret_addr));

        for &(reg, value) in set_regs {
            self.write_reg(reg, value);
        }

        let slice = cycles_per_run.unwrap_or(self.cycles_per_run).max(1);
        loop {
            if self.run_stack.last().unwrap().done {
                break;
            }
            let cycles = self.step_slice(slice);
            let run_state = self.run_stack.last_mut().unwrap();
            run_state.add_cycles(cycles);
            if max_cycles != 0 && run_state.cycles >= max_cycles {
                break;
            }
        }

        for &reg in get_regs {
            let value = self.read_reg(reg);
            self.run_stack.last_mut().unwrap().regs_out.get_or_insert_with(Default::default).insert(reg, value);
        }

        if let Some(ctx) = saved_context {
            self.cpu = ctx;
        }

        let mut run_state = self.run_stack.pop().unwrap();

        log::info!(
            target: "machine::run",
            "run#{depth}: end cycles={} done={} error={}",
            run_state.cycles,
            run_state.done,
            run_state.error.is_some()
        );

        if run_state.error.is_some() && (depth > 0 || self.raise_on_main_run) {
            let inner = run_state.error.take().unwrap();
            return Err(MachineError::NestedCpuRun { pc: self.cpu.regs.pc.0, inner: Box::new(inner) });
        }

        Ok(run_state)
    }

    /// Forces PC/A7 via the only supported mechanism on this CPU core: write
    /// the target values to zero-page, pulse a CPU reset so it loads them
    /// into SSP/PC, then restore zero-page to `(mem0, mem4)`. `SR.S` is set
    /// by the reset itself, so `regs.a(7)` routes through `ssp` for the
    /// remainder of the run.
    fn pulse_reset(&mut self, sp: u32, pc: u32) {
        self.memory.w32(0, sp).expect("zero page is always inside RAM");
        self.memory.w32(4, pc).expect("zero page is always inside RAM");

        self.cpu.regs.ssp.0 = sp;
        self.cpu.regs.pc.0 = pc;
        self.cpu.regs.sr.t = false;
        self.cpu.regs.sr.s = true;
        self.cpu.regs.sr.interrupt_mask = 7;
        self.cpu.stop = false;

        self.memory.w32(0, self.mem0).expect("zero page is always inside RAM");
        self.memory.w32(4, self.mem4).expect("zero page is always inside RAM");
    }

    /// Drives the interpreter for up to `cycles`, handling traps, faults and
    /// the reset-opcode termination paths along the way. Returns as soon as
    /// the slice budget is met or the current run becomes `done`.
    fn step_slice(&mut self, cycles: usize) -> usize {
        let mut total = 0usize;
        while total < cycles {
            if self.cpu.stop {
                break;
            }

            let (used, vector) = self.cpu.interpreter_exception(&mut self.memory);
            total += used;

            if let Some(hook) = &mut self.instr_hook {
                hook(&self.cpu);
            }

            if let Some((mode, width, addr)) = self.memory.take_invalid_access() {
                self.fault_invalid_memory(mode, width, addr);
                break;
            }

            if self.memory.take_reset_signal() {
                self.handle_reset_opcode();
                break;
            }

            if let Some(v) = vector {
                if v == Vector::IllegalInstruction as u8 {
                    if let Some(trap_id) = self.trap_id_at_current_pc() {
                        self.dispatch_trap(trap_id);
                        if self.run_stack.last().unwrap().done {
                            break;
                        }
                        continue;
                    }
                }
                self.pending_exception_vector = Some(v);
                self.cpu.exception(Exception::from(v));
            }
        }
        total
    }

    /// If the opcode that produced `IllegalInstruction` is one of ours (in
    /// `0xA000..=0xAFFF`), returns its trap id.
    fn trap_id_at_current_pc(&mut self) -> Option<TrapId> {
        let opcode_addr = self.cpu.regs.pc.0.wrapping_sub(2);
        let opcode = self.memory.r16(opcode_addr).ok()?;
        trap::trap_id_of_opcode(opcode)
    }

    fn dispatch_trap(&mut self, id: TrapId) {
        let entry = match self.traps.get(id) {
            Some(entry) => entry,
            None => {
                // Reserved opcode, but nothing installed at this id: a genuine
                // illegal instruction from the guest's point of view.
                self.pending_exception_vector = Some(Vector::IllegalInstruction as u8);
                self.cpu.exception(Exception::from(Vector::IllegalInstruction));
                return;
            }
        };

        let trap_pc = self.cpu.regs.pc.0.wrapping_sub(2);
        log::trace!(target: "machine::trap", "dispatching trap {id} at {trap_pc:#010x}");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut guard = entry.handler.borrow_mut();
            (&mut *guard)(&mut *self, trap_pc);
        }));

        match result {
            Ok(()) => {
                if entry.auto_rts {
                    self.trap_auto_rts();
                }
            }
            Err(payload) => {
                let message = panic_message(payload);
                log::error!(target: "machine::trap", "trap {id} handler raised: {message}");
                let run_state = self.run_stack.last_mut().unwrap();
                run_state.error.get_or_insert(MachineError::TrapRaised(message));
                run_state.done = true;
            }
        }
    }

    /// Pops a return address off `A7` and jumps to it, mimicking the `RTS`
    /// that would have followed the `JSR` the trap stands in for.
    fn trap_auto_rts(&mut self) {
        let sp = self.cpu.regs.a(7);
        match self.memory.r32(sp) {
            Ok(ret) => {
                self.cpu.regs.pc.0 = ret;
                *self.cpu.regs.a_mut(7) += std::num::Wrapping(4u32);
            }
            Err(err) => {
                let run_state = self.run_stack.last_mut().unwrap();
                run_state.error.get_or_insert(err);
                run_state.done = true;
            }
        }
    }

    fn fault_invalid_memory(&mut self, mode: AccessMode, width: u8, addr: u32) {
        if self.run_stack.last().unwrap().error.is_some() {
            return; // first-fault wins
        }
        self.fail_current_run(MachineError::InvalidMemoryAccess { mode, width, addr });
    }

    fn handle_reset_opcode(&mut self) {
        let reset_pc = self.cpu.regs.pc.0.wrapping_sub(2);
        let ret_addr = self.run_stack.last().unwrap().ret_addr;

        if reset_pc == ret_addr {
            self.run_stack.last_mut().unwrap().done = true;
            log::debug!(target: "machine::run", "normal termination at {reset_pc:#010x}");
            return;
        }

        if self.run_stack.last().unwrap().error.is_some() {
            return; // first-fault wins
        }

        let error = if reset_pc == RESET_EXVEC_ADDR {
            let vector = self.pending_exception_vector.take().unwrap_or(0);
            MachineError::InvalidCpuState { pc: reset_pc, reason: format!("m68k Exception #{vector}") }
        } else {
            MachineError::InvalidCpuState { pc: reset_pc, reason: "Unexpected RESET opcode".to_string() }
        };
        self.fail_current_run(error);
    }

    fn fail_current_run(&mut self, error: MachineError) {
        let pc = match &error {
            MachineError::InvalidCpuState { pc, .. } => *pc,
            _ => self.cpu.regs.pc.0,
        };
        let lookup_addr = match &error {
            MachineError::InvalidMemoryAccess { addr, .. } => *addr,
            _ => pc,
        };

        let opcode = self.memory.r16(pc).ok();
        let _ = self.memory.take_invalid_access(); // discard any fault from the best-effort opcode read above
        let registers = self.register_dump();
        let label = self.labels.find(lookup_addr).cloned();
        let depth = self.run_stack.len().saturating_sub(1);

        let report = self.reporter.report(error, pc, depth, label.as_ref(), opcode, registers);

        let run_state = self.run_stack.last_mut().unwrap();
        run_state.error = Some(report.error);
        run_state.done = true;
    }
}

impl Machine<Mc68000> {
    /// Convenience constructor for the plain MC68000 CPU details.
    pub fn new_mc68000(config: MachineConfig) -> Self {
        Self::new(config)
    }
}

/// Writes the fixed low-memory layout: the exception vector table
/// (everything funnels into `reset_exvec_addr`), the
/// per-nesting-level RESET trampolines, and the `reset_exvec_addr` RESET
/// opcode itself. The shutdown trap opcode is written separately once its id
/// is known.
fn init_fixed_layout(memory: &mut MemoryImage) {
    let mut addr = 8u32;
    for _ in 0..EXCEPTION_VECTOR_COUNT {
        memory.w32(addr, RESET_EXVEC_ADDR).expect("vector table is inside the fixed layout");
        addr += 4;
    }
    debug_assert_eq!(addr, RUN_RESET_ADDR);

    let mut addr = RUN_RESET_ADDR;
    for _ in 0..RUN_MAX_NESTING {
        memory.w16(addr, RESET_OPCODE).expect("trampoline table is inside the fixed layout");
        addr += 2;
    }
    debug_assert_eq!(addr, RESET_EXVEC_ADDR);

    memory.w16(RESET_EXVEC_ADDR, RESET_OPCODE).expect("reset_exvec_addr is inside the fixed layout");
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTS: u16 = 0x4E75;

    fn write_program(machine: &mut Machine<Mc68000>, addr: u32, words: &[u16]) {
        let mut a = addr;
        for &w in words {
            machine.w16(a, w).unwrap();
            a += 2;
        }
    }

    #[test]
    fn fixed_layout_constants_match_spec_addresses() {
        assert_eq!(RUN_RESET_ADDR, 0x400);
        assert_eq!(RESET_EXVEC_ADDR, 0x420);
        assert_eq!(SHUTDOWN_TRAP_ADDR, 0x422);
        assert_eq!(RAM_BEGIN, 0x800);
    }

    #[test]
    fn simple_return_completes_normally() {
        let mut m = Machine::new_mc68000(MachineConfig::new(256).raise_on_main_run(false));
        write_program(&mut m, 0x0800, &[RTS]);

        let state = m.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap();

        assert!(state.done);
        assert!(state.error.is_none());
        assert!(state.cycles > 0);
        assert_eq!(m.r32(0).unwrap(), 0);
        assert_eq!(m.r32(4).unwrap(), 0);
    }

    #[test]
    fn invalid_memory_access_is_reported() {
        let mut m = Machine::new_mc68000(MachineConfig::new(256).raise_on_main_run(false));
        // MOVE.L ($00FFFFFF).L, D0 ; RTS
        write_program(&mut m, 0x0800, &[0x2039, 0x00FF, 0xFFFF]);
        m.w16(0x0806, RTS).unwrap();

        let state = m.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap();

        assert!(state.done);
        match state.error {
            Some(MachineError::InvalidMemoryAccess { mode: AccessMode::Read, width: 32, addr: 0x00FF_FFFF }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unhandled_trap_instruction_reports_exception_number() {
        let mut m = Machine::new_mc68000(MachineConfig::new(256).raise_on_main_run(false));
        // TRAP #3, vector 35 (32 + 3).
        write_program(&mut m, 0x0800, &[0x4E43]);

        let state = m.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap();

        assert!(state.done);
        match state.error {
            Some(MachineError::InvalidCpuState { reason, .. }) => assert_eq!(reason, "m68k Exception #35"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cycle_cap_returns_without_error_or_completion() {
        let mut m = Machine::new_mc68000(MachineConfig::new(256).raise_on_main_run(false));
        // BRA.S $0800 (branch to self): displacement = 0x0800 - 0x0802 = -2.
        write_program(&mut m, 0x0800, &[0x60FE]);

        let state = m.run(0x0800, Some(0x1000), &[], &[], 5000, Some(1000), None).unwrap();

        assert!(!state.done);
        assert!(state.error.is_none());
        assert!(state.cycles >= 5000);
    }

    #[test]
    fn trap_dispatch_with_auto_rts_resumes_caller() {
        let mut m = Machine::new_mc68000(MachineConfig::new(256).raise_on_main_run(false));
        let id = m
            .setup_trap(true, |machine, _pc| {
                machine.w32(0x0900, 0x1234_5678).unwrap();
            })
            .unwrap();
        let op = m.trap_opcode(id);
        // Trap opcode at 0x0800, standing in for a JSR target; there is no
        // RTS here because auto_rts performs the pop-and-jump itself,
        // landing straight on the depth-0 RESET trampoline `run()` pushed.
        write_program(&mut m, 0x0800, &[op]);

        let state = m.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap();

        assert!(state.done);
        assert!(state.error.is_none());
        assert_eq!(m.r32(0x0900).unwrap(), 0x1234_5678);
    }

    #[test]
    fn nested_run_reaches_expected_depth_and_restores_outer_stack() {
        let mut m = Machine::new_mc68000(MachineConfig::new(256).raise_on_main_run(false));
        write_program(&mut m, 0x0810, &[RTS]); // inner program

        let id = m
            .setup_trap(false, |machine: &mut Machine<Mc68000>, _pc| {
                let outer_sp = machine.read_reg_for_test(RegisterId::Sp);
                machine.run(0x0810, Some(outer_sp - 0x100), &[], &[], 0, None, Some("inner")).unwrap();
            })
            .unwrap();
        let op = m.trap_opcode(id);
        write_program(&mut m, 0x0800, &[op, RTS]); // trap then RTS

        let outer_sp = 0x2000u32;
        let state = m.run(0x0800, Some(outer_sp), &[], &[], 0, None, Some("outer")).unwrap();

        assert!(state.done);
        assert!(state.error.is_none());
        // An explicit sp names the address ret_addr is written to directly
        // (no further decrement), so the run's own entry A7 is outer_sp
        // itself. The nested run's CPU context is snapshotted and restored
        // around it, so it never touches the outer frame; the guest's own
        // RTS at 0x0802 then pops exactly the one ret_addr this run pushed,
        // leaving A7 one slot above where it entered.
        assert_eq!(m.read_reg_for_test(RegisterId::Sp), outer_sp + 4);
    }

    #[test]
    fn nested_run_with_omitted_sp_inherits_outer_a7_minus_4() {
        let mut m = Machine::new_mc68000(MachineConfig::new(256).raise_on_main_run(false));
        write_program(&mut m, 0x0810, &[RTS]); // inner program

        let id = m
            .setup_trap(true, |machine: &mut Machine<Mc68000>, _pc| {
                let outer_sp = machine.read_reg_for_test(RegisterId::Sp);
                machine.run(0x0810, None, &[], &[], 0, None, Some("inner")).unwrap();
                // sp omitted at depth > 0 inherits the current A7 minus 4;
                // ret_addr for the inner run must have landed there.
                assert_eq!(machine.r32(outer_sp - 4).unwrap(), RUN_RESET_ADDR + 2);
            })
            .unwrap();
        let op = m.trap_opcode(id);
        write_program(&mut m, 0x0800, &[op]); // auto_rts resumes after the trap

        let state = m.run(0x0800, Some(0x1000), &[], &[], 0, None, Some("outer")).unwrap();

        assert!(state.done);
        assert!(state.error.is_none());
    }

    #[test]
    fn nesting_overflow_is_reported() {
        let mut m = Machine::new_mc68000(MachineConfig::new(64).raise_on_main_run(false));
        for depth in 0..RUN_MAX_NESTING {
            m.run_stack.push(RunState::new(format!("d{depth}"), 0, 0, 0));
        }
        let err = m.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap_err();
        assert!(matches!(err, MachineError::NestingOverflow { max } if max == RUN_MAX_NESTING));
    }

    #[test]
    fn missing_stack_on_top_level_run_is_rejected() {
        let mut m = Machine::new_mc68000(MachineConfig::new(64).raise_on_main_run(false));
        write_program(&mut m, 0x0800, &[RTS]);
        let err = m.run(0x0800, None, &[], &[], 0, None, None).unwrap_err();
        assert!(matches!(err, MachineError::MissingStack));
    }

    impl Machine<Mc68000> {
        fn read_reg_for_test(&self, reg: RegisterId) -> u32 {
            self.read_reg(reg)
        }
    }
}
