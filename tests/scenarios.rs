//! End-to-end coverage of the Run Engine's host-facing contract, exercised
//! through the public API only (no access to `Machine`'s private fields, as
//! opposed to the colocated unit tests in `src/machine.rs`).

use machine_core::error::{AccessMode, MachineError};
use machine_core::machine::{Machine, MachineConfig};

const RTS: u16 = 0x4E75;

fn write_program(machine: &mut Machine<m68000::cpu_details::Mc68000>, addr: u32, words: &[u16]) {
    let mut a = addr;
    for &w in words {
        machine.w16(a, w).unwrap();
        a += 2;
    }
}

fn config(ram_kib: u32) -> MachineConfig {
    MachineConfig::new(ram_kib).raise_on_main_run(false)
}

#[test]
fn simple_return() {
    let mut m = Machine::new_mc68000(config(256));
    write_program(&mut m, 0x0800, &[RTS]);

    let state = m.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap();

    assert!(state.done);
    assert!(state.error.is_none());
    assert!(state.cycles > 0);
    assert_eq!(m.r32(0).unwrap(), 0);
    assert_eq!(m.r32(4).unwrap(), 0);
}

#[test]
fn nested_run_via_trap() {
    let mut m = Machine::new_mc68000(config(256));
    write_program(&mut m, 0x0810, &[RTS]);

    let id = m
        .setup_trap(false, |machine, _pc| {
            assert_eq!(machine.get_run_nesting(), 1);
            machine.run(0x0810, Some(0x2000 - 0x100), &[], &[], 0, None, Some("inner")).unwrap();
            assert_eq!(machine.get_run_nesting(), 1);
        })
        .unwrap();
    let op = m.trap_opcode(id);
    write_program(&mut m, 0x0800, &[op, RTS]);

    let state = m.run(0x0800, Some(0x2000), &[], &[], 0, None, Some("outer")).unwrap();

    assert!(state.done);
    assert!(state.error.is_none());
}

#[test]
fn invalid_memory_access() {
    let mut m = Machine::new_mc68000(config(256));
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
fn unhandled_m68k_exception() {
    let mut m = Machine::new_mc68000(config(256));
    write_program(&mut m, 0x0800, &[0x4E43]); // TRAP #3, vector 35

    let state = m.run(0x0800, Some(0x1000), &[], &[], 0, None, None).unwrap();

    assert!(state.done);
    match state.error {
        Some(MachineError::InvalidCpuState { reason, .. }) => assert_eq!(reason, "m68k Exception #35"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn cycle_cap() {
    let mut m = Machine::new_mc68000(config(256));
    write_program(&mut m, 0x0800, &[0x60FE]); // BRA.S $0800

    let state = m.run(0x0800, Some(0x1000), &[], &[], 5000, Some(1000), None).unwrap();

    assert!(!state.done);
    assert!(state.error.is_none());
    assert!(state.cycles >= 5000);
}

#[test]
fn allocator_round_trip() {
    let mut m = Machine::new_mc68000(config(256));

    let a = m.alloc_memory("x", 128).unwrap();
    let b = m.alloc_memory("y", 64).unwrap();
    assert_ne!(a, b);

    m.free_alloc(b).unwrap();
    m.free_alloc(a).unwrap();

    assert!(m.allocator_is_pristine());
    assert!(m.find_label(a).is_none());
    assert!(m.find_label(b).is_none());
}
