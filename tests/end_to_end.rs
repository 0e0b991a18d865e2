//! Whole-toolchain scenarios: assemble source with the library, execute it,
//! and observe registers, memory and UART output.

use std::path::Path;

use mote::demos::SourceLoader;
use mote::mem::{CaptureUart, Memory};
use mote::{Assembler, Cpu};

/// Assemble `src`, load at address 0 and run from `pc` until halt.
fn run_at(src: &str, pc: u16) -> (Cpu, Memory, CaptureUart) {
    let image = Assembler::new(src).assemble().unwrap();
    let uart = CaptureUart::new();
    let mut mem = Memory::with_uart(Box::new(uart.clone()));
    mem.load_image(&image, 0x0000);
    let mut cpu = Cpu::new();
    cpu.set_pc(pc);
    cpu.run(&mut mem).unwrap();
    (cpu, mem, uart)
}

fn demo(path: &str) -> String {
    SourceLoader::new().read(Path::new(path)).unwrap()
}

#[test]
fn hello_world_prints_exactly_fourteen_bytes() {
    let (cpu, _, uart) = run_at(&demo("demos/hello.asm"), 0x0000);
    assert!(cpu.halted());
    assert_eq!(uart.bytes(), b"Hello, World!\n");
}

#[test]
fn fibonacci_fills_buffer() {
    let (cpu, mem, _) = run_at(&demo("demos/fib.asm"), 0x0100);
    assert!(cpu.halted());
    // buf sits right after the code, at 0x0122
    let expected: [u16; 10] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];
    for (i, &want) in expected.iter().enumerate() {
        assert_eq!(mem.read16(0x0122 + 2 * i as u16), want, "word {i}");
    }
}

#[test]
fn short_form_load_store() {
    let src = "ldi r0, 0x1234\nldi r1, 0x2000\nst r0, [r1+0]\nld r2, [r1+0]\nhalt";
    let (cpu, mem, _) = run_at(src, 0x0000);
    assert_eq!(mem.read16(0x2000), 0x1234);
    assert_eq!(cpu.reg(2), 0x1234);
}

#[test]
fn branch_on_zero() {
    let src = "ldi r0, 1\ncmpi r0, 1\njz eq\nhalt\neq: ldi r0, 0\nhalt";
    let (cpu, _, _) = run_at(src, 0x0000);
    assert_eq!(cpu.reg(0), 0);
}

#[test]
fn call_and_return() {
    let src = "call f\nhalt\nf: ldi r0, 7\nret";
    let (cpu, _, _) = run_at(src, 0x0000);
    assert_eq!(cpu.reg(0), 7);
    assert_eq!(cpu.reg(7), Cpu::STACK_INIT);
    // RET landed on the HALT directly after the 4-byte CALL
    assert_eq!(cpu.pc(), 0x0006);
}

#[test]
fn undefined_label_fails_without_binary() {
    let err = Assembler::new("jmp nowhere").assemble().unwrap_err();
    assert!(format!("{err}").contains("nowhere"));
}

#[test]
fn timer_demo_fires_and_acknowledges() {
    let (cpu, mem, uart) = run_at(&demo("demos/timer.asm"), 0x0000);
    assert!(cpu.halted());
    assert_eq!(uart.bytes(), b"T\n");
    assert!(!mem.irq_pending());
}
