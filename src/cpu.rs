use miette::Result;

use crate::error;
use crate::isa::{self, OPC_SHIFT};
use crate::mem::{Memory, MMIO_BASE};

/// Condition flags. Z and N track the result value; C and V carry the
/// unsigned and signed overflow of the last arithmetic operation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Flags {
    pub z: bool,
    pub n: bool,
    pub c: bool,
    pub v: bool,
}

/// Recorded when execution hits an unassigned encoding.
#[derive(Clone, Copy, Debug)]
struct Fault {
    pc: u16,
    opcode: u8,
}

/// Register file, program counter, flags and halt latch. Memory is borrowed
/// per step so the pair can be torn down independently.
pub struct Cpu {
    /// 8x 16-bit registers, R7 doubles as the stack pointer
    reg: [u16; 8],
    pc: u16,
    flags: Flags,
    halted: bool,
    fault: Option<Fault>,
}

impl Cpu {
    /// Stack pointer reset value.
    pub const STACK_INIT: u16 = 0x7FFC;

    pub fn new() -> Self {
        let mut reg = [0; 8];
        reg[7] = Self::STACK_INIT;
        Cpu {
            reg,
            pc: 0,
            flags: Flags::default(),
            halted: false,
            fault: None,
        }
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u16) {
        self.pc = pc;
    }

    pub fn reg(&self, idx: u16) -> u16 {
        self.reg[(idx & 0x7) as usize]
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    const OP_TABLE: [fn(&mut Cpu, &mut Memory, u16); 32] = [
        Self::nop,    // 0x00
        Self::halt,   // 0x01
        Self::ldi,    // 0x02
        Self::mov,    // 0x03
        Self::add,    // 0x04
        Self::sub,    // 0x05
        Self::and,    // 0x06
        Self::or,     // 0x07
        Self::xor,    // 0x08
        Self::not,    // 0x09
        Self::shl,    // 0x0A
        Self::shr,    // 0x0B
        Self::addi,   // 0x0C
        Self::cmpi,   // 0x0D
        Self::cmp,    // 0x0E
        Self::ld,     // 0x0F
        Self::st,     // 0x10
        Self::ldb,    // 0x11
        Self::stb,    // 0x12
        Self::ldr,    // 0x13
        Self::str,    // 0x14
        Self::jmp,    // 0x15
        Self::jz,     // 0x16
        Self::jnz,    // 0x17
        Self::jc,     // 0x18
        Self::jn,     // 0x19
        Self::call,   // 0x1A
        Self::ret,    // 0x1B
        Self::io_in,  // 0x1C
        Self::io_out, // 0x1D
        Self::bad,    // 0x1E
        Self::bad,    // 0x1F
    ];

    /// Execute a single instruction. Retirement advances the device timer
    /// exactly once; a halted CPU does nothing.
    pub fn step(&mut self, mem: &mut Memory) {
        if self.halted {
            return;
        }
        let insn = self.fetch16(mem);
        let opcode = ((insn >> OPC_SHIFT) & 0x1F) as usize;
        Self::OP_TABLE[opcode](self, mem, insn);
        mem.tick();
    }

    /// Run until the halt latch is set. A fault on an unassigned encoding
    /// surfaces after the halt; memory is left exactly as the last retired
    /// instruction wrote it.
    pub fn run(&mut self, mem: &mut Memory) -> Result<()> {
        while !self.halted {
            self.step(mem);
        }
        match self.fault.take() {
            Some(fault) => Err(error::unknown_opcode(fault.pc, fault.opcode)),
            None => Ok(()),
        }
    }

    fn fetch16(&mut self, mem: &mut Memory) -> u16 {
        let word = mem.read16(self.pc);
        self.pc = self.pc.wrapping_add(2);
        word
    }

    #[inline]
    fn r(&mut self, idx: u16) -> &mut u16 {
        &mut self.reg[(idx & 0x7) as usize]
    }

    fn set_zn(&mut self, res: u16) {
        self.flags.z = res == 0;
        self.flags.n = res & 0x8000 != 0;
    }

    /// Z/N from the value, C and V cleared. Loads and bitwise ops share this.
    fn set_logic_flags(&mut self, res: u16) {
        self.set_zn(res);
        self.flags.c = false;
        self.flags.v = false;
    }

    fn add16(&mut self, a: u16, b: u16) -> u16 {
        let wide = a as u32 + b as u32;
        let res = wide as u16;
        self.flags.c = wide >> 16 & 1 != 0;
        self.flags.v = (!(a ^ b) & (a ^ res)) >> 15 != 0;
        self.set_zn(res);
        res
    }

    /// a + !b + 1; carry means no borrow.
    fn sub16(&mut self, a: u16, b: u16) -> u16 {
        let wide = a as u32 + (!b) as u32 + 1;
        let res = wide as u16;
        self.flags.c = wide >> 16 & 1 != 0;
        self.flags.v = ((a ^ b) & (a ^ res)) >> 15 != 0;
        self.set_zn(res);
        res
    }

    fn push16(&mut self, mem: &mut Memory, val: u16) {
        self.reg[7] = self.reg[7].wrapping_sub(2);
        mem.write16(self.reg[7], val);
    }

    fn pop16(&mut self, mem: &mut Memory) -> u16 {
        let val = mem.read16(self.reg[7]);
        self.reg[7] = self.reg[7].wrapping_add(2);
        val
    }

    fn nop(&mut self, _mem: &mut Memory, _insn: u16) {}

    fn halt(&mut self, _mem: &mut Memory, _insn: u16) {
        self.halted = true;
    }

    fn ldi(&mut self, mem: &mut Memory, insn: u16) {
        let val = self.fetch16(mem);
        *self.r(isa::rd(insn)) = val;
        self.set_logic_flags(val);
    }

    fn mov(&mut self, _mem: &mut Memory, insn: u16) {
        let val = *self.r(isa::rs1(insn));
        *self.r(isa::rd(insn)) = val;
        self.set_logic_flags(val);
    }

    fn add(&mut self, _mem: &mut Memory, insn: u16) {
        let (a, b) = (*self.r(isa::rd(insn)), *self.r(isa::rs1(insn)));
        let res = self.add16(a, b);
        *self.r(isa::rd(insn)) = res;
    }

    fn sub(&mut self, _mem: &mut Memory, insn: u16) {
        let (a, b) = (*self.r(isa::rd(insn)), *self.r(isa::rs1(insn)));
        let res = self.sub16(a, b);
        *self.r(isa::rd(insn)) = res;
    }

    fn and(&mut self, _mem: &mut Memory, insn: u16) {
        let res = *self.r(isa::rd(insn)) & *self.r(isa::rs1(insn));
        *self.r(isa::rd(insn)) = res;
        self.set_logic_flags(res);
    }

    fn or(&mut self, _mem: &mut Memory, insn: u16) {
        let res = *self.r(isa::rd(insn)) | *self.r(isa::rs1(insn));
        *self.r(isa::rd(insn)) = res;
        self.set_logic_flags(res);
    }

    fn xor(&mut self, _mem: &mut Memory, insn: u16) {
        let res = *self.r(isa::rd(insn)) ^ *self.r(isa::rs1(insn));
        *self.r(isa::rd(insn)) = res;
        self.set_logic_flags(res);
    }

    fn not(&mut self, _mem: &mut Memory, insn: u16) {
        let res = !*self.r(isa::rd(insn));
        *self.r(isa::rd(insn)) = res;
        self.set_logic_flags(res);
    }

    fn shl(&mut self, _mem: &mut Memory, insn: u16) {
        let sh = isa::imm3(insn);
        let val = *self.r(isa::rd(insn));
        // C is the last bit shifted out; a zero count shifts nothing out
        self.flags.c = sh != 0 && (val >> (16 - sh)) & 1 != 0;
        let res = val << sh;
        *self.r(isa::rd(insn)) = res;
        self.set_zn(res);
        self.flags.v = false;
    }

    fn shr(&mut self, _mem: &mut Memory, insn: u16) {
        let sh = isa::imm3(insn);
        let val = *self.r(isa::rd(insn));
        self.flags.c = sh != 0 && (val >> (sh - 1)) & 1 != 0;
        let res = val >> sh;
        *self.r(isa::rd(insn)) = res;
        self.set_zn(res);
        self.flags.v = false;
    }

    fn addi(&mut self, _mem: &mut Memory, insn: u16) {
        let a = *self.r(isa::rd(insn));
        let res = self.add16(a, isa::simm8(insn));
        *self.r(isa::rd(insn)) = res;
    }

    fn cmpi(&mut self, _mem: &mut Memory, insn: u16) {
        let a = *self.r(isa::rd(insn));
        self.sub16(a, isa::simm8(insn));
    }

    fn cmp(&mut self, _mem: &mut Memory, insn: u16) {
        let (a, b) = (*self.r(isa::rd(insn)), *self.r(isa::rs1(insn)));
        self.sub16(a, b);
    }

    fn ld(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.fetch16(mem);
        let val = mem.read16(addr);
        *self.r(isa::rd(insn)) = val;
        self.set_logic_flags(val);
    }

    fn st(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.fetch16(mem);
        mem.write16(addr, *self.r(isa::rs1(insn)));
    }

    fn ldb(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.fetch16(mem);
        let val = mem.read8(addr) as u16;
        *self.r(isa::rd(insn)) = val;
        self.set_logic_flags(val);
    }

    fn stb(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.fetch16(mem);
        mem.write8(addr, (*self.r(isa::rs1(insn)) & 0xFF) as u8);
    }

    /// Short-form load, `[rb+imm5]`
    fn ldr(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.r(isa::rs1(insn)).wrapping_add(isa::simm5(insn));
        let val = mem.read16(addr);
        *self.r(isa::rd(insn)) = val;
        self.set_logic_flags(val);
    }

    /// Short-form store; the base register sits in the rd field
    fn str(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.r(isa::rd(insn)).wrapping_add(isa::simm5(insn));
        mem.write16(addr, *self.r(isa::rs1(insn)));
    }

    fn jmp(&mut self, mem: &mut Memory, _insn: u16) {
        let addr = self.fetch16(mem);
        self.pc = addr;
    }

    fn jz(&mut self, mem: &mut Memory, _insn: u16) {
        let addr = self.fetch16(mem);
        if self.flags.z {
            self.pc = addr;
        }
    }

    fn jnz(&mut self, mem: &mut Memory, _insn: u16) {
        let addr = self.fetch16(mem);
        if !self.flags.z {
            self.pc = addr;
        }
    }

    fn jc(&mut self, mem: &mut Memory, _insn: u16) {
        let addr = self.fetch16(mem);
        if self.flags.c {
            self.pc = addr;
        }
    }

    fn jn(&mut self, mem: &mut Memory, _insn: u16) {
        let addr = self.fetch16(mem);
        if self.flags.n {
            self.pc = addr;
        }
    }

    fn call(&mut self, mem: &mut Memory, _insn: u16) {
        let addr = self.fetch16(mem);
        let ret = self.pc;
        self.push16(mem, ret);
        self.pc = addr;
    }

    fn ret(&mut self, mem: &mut Memory, _insn: u16) {
        self.pc = self.pop16(mem);
    }

    /// Device reads are byte-wide and zero-extended; plain memory reads a
    /// full word.
    fn io_in(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.fetch16(mem);
        let val = if addr >= MMIO_BASE {
            mem.read8(addr) as u16
        } else {
            mem.read16(addr)
        };
        *self.r(isa::rd(insn)) = val;
        self.set_logic_flags(val);
    }

    fn io_out(&mut self, mem: &mut Memory, insn: u16) {
        let addr = self.fetch16(mem);
        let val = *self.r(isa::rs1(insn));
        if addr >= MMIO_BASE {
            mem.write8(addr, (val & 0xFF) as u8);
        } else {
            mem.write16(addr, val);
        }
    }

    fn bad(&mut self, _mem: &mut Memory, insn: u16) {
        self.fault = Some(Fault {
            pc: self.pc.wrapping_sub(2),
            opcode: ((insn >> OPC_SHIFT) & 0x1F) as u8,
        });
        self.halted = true;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::isa::{pack, pack_imm8, Opcode};
    use crate::mem::CaptureUart;

    /// Lay the given words out at address 0 and run to completion.
    fn exec(words: &[u16]) -> (Cpu, Memory, CaptureUart) {
        let uart = CaptureUart::new();
        let mut mem = Memory::with_uart(Box::new(uart.clone()));
        for (i, w) in words.iter().enumerate() {
            mem.write16((i * 2) as u16, *w);
        }
        let mut cpu = Cpu::new();
        cpu.run(&mut mem).unwrap();
        (cpu, mem, uart)
    }

    const HALT: u16 = (Opcode::Halt as u16) << OPC_SHIFT;

    #[test]
    fn add_carry_into_zero() {
        let mut cpu = Cpu::new();
        let res = cpu.add16(0xFFFF, 0x0001);
        assert_eq!(res, 0);
        assert_eq!(
            cpu.flags(),
            Flags {
                z: true,
                n: false,
                c: true,
                v: false
            }
        );
    }

    #[test]
    fn sub_signed_overflow() {
        let mut cpu = Cpu::new();
        let res = cpu.sub16(0x8000, 0x0001);
        assert_eq!(res, 0x7FFF);
        assert_eq!(
            cpu.flags(),
            Flags {
                z: false,
                n: false,
                c: true,
                v: true
            }
        );
    }

    #[test]
    fn ldi_clears_carry() {
        // ADD leaves C set, the following LDI must clear it
        let (cpu, _, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0xFFFF,
            pack(Opcode::Ldi, 1, 0, 0),
            0x0001,
            pack(Opcode::Add, 0, 1, 0),
            pack(Opcode::Ldi, 2, 0, 0),
            0x8000,
            HALT,
        ]);
        assert_eq!(cpu.reg(2), 0x8000);
        assert_eq!(
            cpu.flags(),
            Flags {
                z: false,
                n: true,
                c: false,
                v: false
            }
        );
    }

    #[test]
    fn shl_carry_out() {
        let (cpu, _, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0x8001,
            pack(Opcode::Shl, 0, 0, 1),
            HALT,
        ]);
        assert_eq!(cpu.reg(0), 0x0002);
        assert!(cpu.flags().c);
        assert!(!cpu.flags().v);
    }

    #[test]
    fn shl_zero_count_clears_carry() {
        let (cpu, _, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0xFFFF,
            pack(Opcode::Ldi, 1, 0, 0),
            0x0001,
            pack(Opcode::Add, 0, 1, 0),
            pack(Opcode::Shl, 0, 0, 0),
            HALT,
        ]);
        assert!(!cpu.flags().c);
        assert!(cpu.flags().z);
    }

    #[test]
    fn shr_carry_from_low_bit() {
        let (cpu, _, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0x0003,
            pack(Opcode::Shr, 0, 0, 1),
            HALT,
        ]);
        assert_eq!(cpu.reg(0), 0x0001);
        assert!(cpu.flags().c);
    }

    #[test]
    fn addi_negative_immediate() {
        let (cpu, _, _) = exec(&[pack_imm8(Opcode::Addi, 0, (-1i8) as u8), HALT]);
        assert_eq!(cpu.reg(0), 0xFFFF);
        assert!(cpu.flags().n);
        assert!(!cpu.flags().c);
    }

    #[test]
    fn cmpi_equal_sets_zero_and_carry() {
        let (cpu, _, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0x0005,
            pack_imm8(Opcode::Cmpi, 0, 5),
            HALT,
        ]);
        // register untouched, Z set, no borrow
        assert_eq!(cpu.reg(0), 5);
        assert!(cpu.flags().z);
        assert!(cpu.flags().c);
    }

    #[test]
    fn short_store_and_load() {
        let (cpu, mem, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0x1234,
            pack(Opcode::Ldi, 1, 0, 0),
            0x2000,
            pack(Opcode::StOffs, 1, 0, 0),
            pack(Opcode::LdOffs, 2, 1, 0),
            HALT,
        ]);
        assert_eq!(mem.read16(0x2000), 0x1234);
        assert_eq!(cpu.reg(2), 0x1234);
    }

    #[test]
    fn short_load_negative_displacement() {
        let (cpu, _, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0xBEEF,
            pack(Opcode::St, 0, 0, 0),
            0x2000,
            pack(Opcode::Ldi, 1, 0, 0),
            0x2002,
            pack(Opcode::LdOffs, 2, 1, (-2i16 as u16) & 0x1F),
            HALT,
        ]);
        assert_eq!(cpu.reg(2), 0xBEEF);
    }

    #[test]
    fn absolute_store_uses_rs1_field() {
        let (_, mem, _) = exec(&[
            pack(Opcode::Ldi, 3, 0, 0),
            0xABCD,
            pack(Opcode::St, 0, 3, 0),
            0x3000,
            HALT,
        ]);
        assert_eq!(mem.read16(0x3000), 0xABCD);
    }

    #[test]
    fn byte_store_truncates() {
        let (cpu, mem, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0x1234,
            pack(Opcode::Stb, 0, 0, 0),
            0x3000,
            pack(Opcode::Ldb, 1, 0, 0),
            0x3000,
            HALT,
        ]);
        assert_eq!(mem.read8(0x3000), 0x34);
        assert_eq!(mem.read8(0x3001), 0);
        assert_eq!(cpu.reg(1), 0x34);
    }

    #[test]
    fn call_and_ret_restore_stack() {
        // 0x0000 CALL 0x0006; 0x0004 HALT; 0x0006 LDI r0,7; 0x000A RET
        let (cpu, _, _) = exec(&[
            pack(Opcode::Call, 0, 0, 0),
            0x0006,
            HALT,
            pack(Opcode::Ldi, 0, 0, 0),
            0x0007,
            pack(Opcode::Ret, 0, 0, 0),
        ]);
        assert_eq!(cpu.reg(0), 7);
        assert_eq!(cpu.reg(7), Cpu::STACK_INIT);
        // HALT at 0x0004 retired last
        assert_eq!(cpu.pc(), 0x0006);
    }

    #[test]
    fn conditional_jumps() {
        let (cpu, _, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0x0001,
            pack_imm8(Opcode::Cmpi, 0, 1),
            pack(Opcode::Jz, 0, 0, 0),
            0x000C,
            HALT,
            pack(Opcode::Ldi, 0, 0, 0), // 0x000C
            0x0000,
            HALT,
        ]);
        assert_eq!(cpu.reg(0), 0);
    }

    #[test]
    fn uart_bytes_in_execution_order() {
        let (_, _, uart) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            b'h' as u16,
            pack(Opcode::Out, 0, 0, 0),
            0xFF00,
            pack(Opcode::Ldi, 0, 0, 0),
            b'i' as u16,
            pack(Opcode::Out, 0, 0, 0),
            0xFF00,
            HALT,
        ]);
        assert_eq!(uart.bytes(), b"hi");
    }

    #[test]
    fn io_against_plain_memory_is_word_wide() {
        let (cpu, mem, _) = exec(&[
            pack(Opcode::Ldi, 0, 0, 0),
            0x1234,
            pack(Opcode::Out, 0, 0, 0),
            0x4000,
            pack(Opcode::In, 1, 0, 0),
            0x4000,
            HALT,
        ]);
        assert_eq!(mem.read16(0x4000), 0x1234);
        assert_eq!(cpu.reg(1), 0x1234);
    }

    #[test]
    fn io_in_from_uart_is_byte_wide() {
        let (cpu, _, _) = exec(&[pack(Opcode::In, 0, 0, 0), 0xFF01, HALT]);
        assert_eq!(cpu.reg(0), 0x00FF);
    }

    #[test]
    fn timer_counts_retirements() {
        let nop = pack(Opcode::Nop, 0, 0, 0);
        let (_, mem, _) = exec(&[nop, nop, nop, HALT]);
        // three NOPs plus the HALT itself
        assert_eq!(mem.timer(), 4);
    }

    #[test]
    fn pc_wraps_around() {
        let uart = CaptureUart::new();
        let mut mem = Memory::with_uart(Box::new(uart.clone()));
        let mut cpu = Cpu::new();
        cpu.set_pc(0xFFFE);
        // 0xFFFE is device space and fetches as NOP
        cpu.step(&mut mem);
        assert_eq!(cpu.pc(), 0x0000);
    }

    #[test]
    fn unknown_opcode_faults_and_halts() {
        let uart = CaptureUart::new();
        let mut mem = Memory::with_uart(Box::new(uart.clone()));
        mem.write16(0x0000, 0x1E << OPC_SHIFT);
        mem.write16(0x1000, 0xCAFE);
        let mut cpu = Cpu::new();
        let err = cpu.run(&mut mem).unwrap_err();
        assert!(cpu.halted());
        let msg = format!("{err}");
        assert!(msg.contains("0x1E"), "diagnostic was: {msg}");
        assert!(msg.contains("0x0000"), "diagnostic was: {msg}");
        // memory is left untouched past the fault
        assert_eq!(mem.read16(0x1000), 0xCAFE);
    }

    #[test]
    fn halted_cpu_does_not_step() {
        let uart = CaptureUart::new();
        let mut mem = Memory::with_uart(Box::new(uart.clone()));
        mem.write16(0x0000, HALT);
        let mut cpu = Cpu::new();
        cpu.run(&mut mem).unwrap();
        assert_eq!(mem.timer(), 1);
        cpu.step(&mut mem);
        assert_eq!(mem.timer(), 1);
    }
}
