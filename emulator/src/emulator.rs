//! The top-level `Emulator`: wires `Memory`, the `IoBus` and the `Cpu`
//! together and exposes `step`/`run`/`reset`/`load_binary`/`load_kernel`.
//!
//! Follows the two-phase allocate-then-initialize split `gdt::init`/
//! `ChainedPics::initialize` use elsewhere in this style of codebase:
//! `Emulator::new` allocates Memory and wires the I/O bus once, `reset`
//! re-establishes architectural state without reallocating anything.

use crate::boot::DirectBoot;
use crate::cpu::flags::EFlags;
use crate::cpu::registers::Reg32;
use crate::cpu::segments::{Segment, SegmentId};
use crate::cpu::sysregs::Mode;
use crate::cpu::Cpu;
use crate::decoder::decode;
use crate::error::Result;
use crate::executor;
use crate::io::keyboard::Ps2Keyboard;
use crate::io::uart::{Uart16550, COM1_BASE};
use crate::io::IoBus;
use crate::memory::{Memory, DEFAULT_MEMORY_SIZE};

/// Construction-time options: a plain struct with a `Default` impl
/// supplying documented defaults, the same shape as `LinuxGuestConfig`.
#[derive(Clone, Debug)]
pub struct Config {
    pub memory_size: usize,
    pub enable_uart: bool,
    pub uart_base: u16,
    pub enable_keyboard: bool,
    pub debug_mode: bool,
    pub dump_on_error: bool,
    pub initial_cs: u16,
    pub initial_ip: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            memory_size: DEFAULT_MEMORY_SIZE,
            enable_uart: true,
            uart_base: COM1_BASE,
            enable_keyboard: false,
            debug_mode: false,
            dump_on_error: false,
            initial_cs: 0,
            initial_ip: 0,
        }
    }
}

/// Read-only snapshot of CPU state, returned by value so a debugger or
/// other embedder cannot mutate emulator internals by holding onto it.
#[derive(Clone, Debug)]
pub struct CpuState {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: EFlags,
    pub segs: SegmentSnapshot,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub gdtr: crate::cpu::sysregs::TablePtr,
    pub idtr: crate::cpu::sysregs::TablePtr,
    pub halted: bool,
    pub mode: Mode,
}

#[derive(Clone, Debug)]
pub struct SegmentSnapshot {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
}

impl std::fmt::Display for CpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "EAX={:08x} EBX={:08x} ECX={:08x} EDX={:08x}",
            self.eax, self.ebx, self.ecx, self.edx
        )?;
        writeln!(
            f,
            "ESI={:08x} EDI={:08x} EBP={:08x} ESP={:08x}",
            self.esi, self.edi, self.ebp, self.esp
        )?;
        writeln!(f, "EIP={:08x} EFLAGS={:?}", self.eip, self.eflags)?;
        writeln!(
            f,
            "CS={:#06x} DS={:#06x} SS={:#06x} mode={:?} halted={}",
            self.segs.cs.selector, self.segs.ds.selector, self.segs.ss.selector, self.mode, self.halted
        )
    }
}

/// Why a bounded `run_cycles` loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Halted,
    BudgetExhausted,
}

pub struct Emulator {
    cpu: Cpu,
    memory: Memory,
    io: IoBus,
    config: Config,
}

impl Emulator {
    pub fn new(config: Config) -> Self {
        let mut io = IoBus::new();
        if config.enable_uart {
            io.register(Box::new(Uart16550::new(config.uart_base)));
        }
        if config.enable_keyboard {
            io.register_keyboard(Box::new(Ps2Keyboard::new()));
        }
        let mut emulator = Emulator {
            cpu: Cpu::new(),
            memory: Memory::new(config.memory_size),
            io,
            config,
        };
        emulator.reset();
        emulator
    }

    /// Re-establish CPU and device state without reallocating memory.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.cpu
            .segs
            .load_real_mode(SegmentId::Cs, self.config.initial_cs);
        self.cpu.regs.eip = self.config.initial_ip;
        self.io.reset();
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    /// Borrow the CPU mutably and memory immutably at the same time (disjoint fields).
    pub fn cpu_mut_and_memory(&mut self) -> (&mut Cpu, &Memory) {
        (&mut self.cpu, &self.memory)
    }

    pub fn io_mut(&mut self) -> &mut IoBus {
        &mut self.io
    }

    /// Execute exactly one instruction. A no-op while halted.
    pub fn step(&mut self) -> Result<()> {
        if self.cpu.halted {
            return Ok(());
        }
        let result = self.step_inner();
        if result.is_err() && self.config.dump_on_error {
            log::error!("fault during step:\n{}", self.get_cpu_state());
        }
        result
    }

    fn step_inner(&mut self) -> Result<()> {
        let addr = self.cpu.cs_eip_linear();
        let fetch_len = 16.min(self.memory.size().saturating_sub(addr as usize));
        let bytes = self.memory.read_bytes(addr, fetch_len)?.to_vec();
        let (instr, len) = decode(
            &bytes,
            addr,
            &self.cpu.regs,
            self.cpu.mode() == Mode::Protected,
        )?;
        log::trace!("{:#010x}: {:?} ({} bytes)", addr, instr, len);
        executor::execute(&mut self.cpu, &mut self.memory, &mut self.io, &instr, len)?;
        self.cpu.tsc = self.cpu.tsc.wrapping_add(1);
        Ok(())
    }

    /// Run until halted or a step returns an error.
    pub fn run(&mut self) -> Result<()> {
        while !self.cpu.halted {
            self.step()?;
        }
        Ok(())
    }

    /// Run up to `max` instructions; returns how many actually ran and why
    /// the loop stopped.
    pub fn run_cycles(&mut self, max: u64) -> Result<(u64, StopReason)> {
        let mut executed = 0;
        while executed < max {
            if self.cpu.halted {
                return Ok((executed, StopReason::Halted));
            }
            self.step()?;
            executed += 1;
        }
        if self.cpu.halted {
            Ok((executed, StopReason::Halted))
        } else {
            Ok((executed, StopReason::BudgetExhausted))
        }
    }

    /// Copy `bytes` into memory at `addr` and point CS:EIP at it.
    pub fn load_binary(&mut self, bytes: &[u8], addr: u32) -> Result<()> {
        self.memory.write_bytes(addr, bytes)?;
        self.cpu.regs.eip = addr;
        Ok(())
    }

    /// Parse and install a Linux bzImage kernel, transferring control to
    /// its protected- or real-mode entry point.
    pub fn load_kernel(&mut self, kernel: &[u8], cmdline: &str, initrd: Option<&[u8]>) -> Result<()> {
        let boot = DirectBoot::new(kernel, cmdline, initrd)?;
        boot.load(self)
    }

    pub fn get_cpu_state(&self) -> CpuState {
        CpuState {
            eax: self.cpu.regs.get32(Reg32::Eax),
            ebx: self.cpu.regs.get32(Reg32::Ebx),
            ecx: self.cpu.regs.get32(Reg32::Ecx),
            edx: self.cpu.regs.get32(Reg32::Edx),
            esi: self.cpu.regs.get32(Reg32::Esi),
            edi: self.cpu.regs.get32(Reg32::Edi),
            ebp: self.cpu.regs.get32(Reg32::Ebp),
            esp: self.cpu.regs.get32(Reg32::Esp),
            eip: self.cpu.regs.eip,
            eflags: self.cpu.flags,
            segs: SegmentSnapshot {
                cs: self.cpu.segs.cs,
                ds: self.cpu.segs.ds,
                es: self.cpu.segs.es,
                fs: self.cpu.segs.fs,
                gs: self.cpu.segs.gs,
                ss: self.cpu.segs.ss,
            },
            cr0: self.cpu.sys.cr0,
            cr2: self.cpu.sys.cr2,
            cr3: self.cpu.sys.cr3,
            cr4: self.cpu.sys.cr4,
            gdtr: self.cpu.sys.gdtr,
            idtr: self.cpu.sys.idtr,
            halted: self.cpu.halted,
            mode: self.cpu.mode(),
        }
    }

    /// Drain bytes the guest has written to the UART, if one is enabled.
    pub fn get_uart_output(&mut self) -> Vec<u8> {
        match self.find_uart_mut() {
            Some(uart) => uart.get_output_buffer(),
            None => Vec::new(),
        }
    }

    /// Queue bytes for the guest to read back from the UART, if enabled.
    pub fn send_uart_input(&mut self, bytes: &[u8]) {
        if let Some(uart) = self.find_uart_mut() {
            uart.send_input(bytes);
        }
    }

    fn find_uart_mut(&mut self) -> Option<&mut Uart16550> {
        self.io.find_device_mut::<Uart16550>(self.config.uart_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::segments::{DescriptorCache, ALL_SEGMENTS};
    use crate::cpu::sysregs::CR0_PE;

    /// Flat 32-bit protected mode, every segment based at 0 with a 4 GiB
    /// limit, for tests that exercise the instruction set itself rather
    /// than real-mode boot semantics.
    fn enter_flat_protected_mode(emu: &mut Emulator) {
        let flat = DescriptorCache {
            base: 0,
            limit: 0xFFFF_FFFF,
            granularity_4k: true,
            dpl: 0,
            present: true,
            executable: false,
            readable_writable: true,
        };
        let cpu = emu.cpu_mut();
        cpu.sys.cr0 |= CR0_PE;
        for id in ALL_SEGMENTS {
            cpu.segs.get_mut(id).cache = flat;
        }
    }

    #[test]
    fn real_mode_uart_hello() {
        let mut emu = Emulator::new(Config::default());
        // MOV AX,0x3F8; MOV DX,AX; MOV AL,'A'; OUT DX,AL; HLT
        let program = [0xB8, 0xF8, 0x03, 0x89, 0xC2, 0xB0, 0x41, 0xEE, 0xF4];
        emu.load_binary(&program, 0).unwrap();
        emu.run().unwrap();
        assert_eq!(emu.get_uart_output(), b"A");
        assert!(emu.get_cpu_state().halted);
    }

    #[test]
    fn rep_movsb_string_copy() {
        let mut emu = Emulator::new(Config::default());
        emu.memory_mut().write_bytes(0x1000, b"SYS").unwrap();
        emu.cpu_mut().set_reg32(Reg32::Esi, 0x1000);
        emu.cpu_mut().set_reg32(Reg32::Edi, 0x2000);
        emu.cpu_mut().set_reg32(Reg32::Ecx, 3);
        // REP MOVSB; HLT
        let program = [0xF3, 0xA4, 0xF4];
        emu.load_binary(&program, 0).unwrap();
        emu.run().unwrap();
        assert_eq!(emu.memory().read_bytes(0x2000, 3).unwrap(), b"SYS");
    }

    #[test]
    fn arithmetic_flags_after_inc_overflow() {
        let mut emu = Emulator::new(Config::default());
        enter_flat_protected_mode(&mut emu);
        // MOV EAX,0xFFFFFFFF; INC EAX; HLT
        let program = [0xB8, 0xFF, 0xFF, 0xFF, 0xFF, 0x40, 0xF4];
        emu.load_binary(&program, 0).unwrap();
        emu.run().unwrap();
        let state = emu.get_cpu_state();
        assert_eq!(state.eax, 0);
        assert!(state.eflags.test(EFlags::ZF));
    }

    #[test]
    fn stack_discipline_push_pop() {
        let mut emu = Emulator::new(Config::default());
        enter_flat_protected_mode(&mut emu);
        // MOV EAX,0x44332211; PUSH EAX; POP EBX; HLT
        let program = [0xB8, 0x11, 0x22, 0x33, 0x44, 0x50, 0x5B, 0xF4];
        emu.load_binary(&program, 0).unwrap();
        emu.cpu_mut().set_reg32(Reg32::Esp, 0x2000);
        emu.run().unwrap();
        let state = emu.get_cpu_state();
        assert_eq!(state.ebx, 0x4433_2211);
        assert_eq!(state.esp, 0x2000);
    }

    #[test]
    fn enable_keyboard_registers_the_ps2_slot() {
        let mut disabled = Emulator::new(Config::default());
        assert_eq!(disabled.io_mut().read(crate::io::keyboard::KEYBOARD_STATUS_PORT), 0xFF);

        let mut enabled = Emulator::new(Config { enable_keyboard: true, ..Config::default() });
        assert_eq!(enabled.io_mut().read(crate::io::keyboard::KEYBOARD_STATUS_PORT), 0);
    }

    #[test]
    fn run_cycles_reports_budget_exhaustion() {
        let mut emu = Emulator::new(Config::default());
        let program = [0x90, 0x90, 0x90, 0x90]; // NOP x4, no HLT
        emu.load_binary(&program, 0).unwrap();
        let (executed, reason) = emu.run_cycles(2).unwrap();
        assert_eq!(executed, 2);
        assert_eq!(reason, StopReason::BudgetExhausted);
    }
}
