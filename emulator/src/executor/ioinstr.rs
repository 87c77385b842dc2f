//! IN/OUT: immediate and DX-indirect port forms, routed through the I/O bus.

use crate::cpu::flags::Width;
use crate::cpu::registers::Reg32;
use crate::cpu::Cpu;
use crate::decoder::PortSrc;
use crate::error::Result;
use crate::io::IoBus;

fn resolve_port(cpu: &Cpu, port: PortSrc) -> u16 {
    match port {
        PortSrc::Imm(p) => p as u16,
        PortSrc::Dx => cpu.regs.get16(Reg32::Edx),
    }
}

pub fn input(cpu: &mut Cpu, io: &mut IoBus, port: PortSrc, width: Width) -> Result<()> {
    let port = resolve_port(cpu, port);
    match width {
        Width::Byte => {
            let value = io.read(port);
            cpu.regs.set8_low(Reg32::Eax, value);
        }
        Width::Word => {
            let lo = io.read(port) as u16;
            let hi = io.read(port.wrapping_add(1)) as u16;
            cpu.regs.set16(Reg32::Eax, lo | (hi << 8));
        }
        Width::Dword => {
            let mut value = 0u32;
            for i in 0..4 {
                value |= (io.read(port.wrapping_add(i)) as u32) << (i * 8);
            }
            cpu.set_reg32(Reg32::Eax, value);
        }
    }
    Ok(())
}

pub fn output(cpu: &mut Cpu, io: &mut IoBus, port: PortSrc, width: Width) -> Result<()> {
    let port = resolve_port(cpu, port);
    match width {
        Width::Byte => io.write(port, cpu.regs.get8_low(Reg32::Eax)),
        Width::Word => {
            let value = cpu.regs.get16(Reg32::Eax);
            io.write(port, value as u8);
            io.write(port.wrapping_add(1), (value >> 8) as u8);
        }
        Width::Dword => {
            let value = cpu.get_reg32(Reg32::Eax);
            for i in 0..4 {
                io.write(port.wrapping_add(i), (value >> (i * 8)) as u8);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_via_dx_reaches_a_registered_device() {
        use crate::io::uart::{Uart16550, COM1_BASE};
        let mut cpu = Cpu::new();
        let mut io = IoBus::new();
        io.register(Box::new(Uart16550::new(COM1_BASE)));
        cpu.regs.set16(Reg32::Edx, COM1_BASE);
        cpu.regs.set8_low(Reg32::Eax, b'Z');
        output(&mut cpu, &mut io, PortSrc::Dx, Width::Byte).unwrap();
    }

    #[test]
    fn in_from_unmapped_port_reads_0xff_into_al() {
        let mut cpu = Cpu::new();
        let mut io = IoBus::new();
        input(&mut cpu, &mut io, PortSrc::Imm(0x99), Width::Byte).unwrap();
        assert_eq!(cpu.regs.get8_low(Reg32::Eax), 0xFF);
    }
}
