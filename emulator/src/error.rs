//! Error kinds surfaced by the emulator core.
//!
//! Every `step` returns either success or a single `EmuError`. Errors are
//! never swallowed inside the executor: an `OutOfBounds` hit during operand
//! fetch propagates to the caller verbatim.

use thiserror::Error;

/// Crate-local `Result` alias, mirroring the plain `enum` + `Result<T>`
/// pattern used throughout the hypervisor subsystem this crate is grounded
/// on.
pub type Result<T> = std::result::Result<T, EmuError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmuError {
    #[error("out of bounds access at {address:#x} (width {width}, memory size {size:#x})")]
    OutOfBounds { address: u64, width: u8, size: u64 },

    #[error("undefined opcode {opcode:#04x} at {address:#x}")]
    UndefinedOpcode { opcode: u8, address: u64 },

    #[error("instruction fetch underflow at {address:#x} (needed {needed} bytes)")]
    DecodeUnderflow { address: u64, needed: u8 },

    #[error("privileged instruction {mnemonic} executed outside ring 0")]
    PrivilegedInstruction { mnemonic: &'static str },

    #[error("segment fault: {reason}")]
    SegmentFault { reason: &'static str },

    #[error("divide by zero")]
    DivideByZero,

    #[error("invalid kernel image: {reason}")]
    InvalidKernel { reason: &'static str },

    #[error("invalid boot sector (boot_flag mismatch)")]
    InvalidBootSector,

    #[error("invalid boot header ({reason})")]
    InvalidBootHeader { reason: &'static str },

    #[error("unsupported boot protocol version {version:#06x}")]
    UnsupportedBootProtocol { version: u16 },

    #[error("device error on port {port:#06x}: {reason}")]
    DeviceError { port: u16, reason: &'static str },
}
