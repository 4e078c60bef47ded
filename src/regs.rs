//! Register transport for the card's host interface.
//!
//! The card exposes five host control-status registers in its first PCI
//! memory region.  Everything the engine does to the hardware goes through
//! [`RegisterIo::read`] and [`RegisterIo::write`]; there is no retrying or
//! validation at this level, so it is safe to call from interrupt context and
//! from deferred task context alike.  Callers sequence register accesses under
//! the device lock (see [`crate::device`]).
//!
//! Implementations:
//!
//! - [`MmioRegisters`] - volatile access to the mapped register window, for
//!   use on real hardware once the PCI layer has mapped BAR 0
//! - test doubles, which simulate the host interface FIFOs

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use bitflags::bitflags;

/// Host interface registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// Host status register (HSTR)
    Status,
    /// Host control register (HCTR)
    Control,
    /// Host command vector register (HCVR)
    Vector,
    /// Host transmit data register (HTXR)
    Transmit,
    /// Host receive data register (HRXS).  Shares its address with
    /// [`Register::Transmit`]; the direction selects the FIFO.
    Receive,
}

impl Register {
    /// Byte offset of the register from the start of the mapped window.
    pub const fn offset(self) -> u32 {
        match self {
            Register::Control => 0x10,
            Register::Status => 0x14,
            Register::Vector => 0x18,
            Register::Transmit | Register::Receive => 0x1C,
        }
    }
}

bitflags! {
    /// HSTR bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostStatus: u32 {
        /// Transmitter ready: the transmit FIFO is empty
        const TRDY = 1 << 0;
        /// Transmit request: the transmit FIFO can take another word
        const HTRQ = 1 << 1;
        /// Receive request: the receive FIFO holds at least one word
        const HRRQ = 1 << 2;
        /// Host flag 3, raised by the card while it is interrupting
        const HF3 = 1 << 3;
        /// Host flag 4, raised by the card in reply to a control HF2
        const HF4 = 1 << 4;
        /// Interrupt line asserted
        const HINT = 1 << 6;
    }
}

bitflags! {
    /// HCTR bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostControl: u32 {
        /// Raised by the host to acknowledge an interrupt in handshake mode
        const HF0 = 1 << 3;
        /// Enables the interrupt handshake protocol (firmware U0105+)
        const HANDSHAKE = 1 << 4;
        /// Host flag 2, used to probe for the handshake
        const HF2 = 1 << 5;
        /// Transmit data conversion (32 -> 24 bit)
        const HTF0 = 1 << 8;
        /// Receive data conversion (24 -> 32 bit)
        const HRF1 = 1 << 11;
    }
}

impl HostControl {
    /// Baseline mode: 32 <-> 24 bit word conversion, no handshake.
    pub const PCI_MODE_BASE: HostControl = HostControl::HTF0.union(HostControl::HRF1);
}

/// HCVR bit set while a vector is pending on the card.
pub const HCVR_HC: u32 = 0x0001;

/// HCVR bit marking a vector non-maskable.  Required for all vectors on
/// firmware before U0105.
pub const HCVR_HNMI: u32 = 0x8000;

/// The card's words are 24 bits wide.
pub const DATA_MASK: u32 = 0x00FF_FFFF;

/// Trait for accessing the host interface registers.
///
/// Implementations must be callable from interrupt context: no blocking, no
/// allocation.  A read of [`Register::Receive`] pops one word from the
/// receive FIFO; a write of [`Register::Transmit`] pushes one word into the
/// transmit FIFO.
pub trait RegisterIo: Send + Sync {
    /// Atomic read of a register
    fn read(&self, reg: Register) -> u32;

    /// Atomic write of a register
    fn write(&self, reg: Register, value: u32);

    /// Read HSTR as typed flags.  Unknown bits are dropped.
    fn status(&self) -> HostStatus {
        HostStatus::from_bits_truncate(self.read(Register::Status))
    }
}

/// Register I/O implementation using direct access to the mapped window.
pub struct MmioRegisters {
    base: *mut u32,
}

impl MmioRegisters {
    /// Wrap a mapped register window.
    ///
    /// # Safety
    ///
    /// `base` must point at the card's mapped BAR 0 window, stay mapped for
    /// the lifetime of this object, and not be accessed through any other
    /// `MmioRegisters`.
    pub const unsafe fn new(base: *mut u32) -> Self {
        Self { base }
    }

    fn addr(&self, reg: Register) -> *mut u32 {
        // Offsets are word aligned
        unsafe { self.base.add((reg.offset() / 4) as usize) }
    }
}

// The window is only ever touched with single volatile word accesses.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl RegisterIo for MmioRegisters {
    fn read(&self, reg: Register) -> u32 {
        unsafe { core::ptr::read_volatile(self.addr(reg)) }
    }

    fn write(&self, reg: Register, value: u32) {
        unsafe { core::ptr::write_volatile(self.addr(reg), value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmio_offsets_match_window_layout() {
        let mut window = [0u32; 8];
        {
            let regs = unsafe { MmioRegisters::new(window.as_mut_ptr()) };
            regs.write(Register::Control, HostControl::PCI_MODE_BASE.bits());
            regs.write(Register::Vector, 0x8073 | HCVR_HC);
            regs.write(Register::Transmit, 0x11_2233);
            assert_eq!(regs.read(Register::Receive), 0x11_2233);
        }

        assert_eq!(window[4], 0x900);
        assert_eq!(window[6], 0x8073 | HCVR_HC);
        assert_eq!(window[7], 0x11_2233);
    }

    #[test]
    fn status_drops_unknown_bits() {
        let mut window = [0u32; 8];
        window[5] = 0xFFFF_0000 | HostStatus::TRDY.bits() | HostStatus::HRRQ.bits();
        let regs = unsafe { MmioRegisters::new(window.as_mut_ptr()) };
        assert_eq!(regs.status(), HostStatus::TRDY | HostStatus::HRRQ);
    }
}
