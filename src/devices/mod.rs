//! Interrupt controllers and timers that live next to the vCPUs, plus the
//! 16550 UART.

pub mod atpic;
pub mod atpit;
pub mod hpet;
pub mod ioapic;
pub mod lapic;
pub mod pmtmr;
pub mod rtc;
pub mod uart;

use crate::{error::Result, vm::Vm};

/// What happens to an interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOp {
	Assert,
	Deassert,
	/// Assert immediately followed by deassert.
	Pulse,
}

/// Drives an ISA interrupt line that is wired to both the 8259 pair and the
/// IOAPIC.
pub fn isa_irq(vm: &Vm, atpic_irq: u8, ioapic_irq: Option<u8>, op: IrqOp) -> Result<()> {
	vm.atpic().set_irq(vm, atpic_irq, op)?;
	if let Some(pin) = ioapic_irq {
		vm.ioapic().set_irq(vm, pin, op)?;
	}
	Ok(())
}
