//! Legacy INTx routing. Every INTx pin of a slot is wired to one of the
//! IOAPIC pins 16-23 and to one of eight PIRQ lines, which the LPC bridge
//! steers onto an 8259 input.

use std::sync::Mutex;

use super::{FuncState, PCI_SLOTS, PCIM_CMD_INTXDIS, PCIR_INTLINE, PCIR_INTPIN, PciFunction};
use crate::{
	devices::{IrqOp, atpic::NUM_IRQS, isa_irq},
	error::{LockExt, Result, VmmError},
	vm::Vm,
};

pub const NPIRQS: usize = 8;
/// Routing register bit that disconnects a PIRQ line.
pub const PIRQ_DIS: u8 = 0x80;
pub const PIRQ_IRQ: u8 = 0x0f;
/// 8259 inputs a PIRQ line may be steered to: 3-7, 9-12, 14 and 15.
const PERMITTED_IRQS: u16 = 0xdef8;
const IOAPIC_PCI_BASE: u8 = 16;
const IOAPIC_PCI_PINS: u8 = 8;

const fn irq_permitted(irq: u8) -> bool {
	irq < NUM_IRQS && PERMITTED_IRQS & (1 << irq) != 0
}

const fn pirq_valid_irq(reg: u8) -> bool {
	reg & PIRQ_DIS == 0 && irq_permitted(reg & PIRQ_IRQ)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LintrState {
	#[default]
	Idle,
	Asserted,
	/// Asserted by the device but masked by INTxDIS or MSI.
	Pending,
}

/// Per-function INTx state.
#[derive(Debug, Default)]
pub struct Lintr {
	/// INTA# is 1; 0 means the function has no legacy interrupt.
	pub pin: u8,
	pub ioapic_irq: u8,
	pub pirq_pin: u8,
	pub state: LintrState,
}

/// An INTx route reported in the MP table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntxRoute {
	pub slot: u8,
	/// 1 for INTA#.
	pub pin: u8,
	pub ioapic_irq: u8,
	pub pirq_pin: u8,
}

#[derive(Debug, Clone, Copy)]
struct Pirq {
	reg: u8,
	use_count: u32,
	active_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct IntPin {
	count: u32,
	ioapic_irq: u8,
	pirq_pin: u8,
}

/// `None` marks an 8259 input that PCI may not use.
type IrqCounts = [Option<u32>; NUM_IRQS as usize];

#[derive(Debug)]
struct RouterState {
	pirqs: [Pirq; NPIRQS],
	irq_counts: IrqCounts,
	intpins: [[IntPin; 4]; PCI_SLOTS as usize],
	next_ioapic: u8,
}

#[derive(Debug)]
pub struct IrqRouter {
	state: Mutex<RouterState>,
}

impl Default for IrqRouter {
	fn default() -> Self {
		Self::new()
	}
}

impl IrqRouter {
	pub fn new() -> Self {
		let mut irq_counts = [None; NUM_IRQS as usize];
		for (irq, count) in irq_counts.iter_mut().enumerate() {
			if irq_permitted(irq as u8) {
				*count = Some(0);
			}
		}
		Self {
			state: Mutex::new(RouterState {
				pirqs: [Pirq {
					reg: PIRQ_DIS,
					use_count: 0,
					active_count: 0,
				}; NPIRQS],
				irq_counts,
				intpins: [[IntPin::default(); 4]; PCI_SLOTS as usize],
				next_ioapic: 0,
			}),
		}
	}

	/// Keeps PCI off an 8259 input owned by an ISA device.
	pub fn reserve(&self, irq: u8) -> Result<()> {
		let mut st = self.state.locked();
		match st.irq_counts.get_mut(irq as usize) {
			Some(count @ (None | Some(0))) => {
				*count = None;
				Ok(())
			}
			_ => Err(VmmError::InvalidArgument(format!(
				"IRQ {irq} is already routed to PCI"
			))),
		}
	}

	/// The routing register of PIRQ line `pin` (1-based).
	pub fn pirq_read(&self, pin: u8) -> u8 {
		let st = self.state.locked();
		st.pirqs
			.get((pin as usize).wrapping_sub(1))
			.map_or(PIRQ_DIS, |p| p.reg)
	}

	/// Reprograms PIRQ line `pin`, moving an asserted level to the new input.
	pub fn pirq_write(&self, vm: &Vm, pin: u8, val: u8) -> Result<()> {
		let mut st = self.state.locked();
		let Some(pirq) = st.pirqs.get_mut((pin as usize).wrapping_sub(1)) else {
			return Err(VmmError::InvalidArgument(format!("PIRQ pin {pin}")));
		};
		let new = val & (PIRQ_DIS | PIRQ_IRQ);
		if pirq.reg == new {
			return Ok(());
		}
		if pirq.active_count != 0 && pirq_valid_irq(pirq.reg) {
			isa_irq(vm, pirq.reg & PIRQ_IRQ, None, IrqOp::Deassert)?;
		}
		pirq.reg = new;
		if pirq.active_count != 0 && pirq_valid_irq(pirq.reg) {
			isa_irq(vm, pirq.reg & PIRQ_IRQ, None, IrqOp::Assert)?;
		}
		debug!("PIRQ{} -> {new:#x}", (b'A' + pin - 1) as char);
		Ok(())
	}

	pub fn pirq_irq(&self, pin: u8) -> u8 {
		self.pirq_read(pin) & PIRQ_IRQ
	}

	/// Picks the least-used INTx pin of `slot`.
	fn request_pin(&self, slot: u8) -> u8 {
		let mut st = self.state.locked();
		let pins = &mut st.intpins[slot as usize];
		let mut best = 0;
		for pin in 1..4 {
			if pins[pin].count < pins[best].count {
				best = pin;
			}
		}
		pins[best].count += 1;
		best as u8 + 1
	}

	/// Gives INTx `pin` of `slot` an IOAPIC pin and a PIRQ line unless the
	/// slot already routed it.
	fn route(&self, vm: &Vm, slot: u8, pin: u8) -> Result<(u8, u8)> {
		let mut st = self.state.locked();
		let mut intpin = st.intpins[slot as usize][pin as usize - 1];
		if intpin.ioapic_irq == 0 {
			intpin.ioapic_irq = IOAPIC_PCI_BASE + st.next_ioapic % IOAPIC_PCI_PINS;
			st.next_ioapic = st.next_ioapic.wrapping_add(1);
		}
		if intpin.pirq_pin == 0 {
			intpin.pirq_pin = Self::alloc_pirq(vm, &mut st)?;
		}
		st.intpins[slot as usize][pin as usize - 1] = intpin;
		Ok((intpin.ioapic_irq, intpin.pirq_pin))
	}

	fn alloc_pirq(vm: &Vm, st: &mut RouterState) -> Result<u8> {
		let mut best = 0;
		for (i, pirq) in st.pirqs.iter().enumerate().skip(1) {
			if pirq.use_count < st.pirqs[best].use_count {
				best = i;
			}
		}
		st.pirqs[best].use_count += 1;

		if st.pirqs[best].reg == PIRQ_DIS {
			let (irq, count) = st
				.irq_counts
				.iter_mut()
				.enumerate()
				.filter_map(|(irq, count)| count.as_mut().map(|c| (irq as u8, c)))
				.min_by_key(|(_, count)| **count)
				.ok_or(VmmError::Unsupported("PCI INTx without a free 8259 input"))?;
			*count += 1;
			st.pirqs[best].reg = irq;
			vm.atpic().set_irq_trigger(irq, true)?;
		}
		Ok(best as u8 + 1)
	}

	fn assert(&self, vm: &Vm, ioapic_irq: u8, pirq_pin: u8) -> Result<()> {
		let mut st = self.state.locked();
		let pirq = &mut st.pirqs[pirq_pin as usize - 1];
		pirq.active_count += 1;
		if pirq.active_count == 1 && pirq_valid_irq(pirq.reg) {
			return isa_irq(vm, pirq.reg & PIRQ_IRQ, Some(ioapic_irq), IrqOp::Assert);
		}
		drop(st);
		vm.ioapic().set_irq(vm, ioapic_irq, IrqOp::Assert)
	}

	fn deassert(&self, vm: &Vm, ioapic_irq: u8, pirq_pin: u8) -> Result<()> {
		let mut st = self.state.locked();
		let pirq = &mut st.pirqs[pirq_pin as usize - 1];
		pirq.active_count = pirq.active_count.saturating_sub(1);
		if pirq.active_count == 0 && pirq_valid_irq(pirq.reg) {
			return isa_irq(vm, pirq.reg & PIRQ_IRQ, Some(ioapic_irq), IrqOp::Deassert);
		}
		drop(st);
		vm.ioapic().set_irq(vm, ioapic_irq, IrqOp::Deassert)
	}

	pub fn routes(&self) -> Vec<IntxRoute> {
		let st = self.state.locked();
		let mut routes = Vec::new();
		for (slot, pins) in st.intpins.iter().enumerate() {
			for (pin, intpin) in pins.iter().enumerate() {
				if intpin.count > 0 && intpin.ioapic_irq != 0 {
					routes.push(IntxRoute {
						slot: slot as u8,
						pin: pin as u8 + 1,
						ioapic_irq: intpin.ioapic_irq,
						pirq_pin: intpin.pirq_pin,
					});
				}
			}
		}
		routes
	}
}

impl PciFunction {
	/// Gives the function an INTx pin. Routing happens once every slot is
	/// populated.
	pub fn lintr_request(&self, vm: &Vm) {
		let pin = vm.pci().irq().request_pin(self.slot());
		let mut st = self.state();
		st.lintr.pin = pin;
		st.cfg.write(PCIR_INTPIN, 1, pin as u32);
	}

	pub(crate) fn lintr_route(&self, vm: &Vm) -> Result<()> {
		let pin = self.state().lintr.pin;
		if pin == 0 {
			return Ok(());
		}
		let (ioapic_irq, pirq_pin) = vm.pci().irq().route(vm, self.slot(), pin)?;
		let line = vm.pci().irq().pirq_irq(pirq_pin);
		let mut st = self.state();
		st.lintr.ioapic_irq = ioapic_irq;
		st.lintr.pirq_pin = pirq_pin;
		st.cfg.write(PCIR_INTLINE, 1, line as u32);
		debug!(
			"{}: INT{} -> IOAPIC pin {ioapic_irq}, PIRQ{}",
			self.name(),
			(b'A' + pin - 1) as char,
			(b'A' + pirq_pin - 1) as char
		);
		Ok(())
	}

	fn lintr_permitted(st: &FuncState) -> bool {
		!(st.msi.enabled || st.msix.enabled || st.cfg.header.command & PCIM_CMD_INTXDIS != 0)
	}

	pub fn lintr_assert(&self, vm: &Vm) -> Result<()> {
		let mut st = self.state();
		if st.lintr.pin == 0 || st.lintr.pirq_pin == 0 {
			return Err(VmmError::InvalidArgument(format!(
				"{} has no routed INTx pin",
				self.name()
			)));
		}
		if st.lintr.state == LintrState::Idle {
			if Self::lintr_permitted(&st) {
				st.lintr.state = LintrState::Asserted;
				vm.pci()
					.irq()
					.assert(vm, st.lintr.ioapic_irq, st.lintr.pirq_pin)?;
			} else {
				st.lintr.state = LintrState::Pending;
			}
		}
		Ok(())
	}

	pub fn lintr_deassert(&self, vm: &Vm) -> Result<()> {
		let mut st = self.state();
		match st.lintr.state {
			LintrState::Asserted => {
				st.lintr.state = LintrState::Idle;
				vm.pci()
					.irq()
					.deassert(vm, st.lintr.ioapic_irq, st.lintr.pirq_pin)
			}
			LintrState::Pending => {
				st.lintr.state = LintrState::Idle;
				Ok(())
			}
			LintrState::Idle => Ok(()),
		}
	}

	/// Re-evaluates the line after INTxDIS or MSI enables changed.
	pub(super) fn lintr_update(&self, vm: &Vm, st: &mut FuncState) -> Result<()> {
		let permitted = Self::lintr_permitted(st);
		match st.lintr.state {
			LintrState::Asserted if !permitted => {
				st.lintr.state = LintrState::Pending;
				vm.pci()
					.irq()
					.deassert(vm, st.lintr.ioapic_irq, st.lintr.pirq_pin)
			}
			LintrState::Pending if permitted => {
				st.lintr.state = LintrState::Asserted;
				vm.pci()
					.irq()
					.assert(vm, st.lintr.ioapic_irq, st.lintr.pirq_pin)
			}
			_ => Ok(()),
		}
	}

	pub fn lintr_state(&self) -> LintrState {
		self.state().lintr.state
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::pci::{
		PCIR_COMMAND,
		tests::{Dummy, cfg_write, vm},
	};

	fn routed(vm: &Vm, slot: u8) -> Arc<PciFunction> {
		let pi = Arc::new(PciFunction::new("intx", slot, 0));
		pi.lintr_request(vm);
		vm.pci()
			.insert(pi.clone(), Arc::new(Dummy))
			.unwrap();
		pi.lintr_route(vm).unwrap();
		pi
	}

	#[test]
	fn pins_and_lines_are_spread() {
		let vm = vm();
		let a = routed(&vm, 1);
		let b = routed(&vm, 2);
		assert_eq!(a.cfg8(PCIR_INTPIN), 1);
		let routes = vm.pci().intx_routes();
		assert_eq!(routes.len(), 2);
		assert_eq!(routes[0].ioapic_irq, 16);
		assert_eq!(routes[1].ioapic_irq, 17);
		assert_ne!(routes[0].pirq_pin, routes[1].pirq_pin);
		// INTLINE mirrors the 8259 input behind the PIRQ line.
		let line = a.cfg8(PCIR_INTLINE);
		assert!(irq_permitted(line));
		assert_eq!(line, vm.pci().irq().pirq_irq(routes[0].pirq_pin));
		assert_ne!(line, b.cfg8(PCIR_INTLINE));
	}

	#[test]
	fn reserved_irqs_are_skipped() {
		let vm = vm();
		for irq in [3, 4, 5, 6, 7, 9, 10, 11, 12, 14] {
			vm.pci().irq().reserve(irq).unwrap();
		}
		let pi = routed(&vm, 3);
		assert_eq!(pi.cfg8(PCIR_INTLINE), 15);
		assert!(vm.pci().irq().reserve(15).is_err());
	}

	#[test]
	fn intx_disable_defers_assertion() {
		let vm = vm();
		vm.activate_cpu(0).unwrap();
		let pi = routed(&vm, 4);
		cfg_write(&vm, 4, PCIR_COMMAND, 2, PCIM_CMD_INTXDIS as u32);
		pi.lintr_assert(&vm).unwrap();
		assert_eq!(pi.lintr_state(), LintrState::Pending);
		cfg_write(&vm, 4, PCIR_COMMAND, 2, 0);
		assert_eq!(pi.lintr_state(), LintrState::Asserted);
		pi.lintr_deassert(&vm).unwrap();
		assert_eq!(pi.lintr_state(), LintrState::Idle);
	}

	#[test]
	fn pirq_reprogramming_follows_the_line() {
		let vm = vm();
		vm.activate_cpu(0).unwrap();
		let pi = routed(&vm, 5);
		let pirq = pi.state().lintr.pirq_pin;
		// Program the 8259 so asserted inputs become visible.
		for (port, val) in [(0x20u16, 0x11u32), (0x21, 0x20), (0x21, 0x04), (0x21, 0x01)] {
			let mut eax = val;
			vm.inout().dispatch(&vm, 0, false, port, 1, &mut eax).unwrap();
		}
		for (port, val) in [(0xa0u16, 0x11u32), (0xa1, 0x28), (0xa1, 0x02), (0xa1, 0x01)] {
			let mut eax = val;
			vm.inout().dispatch(&vm, 0, false, port, 1, &mut eax).unwrap();
		}
		vm.pci().irq().pirq_write(&vm, pirq, 10).unwrap();
		vm.atpic().set_irq_trigger(10, true).unwrap();
		pi.lintr_assert(&vm).unwrap();
		assert_eq!(vm.atpic().pending_intr(), Some(0x28 + 2));
		vm.pci().irq().pirq_write(&vm, pirq, PIRQ_DIS).unwrap();
		assert_eq!(vm.atpic().pending_intr(), Some(0x20 + 7));
	}
}
