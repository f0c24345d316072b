//! Cascaded 8259A pair: master at 0x20, slave at 0xa0 on master pin 2,
//! plus the edge/level control registers at 0x4d0.

use std::sync::Mutex;

use super::{
	IrqOp,
	lapic::{self, Lvt},
};
use crate::{
	error::{LockExt, Result, VmmError},
	inout::{self, PortFlags},
	vm::Vm,
};

const IO_ICU1: u16 = 0x20;
const IO_ICU2: u16 = 0xa0;
const IO_ELCR1: u16 = 0x4d0;
const ICU_IMR_OFFSET: u16 = 1;

const ICW1_IC4: u8 = 0x01;
const ICW1_SNGL: u8 = 0x02;
const ICW1_INIT: u8 = 0x10;
const ICW4_8086: u8 = 0x01;
const ICW4_AEOI: u8 = 0x02;
const ICW4_SFNM: u8 = 0x10;

const OCW2_EOI: u8 = 0x20;
const OCW2_SL: u8 = 0x40;
const OCW2_R: u8 = 0x80;
const OCW3_SEL: u8 = 0x08;
const OCW3_RIS: u8 = 0x01;
const OCW3_RR: u8 = 0x02;
const OCW3_P: u8 = 0x04;
const OCW3_SMM: u8 = 0x20;
const OCW3_ESMM: u8 = 0x40;

pub const NUM_IRQS: u8 = 16;

#[derive(Debug, Default, Clone)]
struct Chip {
	ready: bool,
	icw_num: u8,
	rd_cmd_reg: u8,
	aeoi: bool,
	poll: bool,
	rotate: bool,
	/// Special fully nested mode.
	sfn: bool,
	irq_base: u8,
	request: u8,
	service: u8,
	mask: u8,
	smm: bool,
	acnt: [i32; 8],
	lowprio: u8,
	intr_raised: bool,
}

impl Chip {
	fn highest_isr_pin(&self) -> Option<u8> {
		(0..8u8)
			.map(|i| (i + 7 - self.lowprio) & 7)
			.find(|&pin| {
				let bit = 1 << pin;
				// In special mask mode a masked in-service bit is skipped.
				self.service & bit != 0 && !(self.smm && self.mask & bit != 0)
			})
	}

	fn highest_irr_pin(&self) -> Option<u8> {
		let mut serviced = self.service;
		// The cascaded slave is not locked out in special fully nested mode.
		if self.sfn {
			serviced &= !(1 << 2);
		}
		if self.smm {
			serviced = 0;
		}
		for i in 0..8u8 {
			let pin = (i + self.lowprio + 1) & 7;
			let bit = 1 << pin;
			if serviced & bit != 0 {
				break;
			}
			if self.request & bit != 0 && self.mask & bit == 0 {
				return Some(pin);
			}
		}
		None
	}

	fn pin_accepted(&mut self, pin: u8) {
		self.intr_raised = false;
		if self.acnt[pin as usize] == 0 {
			self.request &= !(1 << pin);
		}
		if self.aeoi {
			if self.rotate {
				self.lowprio = pin;
			}
		} else {
			self.service |= 1 << pin;
		}
	}

	fn icw1(&mut self, val: u8) -> Result<()> {
		self.ready = false;
		self.icw_num = 1;
		self.request = 0;
		self.mask = 0;
		self.lowprio = 7;
		self.rd_cmd_reg = 0;
		self.poll = false;
		self.smm = false;
		if val & ICW1_SNGL != 0 {
			return Err(VmmError::Unsupported("8259 single mode"));
		}
		if val & ICW1_IC4 == 0 {
			return Err(VmmError::Unsupported("8259 without ICW4"));
		}
		self.icw_num += 1;
		Ok(())
	}

	fn icw4(&mut self, val: u8, master: bool) -> Result<()> {
		if val & ICW4_8086 == 0 {
			return Err(VmmError::Unsupported("8259 MCS-80/85 mode"));
		}
		if val & ICW4_AEOI != 0 {
			self.aeoi = true;
		}
		if val & ICW4_SFNM != 0 {
			if master {
				self.sfn = true;
			} else {
				debug!("ignoring special fully nested mode on the slave 8259");
			}
		}
		self.icw_num = 0;
		self.ready = true;
		Ok(())
	}

	fn ocw2(&mut self, val: u8) {
		self.rotate = val & OCW2_R != 0;
		if val & OCW2_EOI != 0 {
			let pin = if val & OCW2_SL != 0 {
				Some(val & 7)
			} else {
				self.highest_isr_pin()
			};
			if let Some(pin) = pin {
				self.service &= !(1 << pin);
				if self.rotate {
					self.lowprio = pin;
				}
			}
		} else if val & OCW2_SL != 0 && self.rotate {
			self.lowprio = val & 7;
		}
	}

	fn ocw3(&mut self, val: u8) {
		if val & OCW3_ESMM != 0 {
			self.smm = val & OCW3_SMM != 0;
			trace!("8259 special mask mode {}", if self.smm { "on" } else { "off" });
		}
		if val & OCW3_RR != 0 {
			self.rd_cmd_reg = val & OCW3_RIS;
			self.poll = val & OCW3_P != 0;
		}
	}
}

#[derive(Debug, Default)]
struct AtpicState {
	chips: [Chip; 2],
	/// Edge/level control, one bit per IRQ.
	elc: [u8; 2],
}

#[derive(Debug, Default)]
pub struct Atpic {
	state: Mutex<AtpicState>,
}

impl Atpic {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn reset(&self) {
		*self.state.locked() = AtpicState::default();
	}

	pub fn set_irq(&self, vm: &Vm, irq: u8, op: IrqOp) -> Result<()> {
		if irq >= NUM_IRQS {
			return Err(VmmError::InvalidArgument(format!("8259 IRQ {irq}")));
		}
		let mut state = self.state.locked();
		if !state.chips[(irq >> 3) as usize].ready {
			return Ok(());
		}
		match op {
			IrqOp::Assert => state.set_pinstate(vm, irq, true),
			IrqOp::Deassert => state.set_pinstate(vm, irq, false),
			IrqOp::Pulse => {
				state.set_pinstate(vm, irq, true);
				state.set_pinstate(vm, irq, false);
			}
		}
		Ok(())
	}

	/// IRQs 0, 1, 2, 8 and 13 are always edge triggered.
	pub fn set_irq_trigger(&self, irq: u8, level: bool) -> Result<()> {
		if irq >= NUM_IRQS || (level && matches!(irq, 0 | 1 | 2 | 8 | 13)) {
			return Err(VmmError::InvalidArgument(format!(
				"8259 IRQ {irq} cannot be level triggered"
			)));
		}
		let mut state = self.state.locked();
		let bit = 1 << (irq & 7);
		if level {
			state.elc[(irq >> 3) as usize] |= bit;
		} else {
			state.elc[(irq >> 3) as usize] &= !bit;
		}
		Ok(())
	}

	/// The vector the CPU would fetch in an INTA cycle. With nothing pending
	/// this is the spurious vector on pin 7.
	pub fn pending_intr(&self) -> Option<u8> {
		let state = self.state.locked();
		let mut chip = &state.chips[0];
		let mut pin = chip.highest_irr_pin();
		if pin == Some(2) {
			chip = &state.chips[1];
			pin = chip.highest_irr_pin();
		}
		Some(chip.irq_base.wrapping_add(pin.unwrap_or(7)))
	}

	pub fn intr_accepted(&self, vm: &Vm, vector: u8) {
		let mut state = self.state.locked();
		let pin = vector & 7;
		if vector & !7 == state.chips[1].irq_base {
			state.chips[1].pin_accepted(pin);
			// Accept the cascade on the master as well.
			state.chips[0].pin_accepted(2);
		} else {
			state.chips[0].pin_accepted(pin);
		}
		state.notify_intr(vm);
	}

	fn read(&self, chip: usize, port: u16) -> u32 {
		let mut state = self.state.locked();
		let c = &mut state.chips[chip];
		if c.poll {
			c.poll = false;
			return match c.highest_irr_pin() {
				Some(pin) => {
					c.pin_accepted(pin);
					0x80 | pin as u32
				}
				None => 0,
			};
		}
		if port & ICU_IMR_OFFSET != 0 {
			c.mask as u32
		} else if c.rd_cmd_reg == OCW3_RIS {
			c.service as u32
		} else {
			c.request as u32
		}
	}

	fn write(&self, vm: &Vm, chip: usize, port: u16, val: u8) -> Result<()> {
		let mut state = self.state.locked();
		let c = &mut state.chips[chip];
		let mut res = Ok(());
		if port & ICU_IMR_OFFSET != 0 {
			match c.icw_num {
				2 => {
					c.irq_base = val & 0xf8;
					c.icw_num += 1;
				}
				3 => c.icw_num += 1,
				4 => res = c.icw4(val, chip == 0),
				_ => c.mask = val,
			}
		} else {
			if val & ICW1_INIT != 0 {
				res = c.icw1(val);
			}
			if c.ready {
				if val & OCW3_SEL != 0 {
					c.ocw3(val);
				} else {
					c.ocw2(val);
				}
			}
		}
		if state.chips[chip].ready {
			state.notify_intr(vm);
		}
		res
	}
}

impl AtpicState {
	fn set_pinstate(&mut self, vm: &Vm, irq: u8, high: bool) {
		let chip = &mut self.chips[(irq >> 3) as usize];
		let pin = (irq & 7) as usize;
		let old = chip.acnt[pin];
		chip.acnt[pin] += if high { 1 } else { -1 };
		let new = chip.acnt[pin];
		if new < 0 {
			warn!("8259 IRQ {irq}: bad assertion count {new}");
		}
		let level = self.elc[(irq >> 3) as usize] & (1 << pin) != 0;
		if (old == 0 && new == 1) || (new > 0 && level) {
			trace!("8259 IRQ {irq}: asserted");
			chip.request |= 1 << pin;
		} else if old == 1 && new == 0 {
			trace!("8259 IRQ {irq}: deasserted");
			if level {
				chip.request &= !(1 << pin);
			}
		} else {
			trace!("8259 IRQ {irq}: ignored, acnt {new}");
		}
		self.notify_intr(vm);
	}

	fn notify_intr(&mut self, vm: &Vm) {
		// The slave first: it raises the cascade pin on the master.
		let slave = &mut self.chips[1];
		if !slave.intr_raised && slave.highest_irr_pin().is_some() {
			slave.intr_raised = true;
			self.set_pinstate(vm, 2, true);
			self.set_pinstate(vm, 2, false);
		}

		let master = &mut self.chips[0];
		if !master.intr_raised && master.highest_irr_pin().is_some() {
			// The 8259 output reaches the CPU through LINT0 of every local
			// APIC and through IOAPIC pin 0.
			master.intr_raised = true;
			if let Err(err) = lapic::set_local_intr(vm, None, Lvt::Lint0) {
				warn!("8259: LINT0 delivery failed: {err}");
			}
			if let Err(err) = vm.ioapic().set_irq(vm, 0, IrqOp::Pulse) {
				warn!("8259: IOAPIC delivery failed: {err}");
			}
		}
	}
}

pub fn register_ports(vm: &Vm) -> Result<()> {
	for (chip, base) in [(0, IO_ICU1), (1, IO_ICU2)] {
		let name = if chip == 0 { "8259 master" } else { "8259 slave" };
		vm.inout().register(
			name,
			base,
			2,
			PortFlags::INOUT,
			inout::handler(move |vm, _, is_in, port, bytes, eax| {
				if bytes != 1 {
					return Err(VmmError::UnhandledPort { port, bytes, is_in });
				}
				if is_in {
					*eax = vm.atpic().read(chip, port);
					Ok(())
				} else {
					vm.atpic().write(vm, chip, port, *eax as u8)
				}
			}),
		)?;
	}
	vm.inout().register(
		"8259 ELCR",
		IO_ELCR1,
		2,
		PortFlags::INOUT,
		inout::handler(|vm, _, is_in, port, bytes, eax| {
			if bytes != 1 {
				return Err(VmmError::UnhandledPort { port, bytes, is_in });
			}
			let idx = (port - IO_ELCR1) as usize;
			let mut state = vm.atpic().state.locked();
			if is_in {
				*eax = state.elc[idx] as u32;
			} else {
				// IRQ 0, 1, 2 on the master and 8, 13 on the slave stay edge.
				state.elc[idx] = *eax as u8 & if idx == 0 { 0xf8 } else { 0xde };
			}
			Ok(())
		}),
	)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::{vm::VmConfig, vmx::mock::MockBackend};

	fn vm() -> Arc<Vm> {
		let vm = Vm::create(Arc::new(MockBackend::new()), VmConfig::default()).unwrap();
		vm.activate_cpu(0).unwrap();
		vm
	}

	fn outb(vm: &Vm, port: u16, val: u8) {
		let mut eax = val as u32;
		vm.inout().dispatch(vm, 0, false, port, 1, &mut eax).unwrap();
	}

	fn inb(vm: &Vm, port: u16) -> u8 {
		let mut eax = 0;
		vm.inout().dispatch(vm, 0, true, port, 1, &mut eax).unwrap();
		eax as u8
	}

	/// The classic PC initialization: vectors 0x20 and 0x28.
	fn init(vm: &Vm) {
		outb(vm, 0x20, 0x11);
		outb(vm, 0x21, 0x20);
		outb(vm, 0x21, 0x04);
		outb(vm, 0x21, 0x01);
		outb(vm, 0xa0, 0x11);
		outb(vm, 0xa1, 0x28);
		outb(vm, 0xa1, 0x02);
		outb(vm, 0xa1, 0x01);
	}

	#[test]
	fn uninitialized_ignores_irqs() {
		let vm = vm();
		vm.atpic().set_irq(&vm, 1, IrqOp::Pulse).unwrap();
		assert!(!vm.extint_pending(0));
		assert!(vm.atpic().set_irq(&vm, 16, IrqOp::Pulse).is_err());
	}

	#[test]
	fn master_irq_reaches_the_cpu() {
		let vm = vm();
		init(&vm);
		outb(&vm, 0x21, 0xfd);
		assert_eq!(inb(&vm, 0x21), 0xfd);

		vm.atpic().set_irq(&vm, 1, IrqOp::Pulse).unwrap();
		// The local APIC is disabled, so LINT0 acts as INTR.
		assert!(vm.extint_pending(0));
		assert_eq!(vm.atpic().pending_intr(), Some(0x21));
		assert_eq!(inb(&vm, 0x20), 0x02);

		vm.atpic().intr_accepted(&vm, 0x21);
		outb(&vm, 0x20, 0x0b);
		assert_eq!(inb(&vm, 0x20), 0x02);
		outb(&vm, 0x20, 0x20);
		assert_eq!(inb(&vm, 0x20), 0x00);
	}

	#[test]
	fn slave_cascades_through_pin_two() {
		let vm = vm();
		init(&vm);
		vm.atpic().set_irq(&vm, 12, IrqOp::Pulse).unwrap();
		assert_eq!(vm.atpic().pending_intr(), Some(0x2c));
		vm.atpic().intr_accepted(&vm, 0x2c);
		let state = vm.atpic().state.locked();
		assert_eq!(state.chips[1].service, 1 << 4);
		assert_eq!(state.chips[0].service, 1 << 2);
	}

	#[test]
	fn spurious_when_idle() {
		let vm = vm();
		init(&vm);
		assert_eq!(vm.atpic().pending_intr(), Some(0x27));
	}

	#[test]
	fn poll_mode() {
		let vm = vm();
		init(&vm);
		vm.atpic().set_irq(&vm, 3, IrqOp::Assert).unwrap();
		outb(&vm, 0x20, 0x0c);
		assert_eq!(inb(&vm, 0x20), 0x83);
	}

	#[test]
	fn elcr_keeps_system_irqs_edge() {
		let vm = vm();
		outb(&vm, 0x4d0, 0xff);
		outb(&vm, 0x4d1, 0xff);
		assert_eq!(inb(&vm, 0x4d0), 0xf8);
		assert_eq!(inb(&vm, 0x4d1), 0xde);
		assert!(vm.atpic().set_irq_trigger(8, true).is_err());
		vm.atpic().set_irq_trigger(9, true).unwrap();
	}

	#[test]
	fn level_irq_stays_requested() {
		let vm = vm();
		init(&vm);
		vm.atpic().set_irq_trigger(10, true).unwrap();
		vm.atpic().set_irq(&vm, 10, IrqOp::Assert).unwrap();
		vm.atpic().intr_accepted(&vm, 0x2a);
		outb(&vm, 0xa0, 0x20);
		outb(&vm, 0x20, 0x20);
		assert_eq!(vm.atpic().pending_intr(), Some(0x2a));
		vm.atpic().set_irq(&vm, 10, IrqOp::Deassert).unwrap();
		assert_eq!(vm.atpic().pending_intr(), Some(0x27));
	}
}
