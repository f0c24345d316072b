//! The I/O APIC at `0xfec00000`: one indirect register window in front of
//! a 24-pin redirection table.

use std::sync::{Arc, Mutex};

use super::{IrqOp, lapic};
use crate::{
	error::{LockExt, Result, VmmError},
	vm::Vm,
};

/// Number of redirection table entries
pub const REDIR_ENTRIES: usize = 24;

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;

const REG_ID: u32 = 0x00;
const REG_VER: u32 = 0x01;
const REG_ARB: u32 = 0x02;
/// Redirection table base
const REG_TABLE: u32 = 0x10;

const ART_INTVEC: u64 = 0xff;
const ART_DELMOD: u64 = 0x700;
const ART_DESTMOD_LOG: u64 = 0x800;
const ART_DELIVS: u64 = 0x1000;
const ART_INTPOL: u64 = 0x2000;
const ART_REM_IRR: u64 = 0x4000;
const ART_TRGRLVL: u64 = 0x8000;
const ART_INTMASK: u64 = 0x10000;
const ART_RO_BITS: u64 = ART_REM_IRR | ART_DELIVS;

const ID_MASK: u32 = 0xff00_0000;

#[derive(Debug, Copy, Clone)]
struct RedirectionEntry {
	reg: u64,
	/// Sum of asserts and deasserts seen on the pin.
	acnt: i32,
}

impl RedirectionEntry {
	const fn masked() -> Self {
		RedirectionEntry {
			reg: ART_INTMASK | (ART_INTMASK << 32),
			acnt: 0,
		}
	}

	fn level(&self) -> bool {
		self.reg & ART_TRGRLVL != 0
	}

	fn route(&self) -> Route {
		let low = self.reg;
		Route {
			level: self.level(),
			dest: (low >> 56) as u32,
			phys: low & ART_DESTMOD_LOG == 0,
			delmode: (low & ART_DELMOD) as u32,
			vector: (low & ART_INTVEC) as u8,
		}
	}
}

/// Where an interrupt from one pin goes, taken under the IOAPIC lock and
/// delivered after it is dropped.
#[derive(Debug, Clone, Copy)]
struct Route {
	level: bool,
	dest: u32,
	phys: bool,
	delmode: u32,
	vector: u8,
}

fn deliver(vm: &Vm, sends: Vec<Route>) -> Result<()> {
	for r in sends {
		lapic::deliver_intr(vm, r.level, r.dest, r.phys, r.delmode, r.vector)?;
	}
	Ok(())
}

/// Rebuilds the trigger mode register of `vcpu`'s local APIC from the
/// level-triggered pins.
fn update_tmr(vm: &Vm, vcpu: usize) {
	let Ok(lapic) = vm.lapic(vcpu) else {
		return;
	};
	let levels: Vec<Route> = {
		let state = vm.ioapic().state.locked();
		state
			.rtbl
			.iter()
			.filter(|entry| entry.level())
			.map(RedirectionEntry::route)
			.collect()
	};
	lapic.reset_tmr();
	for r in levels {
		lapic.set_tmr_level(vm, r.dest, r.phys, r.delmode, r.vector);
	}
}

#[derive(Debug)]
struct IoapicState {
	id: u32,
	selector: u32,
	rtbl: [RedirectionEntry; REDIR_ENTRIES],
}

#[derive(Debug)]
pub struct Ioapic {
	state: Mutex<IoapicState>,
}

impl Default for Ioapic {
	fn default() -> Self {
		Self::new()
	}
}

impl Ioapic {
	pub fn new() -> Self {
		Ioapic {
			state: Mutex::new(IoapicState {
				id: 0,
				selector: 0,
				// Every pin starts out masked.
				rtbl: [RedirectionEntry::masked(); REDIR_ENTRIES],
			}),
		}
	}

	pub fn reset(&self) {
		*self.state.locked() = IoapicState {
			id: 0,
			selector: 0,
			rtbl: [RedirectionEntry::masked(); REDIR_ENTRIES],
		};
	}

	pub const fn pin_count(&self) -> usize {
		REDIR_ENTRIES
	}

	/// Only 32-bit accesses to IOREGSEL and IOWIN do anything.
	pub fn mmio_read(&self, offset: u64, size: u8) -> Result<u64> {
		if size != 4 || (offset != IOREGSEL && offset != IOWIN) {
			return Ok(0);
		}
		let state = self.state.locked();
		if offset == IOREGSEL {
			return Ok(state.selector as u64);
		}
		Ok(state.read(state.selector) as u64)
	}

	/// `vcpu` is the writer. It takes part in the rendezvous that follows a
	/// routing change.
	pub fn mmio_write(&self, vm: &Vm, vcpu: usize, offset: u64, size: u8, value: u64) -> Result<()> {
		if size != 4 || (offset != IOREGSEL && offset != IOWIN) {
			return Ok(());
		}
		let (pin, changed) = {
			let mut state = self.state.locked();
			if offset == IOREGSEL {
				state.selector = value as u32;
				return Ok(());
			}
			let selector = state.selector;
			match state.write(selector, value as u32) {
				Some(write) => write,
				None => return Ok(()),
			}
		};

		// Anything but mask and polarity can change which vectors are
		// level triggered on which APIC.
		if changed & !(ART_INTMASK | ART_INTPOL) != 0 {
			debug!("IOAPIC pin {pin}: recalculating trigger mode registers");
			vm.smp_rendezvous(Some(vcpu), vm.active_cpus(), Arc::new(update_tmr));
		}

		let mut sends = Vec::new();
		{
			let mut state = self.state.locked();
			let entry = &state.rtbl[pin];
			// Unmasked, previous interrupt EOIed and the line still high.
			if entry.reg & ART_INTMASK == 0 && entry.reg & ART_REM_IRR == 0 && entry.acnt > 0 {
				trace!("IOAPIC pin {pin}: asserted at table write, acnt {}", entry.acnt);
				state.send_intr(pin, &mut sends);
			}
		}
		deliver(vm, sends)
	}

	pub fn set_irq(&self, vm: &Vm, pin: u8, op: IrqOp) -> Result<()> {
		let pin = pin as usize;
		if pin >= REDIR_ENTRIES {
			return Err(VmmError::InvalidArgument(format!("IOAPIC pin {pin}")));
		}
		let mut sends = Vec::new();
		{
			let mut state = self.state.locked();
			match op {
				IrqOp::Assert => state.set_pinstate(pin, true, &mut sends),
				IrqOp::Deassert => state.set_pinstate(pin, false, &mut sends),
				IrqOp::Pulse => {
					state.set_pinstate(pin, true, &mut sends);
					state.set_pinstate(pin, false, &mut sends);
				}
			}
		}
		deliver(vm, sends)
	}

	/// A local APIC signalled EOI for a level-triggered `vector`.
	pub fn process_eoi(&self, vm: &Vm, vector: u8) {
		let mut sends = Vec::new();
		{
			let mut state = self.state.locked();
			for pin in 0..REDIR_ENTRIES {
				let entry = &mut state.rtbl[pin];
				if entry.reg & ART_REM_IRR == 0 || entry.reg & ART_INTVEC != vector as u64 {
					continue;
				}
				entry.reg &= !ART_REM_IRR;
				if entry.acnt > 0 {
					trace!("IOAPIC pin {pin}: asserted at EOI, acnt {}", entry.acnt);
					state.send_intr(pin, &mut sends);
				}
			}
		}
		if let Err(err) = deliver(vm, sends) {
			warn!("IOAPIC EOI of vector {vector:#x}: {err}");
		}
	}
}

impl IoapicState {
	fn read(&self, reg: u32) -> u32 {
		match reg & 0xff {
			REG_ID | REG_ARB => self.id,
			REG_VER => ((REDIR_ENTRIES as u32 - 1) << 16) | 0x11,
			reg if (REG_TABLE..REG_TABLE + 2 * REDIR_ENTRIES as u32).contains(&reg) => {
				let pin = ((reg - REG_TABLE) / 2) as usize;
				let shift = if (reg - REG_TABLE) % 2 == 1 { 32 } else { 0 };
				(self.rtbl[pin].reg >> shift) as u32
			}
			_ => 0,
		}
	}

	/// Returns the redirection entry written and the bits that changed.
	fn write(&mut self, reg: u32, data: u32) -> Option<(usize, u64)> {
		let reg = reg & 0xff;
		if reg == REG_ID {
			self.id = data & ID_MASK;
		}
		if !(REG_TABLE..REG_TABLE + 2 * REDIR_ENTRIES as u32).contains(&reg) {
			return None;
		}

		let pin = ((reg - REG_TABLE) / 2) as usize;
		let shift = if (reg - REG_TABLE) % 2 == 1 { 32 } else { 0 };
		let entry = &mut self.rtbl[pin];
		let last = entry.reg;
		let mask = 0xffff_ffffu64 << shift;
		entry.reg &= !mask | ART_RO_BITS;
		entry.reg |= ((data as u64) << shift) & !ART_RO_BITS;
		trace!("IOAPIC pin {pin}: redirection entry {:#x}", entry.reg);
		Some((pin, last ^ entry.reg))
	}

	fn set_pinstate(&mut self, pin: usize, high: bool, sends: &mut Vec<Route>) {
		let entry = &mut self.rtbl[pin];
		let old = entry.acnt;
		entry.acnt += if high { 1 } else { -1 };
		let new = entry.acnt;
		if new < 0 {
			warn!("IOAPIC pin {pin}: bad assertion count {new}");
		}
		match (old, new) {
			(0, 1) => {
				trace!("IOAPIC pin {pin}: asserted");
				self.send_intr(pin, sends);
			}
			(1, 0) => trace!("IOAPIC pin {pin}: deasserted"),
			_ => trace!("IOAPIC pin {pin}: ignored, acnt {new}"),
		}
	}

	fn send_intr(&mut self, pin: usize, sends: &mut Vec<Route>) {
		let entry = &mut self.rtbl[pin];
		if entry.reg & ART_INTMASK != 0 {
			trace!("IOAPIC pin {pin}: masked");
			return;
		}
		let route = entry.route();
		if route.level {
			entry.reg |= ART_REM_IRR;
		}
		sends.push(route);
	}
}
