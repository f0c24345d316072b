//! 8254 programmable interval timer. Channel 0 drives ISA IRQ 0 (IOAPIC
//! pin 2); channel 2 is only visible through the output bit at port 0x61.

use std::{
	sync::{Arc, Mutex, Weak},
	time::{Duration, Instant},
};

use super::{IrqOp, isa_irq};
use crate::{
	callout::{CalloutId, Callouts, Ticket},
	error::{LockExt, Result, VmmError},
	inout::{self, PortFlags},
	vm::Vm,
};

pub const PIT_8254_FREQ: u64 = 1_193_182;

const TIMER_CNTR0: u16 = 0x40;
const TIMER_MODE: u16 = 0x43;
const NMISC_PORT: u16 = 0x61;

const TIMER_SEL_MASK: u8 = 0xc0;
const TIMER_SEL_READBACK: u8 = 0xc0;
const TIMER_RW_MASK: u8 = 0x30;
const TIMER_LATCH: u8 = 0x00;
const TIMER_16BIT: u8 = 0x30;
const TIMER_MODE_MASK: u8 = 0x0e;
const TIMER_INTTC: u8 = 0x00;
const TIMER_RATEGEN: u8 = 0x04;
const TIMER_SQWAVE: u8 = 0x06;
const TIMER_SWSTROBE: u8 = 0x08;

const TIMER_RB_LCTR: u8 = 0x20;
const TIMER_RB_LSTATUS: u8 = 0x10;
const TIMER_RB_CTR_0: u8 = 0x02;

const TIMER_STS_OUT: u8 = 0x80;
const TIMER_STS_NULLCNT: u8 = 0x40;

const TMR2_OUT_STS: u32 = 0x20;

fn ticks_to_duration(ticks: u64) -> Duration {
	Duration::from_nanos(ticks * 1_000_000_000 / PIT_8254_FREQ)
}

#[derive(Debug, Clone)]
struct Channel {
	mode: u8,
	/// Reload value; 0 is stored as 0x10000.
	initial: u32,
	/// When the counter was last loaded.
	loaded: Instant,
	cr: [u8; 2],
	crbyte: usize,
	ol: [u8; 2],
	olbyte: usize,
	/// Toggles between LSB and MSB on unlatched reads.
	frbyte: bool,
	slatched: bool,
	status: u8,
	/// Deadline of the pending channel 0 interrupt.
	next_fire: Instant,
}

impl Channel {
	fn new(now: Instant) -> Self {
		Self {
			mode: 0,
			initial: 0,
			loaded: now,
			cr: [0; 2],
			crbyte: 0,
			ol: [0; 2],
			olbyte: 0,
			frbyte: false,
			slatched: false,
			status: 0,
			next_fire: now,
		}
	}

	fn delta_ticks(&self, now: Instant) -> u64 {
		let elapsed = now.saturating_duration_since(self.loaded);
		(elapsed.as_nanos() * PIT_8254_FREQ as u128 / 1_000_000_000) as u64
	}

	fn update_counter(&mut self, now: Instant, latch: bool) -> u16 {
		if self.initial == 0 {
			// Never programmed: pretend a 100 Hz reload was loaded just now.
			self.initial = (PIT_8254_FREQ / 100) as u32;
			self.loaded = now;
			self.status &= !TIMER_STS_NULLCNT;
		}
		let initial = self.initial as u64;
		let lval = (initial - self.delta_ticks(now) % initial) as u16;
		if latch {
			self.olbyte = 2;
			self.ol[1] = lval as u8;
			self.ol[0] = (lval >> 8) as u8;
		}
		lval
	}

	fn out(&self, now: Instant) -> bool {
		self.mode == TIMER_INTTC && self.initial != 0 && self.delta_ticks(now) >= self.initial as u64
	}

	fn readback(&mut self, now: Instant, cmd: u8) {
		// The latch-select bits are active low.
		if cmd & TIMER_RB_LCTR == 0 && self.olbyte == 0 {
			self.update_counter(now, true);
		}
		if cmd & TIMER_RB_LSTATUS == 0 && !self.slatched {
			self.slatched = true;
			if self.out(now) {
				self.status |= TIMER_STS_OUT;
			} else {
				self.status &= !TIMER_STS_OUT;
			}
		}
	}
}

#[derive(Debug)]
struct AtpitState {
	channels: [Channel; 3],
}

impl AtpitState {
	fn new() -> Self {
		let now = Instant::now();
		Self {
			channels: [Channel::new(now), Channel::new(now), Channel::new(now)],
		}
	}
}

#[derive(Debug)]
pub struct Atpit {
	callout: CalloutId,
	state: Mutex<AtpitState>,
}

impl Atpit {
	pub fn new(vm: &Weak<Vm>, callouts: &Callouts) -> Self {
		let weak = vm.clone();
		let callout = callouts.register(Arc::new(move |ticket| {
			if let Some(vm) = weak.upgrade() {
				vm.atpit().expired(&vm, ticket);
			}
		}));
		Self {
			callout,
			state: Mutex::new(AtpitState::new()),
		}
	}

	pub fn reset(&self, vm: &Vm) {
		vm.callouts().stop(self.callout);
		*self.state.locked() = AtpitState::new();
	}

	fn expired(&self, vm: &Vm, ticket: Ticket) {
		let mut state = self.state.locked();
		if !vm.callouts().is_current(ticket) {
			return;
		}
		if let Err(err) = isa_irq(vm, 0, Some(2), IrqOp::Pulse) {
			warn!("8254: IRQ 0 delivery failed: {err}");
		}
		let c = &mut state.channels[0];
		if c.mode == TIMER_RATEGEN || c.mode == TIMER_SQWAVE {
			self.arm(vm, c);
		}
	}

	/// Schedules the next channel 0 interrupt one period after the last.
	fn arm(&self, vm: &Vm, c: &mut Channel) {
		let period = ticks_to_duration(c.initial as u64);
		let now = Instant::now();
		c.next_fire += period;
		if c.next_fire < now {
			trace!("8254: timer lagging, resetting time base");
			c.next_fire = now + period;
		}
		vm.callouts().reset(self.callout, c.next_fire);
	}

	fn update_mode(&self, state: &mut AtpitState, val: u8) -> Result<()> {
		let now = Instant::now();
		let sel = val & TIMER_SEL_MASK;
		let rw = val & TIMER_RW_MASK;
		let mode = val & TIMER_MODE_MASK;

		if sel == TIMER_SEL_READBACK {
			for (i, c) in state.channels.iter_mut().enumerate() {
				if val & (TIMER_RB_CTR_0 << i) != 0 {
					c.readback(now, val);
				}
			}
			return Ok(());
		}
		if rw != TIMER_LATCH && rw != TIMER_16BIT {
			return Err(VmmError::Unsupported("8254 8-bit access mode"));
		}
		if rw != TIMER_LATCH
			&& !matches!(mode, TIMER_INTTC | TIMER_RATEGEN | TIMER_SQWAVE | TIMER_SWSTROBE)
		{
			return Err(VmmError::Unsupported("8254 counter mode"));
		}

		let c = &mut state.channels[(sel >> 6) as usize];
		if rw == TIMER_LATCH {
			c.update_counter(now, true);
		} else {
			c.mode = mode;
			c.olbyte = 0;
			c.status |= TIMER_STS_NULLCNT;
		}
		Ok(())
	}

	fn counter_read(&self, index: usize) -> u32 {
		let mut state = self.state.locked();
		let c = &mut state.channels[index];
		if c.slatched {
			let status = c.status;
			c.slatched = false;
			c.status = 0;
			status as u32
		} else if c.olbyte == 0 {
			// With nothing latched, reads follow the free-running counter
			// and alternate LSB and MSB.
			let count = c.update_counter(Instant::now(), false);
			let byte = if c.frbyte { count >> 8 } else { count } as u8;
			c.frbyte = !c.frbyte;
			byte as u32
		} else {
			c.olbyte -= 1;
			c.ol[c.olbyte] as u32
		}
	}

	fn counter_write(&self, vm: &Vm, index: usize, val: u8) {
		let mut state = self.state.locked();
		let c = &mut state.channels[index];
		c.cr[c.crbyte] = val;
		c.crbyte += 1;
		if c.crbyte < 2 {
			return;
		}
		c.status &= !TIMER_STS_NULLCNT;
		c.frbyte = false;
		c.crbyte = 0;
		c.initial = u16::from_le_bytes(c.cr) as u32;
		if c.initial == 0 {
			c.initial = 0x10000;
		}
		c.loaded = Instant::now();
		trace!("8254: channel {index} loaded with {:#x}, mode {:#x}", c.initial, c.mode);
		if index == 0 {
			c.next_fire = c.loaded;
			self.arm(vm, c);
		}
	}

	/// Current count of `channel`, for tests and the debug dump.
	pub fn count(&self, channel: usize) -> Option<u16> {
		let mut state = self.state.locked();
		let c = state.channels.get_mut(channel)?;
		Some(c.update_counter(Instant::now(), false))
	}
}

pub fn register_ports(vm: &Vm) -> Result<()> {
	vm.inout().register(
		"8254 counters",
		TIMER_CNTR0,
		3,
		PortFlags::INOUT,
		inout::handler(|vm, _, is_in, port, bytes, eax| {
			if bytes != 1 {
				return Err(VmmError::UnhandledPort { port, bytes, is_in });
			}
			let index = (port - TIMER_CNTR0) as usize;
			if is_in {
				*eax = vm.atpit().counter_read(index);
			} else {
				vm.atpit().counter_write(vm, index, *eax as u8);
			}
			Ok(())
		}),
	)?;
	vm.inout().register(
		"8254 mode",
		TIMER_MODE,
		1,
		PortFlags::OUT,
		inout::handler(|vm, _, is_in, port, bytes, eax| {
			if bytes != 1 {
				return Err(VmmError::UnhandledPort { port, bytes, is_in });
			}
			let atpit = vm.atpit();
			let mut state = atpit.state.locked();
			atpit.update_mode(&mut state, *eax as u8)
		}),
	)?;
	vm.inout().register(
		"NMI status",
		NMISC_PORT,
		1,
		PortFlags::INOUT,
		inout::handler(|vm, _, is_in, _, _, eax| {
			if is_in {
				let state = vm.atpit().state.locked();
				*eax = if state.channels[2].out(Instant::now()) {
					TMR2_OUT_STS
				} else {
					0
				};
			}
			Ok(())
		}),
	)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::thread;

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

	#[test]
	fn latched_count_is_stable() {
		let vm = vm();
		outb(&vm, 0x43, 0x34);
		outb(&vm, 0x40, 0xff);
		outb(&vm, 0x40, 0xff);
		outb(&vm, 0x43, 0x00);
		let lsb = inb(&vm, 0x40);
		let msb = inb(&vm, 0x40);
		let latched = u16::from_le_bytes([lsb, msb]);
		assert!(latched > 0xff00);
		assert!(vm.atpit().count(3).is_none());
	}

	#[test]
	fn readback_status() {
		let vm = vm();
		outb(&vm, 0x43, 0xb0);
		outb(&vm, 0x43, 0xe8);
		assert_ne!(inb(&vm, 0x42) & TIMER_STS_NULLCNT, 0);
		outb(&vm, 0x42, 0x10);
		outb(&vm, 0x42, 0x00);
		// Status of channel 2 only.
		outb(&vm, 0x43, 0xe8);
		let status = inb(&vm, 0x42);
		assert_eq!(status & TIMER_STS_NULLCNT, 0);
	}

	#[test]
	fn channel_two_gate_output() {
		let vm = vm();
		outb(&vm, 0x43, 0xb0);
		outb(&vm, 0x42, 0x02);
		outb(&vm, 0x42, 0x00);
		thread::sleep(Duration::from_millis(5));
		assert_eq!(inb(&vm, 0x61) as u32 & TMR2_OUT_STS, TMR2_OUT_STS);
	}

	#[test]
	fn eight_bit_modes_are_rejected() {
		let vm = vm();
		let mut eax = 0x10;
		assert!(
			vm.inout()
				.dispatch(&vm, 0, false, 0x43, 1, &mut eax)
				.is_err()
		);
	}

	#[test]
	fn rate_generator_raises_irq0() {
		let vm = vm();
		// Unmask IOAPIC pin 2 as fixed vector 0x30 and enable the local APIC.
		vm.lapic(0).unwrap().write_mmio(&vm, 0xf0, 4, 0x1ff).unwrap();
		vm.ioapic().mmio_write(&vm, 0, 0, 4, 0x14).unwrap();
		vm.ioapic().mmio_write(&vm, 0, 0x10, 4, 0x30).unwrap();

		outb(&vm, 0x43, 0x34);
		// About 1 ms.
		outb(&vm, 0x40, 0xa9);
		outb(&vm, 0x40, 0x04);
		let lapic = vm.lapic(0).unwrap();
		let deadline = Instant::now() + Duration::from_secs(2);
		while lapic.pending_intr().is_none() && Instant::now() < deadline {
			thread::sleep(Duration::from_millis(1));
		}
		assert_eq!(lapic.pending_intr(), Some(0x30));
	}
}
