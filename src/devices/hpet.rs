//! High Precision Event Timer: a 32-bit main counter at 16 MiHz and eight
//! comparators that interrupt through the IOAPIC or by FSB message.

use std::{
	sync::{Arc, Mutex, Weak},
	time::{Duration, Instant},
};

use super::{IrqOp, lapic};
use crate::{
	callout::{CalloutId, Callouts, Ticket},
	error::{LockExt, Result},
	vm::Vm,
};

pub const HPET_FREQ: u64 = 1 << 24;
pub const NUM_TIMERS: usize = 8;
const FS_PER_S: u64 = 1_000_000_000_000_000;

/// IOAPIC pins a comparator may route to: 2 and the four highest.
const ALLOWED_IRQS: u64 = 0x00f0_0004;

const HPET_CAPABILITIES: u64 = 0x000;
const HPET_CONFIG: u64 = 0x010;
const HPET_ISR: u64 = 0x020;
const HPET_MAIN_COUNTER: u64 = 0x0f0;
const HPET_TIMER_BASE: u64 = 0x100;
const HPET_TIMER_STRIDE: u64 = 0x20;
const TIMER_CAP_CNF: u64 = 0x00;
const TIMER_COMPARATOR: u64 = 0x08;
const TIMER_FSB_VAL: u64 = 0x10;
const TIMER_FSB_ADDR: u64 = 0x14;

const HPET_CNF_ENABLE: u64 = 0x1;
const HPET_CNF_LEG_RT: u64 = 0x2;

const HPET_TCNF_INT_TYPE: u64 = 0x2;
const HPET_TCNF_INT_ENB: u64 = 0x4;
const HPET_TCNF_TYPE: u64 = 0x8;
const HPET_TCAP_PER_INT: u64 = 0x10;
const HPET_TCAP_SIZE: u64 = 0x20;
const HPET_TCNF_VAL_SET: u64 = 0x40;
const HPET_TCNF_INT_ROUTE: u64 = 0x3e00;
const HPET_TCNF_FSB_EN: u64 = 0x4000;
const HPET_TCAP_FSB_INT_DEL: u64 = 0x8000;
const HPET_TCAP_INT_ROUTE: u64 = 0xffff_ffff << 32;
const HPET_TCAP_RO_MASK: u64 =
	HPET_TCAP_INT_ROUTE | HPET_TCAP_FSB_INT_DEL | HPET_TCAP_SIZE | HPET_TCAP_PER_INT;

fn capabilities() -> u64 {
	let period_fs = FS_PER_S / HPET_FREQ;
	// Vendor 0x8086, 32-bit counter, revision 1.
	(period_fs << 32) | (0x8086 << 16) | (((NUM_TIMERS - 1) as u64) << 8) | 1
}

fn ticks_since(since: Instant, now: Instant) -> u64 {
	let elapsed = now.saturating_duration_since(since).as_nanos();
	(elapsed * HPET_FREQ as u128 / 1_000_000_000) as u64
}

fn ticks_to_duration(ticks: u32) -> Duration {
	Duration::from_nanos((ticks as u64 * 1_000_000_000).div_ceil(HPET_FREQ))
}

fn update_register(reg: &mut u64, data: u64, mask: u64) {
	*reg = (*reg & !mask) | (data & mask);
}

#[derive(Debug, Clone)]
struct Timer {
	cap_config: u64,
	/// FSB message: address in the high half, data in the low half.
	msireg: u64,
	compval: u32,
	/// Period of a periodic timer, 0 for one-shot.
	comprate: u32,
	/// When the armed callout is due.
	callout_at: Option<Instant>,
}

impl Timer {
	fn new() -> Self {
		Self {
			cap_config: (ALLOWED_IRQS << 32) | HPET_TCAP_PER_INT | HPET_TCAP_FSB_INT_DEL,
			msireg: 0,
			compval: u32::MAX,
			comprate: 0,
			callout_at: None,
		}
	}

	fn msi_enabled(&self) -> bool {
		let msi = HPET_TCAP_FSB_INT_DEL | HPET_TCNF_FSB_EN;
		self.cap_config & msi == msi
	}

	fn ioapic_pin(&self) -> u8 {
		if self.msi_enabled() {
			0
		} else {
			((self.cap_config & HPET_TCNF_INT_ROUTE) >> 9) as u8
		}
	}

	fn interrupt_enabled(&self) -> bool {
		self.cap_config & HPET_TCNF_INT_ENB != 0
	}

	fn edge_trig(&self) -> bool {
		self.cap_config & HPET_TCNF_INT_TYPE == 0
	}

	fn periodic(&self) -> bool {
		self.cap_config & HPET_TCNF_TYPE != 0
	}
}

#[derive(Debug)]
struct HpetState {
	config: u64,
	isr: u64,
	/// Counter value at `countbase_at`.
	countbase: u32,
	countbase_at: Instant,
	paused: bool,
	timers: [Timer; NUM_TIMERS],
}

/// An interrupt decided under the HPET lock and raised once it is dropped.
#[derive(Debug)]
enum Raise {
	Msi { timer: usize, addr: u64, data: u64 },
	Pin { timer: usize, pin: u8, op: IrqOp },
}

fn raise(vm: &Vm, raises: Vec<Raise>) {
	for raise in raises {
		match raise {
			Raise::Msi { timer, addr, data } => {
				if let Err(err) = lapic::intr_msi(vm, addr, data) {
					warn!("HPET timer {timer}: FSB message failed: {err}");
				}
			}
			Raise::Pin { timer, pin, op } => {
				if let Err(err) = vm.ioapic().set_irq(vm, pin, op) {
					warn!("HPET timer {timer}: {err}");
				}
			}
		}
	}
}

impl HpetState {
	fn new() -> Self {
		Self {
			config: 0,
			isr: 0,
			countbase: 0,
			countbase_at: Instant::now(),
			paused: false,
			timers: std::array::from_fn(|_| Timer::new()),
		}
	}

	fn counter_enabled(&self) -> bool {
		self.config & HPET_CNF_ENABLE != 0 && !self.paused
	}

	fn counter(&self, now: Instant) -> u32 {
		if self.counter_enabled() {
			self.countbase
				.wrapping_add(ticks_since(self.countbase_at, now) as u32)
		} else {
			self.countbase
		}
	}

	fn timer_interrupt(&mut self, n: usize, raises: &mut Vec<Raise>) {
		let timer = &self.timers[n];
		if !timer.interrupt_enabled() {
			return;
		}
		// A level interrupt that is still asserted.
		if self.isr & (1 << n) != 0 {
			return;
		}
		if timer.msi_enabled() {
			raises.push(Raise::Msi {
				timer: n,
				addr: timer.msireg >> 32,
				data: timer.msireg & 0xffff_ffff,
			});
			return;
		}
		let pin = timer.ioapic_pin();
		if pin == 0 {
			debug!("HPET timer {n}: interrupt without a route");
			return;
		}
		let op = if timer.edge_trig() {
			IrqOp::Pulse
		} else {
			self.isr |= 1 << n;
			IrqOp::Assert
		};
		raises.push(Raise::Pin { timer: n, pin, op });
	}

	fn clear_isr(&mut self, n: usize, pin: u8, raises: &mut Vec<Raise>) {
		if self.isr & (1 << n) == 0 {
			return;
		}
		self.isr &= !(1 << n);
		raises.push(Raise::Pin {
			timer: n,
			pin,
			op: IrqOp::Deassert,
		});
	}

	fn update_timer_config(&mut self, n: usize, data: u64, mask: u64, raises: &mut Vec<Raise>) {
		let timer = &mut self.timers[n];
		let oldval = timer.cap_config;
		let old_pin = timer.ioapic_pin();
		let mut newval = oldval;
		update_register(&mut newval, data, mask);
		newval = (newval & !HPET_TCAP_RO_MASK) | (oldval & HPET_TCAP_RO_MASK);
		if newval == oldval {
			return;
		}
		timer.cap_config = newval;

		let allowed = timer.cap_config >> 32;
		let mut new_pin = timer.ioapic_pin();
		if new_pin != 0 && allowed & (1 << new_pin) == 0 {
			debug!("HPET timer {n}: IOAPIC pin {new_pin} not allowed");
			new_pin = 0;
			timer.cap_config &= !HPET_TCNF_INT_ROUTE;
		}
		if !timer.periodic() {
			timer.comprate = 0;
		}
		debug!("HPET timer {n}: config {oldval:#x} -> {:#x}", timer.cap_config);

		// Drop a latched level interrupt that no longer applies.
		if self.isr & (1 << n) != 0 {
			let timer = &self.timers[n];
			if !timer.interrupt_enabled() || timer.edge_trig() || new_pin != old_pin {
				self.clear_isr(n, old_pin, raises);
			}
		}
	}
}

#[derive(Debug)]
pub struct Hpet {
	callouts: [CalloutId; NUM_TIMERS],
	state: Mutex<HpetState>,
}

impl Hpet {
	pub fn new(vm: &Weak<Vm>, callouts: &Callouts) -> Self {
		let ids = std::array::from_fn(|n| {
			let weak = vm.clone();
			callouts.register(Arc::new(move |ticket| {
				if let Some(vm) = weak.upgrade() {
					vm.hpet().expired(&vm, n, ticket);
				}
			}))
		});
		Self {
			callouts: ids,
			state: Mutex::new(HpetState::new()),
		}
	}

	pub fn reset(&self, vm: &Vm) {
		let mut state = self.state.locked();
		for id in self.callouts {
			vm.callouts().stop(id);
		}
		*state = HpetState::new();
	}

	/// Freezes the main counter while the VM is paused so the guest sees no
	/// jump when it resumes.
	pub fn pause(&self, vm: &Vm, pause: bool) {
		let mut raises = Vec::new();
		{
			let mut state = self.state.locked();
			if state.paused == pause {
				return;
			}
			let now = Instant::now();
			if pause {
				let counter = state.counter(now);
				state.paused = true;
				if state.config & HPET_CNF_ENABLE != 0 {
					self.stop_counting(vm, &mut state, counter, now, &mut raises);
				}
			} else {
				state.paused = false;
				if state.counter_enabled() {
					self.start_counting(vm, &mut state);
				}
			}
		}
		raise(vm, raises);
	}

	fn expired(&self, vm: &Vm, n: usize, ticket: Ticket) {
		let mut raises = Vec::new();
		{
			let mut state = self.state.locked();
			if !vm.callouts().is_current(ticket) {
				return;
			}
			let now = Instant::now();
			let counter = state.counter(now);
			self.start_timer(vm, &mut state, n, counter, now);
			state.timer_interrupt(n, &mut raises);
		}
		raise(vm, raises);
	}

	fn start_timer(&self, vm: &Vm, state: &mut HpetState, n: usize, counter: u32, now: Instant) {
		let timer = &mut state.timers[n];
		// Round a periodic comparator the counter has passed up to the first
		// period ahead of it.
		if timer.comprate != 0 && counter.wrapping_sub(timer.compval) as i32 >= 0 {
			let rate = timer.comprate;
			let periods = counter.wrapping_sub(timer.compval) / rate + 1;
			timer.compval = timer.compval.wrapping_add(periods.wrapping_mul(rate));
		}
		let at = now + ticks_to_duration(timer.compval.wrapping_sub(counter));
		timer.callout_at = Some(at);
		vm.callouts().reset(self.callouts[n], at);
	}

	fn stop_timer(
		&self,
		vm: &Vm,
		state: &mut HpetState,
		n: usize,
		now: Instant,
		raises: &mut Vec<Raise>,
	) {
		vm.callouts().stop(self.callouts[n]);
		// A callout that was due but has not run yet would be lost.
		if state.timers[n].callout_at.take().is_some_and(|at| at < now) {
			state.timer_interrupt(n, raises);
		}
	}

	fn start_counting(&self, vm: &Vm, state: &mut HpetState) {
		let now = Instant::now();
		state.countbase_at = now;
		let counter = state.countbase;
		for n in 0..NUM_TIMERS {
			self.start_timer(vm, state, n, counter, now);
		}
	}

	fn stop_counting(
		&self,
		vm: &Vm,
		state: &mut HpetState,
		counter: u32,
		now: Instant,
		raises: &mut Vec<Raise>,
	) {
		state.countbase = counter;
		for n in 0..NUM_TIMERS {
			self.stop_timer(vm, state, n, now, raises);
		}
	}

	pub fn mmio_read(&self, _vm: &Vm, offset: u64, size: u8) -> Result<u64> {
		if (size != 4 && size != 8) || offset & (size as u64 - 1) != 0 {
			return Ok(0);
		}
		let state = self.state.locked();
		let reg = offset & !0x4;
		let data = match reg {
			HPET_CAPABILITIES => capabilities(),
			HPET_CONFIG => state.config,
			HPET_ISR => state.isr,
			HPET_MAIN_COUNTER => state.counter(Instant::now()) as u64,
			HPET_TIMER_BASE.. => match timer_reg(offset) {
				Some((n, TIMER_CAP_CNF)) => state.timers[n].cap_config,
				Some((n, TIMER_COMPARATOR)) => state.timers[n].compval as u64,
				Some((n, _)) => state.timers[n].msireg,
				None => 0,
			},
			_ => 0,
		};
		Ok(match size {
			4 if offset & 0x4 != 0 => data >> 32,
			4 => data & 0xffff_ffff,
			_ => data,
		})
	}

	pub fn mmio_write(&self, vm: &Vm, offset: u64, size: u8, value: u64) -> Result<()> {
		let (data, mask) = match size {
			8 => (value, u64::MAX),
			4 if offset & 0x4 != 0 => (value << 32, 0xffff_ffff << 32),
			4 => (value & 0xffff_ffff, 0xffff_ffff),
			_ => return Ok(()),
		};
		if offset & (size as u64 - 1) != 0 {
			return Ok(());
		}
		let mut raises = Vec::new();
		{
			let mut state = self.state.locked();
			let state = &mut *state;
			let now = Instant::now();
			match offset & !0x4 {
				HPET_CONFIG => {
					// Sample the counter before a disable freezes it.
					let counter = state.counter(now);
					let oldval = state.config;
					update_register(&mut state.config, data, mask);
					if state.config & HPET_CNF_LEG_RT != 0 {
						debug!("HPET: legacy replacement routing is not supported");
						state.config &= !HPET_CNF_LEG_RT;
					}
					if (oldval ^ state.config) & HPET_CNF_ENABLE != 0 && !state.paused {
						if state.counter_enabled() {
							debug!("HPET: counter enabled at {:#x}", state.countbase);
							self.start_counting(vm, state);
						} else {
							debug!("HPET: counter stopped at {counter:#x}");
							self.stop_counting(vm, state, counter, now, &mut raises);
						}
					}
				}
				HPET_ISR => {
					let clear = state.isr & data;
					for n in 0..NUM_TIMERS {
						if clear & (1 << n) != 0 {
							let pin = state.timers[n].ioapic_pin();
							state.clear_isr(n, pin, &mut raises);
						}
					}
				}
				HPET_MAIN_COUNTER => {
					let mut counter = state.counter(now) as u64;
					update_register(&mut counter, data, mask);
					state.countbase = counter as u32;
					if state.counter_enabled() {
						self.start_counting(vm, state);
					}
				}
				HPET_TIMER_BASE.. => match timer_reg(offset) {
					Some((n, TIMER_CAP_CNF)) => state.update_timer_config(n, data, mask, &mut raises),
					Some((n, TIMER_COMPARATOR)) => self.write_comparator(vm, state, n, data, mask),
					Some((n, _)) => update_register(&mut state.timers[n].msireg, data, mask),
					None => {}
				},
				_ => {}
			}
		}
		raise(vm, raises);
		Ok(())
	}

	fn write_comparator(&self, vm: &Vm, state: &mut HpetState, n: usize, data: u64, mask: u64) {
		let timer = &mut state.timers[n];
		let old = (timer.compval, timer.comprate);
		if timer.periodic() {
			// Writes set the period; the comparator itself only changes
			// when VAL_SET is armed.
			let mut rate = timer.comprate as u64;
			update_register(&mut rate, data, mask);
			timer.comprate = rate as u32;
			if timer.cap_config & HPET_TCNF_VAL_SET != 0 {
				timer.compval = rate as u32;
			}
		} else {
			let mut val = timer.compval as u64;
			update_register(&mut val, data, mask);
			timer.compval = val as u32;
		}
		timer.cap_config &= !HPET_TCNF_VAL_SET;
		let changed = (timer.compval, timer.comprate) != old;
		if changed && state.counter_enabled() {
			let now = Instant::now();
			let counter = state.counter(now);
			self.start_timer(vm, state, n, counter, now);
		}
	}

	/// Current main counter, for the debug dump.
	pub fn counter(&self) -> u32 {
		self.state.locked().counter(Instant::now())
	}
}

/// Splits a timer register offset into the timer index and the register.
fn timer_reg(offset: u64) -> Option<(usize, u64)> {
	let rel = offset.checked_sub(HPET_TIMER_BASE)?;
	let n = (rel / HPET_TIMER_STRIDE) as usize;
	if n >= NUM_TIMERS {
		return None;
	}
	match rel % HPET_TIMER_STRIDE {
		r @ (0x00 | 0x04) => Some((n, r & !0x4)),
		r @ (0x08 | 0x0c) => Some((n, r & !0x4)),
		TIMER_FSB_VAL | TIMER_FSB_ADDR => Some((n, TIMER_FSB_VAL)),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;
	use crate::{vm::VmConfig, vmx::mock::MockBackend};

	fn vm() -> Arc<Vm> {
		let vm = Vm::create(Arc::new(MockBackend::new()), VmConfig::default()).unwrap();
		vm.activate_cpu(0).unwrap();
		vm.lapic(0).unwrap().write_mmio(&vm, 0xf0, 4, 0x1ff).unwrap();
		vm
	}

	fn route_ioapic_pin(vm: &Vm, pin: u32, vector: u32, level: bool) {
		let low = vector | if level { 0x8000 } else { 0 };
		vm.ioapic().mmio_write(vm, 0, 0, 4, (0x10 + 2 * pin) as u64).unwrap();
		vm.ioapic().mmio_write(vm, 0, 0x10, 4, low as u64).unwrap();
	}

	#[test]
	fn capabilities_layout() {
		let vm = vm();
		let hpet = vm.hpet();
		let cap = hpet.mmio_read(&vm, HPET_CAPABILITIES, 8).unwrap();
		assert_eq!(cap & 0xffff_ffff, 0x8086_0701);
		assert_eq!(cap >> 32, 59_604_644);
		assert_eq!(hpet.mmio_read(&vm, 0x4, 4).unwrap(), 59_604_644);
		assert_eq!(hpet.mmio_read(&vm, 0x1, 1).unwrap(), 0);
		let tcap = hpet.mmio_read(&vm, 0x100, 8).unwrap();
		assert_eq!(tcap >> 32, ALLOWED_IRQS);
		assert_eq!(hpet.mmio_read(&vm, 0x108, 4).unwrap(), 0xffff_ffff);
	}

	#[test]
	fn counter_runs_only_when_enabled() {
		let vm = vm();
		let hpet = vm.hpet();
		assert_eq!(hpet.counter(), 0);
		hpet.mmio_write(&vm, HPET_CONFIG, 4, HPET_CNF_ENABLE | HPET_CNF_LEG_RT)
			.unwrap();
		assert_eq!(hpet.mmio_read(&vm, HPET_CONFIG, 4).unwrap(), HPET_CNF_ENABLE);
		thread::sleep(Duration::from_millis(5));
		let running = hpet.counter();
		assert!(running > 16_000);
		hpet.mmio_write(&vm, HPET_CONFIG, 4, 0).unwrap();
		let stopped = hpet.counter();
		thread::sleep(Duration::from_millis(2));
		assert_eq!(hpet.counter(), stopped);
		hpet.mmio_write(&vm, HPET_MAIN_COUNTER, 8, 0x1234).unwrap();
		assert_eq!(hpet.counter(), 0x1234);
	}

	#[test]
	fn pause_freezes_the_counter() {
		let vm = vm();
		let hpet = vm.hpet();
		hpet.mmio_write(&vm, HPET_CONFIG, 4, HPET_CNF_ENABLE).unwrap();
		hpet.pause(&vm, true);
		let frozen = hpet.counter();
		thread::sleep(Duration::from_millis(5));
		assert_eq!(hpet.counter(), frozen);
		hpet.pause(&vm, false);
		thread::sleep(Duration::from_millis(1));
		let resumed = hpet.counter();
		// Continuous modulo the pause: well below 5 ms worth of ticks.
		assert!(resumed.wrapping_sub(frozen) < 80_000);
	}

	#[test]
	fn disallowed_route_is_cleared() {
		let vm = vm();
		let hpet = vm.hpet();
		hpet.mmio_write(&vm, 0x100, 4, (5 << 9) | HPET_TCNF_INT_ENB).unwrap();
		assert_eq!(hpet.mmio_read(&vm, 0x100, 4).unwrap() & HPET_TCNF_INT_ROUTE, 0);
		hpet.mmio_write(&vm, 0x100, 4, (20 << 9) | HPET_TCNF_INT_ENB).unwrap();
		assert_eq!(hpet.mmio_read(&vm, 0x100, 4).unwrap() & HPET_TCNF_INT_ROUTE, 20 << 9);
	}

	#[test]
	fn one_shot_edge_interrupt() {
		let vm = vm();
		let hpet = vm.hpet();
		route_ioapic_pin(&vm, 2, 0x40, false);
		hpet.mmio_write(&vm, 0x100, 4, (2 << 9) | HPET_TCNF_INT_ENB).unwrap();
		// About 1 ms.
		hpet.mmio_write(&vm, 0x108, 4, 16_777).unwrap();
		hpet.mmio_write(&vm, HPET_CONFIG, 4, HPET_CNF_ENABLE).unwrap();
		let lapic = vm.lapic(0).unwrap();
		let deadline = Instant::now() + Duration::from_secs(2);
		while lapic.pending_intr().is_none() && Instant::now() < deadline {
			thread::sleep(Duration::from_millis(1));
		}
		assert_eq!(lapic.pending_intr(), Some(0x40));
	}

	#[test]
	fn level_interrupt_latches_isr() {
		let vm = vm();
		let hpet = vm.hpet();
		route_ioapic_pin(&vm, 21, 0x41, true);
		hpet.mmio_write(
			&vm,
			0x120,
			4,
			(21 << 9) | HPET_TCNF_INT_ENB | HPET_TCNF_INT_TYPE,
		)
		.unwrap();
		hpet.mmio_write(&vm, 0x128, 4, 1_000).unwrap();
		hpet.mmio_write(&vm, HPET_CONFIG, 4, HPET_CNF_ENABLE).unwrap();
		let deadline = Instant::now() + Duration::from_secs(2);
		while hpet.mmio_read(&vm, HPET_ISR, 4).unwrap() == 0 && Instant::now() < deadline {
			thread::sleep(Duration::from_millis(1));
		}
		assert_eq!(hpet.mmio_read(&vm, HPET_ISR, 4).unwrap(), 0b10);
		hpet.mmio_write(&vm, HPET_ISR, 4, 0b10).unwrap();
		assert_eq!(hpet.mmio_read(&vm, HPET_ISR, 4).unwrap(), 0);
	}

	#[test]
	fn periodic_comparator_advances() {
		let vm = vm();
		let hpet = vm.hpet();
		hpet.mmio_write(
			&vm,
			0x100,
			4,
			HPET_TCNF_TYPE | HPET_TCNF_VAL_SET,
		)
		.unwrap();
		// 1000 Hz period.
		hpet.mmio_write(&vm, 0x108, 4, 16_777).unwrap();
		assert_eq!(hpet.mmio_read(&vm, 0x100, 4).unwrap() & HPET_TCNF_VAL_SET, 0);
		hpet.mmio_write(&vm, HPET_CONFIG, 4, HPET_CNF_ENABLE).unwrap();
		thread::sleep(Duration::from_millis(20));
		let comp = hpet.mmio_read(&vm, 0x108, 4).unwrap() as u32;
		assert!(comp > 16_777);
		assert_eq!(comp % 16_777, 0);
	}

	#[test]
	fn raises_wait_for_the_unlock() {
		let mut state = HpetState::new();
		let mut raises = Vec::new();
		let level_on_21 = (21 << 9) | HPET_TCNF_INT_ENB | HPET_TCNF_INT_TYPE;
		state.update_timer_config(1, level_on_21, 0xffff_ffff, &mut raises);
		assert!(raises.is_empty());

		state.timer_interrupt(1, &mut raises);
		// Still latched, so a second expiry adds nothing.
		state.timer_interrupt(1, &mut raises);
		assert!(matches!(
			raises[..],
			[Raise::Pin { timer: 1, pin: 21, op: IrqOp::Assert }]
		));
		assert_eq!(state.isr, 0b10);

		// Rerouting drops the latched level on the old pin.
		state.update_timer_config(1, HPET_TCNF_INT_ENB, 0xffff_ffff, &mut raises);
		assert!(matches!(
			raises[1],
			Raise::Pin { timer: 1, pin: 21, op: IrqOp::Deassert }
		));
		assert_eq!(state.isr, 0);
	}
}
