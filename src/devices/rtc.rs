//! MC146818 real-time clock and CMOS NVRAM behind ports 0x70/0x71.
//!
//! The date registers are not stored while the clock runs. The clock is
//! kept as seconds since the epoch at an `Instant`, and the registers are
//! regenerated in the guest-selected format (BCD or binary, 12 or 24 hour)
//! whenever they are read. While the guest holds the SET bit the registers
//! are plain storage and are parsed back into a time when it is released.

use std::{
	sync::{Arc, Mutex, Weak},
	time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use super::{IrqOp, isa_irq};
use crate::{
	callout::{CalloutId, Callouts, Ticket},
	error::{LockExt, Result, VmmError},
	inout::{self, PortFlags},
	vm::Vm,
};

const IO_RTC: u16 = 0x70;
const RTC_IRQ: u8 = 8;

pub const RTC_SEC: u8 = 0x00;
const RTC_SEC_ALARM: u8 = 0x01;
pub const RTC_MIN: u8 = 0x02;
const RTC_MIN_ALARM: u8 = 0x03;
pub const RTC_HOUR: u8 = 0x04;
const RTC_HOUR_ALARM: u8 = 0x05;
const RTC_WDAY: u8 = 0x06;
pub const RTC_DAY: u8 = 0x07;
pub const RTC_MONTH: u8 = 0x08;
pub const RTC_YEAR: u8 = 0x09;
pub const RTC_STATUSA: u8 = 0x0a;
pub const RTC_STATUSB: u8 = 0x0b;
pub const RTC_INTR: u8 = 0x0c;
pub const RTC_STATUSD: u8 = 0x0d;
const RTC_NVRAM_START: u8 = 0x0e;
pub const RTC_CENTURY: u8 = 0x32;
const RTC_SIZE: usize = 128;

/// Memory between 16 MiB and 4 GiB, in 64 KiB units.
const RTC_LMEM_LSB: u8 = 0x34;
const RTC_LMEM_MSB: u8 = 0x35;
/// Memory above 4 GiB, in 64 KiB units.
const RTC_HMEM_LSB: u8 = 0x5b;
const RTC_HMEM_SB: u8 = 0x5c;
const RTC_HMEM_MSB: u8 = 0x5d;

const RTCSA_DIVIDER: u8 = 0x70;
const RTCSA_DIVIDER_32K: u8 = 0x20;
const RTCSA_PRATE: u8 = 0x0f;

const RTCSB_HALT: u8 = 0x80;
const RTCSB_PINTR: u8 = 0x40;
const RTCSB_AINTR: u8 = 0x20;
const RTCSB_UINTR: u8 = 0x10;
const RTCSB_BIN: u8 = 0x04;
const RTCSB_24HR: u8 = 0x02;

const RTCIR_INT: u8 = 0x80;
const RTCIR_PERIOD: u8 = 0x40;
const RTCIR_ALARM: u8 = 0x20;
const RTCIR_UPDATE: u8 = 0x10;

const RTCSD_PWR: u8 = 0x80;

/// Alarm registers with both top bits set match any value.
const ALARM_DONT_CARE: u8 = 0xc0;

const MIB: u64 = 1 << 20;

/// Periodic interrupt period for each rate select value.
fn periodic_period(rate: u8) -> Option<Duration> {
	match rate & RTCSA_PRATE {
		0 => None,
		1 => Some(Duration::from_nanos(1_000_000_000 / 256)),
		2 => Some(Duration::from_nanos(1_000_000_000 / 128)),
		rate => Some(Duration::from_nanos(1_000_000_000 >> (16 - rate))),
	}
}

fn bin2bcd(val: u8) -> u8 {
	((val / 10) << 4) | (val % 10)
}

fn bcd2bin(val: u8) -> Option<u8> {
	let (hi, lo) = (val >> 4, val & 0xf);
	(hi < 10 && lo < 10).then_some(hi * 10 + lo)
}

fn host_time(localtime: bool) -> i64 {
	let now = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| d.as_secs() as i64);
	if !localtime {
		return now;
	}
	// SAFETY: `tm` is plain old data and both pointers outlive the call.
	let mut tm: libc::tm = unsafe { std::mem::zeroed() };
	let t = now as libc::time_t;
	if unsafe { libc::localtime_r(&t, &mut tm) }.is_null() {
		warn!("RTC: cannot determine the local time zone, using UTC");
		return now;
	}
	now + tm.tm_gmtoff as i64
}

#[derive(Debug)]
struct RtcState {
	addr: u8,
	regs: [u8; RTC_SIZE],
	/// Clock value at `base_uptime`. None once the guest wrote a date that
	/// does not parse.
	base_rtctime: Option<i64>,
	base_uptime: Instant,
	/// Deadline of the next periodic/update callout.
	next_fire: Option<Instant>,
}

impl RtcState {
	fn new(time: i64) -> Self {
		let mut regs = [0; RTC_SIZE];
		regs[RTC_STATUSA as usize] = 0x26;
		regs[RTC_STATUSB as usize] = RTCSB_24HR;
		regs[RTC_STATUSD as usize] = RTCSD_PWR;
		let mut state = Self {
			addr: 0,
			regs,
			base_rtctime: Some(time),
			base_uptime: Instant::now(),
			next_fire: None,
		};
		state.secs_to_rtc(time);
		state
	}

	fn reg(&self, reg: u8) -> u8 {
		self.regs[reg as usize]
	}

	fn divider_enabled(&self) -> bool {
		self.reg(RTC_STATUSA) & RTCSA_DIVIDER == RTCSA_DIVIDER_32K
	}

	fn halted(&self) -> bool {
		self.reg(RTC_STATUSB) & RTCSB_HALT != 0
	}

	fn update_enabled(&self) -> bool {
		self.divider_enabled() && !self.halted()
	}

	fn pintr_enabled(&self) -> bool {
		self.reg(RTC_STATUSB) & RTCSB_PINTR != 0
	}

	fn aintr_enabled(&self) -> bool {
		self.reg(RTC_STATUSB) & RTCSB_AINTR != 0
	}

	fn uintr_enabled(&self) -> bool {
		self.reg(RTC_STATUSB) & RTCSB_UINTR != 0
	}

	/// The clock now, and the uptime it corresponds to on a whole second.
	fn curtime(&self) -> (Option<i64>, Instant) {
		let Some(base) = self.base_rtctime else {
			return (None, self.base_uptime);
		};
		if !self.update_enabled() {
			return (Some(base), self.base_uptime);
		}
		let secs = self.base_uptime.elapsed().as_secs();
		(
			Some(base + secs as i64),
			self.base_uptime + Duration::from_secs(secs),
		)
	}

	fn encode(&self, val: u8) -> u8 {
		if self.reg(RTC_STATUSB) & RTCSB_BIN != 0 {
			val
		} else {
			bin2bcd(val)
		}
	}

	fn decode(&self, val: u8) -> Option<u8> {
		if self.reg(RTC_STATUSB) & RTCSB_BIN != 0 {
			Some(val)
		} else {
			bcd2bin(val)
		}
	}

	fn secs_to_rtc(&mut self, secs: i64) {
		let Ok(dt) = OffsetDateTime::from_unix_timestamp(secs) else {
			warn!("RTC: time {secs} out of range");
			return;
		};
		let mut hour = dt.hour();
		let mut pm = 0;
		if self.reg(RTC_STATUSB) & RTCSB_24HR == 0 {
			if hour >= 12 {
				pm = 0x80;
				hour -= 12;
			}
			if hour == 0 {
				hour = 12;
			}
		}
		let year = dt.year().clamp(0, 9999) as u32;
		let values = [
			(RTC_SEC, dt.second()),
			(RTC_MIN, dt.minute()),
			(RTC_WDAY, dt.weekday().number_from_sunday()),
			(RTC_DAY, dt.day()),
			(RTC_MONTH, u8::from(dt.month())),
			(RTC_YEAR, (year % 100) as u8),
			(RTC_CENTURY, (year / 100) as u8),
		];
		for (reg, val) in values {
			self.regs[reg as usize] = self.encode(val);
		}
		self.regs[RTC_HOUR as usize] = self.encode(hour) | pm;
	}

	fn rtc_to_secs(&self) -> Option<i64> {
		let sec = self.decode(self.reg(RTC_SEC))?;
		let min = self.decode(self.reg(RTC_MIN))?;
		let raw_hour = self.reg(RTC_HOUR);
		let mut hour;
		if self.reg(RTC_STATUSB) & RTCSB_24HR != 0 {
			hour = self.decode(raw_hour)?;
		} else {
			hour = self.decode(raw_hour & 0x7f)?;
			if !(1..=12).contains(&hour) {
				return None;
			}
			if hour == 12 {
				hour = 0;
			}
			if raw_hour & 0x80 != 0 {
				hour += 12;
			}
		}
		let day = self.decode(self.reg(RTC_DAY))?;
		let month = Month::try_from(self.decode(self.reg(RTC_MONTH))?).ok()?;
		let year = self.decode(self.reg(RTC_YEAR))? as i32;
		let century = self.decode(self.reg(RTC_CENTURY))? as i32;
		let date = Date::from_calendar_date(century * 100 + year, month, day).ok()?;
		let time = Time::from_hms(hour, min, sec).ok()?;
		Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
	}

	fn alarm_matches(&self) -> bool {
		[
			(RTC_SEC_ALARM, RTC_SEC),
			(RTC_MIN_ALARM, RTC_MIN),
			(RTC_HOUR_ALARM, RTC_HOUR),
		]
		.iter()
		.all(|&(alarm, reg)| {
			let alarm = self.reg(alarm);
			alarm & ALARM_DONT_CARE == ALARM_DONT_CARE || alarm == self.reg(reg)
		})
	}

	fn set_reg_c(&mut self, vm: &Vm, newval: u8) {
		let newval = newval & (RTCIR_ALARM | RTCIR_PERIOD | RTCIR_UPDATE);
		let old_irqf = self.reg(RTC_INTR) & RTCIR_INT;
		let new_irqf = if (self.aintr_enabled() && newval & RTCIR_ALARM != 0)
			|| (self.pintr_enabled() && newval & RTCIR_PERIOD != 0)
			|| (self.uintr_enabled() && newval & RTCIR_UPDATE != 0)
		{
			RTCIR_INT
		} else {
			0
		};
		self.regs[RTC_INTR as usize] = new_irqf | newval;
		if old_irqf == 0 && new_irqf != 0 {
			trace!("RTC: IRQ {RTC_IRQ} asserted, reg_c {:#x}", newval);
			if let Err(err) = isa_irq(vm, RTC_IRQ, Some(RTC_IRQ), IrqOp::Pulse) {
				warn!("RTC: IRQ delivery failed: {err}");
			}
		}
	}

	/// Moves the clock to `newtime` at `newbase` and raises alarm and
	/// update interrupts for the seconds that passed.
	fn time_update(&mut self, vm: &Vm, newtime: Option<i64>, newbase: Instant) {
		let oldtime = self.base_rtctime;
		self.base_rtctime = newtime;
		self.base_uptime = newbase;
		let Some(newtime) = newtime else {
			return;
		};
		if !self.update_enabled() || oldtime == Some(newtime) {
			return;
		}

		if self.aintr_enabled() {
			// Only the last day can matter for an hour:minute:second alarm.
			let first = oldtime
				.map_or(newtime, |old| (old + 1).max(newtime - 86_400))
				.min(newtime);
			for secs in first..=newtime {
				self.secs_to_rtc(secs);
				if self.alarm_matches() {
					let reg_c = self.reg(RTC_INTR);
					self.set_reg_c(vm, reg_c | RTCIR_ALARM);
					break;
				}
			}
		}
		if self.uintr_enabled() {
			let reg_c = self.reg(RTC_INTR);
			self.set_reg_c(vm, reg_c | RTCIR_UPDATE);
		}
	}

	/// Callout period: periodic interrupts win over the 1 Hz alarm/update
	/// tick.
	fn callout_period(&self) -> Option<Duration> {
		if self.pintr_enabled() && self.divider_enabled() {
			periodic_period(self.reg(RTC_STATUSA))
		} else if (self.aintr_enabled() || self.uintr_enabled()) && self.update_enabled() {
			Some(Duration::from_secs(1))
		} else {
			None
		}
	}
}

#[derive(Debug)]
pub struct Rtc {
	callout: CalloutId,
	localtime: bool,
	state: Mutex<RtcState>,
}

impl Rtc {
	pub fn new(vm: &Weak<Vm>, callouts: &Callouts, localtime: bool) -> Self {
		let weak = vm.clone();
		let callout = callouts.register(Arc::new(move |ticket| {
			if let Some(vm) = weak.upgrade() {
				vm.rtc().expired(&vm, ticket);
			}
		}));
		Self {
			callout,
			localtime,
			state: Mutex::new(RtcState::new(host_time(localtime))),
		}
	}

	/// Stops interrupts and reloads the host clock. NVRAM survives.
	pub fn reset(&self, vm: &Vm) {
		vm.callouts().stop(self.callout);
		let mut state = self.state.locked();
		state.next_fire = None;
		state.regs[RTC_STATUSB as usize] &= !(RTCSB_PINTR | RTCSB_AINTR | RTCSB_UINTR);
		state.regs[RTC_INTR as usize] = 0;
		let now = host_time(self.localtime);
		state.base_rtctime = Some(now);
		state.base_uptime = Instant::now();
		state.secs_to_rtc(now);
	}

	/// Records the guest memory layout where firmware looks for it.
	pub fn set_memory_sizes(&self, lowmem: u64, highmem: u64) -> Result<()> {
		let lomem = (lowmem.saturating_sub(16 * MIB) / (64 * 1024)) as u16;
		self.nvram_write(RTC_LMEM_LSB, lomem as u8)?;
		self.nvram_write(RTC_LMEM_MSB, (lomem >> 8) as u8)?;
		let himem = highmem / (64 * 1024);
		self.nvram_write(RTC_HMEM_LSB, himem as u8)?;
		self.nvram_write(RTC_HMEM_SB, (himem >> 8) as u8)?;
		self.nvram_write(RTC_HMEM_MSB, (himem >> 16) as u8)
	}

	fn check_nvram(offset: u8) -> Result<()> {
		if offset < RTC_NVRAM_START || offset == RTC_CENTURY || offset as usize >= RTC_SIZE {
			return Err(VmmError::InvalidArgument(format!("CMOS offset {offset:#x}")));
		}
		Ok(())
	}

	pub fn nvram_write(&self, offset: u8, value: u8) -> Result<()> {
		Self::check_nvram(offset)?;
		self.state.locked().regs[offset as usize] = value;
		Ok(())
	}

	pub fn nvram_read(&self, offset: u8) -> Result<u8> {
		Self::check_nvram(offset)?;
		Ok(self.state.locked().regs[offset as usize])
	}

	/// Seconds since the epoch as the guest sees them.
	pub fn time(&self) -> Option<i64> {
		self.state.locked().curtime().0
	}

	pub fn set_time(&self, vm: &Vm, secs: i64) {
		let mut state = self.state.locked();
		state.time_update(vm, Some(secs), Instant::now());
		state.secs_to_rtc(secs);
	}

	fn expired(&self, vm: &Vm, ticket: Ticket) {
		let mut state = self.state.locked();
		if !vm.callouts().is_current(ticket) {
			return;
		}
		if state.pintr_enabled() {
			let reg_c = state.reg(RTC_INTR);
			state.set_reg_c(vm, reg_c | RTCIR_PERIOD);
		}
		if state.aintr_enabled() || state.uintr_enabled() {
			let (time, base) = state.curtime();
			state.time_update(vm, time, base);
		}
		self.rearm(vm, &mut state, false);
	}

	/// Re-evaluates the callout after a register change or a fire.
	fn rearm(&self, vm: &Vm, state: &mut RtcState, restart: bool) {
		let Some(period) = state.callout_period() else {
			if state.next_fire.take().is_some() {
				vm.callouts().stop(self.callout);
			}
			return;
		};
		let now = Instant::now();
		let mut fire = match state.next_fire {
			Some(fire) if !restart => fire + period,
			_ => now + period,
		};
		if fire < now {
			trace!("RTC: callout lagging, resetting time base");
			fire = now + period;
		}
		state.next_fire = Some(fire);
		vm.callouts().reset(self.callout, fire);
	}

	fn set_reg_a(&self, vm: &Vm, state: &mut RtcState, newval: u8) {
		let newval = newval & 0x7f;
		let oldval = state.reg(RTC_STATUSA);
		if oldval == newval {
			return;
		}
		// Stopping the divider freezes the clock; restarting it resumes.
		if state.divider_enabled() != (newval & RTCSA_DIVIDER == RTCSA_DIVIDER_32K) {
			let (time, base) = state.curtime();
			state.regs[RTC_STATUSA as usize] = newval;
			state.time_update(vm, time, if state.divider_enabled() { Instant::now() } else { base });
		} else {
			state.regs[RTC_STATUSA as usize] = newval;
		}
		debug!("RTC: reg_a {oldval:#x} -> {newval:#x}");
		self.rearm(vm, state, true);
	}

	fn set_reg_b(&self, vm: &Vm, state: &mut RtcState, mut newval: u8) {
		let oldval = state.reg(RTC_STATUSB);
		let changed = oldval ^ newval;
		if changed & RTCSB_HALT != 0 {
			if newval & RTCSB_HALT == 0 {
				state.regs[RTC_STATUSB as usize] = newval;
				let time = state.rtc_to_secs();
				if time.is_none() {
					warn!("RTC: guest set an invalid date");
				}
				state.time_update(vm, time, Instant::now());
			} else {
				let (time, base) = state.curtime();
				if let Some(time) = time {
					state.secs_to_rtc(time);
				}
				newval &= !RTCSB_UINTR;
				state.regs[RTC_STATUSB as usize] = newval;
				state.time_update(vm, time, base);
			}
		}
		state.regs[RTC_STATUSB as usize] = newval;
		if changed != 0 {
			debug!("RTC: reg_b {oldval:#x} -> {newval:#x}");
		}
		// Enabling an interrupt whose flag is already set raises it.
		let reg_c = state.reg(RTC_INTR);
		state.set_reg_c(vm, reg_c);
		if changed & (RTCSB_PINTR | RTCSB_AINTR | RTCSB_UINTR | RTCSB_HALT) != 0 {
			self.rearm(vm, state, true);
		}
	}

	fn data_read(&self, vm: &Vm) -> u8 {
		let mut state = self.state.locked();
		let addr = state.addr;
		if addr <= RTC_YEAR || addr == RTC_CENTURY {
			if !state.halted()
				&& let (Some(time), _) = state.curtime()
			{
				state.secs_to_rtc(time);
			}
			return state.reg(addr);
		}
		if addr == RTC_INTR {
			let val = state.reg(RTC_INTR);
			state.set_reg_c(vm, 0);
			return val;
		}
		state.reg(addr)
	}

	fn data_write(&self, vm: &Vm, val: u8) {
		let mut state = self.state.locked();
		let addr = state.addr;
		match addr {
			RTC_STATUSA => self.set_reg_a(vm, &mut state, val),
			RTC_STATUSB => self.set_reg_b(vm, &mut state, val),
			RTC_INTR | RTC_STATUSD => {
				trace!("RTC: write to read-only register {addr:#x} ignored");
			}
			_ => {
				if addr <= RTC_YEAR && !state.halted() {
					debug!("RTC: time register {addr:#x} written while running");
				}
				// The top bit of the seconds register is read-only.
				state.regs[addr as usize] = if addr == RTC_SEC { val & 0x7f } else { val };
				// Some guests update the century without halting the clock.
				if addr == RTC_CENTURY && !state.halted() {
					let time = state.rtc_to_secs();
					state.time_update(vm, time, Instant::now());
				}
			}
		}
	}
}

pub fn register_ports(vm: &Vm) -> Result<()> {
	vm.inout().register(
		"RTC",
		IO_RTC,
		2,
		PortFlags::INOUT,
		inout::handler(|vm, _, is_in, port, bytes, eax| {
			if bytes != 1 {
				return Err(VmmError::UnhandledPort { port, bytes, is_in });
			}
			let rtc = vm.rtc();
			match (port - IO_RTC, is_in) {
				// The index register is write-only.
				(0, true) => *eax = 0xff,
				(0, false) => rtc.state.locked().addr = *eax as u8 & 0x7f,
				(_, true) => *eax = rtc.data_read(vm) as u32,
				(_, false) => rtc.data_write(vm, *eax as u8),
			}
			Ok(())
		}),
	)
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;
	use crate::{vm::VmConfig, vmx::mock::MockBackend};

	fn vm() -> Arc<Vm> {
		let vm = Vm::create(
			Arc::new(MockBackend::new()),
			VmConfig {
				rtc_localtime: false,
				..Default::default()
			},
		)
		.unwrap();
		vm.activate_cpu(0).unwrap();
		vm
	}

	fn write(vm: &Vm, reg: u8, val: u8) {
		let mut eax = reg as u32;
		vm.inout().dispatch(vm, 0, false, 0x70, 1, &mut eax).unwrap();
		let mut eax = val as u32;
		vm.inout().dispatch(vm, 0, false, 0x71, 1, &mut eax).unwrap();
	}

	fn read(vm: &Vm, reg: u8) -> u8 {
		let mut eax = reg as u32;
		vm.inout().dispatch(vm, 0, false, 0x70, 1, &mut eax).unwrap();
		vm.inout().dispatch(vm, 0, true, 0x71, 1, &mut eax).unwrap();
		eax as u8
	}

	#[test]
	fn bcd_conversion() {
		assert_eq!(bin2bcd(59), 0x59);
		assert_eq!(bcd2bin(0x42), Some(42));
		assert_eq!(bcd2bin(0x4a), None);
	}

	#[test]
	fn set_time_through_halt() {
		let vm = vm();
		write(&vm, RTC_STATUSB, RTCSB_HALT | RTCSB_24HR);
		write(&vm, RTC_SEC, 0x30);
		write(&vm, RTC_MIN, 0x15);
		write(&vm, RTC_HOUR, 0x13);
		write(&vm, RTC_DAY, 0x29);
		write(&vm, RTC_MONTH, 0x02);
		write(&vm, RTC_YEAR, 0x24);
		write(&vm, RTC_CENTURY, 0x20);
		write(&vm, RTC_STATUSB, RTCSB_24HR);
		// 2024-02-29 13:15:30 UTC
		let time = vm.rtc().time().unwrap();
		assert!((1_709_212_530..1_709_212_533).contains(&time));
		assert_eq!(read(&vm, RTC_HOUR), 0x13);
		assert_eq!(read(&vm, RTC_MONTH), 0x02);
		assert_eq!(read(&vm, RTC_WDAY), 5);
	}

	#[test]
	fn binary_twelve_hour_format() {
		let vm = vm();
		vm.rtc().set_time(&vm, 1_709_212_530);
		write(&vm, RTC_STATUSB, RTCSB_BIN);
		assert_eq!(read(&vm, RTC_HOUR), 0x80 | 1);
		assert_eq!(read(&vm, RTC_YEAR), 24);
	}

	#[test]
	fn invalid_date_is_broken_time() {
		let vm = vm();
		write(&vm, RTC_STATUSB, RTCSB_HALT | RTCSB_24HR);
		write(&vm, RTC_MONTH, 0x13);
		write(&vm, RTC_STATUSB, RTCSB_24HR);
		assert_eq!(vm.rtc().time(), None);
	}

	#[test]
	fn nvram_and_memory_sizes() {
		let vm = vm();
		write(&vm, 0x40, 0xab);
		assert_eq!(read(&vm, 0x40), 0xab);
		vm.rtc().set_memory_sizes(3 << 30, 1 << 32).unwrap();
		assert_eq!(vm.rtc().nvram_read(RTC_LMEM_LSB).unwrap(), 0x00);
		assert_eq!(vm.rtc().nvram_read(RTC_LMEM_MSB).unwrap(), 0xbf);
		assert_eq!(vm.rtc().nvram_read(RTC_HMEM_SB).unwrap(), 0x00);
		assert_eq!(vm.rtc().nvram_read(RTC_HMEM_MSB).unwrap(), 0x01);
		assert!(vm.rtc().nvram_write(RTC_CENTURY, 0).is_err());
		assert!(vm.rtc().nvram_write(RTC_SEC, 0).is_err());
	}

	#[test]
	fn periodic_interrupt_sets_flag() {
		let vm = vm();
		// 1024 Hz
		write(&vm, RTC_STATUSA, 0x26);
		write(&vm, RTC_STATUSB, RTCSB_24HR | RTCSB_PINTR);
		thread::sleep(Duration::from_millis(20));
		let reg_c = read(&vm, RTC_INTR);
		assert_eq!(reg_c & (RTCIR_INT | RTCIR_PERIOD), RTCIR_INT | RTCIR_PERIOD);
		write(&vm, RTC_STATUSB, RTCSB_24HR);
		read(&vm, RTC_INTR);
		thread::sleep(Duration::from_millis(10));
		assert_eq!(read(&vm, RTC_INTR), 0);
	}
}
