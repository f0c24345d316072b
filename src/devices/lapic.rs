//! Local APIC: register file in xAPIC and x2APIC layout, interrupt
//! acceptance and priority, inter-processor interrupts and the timer.
//!
//! Register handlers only mutate the APIC's own state. Everything that has
//! to touch another vCPU, another device or a vCPU slot is collected as a
//! [`Post`] and carried out after the APIC lock has been released.

use std::{
	fmt,
	sync::{Arc, Mutex, Weak},
	time::{Duration, Instant},
};

use crate::{
	callout::{CalloutId, Callouts, Ticket},
	consts::*,
	cpuset::CpuSet,
	error::{Fault, LockExt, Result, VmmError},
	vm::{Vm, X2apicState},
	vmx::ExitKind,
};

/// Frequency the timer counts at before the divider.
const BUS_FREQ: u64 = 128 * 1024 * 1024;
const VERSION: u32 = 0x14;
const MAXLVT_INDEX: u32 = 6;
/// One slot per priority class plus the empty placeholder.
const ISRVEC_STK_SIZE: usize = 16 + 1;

const APICBASE_BSP: u64 = 0x100;
const APICBASE_X2APIC: u64 = 0x400;
const APICBASE_ENABLED: u64 = 0x800;

/// Register offsets in the xAPIC page. x2APIC MSR `0x800 + n` maps to
/// offset `n << 4`.
mod off {
	pub const ID: u64 = 0x20;
	pub const VER: u64 = 0x30;
	pub const TPR: u64 = 0x80;
	pub const APR: u64 = 0x90;
	pub const PPR: u64 = 0xa0;
	pub const EOI: u64 = 0xb0;
	pub const LDR: u64 = 0xd0;
	pub const DFR: u64 = 0xe0;
	pub const SVR: u64 = 0xf0;
	pub const ISR0: u64 = 0x100;
	pub const ISR7: u64 = 0x170;
	pub const TMR0: u64 = 0x180;
	pub const TMR7: u64 = 0x1f0;
	pub const IRR0: u64 = 0x200;
	pub const IRR7: u64 = 0x270;
	pub const ESR: u64 = 0x280;
	pub const LVT_CMCI: u64 = 0x2f0;
	pub const ICR_LO: u64 = 0x300;
	pub const ICR_HI: u64 = 0x310;
	pub const LVT_TIMER: u64 = 0x320;
	pub const LVT_THERMAL: u64 = 0x330;
	pub const LVT_PMC: u64 = 0x340;
	pub const LVT_LINT0: u64 = 0x350;
	pub const LVT_LINT1: u64 = 0x360;
	pub const LVT_ERROR: u64 = 0x370;
	pub const TIMER_ICR: u64 = 0x380;
	pub const TIMER_CCR: u64 = 0x390;
	pub const TIMER_DCR: u64 = 0x3e0;
	pub const SELF_IPI: u64 = 0x3f0;
}

const SVR_VECTOR: u32 = 0xff;
const SVR_ENABLE: u32 = 0x100;

const LVT_VECTOR: u32 = 0xff;
const LVT_DM: u32 = 0x700;
const LVT_DM_FIXED: u32 = 0x000;
const LVT_DM_NMI: u32 = 0x400;
const LVT_DM_EXTINT: u32 = 0x700;
const LVT_DS: u32 = 0x1000;
const LVT_IIPP: u32 = 0x2000;
const LVT_RIRR: u32 = 0x4000;
const LVT_TM: u32 = 0x8000;
const LVT_M: u32 = 0x10000;
const LVTT_TM: u32 = 0x60000;
const LVTT_TM_PERIODIC: u32 = 0x20000;

const ESR_SEND_ILLEGAL_VECTOR: u32 = 0x20;
const ESR_RECEIVE_ILLEGAL_VECTOR: u32 = 0x40;

const LDR_RESERVED: u32 = 0x00ff_ffff;
const DFR_MODEL_MASK: u32 = 0xf000_0000;
const DFR_MODEL_FLAT: u32 = 0xf000_0000;
const DFR_MODEL_CLUSTER: u32 = 0x0000_0000;
const DFR_RESERVED: u32 = 0x0fff_ffff;

const ICR_DELSTAT_PEND: u32 = 0x1000;
const ICR_DESTMODE_LOG: u64 = 0x800;
const ICR_LEVEL_ASSERT: u64 = 0x4000;
const ICR_DEST_MASK: u64 = 0xc0000;
const ICR_DEST_FIELD: u64 = 0x00000;
const ICR_DEST_SELF: u64 = 0x40000;
const ICR_DEST_ALL_INCL_SELF: u64 = 0x80000;

/// Delivery modes shared by the ICR, IOAPIC redirection entries and MSI data.
pub const DELMODE_MASK: u32 = 0x700;
pub const DELMODE_FIXED: u32 = 0x000;
pub const DELMODE_LOWPRIO: u32 = 0x100;
pub const DELMODE_SMI: u32 = 0x200;
pub const DELMODE_NMI: u32 = 0x400;
pub const DELMODE_INIT: u32 = 0x500;
pub const DELMODE_STARTUP: u32 = 0x600;
pub const DELMODE_EXTINT: u32 = 0x700;

const MSI_ADDR_MASK: u64 = 0xfff0_0000;
const MSI_ADDR_BASE: u64 = 0xfee0_0000;
const MSI_ADDR_RH: u64 = 0x8;
const MSI_ADDR_LOG: u64 = 0x4;

/// Local vector table entries, in the order of their slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lvt {
	Timer = 0,
	Thermal,
	Pmc,
	Lint0,
	Lint1,
	Error,
	Cmci,
}

impl Lvt {
	fn from_offset(offset: u64) -> Option<Self> {
		Some(match offset {
			off::LVT_TIMER => Lvt::Timer,
			off::LVT_THERMAL => Lvt::Thermal,
			off::LVT_PMC => Lvt::Pmc,
			off::LVT_LINT0 => Lvt::Lint0,
			off::LVT_LINT1 => Lvt::Lint1,
			off::LVT_ERROR => Lvt::Error,
			off::LVT_CMCI => Lvt::Cmci,
			_ => return None,
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootState {
	Running,
	/// AP waiting for INIT.
	Init,
	/// AP waiting for a startup IPI.
	Sipi,
}

/// Side effects collected under the APIC lock.
#[derive(Debug)]
enum Post {
	Notify,
	Nmi,
	ExtInt,
	Eoi(u8),
	Icr { icr: u64, x2apic: bool },
	SelfIpi(u8),
}

struct State {
	id: u32,
	tpr: u32,
	ppr: u32,
	ldr: u32,
	dfr: u32,
	svr: u32,
	svr_last: u32,
	isr: [u32; 8],
	tmr: [u32; 8],
	irr: [u32; 8],
	esr: u32,
	esr_pending: u32,
	lvt: [u32; 7],
	icr_lo: u32,
	icr_hi: u32,
	icr_timer: u32,
	dcr_timer: u32,
	/// In-service vectors, innermost last. Slot 0 is always 0.
	isrvec: Vec<u8>,
	apicbase: u64,
	boot: BootState,
	timer_freq: u64,
	timer_period: Duration,
	timer_fire: Option<Instant>,
}

fn prio(vector: u32) -> u32 {
	vector >> 4
}

fn x2apic_ldr(id: u32) -> u32 {
	((id >> 4) << 16) | (1 << (id & 0xf))
}

fn timer_divisor(dcr: u32) -> u64 {
	match dcr & 0xb {
		0x0 => 2,
		0x1 => 4,
		0x2 => 8,
		0x3 => 16,
		0x8 => 32,
		0x9 => 64,
		0xa => 128,
		_ => 1,
	}
}

/// Highest set bit across a 256-bit register, scanning from the top.
fn highest(reg: &[u32; 8]) -> Option<(usize, u32)> {
	reg.iter()
		.enumerate()
		.rev()
		.find(|(_, word)| **word != 0)
		.map(|(i, word)| (i, 31 - word.leading_zeros()))
}

impl State {
	fn new(vcpu: usize) -> Self {
		let mut apicbase = APIC_DEFAULT_BASE | APICBASE_ENABLED;
		if vcpu == BSP {
			apicbase |= APICBASE_BSP;
		}
		let mut state = Self {
			id: 0,
			tpr: 0,
			ppr: 0,
			ldr: 0,
			dfr: 0,
			svr: 0,
			svr_last: 0,
			isr: [0; 8],
			tmr: [0; 8],
			irr: [0; 8],
			esr: 0,
			esr_pending: 0,
			lvt: [0; 7],
			icr_lo: 0,
			icr_hi: 0,
			icr_timer: 0,
			dcr_timer: 0,
			isrvec: Vec::with_capacity(ISRVEC_STK_SIZE),
			apicbase,
			boot: BootState::Init,
			timer_freq: 0,
			timer_period: Duration::ZERO,
			timer_fire: None,
		};
		state.reset(vcpu);
		state
	}

	fn reset(&mut self, vcpu: usize) {
		let x2apic = self.x2apic();
		self.tpr = 0;
		self.ppr = 0;
		self.isr = [0; 8];
		self.tmr = [0; 8];
		self.irr = [0; 8];
		self.esr = 0;
		self.esr_pending = 0;
		self.icr_lo = 0;
		self.icr_hi = 0;
		self.icr_timer = 0;
		self.isrvec.clear();
		self.isrvec.push(0);
		self.id = if x2apic { vcpu as u32 } else { (vcpu as u32) << 24 };
		if x2apic {
			self.ldr = x2apic_ldr(vcpu as u32);
			self.dfr = 0;
		} else {
			self.ldr = 0;
			self.dfr = 0xffff_ffff;
		}
		self.svr = SVR_VECTOR;
		self.lvt = [LVT_M; 7];
		self.dcr_timer = 0;
		self.dcr_write();
		self.timer_fire = None;
		self.boot = if vcpu == BSP {
			BootState::Running
		} else {
			BootState::Init
		};
		self.svr_last = self.svr;
	}

	fn x2apic(&self) -> bool {
		self.apicbase & APICBASE_X2APIC != 0
	}

	fn enabled(&self) -> bool {
		self.apicbase & APICBASE_ENABLED != 0 && self.svr & SVR_ENABLE != 0
	}

	fn periodic(&self) -> bool {
		self.lvt[Lvt::Timer as usize] & LVTT_TM == LVTT_TM_PERIODIC
	}

	fn dcr_write(&mut self) {
		// A new divider only takes effect at the next reload of the count.
		self.timer_freq = BUS_FREQ / timer_divisor(self.dcr_timer);
		self.timer_period = self.period();
	}

	fn period(&self) -> Duration {
		let nanos = self.icr_timer as u128 * 1_000_000_000 / self.timer_freq as u128;
		Duration::from_nanos(nanos as u64)
	}

	fn update_ppr(&mut self) {
		let isrvec = self.isrvec.last().copied().unwrap_or(0) as u32;
		self.ppr = if prio(self.tpr) >= prio(isrvec) {
			self.tpr
		} else {
			isrvec & 0xf0
		};
	}

	fn set_tpr(&mut self, tpr: u32) {
		if self.tpr != tpr {
			self.tpr = tpr;
			self.update_ppr();
		}
	}

	fn set_intr_ready(&mut self, vector: u8, level: bool, posts: &mut Vec<Post>) {
		if self.svr & SVR_ENABLE == 0 {
			trace!("APIC software-disabled, dropping vector {vector:#x}");
			return;
		}
		if vector < 16 {
			self.set_error(ESR_RECEIVE_ILLEGAL_VECTOR, false, posts);
			return;
		}
		let (idx, mask) = (vector as usize / 32, 1u32 << (vector % 32));
		self.irr[idx] |= mask;
		if level {
			self.tmr[idx] |= mask;
		} else {
			self.tmr[idx] &= !mask;
		}
		posts.push(Post::Notify);
	}

	fn pending_intr(&self) -> Option<u8> {
		let (idx, bit) = highest(&self.irr)?;
		let vector = (idx as u32) * 32 + bit;
		(prio(vector) > prio(self.ppr)).then_some(vector as u8)
	}

	fn intr_accepted(&mut self, vector: u8) {
		let (idx, mask) = (vector as usize / 32, 1u32 << (vector % 32));
		self.irr[idx] &= !mask;
		self.isr[idx] |= mask;
		if self.isrvec.len() >= ISRVEC_STK_SIZE {
			error!("in-service vector stack overflow accepting {vector:#x}");
		} else {
			self.isrvec.push(vector);
		}
		self.update_ppr();
	}

	fn process_eoi(&mut self, posts: &mut Vec<Post>) {
		let Some((idx, bit)) = highest(&self.isr) else {
			trace!("EOI without an in-service vector");
			return;
		};
		if self.isrvec.len() <= 1 {
			error!("EOI with an empty in-service vector stack");
		} else {
			self.isrvec.pop();
		}
		self.isr[idx] &= !(1 << bit);
		self.update_ppr();
		let vector = (idx as u32 * 32 + bit) as u8;
		trace!("EOI vector {vector:#x}");
		if self.tmr[idx] & (1 << bit) != 0 {
			posts.push(Post::Eoi(vector));
		}
	}

	fn set_error(&mut self, mask: u32, lvt_error: bool, posts: &mut Vec<Post>) {
		self.esr_pending |= mask;
		// The error LVT itself may carry an illegal vector.
		if lvt_error {
			return;
		}
		self.fire_lvt(Lvt::Error, posts);
	}

	fn fire_lvt(&mut self, lvt: Lvt, posts: &mut Vec<Post>) -> bool {
		let val = self.lvt[lvt as usize];
		if val & LVT_M != 0 {
			return false;
		}
		let vector = (val & LVT_VECTOR) as u8;
		match val & LVT_DM {
			LVT_DM_FIXED => {
				if vector < 16 {
					self.set_error(ESR_SEND_ILLEGAL_VECTOR, lvt == Lvt::Error, posts);
					return false;
				}
				self.set_intr_ready(vector, false, posts);
			}
			LVT_DM_NMI => posts.push(Post::Nmi),
			LVT_DM_EXTINT => posts.push(Post::ExtInt),
			_ => return false,
		}
		true
	}

	fn mask_lvts(&mut self) {
		for lvt in self.lvt.iter_mut() {
			*lvt |= LVT_M;
		}
	}

	fn write_lvt(&mut self, lvt: Lvt, data: u32) {
		let mut val = data;
		if self.svr & SVR_ENABLE == 0 {
			val |= LVT_M;
		}
		let mut mask = LVT_M | LVT_DS | LVT_VECTOR;
		match lvt {
			Lvt::Timer => mask |= LVTT_TM,
			Lvt::Error => {}
			Lvt::Lint0 | Lvt::Lint1 => mask |= LVT_TM | LVT_RIRR | LVT_IIPP | LVT_DM,
			_ => mask |= LVT_DM,
		}
		self.lvt[lvt as usize] = val & mask;
	}
}

pub struct Lapic {
	id: usize,
	timer: CalloutId,
	state: Mutex<State>,
}

impl fmt::Debug for Lapic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.state.locked();
		f.debug_struct("Lapic")
			.field("id", &self.id)
			.field("apicbase", &format_args!("{:#x}", state.apicbase))
			.field("ppr", &format_args!("{:#x}", state.ppr))
			.field("boot", &state.boot)
			.finish_non_exhaustive()
	}
}

impl Lapic {
	pub fn new(id: usize, vm: &Weak<Vm>, callouts: &Callouts) -> Self {
		let weak = vm.clone();
		let timer = callouts.register(Arc::new(move |ticket| {
			if let Some(vm) = weak.upgrade()
				&& let Ok(lapic) = vm.lapic(id)
			{
				lapic.timer_expired(&vm, ticket);
			}
		}));
		Self {
			id,
			timer,
			state: Mutex::new(State::new(id)),
		}
	}

	pub fn id(&self) -> usize {
		self.id
	}

	pub fn reset(&self, vm: &Vm) {
		vm.callouts().stop(self.timer);
		self.state.locked().reset(self.id);
	}

	/// Switches between xAPIC and x2APIC mode. Only valid while the vCPU is
	/// being set up.
	pub fn set_x2apic_state(&self, state: X2apicState) {
		let mut st = self.state.locked();
		match state {
			X2apicState::Disabled => st.apicbase &= !APICBASE_X2APIC,
			X2apicState::Enabled => st.apicbase |= APICBASE_X2APIC,
		}
		let id = self.id as u32;
		if st.x2apic() {
			st.id = id;
			st.ldr = x2apic_ldr(id);
			st.dfr = 0;
		} else {
			st.id = id << 24;
			st.ldr = 0;
			st.dfr = 0xffff_ffff;
		}
	}

	pub fn is_x2apic(&self) -> bool {
		self.state.locked().x2apic()
	}

	/// Highest-priority vector that can be delivered right now.
	pub fn pending_intr(&self) -> Option<u8> {
		self.state.locked().pending_intr()
	}

	/// Moves `vector` from IRR to ISR once it has been injected.
	pub fn intr_accepted(&self, vector: u8) {
		self.state.locked().intr_accepted(vector);
	}

	pub fn cr8(&self) -> u64 {
		(self.state.locked().tpr >> 4) as u64
	}

	/// `val` must already be validated to fit in four bits.
	pub fn set_cr8(&self, val: u64) {
		self.state.locked().set_tpr(((val & 0xf) << 4) as u32);
	}

	/// Marks `vector` ready, as an edge or level triggered interrupt.
	pub fn set_intr(&self, vm: &Vm, vector: u8, level: bool) -> Result<()> {
		if vector < 16 {
			return Err(VmmError::InvalidArgument(format!(
				"vector {vector} cannot be delivered through the local APIC"
			)));
		}
		let mut posts = Vec::new();
		self.state
			.locked()
			.set_intr_ready(vector, level, &mut posts);
		self.post(vm, posts).map(drop)
	}

	/// Makes every vector edge triggered again.
	pub fn reset_tmr(&self) {
		self.state.locked().tmr = [0; 8];
	}

	/// Marks `vector` level triggered if an IOAPIC pin routed this way
	/// would reach this APIC.
	pub fn set_tmr_level(&self, vm: &Vm, dest: u32, phys: bool, delmode: u32, vector: u8) {
		// Level triggering only exists for fixed and lowest priority.
		if delmode != DELMODE_FIXED && delmode != DELMODE_LOWPRIO {
			trace!("vCPU {}: no TMR update for delivery mode {delmode:#x}", self.id);
			return;
		}
		let lowprio = delmode == DELMODE_LOWPRIO;
		if !calc_dest(vm, dest, phys, lowprio, false).contains(self.id) {
			return;
		}
		let (idx, mask) = (vector as usize / 32, 1u32 << (vector % 32));
		self.state.locked().tmr[idx] |= mask;
	}

	/// Fires a local vector table entry. With the APIC disabled LINT0 and
	/// LINT1 act as the INTR and NMI pins.
	pub fn trigger_lvt(&self, vm: &Vm, lvt: Lvt) -> Result<()> {
		let mut posts = Vec::new();
		{
			let mut st = self.state.locked();
			if !st.enabled() {
				match lvt {
					Lvt::Lint0 => posts.push(Post::ExtInt),
					Lvt::Lint1 => posts.push(Post::Nmi),
					_ => {}
				}
			} else {
				st.fire_lvt(lvt, &mut posts);
			}
		}
		self.post(vm, posts).map(drop)
	}

	/// Base of the xAPIC page.
	pub fn mmio_base(&self) -> Option<u64> {
		let st = self.state.locked();
		(st.apicbase & APICBASE_ENABLED != 0).then_some(st.apicbase & !0xfff)
	}

	pub fn read_mmio(&self, vm: &Vm, offset: u64, _size: u8) -> Result<u64> {
		if offset & 0xf != 0 {
			warn!("vCPU {}: misaligned local APIC read at offset {offset:#x}", self.id);
			return Ok(u32::MAX as u64);
		}
		let st = self.state.locked();
		if st.x2apic() {
			return Ok(0);
		}
		Ok(self.read(vm, &st, offset))
	}

	/// A write may start an AP, which is reported as the returned exit.
	pub fn write_mmio(&self, vm: &Vm, offset: u64, _size: u8, val: u64) -> Result<Option<ExitKind>> {
		if offset & 0xf != 0 {
			warn!("vCPU {}: misaligned local APIC write at offset {offset:#x} ignored", self.id);
			return Ok(None);
		}
		if self.is_x2apic() {
			return Ok(None);
		}
		self.write(vm, offset, val & 0xffff_ffff)
	}

	pub fn rdmsr(&self, vm: &Vm, msr: u32) -> Result<u64> {
		let st = self.state.locked();
		if msr == msr::IA32_APIC_BASE {
			return Ok(st.apicbase);
		}
		if !st.x2apic() {
			return Err(Fault::gp(0).into());
		}
		let offset = ((msr - msr::X2APIC_BASE) as u64) << 4;
		match offset {
			off::ICR_HI | off::DFR | off::EOI | off::SELF_IPI => Err(Fault::gp(0).into()),
			_ => Ok(self.read(vm, &st, offset)),
		}
	}

	pub fn wrmsr(&self, vm: &Vm, msr: u32, val: u64) -> Result<Option<ExitKind>> {
		if msr == msr::IA32_APIC_BASE {
			let cur = self.state.locked().apicbase;
			if val != cur {
				warn!(
					"vCPU {}: changing APIC base from {cur:#x} to {val:#x} is not supported",
					self.id
				);
				return Err(Fault::gp(0).into());
			}
			return Ok(None);
		}
		if !self.is_x2apic() {
			return Err(Fault::gp(0).into());
		}
		let offset = ((msr - msr::X2APIC_BASE) as u64) << 4;
		if offset == off::ICR_HI {
			return Err(Fault::gp(0).into());
		}
		self.write(vm, offset, val)
	}

	fn read(&self, vm: &Vm, st: &State, offset: u64) -> u64 {
		let val = match offset {
			off::ID => st.id,
			off::VER => VERSION | (MAXLVT_INDEX << 16),
			off::TPR => st.tpr,
			off::APR => 0,
			off::PPR => st.ppr,
			off::LDR => st.ldr,
			off::DFR => st.dfr,
			off::SVR => st.svr,
			off::ISR0..=off::ISR7 => st.isr[((offset - off::ISR0) >> 4) as usize],
			off::TMR0..=off::TMR7 => st.tmr[((offset - off::TMR0) >> 4) as usize],
			off::IRR0..=off::IRR7 => st.irr[((offset - off::IRR0) >> 4) as usize],
			off::ESR => st.esr,
			off::ICR_LO => {
				if st.x2apic() {
					return ((st.icr_hi as u64) << 32) | st.icr_lo as u64;
				}
				st.icr_lo
			}
			off::ICR_HI => st.icr_hi,
			off::TIMER_ICR => st.icr_timer,
			off::TIMER_CCR => self.ccr(vm, st),
			off::TIMER_DCR => st.dcr_timer,
			_ => match Lvt::from_offset(offset) {
				Some(lvt) => st.lvt[lvt as usize],
				None => 0,
			},
		};
		val as u64
	}

	fn write(&self, vm: &Vm, offset: u64, data: u64) -> Result<Option<ExitKind>> {
		let mut posts = Vec::new();
		{
			let mut st = self.state.locked();
			let data32 = data as u32;
			let x2apic = st.x2apic();
			trace!("vCPU {}: APIC write {offset:#x} <- {data:#x}", self.id);
			match offset {
				off::TPR => st.set_tpr(data32 & 0xff),
				off::EOI => st.process_eoi(&mut posts),
				off::LDR => {
					st.ldr = if x2apic {
						x2apic_ldr(self.id as u32)
					} else {
						data32 & !LDR_RESERVED
					};
				}
				off::DFR => {
					st.dfr = if x2apic {
						0
					} else {
						(data32 & DFR_MODEL_MASK) | DFR_RESERVED
					};
				}
				off::SVR => {
					st.svr = data32;
					self.svr_changed(vm, &mut st);
				}
				off::ICR_LO => {
					if x2apic {
						st.icr_hi = (data >> 32) as u32;
					}
					st.icr_lo = data32 & !ICR_DELSTAT_PEND;
					posts.push(Post::Icr {
						icr: ((st.icr_hi as u64) << 32) | st.icr_lo as u64,
						x2apic,
					});
				}
				off::ICR_HI => st.icr_hi = data32,
				off::TIMER_ICR => {
					st.icr_timer = data32;
					self.reload_timer(vm, &mut st);
				}
				off::TIMER_DCR => {
					st.dcr_timer = data32;
					st.dcr_write();
				}
				off::ESR => {
					st.esr = st.esr_pending;
					st.esr_pending = 0;
				}
				off::SELF_IPI if x2apic => posts.push(Post::SelfIpi(data as u8)),
				_ => match Lvt::from_offset(offset) {
					Some(lvt) => st.write_lvt(lvt, data32),
					None => trace!("vCPU {}: write to read-only APIC register {offset:#x}", self.id),
				},
			}
		}
		self.post(vm, posts)
	}

	fn svr_changed(&self, vm: &Vm, st: &mut State) {
		let changed = st.svr_last ^ st.svr;
		if changed & SVR_ENABLE != 0 {
			if st.svr & SVR_ENABLE == 0 {
				debug!("vCPU {}: APIC software-disabled", self.id);
				vm.callouts().stop(self.timer);
				st.mask_lvts();
			} else if st.periodic() {
				self.reload_timer(vm, st);
			}
		}
		st.svr_last = st.svr;
	}

	fn reload_timer(&self, vm: &Vm, st: &mut State) {
		st.timer_period = st.period();
		if st.icr_timer != 0 {
			let fire = Instant::now() + st.timer_period;
			st.timer_fire = Some(fire);
			vm.callouts().reset(self.timer, fire);
		} else {
			st.timer_fire = None;
			vm.callouts().stop(self.timer);
		}
	}

	fn ccr(&self, vm: &Vm, st: &State) -> u32 {
		let Some(fire) = st.timer_fire else {
			return 0;
		};
		if st.icr_timer == 0 || !vm.callouts().pending(self.timer) {
			return 0;
		}
		let remaining = fire.saturating_duration_since(Instant::now());
		let count = remaining.as_nanos() * st.timer_freq as u128 / 1_000_000_000;
		count.min(st.icr_timer as u128) as u32
	}

	fn timer_expired(&self, vm: &Vm, ticket: Ticket) {
		let mut posts = Vec::new();
		{
			let mut st = self.state.locked();
			if !vm.callouts().is_current(ticket) {
				return;
			}
			st.fire_lvt(Lvt::Timer, &mut posts);
			if st.periodic() && st.icr_timer != 0 {
				let now = Instant::now();
				let mut fire = st.timer_fire.unwrap_or(now);
				if now.saturating_duration_since(fire) >= st.timer_period {
					debug!(
						"vCPU {}: APIC timer lagging, resetting time base",
						self.id
					);
					fire = now;
				}
				fire += st.timer_period;
				st.timer_fire = Some(fire);
				vm.callouts().reset(self.timer, fire);
			} else {
				st.timer_fire = None;
			}
		}
		if let Err(err) = self.post(vm, posts) {
			warn!("vCPU {}: APIC timer delivery failed: {err}", self.id);
		}
	}

	fn post(&self, vm: &Vm, posts: Vec<Post>) -> Result<Option<ExitKind>> {
		let mut exit = None;
		for post in posts {
			match post {
				Post::Notify => vm.notify_event(self.id, true),
				Post::Nmi => vm.inject_nmi(self.id)?,
				Post::ExtInt => vm.inject_extint(self.id)?,
				Post::Eoi(vector) => vm.ioapic().process_eoi(vm, vector),
				Post::Icr { icr, x2apic } => {
					if let Some(kind) = self.send_ipi(vm, icr, x2apic)? {
						exit = Some(kind);
					}
				}
				Post::SelfIpi(vector) => {
					if let Err(err) = self.set_intr(vm, vector, false) {
						debug!("vCPU {}: self IPI dropped: {err}", self.id);
					}
				}
			}
		}
		Ok(exit)
	}

	fn send_ipi(&self, vm: &Vm, icr: u64, x2apic: bool) -> Result<Option<ExitKind>> {
		let dest = if x2apic {
			(icr >> 32) as u32
		} else {
			(icr >> 56) as u32
		};
		let vector = icr as u8;
		let mode = icr as u32 & DELMODE_MASK;

		if mode == DELMODE_FIXED && vector < 16 {
			let mut posts = Vec::new();
			self.state
				.locked()
				.set_error(ESR_SEND_ILLEGAL_VECTOR, false, &mut posts);
			return self.post(vm, posts);
		}

		match mode {
			DELMODE_FIXED | DELMODE_NMI => {
				let targets = match icr & ICR_DEST_MASK {
					ICR_DEST_FIELD => {
						calc_dest(vm, dest, icr & ICR_DESTMODE_LOG == 0, false, x2apic)
					}
					ICR_DEST_SELF => CpuSet::single(self.id),
					ICR_DEST_ALL_INCL_SELF => vm.active_cpus(),
					_ => vm.active_cpus().difference(CpuSet::single(self.id)),
				};
				for vcpu in targets.iter() {
					if mode == DELMODE_FIXED {
						vm.lapic(vcpu)?.set_intr(vm, vector, false)?;
					} else {
						vm.inject_nmi(vcpu)?;
					}
				}
			}
			DELMODE_INIT => {
				if icr & ICR_LEVEL_ASSERT == 0 {
					return Ok(None);
				}
				if let Some(target) = self.startup_target(vm, dest) {
					let mut st = target.state.locked();
					if st.boot == BootState::Init {
						st.boot = BootState::Sipi;
					}
				}
			}
			DELMODE_STARTUP => {
				if let Some(target) = self.startup_target(vm, dest) {
					let mut st = target.state.locked();
					if st.boot != BootState::Sipi {
						return Ok(None);
					}
					st.boot = BootState::Running;
					debug!("vCPU {}: starting vCPU {dest} at vector {vector:#x}", self.id);
					return Ok(Some(ExitKind::SpinupAp {
						vcpu: dest as usize,
						rip: (vector as u64) << PAGE_SHIFT,
					}));
				}
			}
			_ => debug!("vCPU {}: IPI delivery mode {mode:#x} ignored", self.id),
		}
		Ok(None)
	}

	/// Only the BSP brings up APs.
	fn startup_target<'a>(&self, vm: &'a Vm, dest: u32) -> Option<&'a Lapic> {
		if self.id != BSP || dest == 0 {
			return None;
		}
		vm.lapic(dest as usize).ok()
	}
}

/// Resolves an interrupt destination to a set of vCPUs.
pub fn calc_dest(vm: &Vm, dest: u32, phys: bool, lowprio: bool, x2apic_dest: bool) -> CpuSet {
	if (x2apic_dest && dest == u32::MAX) || (!x2apic_dest && dest == 0xff) {
		return vm.active_cpus();
	}
	if phys {
		let mut set = CpuSet::empty();
		if (dest as usize) < vm.ncpus() {
			set.insert(dest as usize);
		}
		return set;
	}

	let flat_ldest = dest & 0xff;
	let (cluster_id, cluster_ldest) = if x2apic_dest {
		(dest >> 16, dest & 0xffff)
	} else {
		((dest >> 4) & 0xf, dest & 0xf)
	};
	let mut set = CpuSet::empty();
	for vcpu in vm.active_cpus().iter() {
		let Ok(lapic) = vm.lapic(vcpu) else {
			continue;
		};
		let (dfr, ldr, x2apic) = {
			let st = lapic.state.locked();
			(st.dfr, st.ldr, st.x2apic())
		};
		let (ldest, mda) = match dfr & DFR_MODEL_MASK {
			DFR_MODEL_FLAT => (ldr >> 24, flat_ldest),
			DFR_MODEL_CLUSTER => {
				let (cluster, ldest) = if x2apic {
					(ldr >> 16, ldr & 0xffff)
				} else {
					(ldr >> 28, (ldr >> 24) & 0xf)
				};
				if cluster != cluster_id {
					continue;
				}
				(ldest, cluster_ldest)
			}
			_ => continue,
		};
		if mda & ldest != 0 {
			set.insert(vcpu);
			if lowprio {
				break;
			}
		}
	}
	set
}

/// Delivers an interrupt from the IOAPIC or an MSI. Their destinations are
/// always in xAPIC format.
pub fn deliver_intr(
	vm: &Vm,
	level: bool,
	dest: u32,
	phys: bool,
	delmode: u32,
	vector: u8,
) -> Result<()> {
	if !matches!(delmode, DELMODE_FIXED | DELMODE_LOWPRIO | DELMODE_EXTINT) {
		debug!("interrupt with delivery mode {delmode:#x} dropped");
		return Ok(());
	}
	let lowprio = delmode == DELMODE_LOWPRIO;
	for vcpu in calc_dest(vm, dest, phys, lowprio, false).iter() {
		if delmode == DELMODE_EXTINT {
			vm.inject_extint(vcpu)?;
		} else if let Err(err) = vm.lapic(vcpu)?.set_intr(vm, vector, level) {
			debug!("vCPU {vcpu}: {err}");
		}
	}
	Ok(())
}

/// Interprets an MSI address/data pair.
pub fn intr_msi(vm: &Vm, addr: u64, msg: u64) -> Result<()> {
	if addr & MSI_ADDR_MASK != MSI_ADDR_BASE {
		return Err(VmmError::InvalidArgument(format!(
			"MSI address {addr:#x} is outside the APIC window"
		)));
	}
	// MSI is always edge triggered. The destination is a physical APIC id
	// unless both redirection hint and logical mode are set.
	let dest = ((addr >> 12) & 0xff) as u32;
	let phys = addr & (MSI_ADDR_RH | MSI_ADDR_LOG) != (MSI_ADDR_RH | MSI_ADDR_LOG);
	let delmode = msg as u32 & DELMODE_MASK;
	trace!("MSI addr {addr:#x} msg {msg:#x}");
	deliver_intr(vm, false, dest, phys, delmode, msg as u8)
}

/// Triggers a local interrupt on one vCPU, or on every active one.
pub fn set_local_intr(vm: &Vm, vcpu: Option<usize>, lvt: Lvt) -> Result<()> {
	let targets = match vcpu {
		Some(id) => CpuSet::single(id),
		None => vm.active_cpus(),
	};
	for id in targets.iter() {
		vm.lapic(id)?.trigger_lvt(vm, lvt)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;
	use crate::{vm::VmConfig, vmx::mock::MockBackend};

	fn vm(ncpus: usize) -> Arc<Vm> {
		let vm = Vm::create(
			Arc::new(MockBackend::new()),
			VmConfig {
				ncpus,
				..Default::default()
			},
		)
		.unwrap();
		for id in 0..ncpus {
			vm.activate_cpu(id).unwrap();
		}
		vm
	}

	fn enable(vm: &Vm, lapic: &Lapic) {
		lapic
			.write_mmio(vm, off::SVR, 4, (SVR_ENABLE | SVR_VECTOR) as u64)
			.unwrap();
	}

	#[test]
	fn reset_state() {
		let vm = vm(2);
		let bsp = vm.lapic(0).unwrap();
		let ap = vm.lapic(1).unwrap();
		assert_eq!(bsp.read_mmio(&vm, off::ID, 4).unwrap(), 0);
		assert_eq!(ap.read_mmio(&vm, off::ID, 4).unwrap(), 1 << 24);
		assert_eq!(bsp.read_mmio(&vm, off::VER, 4).unwrap(), 0x0006_0014);
		assert_eq!(bsp.read_mmio(&vm, off::SVR, 4).unwrap(), 0xff);
		assert_eq!(bsp.read_mmio(&vm, off::DFR, 4).unwrap(), 0xffff_ffff);
		assert_ne!(bsp.read_mmio(&vm, off::LVT_LINT0, 4).unwrap() as u32 & LVT_M, 0);
		assert_eq!(bsp.rdmsr(&vm, msr::IA32_APIC_BASE).unwrap(), 0xfee0_0900);
		assert_eq!(ap.rdmsr(&vm, msr::IA32_APIC_BASE).unwrap(), 0xfee0_0800);
		assert_eq!(bsp.mmio_base(), Some(APIC_DEFAULT_BASE));
	}

	#[test]
	fn disabled_apic_drops_interrupts() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		lapic.set_intr(&vm, 0x40, false).unwrap();
		assert_eq!(lapic.pending_intr(), None);
		assert!(lapic.set_intr(&vm, 0x0e, false).is_err());
	}

	#[test]
	fn priority_and_eoi() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		enable(&vm, lapic);

		lapic.set_intr(&vm, 0x31, false).unwrap();
		assert_eq!(lapic.pending_intr(), Some(0x31));
		lapic.write_mmio(&vm, off::TPR, 4, 0x40).unwrap();
		assert_eq!(lapic.pending_intr(), None);
		assert_eq!(lapic.cr8(), 4);
		lapic.set_cr8(0);

		lapic.intr_accepted(0x31);
		assert_eq!(lapic.read_mmio(&vm, off::PPR, 4).unwrap(), 0x30);
		assert_eq!(lapic.read_mmio(&vm, off::ISR0 + 0x10, 4).unwrap(), 1 << 0x11);

		// Same priority class as the one in service.
		lapic.set_intr(&vm, 0x32, false).unwrap();
		assert_eq!(lapic.pending_intr(), None);
		lapic.set_intr(&vm, 0x41, true).unwrap();
		assert_eq!(lapic.pending_intr(), Some(0x41));
		assert_eq!(lapic.read_mmio(&vm, off::TMR0 + 0x20, 4).unwrap(), 1 << 1);

		lapic.write_mmio(&vm, off::EOI, 4, 0).unwrap();
		assert_eq!(lapic.read_mmio(&vm, off::PPR, 4).unwrap(), 0);
		assert_eq!(lapic.read_mmio(&vm, off::ISR0 + 0x10, 4).unwrap(), 0);
		assert_eq!(lapic.pending_intr(), Some(0x41));
	}

	#[test]
	fn self_ipi_shorthand() {
		let vm = vm(2);
		let lapic = vm.lapic(0).unwrap();
		enable(&vm, lapic);
		enable(&vm, vm.lapic(1).unwrap());
		lapic
			.write_mmio(&vm, off::ICR_LO, 4, ICR_DEST_SELF | 0x50)
			.unwrap();
		assert_eq!(lapic.pending_intr(), Some(0x50));
		assert_eq!(vm.lapic(1).unwrap().pending_intr(), None);

		lapic
			.write_mmio(&vm, off::ICR_LO, 4, 0xc0000 | 0x60)
			.unwrap();
		assert_eq!(vm.lapic(1).unwrap().pending_intr(), Some(0x60));
	}

	#[test]
	fn illegal_ipi_vector_sets_esr() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		enable(&vm, lapic);
		lapic
			.write_mmio(&vm, off::ICR_LO, 4, ICR_DEST_SELF | 0x05)
			.unwrap();
		assert_eq!(lapic.read_mmio(&vm, off::ESR, 4).unwrap(), 0);
		lapic.write_mmio(&vm, off::ESR, 4, 0).unwrap();
		assert_eq!(
			lapic.read_mmio(&vm, off::ESR, 4).unwrap(),
			ESR_SEND_ILLEGAL_VECTOR as u64
		);
	}

	#[test]
	fn init_sipi_starts_ap_once() {
		let vm = vm(2);
		let bsp = vm.lapic(0).unwrap();
		bsp.write_mmio(&vm, off::ICR_HI, 4, 1 << 24).unwrap();

		// SIPI before INIT is ignored.
		assert_eq!(bsp.write_mmio(&vm, off::ICR_LO, 4, 0x4609f).unwrap(), None);
		assert_eq!(bsp.write_mmio(&vm, off::ICR_LO, 4, 0x4500).unwrap(), None);
		assert_eq!(
			bsp.write_mmio(&vm, off::ICR_LO, 4, 0x4609f).unwrap(),
			Some(ExitKind::SpinupAp {
				vcpu: 1,
				rip: 0x9f000
			})
		);
		assert_eq!(bsp.write_mmio(&vm, off::ICR_LO, 4, 0x4609f).unwrap(), None);
	}

	#[test]
	fn ap_cannot_start_others() {
		let vm = vm(3);
		let ap = vm.lapic(1).unwrap();
		ap.write_mmio(&vm, off::ICR_HI, 4, 2 << 24).unwrap();
		ap.write_mmio(&vm, off::ICR_LO, 4, 0x4500).unwrap();
		assert_eq!(ap.write_mmio(&vm, off::ICR_LO, 4, 0x46010).unwrap(), None);
	}

	#[test]
	fn one_shot_timer_fires() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		enable(&vm, lapic);
		lapic.write_mmio(&vm, off::TIMER_DCR, 4, 0xb).unwrap();
		lapic.write_mmio(&vm, off::LVT_TIMER, 4, 0x70).unwrap();
		lapic.write_mmio(&vm, off::TIMER_ICR, 4, 1000).unwrap();
		let deadline = Instant::now() + Duration::from_secs(2);
		while lapic.pending_intr().is_none() && Instant::now() < deadline {
			thread::sleep(Duration::from_millis(1));
		}
		assert_eq!(lapic.pending_intr(), Some(0x70));
		assert_eq!(lapic.read_mmio(&vm, off::TIMER_CCR, 4).unwrap(), 0);
	}

	#[test]
	fn current_count_runs_down() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		enable(&vm, lapic);
		lapic.write_mmio(&vm, off::TIMER_DCR, 4, 0xb).unwrap();
		lapic.write_mmio(&vm, off::TIMER_ICR, 4, 0xffff_ffff).unwrap();
		let ccr = lapic.read_mmio(&vm, off::TIMER_CCR, 4).unwrap();
		assert!(ccr > 0 && ccr <= 0xffff_ffff);
		lapic.write_mmio(&vm, off::TIMER_ICR, 4, 0).unwrap();
		assert_eq!(lapic.read_mmio(&vm, off::TIMER_CCR, 4).unwrap(), 0);
	}

	#[test]
	fn software_disable_masks_lvts() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		enable(&vm, lapic);
		lapic.write_mmio(&vm, off::LVT_LINT0, 4, 0x700).unwrap();
		assert_eq!(lapic.read_mmio(&vm, off::LVT_LINT0, 4).unwrap(), 0x700);
		lapic.write_mmio(&vm, off::SVR, 4, 0xff).unwrap();
		assert_eq!(lapic.read_mmio(&vm, off::LVT_LINT0, 4).unwrap(), 0x10700);
	}

	#[test]
	fn x2apic_msrs() {
		let vm = vm(2);
		let lapic = vm.lapic(1).unwrap();
		let err = lapic.rdmsr(&vm, 0x802).unwrap_err();
		assert!(matches!(err, VmmError::GuestFault(f) if f.vector == IDT_GP));

		lapic.set_x2apic_state(X2apicState::Enabled);
		assert_eq!(lapic.rdmsr(&vm, 0x802).unwrap(), 1);
		assert_eq!(lapic.rdmsr(&vm, 0x80d).unwrap(), (1 << 1) as u64);
		assert!(lapic.rdmsr(&vm, 0x831).is_err());
		// MMIO is dead in x2APIC mode.
		assert_eq!(lapic.read_mmio(&vm, off::ID, 4).unwrap(), 0);

		lapic.wrmsr(&vm, 0x80f, 0x1ff).unwrap();
		lapic.wrmsr(&vm, 0x83f, 0x45).unwrap();
		assert_eq!(lapic.pending_intr(), Some(0x45));
	}

	#[test]
	fn apic_base_is_fixed() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		assert!(lapic.wrmsr(&vm, msr::IA32_APIC_BASE, 0xfee0_0900).is_ok());
		assert!(lapic.wrmsr(&vm, msr::IA32_APIC_BASE, 0xfed0_0900).is_err());
	}

	#[test]
	fn msi_delivery() {
		let vm = vm(2);
		enable(&vm, vm.lapic(1).unwrap());
		intr_msi(&vm, 0xfee0_1000, 0x4a).unwrap();
		assert_eq!(vm.lapic(1).unwrap().pending_intr(), Some(0x4a));
		assert!(intr_msi(&vm, 0xdead_0000, 0x4a).is_err());
	}

	#[test]
	fn logical_flat_destination() {
		let vm = vm(3);
		for id in 0..3 {
			let lapic = vm.lapic(id).unwrap();
			enable(&vm, lapic);
			lapic
				.write_mmio(&vm, off::LDR, 4, (1u64 << id) << 24)
				.unwrap();
		}
		let set = calc_dest(&vm, 0b101, false, false, false);
		assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2]);
		let set = calc_dest(&vm, 0b110, false, true, false);
		assert_eq!(set.iter().collect::<Vec<_>>(), vec![1]);
		assert_eq!(calc_dest(&vm, 0xff, true, false, false).len(), 3);
	}

	#[test]
	fn lint0_without_apic_is_extint() {
		let vm = vm(1);
		set_local_intr(&vm, None, Lvt::Lint0).unwrap();
		assert!(vm.extint_pending(0));
	}

	#[test]
	fn tmr_follows_ioapic_routing() {
		let vm = vm(2);
		let (bsp, ap) = (vm.lapic(0).unwrap(), vm.lapic(1).unwrap());
		for lapic in [bsp, ap] {
			lapic.set_tmr_level(&vm, 1, true, DELMODE_FIXED, 0x49);
			lapic.set_tmr_level(&vm, 1, true, DELMODE_NMI, 0x4a);
		}
		assert_eq!(bsp.read_mmio(&vm, off::TMR0 + 0x20, 4).unwrap(), 0);
		assert_eq!(ap.read_mmio(&vm, off::TMR0 + 0x20, 4).unwrap(), 1 << 9);
		ap.reset_tmr();
		assert_eq!(ap.read_mmio(&vm, off::TMR0 + 0x20, 4).unwrap(), 0);
	}

	#[test]
	fn misaligned_access_is_not_fatal() {
		let vm = vm(1);
		let lapic = vm.lapic(0).unwrap();
		assert_eq!(lapic.read_mmio(&vm, off::TPR + 4, 4).unwrap(), 0xffff_ffff);
		assert!(lapic.write_mmio(&vm, off::TPR + 4, 4, 0x40).unwrap().is_none());
		assert_eq!(lapic.read_mmio(&vm, off::TPR, 4).unwrap(), 0);
	}
}
