//! Per-vCPU bookkeeping shared between the vCPU thread and everybody who
//! wants to poke it: run state, pending events and the exception queue.

use std::{
	sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock},
	time::Duration,
};

use super::{Vm, VcpuState, X2apicState};
use crate::{
	consts::*,
	error::{Fault, LockExt, Result, VmmError, wait_timeout},
	vmx::{VmxVcpu, backend::Kick, vmcs::*},
};

const STATE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingException {
	pub vector: u8,
	pub errcode: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct VcpuInner {
	pub state: VcpuState,
	/// Event whose delivery was cut short by the last exit.
	pub exitintinfo: u64,
	pub nmi_pending: bool,
	pub extint_pending: bool,
	pub exception: Option<PendingException>,
	pub x2apic: X2apicState,
	/// Where the guest continues on the next entry.
	pub nextrip: u64,
}

impl Default for VcpuInner {
	fn default() -> Self {
		Self {
			state: VcpuState::Idle,
			exitintinfo: 0,
			nmi_pending: false,
			extint_pending: false,
			exception: None,
			x2apic: X2apicState::Disabled,
			nextrip: 0,
		}
	}
}

#[derive(Default)]
pub(crate) struct VcpuSlot {
	pub inner: Mutex<VcpuInner>,
	pub cv: Condvar,
	pub kicker: OnceLock<Arc<dyn Kick>>,
}

impl VcpuSlot {
	pub fn lock(&self) -> MutexGuard<'_, VcpuInner> {
		self.inner.locked()
	}

	pub fn reset(&self) {
		let mut inner = self.lock();
		let state = inner.state;
		*inner = VcpuInner {
			state,
			..Default::default()
		};
	}

	/// Sleeps on the slot's condition for at most a second.
	pub fn sleep<'a>(&'a self, guard: MutexGuard<'a, VcpuInner>) -> MutexGuard<'a, VcpuInner> {
		wait_timeout(&self.cv, guard, STATE_WAIT)
	}
}

fn transition_allowed(from: VcpuState, to: VcpuState) -> bool {
	match from {
		VcpuState::Idle | VcpuState::Running | VcpuState::Sleeping => to == VcpuState::Frozen,
		VcpuState::Frozen => to != VcpuState::Frozen,
	}
}

/// Interrupt-info type field as used by entry and exit intinfo.
const INTINFO_TYPE: u64 = VMCS_INTR_T_MASK;
const INTINFO_RSVD: u64 = 0x7fff_f000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExcClass {
	Benign,
	Contributory,
	PageFault,
}

fn exception_class(info: u64) -> ExcClass {
	match info & INTINFO_TYPE {
		VMCS_INTR_T_HWINTR | VMCS_INTR_T_SWINTR | VMCS_INTR_T_NMI => return ExcClass::Benign,
		_ => {}
	}
	match (info & 0xff) as u8 {
		IDT_PF | IDT_VE => ExcClass::PageFault,
		IDT_DE | IDT_TS | IDT_NP | IDT_SS | IDT_GP => ExcClass::Contributory,
		_ => ExcClass::Benign,
	}
}

fn exception_intinfo(exc: PendingException) -> u64 {
	let mut info = exc.vector as u64 | VMCS_INTR_VALID | VMCS_INTR_T_HWEXCEPTION;
	if let Some(errcode) = exc.errcode {
		info |= VMCS_INTR_DEL_ERRCODE | (errcode as u64) << 32;
	}
	info
}

impl Vm {
	/// Moves `vcpu` to `new`. With `from_idle` the caller first waits until
	/// the vCPU is idle, so only one host thread ever drives it.
	pub fn vcpu_set_state(&self, vcpu: usize, new: VcpuState, from_idle: bool) -> Result<()> {
		let slot = self.slot(vcpu)?;
		let inner = slot.lock();
		self.vcpu_set_state_locked(vcpu, slot, inner, new, from_idle)
			.map(drop)
	}

	pub(crate) fn vcpu_set_state_locked<'a>(
		&self,
		vcpu: usize,
		slot: &'a VcpuSlot,
		mut inner: MutexGuard<'a, VcpuInner>,
		new: VcpuState,
		from_idle: bool,
	) -> Result<MutexGuard<'a, VcpuInner>> {
		if from_idle {
			while inner.state != VcpuState::Idle {
				inner = slot.sleep(inner);
			}
		} else if inner.state == VcpuState::Idle {
			return Err(VmmError::StateTransition {
				vcpu,
				from: inner.state,
				to: new,
			});
		}
		if !transition_allowed(inner.state, new) {
			return Err(VmmError::StateTransition {
				vcpu,
				from: inner.state,
				to: new,
			});
		}
		inner.state = new;
		if new == VcpuState::Idle {
			slot.cv.notify_all();
		}
		Ok(inner)
	}

	/// Like [`Vm::vcpu_set_state`] for transitions that cannot fail unless
	/// internal state is corrupt.
	pub(crate) fn vcpu_require_state(&self, vcpu: usize, new: VcpuState) {
		if let Err(err) = self.vcpu_set_state(vcpu, new, false) {
			error!("{err}");
			std::process::abort();
		}
	}

	pub(crate) fn vcpu_require_state_locked<'a>(
		&self,
		vcpu: usize,
		slot: &'a VcpuSlot,
		inner: MutexGuard<'a, VcpuInner>,
		new: VcpuState,
	) -> MutexGuard<'a, VcpuInner> {
		match self.vcpu_set_state_locked(vcpu, slot, inner, new, false) {
			Ok(inner) => inner,
			Err(err) => {
				error!("{err}");
				std::process::abort()
			}
		}
	}

	pub fn vcpu_state(&self, vcpu: usize) -> Result<VcpuState> {
		Ok(self.slot(vcpu)?.lock().state)
	}

	/// Makes `vcpu` notice a pending event: a running vCPU is kicked out of
	/// the guest, a sleeping one is woken.
	pub fn notify_event(&self, vcpu: usize, lapic_intr: bool) {
		let Some(slot) = self.vcpus.get(vcpu) else {
			return;
		};
		let inner = slot.lock();
		match inner.state {
			VcpuState::Running => {
				if let Some(kicker) = slot.kicker.get() {
					kicker.kick();
				}
			}
			VcpuState::Sleeping => slot.cv.notify_all(),
			VcpuState::Idle | VcpuState::Frozen => {
				if lapic_intr {
					trace!("vCPU {vcpu} not in guest, interrupt picked up at next entry");
				}
			}
		}
	}

	pub fn x2apic_state(&self, vcpu: usize) -> Result<X2apicState> {
		Ok(self.slot(vcpu)?.lock().x2apic)
	}

	pub fn set_x2apic_state(&self, vcpu: usize, state: X2apicState) -> Result<()> {
		self.slot(vcpu)?.lock().x2apic = state;
		self.lapic(vcpu)?.set_x2apic_state(state);
		Ok(())
	}

	/// Queues an exception for the next entry.
	pub fn inject_exception(
		&self,
		vcpu: &mut VmxVcpu,
		vector: u8,
		errcode: Option<u32>,
		restart_instruction: bool,
	) -> Result<()> {
		if vector >= 32 || vector == IDT_DF {
			return Err(VmmError::InvalidArgument(format!(
				"exception vector {vector} cannot be injected"
			)));
		}
		let id = vcpu.id();
		let slot = self.slot(id)?;
		if let Some(pending) = slot.lock().exception {
			debug!(
				"vCPU {id}: cannot inject #{vector}, #{} already pending",
				pending.vector
			);
			return Err(VmmError::Busy(id));
		}

		// STI / MOV SS blocking ends once the guest takes an exception.
		vcpu.set_intr_shadow(0)?;
		if restart_instruction {
			self.restart_instruction(vcpu)?;
		}
		slot.lock().exception = Some(PendingException { vector, errcode });
		trace!("vCPU {id}: exception {vector} pending");
		Ok(())
	}

	/// Reflects `fault` into the guest and restarts the faulting instruction.
	pub fn inject_fault(&self, vcpu: &mut VmxVcpu, fault: Fault) -> Result<()> {
		if let Some(cr2) = fault.cr2 {
			vcpu.set_cr2(cr2)?;
		}
		self.inject_exception(vcpu, fault.vector, fault.errcode, true)
	}

	pub fn inject_ud(&self, vcpu: &mut VmxVcpu) -> Result<()> {
		self.inject_fault(vcpu, Fault::ud())
	}

	pub fn inject_gp(&self, vcpu: &mut VmxVcpu) -> Result<()> {
		self.inject_fault(vcpu, Fault::gp(0))
	}

	/// Makes the next entry re-execute the current instruction.
	pub fn restart_instruction(&self, vcpu: &mut VmxVcpu) -> Result<()> {
		let id = vcpu.id();
		let rip = vcpu.rip()?;
		let mut inner = self.slot(id)?.lock();
		match inner.state {
			VcpuState::Running => vcpu.exit.inst_length = 0,
			VcpuState::Frozen => {
				trace!(
					"vCPU {id}: restarting instruction, nextrip {:#x} -> {rip:#x}",
					inner.nextrip
				);
				inner.nextrip = rip;
			}
			state => {
				return Err(VmmError::StateTransition {
					vcpu: id,
					from: state,
					to: VcpuState::Frozen,
				});
			}
		}
		Ok(())
	}

	pub fn inject_nmi(&self, vcpu: usize) -> Result<()> {
		self.slot(vcpu)?.lock().nmi_pending = true;
		self.notify_event(vcpu, false);
		Ok(())
	}

	pub fn nmi_pending(&self, vcpu: usize) -> bool {
		self.vcpus.get(vcpu).is_some_and(|s| s.lock().nmi_pending)
	}

	pub(crate) fn nmi_clear(&self, vcpu: usize) {
		if let Some(slot) = self.vcpus.get(vcpu) {
			slot.lock().nmi_pending = false;
		}
	}

	pub fn inject_extint(&self, vcpu: usize) -> Result<()> {
		self.slot(vcpu)?.lock().extint_pending = true;
		self.notify_event(vcpu, false);
		Ok(())
	}

	pub fn extint_pending(&self, vcpu: usize) -> bool {
		self.vcpus
			.get(vcpu)
			.is_some_and(|s| s.lock().extint_pending)
	}

	pub(crate) fn extint_clear(&self, vcpu: usize) {
		if let Some(slot) = self.vcpus.get(vcpu) {
			slot.lock().extint_pending = false;
		}
	}

	/// Records an event whose delivery was interrupted by a VM exit.
	pub fn exit_intinfo(&self, vcpu: usize, info: u64) -> Result<()> {
		let mut info = info;
		if info & VMCS_INTR_VALID != 0 {
			let kind = info & INTINFO_TYPE;
			let vector = (info & 0xff) as u8;
			if kind == VMCS_INTR_T_NMI && vector != IDT_NMI {
				return Err(VmmError::InvalidArgument(format!("NMI with vector {vector}")));
			}
			if kind == VMCS_INTR_T_HWEXCEPTION && vector >= 32 {
				return Err(VmmError::InvalidArgument(format!(
					"hardware exception with vector {vector}"
				)));
			}
			if info & INTINFO_RSVD != 0 {
				return Err(VmmError::InvalidArgument(format!(
					"reserved intinfo bits in {info:#x}"
				)));
			}
		} else {
			info = 0;
		}
		self.slot(vcpu)?.lock().exitintinfo = info;
		Ok(())
	}

	/// Merges the interrupted event and the pending exception into the event
	/// to deliver at the next entry, applying the double-fault rules.
	pub fn entry_intinfo(&self, vcpu: usize) -> Result<Option<u64>> {
		let (info1, info2) = {
			let mut inner = self.slot(vcpu)?.lock();
			let info1 = std::mem::take(&mut inner.exitintinfo);
			let info2 = inner.exception.take().map(exception_intinfo).unwrap_or(0);
			(info1, info2)
		};

		let valid1 = info1 & VMCS_INTR_VALID != 0;
		let valid2 = info2 & VMCS_INTR_VALID != 0;
		let ret = match (valid1, valid2) {
			(true, true) => self.nested_fault(vcpu, info1, info2),
			(true, false) => Some(info1),
			(false, true) => Some(info2),
			(false, false) => None,
		};
		if let Some(ret) = ret {
			trace!("vCPU {vcpu}: entry intinfo {info1:#x} + {info2:#x} -> {ret:#x}");
		}
		Ok(ret)
	}

	fn nested_fault(&self, vcpu: usize, info1: u64, info2: u64) -> Option<u64> {
		if info1 & INTINFO_TYPE == VMCS_INTR_T_HWEXCEPTION && (info1 & 0xff) as u8 == IDT_DF {
			warn!("vCPU {vcpu}: triple fault ({info1:#x}, {info2:#x})");
			if let Err(e) = self.suspend(super::SuspendHow::TripleFault) {
				debug!("vCPU {vcpu}: triple fault after suspend: {e}");
			}
			return None;
		}
		let exc1 = exception_class(info1);
		let exc2 = exception_class(info2);
		if (exc1 == ExcClass::Contributory && exc2 == ExcClass::Contributory)
			|| (exc1 == ExcClass::PageFault && exc2 != ExcClass::Benign)
		{
			Some(
				IDT_DF as u64 | VMCS_INTR_VALID | VMCS_INTR_T_HWEXCEPTION | VMCS_INTR_DEL_ERRCODE,
			)
		} else {
			Some(info2)
		}
	}

	/// Both halves of the pending-event state, for diagnostics.
	pub fn intinfo(&self, vcpu: usize) -> Result<(u64, u64)> {
		let inner = self.slot(vcpu)?.lock();
		Ok((
			inner.exitintinfo,
			inner.exception.map(exception_intinfo).unwrap_or(0),
		))
	}
}
