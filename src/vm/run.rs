//! The outer run loop: everything a vCPU exit needs that the VMX layer
//! cannot finish, as long as the VM itself can finish it.

use super::{SuspendHow, VcpuState, Vm};
use crate::{
	consts::*,
	emulate::{self, MmioBus, decode::decode_instruction, exec::Completion},
	error::{LockExt, Result, VmmError},
	vmx::{ExitKind, InstEmul, VmExit, VmxVcpu},
};

/// Routes emulated accesses of one vCPU to the device that owns them.
struct VcpuBus<'a> {
	vm: &'a Vm,
	vcpu: usize,
	/// Set when a local APIC write has to start another vCPU.
	exit: Option<ExitKind>,
}

impl MmioBus for VcpuBus<'_> {
	fn mmio_read(&mut self, gpa: u64, size: u8) -> Result<u64> {
		let vm = self.vm;
		let lapic = vm.lapic(self.vcpu)?;
		if let Some(base) = lapic.mmio_base() {
			if (base..base + PAGE_SIZE as u64).contains(&gpa) {
				return lapic.read_mmio(vm, gpa - base, size);
			}
		}
		if (IOAPIC_BASE..IOAPIC_BASE + IOAPIC_SIZE).contains(&gpa) {
			return vm.ioapic.mmio_read(gpa - IOAPIC_BASE, size);
		}
		if (HPET_BASE..HPET_BASE + HPET_SIZE).contains(&gpa) {
			return vm.hpet.mmio_read(vm, gpa - HPET_BASE, size);
		}
		vm.mmio.read(vm, self.vcpu, gpa, size)
	}

	fn mmio_write(&mut self, gpa: u64, size: u8, value: u64) -> Result<()> {
		let vm = self.vm;
		let lapic = vm.lapic(self.vcpu)?;
		if let Some(base) = lapic.mmio_base() {
			if (base..base + PAGE_SIZE as u64).contains(&gpa) {
				if let Some(exit) = lapic.write_mmio(vm, gpa - base, size, value)? {
					self.exit = Some(exit);
				}
				return Ok(());
			}
		}
		if (IOAPIC_BASE..IOAPIC_BASE + IOAPIC_SIZE).contains(&gpa) {
			return vm.ioapic.mmio_write(vm, self.vcpu, gpa - IOAPIC_BASE, size, value);
		}
		if (HPET_BASE..HPET_BASE + HPET_SIZE).contains(&gpa) {
			return vm.hpet.mmio_write(vm, gpa - HPET_BASE, size, value);
		}
		vm.mmio.write(vm, self.vcpu, gpa, size, value)
	}
}

impl Vm {
	/// Runs `vcpu` until an exit the VM cannot complete on its own. The
	/// caller keeps the vCPU frozen between calls; the guest resumes at the
	/// vCPU's `nextrip`.
	pub fn run(&self, vcpu: &mut VmxVcpu) -> Result<VmExit> {
		let id = vcpu.id();
		let slot = self.slot(id)?;
		{
			let sets = self.sets.locked();
			if !sets.active.contains(id) {
				return Err(VmmError::InvalidArgument(format!("vCPU {id} is not active")));
			}
			if sets.suspended.contains(id) {
				return Err(VmmError::InvalidArgument(format!("vCPU {id} is suspended")));
			}
		}

		loop {
			self.pause_gate(id);
			let rip = slot.lock().nextrip;
			self.vcpu_require_state(id, VcpuState::Running);
			let res = vcpu.run(rip);
			self.vcpu_require_state(id, VcpuState::Frozen);
			res?;

			slot.lock().nextrip = vcpu.exit.rip.wrapping_add(vcpu.exit.inst_length);

			let retu = match vcpu.exit.kind {
				ExitKind::Suspended { .. } => self.handle_suspend(id)?,
				ExitKind::ReqIdle | ExitKind::Paging { .. } | ExitKind::Pause | ExitKind::Mtrap => {
					false
				}
				ExitKind::Rendezvous => {
					self.handle_rendezvous(Some(id));
					false
				}
				ExitKind::Hlt { rflags } => self.handle_hlt(id, rflags & PSL_I == 0)?,
				ExitKind::InstEmul(emul) => self.handle_inst_emul(vcpu, emul)?,
				ExitKind::Inout(_) | ExitKind::InoutStr(_) => {
					self.inout.emulate(self, vcpu)?;
					false
				}
				ExitKind::Monitor | ExitKind::Mwait => {
					self.inject_ud(vcpu)?;
					false
				}
				ExitKind::IoapicEoi { vector } => {
					self.ioapic.process_eoi(self, vector);
					false
				}
				_ => true,
			};
			if retu {
				return Ok(vcpu.exit);
			}
		}
	}

	/// Parks the vCPU until every active vCPU has seen the suspend request.
	fn handle_suspend(&self, id: usize) -> Result<bool> {
		self.sets.locked().suspended.insert(id);
		let slot = self.slot(id)?;
		let mut inner = slot.lock();
		loop {
			{
				let sets = self.sets.locked();
				if sets.active.difference(sets.suspended).is_empty() {
					break;
				}
			}
			if self.is_destroyed() {
				break;
			}
			if self.rendezvous.pending() {
				// A vCPU stuck in a rendezvous would never suspend.
				drop(inner);
				self.handle_rendezvous(Some(id));
				inner = slot.lock();
			} else {
				inner = self.vcpu_require_state_locked(id, slot, inner, VcpuState::Sleeping);
				inner = slot.sleep(inner);
				inner = self.vcpu_require_state_locked(id, slot, inner, VcpuState::Frozen);
			}
		}
		drop(inner);

		for vcpu in self.suspended_cpus().iter() {
			self.notify_event(vcpu, false);
		}
		debug!("vCPU {id} suspended ({:?})", self.suspend_state());
		Ok(true)
	}

	/// Sleeps until the halted vCPU has something to do. When every active
	/// vCPU halts with interrupts disabled the VM halts.
	fn handle_hlt(&self, id: usize, intr_disabled: bool) -> Result<bool> {
		let slot = self.slot(id)?;
		let lapic = self.lapic(id)?;
		let mut halted = false;
		let mut vm_halted = false;

		let mut inner = slot.lock();
		loop {
			// Events may have arrived between the exit and taking the lock.
			if self.rendezvous.pending() || self.is_suspended() || self.is_paused() {
				break;
			}
			if inner.nmi_pending {
				break;
			}
			if !intr_disabled && (inner.extint_pending || lapic.pending_intr().is_some()) {
				break;
			}
			if self.is_destroyed() {
				break;
			}

			if intr_disabled {
				let mut sets = self.sets.locked();
				if !halted {
					halted = true;
					sets.halted.insert(id);
				}
				if sets.active.difference(sets.halted).is_empty() {
					vm_halted = true;
					break;
				}
			}

			inner = self.vcpu_require_state_locked(id, slot, inner, VcpuState::Sleeping);
			inner = slot.sleep(inner);
			inner = self.vcpu_require_state_locked(id, slot, inner, VcpuState::Frozen);
		}
		if halted {
			self.sets.locked().halted.remove(id);
		}
		drop(inner);

		if vm_halted {
			info!("all vCPUs halted with interrupts disabled");
			let _ = self.suspend(SuspendHow::Halt);
		}
		Ok(false)
	}

	/// Completes a guest access to emulated memory. Returns whether the
	/// exit must go to the caller.
	fn handle_inst_emul(&self, vcpu: &mut VmxVcpu, emul: InstEmul) -> Result<bool> {
		let rip = vcpu.exit.rip;
		let mut vie = match emulate::fetch_instruction(
			&self.mem,
			&emul.paging,
			rip.wrapping_add(emul.cs_base),
			VIE_INST_SIZE,
		) {
			Ok(vie) => vie,
			Err(VmmError::GuestFault(fault)) => {
				self.inject_fault(vcpu, fault)?;
				return Ok(false);
			}
			Err(err) => return Err(err),
		};

		if let Err(err) = decode_instruction(&mut vie, &*vcpu, emul.gla, emul.paging.cpu_mode, emul.cs_d)
		{
			error!(
				"vCPU {}: cannot decode {:02x?} at {rip:#x}: {err}",
				vcpu.id(),
				vie.bytes()
			);
			return Err(err);
		}

		let mut bus = VcpuBus {
			vm: self,
			vcpu: vcpu.id(),
			exit: None,
		};
		let completion =
			match emulate::emulate_instruction(vcpu, &self.mem, emul.gpa, &vie, &emul.paging, &mut bus) {
				Ok(completion) => completion,
				Err(VmmError::GuestFault(fault)) => {
					self.inject_fault(vcpu, fault)?;
					return Ok(false);
				}
				Err(err) => return Err(err),
			};

		// The exit carried no length; the decoder knows it.
		if completion == Completion::Done {
			vcpu.exit.inst_length = vie.num_processed as u64;
			self.slot(vcpu.id())?.lock().nextrip = rip.wrapping_add(vcpu.exit.inst_length);
		}
		match bus.exit {
			Some(kind) => {
				vcpu.exit.kind = kind;
				Ok(true)
			}
			None => Ok(false),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::{
		vm::VmConfig,
		vmx::{
			backend::Reg,
			mock::{MockBackend, MockExit},
			vmcs::*,
		},
	};

	fn start(backend: MockBackend, ncpus: usize) -> (Arc<MockBackend>, Arc<Vm>) {
		let backend = Arc::new(backend);
		let vm = Vm::create(
			backend.clone(),
			VmConfig {
				ncpus,
				..Default::default()
			},
		)
		.unwrap();
		for id in 0..ncpus {
			vm.activate_cpu(id).unwrap();
		}
		(backend, vm)
	}

	fn frozen(vm: &Arc<Vm>, id: usize) -> VmxVcpu {
		let vcpu = VmxVcpu::new(vm.clone(), id).unwrap();
		vm.vcpu_set_state(id, VcpuState::Frozen, true).unwrap();
		vcpu
	}

	#[test]
	fn halted_with_interrupts_off_halts_the_vm() {
		let (_, vm) = start(MockBackend::new(), 1);
		let mut vcpu = frozen(&vm, 0);
		let exit = vm.run(&mut vcpu).unwrap();
		assert_eq!(exit.kind, ExitKind::Suspended { how: SuspendHow::Halt });
		assert!(vm.suspended_cpus().contains(0));
		assert!(vm.halted_cpus().is_empty());
	}

	#[test]
	fn port_io_is_completed_in_core() {
		let (backend, vm) = start(
			MockBackend::new().script(
				0,
				vec![
					// out 0x80, al
					MockExit::new(reason::IO)
						.qual(0x80 << 16)
						.inst_len(2)
						.reg(Reg::Rip, 0x100)
						.reg(Reg::Rax, 0x55),
				],
			),
			1,
		);
		let mut vcpu = frozen(&vm, 0);
		vcpu.set_reg(Reg::Rip, 0x100).unwrap();
		vm.run(&mut vcpu).unwrap();
		let entries = backend.record(0).entries();
		assert_eq!(entries[0].rip, 0x100);
		assert_eq!(entries[1].rip, 0x102);
	}

	#[test]
	fn suspend_waits_for_every_vcpu() {
		let (_, vm) = start(MockBackend::new(), 2);
		vm.suspend(SuspendHow::Poweroff).unwrap();
		let other = {
			let vm = vm.clone();
			std::thread::spawn(move || {
				let mut vcpu = frozen(&vm, 1);
				vm.run(&mut vcpu).unwrap().kind
			})
		};
		let mut vcpu = frozen(&vm, 0);
		let exit = vm.run(&mut vcpu).unwrap();
		assert_eq!(exit.kind, ExitKind::Suspended { how: SuspendHow::Poweroff });
		assert_eq!(
			other.join().unwrap(),
			ExitKind::Suspended { how: SuspendHow::Poweroff }
		);
		assert_eq!(vm.suspended_cpus().len(), 2);
	}

	#[test]
	fn inactive_vcpu_cannot_run() {
		let backend = Arc::new(MockBackend::new());
		let vm = Vm::create(backend, VmConfig::default()).unwrap();
		let mut vcpu = VmxVcpu::new(vm.clone(), 0).unwrap();
		assert!(matches!(vm.run(&mut vcpu), Err(VmmError::InvalidArgument(_))));
	}

	#[test]
	fn monitor_raises_ud() {
		let (backend, vm) = start(
			MockBackend::new().script(
				0,
				vec![MockExit::new(reason::MONITOR).inst_len(3).reg(Reg::Rip, 0x400)],
			),
			1,
		);
		let mut vcpu = frozen(&vm, 0);
		vm.run(&mut vcpu).unwrap();
		let record = backend.record(0);
		assert_eq!(
			record.injected()[0],
			IDT_UD as u64 | VMCS_INTR_T_HWEXCEPTION | VMCS_INTR_VALID
		);
		assert_eq!(record.entries()[1].rip, 0x400);
	}
}
