//! VMX virtual CPU: control setup, the inner run loop, event injection and
//! exit classification.
//!
//! A [`VmxVcpu`] is owned by the host thread that drives it. The loop in
//! [`VmxVcpu::run`] keeps re-entering the guest for exits it can finish on
//! its own (CPUID, CR accesses, known MSRs, XSETBV, interrupt windows) and
//! returns with [`VmxVcpu::exit`] filled in for everything else.

pub mod backend;
pub mod caps;
pub mod exit;
mod guest_msr;
pub mod mock;
pub mod vmcs;

use std::{fmt, sync::Arc};

use backend::{Reg, VirtualCpu};
pub use exit::*;
use vmcs::*;

use crate::{
	consts::*,
	cpuid::CpuidContext,
	emulate::{CpuMode, GuestPaging, PagingMode, Prot, Seg, SegDesc, VieCpu, decode::VIE_INVALID_GLA},
	error::{Result, VmmError},
	firmware::BootState,
	stats::{CpuStats, VmExit as ExitStat},
	vm::{SuspendHow, Vm, X2apicState},
};

/// MSRs the guest may touch without exiting.
const NATIVE_MSRS: [u32; 10] = [
	msr::IA32_FS_BASE,
	msr::IA32_GS_BASE,
	msr::IA32_KERNEL_GSBASE,
	msr::IA32_SYSENTER_CS,
	msr::IA32_SYSENTER_ESP,
	msr::IA32_SYSENTER_EIP,
	msr::IA32_STAR,
	msr::IA32_LSTAR,
	msr::IA32_CSTAR,
	msr::IA32_FMASK,
];

/// CR0 as seen by the guest right after creation.
const CR0_INITIAL_SHADOW: u64 = 0x6000_0010;

/// Segment access rights bit: 64-bit code segment.
const SEG_AR_L: u64 = 1 << 13;
const SEG_AR_DB: u64 = 1 << 14;

struct SegFields {
	base: u32,
	limit: u32,
	access: u32,
}

fn seg_fields(reg: Reg) -> Option<SegFields> {
	let (base, limit, access) = match reg {
		Reg::Es => (VMCS_GUEST_ES_BASE, VMCS_GUEST_ES_LIMIT, VMCS_GUEST_ES_AR),
		Reg::Cs => (VMCS_GUEST_CS_BASE, VMCS_GUEST_CS_LIMIT, VMCS_GUEST_CS_AR),
		Reg::Ss => (VMCS_GUEST_SS_BASE, VMCS_GUEST_SS_LIMIT, VMCS_GUEST_SS_AR),
		Reg::Ds => (VMCS_GUEST_DS_BASE, VMCS_GUEST_DS_LIMIT, VMCS_GUEST_DS_AR),
		Reg::Fs => (VMCS_GUEST_FS_BASE, VMCS_GUEST_FS_LIMIT, VMCS_GUEST_FS_AR),
		Reg::Gs => (VMCS_GUEST_GS_BASE, VMCS_GUEST_GS_LIMIT, VMCS_GUEST_GS_AR),
		Reg::Ldtr => (
			VMCS_GUEST_LDTR_BASE,
			VMCS_GUEST_LDTR_LIMIT,
			VMCS_GUEST_LDTR_AR,
		),
		Reg::Tr => (VMCS_GUEST_TR_BASE, VMCS_GUEST_TR_LIMIT, VMCS_GUEST_TR_AR),
		_ => return None,
	};
	Some(SegFields {
		base,
		limit,
		access,
	})
}

/// Which descriptor table register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescTable {
	Gdtr,
	Idtr,
}

impl DescTable {
	fn fields(self) -> (u32, u32) {
		match self {
			DescTable::Gdtr => (VMCS_GUEST_GDTR_BASE, VMCS_GUEST_GDTR_LIMIT),
			DescTable::Idtr => (VMCS_GUEST_IDTR_BASE, VMCS_GUEST_IDTR_LIMIT),
		}
	}
}

pub struct VmxVcpu {
	id: usize,
	hw: Box<dyn VirtualCpu>,
	vm: Arc<Vm>,
	/// The last exit that needs handling outside the inner loop.
	pub exit: VmExit,
	/// Shadow of the primary processor-based controls.
	procbased: u64,
	/// Guest RIP at the last exit. Used to notice that the guest moved on
	/// and its STI/MOV SS shadow has expired.
	last_exit_rip: u64,
	msrs: guest_msr::MsrState,
	pub(crate) stats: CpuStats,
}

impl fmt::Debug for VmxVcpu {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("VmxVcpu")
			.field("id", &self.id)
			.field("exit", &self.exit)
			.finish_non_exhaustive()
	}
}

impl VmxVcpu {
	/// Creates the hardware vCPU on the calling thread and programs its
	/// controls. The vCPU comes up in the architectural reset state.
	pub fn new(vm: Arc<Vm>, id: usize) -> Result<Self> {
		let slot = vm.slot(id)?;
		let hw = vm.backend().create_vcpu(id)?;
		let _ = slot.kicker.set(hw.kicker());
		let msrs = guest_msr::MsrState::new(&vm);
		let mut vcpu = Self {
			id,
			hw,
			vm,
			exit: VmExit::default(),
			procbased: 0,
			last_exit_rip: 0,
			msrs,
			stats: CpuStats::new(id),
		};
		vcpu.init()?;
		vcpu.reset()?;
		Ok(vcpu)
	}

	fn init(&mut self) -> Result<()> {
		let caps = self.vm.caps;
		self.procbased = caps.procbased;
		self.hw.write_vmcs(VMCS_CTRL_PIN_BASED, caps.pinbased)?;
		self.hw.write_vmcs(VMCS_CTRL_CPU_BASED, caps.procbased)?;
		self.hw.write_vmcs(VMCS_CTRL_CPU_BASED2, caps.procbased2)?;
		self.hw.write_vmcs(VMCS_CTRL_VMENTRY_CONTROLS, caps.entry)?;
		self.hw.write_vmcs(VMCS_CTRL_VMEXIT_CONTROLS, caps.exit)?;
		self.hw
			.write_vmcs(VMCS_CTRL_EXC_BITMAP, 1 << IDT_MC as u64)?;

		// PG and PE changes trap so that EFER.LMA and the IA-32e entry
		// control can follow the guest.
		let cr0_mask = caps.cr0_ones_mask | caps.cr0_zeros_mask | CR0_PG | CR0_PE;
		self.hw.write_vmcs(VMCS_CTRL_CR0_MASK, cr0_mask)?;
		self.hw
			.write_vmcs(VMCS_CTRL_CR0_SHADOW, CR0_INITIAL_SHADOW)?;
		self.hw.write_vmcs(
			VMCS_GUEST_CR0,
			(CR0_INITIAL_SHADOW | caps.cr0_ones_mask) & !caps.cr0_zeros_mask,
		)?;
		self.hw.write_vmcs(
			VMCS_CTRL_CR4_MASK,
			caps.cr4_ones_mask | caps.cr4_zeros_mask,
		)?;
		self.hw.write_vmcs(VMCS_CTRL_CR4_SHADOW, 0)?;
		self.hw.write_vmcs(VMCS_GUEST_CR4, caps.cr4_ones_mask)?;

		for msr in NATIVE_MSRS {
			self.hw.enable_native_msr(msr, true)?;
		}
		if caps.procbased2 & CPU_BASED2_RDTSCP != 0 {
			self.hw.enable_native_msr(msr::IA32_TSC_AUX, true)?;
		}
		self.hw.enable_native_msr(msr::TSC, true)?;
		Ok(())
	}

	pub fn id(&self) -> usize {
		self.id
	}

	pub fn vm(&self) -> &Arc<Vm> {
		&self.vm
	}

	pub fn stats(&self) -> &CpuStats {
		&self.stats
	}

	pub fn read_vmcs(&self, field: u32) -> Result<u64> {
		self.hw.read_vmcs(field)
	}

	pub fn write_vmcs(&mut self, field: u32, value: u64) -> Result<()> {
		self.hw.write_vmcs(field, value)
	}

	pub fn rip(&self) -> Result<u64> {
		self.hw.read_reg(Reg::Rip)
	}

	/// Reads a guest register. Control registers come from the VMCS guest
	/// area, so a masked bit reads as the hardware value.
	pub fn reg(&self, reg: Reg) -> Result<u64> {
		match reg {
			Reg::Cr0 => self.hw.read_vmcs(VMCS_GUEST_CR0),
			Reg::Cr3 => self.hw.read_vmcs(VMCS_GUEST_CR3),
			Reg::Cr4 => self.hw.read_vmcs(VMCS_GUEST_CR4),
			Reg::Dr7 => self.hw.read_vmcs(VMCS_GUEST_DR7),
			reg => self.hw.read_reg(reg),
		}
	}

	/// Writes a guest register. CR0 and CR4 go through their read shadows,
	/// RIP also becomes the resume point.
	pub fn set_reg(&mut self, reg: Reg, value: u64) -> Result<()> {
		match reg {
			Reg::Cr0 => self.set_cr0(value),
			Reg::Cr3 => self.hw.write_vmcs(VMCS_GUEST_CR3, value),
			Reg::Cr4 => self.set_cr4(value),
			Reg::Dr7 => self.hw.write_vmcs(VMCS_GUEST_DR7, value),
			Reg::Rip => {
				self.hw.write_reg(Reg::Rip, value)?;
				self.vm.slot(self.id)?.lock().nextrip = value;
				Ok(())
			}
			reg => self.hw.write_reg(reg, value),
		}
	}

	pub fn set_cr2(&mut self, cr2: u64) -> Result<()> {
		self.hw.write_reg(Reg::Cr2, cr2)
	}

	pub fn set_cr0(&mut self, value: u64) -> Result<()> {
		let caps = self.vm.caps;
		self.hw.write_vmcs(VMCS_CTRL_CR0_SHADOW, value)?;
		let crval = (value | caps.cr0_ones_mask) & !caps.cr0_zeros_mask;
		self.hw.write_vmcs(VMCS_GUEST_CR0, crval)?;

		let efer = self.hw.read_vmcs(VMCS_GUEST_IA32_EFER)?;
		if value & CR0_PG != 0 && efer & EFER_LME != 0 {
			self.set_efer(efer | EFER_LMA)?;
		} else if value & CR0_PG == 0 && efer & EFER_LMA != 0 {
			self.set_efer(efer & !EFER_LMA)?;
		}
		Ok(())
	}

	pub fn set_cr4(&mut self, value: u64) -> Result<()> {
		let caps = self.vm.caps;
		self.hw.write_vmcs(VMCS_CTRL_CR4_SHADOW, value)?;
		self.hw.write_vmcs(
			VMCS_GUEST_CR4,
			(value | caps.cr4_ones_mask) & !caps.cr4_zeros_mask,
		)
	}

	pub fn efer(&self) -> Result<u64> {
		self.hw.read_vmcs(VMCS_GUEST_IA32_EFER)
	}

	/// Writes EFER and keeps the IA-32e mode entry control in step with LMA.
	pub fn set_efer(&mut self, value: u64) -> Result<()> {
		self.hw.write_vmcs(VMCS_GUEST_IA32_EFER, value)?;
		let mut entry = self.hw.read_vmcs(VMCS_CTRL_VMENTRY_CONTROLS)?;
		if value & EFER_LMA != 0 {
			entry |= VMENTRY_GUEST_IA32E;
		} else {
			entry &= !VMENTRY_GUEST_IA32E;
		}
		self.hw.write_vmcs(VMCS_CTRL_VMENTRY_CONTROLS, entry)
	}

	pub fn desc(&self, reg: Reg) -> Result<SegDesc> {
		let fields = seg_fields(reg)
			.ok_or_else(|| VmmError::InvalidArgument(format!("{reg:?} has no descriptor")))?;
		Ok(SegDesc {
			base: self.hw.read_vmcs(fields.base)?,
			limit: self.hw.read_vmcs(fields.limit)? as u32,
			access: self.hw.read_vmcs(fields.access)? as u32,
		})
	}

	pub fn set_desc(&mut self, reg: Reg, desc: SegDesc) -> Result<()> {
		let fields = seg_fields(reg)
			.ok_or_else(|| VmmError::InvalidArgument(format!("{reg:?} has no descriptor")))?;
		self.hw.write_vmcs(fields.base, desc.base)?;
		self.hw.write_vmcs(fields.limit, desc.limit as u64)?;
		self.hw.write_vmcs(fields.access, desc.access as u64)
	}

	/// Loads a segment register: selector plus hidden descriptor.
	pub fn set_segment(&mut self, reg: Reg, selector: u16, desc: SegDesc) -> Result<()> {
		self.hw.write_reg(reg, selector as u64)?;
		self.set_desc(reg, desc)
	}

	pub fn table(&self, table: DescTable) -> Result<(u64, u32)> {
		let (base, limit) = table.fields();
		Ok((
			self.hw.read_vmcs(base)?,
			self.hw.read_vmcs(limit)? as u32,
		))
	}

	pub fn set_table(&mut self, table: DescTable, base: u64, limit: u32) -> Result<()> {
		let (base_field, limit_field) = table.fields();
		self.hw.write_vmcs(base_field, base)?;
		self.hw.write_vmcs(limit_field, limit as u64)
	}

	/// Sets or clears the STI/MOV SS interrupt shadow.
	pub fn set_intr_shadow(&mut self, shadow: u64) -> Result<()> {
		let gi = self.hw.read_vmcs(VMCS_GUEST_IGNORE_IRQ)?;
		let gi = if shadow != 0 {
			gi | INTERRUPTIBILITY_STI_BLOCKING
		} else {
			gi & !HWINTR_BLOCKING
		};
		self.hw.write_vmcs(VMCS_GUEST_IGNORE_IRQ, gi)
	}

	/// The state of a processor after RESET: real mode at `f000:fff0`.
	pub fn reset(&mut self) -> Result<()> {
		let data = SegDesc {
			base: 0,
			limit: 0xffff,
			access: 0x93,
		};
		self.set_reg(Reg::Rflags, PSL_RESERVED_ONE)?;
		self.set_reg(Reg::Rip, 0xfff0)?;
		self.set_efer(0)?;
		self.set_cr0(CR0_NE)?;
		self.set_reg(Reg::Cr3, 0)?;
		self.set_cr4(0)?;
		self.set_reg(Reg::Dr7, 0x400)?;

		self.set_segment(
			Reg::Cs,
			0xf000,
			SegDesc {
				base: 0xffff_0000,
				limit: 0xffff,
				access: 0x9b,
			},
		)?;
		for reg in [Reg::Ss, Reg::Ds, Reg::Es, Reg::Fs, Reg::Gs] {
			self.set_segment(reg, 0, data)?;
		}
		self.set_table(DescTable::Gdtr, 0, 0xffff)?;
		self.set_table(DescTable::Idtr, 0, 0xffff)?;
		self.set_segment(
			Reg::Tr,
			0,
			SegDesc {
				base: 0,
				limit: 0,
				access: 0x8b,
			},
		)?;
		self.set_segment(
			Reg::Ldtr,
			0,
			SegDesc {
				base: 0,
				limit: 0xffff,
				access: 0x82,
			},
		)?;

		for reg in Reg::GPRS {
			self.set_reg(reg, 0)?;
		}
		// Family/model/stepping of a generic processor.
		self.set_reg(Reg::Rdx, 0xf00)?;
		self.hw.write_vmcs(VMCS_GUEST_IGNORE_IRQ, 0)?;
		self.hw.write_vmcs(VMCS_GUEST_ACTIVITY_STATE, 0)?;
		self.hw.write_vmcs(VMCS_CTRL_VMENTRY_IRQ_INFO, 0)?;
		Ok(())
	}

	/// Starts an application processor at the SIPI vector page `rip`.
	pub fn spinup_ap(&mut self, rip: u64) -> Result<()> {
		self.reset()?;
		self.set_segment(
			Reg::Cs,
			(rip >> 4) as u16,
			SegDesc {
				base: rip,
				limit: 0xffff,
				access: 0x9b,
			},
		)?;
		self.set_reg(Reg::Rip, 0)
	}

	/// Applies register state prepared by a firmware loader.
	pub fn apply_boot_state(&mut self, state: &BootState) -> Result<()> {
		for (reg, selector, desc) in &state.segments {
			self.set_segment(*reg, *selector, *desc)?;
		}
		if let Some((base, limit)) = state.gdtr {
			self.set_table(DescTable::Gdtr, base, limit)?;
		}
		if let Some((base, limit)) = state.idtr {
			self.set_table(DescTable::Idtr, base, limit)?;
		}
		if let Some(efer) = state.efer {
			self.set_efer(efer)?;
		}
		// CR0 last: enabling paging looks at EFER and CR4.
		for (reg, value) in state.regs.iter().filter(|(r, _)| *r != Reg::Cr0) {
			self.set_reg(*reg, *value)?;
		}
		if let Some((_, cr0)) = state.regs.iter().find(|(r, _)| *r == Reg::Cr0) {
			self.set_cr0(*cr0)?;
		}
		Ok(())
	}

	pub fn paging(&self) -> Result<GuestPaging> {
		let cr0 = self.hw.read_vmcs(VMCS_GUEST_CR0)?;
		let cr4 = self.hw.read_vmcs(VMCS_GUEST_CR4)?;
		let efer = self.efer()?;
		let cs_ar = self.hw.read_vmcs(VMCS_GUEST_CS_AR)?;
		let ss_ar = self.hw.read_vmcs(VMCS_GUEST_SS_AR)?;

		let cpu_mode = if efer & EFER_LMA != 0 {
			if cs_ar & SEG_AR_L != 0 {
				CpuMode::Long
			} else {
				CpuMode::Compatibility
			}
		} else if cr0 & CR0_PE != 0 {
			CpuMode::Protected
		} else {
			CpuMode::Real
		};
		let paging_mode = if cr0 & CR0_PG == 0 {
			PagingMode::Flat
		} else if cr4 & CR4_PAE == 0 {
			PagingMode::Bits32
		} else if efer & EFER_LME != 0 {
			PagingMode::Long
		} else {
			PagingMode::Pae
		};
		Ok(GuestPaging {
			cr3: self.hw.read_vmcs(VMCS_GUEST_CR3)?,
			cpl: ((ss_ar >> 5) & 3) as u8,
			cpu_mode,
			paging_mode,
		})
	}

	fn set_procbased(&mut self, bits: u64, enable: bool) -> Result<()> {
		let new = if enable {
			self.procbased | bits
		} else {
			self.procbased & !bits
		};
		if new != self.procbased {
			self.procbased = new;
			self.hw.write_vmcs(VMCS_CTRL_CPU_BASED, new)?;
		}
		Ok(())
	}

	fn restore_nmi_blocking(&mut self) -> Result<()> {
		let gi = self.hw.read_vmcs(VMCS_GUEST_IGNORE_IRQ)?;
		self.hw
			.write_vmcs(VMCS_GUEST_IGNORE_IRQ, gi | INTERRUPTIBILITY_NMI_BLOCKING)
	}

	fn clear_nmi_blocking(&mut self) -> Result<()> {
		let gi = self.hw.read_vmcs(VMCS_GUEST_IGNORE_IRQ)?;
		self.hw
			.write_vmcs(VMCS_GUEST_IGNORE_IRQ, gi & !INTERRUPTIBILITY_NMI_BLOCKING)
	}

	/// Runs the guest from `rip` until an exit needs outside attention.
	pub fn run(&mut self, rip: u64) -> Result<()> {
		let vm = Arc::clone(&self.vm);
		self.hw.write_reg(Reg::Rip, rip)?;
		let mut rip = rip;
		loop {
			self.inject_interrupts(&vm, rip)?;

			let how = vm.suspend_state();
			if how != SuspendHow::None {
				self.exit = VmExit {
					rip,
					inst_length: 0,
					kind: ExitKind::Suspended { how },
				};
				self.stats.increment_val(ExitStat::Suspended);
				break;
			}
			if vm.rendezvous.pending_for(self.id) {
				self.exit = VmExit {
					rip,
					inst_length: 0,
					kind: ExitKind::Rendezvous,
				};
				self.stats.increment_val(ExitStat::Rendezvous);
				break;
			}
			if vm.is_paused() {
				self.exit = VmExit {
					rip,
					inst_length: 0,
					kind: ExitKind::ReqIdle,
				};
				self.stats.increment_val(ExitStat::ReqIdle);
				break;
			}

			self.hw.run()?;
			self.stats.increment_val(ExitStat::Total);

			rip = self.hw.read_reg(Reg::Rip)?;
			self.exit = VmExit {
				rip,
				inst_length: self.hw.read_vmcs(VMCS_RO_VMEXIT_INSTR_LEN)?,
				kind: ExitKind::Bogus,
			};
			self.last_exit_rip = rip;

			if !self.exit_process(&vm)? {
				break;
			}
		}
		if !matches!(
			self.exit.kind,
			ExitKind::Suspended { .. } | ExitKind::Rendezvous | ExitKind::ReqIdle
		) {
			self.stats.increment_val(ExitStat::Userspace);
		}
		Ok(())
	}

	fn inject_interrupts(&mut self, vm: &Vm, guest_rip: u64) -> Result<()> {
		if self.last_exit_rip != guest_rip {
			let gi = self.hw.read_vmcs(VMCS_GUEST_IGNORE_IRQ)?;
			if gi & HWINTR_BLOCKING != 0 {
				trace!(
					"vCPU {}: interrupt shadow cleared, rip moved {:#x} -> {guest_rip:#x}",
					self.id, self.last_exit_rip
				);
				self.hw
					.write_vmcs(VMCS_GUEST_IGNORE_IRQ, gi & !HWINTR_BLOCKING)?;
			}
		}

		if let Some(mut info) = vm.entry_intinfo(self.id)? {
			let vector = (info & 0xff) as u8;
			if info & VMCS_INTR_T_MASK == VMCS_INTR_T_HWEXCEPTION
				&& (vector == IDT_BP || vector == IDT_OF)
			{
				// INT3 and INTO are delivered as software exceptions.
				info = (info & !VMCS_INTR_T_MASK) | VMCS_INTR_T_SWEXCEPTION;
			}
			if info & VMCS_INTR_DEL_ERRCODE != 0 {
				self.hw
					.write_vmcs(VMCS_CTRL_VMENTRY_EXC_ERROR, info >> 32)?;
			}
			self.hw
				.write_vmcs(VMCS_CTRL_VMENTRY_IRQ_INFO, info & 0xffff_ffff)?;
		}

		if vm.nmi_pending(self.id) {
			let gi = self.hw.read_vmcs(VMCS_GUEST_IGNORE_IRQ)?;
			if gi & NMI_BLOCKING != 0 {
				self.set_procbased(CPU_BASED_VIRTUAL_NMI_WND, true)?;
			} else {
				let info = self.hw.read_vmcs(VMCS_CTRL_VMENTRY_IRQ_INFO)?;
				if info & VMCS_INTR_VALID == 0 {
					self.hw.write_vmcs(
						VMCS_CTRL_VMENTRY_IRQ_INFO,
						IDT_NMI as u64 | VMCS_INTR_T_NMI | VMCS_INTR_VALID,
					)?;
					vm.nmi_clear(self.id);
					trace!("vCPU {}: injected NMI", self.id);
				} else {
					trace!("vCPU {}: NMI waits for pending entry event", self.id);
				}
			}
		}

		// An open window already guarantees another pass through here.
		if self.procbased & CPU_BASED_IRQ_WND != 0 {
			return Ok(());
		}

		let lapic = vm.lapic(self.id)?;
		let extint = vm.extint_pending(self.id);
		let vector = if extint {
			match vm.atpic.pending_intr() {
				Some(vector) => vector,
				None => return Ok(()),
			}
		} else {
			match lapic.pending_intr() {
				Some(vector) => vector,
				None => return Ok(()),
			}
		};

		let rflags = self.hw.read_reg(Reg::Rflags)?;
		let gi = self.hw.read_vmcs(VMCS_GUEST_IGNORE_IRQ)?;
		let info = self.hw.read_vmcs(VMCS_CTRL_VMENTRY_IRQ_INFO)?;
		if rflags & PSL_I == 0 || gi & HWINTR_BLOCKING != 0 || info & VMCS_INTR_VALID != 0 {
			return self.set_procbased(CPU_BASED_IRQ_WND, true);
		}

		self.hw.write_vmcs(
			VMCS_CTRL_VMENTRY_IRQ_INFO,
			vector as u64 | VMCS_INTR_T_HWINTR | VMCS_INTR_VALID,
		)?;
		if extint {
			vm.extint_clear(self.id);
			vm.atpic.intr_accepted(vm, vector);
			// The PIC may already have the next vector lined up.
			self.set_procbased(CPU_BASED_IRQ_WND, true)?;
		} else {
			lapic.intr_accepted(vector);
		}
		trace!("vCPU {}: injected vector {vector:#x}", self.id);
		Ok(())
	}

	/// Classifies the exit in `self.exit`. Returns whether the guest can be
	/// re-entered right away.
	fn exit_process(&mut self, vm: &Vm) -> Result<bool> {
		let raw_reason = self.hw.read_vmcs(VMCS_RO_EXIT_REASON)? as u32;
		let qual = self.hw.read_vmcs(VMCS_RO_EXIT_QUALIFIC)?;

		if raw_reason & reason::ENTRY_FAIL != 0 {
			let error = self.hw.read_vmcs(VMCS_RO_INSTR_ERROR)?;
			error!(
				"vCPU {}: VM entry failed (reason {:#x}, error {error})\n{}",
				self.id,
				raw_reason,
				self.dump()
			);
			return Err(VmmError::EntryFailed {
				vcpu: self.id,
				error,
			});
		}
		let exit_reason = raw_reason & 0xffff;

		let idtvec_info = self.hw.read_vmcs(VMCS_RO_IDT_VECTOR_INFO)?;
		if idtvec_info & VMCS_IDT_VEC_VALID != 0 {
			// Bit 12 is undefined in IDT-vectoring information.
			let idtvec_info = idtvec_info & !(1 << 12);
			let mut info = idtvec_info;
			if idtvec_info & VMCS_IDT_VEC_ERRCODE_VALID != 0 {
				info |= self.hw.read_vmcs(VMCS_RO_IDT_VECTOR_ERROR)? << 32;
			}
			vm.exit_intinfo(self.id, info)?;

			let kind = idtvec_info & VMCS_INTR_T_MASK;
			if kind == VMCS_INTR_T_NMI && exit_reason != reason::TASK {
				// NMI blocking must not survive an NMI that never got
				// delivered; a task gate starts the new task blocked.
				self.clear_nmi_blocking()?;
			}
			if matches!(
				kind,
				VMCS_INTR_T_SWINTR | VMCS_INTR_T_PRIV_SWEXCEPTION | VMCS_INTR_T_SWEXCEPTION
			) {
				self.hw
					.write_vmcs(VMCS_CTRL_VMENTRY_INSTR_LEN, self.exit.inst_length)?;
			}
		}

		let handled = match exit_reason {
			reason::TASK => {
				self.stats.increment_val(ExitStat::TaskSwitch);
				self.task_switch(qual, idtvec_info)?;
				false
			}
			reason::MOV_CR => {
				self.stats.increment_val(ExitStat::CrAccess);
				match qual & 0xf {
					0 | 4 => self.emulate_cr_write(qual)?,
					8 => self.emulate_cr8_access(vm, qual)?,
					_ => false,
				}
			}
			reason::RDMSR => {
				self.stats.increment_val(ExitStat::Rdmsr);
				self.emulate_rdmsr(vm)?
			}
			reason::WRMSR => {
				self.stats.increment_val(ExitStat::Wrmsr);
				self.emulate_wrmsr(vm)?
			}
			reason::HLT => {
				self.stats.increment_val(ExitStat::Hlt);
				self.exit.kind = ExitKind::Hlt {
					rflags: self.hw.read_reg(Reg::Rflags)?,
				};
				false
			}
			reason::MTF => {
				self.stats.increment_val(ExitStat::Mtrap);
				self.exit.kind = ExitKind::Mtrap;
				self.exit.inst_length = 0;
				false
			}
			reason::PAUSE => {
				self.stats.increment_val(ExitStat::Pause);
				self.exit.kind = ExitKind::Pause;
				false
			}
			reason::IRQ => {
				self.stats.increment_val(ExitStat::ExtInt);
				true
			}
			reason::IRQ_WND => {
				self.stats.increment_val(ExitStat::IntrWindow);
				self.set_procbased(CPU_BASED_IRQ_WND, false)?;
				true
			}
			reason::VIRTUAL_NMI_WND => {
				self.stats.increment_val(ExitStat::NmiWindow);
				self.set_procbased(CPU_BASED_VIRTUAL_NMI_WND, false)?;
				true
			}
			reason::IO => {
				self.classify_inout(qual)?;
				false
			}
			reason::CPUID => {
				self.stats.increment_val(ExitStat::Cpuid);
				self.emulate_cpuid(vm)?;
				true
			}
			reason::EXC_NMI => self.exception(vm, idtvec_info)?,
			reason::TRIPLE_FAULT => {
				warn!("vCPU {}: triple fault at {:#x}", self.id, self.exit.rip);
				if let Err(e) = vm.suspend(SuspendHow::TripleFault) {
					debug!("vCPU {}: triple fault after suspend: {e}", self.id);
				}
				// The guest is dead; leave RIP on the faulting instruction.
				self.exit.inst_length = 0;
				self.exit.kind = ExitKind::Suspended {
					how: vm.suspend_state(),
				};
				self.stats.increment_val(ExitStat::Suspended);
				false
			}
			reason::EPT_VIOLATION => {
				self.stats.increment_val(ExitStat::EptFault);
				self.ept_violation(qual, idtvec_info)?;
				false
			}
			reason::XSETBV => {
				self.stats.increment_val(ExitStat::Xsetbv);
				self.emulate_xsetbv(vm)?;
				true
			}
			reason::MONITOR => {
				self.stats.increment_val(ExitStat::Monitor);
				self.exit.kind = ExitKind::Monitor;
				false
			}
			reason::MWAIT => {
				self.stats.increment_val(ExitStat::Mwait);
				self.exit.kind = ExitKind::Mwait;
				false
			}
			reason::VMCALL..=reason::VMXON
			| reason::INVEPT
			| reason::INVVPID
			| reason::VMFUNC => {
				debug!(
					"vCPU {}: VMX instruction (reason {exit_reason}) raises #UD",
					self.id
				);
				vm.inject_ud(self)?;
				true
			}
			_ => {
				self.stats.increment_val(ExitStat::Unknown);
				false
			}
		};

		if handled {
			self.exit.rip = self.exit.rip.wrapping_add(self.exit.inst_length);
			self.exit.inst_length = 0;
			self.hw.write_reg(Reg::Rip, self.exit.rip)?;
		} else if self.exit.kind == ExitKind::Bogus {
			self.exit.kind = ExitKind::Vmx(VmxExitInfo {
				status: 0,
				exit_reason,
				exit_qualification: qual,
				inst_type: 0,
				inst_error: self.hw.read_vmcs(VMCS_RO_INSTR_ERROR)?,
			});
		}
		Ok(handled)
	}

	fn task_switch(&mut self, qual: u64, idtvec_info: u64) -> Result<()> {
		let reason = match (qual >> 30) & 3 {
			0 => TaskSwitchReason::Call,
			1 => TaskSwitchReason::Iret,
			2 => TaskSwitchReason::Jmp,
			_ => TaskSwitchReason::IdtGate,
		};
		let mut ext = false;
		let mut errcode = None;
		if reason == TaskSwitchReason::IdtGate && idtvec_info & VMCS_IDT_VEC_VALID != 0 {
			let kind = idtvec_info & VMCS_INTR_T_MASK;
			if !matches!(
				kind,
				VMCS_INTR_T_SWINTR | VMCS_INTR_T_SWEXCEPTION | VMCS_INTR_T_PRIV_SWEXCEPTION
			) {
				// The saved RIP already points at the interrupted
				// instruction.
				ext = true;
				self.exit.inst_length = 0;
				if idtvec_info & VMCS_IDT_VEC_ERRCODE_VALID != 0 {
					errcode = Some(self.hw.read_vmcs(VMCS_RO_IDT_VECTOR_ERROR)? as u32);
				}
			}
		}
		self.exit.kind = ExitKind::TaskSwitch(TaskSwitch {
			reason,
			tsssel: qual as u16,
			ext,
			errcode,
			paging: self.paging()?,
		});
		Ok(())
	}

	/// `mov crN, reg` for CR0 and CR4.
	fn emulate_cr_write(&mut self, qual: u64) -> Result<bool> {
		if qual & 0xf0 != 0 {
			return Ok(false);
		}
		let value = self.hw.read_reg(Reg::gpr(((qual >> 8) & 0xf) as usize))?;
		if qual & 0xf == 0 {
			trace!("vCPU {}: cr0 <- {value:#x}", self.id);
			self.set_cr0(value)?;
		} else {
			trace!("vCPU {}: cr4 <- {value:#x}", self.id);
			self.set_cr4(value)?;
		}
		Ok(true)
	}

	fn emulate_cr8_access(&mut self, vm: &Vm, qual: u64) -> Result<bool> {
		// Only `mov` to or from CR8.
		if qual & 0xe0 != 0 {
			return Ok(false);
		}
		let lapic = vm.lapic(self.id)?;
		let reg = Reg::gpr(((qual >> 8) & 0xf) as usize);
		if qual & 0x10 != 0 {
			self.hw.write_reg(reg, lapic.cr8())?;
		} else {
			let value = self.hw.read_reg(reg)?;
			if value & !0xf != 0 {
				return vm.inject_gp(self).map(|_| true);
			}
			lapic.set_cr8(value);
		}
		Ok(true)
	}

	fn emulate_cpuid(&mut self, vm: &Vm) -> Result<()> {
		let leaf = self.hw.read_reg(Reg::Rax)? as u32;
		let subleaf = self.hw.read_reg(Reg::Rcx)? as u32;
		let ctx = CpuidContext {
			vcpu: self.id,
			x2apic: vm.x2apic_state(self.id)? == X2apicState::Enabled,
			cr4: self.hw.read_vmcs(VMCS_CTRL_CR4_SHADOW)?,
		};
		let regs = vm.cpuid.emulate(ctx, leaf, subleaf);
		for (reg, value) in [Reg::Rax, Reg::Rbx, Reg::Rcx, Reg::Rdx].into_iter().zip(regs) {
			self.hw.write_reg(reg, value as u64)?;
		}
		Ok(())
	}

	fn emulate_rdmsr(&mut self, vm: &Vm) -> Result<bool> {
		let num = self.hw.read_reg(Reg::Rcx)? as u32;
		let result = if is_lapic_msr(num) {
			vm.lapic(self.id)?.rdmsr(vm, num).map(Some)
		} else {
			self.rdmsr(vm, num)
		};
		match result {
			Ok(Some(value)) => {
				trace!("vCPU {}: rdmsr {num:#x} -> {value:#x}", self.id);
				self.hw.write_reg(Reg::Rax, value & 0xffff_ffff)?;
				self.hw.write_reg(Reg::Rdx, value >> 32)?;
				Ok(true)
			}
			Ok(None) => {
				self.exit.kind = ExitKind::Rdmsr { msr: num };
				Ok(false)
			}
			Err(VmmError::GuestFault(fault)) => {
				vm.inject_fault(self, fault)?;
				Ok(true)
			}
			Err(err) => Err(err),
		}
	}

	fn emulate_wrmsr(&mut self, vm: &Vm) -> Result<bool> {
		let num = self.hw.read_reg(Reg::Rcx)? as u32;
		let value = (self.hw.read_reg(Reg::Rdx)? << 32) | (self.hw.read_reg(Reg::Rax)? & 0xffff_ffff);
		trace!("vCPU {}: wrmsr {num:#x} <- {value:#x}", self.id);
		let result = if is_lapic_msr(num) {
			vm.lapic(self.id)?.wrmsr(vm, num, value).map(Some)
		} else {
			self.wrmsr(vm, num, value).map(|known| known.then_some(None))
		};
		match result {
			Ok(Some(None)) => Ok(true),
			Ok(Some(Some(kind))) => {
				self.exit.kind = kind;
				Ok(false)
			}
			Ok(None) => {
				self.exit.kind = ExitKind::Wrmsr { msr: num, value };
				Ok(false)
			}
			Err(VmmError::GuestFault(fault)) => {
				vm.inject_fault(self, fault)?;
				Ok(true)
			}
			Err(err) => Err(err),
		}
	}

	fn emulate_xsetbv(&mut self, vm: &Vm) -> Result<()> {
		let limits = vm.cpuid.xsave_limits();
		if self.hw.read_reg(Reg::Rcx)? != 0 {
			return vm.inject_gp(self);
		}
		if !limits.enabled || self.hw.read_vmcs(VMCS_GUEST_CR4)? & CR4_OSXSAVE == 0 {
			return vm.inject_ud(self);
		}
		let xcr0 = (self.hw.read_reg(Reg::Rdx)? << 32) | (self.hw.read_reg(Reg::Rax)? & 0xffff_ffff);
		let invalid = xcr0 & !limits.xcr0_allowed != 0
			|| xcr0 & XFEATURE_X87 == 0
			|| (xcr0 & XFEATURE_AVX != 0 && xcr0 & XFEATURE_SSE == 0)
			|| (xcr0 & XFEATURE_AVX512 != 0
				&& xcr0 & (XFEATURE_AVX512 | XFEATURE_AVX | XFEATURE_SSE)
					!= XFEATURE_AVX512 | XFEATURE_AVX | XFEATURE_SSE)
			|| ((xcr0 & XFEATURE_BNDREGS != 0) != (xcr0 & XFEATURE_BNDCSR != 0));
		if invalid {
			debug!("vCPU {}: rejected xcr0 {xcr0:#x}", self.id);
			return vm.inject_gp(self);
		}
		self.hw.write_reg(Reg::Xcr0, xcr0)
	}

	fn exception(&mut self, vm: &Vm, idtvec_info: u64) -> Result<bool> {
		let intr_info = self.hw.read_vmcs(VMCS_RO_VMEXIT_IRQ_INFO)?;
		if intr_info & VMCS_INTR_VALID == 0 {
			return Err(VmmError::UnhandledExit {
				reason: reason::EXC_NMI,
				qualification: intr_info,
			});
		}
		let vector = (intr_info & 0xff) as u8;
		let kind = intr_info & VMCS_INTR_T_MASK;

		// A fault during IRET unblocked virtual NMIs; the IRET is restarted.
		if idtvec_info & VMCS_IDT_VEC_VALID == 0 && intr_info & VMCS_INTR_NMI_UNBLOCKING != 0 {
			self.restore_nmi_blocking()?;
		}

		if kind == VMCS_INTR_T_NMI {
			self.stats.increment_val(ExitStat::Nmi);
			return Ok(true);
		}
		self.stats.increment_val(ExitStat::Exception);
		if vector == IDT_MC {
			warn!("vCPU {}: machine check", self.id);
			let _ = vm.suspend(SuspendHow::TripleFault);
			return Ok(true);
		}

		let errcode = if intr_info & VMCS_INTR_DEL_ERRCODE != 0 {
			Some(self.hw.read_vmcs(VMCS_RO_VMEXIT_IRQ_ERROR)? as u32)
		} else {
			None
		};
		debug!(
			"vCPU {}: reflecting exception {vector} ({errcode:?}) into the guest",
			self.id
		);
		vm.inject_exception(self, vector, errcode, false)?;
		Ok(true)
	}

	fn ept_violation(&mut self, qual: u64, idtvec_info: u64) -> Result<()> {
		let gpa = self.hw.read_vmcs(VMCS_GUEST_PHYSICAL_ADDRESS)?;
		if self.vm.mem().is_ram(gpa) {
			let fault_type = if qual & EPT_VIOLATION_DATA_WRITE != 0 {
				Prot::Write
			} else if qual & EPT_VIOLATION_INST_FETCH != 0 {
				Prot::Exec
			} else {
				Prot::Read
			};
			self.exit.inst_length = 0;
			self.exit.kind = ExitKind::Paging { gpa, fault_type };
		} else if is_emulation_fault(qual) {
			self.stats.increment_val(ExitStat::InstEmul);
			let paging = self.paging()?;
			let (cs_base, cs_d) = match paging.cpu_mode {
				CpuMode::Real => (self.hw.read_vmcs(VMCS_GUEST_CS_BASE)?, false),
				CpuMode::Protected | CpuMode::Compatibility => (
					self.hw.read_vmcs(VMCS_GUEST_CS_BASE)?,
					self.hw.read_vmcs(VMCS_GUEST_CS_AR)? & SEG_AR_DB != 0,
				),
				CpuMode::Long => (0, false),
			};
			let gla = if qual & EPT_VIOLATION_GLA_VALID != 0 {
				self.hw.read_vmcs(VMCS_RO_GUEST_LIN_ADDR)?
			} else {
				VIE_INVALID_GLA
			};
			self.exit.inst_length = 0;
			self.exit.kind = ExitKind::InstEmul(InstEmul {
				gpa,
				gla,
				cs_base,
				cs_d,
				paging,
			});
		}

		// As for exceptions: an EPT fault while executing IRET.
		if idtvec_info & VMCS_IDT_VEC_VALID == 0 && qual & VMCS_INTR_NMI_UNBLOCKING != 0 {
			self.restore_nmi_blocking()?;
		}
		Ok(())
	}

	fn classify_inout(&mut self, qual: u64) -> Result<()> {
		let inout = InoutExit {
			bytes: ((qual & 0x7) + 1) as u8,
			is_in: qual & 0x8 != 0,
			string: qual & 0x10 != 0,
			rep: qual & 0x20 != 0,
			port: (qual >> 16) as u16,
			eax: self.hw.read_reg(Reg::Rax)? as u32,
		};
		if !inout.string {
			self.stats.increment_val(ExitStat::Inout);
			self.exit.kind = ExitKind::Inout(inout);
			return Ok(());
		}

		self.stats.increment_val(ExitStat::InoutStr);
		let inst_info = self.hw.read_vmcs(VMCS_RO_VMX_INSTR_INFO)?;
		let seg = if inout.is_in {
			Seg::Es
		} else {
			Seg::from_index((inst_info >> 15) & 0x7).unwrap_or(Seg::Ds)
		};
		let addrsize = match (inst_info >> 7) & 0x7 {
			0 => 2,
			1 => 4,
			2 => 8,
			other => {
				return Err(VmmError::Emulation(format!(
					"invalid string I/O address size {other}"
				)));
			}
		};
		let index = if inout.is_in { Reg::Rdi } else { Reg::Rsi };
		self.exit.kind = ExitKind::InoutStr(InoutStrExit {
			inout,
			paging: self.paging()?,
			rflags: self.hw.read_reg(Reg::Rflags)?,
			cr0: self.hw.read_vmcs(VMCS_GUEST_CR0)?,
			index: self.hw.read_reg(index)?,
			count: if inout.rep {
				self.hw.read_reg(Reg::Rcx)?
			} else {
				1
			},
			addrsize,
			seg,
			seg_desc: self.desc(seg.reg())?,
		});
		Ok(())
	}

	/// Human-readable VMCS and register state.
	pub fn dump(&self) -> RegisterDump<'_> {
		RegisterDump(self)
	}
}

fn is_lapic_msr(num: u32) -> bool {
	num == msr::IA32_APIC_BASE || (msr::X2APIC_BASE..=msr::X2APIC_LAST).contains(&num)
}

/// An EPT fault the instruction emulator can complete: a data access
/// through a linear address.
fn is_emulation_fault(qual: u64) -> bool {
	if qual & EPT_VIOLATION_INST_FETCH != 0 {
		return false;
	}
	if qual & (EPT_VIOLATION_DATA_READ | EPT_VIOLATION_DATA_WRITE) == 0 {
		return false;
	}
	qual & EPT_VIOLATION_GLA_VALID != 0 && qual & EPT_VIOLATION_XLAT_VALID != 0
}

impl VieCpu for VmxVcpu {
	fn reg(&self, reg: Reg) -> Result<u64> {
		VmxVcpu::reg(self, reg)
	}

	fn set_reg(&mut self, reg: Reg, value: u64) -> Result<()> {
		VmxVcpu::set_reg(self, reg, value)
	}

	fn seg_desc(&self, seg: Seg) -> Result<SegDesc> {
		self.desc(seg.reg())
	}
}

pub struct RegisterDump<'a>(&'a VmxVcpu);

impl fmt::Display for RegisterDump<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let cpu = self.0;
		let vmcs = |field| cpu.hw.read_vmcs(field).map_err(|_| fmt::Error);
		let reg = |reg| cpu.hw.read_reg(reg).map_err(|_| fmt::Error);

		writeln!(f, "Dump state of CPU {}", cpu.id)?;
		writeln!(f, "VMCS:")?;
		writeln!(f, "-----")?;
		writeln!(
			f,
			"CR0: mask {:016x}  shadow {:016x}",
			vmcs(VMCS_CTRL_CR0_MASK)?,
			vmcs(VMCS_CTRL_CR0_SHADOW)?
		)?;
		writeln!(
			f,
			"CR4: mask {:016x}  shadow {:016x}",
			vmcs(VMCS_CTRL_CR4_MASK)?,
			vmcs(VMCS_CTRL_CR4_SHADOW)?
		)?;
		writeln!(
			f,
			"Pinbased: {:016x}\n1st:      {:016x}\n2nd:      {:016x}",
			vmcs(VMCS_CTRL_PIN_BASED)?,
			vmcs(VMCS_CTRL_CPU_BASED)?,
			vmcs(VMCS_CTRL_CPU_BASED2)?
		)?;
		writeln!(
			f,
			"Entry:    {:016x}\nExit:     {:016x}",
			vmcs(VMCS_CTRL_VMENTRY_CONTROLS)?,
			vmcs(VMCS_CTRL_VMEXIT_CONTROLS)?
		)?;

		writeln!(f, "\nRegisters:")?;
		writeln!(f, "----------")?;
		write!(
			f,
			"rip: {:016x}   rsp: {:016x} flags: {:016x}\n\
			rax: {:016x}   rbx: {:016x}   rcx: {:016x}\n\
			rdx: {:016x}   rsi: {:016x}   rdi: {:016x}\n\
			rbp: {:016x}    r8: {:016x}    r9: {:016x}\n\
			r10: {:016x}   r11: {:016x}   r12: {:016x}\n\
			r13: {:016x}   r14: {:016x}   r15: {:016x}\n",
			reg(Reg::Rip)?,
			reg(Reg::Rsp)?,
			reg(Reg::Rflags)?,
			reg(Reg::Rax)?,
			reg(Reg::Rbx)?,
			reg(Reg::Rcx)?,
			reg(Reg::Rdx)?,
			reg(Reg::Rsi)?,
			reg(Reg::Rdi)?,
			reg(Reg::Rbp)?,
			reg(Reg::R8)?,
			reg(Reg::R9)?,
			reg(Reg::R10)?,
			reg(Reg::R11)?,
			reg(Reg::R12)?,
			reg(Reg::R13)?,
			reg(Reg::R14)?,
			reg(Reg::R15)?,
		)?;
		writeln!(
			f,
			"cr0: {:016x}   cr2: {:016x}   cr3: {:016x}\ncr4: {:016x}  efer: {:016x}",
			vmcs(VMCS_GUEST_CR0)?,
			reg(Reg::Cr2)?,
			vmcs(VMCS_GUEST_CR3)?,
			vmcs(VMCS_GUEST_CR4)?,
			vmcs(VMCS_GUEST_IA32_EFER)?
		)?;

		writeln!(f, "\nSegment registers:")?;
		writeln!(f, "------------------")?;
		writeln!(
			f,
			"register  selector  base              limit     type  p dpl db s l g avl"
		)?;
		for (name, r) in [
			("cs", Reg::Cs),
			("ss", Reg::Ss),
			("ds", Reg::Ds),
			("es", Reg::Es),
			("fs", Reg::Fs),
			("gs", Reg::Gs),
			("tr", Reg::Tr),
			("ldtr", Reg::Ldtr),
		] {
			let selector = reg(r)?;
			let desc = cpu.desc(r).map_err(|_| fmt::Error)?;
			let ar = desc.access;
			writeln!(
				f,
				"{name:<8}  {selector:04x}      {:016x}  {:08x}  {:>2x}    {} {}   {}  {} {} {} {}",
				desc.base,
				desc.limit,
				ar & 0xf,
				(ar >> 7) & 1,
				(ar >> 5) & 3,
				(ar >> 14) & 1,
				(ar >> 4) & 1,
				(ar >> 13) & 1,
				(ar >> 15) & 1,
				(ar >> 12) & 1,
			)?;
		}
		let (gdt_base, gdt_limit) = cpu.table(DescTable::Gdtr).map_err(|_| fmt::Error)?;
		let (idt_base, idt_limit) = cpu.table(DescTable::Idtr).map_err(|_| fmt::Error)?;
		writeln!(f, "gdt                 {gdt_base:016x}  {gdt_limit:08x}")?;
		writeln!(f, "idt                 {idt_base:016x}  {idt_limit:08x}")
	}
}

#[cfg(test)]
mod tests {
	use super::{mock::*, *};
	use crate::vm::VmConfig;

	fn vcpu_with(script: Vec<MockExit>) -> (Arc<MockBackend>, VmxVcpu) {
		let backend = Arc::new(MockBackend::new().script(0, script));
		let vm = Vm::create(backend.clone(), VmConfig::default()).unwrap();
		vm.activate_cpu(0).unwrap();
		let vcpu = VmxVcpu::new(vm, 0).unwrap();
		(backend, vcpu)
	}

	fn run(vcpu: &mut VmxVcpu, rip: u64) {
		let vm = vcpu.vm().clone();
		vm.vcpu_set_state(0, crate::vm::VcpuState::Frozen, true).unwrap();
		vm.vcpu_set_state(0, crate::vm::VcpuState::Running, false).unwrap();
		vcpu.run(rip).unwrap();
		vm.vcpu_set_state(0, crate::vm::VcpuState::Frozen, false).unwrap();
		vm.vcpu_set_state(0, crate::vm::VcpuState::Idle, false).unwrap();
	}

	#[test]
	fn reset_state() {
		let (_, vcpu) = vcpu_with(vec![]);
		assert_eq!(vcpu.rip().unwrap(), 0xfff0);
		assert_eq!(vcpu.reg(Reg::Rdx).unwrap(), 0xf00);
		let cs = vcpu.desc(Reg::Cs).unwrap();
		assert_eq!(cs.base, 0xffff_0000);
		assert_eq!(vcpu.reg(Reg::Cs).unwrap(), 0xf000);
		assert_eq!(vcpu.read_vmcs(VMCS_CTRL_CR0_SHADOW).unwrap(), CR0_NE);
		assert_eq!(vcpu.paging().unwrap().cpu_mode, CpuMode::Real);
	}

	#[test]
	fn ap_start_vector() {
		let (_, mut vcpu) = vcpu_with(vec![]);
		vcpu.spinup_ap(0x9f000).unwrap();
		assert_eq!(vcpu.reg(Reg::Cs).unwrap(), 0x9f00);
		assert_eq!(vcpu.desc(Reg::Cs).unwrap().base, 0x9f000);
		assert_eq!(vcpu.rip().unwrap(), 0);
	}

	#[test]
	fn cpuid_is_handled_in_the_loop() {
		let (_, mut vcpu) = vcpu_with(vec![
			MockExit::new(reason::CPUID)
				.inst_len(2)
				.reg(Reg::Rip, 0x1000)
				.reg(Reg::Rax, 0x4000_0000),
		]);
		run(&mut vcpu, 0x1000);
		// The exhausted script ends with HLT after the CPUID.
		assert!(matches!(vcpu.exit.kind, ExitKind::Hlt { .. }));
		assert_eq!(vcpu.reg(Reg::Rip).unwrap(), 0x1002);
		assert_eq!(vcpu.reg(Reg::Rbx).unwrap(), 0x7679_6862);
		assert_eq!(vcpu.stats().get(ExitStat::Cpuid), 1);
	}

	#[test]
	fn paging_enable_sets_long_mode() {
		let (_, mut vcpu) = vcpu_with(vec![]);
		vcpu.set_efer(EFER_LME).unwrap();
		vcpu.set_cr4(CR4_PAE).unwrap();
		vcpu.set_cr0(CR0_PG | CR0_PE | CR0_NE).unwrap();
		assert_ne!(vcpu.efer().unwrap() & EFER_LMA, 0);
		assert_ne!(
			vcpu.read_vmcs(VMCS_CTRL_VMENTRY_CONTROLS).unwrap() & VMENTRY_GUEST_IA32E,
			0
		);
		assert_eq!(vcpu.paging().unwrap().paging_mode, PagingMode::Long);
		vcpu.set_cr0(CR0_PE).unwrap();
		assert_eq!(vcpu.efer().unwrap() & EFER_LMA, 0);
	}

	#[test]
	fn mov_to_cr0_updates_shadow() {
		let (_, mut vcpu) = vcpu_with(vec![
			MockExit::new(reason::MOV_CR)
				// mov cr0, rbx
				.qual(3 << 8)
				.inst_len(3)
				.reg(Reg::Rbx, CR0_PE | CR0_NE | CR0_ET),
		]);
		run(&mut vcpu, 0x7c00);
		assert_eq!(
			vcpu.read_vmcs(VMCS_CTRL_CR0_SHADOW).unwrap(),
			CR0_PE | CR0_NE | CR0_ET
		);
		assert_eq!(vcpu.stats().get(ExitStat::CrAccess), 1);
	}

	#[test]
	fn vmx_instruction_raises_ud() {
		let (backend, mut vcpu) = vcpu_with(vec![
			MockExit::new(reason::VMCALL).inst_len(3).reg(Reg::Rip, 0x2000),
		]);
		run(&mut vcpu, 0x2000);
		let injected = backend.record(0).injected();
		assert_eq!(
			injected[0],
			IDT_UD as u64 | VMCS_INTR_T_HWEXCEPTION | VMCS_INTR_VALID
		);
		// The faulting instruction is restarted.
		assert_eq!(backend.record(0).entries()[1].rip, 0x2000);
	}

	#[test]
	fn xsetbv_with_nonzero_index_faults() {
		let (backend, mut vcpu) = vcpu_with(vec![
			MockExit::new(reason::XSETBV)
				.inst_len(3)
				.reg(Reg::Rip, 0x3000)
				.reg(Reg::Rcx, 1),
		]);
		run(&mut vcpu, 0x3000);
		let injected = backend.record(0).injected();
		assert_eq!(injected[0] & 0xff, IDT_GP as u64);
		assert_ne!(injected[0] & VMCS_INTR_DEL_ERRCODE, 0);
	}

	#[test]
	fn triple_fault_suspends_in_place() {
		let (backend, mut vcpu) = vcpu_with(vec![
			MockExit::new(reason::TRIPLE_FAULT)
				.inst_len(2)
				.reg(Reg::Rip, 0x5000),
		]);
		run(&mut vcpu, 0x5000);
		assert_eq!(
			vcpu.exit.kind,
			ExitKind::Suspended {
				how: SuspendHow::TripleFault
			}
		);
		assert_eq!(vcpu.exit.rip, 0x5000);
		assert_eq!(vcpu.exit.inst_length, 0);
		assert_eq!(vcpu.rip().unwrap(), 0x5000);
		assert_eq!(vcpu.vm().suspend_state(), SuspendHow::TripleFault);
		// No further entry once the VM is suspended.
		assert_eq!(backend.record(0).entries().len(), 1);
	}

	#[test]
	fn unknown_exit_surfaces_raw_info() {
		let (_, mut vcpu) = vcpu_with(vec![MockExit::new(reason::RDPMC).qual(7)]);
		run(&mut vcpu, 0);
		assert_eq!(
			vcpu.exit.kind,
			ExitKind::Vmx(VmxExitInfo {
				exit_reason: reason::RDPMC,
				exit_qualification: 7,
				..Default::default()
			})
		);
	}

	#[test]
	fn string_out_collateral() {
		let (_, mut vcpu) = vcpu_with(vec![
			MockExit::new(reason::IO)
				// rep outsb to port 0x3f8
				.qual(0x3f8 << 16 | 0x30)
				.field(VMCS_RO_VMX_INSTR_INFO, 1 << 7 | 3 << 15)
				.reg(Reg::Rsi, 0x5000)
				.reg(Reg::Rcx, 9),
		]);
		run(&mut vcpu, 0);
		let ExitKind::InoutStr(io) = vcpu.exit.kind else {
			panic!("unexpected {:?}", vcpu.exit.kind);
		};
		assert_eq!(io.inout.port, 0x3f8);
		assert_eq!(io.inout.bytes, 1);
		assert!(io.inout.rep && !io.inout.is_in);
		assert_eq!(io.seg, Seg::Ds);
		assert_eq!(io.addrsize, 4);
		assert_eq!(io.index, 0x5000);
		assert_eq!(io.count, 9);
	}

	#[test]
	fn ept_fault_outside_ram_needs_emulation() {
		let (_, mut vcpu) = vcpu_with(vec![
			MockExit::new(reason::EPT_VIOLATION)
				.qual(EPT_VIOLATION_DATA_WRITE | EPT_VIOLATION_GLA_VALID | EPT_VIOLATION_XLAT_VALID)
				.field(VMCS_GUEST_PHYSICAL_ADDRESS, IOAPIC_BASE + 0x10)
				.field(VMCS_RO_GUEST_LIN_ADDR, IOAPIC_BASE + 0x10),
		]);
		run(&mut vcpu, 0);
		let ExitKind::InstEmul(emul) = vcpu.exit.kind else {
			panic!("unexpected {:?}", vcpu.exit.kind);
		};
		assert_eq!(emul.gpa, IOAPIC_BASE + 0x10);
		assert_eq!(vcpu.exit.inst_length, 0);
	}

	#[test]
	fn dump_has_segment_table() {
		let (_, vcpu) = vcpu_with(vec![]);
		let dump = vcpu.dump().to_string();
		assert!(dump.starts_with("Dump state of CPU 0"));
		assert!(dump.contains("register  selector  base"));
		assert!(dump.contains("ffff0000"));
	}
}
