//! The seam between the VMM core and the host virtualization primitive.

use std::sync::Arc;

use crate::error::Result;

/// Architectural registers that are accessed by name rather than by VMCS
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
	Rip,
	Rflags,
	Rax,
	Rcx,
	Rdx,
	Rbx,
	Rsi,
	Rdi,
	Rsp,
	Rbp,
	R8,
	R9,
	R10,
	R11,
	R12,
	R13,
	R14,
	R15,
	Cs,
	Ss,
	Ds,
	Es,
	Fs,
	Gs,
	Ldtr,
	Tr,
	Cr0,
	Cr2,
	Cr3,
	Cr4,
	Dr7,
	Xcr0,
}

impl Reg {
	/// General purpose registers in ModRM encoding order.
	pub const GPRS: [Reg; 16] = [
		Reg::Rax,
		Reg::Rcx,
		Reg::Rdx,
		Reg::Rbx,
		Reg::Rsp,
		Reg::Rbp,
		Reg::Rsi,
		Reg::Rdi,
		Reg::R8,
		Reg::R9,
		Reg::R10,
		Reg::R11,
		Reg::R12,
		Reg::R13,
		Reg::R14,
		Reg::R15,
	];

	pub fn gpr(index: usize) -> Reg {
		Self::GPRS[index & 0xf]
	}
}

/// VMX capability registers reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
	PinBased,
	ProcBased,
	ProcBased2,
	Entry,
	Exit,
}

impl CapKind {
	pub fn name(self) -> &'static str {
		match self {
			CapKind::PinBased => "pin-based controls",
			CapKind::ProcBased => "primary processor-based controls",
			CapKind::ProcBased2 => "secondary processor-based controls",
			CapKind::Entry => "VM-entry controls",
			CapKind::Exit => "VM-exit controls",
		}
	}
}

/// Guest view of a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPerm {
	Read,
	ReadExec,
	ReadWriteExec,
}

/// Forces a running vCPU out of guest mode. Callable from any thread.
pub trait Kick: Send + Sync {
	fn kick(&self);
}

/// One hardware vCPU. Owned and driven by a single host thread.
pub trait VirtualCpu {
	fn read_vmcs(&self, field: u32) -> Result<u64>;
	fn write_vmcs(&mut self, field: u32, value: u64) -> Result<()>;
	fn read_reg(&self, reg: Reg) -> Result<u64>;
	fn write_reg(&mut self, reg: Reg, value: u64) -> Result<()>;
	/// Lets the guest access `msr` without exiting.
	fn enable_native_msr(&mut self, msr: u32, enable: bool) -> Result<()>;
	/// Enters the guest and returns on the next VM exit.
	fn run(&mut self) -> Result<()>;
	fn kicker(&self) -> Arc<dyn Kick>;
}

/// Process-wide virtualization host.
pub trait Backend: Send + Sync {
	fn read_cap(&self, cap: CapKind) -> Result<u64>;
	/// Maps `len` bytes of host memory at `host` to guest physical `gpa`.
	fn map(&self, host: *mut u8, gpa: u64, len: usize, perm: MemPerm) -> Result<()>;
	/// Changes the guest permissions of an already mapped range.
	fn protect(&self, gpa: u64, len: usize, perm: MemPerm) -> Result<()>;
	/// Must be called on the thread that will drive the vCPU.
	fn create_vcpu(&self, id: usize) -> Result<Box<dyn VirtualCpu>>;
}
