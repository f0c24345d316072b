use std::sync::Arc;

use xhypervisor::{Register, VirtualCpu as HvVcpu};

use crate::{
	error::{Result, VmmError},
	vmx::backend::{Kick, Reg, VirtualCpu},
};

#[link(name = "Hypervisor", kind = "framework")]
unsafe extern "C" {
	fn hv_vcpu_interrupt(vcpus: *mut u32, vcpu_count: u32) -> i32;
}

const HV_SUCCESS: i32 = 0;

fn hv_reg(reg: Reg) -> Register {
	match reg {
		Reg::Rip => Register::RIP,
		Reg::Rflags => Register::RFLAGS,
		Reg::Rax => Register::RAX,
		Reg::Rcx => Register::RCX,
		Reg::Rdx => Register::RDX,
		Reg::Rbx => Register::RBX,
		Reg::Rsi => Register::RSI,
		Reg::Rdi => Register::RDI,
		Reg::Rsp => Register::RSP,
		Reg::Rbp => Register::RBP,
		Reg::R8 => Register::R8,
		Reg::R9 => Register::R9,
		Reg::R10 => Register::R10,
		Reg::R11 => Register::R11,
		Reg::R12 => Register::R12,
		Reg::R13 => Register::R13,
		Reg::R14 => Register::R14,
		Reg::R15 => Register::R15,
		Reg::Cs => Register::CS,
		Reg::Ss => Register::SS,
		Reg::Ds => Register::DS,
		Reg::Es => Register::ES,
		Reg::Fs => Register::FS,
		Reg::Gs => Register::GS,
		Reg::Ldtr => Register::LDTR,
		Reg::Tr => Register::TR,
		Reg::Cr0 => Register::CR0,
		Reg::Cr2 => Register::CR2,
		Reg::Cr3 => Register::CR3,
		Reg::Cr4 => Register::CR4,
		Reg::Dr7 => Register::DR7,
		Reg::Xcr0 => Register::XCR0,
	}
}

/// Interrupts a vCPU by its framework id.
struct HvfKick(u32);

impl Kick for HvfKick {
	fn kick(&self) {
		let mut id = self.0;
		// SAFETY: the id array has exactly one element.
		let ret = unsafe { hv_vcpu_interrupt(&mut id, 1) };
		if ret != HV_SUCCESS {
			warn!("hv_vcpu_interrupt({id}) failed: {ret:#x}");
		}
	}
}

/// A Hypervisor.framework vCPU. Bound to the thread that created it.
pub struct HvfCpu {
	id: usize,
	vcpu: HvVcpu,
}

impl HvfCpu {
	pub fn new(id: usize) -> Result<Self> {
		let vcpu = HvVcpu::new()?;
		debug!("vCPU {id} is framework vCPU {}", vcpu.get_id());
		Ok(Self { id, vcpu })
	}
}

impl VirtualCpu for HvfCpu {
	fn read_vmcs(&self, field: u32) -> Result<u64> {
		Ok(self.vcpu.read_vmcs(field)?)
	}

	fn write_vmcs(&mut self, field: u32, value: u64) -> Result<()> {
		Ok(self.vcpu.write_vmcs(field, value)?)
	}

	fn read_reg(&self, reg: Reg) -> Result<u64> {
		Ok(self.vcpu.read_register(&hv_reg(reg))?)
	}

	fn write_reg(&mut self, reg: Reg, value: u64) -> Result<()> {
		Ok(self.vcpu.write_register(&hv_reg(reg), value)?)
	}

	fn enable_native_msr(&mut self, msr: u32, enable: bool) -> Result<()> {
		Ok(self.vcpu.enable_native_msr(msr, enable)?)
	}

	fn run(&mut self) -> Result<()> {
		self.vcpu.run().map_err(|err| {
			VmmError::Hypervisor(format!("vCPU {}: hv_vcpu_run: {err:?}", self.id))
		})
	}

	fn kicker(&self) -> Arc<dyn Kick> {
		Arc::new(HvfKick(self.vcpu.get_id()))
	}
}
