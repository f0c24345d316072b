//! Hypervisor.framework host for Intel Macs, built on `xhypervisor`.

mod vcpu;

use std::{slice, sync::Once};

pub use vcpu::HvfCpu;
use xhypervisor::{VMXCap, create_vm, map_mem, protect_mem, read_vmx_cap};

use crate::{
	error::{Result, VmmError},
	vmx::backend::{Backend, CapKind, MemPerm, VirtualCpu},
};

static VM_CREATED: Once = Once::new();

fn hv_perm(perm: MemPerm) -> xhypervisor::MemPerm {
	match perm {
		MemPerm::Read => xhypervisor::MemPerm::Read,
		MemPerm::ReadExec => xhypervisor::MemPerm::ExecAndRead,
		MemPerm::ReadWriteExec => xhypervisor::MemPerm::ExecAndWrite,
	}
}

/// The process-wide Hypervisor.framework VM. The framework allows exactly
/// one per process.
#[derive(Debug)]
pub struct HvfBackend(());

impl HvfBackend {
	pub fn new() -> Result<Self> {
		let mut res = Ok(());
		let mut first = false;
		VM_CREATED.call_once(|| {
			first = true;
			res = create_vm();
		});
		if !first {
			return Err(VmmError::InvalidArgument(
				"the Hypervisor.framework VM already exists".into(),
			));
		}
		res?;
		debug!("Hypervisor.framework VM created");
		Ok(Self(()))
	}
}

impl Backend for HvfBackend {
	fn read_cap(&self, cap: CapKind) -> Result<u64> {
		let field = match cap {
			CapKind::PinBased => VMXCap::PINBASED,
			CapKind::ProcBased => VMXCap::PROCBASED,
			CapKind::ProcBased2 => VMXCap::PROCBASED2,
			CapKind::Entry => VMXCap::ENTRY,
			CapKind::Exit => VMXCap::EXIT,
		};
		Ok(read_vmx_cap(&field)?)
	}

	fn map(&self, host: *mut u8, gpa: u64, len: usize, perm: MemPerm) -> Result<()> {
		// SAFETY: `host` points at a guest memory segment that lives as long
		// as the VM.
		let mem = unsafe { slice::from_raw_parts(host, len) };
		map_mem(mem, gpa, hv_perm(perm))?;
		Ok(())
	}

	fn protect(&self, gpa: u64, len: usize, perm: MemPerm) -> Result<()> {
		protect_mem(gpa, len, hv_perm(perm))?;
		Ok(())
	}

	fn create_vcpu(&self, id: usize) -> Result<Box<dyn VirtualCpu>> {
		Ok(Box::new(HvfCpu::new(id)?))
	}
}
