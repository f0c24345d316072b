//! MSRs that exit to the VMM and are emulated here. Anything not listed
//! returns `None`/`false` and surfaces as an unhandled RDMSR/WRMSR exit.

use super::{VmxVcpu, vmcs::VMCS_CTRL_CR0_SHADOW};
use crate::{
	consts::*,
	error::{Fault, Result},
	vm::Vm,
};

/// Bus clock the turbo ratios are relative to, in MHz.
const BUS_FREQ_MHZ: u32 = 100;
const DEFAULT_RATIO: u64 = 0x20;

/// Branch trace unavailable, PEBS unavailable, fast strings.
const MISC_ENABLE_INITIAL: u64 = (1 << 0) | (1 << 11) | (1 << 12);
/// XD bit disable. Guests toggle it, CPUID decides whether NX is real.
const MISC_ENABLE_XD_DISABLE: u64 = 1 << 34;

const PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;

const EFER_WRITABLE: u64 = EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE;

#[derive(Debug, Clone, Copy)]
pub(super) struct MsrState {
	pat: u64,
	misc_enable: u64,
	platform_info: u64,
	turbo_ratio_limit: u64,
}

impl MsrState {
	pub fn new(vm: &Vm) -> Self {
		let base_mhz = vm.cpuid().host_leaf(0x16, 0)[0] & 0xffff;
		let ratio = match (base_mhz / BUS_FREQ_MHZ) as u64 & 0xff {
			0 => DEFAULT_RATIO,
			ratio => ratio,
		};
		Self {
			pat: PAT_DEFAULT,
			misc_enable: MISC_ENABLE_INITIAL,
			platform_info: (ratio << 8) | (ratio << 40),
			turbo_ratio_limit: (0..8).fold(0, |acc, i| acc | ratio << (i * 8)),
		}
	}
}

/// Every entry must be UC, WC, WT, WP, WB or UC-.
fn pat_valid(val: u64) -> bool {
	val.to_le_bytes()
		.iter()
		.all(|&ty| matches!(ty, 0 | 1 | 4 | 5 | 6 | 7))
}

fn is_mtrr(num: u32) -> bool {
	matches!(num,
		msr::MTRR_DEF_TYPE
		| msr::MTRR_VAR_BASE..=msr::MTRR_VAR_LAST
		| msr::MTRR_64K_BASE
		| msr::MTRR_16K_BASE..=msr::MTRR_16K_LAST
		| msr::MTRR_4K_BASE..=msr::MTRR_4K_LAST)
}

impl VmxVcpu {
	pub(super) fn rdmsr(&mut self, _vm: &Vm, num: u32) -> Result<Option<u64>> {
		let value = match num {
			msr::MCG_CAP | msr::MCG_STATUS => 0,
			msr::MTRR_CAP => 0,
			num if is_mtrr(num) => 0,
			msr::IA32_MISC_ENABLE => self.msrs.misc_enable,
			msr::PLATFORM_INFO => self.msrs.platform_info,
			msr::TURBO_RATIO_LIMIT | msr::TURBO_RATIO_LIMIT1 => self.msrs.turbo_ratio_limit,
			msr::IA32_PAT => self.msrs.pat,
			msr::IA32_EFER => self.efer()?,
			_ => return Ok(None),
		};
		Ok(Some(value))
	}

	/// Returns whether the MSR is known. Rejected values raise #GP through
	/// the error.
	pub(super) fn wrmsr(&mut self, _vm: &Vm, num: u32, val: u64) -> Result<bool> {
		match num {
			msr::MCG_CAP | msr::MCG_STATUS => {}
			msr::MTRR_CAP => return Err(Fault::gp(0).into()),
			num if is_mtrr(num) => {}
			msr::IA32_MISC_ENABLE => {
				let changed = (val ^ self.msrs.misc_enable) & !MISC_ENABLE_XD_DISABLE;
				if changed != 0 {
					debug!(
						"vCPU {}: MISC_ENABLE write {val:#x} changes {changed:#x}",
						self.id
					);
					return Ok(false);
				}
			}
			msr::IA32_PAT => {
				if !pat_valid(val) {
					return Err(Fault::gp(0).into());
				}
				self.msrs.pat = val;
			}
			msr::IA32_EFER => {
				if val & !EFER_WRITABLE != 0 {
					return Err(Fault::gp(0).into());
				}
				let cur = self.efer()?;
				let paging = self.read_vmcs(VMCS_CTRL_CR0_SHADOW)? & CR0_PG != 0;
				if paging && (val ^ cur) & EFER_LME != 0 {
					return Err(Fault::gp(0).into());
				}
				// LMA is read-only; it follows CR0.PG.
				self.set_efer((val & !EFER_LMA) | (cur & EFER_LMA))?;
			}
			_ => return Ok(false),
		}
		Ok(true)
	}
}
