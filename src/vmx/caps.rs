//! Negotiation of VMX control words against host capabilities.

use super::{
	backend::{Backend, CapKind},
	vmcs::*,
};
use crate::error::{Result, VmmError};

pub const PROCBASED_CTLS_WINDOW_SETTING: u64 = CPU_BASED_IRQ_WND | CPU_BASED_VIRTUAL_NMI_WND;

const PROCBASED_CTLS_ONE_SETTING: u64 = CPU_BASED_SECONDARY_CTLS
	| CPU_BASED_MWAIT
	| CPU_BASED_MONITOR
	| CPU_BASED_UNCOND_IO
	| CPU_BASED_MSR_BITMAPS
	| PROCBASED_CTLS_WINDOW_SETTING
	| CPU_BASED_CR8_LOAD
	| CPU_BASED_CR8_STORE
	| CPU_BASED_HLT
	| CPU_BASED_TSC_OFFSET;
const PROCBASED_CTLS_ZERO_SETTING: u64 = CPU_BASED_CR3_LOAD
	| CPU_BASED_CR3_STORE
	| CPU_BASED_IO_BITMAPS
	| CPU_BASED_RDTSC
	| CPU_BASED_TPR_SHADOW
	| CPU_BASED_MOV_DR
	| CPU_BASED_MTF
	| CPU_BASED_INVLPG
	| CPU_BASED_PAUSE
	| CPU_BASED_RDPMC;

const PROCBASED_CTLS2_ONE_SETTING: u64 =
	CPU_BASED2_EPT | CPU_BASED2_UNRESTRICTED | CPU_BASED2_VPID | CPU_BASED2_RDTSCP;
const PROCBASED_CTLS2_ZERO_SETTING: u64 = CPU_BASED2_VIRTUAL_APIC
	| CPU_BASED2_DESC_TABLE
	| CPU_BASED2_WBINVD
	| CPU_BASED2_PAUSE_LOOP
	| CPU_BASED2_RDRAND
	| CPU_BASED2_INVPCID
	| CPU_BASED2_RDSEED;

const PINBASED_CTLS_ONE_SETTING: u64 = PIN_BASED_INTR | PIN_BASED_NMI | PIN_BASED_VIRTUAL_NMI;
const PINBASED_CTLS_ZERO_SETTING: u64 = PIN_BASED_PREEMPTION_TIMER;

const VM_EXIT_CTLS_ONE_SETTING: u64 = VMEXIT_HOST_IA32E | VMEXIT_LOAD_EFER;
const VM_EXIT_CTLS_ZERO_SETTING: u64 = VMEXIT_SAVE_PREEMPTION_TIMER;

const VM_ENTRY_CTLS_ONE_SETTING: u64 = VMENTRY_LOAD_EFER;
const VM_ENTRY_CTLS_ZERO_SETTING: u64 =
	VMENTRY_SMM | VMENTRY_DEACTIVATE_DUAL_MONITOR | VMENTRY_GUEST_IA32E;

/// A requested control word: bits that must end up set, bits that must end
/// up clear. Every bit the host leaves flexible has to be named by one of
/// the two.
#[derive(Debug, Clone, Copy)]
pub struct CtlRequest {
	pub ones: u64,
	pub zeros: u64,
}

/// Solves `request` against a capability pair. The low 32 bits of `cap` are
/// the allowed-zero settings (a set bit must be one), the high 32 bits the
/// allowed-one settings (a clear bit must be zero).
pub fn solve(kind: CapKind, cap: u64, request: CtlRequest) -> Result<u64> {
	let conflict = |bit: u32, problem: &'static str| VmmError::ControlSetting {
		control: kind.name(),
		bit,
		problem,
	};

	let both = request.ones & request.zeros;
	if both != 0 {
		return Err(conflict(both.trailing_zeros(), "requested both set and clear"));
	}

	let mut value = 0u64;
	for bit in 0..32 {
		let mask = 1u64 << bit;
		let one_allowed = cap & (mask << 32) != 0;
		let zero_allowed = cap & mask == 0;
		match (zero_allowed, one_allowed) {
			(true, false) => {
				if request.ones & mask != 0 {
					return Err(conflict(bit, "must be zero"));
				}
			}
			(false, true) => {
				if request.zeros & mask != 0 {
					return Err(conflict(bit, "must be one"));
				}
				value |= mask;
			}
			(false, false) => return Err(conflict(bit, "has no valid setting")),
			(true, true) => {
				if request.ones & mask != 0 {
					value |= mask;
				} else if request.zeros & mask == 0 {
					return Err(conflict(bit, "is an unspecified don't-care"));
				}
			}
		}
	}
	Ok(value)
}

/// Negotiated control words, computed once per VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxCaps {
	pub pinbased: u64,
	pub procbased: u64,
	pub procbased2: u64,
	pub entry: u64,
	pub exit: u64,
	pub cr0_ones_mask: u64,
	pub cr0_zeros_mask: u64,
	pub cr4_ones_mask: u64,
	pub cr4_zeros_mask: u64,
}

impl VmxCaps {
	pub fn negotiate(backend: &dyn Backend) -> Result<Self> {
		let ctl = |kind, ones, zeros| solve(kind, backend.read_cap(kind)?, CtlRequest { ones, zeros });

		let procbased = ctl(
			CapKind::ProcBased,
			PROCBASED_CTLS_ONE_SETTING,
			PROCBASED_CTLS_ZERO_SETTING,
		)? & !PROCBASED_CTLS_WINDOW_SETTING;
		let procbased2 = ctl(
			CapKind::ProcBased2,
			PROCBASED_CTLS2_ONE_SETTING,
			PROCBASED_CTLS2_ZERO_SETTING,
		)?;
		let pinbased = ctl(
			CapKind::PinBased,
			PINBASED_CTLS_ONE_SETTING,
			PINBASED_CTLS_ZERO_SETTING,
		)?;
		let exit = ctl(
			CapKind::Exit,
			VM_EXIT_CTLS_ONE_SETTING,
			VM_EXIT_CTLS_ZERO_SETTING,
		)?;
		let entry = ctl(
			CapKind::Entry,
			VM_ENTRY_CTLS_ONE_SETTING,
			VM_ENTRY_CTLS_ZERO_SETTING,
		)?;

		let caps = Self {
			pinbased,
			procbased,
			procbased2,
			entry,
			exit,
			cr0_ones_mask: crate::consts::CR0_NE | crate::consts::CR0_ET,
			cr0_zeros_mask: crate::consts::CR0_NW | crate::consts::CR0_CD,
			cr4_ones_mask: crate::consts::CR4_VMXE,
			cr4_zeros_mask: 0,
		};
		debug!("negotiated VMX controls {caps:x?}");
		Ok(caps)
	}

	/// Capability words that leave exactly the requested flexible bits open.
	pub fn permissive_caps(kind: CapKind) -> u64 {
		let bits = match kind {
			CapKind::PinBased => PINBASED_CTLS_ONE_SETTING | PINBASED_CTLS_ZERO_SETTING,
			CapKind::ProcBased => PROCBASED_CTLS_ONE_SETTING | PROCBASED_CTLS_ZERO_SETTING,
			CapKind::ProcBased2 => PROCBASED_CTLS2_ONE_SETTING | PROCBASED_CTLS2_ZERO_SETTING,
			CapKind::Entry => VM_ENTRY_CTLS_ONE_SETTING | VM_ENTRY_CTLS_ZERO_SETTING,
			CapKind::Exit => VM_EXIT_CTLS_ONE_SETTING | VM_EXIT_CTLS_ZERO_SETTING,
		};
		bits << 32
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const FLEX_LOW4: u64 = 0xf << 32;

	#[test]
	fn flexible_bits_follow_request() {
		let v = solve(
			CapKind::PinBased,
			FLEX_LOW4,
			CtlRequest {
				ones: 0b0101,
				zeros: 0b1010,
			},
		)
		.unwrap();
		assert_eq!(v, 0b0101);
	}

	#[test]
	fn fixed_bits_are_enforced() {
		// bit 0 must be one, bit 1..3 flexible
		let cap = FLEX_LOW4 | 0b1;
		let v = solve(
			CapKind::Entry,
			cap,
			CtlRequest {
				ones: 0b10,
				zeros: 0b1100,
			},
		)
		.unwrap();
		assert_eq!(v, 0b11);

		let err = solve(
			CapKind::Entry,
			cap,
			CtlRequest {
				ones: 0,
				zeros: 0b1111,
			},
		)
		.unwrap_err();
		assert!(err.to_string().contains("bit 0 must be one"), "{err}");

		let err = solve(
			CapKind::Exit,
			FLEX_LOW4,
			CtlRequest {
				ones: 1 << 5,
				zeros: 0xf,
			},
		)
		.unwrap_err();
		assert!(err.to_string().contains("bit 5 must be zero"), "{err}");
	}

	#[test]
	fn conflicts_and_unspecified_bits() {
		let err = solve(
			CapKind::ProcBased,
			FLEX_LOW4,
			CtlRequest {
				ones: 0b11,
				zeros: 0b110,
			},
		)
		.unwrap_err();
		assert!(err.to_string().contains("bit 1 requested both"), "{err}");

		let err = solve(
			CapKind::ProcBased,
			FLEX_LOW4,
			CtlRequest {
				ones: 0b1,
				zeros: 0b110,
			},
		)
		.unwrap_err();
		assert!(err.to_string().contains("bit 3 is an unspecified"), "{err}");
	}

	#[test]
	fn window_bits_start_clear() {
		let backend = crate::vmx::mock::MockBackend::new();
		let caps = VmxCaps::negotiate(&backend).unwrap();
		assert_eq!(caps.procbased & PROCBASED_CTLS_WINDOW_SETTING, 0);
		assert_ne!(caps.procbased & CPU_BASED_HLT, 0);
		assert_ne!(caps.procbased2 & CPU_BASED2_UNRESTRICTED, 0);
		assert_eq!(caps.entry & VMENTRY_GUEST_IA32E, 0);
	}
}
