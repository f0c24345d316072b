//! What the guest sees when it executes CPUID.
//!
//! The host's answers are passed through and then filtered: features the
//! VMM cannot virtualize are hidden, the topology is flattened to one
//! package per vCPU and a hypervisor leaf identifies us.

use crate::consts::*;

pub const CPUID_VM_HIGH: u32 = 0x4000_0000;
pub const HYPERVISOR_ID: &[u8; 12] = b"bhyve bhyve ";

mod bits {
	pub const CPUID2_MON: u32 = 1 << 3;
	pub const CPUID2_VMX: u32 = 1 << 5;
	pub const CPUID2_SMX: u32 = 1 << 6;
	pub const CPUID2_EST: u32 = 1 << 7;
	pub const CPUID2_TM2: u32 = 1 << 8;
	pub const CPUID2_PDCM: u32 = 1 << 15;
	pub const CPUID2_X2APIC: u32 = 1 << 21;
	pub const CPUID2_TSCDLT: u32 = 1 << 24;
	pub const CPUID2_XSAVE: u32 = 1 << 26;
	pub const CPUID2_OSXSAVE: u32 = 1 << 27;
	pub const CPUID2_HV: u32 = 1 << 31;

	pub const CPUID_MCE: u32 = 1 << 7;
	pub const CPUID_MTRR: u32 = 1 << 12;
	pub const CPUID_MCA: u32 = 1 << 14;
	pub const CPUID_DS: u32 = 1 << 21;
	pub const CPUID_ACPI: u32 = 1 << 22;
	pub const CPUID_HTT: u32 = 1 << 28;
	pub const CPUID_TM: u32 = 1 << 29;

	pub const CPUID_LOCAL_APIC_ID: u32 = 0xff00_0000;
	pub const CPUID_HTT_CORES: u32 = 0x00ff_0000;

	pub const AMDID2_SVM: u32 = 1 << 2;
	pub const AMDID2_OSVW: u32 = 1 << 9;
	pub const AMDID2_IBS: u32 = 1 << 10;
	pub const AMDID2_NODE_ID: u32 = 1 << 19;
	pub const AMDID2_TOPOLOGY: u32 = 1 << 22;
	pub const AMDID2_PCXC: u32 = 1 << 23;
	pub const AMDID2_PNXC: u32 = 1 << 24;
	pub const AMDID2_PTSCEL2I: u32 = 1 << 28;
	pub const AMDID_RDTSCP: u32 = 1 << 27;
	pub const AMDPM_TSC_INVARIANT: u32 = 1 << 8;

	pub const STDEXT_SAFE: u32 = (1 << 0) // FSGSBASE
		| (1 << 3) // BMI1
		| (1 << 4) // HLE
		| (1 << 5) // AVX2
		| (1 << 8) // BMI2
		| (1 << 9) // ERMS
		| (1 << 11) // RTM
		| (1 << 16) // AVX512F
		| (1 << 26) // AVX512PF
		| (1 << 27) // AVX512ER
		| (1 << 28); // AVX512CD

	pub const CPUTPM1_ARAT: u32 = 1 << 2;
	pub const EXTSTATE_XSAVEOPT: u32 = 1 << 0;

	pub const TYPE_SMT: u32 = 1;
	pub const TYPE_CORE: u32 = 2;
}

use bits::*;

/// Source of the host's own CPUID answers.
pub trait HostCpuid: Send + Sync {
	fn cpuid(&self, leaf: u32, subleaf: u32) -> [u32; 4];
}

/// The processor we are running on.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCpuid;

impl HostCpuid for NativeCpuid {
	#[cfg(target_arch = "x86_64")]
	fn cpuid(&self, leaf: u32, subleaf: u32) -> [u32; 4] {
		let r = raw_cpuid::native_cpuid::cpuid_count(leaf, subleaf);
		[r.eax, r.ebx, r.ecx, r.edx]
	}

	#[cfg(not(target_arch = "x86_64"))]
	fn cpuid(&self, _leaf: u32, _subleaf: u32) -> [u32; 4] {
		[0; 4]
	}
}

/// XSAVE features the guest may enable in XCR0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XsaveLimits {
	pub enabled: bool,
	pub xcr0_allowed: u64,
	pub max_size: u32,
}

impl XsaveLimits {
	fn detect(host: &dyn HostCpuid) -> Self {
		let [_, _, ecx, _] = host.cpuid(1, 0);
		if ecx & CPUID2_OSXSAVE == 0 {
			return Self::default();
		}
		let [eax, ebx, _, edx] = host.cpuid(0xd, 0);
		let supported = (edx as u64) << 32 | eax as u64;
		Self {
			enabled: true,
			xcr0_allowed: supported
				& (XFEATURE_X87
					| XFEATURE_SSE
					| XFEATURE_AVX
					| XFEATURE_BNDREGS
					| XFEATURE_BNDCSR
					| XFEATURE_AVX512),
			max_size: ebx,
		}
	}
}

/// Per-VM CPUID policy. Host limits are read once at construction.
pub struct CpuidPolicy {
	host: Box<dyn HostCpuid>,
	cpu_high: u32,
	cpu_exthigh: u32,
	xsave: XsaveLimits,
}

impl std::fmt::Debug for CpuidPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CpuidPolicy")
			.field("cpu_high", &self.cpu_high)
			.field("cpu_exthigh", &self.cpu_exthigh)
			.field("xsave", &self.xsave)
			.finish()
	}
}

/// Guest state that influences the answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidContext {
	pub vcpu: usize,
	pub x2apic: bool,
	pub cr4: u64,
}

impl CpuidPolicy {
	pub fn new(host: Box<dyn HostCpuid>) -> Self {
		let cpu_high = host.cpuid(0, 0)[0];
		let cpu_exthigh = host.cpuid(0x8000_0000, 0)[0];
		let xsave = XsaveLimits::detect(host.as_ref());
		Self {
			host,
			cpu_high,
			cpu_exthigh,
			xsave,
		}
	}

	pub fn native() -> Self {
		Self::new(Box::new(NativeCpuid))
	}

	/// Unfiltered host leaf, for MSRs that mirror host topology.
	pub fn host_leaf(&self, leaf: u32, subleaf: u32) -> [u32; 4] {
		self.host.cpuid(leaf, subleaf)
	}

	pub fn xsave_limits(&self) -> XsaveLimits {
		self.xsave
	}

	/// Requests for leaves above the supported range map to the highest
	/// leaf of that range.
	fn clamp(&self, leaf: u32) -> u32 {
		if self.cpu_exthigh != 0 && leaf >= 0x8000_0000 {
			leaf.min(self.cpu_exthigh)
		} else if leaf >= 0x4000_0000 {
			leaf.min(CPUID_VM_HIGH)
		} else {
			leaf.min(self.cpu_high)
		}
	}

	/// Answers CPUID(`leaf`, `subleaf`) as `[eax, ebx, ecx, edx]`.
	pub fn emulate(&self, ctx: CpuidContext, leaf: u32, subleaf: u32) -> [u32; 4] {
		let func = self.clamp(leaf);
		let threads_per_core = 1u32;
		let cores_per_package = 1u32;
		let mut regs = match func {
			0x0 | 0x2 | 0x3 | 0x8000_0000 | 0x8000_0002..=0x8000_0004 | 0x8000_0006
			| 0x8000_0008 => self.host.cpuid(func, subleaf),
			0x8000_0001 => {
				let mut regs = self.host.cpuid(func, subleaf);
				regs[2] &= !(AMDID2_SVM
					| AMDID2_TOPOLOGY
					| AMDID2_PCXC
					| AMDID2_PNXC
					| AMDID2_PTSCEL2I
					| AMDID2_IBS
					| AMDID2_NODE_ID
					| AMDID2_OSVW);
				regs[3] &= !AMDID_RDTSCP;
				regs
			}
			0x8000_0007 => [0, 0, 0, AMDPM_TSC_INVARIANT],
			0x1 => self.leaf1(ctx, threads_per_core * cores_per_package),
			0x4 => {
				let mut regs = self.host.cpuid(func, subleaf);
				if regs != [0; 4] {
					regs[0] &= 0x3ff;
					regs[0] |= (cores_per_package - 1) << 26;
					let level = (regs[0] >> 5) & 0x7;
					let mut logical = threads_per_core;
					if level >= 3 {
						logical *= cores_per_package;
					}
					regs[0] |= (logical - 1) << 14;
				}
				regs
			}
			0x7 => {
				if subleaf == 0 {
					let host = self.host.cpuid(func, 0);
					[0, host[1] & STDEXT_SAFE, 0, 0]
				} else {
					[0; 4]
				}
			}
			0x6 => [CPUTPM1_ARAT, 0, 0, 0],
			0xa => [0; 4],
			0xb => {
				let (logical, level) = match subleaf {
					0 => (threads_per_core, TYPE_SMT),
					1 => (threads_per_core * cores_per_package, TYPE_CORE),
					_ => (0, 0),
				};
				if level == 0 {
					[0, 0, subleaf & 0xff, 0]
				} else {
					[
						logical.max(1).ilog2() & 0x1f,
						logical & 0xffff,
						(level << 8) | (subleaf & 0xff),
						ctx.vcpu as u32,
					]
				}
			}
			0xd => self.leaf_xsave(subleaf),
			CPUID_VM_HIGH => {
				let id = HYPERVISOR_ID;
				[
					CPUID_VM_HIGH,
					u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
					u32::from_le_bytes([id[4], id[5], id[6], id[7]]),
					u32::from_le_bytes([id[8], id[9], id[10], id[11]]),
				]
			}
			_ => self.host.cpuid(func, subleaf),
		};
		if func == 0x1 {
			// The hypervisor bit is ours to set regardless of the host.
			regs[2] |= CPUID2_HV;
		}
		trace!("vCPU {}: cpuid {leaf:#x},{subleaf:#x} -> {regs:08x?}", ctx.vcpu);
		regs
	}

	fn leaf1(&self, ctx: CpuidContext, logical_cpus: u32) -> [u32; 4] {
		let mut regs = self.host.cpuid(1, 0);

		regs[1] &= !CPUID_LOCAL_APIC_ID;
		regs[1] |= (ctx.vcpu as u32) << 24;

		regs[2] &= !(CPUID2_VMX | CPUID2_EST | CPUID2_TM2 | CPUID2_SMX);
		if ctx.x2apic {
			regs[2] |= CPUID2_X2APIC;
		} else {
			regs[2] &= !CPUID2_X2APIC;
		}

		if regs[2] & CPUID2_OSXSAVE == 0 {
			regs[2] &= !CPUID2_XSAVE;
		}
		regs[2] &= !CPUID2_OSXSAVE;
		if regs[2] & CPUID2_XSAVE != 0 && ctx.cr4 & CR4_OSXSAVE != 0 {
			regs[2] |= CPUID2_OSXSAVE;
		}

		regs[2] &= !(CPUID2_MON | CPUID2_PDCM | CPUID2_TSCDLT);
		regs[3] &= !(CPUID_ACPI | CPUID_TM | CPUID_DS);
		regs[3] |= CPUID_MCA | CPUID_MCE | CPUID_MTRR;

		regs[1] &= !CPUID_HTT_CORES;
		regs[1] |= (logical_cpus & 0xff) << 16;
		regs[3] |= CPUID_HTT;
		regs
	}

	fn leaf_xsave(&self, subleaf: u32) -> [u32; 4] {
		if !self.xsave.enabled {
			return [0; 4];
		}
		let mut regs = self.host.cpuid(0xd, subleaf);
		match subleaf {
			0 => {
				regs[0] &= self.xsave.xcr0_allowed as u32;
				regs[2] = self.xsave.max_size;
				regs[3] &= (self.xsave.xcr0_allowed >> 32) as u32;
			}
			1 => regs = [regs[0] & EXTSTATE_XSAVEOPT, 0, 0, 0],
			n if n < 64 && self.xsave.xcr0_allowed & (1 << n) == 0 => regs = [0; 4],
			_ => {}
		}
		regs
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	struct FakeHost(HashMap<(u32, u32), [u32; 4]>);

	impl HostCpuid for FakeHost {
		fn cpuid(&self, leaf: u32, subleaf: u32) -> [u32; 4] {
			self.0.get(&(leaf, subleaf)).copied().unwrap_or([0; 4])
		}
	}

	fn policy() -> CpuidPolicy {
		let mut leaves = HashMap::new();
		leaves.insert((0, 0), [0xd, 0x756e_6547, 0x6c65_746e, 0x4965_6e69]);
		leaves.insert(
			(1, 0),
			[
				0x306a9,
				0x0310_0800,
				CPUID2_VMX | CPUID2_MON | CPUID2_XSAVE | CPUID2_OSXSAVE | CPUID2_X2APIC,
				CPUID_DS | CPUID_TM,
			],
		);
		leaves.insert((7, 0), [1, 0xffff_ffff, 0xffff_ffff, 0xffff_ffff]);
		leaves.insert((0xd, 0), [0x7, 0x340, 0x340, 0]);
		leaves.insert((0x8000_0000, 0), [0x8000_0008, 0, 0, 0]);
		leaves.insert((0x8000_0001, 0), [0, 0, AMDID2_SVM | 1, AMDID_RDTSCP | 1]);
		CpuidPolicy::new(Box::new(FakeHost(leaves)))
	}

	fn ctx(vcpu: usize) -> CpuidContext {
		CpuidContext {
			vcpu,
			x2apic: false,
			cr4: 0,
		}
	}

	#[test]
	fn leaf1_filters_features() {
		let p = policy();
		let [_, ebx, ecx, edx] = p.emulate(ctx(3), 1, 0);
		assert_eq!(ebx >> 24, 3);
		assert_eq!((ebx >> 16) & 0xff, 1);
		assert_eq!(ecx & (CPUID2_VMX | CPUID2_MON | CPUID2_X2APIC | CPUID2_OSXSAVE), 0);
		assert_ne!(ecx & CPUID2_XSAVE, 0);
		assert_ne!(ecx & CPUID2_HV, 0);
		assert_eq!(edx & (CPUID_DS | CPUID_TM), 0);
		assert_eq!(
			edx & (CPUID_MCA | CPUID_MCE | CPUID_MTRR | CPUID_HTT),
			CPUID_MCA | CPUID_MCE | CPUID_MTRR | CPUID_HTT
		);
	}

	#[test]
	fn osxsave_and_x2apic_follow_guest_state() {
		let p = policy();
		let ctx = CpuidContext {
			vcpu: 0,
			x2apic: true,
			cr4: CR4_OSXSAVE,
		};
		let ecx = p.emulate(ctx, 1, 0)[2];
		assert_ne!(ecx & CPUID2_OSXSAVE, 0);
		assert_ne!(ecx & CPUID2_X2APIC, 0);
	}

	#[test]
	fn leaves_are_clamped() {
		let p = policy();
		// Above the basic range: answered as leaf 0xd.
		assert_eq!(p.emulate(ctx(0), 0x1f, 0), p.emulate(ctx(0), 0xd, 0));
		let [eax, ebx, ecx, edx] = p.emulate(ctx(0), 0x4000_0010, 0);
		assert_eq!(eax, CPUID_VM_HIGH);
		let mut id = Vec::new();
		for r in [ebx, ecx, edx] {
			id.extend_from_slice(&r.to_le_bytes());
		}
		assert_eq!(&id, HYPERVISOR_ID);
	}

	#[test]
	fn extended_features_are_masked() {
		let p = policy();
		let [eax, ebx, ecx, edx] = p.emulate(ctx(0), 7, 0);
		assert_eq!((eax, ecx, edx), (0, 0, 0));
		assert_eq!(ebx, STDEXT_SAFE);
		assert_eq!(p.emulate(ctx(0), 7, 1), [0; 4]);
		let [_, _, ecx, edx] = p.emulate(ctx(0), 0x8000_0001, 0);
		assert_eq!(ecx, 1);
		assert_eq!(edx, 1);
	}

	#[test]
	fn xsave_leaf_reports_allowed_features() {
		let p = policy();
		assert_eq!(p.xsave_limits().xcr0_allowed, 0x7);
		let [eax, _, ecx, _] = p.emulate(ctx(0), 0xd, 0);
		assert_eq!(eax, 0x7);
		assert_eq!(ecx, 0x340);
		assert_eq!(p.emulate(ctx(0), 0xd, 5), [0; 4]);
	}
}
